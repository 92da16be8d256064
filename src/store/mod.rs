//! 虚拟文件存储：按路径存取内容的键值存储
//!
//! 引擎只通过 read / write / delete / list 四个操作使用它；实现为单一 actor（`server`），
//! 所有写入在 actor 内串行化，变更经防抖后批量落盘到 `FileBackend`（`persistence`）。

pub mod persistence;
pub mod server;

use async_trait::async_trait;
use thiserror::Error;

pub use persistence::{FileBackend, FileChange, MemoryBackend, SqliteBackend};
pub use server::{spawn_file_store, FileStoreHandle};

/// 文件存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("file store is not running")]
    Closed,
}

/// 文件存储接口
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<String, StoreError>;

    async fn write(&self, path: &str, content: String) -> Result<(), StoreError>;

    /// 删除不存在的路径同样返回 Ok
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<String>, StoreError>;
}
