//! 文件存储 actor
//!
//! 启动时从后端加载该 agent 的全部文件，之后在内存中服务读写；写入标记为脏，
//! 距离首次脏写 `debounce` 后批量落盘。命令通道关闭或收到 Flush 时立即落盘。
//! 落盘失败时变更留在脏集合里，下一个 debounce 周期重试。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::store::{FileBackend, FileChange, FileStore, StoreError};

enum StoreCommand {
    Read {
        path: String,
        reply: oneshot::Sender<Result<String, StoreError>>,
    },
    Write {
        path: String,
        content: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Delete {
        path: String,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<String>, StoreError>>,
    },
    Flush {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}

/// 文件存储句柄（可克隆，发往 actor）
#[derive(Clone, Debug)]
pub struct FileStoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl std::fmt::Debug for StoreCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreCommand::Read { .. } => "Read",
            StoreCommand::Write { .. } => "Write",
            StoreCommand::Delete { .. } => "Delete",
            StoreCommand::List { .. } => "List",
            StoreCommand::Flush { .. } => "Flush",
        };
        f.write_str(name)
    }
}

impl FileStoreHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> StoreCommand,
    ) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// 立即把脏数据落盘
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.request(|reply| StoreCommand::Flush { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
impl FileStore for FileStoreHandle {
    async fn read(&self, path: &str) -> Result<String, StoreError> {
        let path = path.to_string();
        self.request(|reply| StoreCommand::Read { path, reply }).await
    }

    async fn write(&self, path: &str, content: String) -> Result<(), StoreError> {
        let path = path.to_string();
        self.request(|reply| StoreCommand::Write {
            path,
            content,
            reply,
        })
        .await
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let path = path.to_string();
        self.request(|reply| StoreCommand::Delete { path, reply })
            .await
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.request(|reply| StoreCommand::List { reply }).await
    }
}

struct FileStoreServer {
    agent_id: String,
    files: HashMap<String, String>,
    /// path -> Some(content) 为待写入，None 为待删除
    dirty: BTreeMap<String, Option<String>>,
    flush_at: Option<Instant>,
    backend: Arc<dyn FileBackend>,
    debounce: Duration,
}

impl FileStoreServer {
    fn mark_dirty(&mut self, path: String, content: Option<String>) {
        self.dirty.insert(path, content);
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.debounce);
        }
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        self.flush_at = None;
        if self.dirty.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.dirty);
        let changes: Vec<FileChange> = pending
            .iter()
            .map(|(path, content)| match content {
                Some(content) => FileChange::Upsert {
                    path: path.clone(),
                    content: content.clone(),
                },
                None => FileChange::Delete { path: path.clone() },
            })
            .collect();
        let count = changes.len();
        let backend = Arc::clone(&self.backend);
        let agent_id = self.agent_id.clone();
        let result = tokio::task::spawn_blocking(move || backend.persist(&agent_id, &changes))
            .await
            .map_err(|e| StoreError::Backend(format!("persist task failed: {e}")))
            .and_then(|persisted| persisted);
        if let Err(e) = result {
            // 已有的更新写入优先
            for (path, content) in pending {
                self.dirty.entry(path).or_insert(content);
            }
            self.flush_at = Some(Instant::now() + self.debounce);
            return Err(e);
        }
        tracing::debug!(agent_id = %self.agent_id, changes = count, "file store flushed");
        Ok(())
    }

    async fn handle(&mut self, cmd: StoreCommand) {
        match cmd {
            StoreCommand::Read { path, reply } => {
                let result = self
                    .files
                    .get(&path)
                    .cloned()
                    .ok_or(StoreError::NotFound(path));
                let _ = reply.send(result);
            }
            StoreCommand::Write {
                path,
                content,
                reply,
            } => {
                self.files.insert(path.clone(), content.clone());
                self.mark_dirty(path, Some(content));
                let _ = reply.send(Ok(()));
            }
            StoreCommand::Delete { path, reply } => {
                if self.files.remove(&path).is_some() {
                    self.mark_dirty(path, None);
                }
                let _ = reply.send(Ok(()));
            }
            StoreCommand::List { reply } => {
                let mut paths: Vec<String> = self.files.keys().cloned().collect();
                paths.sort();
                let _ = reply.send(Ok(paths));
            }
            StoreCommand::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<StoreCommand>) -> Result<(), StoreError> {
        loop {
            let flush_at = self.flush_at;
            let timer = async move {
                match flush_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        self.flush().await?;
                        tracing::debug!(agent_id = %self.agent_id, "file store stopped");
                        return Ok(());
                    }
                },
                _ = timer => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(
                            agent_id = %self.agent_id,
                            pending = self.dirty.len(),
                            "debounced flush failed, retrying: {}",
                            e
                        );
                    }
                }
            }
        }
    }
}

/// 启动文件存储 actor：返回句柄与任务句柄；后端加载失败时任务以错误结束
pub fn spawn_file_store(
    agent_id: impl Into<String>,
    backend: Arc<dyn FileBackend>,
    debounce: Duration,
) -> (FileStoreHandle, JoinHandle<Result<(), StoreError>>) {
    let agent_id = agent_id.into();
    let (tx, rx) = mpsc::channel(64);
    let task = tokio::spawn(async move {
        let loader = Arc::clone(&backend);
        let id = agent_id.clone();
        let files = tokio::task::spawn_blocking(move || loader.load(&id))
            .await
            .map_err(|e| StoreError::Backend(format!("load task failed: {e}")))??;
        tracing::debug!(agent_id = %agent_id, files = files.len(), "file store loaded");
        let server = FileStoreServer {
            agent_id,
            files,
            dirty: BTreeMap::new(),
            flush_at: None,
            backend,
            debounce,
        };
        server.run(rx).await
    });
    (FileStoreHandle { tx }, task)
}
