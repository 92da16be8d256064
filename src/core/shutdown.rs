//! 优雅关闭
//!
//! 监管树停止（显式 stop、空闲超时、重启强度超限）时统一走这里：
//! - 停止子智能体池，未完成的委派调用以错误结束
//! - 文件存储中未落盘的写入先 flush
//! - 每个清理任务有超时，失败只记录日志

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent::SubAgentPoolHandle;
use crate::store::FileStoreHandle;

/// 关闭原因
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    /// AgentHandle::stop 或进程收到 Ctrl+C
    Requested,
    /// SIGTERM 信号
    Signal,
    /// 超过空闲超时没有入站消息
    Inactivity,
    /// 重启次数超过限制
    RestartIntensity,
    /// 致命错误
    FatalError(String),
}

/// 关闭信号：只生效一次，第一个原因胜出
pub struct ShutdownManager {
    token: CancellationToken,
    reason: OnceLock<ShutdownReason>,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(4);
        Self {
            token: CancellationToken::new(),
            reason: OnceLock::new(),
            reason_tx,
        }
    }

    /// 关闭时被取消的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；已关闭时忽略，返回 false
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self.reason.set(reason.clone()).is_err() {
            tracing::debug!(?reason, "shutdown already in progress");
            return false;
        }
        let _ = self.reason_tx.send(reason);
        self.token.cancel();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 已生效的关闭原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// 订阅关闭原因；订阅晚于关闭时用 `reason()` 取
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM 触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
                manager.shutdown(ShutdownReason::Requested);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("SIGTERM received, shutting down");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    /// 单个清理任务的超时
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 依次清理；返回失败或超时的任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::debug!(task = name, "cleanup done"),
                Ok(Err(e)) => {
                    tracing::warn!(task = name, "cleanup failed: {}", e);
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout = ?self.per_task_timeout, "cleanup timed out");
                    failed.push(name);
                }
            }
        }
        failed
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 停止子智能体池
pub struct SubAgentPoolCleanup {
    pool: SubAgentPoolHandle,
}

impl SubAgentPoolCleanup {
    pub fn new(pool: SubAgentPoolHandle) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SubAgentPoolCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SubAgentPool"
    }
}

/// 文件存储落盘
pub struct FileStoreCleanup {
    store: FileStoreHandle,
}

impl FileStoreCleanup {
    pub fn new(store: FileStoreHandle) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for FileStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if self.store.is_closed() {
            return Ok(());
        }
        self.store.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FileStore"
    }
}
