//! 工具并发调度
//!
//! 同一条 assistant 消息中的独立调用可并发执行，用 Semaphore 限制同时运行的工具数量。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 任务调度器
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    /// 工具并发限制（默认 3）
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        Arc::clone(&self.tool_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AgentError::AgentStopped("tool scheduler closed".into()))
    }

    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
