//! 会话监管：每条 submit / resume 命令的取消令牌
//!
//! 命令发出时取令牌；`cancel()` 取消当前令牌，正在运行和已排队的命令一起停下，
//! 之后发出的命令拿到新令牌，已取消的令牌不会影响下一次。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    current: Arc<Mutex<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为一条新命令取令牌：上一个令牌已取消时换新的
    pub fn run_token(&self) -> CancellationToken {
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.clone()
    }

    /// 取消当前令牌
    pub fn cancel(&self) {
        let current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_then_fresh_token() {
        let session = SessionSupervisor::new();
        let first = session.run_token();
        session.cancel();
        assert!(first.is_cancelled());
        let second = session.run_token();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_tokens_taken_before_cancel_share_it() {
        let session = SessionSupervisor::new();
        let running = session.run_token();
        let queued = session.run_token();
        session.cancel();
        assert!(running.is_cancelled());
        assert!(queued.is_cancelled());
    }
}
