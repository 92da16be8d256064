//! 工具执行器
//!
//! 持有 ToolRegistry、单次调用超时与并发调度器。execute 把每次调用的结果统一映射为 ToolResult
//! （未知工具、失败、超时都成为 is_error 结果而不是中断整轮），并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

use crate::core::{StateDelta, TaskScheduler};
use crate::engine::SubAgentInterrupt;
use crate::memory::{ToolCall, ToolResult};
use crate::tools::{Tool, ToolContext, ToolOutput, ToolRegistry, ToolSpec};

/// 单次调用的结果
#[derive(Debug)]
pub enum CallOutcome {
    Done {
        result: ToolResult,
        delta: Option<StateDelta>,
    },
    Interrupted(SubAgentInterrupt),
}

impl CallOutcome {
    fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        CallOutcome::Done {
            result: ToolResult::error(call, message),
            delta: None,
        }
    }
}

/// 工具执行器
#[derive(Clone)]
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    scheduler: TaskScheduler,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            scheduler: TaskScheduler::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    /// 执行单个调用；输出 JSON 审计日志
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> CallOutcome {
        let Some(tool) = self.registry.get(&call.name) else {
            tracing::warn!(tool = %call.name, call_id = %call.call_id, "unknown tool requested");
            return CallOutcome::error(call, format!("Unknown tool: {}", call.name));
        };

        let start = Instant::now();
        let args = call.arguments_value();
        let args_preview = args_preview(&args);
        let ctx = ctx.for_call(&call.call_id);
        let result: Result<_, Elapsed> = if tool.timed() {
            timeout(self.timeout, tool.execute(args, &ctx)).await
        } else {
            Ok(tool.execute(args, &ctx).await)
        };

        let outcome = match &result {
            Ok(Ok(ToolOutput::Interrupt(_))) => "interrupt",
            Ok(Ok(_)) => "ok",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "agent_id": ctx.agent_id,
            "tool": call.name,
            "call_id": call.call_id,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(ToolOutput::Text(content))) => CallOutcome::Done {
                result: ToolResult::ok(call, content),
                delta: None,
            },
            Ok(Ok(ToolOutput::WithState { content, delta })) => CallOutcome::Done {
                result: ToolResult::ok(call, content),
                delta: Some(delta),
            },
            Ok(Ok(ToolOutput::Interrupt(interrupt))) => CallOutcome::Interrupted(interrupt),
            Ok(Err(e)) => CallOutcome::error(call, format!("Error: {e}")),
            Err(_) => CallOutcome::error(
                call,
                format!("Error: tool {} timed out after {}s", call.name, self.timeout.as_secs()),
            ),
        }
    }

    /// 执行一批调用，结果按调用顺序返回；全部工具都声明可并发时并发执行（受调度器限流）
    pub async fn execute_batch(&self, calls: &[ToolCall], ctx: &ToolContext) -> Vec<CallOutcome> {
        let parallel = calls.len() > 1
            && calls.iter().all(|c| {
                self.registry
                    .get(&c.name)
                    .map(|t| t.parallel_safe())
                    .unwrap_or(true)
            });

        if !parallel {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.execute(call, ctx).await);
            }
            return outcomes;
        }

        tracing::debug!(count = calls.len(), "executing tool calls concurrently");
        join_all(calls.iter().map(|call| async move {
            match self.scheduler.acquire_tool().await {
                Ok(_permit) => self.execute(call, ctx).await,
                Err(e) => CallOutcome::error(call, format!("Error: {e}")),
            }
        }))
        .await
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "fail"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
            Err("disk on fire".into())
        }
    }

    /// 记录同时在执行的调用数峰值
    #[derive(Default)]
    struct NapTool {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Tool for NapTool {
        fn name(&self) -> &str {
            "nap"
        }

        fn description(&self) -> &str {
            "sleeps briefly"
        }

        fn parallel_safe(&self) -> bool {
            true
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, String> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok("rested".into())
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        registry.register(Arc::new(SlowTool)).unwrap();
        registry.register(Arc::new(FailingTool)).unwrap();
        ToolExecutor::new(registry, 1)
    }

    fn result_of(outcome: CallOutcome) -> ToolResult {
        match outcome {
            CallOutcome::Done { result, .. } => result,
            CallOutcome::Interrupted(_) => panic!("unexpected interrupt"),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_result() {
        let call = ToolCall::new("1", "ghost", json!({}));
        let result = result_of(executor().execute(&call, &ToolContext::detached("a")).await);
        assert!(result.is_error);
        assert!(result.content.contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_failure_and_timeout_become_error_results() {
        let exec = executor();
        let ctx = ToolContext::detached("a");
        let failed = result_of(exec.execute(&ToolCall::new("1", "fail", json!({})), &ctx).await);
        assert!(failed.is_error);
        assert!(failed.content.contains("disk on fire"));

        let slow = result_of(exec.execute(&ToolCall::new("2", "slow", json!({})), &ctx).await);
        assert!(slow.is_error);
        assert!(slow.content.contains("timed out"));
    }

    #[tokio::test]
    async fn test_batch_preserves_call_order() {
        let calls = vec![
            ToolCall::new("a", "echo", json!({"text": "first"})),
            ToolCall::new("b", "echo", json!({"text": "second"})),
            ToolCall::new("c", "echo", json!({"text": "third"})),
        ];
        let outcomes = executor()
            .execute_batch(&calls, &ToolContext::detached("a"))
            .await;
        let contents: Vec<String> = outcomes.into_iter().map(|o| result_of(o).content).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_safe_calls_overlap() {
        let nap = Arc::new(NapTool::default());
        let mut registry = ToolRegistry::new();
        registry.register(nap.clone()).unwrap();
        let exec = ToolExecutor::new(registry, 5);

        let calls = vec![
            ToolCall::new("a", "nap", json!({})),
            ToolCall::new("b", "nap", json!({})),
        ];
        let start = tokio::time::Instant::now();
        let outcomes = exec.execute_batch(&calls, &ToolContext::detached("a")).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(nap.peak.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() < Duration::from_millis(400));
    }
}
