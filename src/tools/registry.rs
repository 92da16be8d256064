//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按注册顺序保存，
//! 同名工具注册视为配置错误。ToolExecutor 在调用时加超时并统一转成 ToolResult。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentConfig;
use crate::agent::SubAgentPoolHandle;
use crate::core::{AgentError, State, StateDelta};
use crate::engine::{EventBus, SubAgentInterrupt};
use crate::store::FileStore;

/// 暴露给模型的工具描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具执行产出
#[derive(Debug)]
pub enum ToolOutput {
    Text(String),
    /// 文本结果 + 对 State 的增量（如任务列表、文件索引）
    WithState { content: String, delta: StateDelta },
    /// 被委派的子智能体暂停等待人工审核
    Interrupt(SubAgentInterrupt),
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        ToolOutput::Text(s.to_string())
    }
}

/// 工具执行上下文：所属 agent、当前调用、State 快照与共享资源
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub call_id: String,
    pub state: Arc<State>,
    pub store: Option<Arc<dyn FileStore>>,
    pub subagents: Option<SubAgentPoolHandle>,
    /// 父智能体配置，general-purpose 子智能体据此派生
    pub agent_config: Option<Arc<AgentConfig>>,
    pub events: EventBus,
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// 不带共享资源的最小上下文（测试与独立工具调用用）
    pub fn detached(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            call_id: String::new(),
            state: Arc::new(State::default()),
            store: None,
            subagents: None,
            agent_config: None,
            events: EventBus::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_call(&self, call_id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.call_id = call_id.to_string();
        ctx
    }

    pub fn store(&self) -> Result<&Arc<dyn FileStore>, String> {
        self.store
            .as_ref()
            .ok_or_else(|| "file store is not available for this agent".to_string())
    }
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型 tool call 中的 name）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 同一条 assistant 消息中的调用可否与其它调用并发执行
    fn parallel_safe(&self) -> bool {
        false
    }

    /// 是否受执行器的单次调用超时约束；委派子智能体的工具自己响应取消
    fn timed(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, String>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// 工具注册表：保持注册顺序，按名查找
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(AgentError::DuplicateTool(name));
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.index.get(name).map(|&i| Arc::clone(&self.tools[i]))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert_eq!(err, AgentError::DuplicateTool("echo".into()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_specs_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let specs = registry.specs();
        assert_eq!(specs[0].name, "echo");
        assert!(registry.get("echo").is_some());
        assert!(registry.get("nope").is_none());
    }
}
