//! 人工审核（HITL）中间件
//!
//! options 形如 `{"interrupt_on": {"write_file": true, "shell": {"allowed_decisions": ["approve", "reject"]}}}`。
//! `true` 表示允许 approve / edit / reject 三种决策，`false` 表示不审核。
//! 引擎在模型返回工具调用后询问 ToolGate，被审核的调用不执行，汇总为一次中断。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{DecisionKind, ReviewConfig};
use crate::memory::ToolCall;
use crate::middleware::{parse_options, Middleware, MiddlewareModule, ToolGate};

pub const MODULE_NAME: &str = "hitl";

/// 单个工具的审核配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GateConfig {
    Enabled(bool),
    Custom { allowed_decisions: Vec<DecisionKind> },
}

impl GateConfig {
    fn allowed(&self) -> Option<Vec<DecisionKind>> {
        match self {
            GateConfig::Enabled(true) => Some(DecisionKind::all()),
            GateConfig::Enabled(false) => None,
            GateConfig::Custom { allowed_decisions } => Some(allowed_decisions.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HitlOptions {
    #[serde(default)]
    pub interrupt_on: BTreeMap<String, GateConfig>,
}

/// 工具名 -> 允许的决策
pub struct HumanInTheLoop {
    gates: BTreeMap<String, Vec<DecisionKind>>,
}

impl HumanInTheLoop {
    pub fn new(options: HitlOptions) -> Result<Self, String> {
        let mut gates = BTreeMap::new();
        for (tool, config) in options.interrupt_on {
            if let Some(allowed) = config.allowed() {
                if allowed.is_empty() {
                    return Err(format!("tool '{tool}' has an empty allowed_decisions list"));
                }
                gates.insert(tool, allowed);
            }
        }
        Ok(Self { gates })
    }

    pub fn gated_tools(&self) -> Vec<String> {
        self.gates.keys().cloned().collect()
    }
}

impl ToolGate for HumanInTheLoop {
    fn review(&self, call: &ToolCall) -> Option<ReviewConfig> {
        self.gates.get(&call.name).map(|allowed| ReviewConfig {
            tool_name: call.name.clone(),
            allowed_decisions: allowed.clone(),
        })
    }
}

impl Middleware for HumanInTheLoop {
    fn as_tool_gate(&self) -> Option<&dyn ToolGate> {
        Some(self)
    }
}

pub struct HitlModule;

impl MiddlewareModule for HitlModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn init(&self, options: &Value) -> Result<Arc<dyn Middleware>, String> {
        let options: HitlOptions = parse_options(options)?;
        Ok(Arc::new(HumanInTheLoop::new(options)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(options: Value) -> HumanInTheLoop {
        HumanInTheLoop::new(serde_json::from_value(options).unwrap()).unwrap()
    }

    #[test]
    fn test_true_allows_all_decisions() {
        let hitl = gate(json!({"interrupt_on": {"write_file": true, "ls": false}}));
        let review = hitl
            .review(&ToolCall::new("1", "write_file", json!({})))
            .unwrap();
        assert_eq!(review.allowed_decisions, DecisionKind::all());
        assert!(hitl.review(&ToolCall::new("2", "ls", json!({}))).is_none());
        assert!(hitl.review(&ToolCall::new("3", "read_file", json!({}))).is_none());
        assert_eq!(hitl.gated_tools(), vec!["write_file"]);
    }

    #[test]
    fn test_explicit_allowed_decisions() {
        let hitl = gate(json!({"interrupt_on": {"shell": {"allowed_decisions": ["approve", "reject"]}}}));
        let review = hitl.review(&ToolCall::new("1", "shell", json!({}))).unwrap();
        assert!(review.allows(DecisionKind::Approve));
        assert!(!review.allows(DecisionKind::Edit));
    }

    #[test]
    fn test_empty_allowed_list_fails_init() {
        let err = HitlModule
            .init(&json!({"interrupt_on": {"shell": {"allowed_decisions": []}}}))
            .err()
            .unwrap();
        assert!(err.contains("shell"));
    }
}
