//! 人工审核中断：决策、动作请求、中断记录与挂起的工具轮次
//!
//! 一条 assistant 消息的工具调用可能部分已执行、部分等待审核、部分正等待子智能体的审核。
//! PendingRound 保存这些中间结果，直到全部调用都有结果，再按原调用顺序合并成一条 tool 消息。

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentError, State, StateDelta};
use crate::memory::{Message, ToolCall, ToolResult};
use crate::middleware::patch::cancelled_result;

/// 决策种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approve,
    Edit,
    Reject,
}

impl DecisionKind {
    pub fn all() -> Vec<DecisionKind> {
        vec![DecisionKind::Approve, DecisionKind::Edit, DecisionKind::Reject]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Approve => "approve",
            DecisionKind::Edit => "edit",
            DecisionKind::Reject => "reject",
        }
    }
}

/// 审核者对单个动作请求的决策
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    /// 用新参数替换原参数后执行
    Edit { arguments: Value },
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Decision {
    pub fn edit(arguments: Value) -> Self {
        Decision::Edit { arguments }
    }

    pub fn reject() -> Self {
        Decision::Reject { message: None }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            Decision::Approve => DecisionKind::Approve,
            Decision::Edit { .. } => DecisionKind::Edit,
            Decision::Reject { .. } => DecisionKind::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// 单个工具的审核配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewConfig {
    pub tool_name: String,
    pub allowed_decisions: Vec<DecisionKind>,
}

impl ReviewConfig {
    pub fn allows(&self, kind: DecisionKind) -> bool {
        self.allowed_decisions.contains(&kind)
    }
}

/// 等待人工审核的中断
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub action_requests: Vec<ActionRequest>,
    pub review_configs: Vec<ReviewConfig>,
}

impl InterruptRecord {
    pub fn review_config(&self, tool_name: &str) -> Option<&ReviewConfig> {
        self.review_configs.iter().find(|c| c.tool_name == tool_name)
    }

    /// 决策数量与种类校验，不修改任何状态
    pub fn validate(&self, decisions: &[Decision]) -> Result<(), AgentError> {
        if decisions.len() != self.action_requests.len() {
            return Err(AgentError::DecisionCountMismatch {
                expected: self.action_requests.len(),
                got: decisions.len(),
            });
        }
        for (request, decision) in self.action_requests.iter().zip(decisions) {
            let allowed = self
                .review_config(&request.tool_name)
                .map(|c| c.allows(decision.kind()))
                .unwrap_or(true);
            if !allowed {
                return Err(AgentError::DecisionNotAllowed {
                    tool: request.tool_name.clone(),
                    decision: decision.kind().as_str().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// 子智能体内部的审核中断（由 task 工具返回，向根调用方冒泡）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentInterrupt {
    /// 父智能体中 task 调用的 id
    pub call_id: String,
    pub sub_agent_id: String,
    pub subagent_type: String,
    pub interrupt: InterruptRecord,
}

/// 返回给调用方的中断
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interrupt {
    Hitl(InterruptRecord),
    #[serde(rename = "subagent_hitl")]
    SubAgent {
        sub_agent_id: String,
        subagent_type: String,
        call_id: String,
        interrupt_data: InterruptRecord,
    },
}

impl Interrupt {
    pub fn record(&self) -> &InterruptRecord {
        match self {
            Interrupt::Hitl(record) => record,
            Interrupt::SubAgent { interrupt_data, .. } => interrupt_data,
        }
    }

    /// resume 需要提供的决策数
    pub fn decisions_required(&self) -> usize {
        self.record().action_requests.len()
    }
}

impl From<SubAgentInterrupt> for Interrupt {
    fn from(sa: SubAgentInterrupt) -> Self {
        Interrupt::SubAgent {
            sub_agent_id: sa.sub_agent_id,
            subagent_type: sa.subagent_type,
            call_id: sa.call_id,
            interrupt_data: sa.interrupt,
        }
    }
}

/// 被拒绝调用的合成结果
pub fn rejected_result(call: &ToolCall, note: Option<&str>) -> ToolResult {
    let mut content = format!(
        "Tool call `{}` with id `{}` was rejected by a human reviewer.",
        call.name, call.call_id
    );
    if let Some(note) = note.filter(|n| !n.trim().is_empty()) {
        content.push_str(" Reviewer note: ");
        content.push_str(note);
    }
    ToolResult::error(call, content)
}

/// 挂起的工具轮次：一条 assistant 消息的全部调用及其已有结果
#[derive(Debug, Clone)]
pub struct PendingRound {
    calls: Vec<ToolCall>,
    results: HashMap<String, ToolResult>,
    deltas: Vec<StateDelta>,
    hitl: Option<InterruptRecord>,
    subagents: VecDeque<SubAgentInterrupt>,
}

/// 当前需要决策的中断
pub enum Current<'a> {
    Hitl(&'a InterruptRecord),
    SubAgent(&'a SubAgentInterrupt),
}

impl PendingRound {
    pub fn new(calls: Vec<ToolCall>) -> Self {
        Self {
            calls,
            results: HashMap::new(),
            deltas: Vec::new(),
            hitl: None,
            subagents: VecDeque::new(),
        }
    }

    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    pub fn call(&self, call_id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|c| c.call_id == call_id)
    }

    pub fn set_hitl(&mut self, record: InterruptRecord) {
        if !record.action_requests.is_empty() {
            self.hitl = Some(record);
        }
    }

    pub fn take_hitl(&mut self) -> Option<InterruptRecord> {
        self.hitl.take()
    }

    pub fn insert_result(&mut self, result: ToolResult) {
        self.results.insert(result.tool_call_id.clone(), result);
    }

    pub fn push_delta(&mut self, delta: StateDelta) {
        if !delta.is_empty() {
            self.deltas.push(delta);
        }
    }

    pub fn push_subagent(&mut self, interrupt: SubAgentInterrupt) {
        self.subagents.push_back(interrupt);
    }

    /// 子智能体再次中断：替换队首的中断记录
    pub fn update_subagent(&mut self, record: InterruptRecord) {
        if let Some(front) = self.subagents.front_mut() {
            front.interrupt = record;
        }
    }

    pub fn pop_subagent(&mut self) -> Option<SubAgentInterrupt> {
        self.subagents.pop_front()
    }

    /// 仍在等待审核的子智能体 id
    pub fn subagent_ids(&self) -> Vec<String> {
        self.subagents.iter().map(|s| s.sub_agent_id.clone()).collect()
    }

    /// 子智能体中断优先（它们已经在运行），其次是本层的审核请求
    pub fn current(&self) -> Option<Current<'_>> {
        if let Some(sa) = self.subagents.front() {
            return Some(Current::SubAgent(sa));
        }
        self.hitl.as_ref().map(Current::Hitl)
    }

    pub fn next_interrupt(&self) -> Option<Interrupt> {
        match self.current()? {
            Current::Hitl(record) => Some(Interrupt::Hitl(record.clone())),
            Current::SubAgent(sa) => Some(Interrupt::from(sa.clone())),
        }
    }

    pub fn validate(&self, decisions: &[Decision]) -> Result<(), AgentError> {
        match self.current() {
            Some(Current::Hitl(record)) => record.validate(decisions),
            Some(Current::SubAgent(sa)) => sa.interrupt.validate(decisions),
            None => Err(AgentError::NoPendingInterrupt(
                "all tool calls of the pending round are resolved".into(),
            )),
        }
    }

    /// 把全部结果按调用顺序合并为一条 tool 消息追加到 State；缺失的结果以取消结果补齐
    pub fn finish(self, state: State) -> State {
        let PendingRound {
            calls,
            mut results,
            deltas,
            ..
        } = self;
        let ordered: Vec<ToolResult> = calls
            .iter()
            .map(|call| {
                results
                    .remove(&call.call_id)
                    .unwrap_or_else(|| cancelled_result(call))
            })
            .collect();
        let mut state = state.append(Message::tool(ordered));
        for delta in deltas {
            state = state.merge(delta);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> InterruptRecord {
        InterruptRecord {
            action_requests: vec![ActionRequest {
                tool_call_id: "c1".into(),
                tool_name: "write_file".into(),
                arguments: json!({"path": "a.txt"}),
            }],
            review_configs: vec![ReviewConfig {
                tool_name: "write_file".into(),
                allowed_decisions: vec![DecisionKind::Approve, DecisionKind::Reject],
            }],
        }
    }

    #[test]
    fn test_validate_counts_and_kinds() {
        let r = record();
        assert!(r.validate(&[Decision::Approve]).is_ok());
        assert_eq!(
            r.validate(&[]).unwrap_err(),
            AgentError::DecisionCountMismatch { expected: 1, got: 0 }
        );
        assert_eq!(
            r.validate(&[Decision::edit(json!({}))]).unwrap_err(),
            AgentError::DecisionNotAllowed {
                tool: "write_file".into(),
                decision: "edit".into()
            }
        );
    }

    #[test]
    fn test_subagent_interrupt_serializes_with_type_tag() {
        let interrupt = Interrupt::from(SubAgentInterrupt {
            call_id: "t1".into(),
            sub_agent_id: "sub-1".into(),
            subagent_type: "researcher".into(),
            interrupt: record(),
        });
        let json = serde_json::to_value(&interrupt).unwrap();
        assert_eq!(json["type"], "subagent_hitl");
        assert_eq!(json["sub_agent_id"], "sub-1");
        assert_eq!(json["interrupt_data"]["action_requests"][0]["tool_name"], "write_file");
        assert_eq!(interrupt.decisions_required(), 1);
    }

    #[test]
    fn test_decision_wire_format() {
        let d: Decision =
            serde_json::from_value(json!({"type": "edit", "arguments": {"path": "x"}})).unwrap();
        assert_eq!(d.kind(), DecisionKind::Edit);
        let r: Decision = serde_json::from_value(json!({"type": "reject"})).unwrap();
        assert_eq!(r, Decision::reject());
    }

    #[test]
    fn test_finish_orders_results_by_call() {
        let calls = vec![
            ToolCall::new("1", "a", json!({})),
            ToolCall::new("2", "b", json!({})),
        ];
        let mut round = PendingRound::new(calls.clone());
        round.insert_result(ToolResult::ok(&calls[1], "second"));
        round.insert_result(ToolResult::ok(&calls[0], "first"));
        round.push_delta(StateDelta::default().with_metadata("k", json!(1)));
        let state = round.finish(State::new());
        let msg = state.last_message().unwrap();
        let ids: Vec<&str> = msg.tool_results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(state.metadata["k"], json!(1));
    }

    #[test]
    fn test_subagent_interrupts_surface_before_own_hitl() {
        let mut round = PendingRound::new(vec![]);
        round.set_hitl(record());
        round.push_subagent(SubAgentInterrupt {
            call_id: "t1".into(),
            sub_agent_id: "sub-1".into(),
            subagent_type: "researcher".into(),
            interrupt: record(),
        });
        assert!(matches!(round.next_interrupt(), Some(Interrupt::SubAgent { .. })));
        round.pop_subagent();
        assert!(matches!(round.next_interrupt(), Some(Interrupt::Hitl(_))));
        round.take_hitl();
        assert!(round.next_interrupt().is_none());
        assert!(matches!(
            round.validate(&[]),
            Err(AgentError::NoPendingInterrupt(_))
        ));
    }

    #[test]
    fn test_rejected_result_mentions_reviewer() {
        let call = ToolCall::new("9", "shell", json!({}));
        let result = rejected_result(&call, Some("too risky"));
        assert!(result.is_error);
        assert!(result.content.contains("rejected by a human reviewer"));
        assert!(result.content.ends_with("too risky"));
    }
}
