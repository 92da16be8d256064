//! 悬空工具调用修补
//!
//! 消息列表再次发给模型之前，每个工具调用都必须在其后有且仅有一个结果。
//! 单次正向扫描：assistant 消息登记调用 id，之后出现的 tool 消息才能消除它们（出现在调用之前的结果不算）。
//! 扫描结束仍未匹配的调用，在发出它们的 assistant 消息之后紧跟插入一条 tool 消息，按原调用顺序放入取消结果。
//! 没有悬空调用时原样借用返回（`Cow::Borrowed`），调用方可以零成本判断是否有改动。

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::State;
use crate::memory::{Message, Role, ToolCall, ToolResult};
use crate::middleware::{BeforeModel, HookContext, HookOutcome, Middleware, MiddlewareModule};

pub const MODULE_NAME: &str = "patch_tool_calls";

/// 被取消调用的合成结果
pub fn cancelled_result(call: &ToolCall) -> ToolResult {
    ToolResult::error(
        call,
        format!(
            "Tool call `{}` with id `{}` was cancelled — another message came in before it could be completed.",
            call.name, call.call_id
        ),
    )
}

/// 修补悬空调用；无改动时返回借用
pub fn patch_dangling_tool_calls(messages: &[Message]) -> Cow<'_, [Message]> {
    // call_id -> 发出它的 assistant 消息下标
    let mut pending: HashMap<&str, usize> = HashMap::new();
    for (idx, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                for call in &msg.tool_calls {
                    pending.insert(call.call_id.as_str(), idx);
                }
            }
            Role::Tool => {
                for result in &msg.tool_results {
                    pending.remove(result.tool_call_id.as_str());
                }
            }
            _ => {}
        }
    }

    if pending.is_empty() {
        return Cow::Borrowed(messages);
    }

    // assistant 下标 -> 该消息中悬空的调用（保持原顺序）
    let mut inserts: BTreeMap<usize, Vec<ToolResult>> = BTreeMap::new();
    for (idx, msg) in messages.iter().enumerate() {
        if msg.role != Role::Assistant {
            continue;
        }
        for call in &msg.tool_calls {
            if pending.get(call.call_id.as_str()) == Some(&idx) {
                inserts.entry(idx).or_default().push(cancelled_result(call));
            }
        }
    }

    let mut patched = Vec::with_capacity(messages.len() + inserts.len());
    for (idx, msg) in messages.iter().enumerate() {
        patched.push(msg.clone());
        if let Some(results) = inserts.remove(&idx) {
            patched.push(Message::tool(results));
        }
    }
    tracing::debug!(inserted = patched.len() - messages.len(), "patched dangling tool calls");
    Cow::Owned(patched)
}

/// before_model 阶段修补悬空调用
pub struct PatchToolCalls;

#[async_trait]
impl BeforeModel for PatchToolCalls {
    async fn before_model(&self, state: &State, _ctx: &HookContext) -> Result<HookOutcome, String> {
        match patch_dangling_tool_calls(&state.messages) {
            Cow::Borrowed(_) => Ok(HookOutcome::Unchanged),
            Cow::Owned(messages) => {
                let mut next = state.clone();
                next.messages = messages;
                Ok(HookOutcome::Updated(next))
            }
        }
    }
}

impl Middleware for PatchToolCalls {
    fn as_before_model(&self) -> Option<&dyn BeforeModel> {
        Some(self)
    }
}

pub struct PatchToolCallsModule;

impl MiddlewareModule for PatchToolCallsModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn init(&self, _options: &Value) -> Result<Arc<dyn Middleware>, String> {
        Ok(Arc::new(PatchToolCalls))
    }
}
