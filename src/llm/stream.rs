//! 增量流组装
//!
//! 把 MessageDelta 流累积成一条完整的 assistant 消息。流中途出错时整条消息作废，
//! 调用方的 State 不会出现半条消息。

use std::collections::BTreeMap;

use futures_util::StreamExt;
use serde_json::Value;

use crate::llm::{DeltaStream, LlmError, MessageDelta};
use crate::memory::{Message, MessageStatus, ToolCall};

#[derive(Default)]
struct PartialCall {
    call_id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// 消费增量流并组装消息；on_text 在每个文本片段到达时回调（用于事件推送）
pub async fn assemble(
    mut stream: DeltaStream,
    mut on_text: impl FnMut(&str),
) -> Result<Message, LlmError> {
    let mut text = String::new();
    let mut calls: BTreeMap<usize, PartialCall> = BTreeMap::new();
    let mut status = MessageStatus::Complete;

    while let Some(delta) = stream.next().await {
        match delta? {
            MessageDelta::Text { text: fragment } => {
                on_text(&fragment);
                text.push_str(&fragment);
            }
            MessageDelta::ToolCall {
                index,
                call_id,
                name,
                arguments,
            } => {
                let partial = calls.entry(index).or_default();
                if partial.call_id.is_none() {
                    partial.call_id = call_id;
                }
                if partial.name.is_none() {
                    partial.name = name;
                }
                partial.arguments.push_str(&arguments);
            }
            MessageDelta::Status { status: s } => status = s,
        }
    }

    let mut tool_calls = Vec::with_capacity(calls.len());
    for (index, partial) in calls {
        let call_id = partial
            .call_id
            .ok_or_else(|| LlmError::InvalidResponse(format!("tool call #{index} has no id")))?;
        let name = partial
            .name
            .ok_or_else(|| LlmError::InvalidResponse(format!("tool call {call_id} has no name")))?;
        let arguments: Value = if partial.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&partial.arguments).map_err(|e| {
                LlmError::InvalidResponse(format!("tool call {call_id} arguments: {e}"))
            })?
        };
        tool_calls.push(ToolCall::new(call_id, name, arguments));
    }

    let mut message = Message::assistant_with_calls(text, tool_calls);
    message.status = status;
    Ok(message)
}
