//! 消息模型：对话中的单条消息、工具调用与工具结果
//!
//! 消息一经创建即不可变，只会被追加到 State 的消息列表中。
//! assistant 消息可携带 tool_calls；tool 消息携带 tool_results，通过 call_id 与调用配对。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 消息完成状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    #[default]
    Complete,
    /// 因长度上限被截断
    Length,
    Cancelled,
}

/// 有序内容片段
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Data { value: Value },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// 模型请求调用某个工具
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    /// arguments 非对象时按空对象处理
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn arguments_value(&self) -> Value {
        Value::Object(self.arguments.clone())
    }
}

/// 单次工具调用的结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.call_id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.call_id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    fn with_text(role: Role, content: impl Into<String>) -> Self {
        let text: String = content.into();
        let content = if text.is_empty() {
            Vec::new()
        } else {
            vec![ContentPart::text(text)]
        };
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            status: MessageStatus::Complete,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_text(Role::Assistant, content)
    }

    /// 携带工具调用的 assistant 消息
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::with_text(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// 工具结果消息（一条 assistant 消息的全部结果合并为一条）
    pub fn tool(results: Vec<ToolResult>) -> Self {
        let mut msg = Self::with_text(Role::Tool, "");
        msg.tool_results = results;
        msg
    }

    /// 拼接所有文本片段
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Data { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}
