//! 记忆层：消息模型

pub mod conversation;

pub use conversation::{ContentPart, Message, MessageStatus, Role, ToolCall, ToolResult};
