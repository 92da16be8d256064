//! 模型调用抽象
//!
//! 引擎把模型当作黑盒：给定系统提示词、工具列表与消息历史，返回一条完整的 assistant 消息，
//! 或者返回增量流（由 `llm::stream::assemble` 组装为完整消息）。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{Message, MessageStatus};
use crate::tools::ToolSpec;

/// 模型调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("stream interrupted: {0}")]
    Stream(String),
}

/// 流式增量
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageDelta {
    Text { text: String },
    /// 同一 index 的片段按到达顺序拼接；call_id / name 取首个非空值
    ToolCall {
        index: usize,
        call_id: Option<String>,
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    Status { status: MessageStatus },
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<MessageDelta, LlmError>> + Send>>;

/// 模型返回：完整消息或增量流
pub enum ModelResponse {
    Message(Message),
    Stream(DeltaStream),
}

impl std::fmt::Debug for ModelResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelResponse::Message(m) => f.debug_tuple("Message").field(m).finish(),
            ModelResponse::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// 模型客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn call(
        &self,
        system_prompt: &str,
        tools: &[ToolSpec],
        messages: &[Message],
    ) -> Result<ModelResponse, LlmError>;
}
