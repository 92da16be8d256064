//! 脚本化模型客户端（用于测试与演示，无需 API）
//!
//! 两种用法：按顺序弹出预置回复（`ScriptedModel::new`），或按请求内容路由（`ScriptedModel::responder`）。
//! 每次调用都会记录系统提示词、工具名与消息，便于断言。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, MessageDelta, ModelResponse};
use crate::memory::Message;
use crate::tools::ToolSpec;

/// 一次模型调用的快照
#[derive(Clone, Debug)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub tool_names: Vec<String>,
    pub messages: Vec<Message>,
}

/// 预置的单步回复
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Reply(Message),
    Stream(Vec<MessageDelta>),
    Fail(LlmError),
}

type Responder = dyn Fn(&ModelRequest) -> Result<Message, LlmError> + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<ScriptStep>>),
    Responder(Box<Responder>),
}

/// 脚本化模型
pub struct ScriptedModel {
    script: Script,
    calls: Arc<Mutex<Vec<ModelRequest>>>,
    latency: Option<Duration>,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(steps.into_iter().collect())),
            calls: Arc::new(Mutex::new(Vec::new())),
            latency: None,
        }
    }

    /// 只回复完整消息的便捷构造
    pub fn replies(messages: impl IntoIterator<Item = Message>) -> Self {
        Self::new(messages.into_iter().map(ScriptStep::Reply))
    }

    pub fn responder(
        f: impl Fn(&ModelRequest) -> Result<Message, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Script::Responder(Box::new(f)),
            calls: Arc::new(Mutex::new(Vec::new())),
            latency: None,
        }
    }

    /// 每次调用先等待 `latency` 再回复；等待期间被丢弃的调用不消耗脚本
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 已记录的调用
    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedModel {
    async fn call(
        &self,
        system_prompt: &str,
        tools: &[ToolSpec],
        messages: &[Message],
    ) -> Result<ModelResponse, LlmError> {
        let request = ModelRequest {
            system_prompt: system_prompt.to_string(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            messages: messages.to_vec(),
        };
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match &self.script {
            Script::Responder(f) => f(&request).map(ModelResponse::Message),
            Script::Queue(queue) => {
                let step = queue
                    .lock()
                    .map_err(|_| LlmError::Request("script lock poisoned".into()))?
                    .pop_front()
                    .ok_or_else(|| LlmError::Request("script exhausted".into()))?;
                match step {
                    ScriptStep::Reply(msg) => Ok(ModelResponse::Message(msg)),
                    ScriptStep::Stream(deltas) => Ok(ModelResponse::Stream(Box::pin(
                        stream::iter(deltas.into_iter().map(Ok)),
                    ))),
                    ScriptStep::Fail(err) => Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_queue_and_exhaustion() {
        let model = ScriptedModel::replies(vec![Message::assistant("one")]);
        let first = model.call("sys", &[], &[Message::user("hi")]).await.unwrap();
        assert!(matches!(first, ModelResponse::Message(ref m) if m.text() == "one"));
        let err = model.call("sys", &[], &[]).await.unwrap_err();
        assert_eq!(err, LlmError::Request("script exhausted".into()));
        assert_eq!(model.call_count(), 2);
        assert_eq!(model.calls()[0].system_prompt, "sys");
    }

    #[tokio::test]
    async fn test_responder_sees_request() {
        let model = ScriptedModel::responder(|req| {
            Ok(Message::assistant(format!("{} messages", req.messages.len())))
        });
        let resp = model
            .call("sys", &[], &[Message::user("a"), Message::user("b")])
            .await
            .unwrap();
        match resp {
            ModelResponse::Message(m) => assert_eq!(m.text(), "2 messages"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
