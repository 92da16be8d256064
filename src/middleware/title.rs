//! 会话标题中间件
//!
//! 首轮对话结束后在后台请求模型生成一个简短标题，结果通过带外消息送回，
//! 由 handle_message 写入 metadata `conversation_title`。后台任务不阻塞主循环。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::State;
use crate::llm::{assemble, LlmClient, LlmError, ModelResponse};
use crate::memory::{Message, Role};
use crate::middleware::{
    parse_options, AfterModel, HookContext, MessageHandler, Middleware, MiddlewareModule, OutOfBand,
};

pub const MODULE_NAME: &str = "title";
pub const TITLE_KEY: &str = "conversation_title";

const DEFAULT_TITLE_PROMPT: &str =
    "Write a short title (at most six words) for a conversation that starts with the user's message below. Reply with the title only.";
const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TitleOptions {
    #[serde(default)]
    pub prompt: Option<String>,
}

pub struct ConversationTitle {
    prompt: String,
    /// 已有后台任务在生成标题
    requested: Arc<AtomicBool>,
}

impl ConversationTitle {
    fn first_user_text(state: &State) -> Option<String> {
        state
            .messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .filter(|t| !t.trim().is_empty())
    }
}

async fn generate_title(model: Arc<dyn LlmClient>, prompt: String, first: String) -> Result<String, LlmError> {
    let reply = match model.call(&prompt, &[], &[Message::user(first)]).await? {
        ModelResponse::Message(m) => m,
        ModelResponse::Stream(stream) => assemble(stream, |_| {}).await?,
    };
    let title: String = reply
        .text()
        .trim()
        .trim_matches('"')
        .chars()
        .take(MAX_TITLE_CHARS)
        .collect();
    if title.is_empty() {
        return Err(LlmError::InvalidResponse("empty title".into()));
    }
    Ok(title)
}

#[async_trait]
impl AfterModel for ConversationTitle {
    async fn after_model(&self, state: &State, ctx: &HookContext) -> Result<Option<State>, String> {
        if state.metadata.contains_key(TITLE_KEY) {
            return Ok(None);
        }
        let Some(first) = Self::first_user_text(state) else {
            return Ok(None);
        };
        let Some(mailbox) = ctx.mailbox.clone() else {
            tracing::debug!(agent_id = %ctx.agent_id, "no mailbox, title generation skipped");
            return Ok(None);
        };
        if self.requested.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let requested = Arc::clone(&self.requested);
        let model = Arc::clone(&ctx.model);
        let prompt = self.prompt.clone();
        let middleware_id = ctx.middleware_id.clone();
        let agent_id = ctx.agent_id.clone();
        tokio::spawn(async move {
            match generate_title(model, prompt, first).await {
                Ok(title) => {
                    if !mailbox.send(OutOfBand::new(middleware_id, json!({ "title": title }))) {
                        tracing::debug!(agent_id = %agent_id, "agent gone before title arrived");
                    }
                }
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, "title generation failed: {}", e);
                    requested.store(false, Ordering::SeqCst);
                }
            }
        });
        Ok(None)
    }
}

#[async_trait]
impl MessageHandler for ConversationTitle {
    async fn handle_message(
        &self,
        payload: &Value,
        state: &State,
        _ctx: &HookContext,
    ) -> Result<Option<State>, String> {
        let title = payload
            .get("title")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "title payload missing `title`".to_string())?;
        Ok(Some(state.clone().with_metadata(TITLE_KEY, json!(title))))
    }
}

impl Middleware for ConversationTitle {
    fn as_after_model(&self) -> Option<&dyn AfterModel> {
        Some(self)
    }

    fn as_message_handler(&self) -> Option<&dyn MessageHandler> {
        Some(self)
    }
}

pub struct TitleModule;

impl MiddlewareModule for TitleModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn init(&self, options: &Value) -> Result<Arc<dyn Middleware>, String> {
        let options: TitleOptions = parse_options(options)?;
        Ok(Arc::new(ConversationTitle {
            prompt: options
                .prompt
                .unwrap_or_else(|| DEFAULT_TITLE_PROMPT.to_string()),
            requested: Arc::new(AtomicBool::new(false)),
        }))
    }
}
