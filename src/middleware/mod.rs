//! 中间件：可插拔的能力单元
//!
//! 每个中间件按需实现一组能力 trait（系统提示词、工具、before/after model 钩子、带外消息处理、工具审核），
//! 并通过 `Middleware` 上的访问器暴露出来；Pipeline 只按能力是否存在来调度，不关心具体类型。
//!
//! 中间件由 `MiddlewareModule` 根据 options 初始化，`MiddlewareSpec` 是配置里的原始条目
//! （模块 + options + 可选的显式 id，显式 id 允许同一模块出现多次）。

pub mod catalog;
pub mod filesystem;
pub mod hitl;
pub mod patch;
pub mod pipeline;
pub mod subagent;
pub mod title;
pub mod todo;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::State;
use crate::engine::{EventBus, ReviewConfig};
use crate::llm::LlmClient;
use crate::memory::ToolCall;
use crate::tools::Tool;

pub use catalog::MiddlewareCatalog;
pub use filesystem::FilesystemModule;
pub use hitl::{GateConfig, HitlModule};
pub use patch::{patch_dangling_tool_calls, PatchToolCallsModule};
pub use pipeline::{Capabilities, HookFailure, MiddlewareEntry, Pipeline, PipelineOutcome};
pub use subagent::{SubAgentModule, SubAgentTemplate};
pub use title::TitleModule;
pub use todo::TodoModule;

/// 带外消息：在模型调用循环之外送达指定中间件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutOfBand {
    pub middleware_id: String,
    pub payload: Value,
}

impl OutOfBand {
    pub fn new(middleware_id: impl Into<String>, payload: Value) -> Self {
        Self {
            middleware_id: middleware_id.into(),
            payload,
        }
    }
}

/// 后台任务把结果送回执行循环的通道
#[derive(Clone, Debug)]
pub struct Mailbox {
    tx: mpsc::UnboundedSender<OutOfBand>,
}

impl Mailbox {
    pub fn new(tx: mpsc::UnboundedSender<OutOfBand>) -> Self {
        Self { tx }
    }

    /// 执行循环已退出时返回 false
    pub fn send(&self, message: OutOfBand) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// 钩子上下文
#[derive(Clone)]
pub struct HookContext {
    pub agent_id: String,
    /// 当前被调用的中间件 id（Pipeline 逐个设置）
    pub middleware_id: String,
    pub model: Arc<dyn LlmClient>,
    pub mailbox: Option<Mailbox>,
    pub events: EventBus,
}

impl HookContext {
    pub fn new(agent_id: impl Into<String>, model: Arc<dyn LlmClient>) -> Self {
        Self {
            agent_id: agent_id.into(),
            middleware_id: String::new(),
            model,
            mailbox: None,
            events: EventBus::disabled(),
        }
    }

    pub fn with_mailbox(mut self, mailbox: Mailbox) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn for_middleware(&self, id: &str) -> Self {
        let mut ctx = self.clone();
        ctx.middleware_id = id.to_string();
        ctx
    }
}

/// before_model 钩子的结果
#[derive(Debug)]
pub enum HookOutcome {
    Unchanged,
    Updated(State),
    /// 停止本轮
    Halt { state: State, reason: String },
}

pub trait SystemPromptProvider: Send + Sync {
    fn system_prompt(&self) -> String;
}

pub trait ToolProvider: Send + Sync {
    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

#[async_trait]
pub trait BeforeModel: Send + Sync {
    async fn before_model(&self, state: &State, ctx: &HookContext) -> Result<HookOutcome, String>;
}

#[async_trait]
pub trait AfterModel: Send + Sync {
    /// Ok(None) 表示 State 未改动
    async fn after_model(&self, state: &State, ctx: &HookContext) -> Result<Option<State>, String>;
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(
        &self,
        payload: &Value,
        state: &State,
        ctx: &HookContext,
    ) -> Result<Option<State>, String>;
}

/// 工具审核：返回 Some 表示该调用需要人工审核
pub trait ToolGate: Send + Sync {
    fn review(&self, call: &ToolCall) -> Option<ReviewConfig>;
}

/// 中间件：按需暴露能力
pub trait Middleware: Send + Sync {
    fn as_prompt_provider(&self) -> Option<&dyn SystemPromptProvider> {
        None
    }

    fn as_tool_provider(&self) -> Option<&dyn ToolProvider> {
        None
    }

    fn as_before_model(&self) -> Option<&dyn BeforeModel> {
        None
    }

    fn as_after_model(&self) -> Option<&dyn AfterModel> {
        None
    }

    fn as_message_handler(&self) -> Option<&dyn MessageHandler> {
        None
    }

    fn as_tool_gate(&self) -> Option<&dyn ToolGate> {
        None
    }
}

/// 中间件模块：名称 + 初始化器
pub trait MiddlewareModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// 用 options 初始化；失败原因会中止 Pipeline 构建
    fn init(&self, options: &Value) -> Result<Arc<dyn Middleware>, String>;
}

/// 配置中的原始中间件条目
#[derive(Clone)]
pub struct MiddlewareSpec {
    pub id: Option<String>,
    pub module: Arc<dyn MiddlewareModule>,
    pub options: Value,
}

impl MiddlewareSpec {
    pub fn new(module: impl MiddlewareModule + 'static) -> Self {
        Self::from_arc(Arc::new(module))
    }

    pub fn from_arc(module: Arc<dyn MiddlewareModule>) -> Self {
        Self {
            id: None,
            module,
            options: Value::Null,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// 显式 id，否则模块名
    pub fn identity(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| self.module.name().to_string())
    }

    pub fn module_name(&self) -> &'static str {
        self.module.name()
    }
}

impl fmt::Debug for MiddlewareSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareSpec")
            .field("id", &self.identity())
            .field("module", &self.module.name())
            .field("options", &self.options)
            .finish()
    }
}

/// 将 options 反序列化为模块自己的配置；Null 视为全部默认
pub(crate) fn parse_options<T>(options: &Value) -> Result<T, String>
where
    T: serde::de::DeserializeOwned + Default,
{
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| format!("invalid options: {e}"))
}
