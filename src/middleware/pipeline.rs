//! 中间件管线
//!
//! 按配置顺序构建：确定 id（重复即配置错误）→ 调用模块初始化器 → 记录能力标记。
//! 工具名在构建时检查重复；钩子在运行时按顺序执行，任一钩子出错即中止本轮，
//! 并带回该钩子执行前的 State。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::core::{AgentError, State};
use crate::memory::ToolCall;
use crate::middleware::{HookContext, HookOutcome, Middleware, MiddlewareSpec, OutOfBand};
use crate::engine::ReviewConfig;
use crate::tools::Tool;

/// 能力标记
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub system_prompt: bool,
    pub tools: bool,
    pub before_model: bool,
    pub after_model: bool,
    pub handle_message: bool,
    pub tool_gate: bool,
}

impl Capabilities {
    fn of(middleware: &dyn Middleware) -> Self {
        Self {
            system_prompt: middleware.as_prompt_provider().is_some(),
            tools: middleware.as_tool_provider().is_some(),
            before_model: middleware.as_before_model().is_some(),
            after_model: middleware.as_after_model().is_some(),
            handle_message: middleware.as_message_handler().is_some(),
            tool_gate: middleware.as_tool_gate().is_some(),
        }
    }
}

/// 管线中一个已初始化的中间件
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub id: String,
    pub spec: MiddlewareSpec,
    pub capabilities: Capabilities,
    middleware: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    pub fn middleware(&self) -> &dyn Middleware {
        self.middleware.as_ref()
    }
}

/// 钩子失败：错误 + 失败前的 State
#[derive(Debug)]
pub struct HookFailure {
    pub error: AgentError,
    pub state: State,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Continue(State),
    Halt {
        state: State,
        middleware: String,
        reason: String,
    },
}

#[derive(Clone, Default)]
pub struct Pipeline {
    entries: Vec<MiddlewareEntry>,
}

impl Pipeline {
    /// 构建管线；`reserved_tools` 是 agent 自带的工具名，中间件工具不得与之重名
    pub fn build(specs: &[MiddlewareSpec], reserved_tools: &[String]) -> Result<Self, AgentError> {
        let mut ids = HashSet::new();
        let mut tool_names: HashSet<String> = reserved_tools.iter().cloned().collect();
        let mut entries = Vec::with_capacity(specs.len());

        for spec in specs {
            let id = spec.identity();
            if !ids.insert(id.clone()) {
                return Err(AgentError::DuplicateMiddleware(id));
            }
            let middleware = spec
                .module
                .init(&spec.options)
                .map_err(|reason| AgentError::MiddlewareInit {
                    id: id.clone(),
                    reason,
                })?;
            if let Some(provider) = middleware.as_tool_provider() {
                for tool in provider.tools() {
                    let name = tool.name().to_string();
                    if !tool_names.insert(name.clone()) {
                        return Err(AgentError::DuplicateTool(name));
                    }
                }
            }
            let capabilities = Capabilities::of(middleware.as_ref());
            tracing::debug!(middleware = %id, module = spec.module_name(), ?capabilities, "middleware initialized");
            entries.push(MiddlewareEntry {
                id,
                spec: spec.clone(),
                capabilities,
                middleware,
            });
        }

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[MiddlewareEntry] {
        &self.entries
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&MiddlewareEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 基础提示词 + 各中间件片段（按管线顺序）
    pub fn system_prompt(&self, base: &str) -> String {
        let mut sections: Vec<String> = Vec::new();
        if !base.trim().is_empty() {
            sections.push(base.trim_end().to_string());
        }
        for entry in &self.entries {
            if let Some(provider) = entry.middleware.as_prompt_provider() {
                let text = provider.system_prompt();
                if !text.trim().is_empty() {
                    sections.push(text.trim_end().to_string());
                }
            }
        }
        sections.join("\n\n")
    }

    pub fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.entries
            .iter()
            .filter_map(|e| e.middleware.as_tool_provider())
            .flat_map(|p| p.tools())
            .collect()
    }

    /// 第一个声明审核该调用的中间件给出的审核配置
    pub fn review(&self, call: &ToolCall) -> Option<ReviewConfig> {
        self.entries
            .iter()
            .filter_map(|e| e.middleware.as_tool_gate())
            .find_map(|gate| gate.review(call))
    }

    pub async fn before_model(
        &self,
        mut state: State,
        ctx: &HookContext,
    ) -> Result<PipelineOutcome, HookFailure> {
        for entry in &self.entries {
            let Some(hook) = entry.middleware.as_before_model() else {
                continue;
            };
            let hook_ctx = ctx.for_middleware(&entry.id);
            match hook.before_model(&state, &hook_ctx).await {
                Ok(HookOutcome::Unchanged) => {}
                Ok(HookOutcome::Updated(next)) => state = next,
                Ok(HookOutcome::Halt { state, reason }) => {
                    tracing::info!(middleware = %entry.id, %reason, "round halted by middleware");
                    return Ok(PipelineOutcome::Halt {
                        state,
                        middleware: entry.id.clone(),
                        reason,
                    });
                }
                Err(reason) => return Err(hook_failure(&entry.id, reason, state)),
            }
        }
        Ok(PipelineOutcome::Continue(state))
    }

    pub async fn after_model(&self, mut state: State, ctx: &HookContext) -> Result<State, HookFailure> {
        for entry in &self.entries {
            let Some(hook) = entry.middleware.as_after_model() else {
                continue;
            };
            let hook_ctx = ctx.for_middleware(&entry.id);
            match hook.after_model(&state, &hook_ctx).await {
                Ok(Some(next)) => state = next,
                Ok(None) => {}
                Err(reason) => return Err(hook_failure(&entry.id, reason, state)),
            }
        }
        Ok(state)
    }

    /// 把带外消息交给目标中间件；目标不存在或没有处理能力时原样返回 State
    pub async fn handle_message(
        &self,
        message: &OutOfBand,
        state: State,
        ctx: &HookContext,
    ) -> Result<State, HookFailure> {
        let handler = self
            .get(&message.middleware_id)
            .and_then(|e| e.middleware.as_message_handler());
        let Some(handler) = handler else {
            tracing::warn!(middleware = %message.middleware_id, "out-of-band message has no handler, dropped");
            return Ok(state);
        };
        let hook_ctx = ctx.for_middleware(&message.middleware_id);
        match handler.handle_message(&message.payload, &state, &hook_ctx).await {
            Ok(Some(next)) => Ok(next),
            Ok(None) => Ok(state),
            Err(reason) => Err(hook_failure(&message.middleware_id, reason, state)),
        }
    }

    /// 某模块的初始化 options（子智能体派生时复用）
    pub fn options_of(&self, id: &str) -> Option<&Value> {
        self.get(id).map(|e| &e.spec.options)
    }
}

fn hook_failure(id: &str, reason: String, state: State) -> HookFailure {
    tracing::warn!(middleware = %id, %reason, "middleware hook failed");
    HookFailure {
        error: AgentError::HookFailed {
            middleware: id.to_string(),
            reason,
        },
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::memory::Message;
    use crate::middleware::{
        AfterModel, BeforeModel, MiddlewareModule, SystemPromptProvider, ToolProvider,
    };
    use crate::tools::EchoTool;
    use async_trait::async_trait;
    use serde_json::json;

    /// 测试用中间件：options 决定提示词、是否提供 echo 工具、钩子行为
    struct Probe {
        prompt: Option<String>,
        echo: bool,
        before: Option<String>,
    }

    impl SystemPromptProvider for Probe {
        fn system_prompt(&self) -> String {
            self.prompt.clone().unwrap_or_default()
        }
    }

    impl ToolProvider for Probe {
        fn tools(&self) -> Vec<Arc<dyn Tool>> {
            vec![Arc::new(EchoTool)]
        }
    }

    #[async_trait]
    impl BeforeModel for Probe {
        async fn before_model(&self, state: &State, _ctx: &HookContext) -> Result<HookOutcome, String> {
            match self.before.as_deref() {
                Some("fail") => Err("boom".into()),
                Some("halt") => Ok(HookOutcome::Halt {
                    state: state.clone(),
                    reason: "stop here".into(),
                }),
                Some(tag) => Ok(HookOutcome::Updated(
                    state.clone().append(Message::user(tag.to_string())),
                )),
                None => Ok(HookOutcome::Unchanged),
            }
        }
    }

    #[async_trait]
    impl AfterModel for Probe {
        async fn after_model(&self, state: &State, ctx: &HookContext) -> Result<Option<State>, String> {
            Ok(Some(state.clone().with_metadata(ctx.middleware_id.clone(), json!(true))))
        }
    }

    impl Middleware for Probe {
        fn as_prompt_provider(&self) -> Option<&dyn SystemPromptProvider> {
            self.prompt.as_ref().map(|_| self as &dyn SystemPromptProvider)
        }

        fn as_tool_provider(&self) -> Option<&dyn ToolProvider> {
            self.echo.then_some(self as &dyn ToolProvider)
        }

        fn as_before_model(&self) -> Option<&dyn BeforeModel> {
            Some(self)
        }

        fn as_after_model(&self) -> Option<&dyn AfterModel> {
            Some(self)
        }
    }

    struct ProbeModule;

    impl MiddlewareModule for ProbeModule {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn init(&self, options: &Value) -> Result<Arc<dyn Middleware>, String> {
            if options.get("reject").is_some() {
                return Err("bad options".into());
            }
            Ok(Arc::new(Probe {
                prompt: options.get("prompt").and_then(|v| v.as_str()).map(String::from),
                echo: options.get("echo").and_then(|v| v.as_bool()).unwrap_or(false),
                before: options.get("before").and_then(|v| v.as_str()).map(String::from),
            }))
        }
    }

    fn spec(options: Value) -> MiddlewareSpec {
        MiddlewareSpec::new(ProbeModule).with_options(options)
    }

    fn ctx() -> HookContext {
        HookContext::new("agent", Arc::new(ScriptedModel::replies(vec![])))
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let err = Pipeline::build(&[spec(json!({})), spec(json!({}))], &[])
            .err()
            .unwrap();
        assert_eq!(err, AgentError::DuplicateMiddleware("probe".into()));

        let ok = Pipeline::build(&[spec(json!({})), spec(json!({})).with_id("probe_2")], &[]).unwrap();
        assert_eq!(ok.ids(), vec!["probe", "probe_2"]);
    }

    #[test]
    fn test_init_failure_carries_reason() {
        let err = Pipeline::build(&[spec(json!({"reject": true}))], &[]).err().unwrap();
        assert_eq!(
            err,
            AgentError::MiddlewareInit {
                id: "probe".into(),
                reason: "bad options".into()
            }
        );
    }

    #[test]
    fn test_duplicate_tool_names_rejected() {
        let err = Pipeline::build(
            &[spec(json!({"echo": true})), spec(json!({"echo": true})).with_id("other")],
            &[],
        )
        .err()
        .unwrap();
        assert_eq!(err, AgentError::DuplicateTool("echo".into()));

        let err = Pipeline::build(&[spec(json!({"echo": true}))], &["echo".to_string()])
            .err()
            .unwrap();
        assert_eq!(err, AgentError::DuplicateTool("echo".into()));
    }

    #[test]
    fn test_system_prompt_order_and_capabilities() {
        let pipeline = Pipeline::build(
            &[
                spec(json!({"prompt": "first"})),
                spec(json!({})).with_id("silent"),
                spec(json!({"prompt": "second"})).with_id("p2"),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(pipeline.system_prompt("base"), "base\n\nfirst\n\nsecond");
        assert!(pipeline.entries()[0].capabilities.system_prompt);
        assert!(!pipeline.entries()[1].capabilities.system_prompt);
        assert!(pipeline.entries()[1].capabilities.before_model);
    }

    #[tokio::test]
    async fn test_before_model_runs_in_order() {
        let pipeline = Pipeline::build(
            &[spec(json!({"before": "a"})), spec(json!({"before": "b"})).with_id("second")],
            &[],
        )
        .unwrap();
        let outcome = pipeline.before_model(State::new(), &ctx()).await.unwrap();
        let PipelineOutcome::Continue(state) = outcome else {
            panic!("expected continue");
        };
        let texts: Vec<String> = state.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_hook_error_returns_state_before_hook() {
        let pipeline = Pipeline::build(
            &[spec(json!({"before": "a"})), spec(json!({"before": "fail"})).with_id("broken")],
            &[],
        )
        .unwrap();
        let failure = pipeline.before_model(State::new(), &ctx()).await.unwrap_err();
        assert_eq!(failure.state.messages.len(), 1);
        assert!(matches!(failure.error, AgentError::HookFailed { ref middleware, .. } if middleware == "broken"));
    }

    #[tokio::test]
    async fn test_halt_stops_remaining_hooks() {
        let pipeline = Pipeline::build(
            &[spec(json!({"before": "halt"})), spec(json!({"before": "b"})).with_id("never")],
            &[],
        )
        .unwrap();
        match pipeline.before_model(State::new(), &ctx()).await.unwrap() {
            PipelineOutcome::Halt { state, middleware, reason } => {
                assert!(state.messages.is_empty());
                assert_eq!(middleware, "probe");
                assert_eq!(reason, "stop here");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_after_model_sees_middleware_id() {
        let pipeline = Pipeline::build(&[spec(json!({})).with_id("tagger")], &[]).unwrap();
        let state = pipeline.after_model(State::new(), &ctx()).await.unwrap();
        assert_eq!(state.metadata["tagger"], json!(true));
    }
}
