//! 执行引擎主循环
//!
//! before_model 钩子 -> 调用模型（系统提示词 = 基础提示词 + 各中间件片段，工具 = agent 工具 + 中间件工具）
//! -> 追加 assistant 消息 -> 审核 / 执行工具 -> 合并结果 -> 下一轮；模型不再请求工具时运行 after_model 钩子。
//!
//! 中断不是错误：被审核的调用与子智能体的审核请求都以 `RunOutcome::Interrupted` 返回，
//! 挂起的工具轮次（PendingRound）交还给调用方保存，resume 时再传回来。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, ChildOutcome, SubAgentPoolHandle};
use crate::core::{AgentError, State, TaskScheduler};
use crate::engine::interrupt::{rejected_result, Current};
use crate::engine::{
    ActionRequest, Decision, EngineEvent, EventBus, Interrupt, InterruptRecord, PendingRound,
};
use crate::llm::{assemble, ModelResponse};
use crate::memory::{Message, Role, ToolCall, ToolResult};
use crate::middleware::{HookContext, HookFailure, Mailbox, OutOfBand, Pipeline, PipelineOutcome};
use crate::store::FileStore;
use crate::tools::executor::CallOutcome;
use crate::tools::{ToolContext, ToolExecutor, ToolRegistry, ToolSpec};

/// 引擎运行所需的共享资源
#[derive(Clone, Default)]
pub struct EngineResources {
    pub store: Option<Arc<dyn FileStore>>,
    pub subagents: Option<SubAgentPoolHandle>,
    pub events: EventBus,
}

impl EngineResources {
    pub fn detached() -> Self {
        Self {
            store: None,
            subagents: None,
            events: EventBus::disabled(),
        }
    }
}

/// resume 之后是否继续调用模型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    #[default]
    Continue,
    /// 只解决挂起的调用并返回 State
    ResolveOnly,
}

/// 对外的运行结果
#[derive(Debug, Clone)]
pub enum AgentOutcome {
    Completed(State),
    Interrupted { state: State, interrupt: Interrupt },
    /// 某个中间件在 before_model 阶段停止了本轮
    Halted { state: State, reason: String },
    Failed { state: State, error: AgentError },
}

impl AgentOutcome {
    pub fn state(&self) -> &State {
        match self {
            AgentOutcome::Completed(state)
            | AgentOutcome::Interrupted { state, .. }
            | AgentOutcome::Halted { state, .. }
            | AgentOutcome::Failed { state, .. } => state,
        }
    }

    pub fn into_state(self) -> State {
        match self {
            AgentOutcome::Completed(state)
            | AgentOutcome::Interrupted { state, .. }
            | AgentOutcome::Halted { state, .. }
            | AgentOutcome::Failed { state, .. } => state,
        }
    }

    pub fn interrupt(&self) -> Option<&Interrupt> {
        match self {
            AgentOutcome::Interrupted { interrupt, .. } => Some(interrupt),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&AgentError> {
        match self {
            AgentOutcome::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, AgentOutcome::Completed(_))
    }
}

/// 引擎内部结果：中断时附带挂起轮次
#[derive(Debug)]
pub enum RunOutcome {
    Finished(AgentOutcome),
    Interrupted {
        state: State,
        interrupt: Interrupt,
        pending: PendingRound,
    },
}

impl RunOutcome {
    fn failed(state: State, error: AgentError) -> Self {
        RunOutcome::Finished(AgentOutcome::Failed { state, error })
    }

    /// 拆成对外结果与需要保存的挂起轮次
    pub fn split(self) -> (AgentOutcome, Option<PendingRound>) {
        match self {
            RunOutcome::Finished(outcome) => (outcome, None),
            RunOutcome::Interrupted {
                state,
                interrupt,
                pending,
            } => (AgentOutcome::Interrupted { state, interrupt }, Some(pending)),
        }
    }
}

/// 一个 agent（或子智能体）的执行引擎
pub struct Engine {
    config: Arc<AgentConfig>,
    pipeline: Pipeline,
    executor: ToolExecutor,
    system_prompt: String,
    tool_specs: Vec<ToolSpec>,
    resources: EngineResources,
    mailbox: Option<Mailbox>,
}

impl Engine {
    /// 构建管线与工具表；重复的中间件 id / 工具名在这里同步报告
    pub fn build(config: Arc<AgentConfig>, resources: EngineResources) -> Result<Self, AgentError> {
        let specs = config.effective_middleware();
        let pipeline = Pipeline::build(&specs, &config.tool_names())?;

        let mut registry = ToolRegistry::new();
        for tool in config.tools.iter().cloned().chain(pipeline.tools()) {
            registry.register(tool)?;
        }
        let executor = ToolExecutor::new(registry, config.tool_timeout_secs)
            .with_scheduler(TaskScheduler::new(config.max_parallel_tools));
        let system_prompt = pipeline.system_prompt(&config.base_prompt);
        let tool_specs = executor.specs();

        tracing::debug!(
            agent_id = %config.agent_id,
            middleware = ?pipeline.ids(),
            tools = ?executor.tool_names(),
            "engine built"
        );
        Ok(Self {
            config,
            pipeline,
            executor,
            system_prompt,
            tool_specs,
            resources,
            mailbox: None,
        })
    }

    pub fn with_mailbox(mut self, mailbox: Mailbox) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.executor.tool_names()
    }

    pub fn events(&self) -> &EventBus {
        &self.resources.events
    }

    pub fn subagents(&self) -> Option<&SubAgentPoolHandle> {
        self.resources.subagents.as_ref()
    }

    fn hook_context(&self) -> HookContext {
        let ctx = HookContext::new(self.config.agent_id.clone(), Arc::clone(&self.config.model))
            .with_events(self.resources.events.clone());
        match &self.mailbox {
            Some(mailbox) => ctx.with_mailbox(mailbox.clone()),
            None => ctx,
        }
    }

    fn tool_context(&self, state: &State, cancel: &CancellationToken) -> ToolContext {
        ToolContext {
            agent_id: self.config.agent_id.clone(),
            call_id: String::new(),
            state: Arc::new(state.clone()),
            store: self.resources.store.clone(),
            subagents: self.resources.subagents.clone(),
            agent_config: Some(Arc::clone(&self.config)),
            events: self.resources.events.clone(),
            cancel: cancel.clone(),
        }
    }

    fn state_updated(&self, state: &State) {
        self.resources.events.emit(EngineEvent::StateUpdated {
            agent_id: self.config.agent_id.clone(),
            message_count: state.messages.len(),
        });
    }

    /// 从当前 State 开始运行，直到模型不再请求工具、被中断、被停止或出错
    pub async fn run(&self, mut state: State, cancel: CancellationToken) -> RunOutcome {
        let hook_ctx = self.hook_context();
        let mut rounds = 0usize;

        loop {
            if cancel.is_cancelled() {
                return RunOutcome::failed(state, AgentError::Cancelled);
            }

            state = match self.pipeline.before_model(state, &hook_ctx).await {
                Ok(PipelineOutcome::Continue(state)) => state,
                Ok(PipelineOutcome::Halt { state, reason, .. }) => {
                    return RunOutcome::Finished(AgentOutcome::Halted { state, reason });
                }
                Err(HookFailure { error, state }) => return RunOutcome::failed(state, error),
            };

            if rounds >= self.config.max_rounds {
                tracing::warn!(agent_id = %self.config.agent_id, rounds, "round limit reached");
                return RunOutcome::failed(state, AgentError::RoundLimitExceeded(self.config.max_rounds));
            }
            rounds += 1;
            tracing::debug!(agent_id = %self.config.agent_id, round = rounds, "calling model");

            let message = match self.call_model(&state, &cancel).await {
                Ok(message) => message,
                Err(error) => {
                    tracing::warn!(agent_id = %self.config.agent_id, "model call failed: {}", error);
                    return RunOutcome::failed(state, error);
                }
            };
            let calls = message.tool_calls.clone();
            state = state.append(message);
            self.state_updated(&state);

            if calls.is_empty() {
                break;
            }

            let pending = self.process_tool_calls(&state, calls, &cancel).await;
            if let Some(interrupt) = pending.next_interrupt() {
                return self.interrupted(state, interrupt, pending);
            }
            state = pending.finish(state);
            self.state_updated(&state);
        }

        match self.pipeline.after_model(state, &hook_ctx).await {
            Ok(state) => RunOutcome::Finished(AgentOutcome::Completed(state)),
            Err(HookFailure { error, state }) => RunOutcome::failed(state, error),
        }
    }

    /// 用审核决策恢复挂起轮次；调用方已用 `PendingRound::validate` 校验过决策
    pub async fn resume(
        &self,
        state: State,
        mut pending: PendingRound,
        decisions: Vec<Decision>,
        mode: ResumeMode,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let subagent = match pending.current() {
            Some(Current::SubAgent(sa)) => Some((sa.sub_agent_id.clone(), sa.call_id.clone())),
            Some(Current::Hitl(_)) => None,
            None => {
                return RunOutcome::failed(
                    state,
                    AgentError::NoPendingInterrupt("nothing left to resume".into()),
                )
            }
        };

        match subagent {
            Some((sub_agent_id, call_id)) => {
                self.resume_subagent(&mut pending, &sub_agent_id, &call_id, decisions)
                    .await;
            }
            None => {
                if let Some(record) = pending.take_hitl() {
                    self.apply_decisions(&state, &mut pending, record, decisions, &cancel)
                        .await;
                }
            }
        }

        if let Some(interrupt) = pending.next_interrupt() {
            return self.interrupted(state, interrupt, pending);
        }
        let state = pending.finish(state);
        self.state_updated(&state);

        match mode {
            ResumeMode::ResolveOnly => RunOutcome::Finished(AgentOutcome::Completed(state)),
            ResumeMode::Continue => self.run(state, cancel).await,
        }
    }

    /// 把带外消息交给目标中间件
    pub async fn handle_message(&self, message: &OutOfBand, state: State) -> Result<State, HookFailure> {
        self.pipeline
            .handle_message(message, state, &self.hook_context())
            .await
    }

    fn interrupted(&self, state: State, interrupt: Interrupt, pending: PendingRound) -> RunOutcome {
        tracing::info!(
            agent_id = %self.config.agent_id,
            requests = interrupt.decisions_required(),
            "execution interrupted for human review"
        );
        self.resources.events.emit(EngineEvent::InterruptRaised {
            agent_id: self.config.agent_id.clone(),
            interrupt: interrupt.clone(),
        });
        RunOutcome::Interrupted {
            state,
            interrupt,
            pending,
        }
    }

    /// 调用模型；流式回复在这里组装完整，部分消息不会进入 State
    async fn call_model(&self, state: &State, cancel: &CancellationToken) -> Result<Message, AgentError> {
        let call = async {
            let response = self
                .config
                .model
                .call(&self.system_prompt, &self.tool_specs, &state.messages)
                .await?;
            let message = match response {
                ModelResponse::Message(message) => message,
                ModelResponse::Stream(stream) => {
                    let events = &self.resources.events;
                    let agent_id = &self.config.agent_id;
                    assemble(stream, |text| {
                        events.emit(EngineEvent::TextDelta {
                            agent_id: agent_id.clone(),
                            text: text.to_string(),
                        })
                    })
                    .await?
                }
            };
            Ok::<Message, AgentError>(message)
        };

        let mut message = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            result = call => result?,
        };
        if message.role != Role::Assistant {
            message.role = Role::Assistant;
        }
        Ok(message)
    }

    /// 审核 + 执行一条 assistant 消息的工具调用
    async fn process_tool_calls(
        &self,
        state: &State,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> PendingRound {
        let mut pending = PendingRound::new(calls.clone());
        let mut record = InterruptRecord::default();
        let mut ungated = Vec::new();

        for call in calls {
            match self.pipeline.review(&call) {
                Some(review) => {
                    record.action_requests.push(ActionRequest {
                        tool_call_id: call.call_id.clone(),
                        tool_name: call.name.clone(),
                        arguments: call.arguments_value(),
                    });
                    if record.review_config(&review.tool_name).is_none() {
                        record.review_configs.push(review);
                    }
                }
                None => ungated.push(call),
            }
        }
        pending.set_hitl(record);

        self.execute(state, &mut pending, &ungated, cancel).await;
        pending
    }

    async fn execute(
        &self,
        state: &State,
        pending: &mut PendingRound,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) {
        if calls.is_empty() {
            return;
        }
        let ctx = self.tool_context(state, cancel);
        let outcomes = self.executor.execute_batch(calls, &ctx).await;
        for (call, outcome) in calls.iter().zip(outcomes) {
            self.record(pending, call, outcome);
        }
    }

    fn record(&self, pending: &mut PendingRound, call: &ToolCall, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Done { result, delta } => {
                self.resources.events.emit(EngineEvent::ToolExecuted {
                    agent_id: self.config.agent_id.clone(),
                    tool: call.name.clone(),
                    call_id: call.call_id.clone(),
                    is_error: result.is_error,
                });
                pending.insert_result(result);
                if let Some(delta) = delta {
                    pending.push_delta(delta);
                }
            }
            CallOutcome::Interrupted(interrupt) => pending.push_subagent(interrupt),
        }
    }

    /// 按请求顺序应用决策：approve 原样执行，edit 替换参数执行，reject 合成拒绝结果
    async fn apply_decisions(
        &self,
        state: &State,
        pending: &mut PendingRound,
        record: InterruptRecord,
        decisions: Vec<Decision>,
        cancel: &CancellationToken,
    ) {
        let mut to_execute = Vec::new();
        for (request, decision) in record.action_requests.into_iter().zip(decisions) {
            let original = pending
                .call(&request.tool_call_id)
                .cloned()
                .unwrap_or_else(|| {
                    ToolCall::new(
                        request.tool_call_id.clone(),
                        request.tool_name.clone(),
                        request.arguments.clone(),
                    )
                });
            tracing::info!(
                agent_id = %self.config.agent_id,
                tool = %request.tool_name,
                call_id = %request.tool_call_id,
                decision = decision.kind().as_str(),
                "applying review decision"
            );
            match decision {
                Decision::Approve => to_execute.push(original),
                Decision::Edit { arguments } => {
                    to_execute.push(ToolCall::new(original.call_id, original.name, arguments))
                }
                Decision::Reject { message } => {
                    pending.insert_result(rejected_result(&original, message.as_deref()))
                }
            }
        }
        self.execute(state, pending, &to_execute, cancel).await;
    }

    /// 把决策转交给子智能体；子智能体结束时 task 调用得到结果
    async fn resume_subagent(
        &self,
        pending: &mut PendingRound,
        sub_agent_id: &str,
        call_id: &str,
        decisions: Vec<Decision>,
    ) {
        let outcome = match &self.resources.subagents {
            Some(pool) => pool.resume(sub_agent_id, decisions).await,
            None => ChildOutcome::Failed("sub-agent pool is not available".into()),
        };
        let call = pending
            .call(call_id)
            .cloned()
            .unwrap_or_else(|| ToolCall::new(call_id, "task", serde_json::Value::Null));
        match outcome {
            ChildOutcome::Interrupted(record) => pending.update_subagent(record),
            ChildOutcome::Completed(text) => {
                pending.pop_subagent();
                pending.insert_result(ToolResult::ok(&call, text));
            }
            ChildOutcome::Failed(reason) => {
                pending.pop_subagent();
                pending.insert_result(ToolResult::error(&call, format!("Error: {reason}")));
            }
        }
    }
}
