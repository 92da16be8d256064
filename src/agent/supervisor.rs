//! Agent 监管树
//!
//! 每个 agent 三个单元，按启动顺序 [文件存储, 执行循环, 子智能体池]，rest-for-one：
//! 某个单元失败时，它和它之后启动的单元一起重启（存储失败重启全部，执行循环失败重启循环与池，池失败只重启池）。
//!
//! 监管任务同时负责：
//! - 空闲超时：执行循环空闲且超过 `inactivity_timeout` 没有入站消息则优雅关闭；运行中不计时
//! - 重启强度：`restart_window` 内重启超过 `max_restarts` 次则停止整棵树
//! - 优雅关闭：取消当前运行，停止子智能体池，flush 文件存储

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::server::{spawn_execution_loop, Activity, LoopCommand, LoopHandle};
use crate::agent::{AgentConfig, SubAgentPoolHandle};
use crate::core::{
    AgentError, FileStoreCleanup, SessionSupervisor, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, State, SubAgentPoolCleanup,
};
use crate::engine::{
    AgentOutcome, Decision, Engine, EngineResources, EventBus, EventEnvelope, ResumeMode,
};
use crate::memory::Message;
use crate::middleware::OutOfBand;
use crate::store::{spawn_file_store, FileStoreHandle, StoreError};

/// 被监管的单元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Store,
    ExecutionLoop,
    SubAgentPool,
}

impl Unit {
    /// 启动顺序
    fn order(self) -> usize {
        match self {
            Unit::Store => 0,
            Unit::ExecutionLoop => 1,
            Unit::SubAgentPool => 2,
        }
    }
}

/// 各单元当前实例的 id（每次重启都会变化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitIds {
    pub store: String,
    pub execution_loop: String,
    pub subagent_pool: String,
}

enum SupervisorCommand {
    Loop(LoopCommand),
    UnitIds {
        reply: oneshot::Sender<UnitIds>,
    },
    Crash {
        unit: Unit,
        reply: oneshot::Sender<Result<UnitIds, AgentError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

fn unit_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 对外的 agent 句柄（可克隆）
#[derive(Clone)]
pub struct AgentHandle {
    agent_id: String,
    inbox: mpsc::UnboundedSender<SupervisorCommand>,
    session: SessionSupervisor,
    state_rx: watch::Receiver<State>,
    events: EventBus,
    shutdown: Arc<ShutdownManager>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.agent_id)
            .field("running", &self.is_running())
            .finish()
    }
}

fn agent_stopped() -> AgentError {
    AgentError::AgentStopped("agent supervisor is not running".into())
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn send(&self, cmd: SupervisorCommand) -> Result<(), AgentError> {
        self.inbox.send(cmd).map_err(|_| agent_stopped())
    }

    async fn run_command(
        &self,
        build: impl FnOnce(CancellationToken, oneshot::Sender<Result<AgentOutcome, AgentError>>) -> LoopCommand,
    ) -> Result<AgentOutcome, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Loop(build(self.session.run_token(), reply)))?;
        rx.await.map_err(|_| {
            AgentError::AgentStopped("execution loop stopped before replying".into())
        })?
    }

    /// 追加一条用户消息并运行，直到完成、中断或出错
    pub async fn submit(&self, message: Message) -> Result<AgentOutcome, AgentError> {
        self.run_command(|cancel, reply| LoopCommand::Submit {
            message,
            cancel,
            reply,
        })
        .await
    }

    /// 用审核决策恢复（一个决策对应一个请求，按请求顺序）
    pub async fn resume(&self, decisions: Vec<Decision>) -> Result<AgentOutcome, AgentError> {
        self.resume_with(decisions, ResumeMode::Continue).await
    }

    pub async fn resume_with(
        &self,
        decisions: Vec<Decision>,
        mode: ResumeMode,
    ) -> Result<AgentOutcome, AgentError> {
        self.run_command(|cancel, reply| LoopCommand::Resume {
            decisions,
            mode,
            cancel,
            reply,
        })
        .await
    }

    /// 带外消息：排队，在两次运行之间交给目标中间件
    pub fn send_out_of_band(&self, message: OutOfBand) -> Result<(), AgentError> {
        self.send(SupervisorCommand::Loop(LoopCommand::OutOfBand(message)))
    }

    /// 最后一次完整应用的 State
    pub fn state(&self) -> State {
        self.state_rx.borrow().clone()
    }

    /// 取消当前运行以及已发出、尚未开始的命令
    pub fn cancel(&self) {
        self.session.cancel();
    }

    pub async fn unit_ids(&self) -> Result<UnitIds, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::UnitIds { reply })?;
        rx.await.map_err(|_| agent_stopped())
    }

    /// 故障注入：中止指定单元，等监管树按 rest-for-one 重启后返回新的单元 id
    pub async fn crash_unit(&self, unit: Unit) -> Result<UnitIds, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(SupervisorCommand::Crash { unit, reply })?;
        rx.await.map_err(|_| agent_stopped())?
    }

    /// 优雅关闭整棵树；已停止时直接返回
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(SupervisorCommand::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
        self.wait_stopped().await;
    }

    pub fn events(&self) -> Option<broadcast::Receiver<EventEnvelope>> {
        self.events.subscribe()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_shutdown()
    }

    /// 等到清理完成
    pub async fn wait_stopped(&self) {
        self.shutdown.wait_for_shutdown().await;
    }
}

pub struct AgentSupervisor;

impl AgentSupervisor {
    /// 启动一个 agent 的监管树；中间件 / 工具配置错误在这里同步返回
    pub async fn start(config: AgentConfig, initial_state: State) -> Result<AgentHandle, AgentError> {
        let config = Arc::new(config);
        Engine::build(Arc::clone(&config), EngineResources::detached())?;

        let events = EventBus::default();
        let session = SessionSupervisor::new();
        let (checkpoint, state_rx) = watch::channel(initial_state);
        let checkpoint = Arc::new(checkpoint);
        let shutdown = Arc::new(ShutdownManager::new());
        let pool = SubAgentPoolHandle::new(config.agent_id.clone(), events.clone());

        let (store, store_task) = spawn_file_store(
            config.agent_id.clone(),
            Arc::clone(&config.store_backend),
            config.store_debounce,
        );
        let pool_task = pool.start().await;
        let execution_loop = launch_loop(&config, &store, &pool, &events, &session, &checkpoint)?;
        let supervisor = Supervisor {
            config: Arc::clone(&config),
            events: events.clone(),
            session: session.clone(),
            checkpoint,
            pool,
            store: Running::new(store, store_task),
            execution_loop,
            pool_task: Running::new((), pool_task),
            restarts: VecDeque::new(),
            shutdown: Arc::clone(&shutdown),
        };

        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        tracing::info!(agent_id = %config.agent_id, "agent started");
        tokio::spawn(supervisor.run(inbox_rx));

        Ok(AgentHandle {
            agent_id: config.agent_id.clone(),
            inbox,
            session,
            state_rx,
            events,
            shutdown,
        })
    }
}

/// 一个运行中的单元实例
struct Running<H, E> {
    id: String,
    handle: H,
    task: JoinHandle<Result<(), E>>,
}

impl<H, E> Running<H, E> {
    fn new(handle: H, task: JoinHandle<Result<(), E>>) -> Self {
        Self {
            id: unit_id(),
            handle,
            task,
        }
    }
}

/// 单元任务结束的描述（用于日志）
fn exit_reason<E: std::fmt::Display>(
    result: Result<Result<(), E>, tokio::task::JoinError>,
) -> String {
    match result {
        Ok(Ok(())) => "exited".to_string(),
        Ok(Err(e)) => format!("failed: {e}"),
        Err(e) if e.is_cancelled() => "aborted".to_string(),
        Err(e) => format!("panicked: {e}"),
    }
}

/// 从检查点启动执行循环；引擎每次按当前的存储与池重新装配
fn launch_loop(
    config: &Arc<AgentConfig>,
    store: &FileStoreHandle,
    pool: &SubAgentPoolHandle,
    events: &EventBus,
    session: &SessionSupervisor,
    checkpoint: &Arc<watch::Sender<State>>,
) -> Result<Running<LoopHandle, AgentError>, AgentError> {
    let resources = EngineResources {
        store: Some(Arc::new(store.clone())),
        subagents: Some(pool.clone()),
        events: events.clone(),
    };
    let engine = Engine::build(Arc::clone(config), resources)?;
    let state = checkpoint.borrow().clone();
    let (handle, task) = spawn_execution_loop(engine, state, session.clone(), Arc::clone(checkpoint));
    Ok(Running::new(handle, task))
}

/// 监管任务一次等待的结果
enum Event {
    Inbound(Option<SupervisorCommand>),
    Exited(Unit, String),
    Idle,
}

struct Supervisor {
    config: Arc<AgentConfig>,
    events: EventBus,
    session: SessionSupervisor,
    checkpoint: Arc<watch::Sender<State>>,
    pool: SubAgentPoolHandle,
    store: Running<FileStoreHandle, StoreError>,
    execution_loop: Running<LoopHandle, AgentError>,
    pool_task: Running<(), AgentError>,
    restarts: VecDeque<Instant>,
    shutdown: Arc<ShutdownManager>,
}

impl Supervisor {
    fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    fn unit_ids(&self) -> UnitIds {
        UnitIds {
            store: self.store.id.clone(),
            execution_loop: self.execution_loop.id.clone(),
            subagent_pool: self.pool_task.id.clone(),
        }
    }

    /// 记录一次重启；超过重启强度返回 false
    fn allow_restart(&mut self) -> bool {
        let now = Instant::now();
        let window = self.config.restart_window;
        while let Some(&at) = self.restarts.front() {
            if now.duration_since(at) > window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() <= self.config.max_restarts
    }

    /// rest-for-one：重启 failed 及其后启动的单元
    async fn restart_from(&mut self, failed: Unit) -> Result<(), ShutdownReason> {
        if !self.allow_restart() {
            tracing::error!(
                agent_id = %self.agent_id(),
                unit = ?failed,
                max_restarts = self.config.max_restarts,
                "restart intensity exceeded, stopping agent"
            );
            return Err(ShutdownReason::RestartIntensity);
        }
        tracing::warn!(agent_id = %self.agent_id(), unit = ?failed, "restarting units");

        // 先停后启动的单元
        self.pool_task.task.abort();
        if failed.order() <= Unit::ExecutionLoop.order() {
            self.execution_loop.task.abort();
        }
        if failed.order() <= Unit::Store.order() {
            self.store.task.abort();
            let (store, task) = spawn_file_store(
                self.config.agent_id.clone(),
                Arc::clone(&self.config.store_backend),
                self.config.store_debounce,
            );
            self.store = Running::new(store, task);
        }
        if failed.order() <= Unit::ExecutionLoop.order() {
            self.execution_loop = launch_loop(
                &self.config,
                &self.store.handle,
                &self.pool,
                &self.events,
                &self.session,
                &self.checkpoint,
            )
            .map_err(|e| ShutdownReason::FatalError(e.to_string()))?;
        }
        let pool_task = self.pool.start().await;
        self.pool_task = Running::new((), pool_task);
        Ok(())
    }

    /// 中止单元并立即按失败处理
    async fn crash(&mut self, unit: Unit) -> Result<(), ShutdownReason> {
        tracing::warn!(agent_id = %self.agent_id(), unit = ?unit, "crashing unit on request");
        match unit {
            Unit::Store => {
                self.store.task.abort();
                let _ = (&mut self.store.task).await;
            }
            Unit::ExecutionLoop => {
                self.execution_loop.task.abort();
                let _ = (&mut self.execution_loop.task).await;
            }
            Unit::SubAgentPool => {
                self.pool_task.task.abort();
                let _ = (&mut self.pool_task.task).await;
            }
        }
        self.restart_from(unit).await
    }

    async fn next_event(
        &mut self,
        inbox: &mut mpsc::UnboundedReceiver<SupervisorCommand>,
        last_inbound: Instant,
    ) -> Event {
        let idle = self.config.inactivity_timeout;
        let mut activity = self.execution_loop.handle.activity();
        let idle_timer = async move {
            let Some(timeout) = idle else {
                return std::future::pending::<()>().await;
            };
            loop {
                let current = *activity.borrow_and_update();
                let alive = match current {
                    Activity::Busy => activity.changed().await.is_ok(),
                    Activity::Idle { since } => {
                        let deadline = since.max(last_inbound) + timeout;
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => return,
                            changed = activity.changed() => changed.is_ok(),
                        }
                    }
                };
                if !alive {
                    // 执行循环已退出，交给单元退出分支处理
                    return std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            cmd = inbox.recv() => Event::Inbound(cmd),
            result = &mut self.store.task => Event::Exited(Unit::Store, exit_reason(result)),
            result = &mut self.execution_loop.task => Event::Exited(Unit::ExecutionLoop, exit_reason(result)),
            result = &mut self.pool_task.task => Event::Exited(Unit::SubAgentPool, exit_reason(result)),
            _ = idle_timer => Event::Idle,
        }
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SupervisorCommand>) {
        let mut last_inbound = Instant::now();
        let mut stop_reply = None;

        let reason = loop {
            match self.next_event(&mut inbox, last_inbound).await {
                Event::Inbound(cmd) => {
                    last_inbound = Instant::now();
                    match cmd {
                        Some(SupervisorCommand::Loop(cmd)) => {
                            if let Err(e) = self.execution_loop.handle.send(cmd) {
                                tracing::warn!(agent_id = %self.agent_id(), "command dropped: {}", e);
                            }
                        }
                        Some(SupervisorCommand::UnitIds { reply }) => {
                            let _ = reply.send(self.unit_ids());
                        }
                        Some(SupervisorCommand::Crash { unit, reply }) => match self.crash(unit).await {
                            Ok(()) => {
                                let _ = reply.send(Ok(self.unit_ids()));
                            }
                            Err(reason) => {
                                let _ = reply.send(Err(AgentError::AgentStopped(format!("{reason:?}"))));
                                break reason;
                            }
                        },
                        Some(SupervisorCommand::Stop { reply }) => {
                            stop_reply = Some(reply);
                            break ShutdownReason::Requested;
                        }
                        None => break ShutdownReason::Requested,
                    }
                }
                Event::Exited(unit, how) => {
                    tracing::warn!(agent_id = %self.agent_id(), unit = ?unit, "unit {}", how);
                    if let Err(reason) = self.restart_from(unit).await {
                        break reason;
                    }
                }
                Event::Idle => {
                    tracing::info!(
                        agent_id = %self.agent_id(),
                        timeout_secs = self.config.inactivity_timeout.map(|d| d.as_secs()).unwrap_or_default(),
                        "no inbound messages, shutting down"
                    );
                    break ShutdownReason::Inactivity;
                }
            }
        };

        self.stop(reason).await;
        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    /// 优雅关闭：取消运行 -> 停执行循环 -> 停子智能体池 -> flush 存储
    async fn stop(self, reason: ShutdownReason) {
        tracing::info!(agent_id = %self.config.agent_id, reason = ?reason, "stopping agent");
        self.session.cancel();
        self.execution_loop.task.abort();

        let mut coordinator = ShutdownCoordinator::new();
        coordinator.register(SubAgentPoolCleanup::new(self.pool.clone()));
        coordinator.register(FileStoreCleanup::new(self.store.handle.clone()));
        coordinator.run_cleanup().await;

        self.pool_task.task.abort();
        self.shutdown.shutdown(reason);
        tracing::info!(agent_id = %self.config.agent_id, "agent stopped");
    }
}
