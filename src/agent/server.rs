//! 执行循环 actor
//!
//! 一个 agent（或子智能体）的 State 只由这个任务持有和修改：命令逐条处理，
//! 带外消息在两次运行之间应用。每次运行结束后把 State 写入检查点，
//! 监管树重启执行循环时从检查点继续。
//!
//! 取消令牌在命令发出时就取好：`cancel()` 会连同已排队、尚未开始的命令一起取消，
//! 之后发出的命令拿到新令牌。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, SessionSupervisor, State};
use crate::engine::interrupt::Current;
use crate::engine::{AgentOutcome, Decision, Engine, PendingRound, ResumeMode, RunOutcome};
use crate::memory::Message;
use crate::middleware::{HookFailure, Mailbox, OutOfBand};

type OutcomeReply = oneshot::Sender<Result<AgentOutcome, AgentError>>;

/// 发往执行循环的命令
#[derive(Debug)]
pub enum LoopCommand {
    Submit {
        message: Message,
        cancel: CancellationToken,
        reply: OutcomeReply,
    },
    Resume {
        decisions: Vec<Decision>,
        mode: ResumeMode,
        cancel: CancellationToken,
        reply: OutcomeReply,
    },
    OutOfBand(OutOfBand),
}

/// 执行循环是否正在处理 submit / resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Activity {
    Idle { since: Instant },
    Busy,
}

/// 执行循环句柄
#[derive(Clone, Debug)]
pub struct LoopHandle {
    tx: mpsc::UnboundedSender<LoopCommand>,
    session: SessionSupervisor,
    activity: watch::Receiver<Activity>,
}

fn stopped() -> AgentError {
    AgentError::AgentStopped("execution loop is not running".into())
}

impl LoopHandle {
    pub(crate) fn send(&self, cmd: LoopCommand) -> Result<(), AgentError> {
        self.tx.send(cmd).map_err(|_| stopped())
    }

    async fn request(
        &self,
        build: impl FnOnce(CancellationToken, OutcomeReply) -> LoopCommand,
    ) -> Result<AgentOutcome, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(self.session.run_token(), reply))?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn submit(&self, message: Message) -> Result<AgentOutcome, AgentError> {
        self.request(|cancel, reply| LoopCommand::Submit {
            message,
            cancel,
            reply,
        })
        .await
    }

    pub async fn resume(
        &self,
        decisions: Vec<Decision>,
        mode: ResumeMode,
    ) -> Result<AgentOutcome, AgentError> {
        self.request(|cancel, reply| LoopCommand::Resume {
            decisions,
            mode,
            cancel,
            reply,
        })
        .await
    }

    pub fn send_out_of_band(&self, message: OutOfBand) -> Result<(), AgentError> {
        self.send(LoopCommand::OutOfBand(message))
    }

    /// 取消正在进行的运行和已排队的命令；State 保持最后一次完整应用的结果
    pub fn cancel(&self) {
        self.session.cancel();
    }

    pub(crate) fn activity(&self) -> watch::Receiver<Activity> {
        self.activity.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct ExecutionLoop {
    engine: Engine,
    state: State,
    pending: Option<PendingRound>,
    checkpoint: Arc<watch::Sender<State>>,
    activity: watch::Sender<Activity>,
}

impl ExecutionLoop {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<LoopCommand>,
        mut oob_rx: mpsc::UnboundedReceiver<OutOfBand>,
    ) -> Result<(), AgentError> {
        tracing::debug!(agent_id = %self.engine.agent_id(), "execution loop started");
        loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => {
                        tracing::debug!(agent_id = %self.engine.agent_id(), "execution loop stopped");
                        return Ok(());
                    }
                },
                Some(message) = oob_rx.recv() => self.apply_out_of_band(message).await,
            }
        }
    }

    async fn handle(&mut self, cmd: LoopCommand) {
        match cmd {
            LoopCommand::Submit {
                message,
                cancel,
                reply,
            } => {
                self.activity.send_replace(Activity::Busy);
                let outcome = self.submit(message, cancel).await;
                self.mark_idle();
                let _ = reply.send(Ok(outcome));
            }
            LoopCommand::Resume {
                decisions,
                mode,
                cancel,
                reply,
            } => {
                self.activity.send_replace(Activity::Busy);
                let outcome = self.resume(decisions, mode, cancel).await;
                self.mark_idle();
                let _ = reply.send(outcome);
            }
            LoopCommand::OutOfBand(message) => self.apply_out_of_band(message).await,
        }
    }

    fn mark_idle(&self) {
        self.activity.send_replace(Activity::Idle {
            since: Instant::now(),
        });
    }

    async fn submit(&mut self, message: Message, cancel: CancellationToken) -> AgentOutcome {
        if let Some(pending) = self.pending.take() {
            // 新消息取代挂起的中断：停掉等待中的子智能体，未解决的调用以取消结果收尾
            if let Some(pool) = self.engine.subagents() {
                for id in pending.subagent_ids() {
                    pool.remove(&id).await;
                }
            }
            tracing::info!(agent_id = %self.engine.agent_id(), "pending interrupt superseded by a new message");
            let state = std::mem::take(&mut self.state);
            self.state = pending.finish(state);
        }
        let state = self.state.clone().append(message);
        let outcome = self.engine.run(state, cancel).await;
        self.settle(outcome)
    }

    async fn resume(
        &mut self,
        decisions: Vec<Decision>,
        mode: ResumeMode,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let Some(pending) = self.pending.as_ref() else {
            return Err(AgentError::NoPendingInterrupt(
                "agent is not waiting for a review".into(),
            ));
        };
        pending.validate(&decisions)?;
        if let Some(Current::SubAgent(sa)) = pending.current() {
            let alive = match self.engine.subagents() {
                Some(pool) => pool.contains(&sa.sub_agent_id).await,
                None => false,
            };
            if !alive {
                return Err(AgentError::NoPendingInterrupt(format!(
                    "sub-agent {} is no longer running",
                    sa.sub_agent_id
                )));
            }
        }

        let Some(pending) = self.pending.take() else {
            return Err(AgentError::NoPendingInterrupt("agent is not waiting for a review".into()));
        };
        let outcome = self
            .engine
            .resume(self.state.clone(), pending, decisions, mode, cancel)
            .await;
        Ok(self.settle(outcome))
    }

    fn settle(&mut self, outcome: RunOutcome) -> AgentOutcome {
        let (outcome, pending) = outcome.split();
        self.state = outcome.state().clone();
        self.pending = pending;
        self.checkpoint.send_replace(self.state.clone());
        outcome
    }

    async fn apply_out_of_band(&mut self, message: OutOfBand) {
        tracing::debug!(
            agent_id = %self.engine.agent_id(),
            middleware = %message.middleware_id,
            "applying out-of-band message"
        );
        match self.engine.handle_message(&message, self.state.clone()).await {
            Ok(state) => {
                self.state = state;
                self.checkpoint.send_replace(self.state.clone());
            }
            Err(HookFailure { error, .. }) => {
                tracing::warn!(agent_id = %self.engine.agent_id(), "out-of-band message failed: {}", error);
            }
        }
    }
}

/// 构造执行循环：返回句柄与待 spawn 的 future（子智能体池用 JoinSet 托管）
pub(crate) fn execution_loop(
    engine: Engine,
    state: State,
    session: SessionSupervisor,
    checkpoint: Arc<watch::Sender<State>>,
) -> (LoopHandle, impl Future<Output = Result<(), AgentError>> + Send + 'static) {
    let (tx, cmd_rx) = mpsc::unbounded_channel();
    let (oob_tx, oob_rx) = mpsc::unbounded_channel();
    let (activity, activity_rx) = watch::channel(Activity::Idle {
        since: Instant::now(),
    });
    let engine = engine.with_mailbox(Mailbox::new(oob_tx));
    let server = ExecutionLoop {
        engine,
        state,
        pending: None,
        checkpoint,
        activity,
    };
    let handle = LoopHandle {
        tx,
        session,
        activity: activity_rx,
    };
    (handle, server.run(cmd_rx, oob_rx))
}

/// 启动执行循环任务
pub fn spawn_execution_loop(
    engine: Engine,
    state: State,
    session: SessionSupervisor,
    checkpoint: Arc<watch::Sender<State>>,
) -> (LoopHandle, JoinHandle<Result<(), AgentError>>) {
    let (handle, fut) = execution_loop(engine, state, session, checkpoint);
    (handle, tokio::spawn(fut))
}
