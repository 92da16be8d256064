//! 子智能体池
//!
//! 每个 agent 一个池 actor，托管本 agent 派生的子智能体执行循环（JoinSet，池停止时全部中止）。
//! 句柄通过共享槽位找到当前的池：监管树重启池之后，旧句柄自动指向新池。
//! 子智能体的运行由调用方直接驱动（拿到子循环句柄后 submit / resume），池本身不会被长任务阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

use crate::agent::server::{execution_loop, LoopHandle};
use crate::core::{AgentError, SessionSupervisor, State};
use crate::engine::{
    AgentOutcome, Decision, Engine, EngineEvent, EventBus, InterruptRecord, ResumeMode,
};
use crate::memory::Message;

/// 子智能体一次运行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    /// 子智能体最终的 assistant 文本
    Completed(String),
    /// 子智能体等待人工审核，仍保留在池中
    Interrupted(InterruptRecord),
    Failed(String),
}

impl ChildOutcome {
    fn label(&self) -> &'static str {
        match self {
            ChildOutcome::Completed(_) => "completed",
            ChildOutcome::Interrupted(_) => "interrupted",
            ChildOutcome::Failed(_) => "failed",
        }
    }
}

enum PoolCommand {
    Spawn {
        engine: Box<Engine>,
        subagent_type: String,
        reply: oneshot::Sender<String>,
    },
    Child {
        id: String,
        reply: oneshot::Sender<Option<LoopHandle>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type Slot = Arc<RwLock<Option<mpsc::UnboundedSender<PoolCommand>>>>;

/// 子智能体池句柄（可克隆）
#[derive(Clone)]
pub struct SubAgentPoolHandle {
    agent_id: String,
    slot: Slot,
    events: EventBus,
}

impl std::fmt::Debug for SubAgentPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentPoolHandle")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

fn pool_stopped() -> AgentError {
    AgentError::AgentStopped("sub-agent pool is not running".into())
}

impl SubAgentPoolHandle {
    /// 创建句柄；池由 `start` 启动
    pub fn new(agent_id: impl Into<String>, events: EventBus) -> Self {
        Self {
            agent_id: agent_id.into(),
            slot: Arc::new(RwLock::new(None)),
            events,
        }
    }

    /// 启动（或重启）池 actor，句柄槽位切换到新池
    pub async fn start(&self) -> JoinHandle<Result<(), AgentError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot.write().await = Some(tx);
        let pool = SubAgentPool {
            agent_id: self.agent_id.clone(),
            children: HashMap::new(),
            tasks: JoinSet::new(),
        };
        tokio::spawn(pool.run(rx))
    }

    async fn send(&self, cmd: PoolCommand) -> Result<(), AgentError> {
        let slot = self.slot.read().await;
        match slot.as_ref() {
            Some(tx) => tx.send(cmd).map_err(|_| pool_stopped()),
            None => Err(pool_stopped()),
        }
    }

    /// 在池中启动一个子智能体，返回其 id
    pub async fn spawn(&self, engine: Engine, subagent_type: &str) -> Result<String, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Spawn {
            engine: Box::new(engine),
            subagent_type: subagent_type.to_string(),
            reply,
        })
        .await?;
        let id = rx.await.map_err(|_| pool_stopped())?;
        self.events.emit(EngineEvent::SubAgentSpawned {
            agent_id: self.agent_id.clone(),
            sub_agent_id: id.clone(),
            subagent_type: subagent_type.to_string(),
        });
        Ok(id)
    }

    async fn child(&self, id: &str) -> Option<LoopHandle> {
        let (reply, rx) = oneshot::channel();
        self.send(PoolCommand::Child {
            id: id.to_string(),
            reply,
        })
        .await
        .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.child(id).await.is_some()
    }

    /// 停止并移除子智能体；返回是否存在
    pub async fn remove(&self, id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .send(PoolCommand::Remove {
                id: id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// 停止池及其全部子智能体
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(PoolCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        *self.slot.write().await = None;
    }

    /// 让子智能体处理一条消息，直到完成、中断或出错
    pub async fn run(&self, id: &str, message: Message) -> ChildOutcome {
        let Some(child) = self.child(id).await else {
            return ChildOutcome::Failed(format!("sub-agent {id} is not running"));
        };
        let result = child.submit(message).await;
        self.settle(id, result).await
    }

    /// 把审核决策转交给等待中的子智能体
    pub async fn resume(&self, id: &str, decisions: Vec<Decision>) -> ChildOutcome {
        let Some(child) = self.child(id).await else {
            return ChildOutcome::Failed(format!("sub-agent {id} is not running"));
        };
        let result = child.resume(decisions, ResumeMode::Continue).await;
        self.settle(id, result).await
    }

    /// 取消子智能体当前的运行
    pub async fn cancel(&self, id: &str) {
        if let Some(child) = self.child(id).await {
            child.cancel();
        }
    }

    async fn settle(&self, id: &str, result: Result<AgentOutcome, AgentError>) -> ChildOutcome {
        let outcome = match result {
            Ok(AgentOutcome::Completed(state)) => {
                ChildOutcome::Completed(state.final_assistant_text().unwrap_or_default())
            }
            Ok(AgentOutcome::Interrupted { interrupt, .. }) => {
                ChildOutcome::Interrupted(interrupt.record().clone())
            }
            Ok(AgentOutcome::Halted { reason, .. }) => {
                ChildOutcome::Failed(format!("sub-agent halted: {reason}"))
            }
            Ok(AgentOutcome::Failed { error, .. }) => ChildOutcome::Failed(error.to_string()),
            Err(error) => ChildOutcome::Failed(error.to_string()),
        };
        if !matches!(outcome, ChildOutcome::Interrupted(_)) {
            self.remove(id).await;
        }
        tracing::info!(
            agent_id = %self.agent_id,
            sub_agent_id = %id,
            outcome = outcome.label(),
            "sub-agent run finished"
        );
        self.events.emit(EngineEvent::SubAgentFinished {
            agent_id: self.agent_id.clone(),
            sub_agent_id: id.to_string(),
            outcome: outcome.label().to_string(),
        });
        outcome
    }
}

struct Child {
    handle: LoopHandle,
    subagent_type: String,
}

struct SubAgentPool {
    agent_id: String,
    children: HashMap<String, Child>,
    tasks: JoinSet<Result<(), AgentError>>,
}

impl SubAgentPool {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PoolCommand>) -> Result<(), AgentError> {
        tracing::debug!(agent_id = %self.agent_id, "sub-agent pool started");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(PoolCommand::Shutdown { reply }) => {
                        self.stop_all().await;
                        let _ = reply.send(());
                        return Ok(());
                    }
                    Some(cmd) => self.handle(cmd),
                    None => {
                        self.stop_all().await;
                        return Ok(());
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(agent_id = %self.agent_id, "sub-agent loop failed: {}", e),
                        Err(e) => tracing::warn!(agent_id = %self.agent_id, "sub-agent loop aborted: {}", e),
                    }
                    self.children.retain(|_, child| !child.handle.is_closed());
                }
            }
        }
    }

    fn handle(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Spawn {
                engine,
                subagent_type,
                reply,
            } => {
                let id = format!("sub-{}", uuid::Uuid::new_v4());
                let (checkpoint, _) = watch::channel(State::new());
                let (handle, fut) =
                    execution_loop(*engine, State::new(), SessionSupervisor::new(), Arc::new(checkpoint));
                self.tasks.spawn(fut);
                tracing::info!(
                    agent_id = %self.agent_id,
                    sub_agent_id = %id,
                    subagent_type = %subagent_type,
                    "sub-agent spawned"
                );
                self.children.insert(
                    id.clone(),
                    Child {
                        handle,
                        subagent_type,
                    },
                );
                let _ = reply.send(id);
            }
            PoolCommand::Child { id, reply } => {
                let _ = reply.send(self.children.get(&id).map(|c| c.handle.clone()));
            }
            PoolCommand::Remove { id, reply } => {
                let removed = self.children.remove(&id);
                if let Some(child) = &removed {
                    child.handle.cancel();
                    tracing::debug!(
                        agent_id = %self.agent_id,
                        sub_agent_id = %id,
                        subagent_type = %child.subagent_type,
                        "sub-agent removed"
                    );
                }
                let _ = reply.send(removed.is_some());
            }
            PoolCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn stop_all(&mut self) {
        for child in self.children.values() {
            child.handle.cancel();
        }
        self.children.clear();
        self.tasks.shutdown().await;
        tracing::debug!(agent_id = %self.agent_id, "sub-agent pool stopped");
    }
}
