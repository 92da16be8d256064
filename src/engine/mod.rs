//! 执行引擎：模型调用循环、人工审核中断与生命周期事件

pub mod events;
pub mod interrupt;
pub mod loop_;

pub use events::{EngineEvent, EventBus, EventEnvelope};
pub use interrupt::{
    rejected_result, ActionRequest, Decision, DecisionKind, Interrupt, InterruptRecord,
    PendingRound, ReviewConfig, SubAgentInterrupt,
};
pub use loop_::{AgentOutcome, Engine, EngineResources, ResumeMode, RunOutcome};
