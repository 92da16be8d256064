//! Agent 运行时：配置、执行循环、子智能体池与监管树
//!
//! `AgentSupervisor::start` 为一个 agent 启动 [文件存储, 执行循环, 子智能体池] 三个单元，
//! 调用方只通过 `AgentHandle` 交互（submit / resume / 带外消息 / 停止）。

pub mod config;
pub mod pool;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use config::AgentConfig;
pub use pool::{ChildOutcome, SubAgentPoolHandle};
pub use registry::AgentRegistry;
pub use server::{spawn_execution_loop, LoopCommand, LoopHandle};
pub use supervisor::{AgentHandle, AgentSupervisor, Unit, UnitIds};
