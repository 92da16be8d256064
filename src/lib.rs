//! Hive - Rust 智能体执行引擎
//!
//! 模块划分：
//! - **agent**: 监管树（文件存储 / 执行循环 / 子智能体池）、AgentHandle 与运行时配置
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、会话状态、会话监管、任务调度、优雅关闭
//! - **engine**: 模型调用循环、人工审核中断、生命周期事件
//! - **llm**: 模型客户端抽象、增量流组装、脚本化 Mock
//! - **memory**: 消息模型
//! - **middleware**: 中间件能力 trait、管线与内置中间件（patch / todo / filesystem / hitl / title / subagent）
//! - **store**: 虚拟文件存储 actor 与持久化后端
//! - **tools**: 工具 trait、注册表、执行器与文件工具

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod middleware;
pub mod store;
pub mod tools;

pub use agent::{AgentConfig, AgentHandle, AgentSupervisor};
pub use engine::{AgentOutcome, Decision, Interrupt};
