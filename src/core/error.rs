//! Agent 错误类型与错误分类
//!
//! 错误分四类（ErrorKind）：配置错误同步报告、协作方错误携带出错时的 State 返回、
//! 进程故障交给监管树重启、安全拒绝按普通工具错误处理。

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Duplicate middleware id: {0}")]
    DuplicateMiddleware(String),

    #[error("Duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("Middleware '{id}' failed to initialize: {reason}")]
    MiddlewareInit { id: String, reason: String },

    #[error("Unknown subagent type: {0}")]
    UnknownSubAgent(String),

    #[error("Decision '{decision}' is not allowed for tool '{tool}'")]
    DecisionNotAllowed { tool: String, decision: String },

    #[error("Expected {expected} decisions, got {got}")]
    DecisionCountMismatch { expected: usize, got: usize },

    /// 没有待恢复的中断，或决策与记录的中断不匹配
    #[error("No pending interrupt: {0}")]
    NoPendingInterrupt(String),

    #[error("LLM error: {0}")]
    LlmError(#[from] LlmError),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Middleware '{middleware}' hook failed: {reason}")]
    HookFailed { middleware: String, reason: String },

    #[error("Exceeded max rounds ({0})")]
    RoundLimitExceeded(usize),

    #[error("Cancelled")]
    Cancelled,

    #[error("Agent stopped: {0}")]
    AgentStopped(String),

    #[error("Unsafe system prompt: {0}")]
    UnsafePrompt(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 配置错误：同步报告，不会让运行中的 Agent 崩溃
    Configuration,
    /// 协作方错误：模型、工具、文件存储失败
    Collaborator,
    /// 进程故障：由监管树重启恢复
    Process,
    /// 安全拒绝：作为普通工具错误返回
    Safety,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::ConfigError(_)
            | AgentError::DuplicateMiddleware(_)
            | AgentError::DuplicateTool(_)
            | AgentError::MiddlewareInit { .. }
            | AgentError::UnknownSubAgent(_)
            | AgentError::DecisionNotAllowed { .. }
            | AgentError::DecisionCountMismatch { .. }
            | AgentError::NoPendingInterrupt(_) => ErrorKind::Configuration,
            AgentError::LlmError(_)
            | AgentError::ToolExecutionFailed(_)
            | AgentError::ToolTimeout(_)
            | AgentError::StoreError(_)
            | AgentError::HookFailed { .. }
            | AgentError::RoundLimitExceeded(_)
            | AgentError::Cancelled => ErrorKind::Collaborator,
            AgentError::AgentStopped(_) => ErrorKind::Process,
            AgentError::UnsafePrompt(_) => ErrorKind::Safety,
        }
    }
}
