//! 核心层：错误分类、会话状态、会话监管、任务调度、优雅关闭

pub mod error;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::{AgentError, ErrorKind};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{
    FileStoreCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    SubAgentPoolCleanup,
};
pub use state::{Extensions, State, StateDelta, Todo, TodoStatus};
pub use task_scheduler::TaskScheduler;
