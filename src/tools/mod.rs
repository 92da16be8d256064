//! 工具箱：Tool trait、注册表、执行器与内置工具

pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::{CallOutcome, ToolExecutor};
pub use registry::{Tool, ToolContext, ToolOutput, ToolRegistry, ToolSpec};
