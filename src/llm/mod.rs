//! LLM 层：模型客户端抽象、增量流组装与脚本化 Mock

pub mod mock;
pub mod stream;
pub mod traits;

pub use mock::{ModelRequest, ScriptStep, ScriptedModel};
pub use stream::assemble;
pub use traits::{DeltaStream, LlmClient, LlmError, MessageDelta, ModelResponse};
