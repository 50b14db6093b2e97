pub mod abort_manager;
pub mod chat_manager;
pub mod config;
pub mod error;
pub mod logger;
pub mod serde_utils;
pub mod transport;

pub use chat_manager::tooling::{ToolCall, ToolDispatcher};
pub use chat_manager::types::{ChatRequest, CompletionResult, Message, ProcessingMode, Role};
pub use chat_manager::{ChatPipeline, StreamEvent, StreamFailure, StreamHandle};
pub use config::EngineConfig;
pub use error::{AppError, AppResult};
