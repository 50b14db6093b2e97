pub mod context_injector;
pub mod demux;
pub mod lorebook_matcher;
pub mod lorebook_source;
pub mod macros;
pub mod prompt_normalizer;
pub mod request_builder;
pub mod service;
pub mod sse;
pub mod stopping;
pub mod stream;
pub mod tooling;
pub mod types;

pub use service::{ChatPipeline, PreparedPrompt};
pub use stream::{StreamControl, StreamEvent, StreamFailure, StreamHandle};
