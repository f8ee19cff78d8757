pub mod engine;
pub mod http_engine;
pub mod pipeline;
pub mod prompt;
pub mod scripted;

pub use engine::{EngineError, GenerationParams, InferenceEngine, TokenSink};
pub use http_engine::HttpEngine;
pub use scripted::ScriptedEngine;
