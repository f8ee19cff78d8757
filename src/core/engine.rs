//! Inference Engine Contract
//!
//! Information Hiding:
//! - Engines only see a prompt, generation parameters and a sink
//! - The sink enforces the fragment budget and notices departed consumers
//! - Transport and model details stay inside each engine implementation

use crate::actors::messages::EngineEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Upper bound on the number of fragments produced
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Request(String),

    #[error("engine returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode engine output: {0}")]
    Decode(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("consumer went away")]
    Cancelled,

    #[error("fragment limit reached")]
    TokenLimit,

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("consumer went away")]
    Closed,

    #[error("fragment limit reached")]
    Exhausted,
}

impl From<SinkError> for EngineError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Closed => EngineError::Cancelled,
            SinkError::Exhausted => EngineError::TokenLimit,
        }
    }
}

/// Destination for the fragments of one generation
pub struct TokenSink {
    events: mpsc::Sender<EngineEvent>,
    emitted: u32,
    limit: u32,
}

impl TokenSink {
    pub fn new(events: mpsc::Sender<EngineEvent>, limit: u32) -> Self {
        Self {
            events,
            emitted: 0,
            limit,
        }
    }

    /// Forward one fragment, waiting while the consumer is behind.
    /// Empty fragments are skipped.
    pub async fn send(&mut self, fragment: impl Into<String>) -> Result<(), SinkError> {
        if self.emitted >= self.limit {
            return Err(SinkError::Exhausted);
        }

        let fragment = fragment.into();
        if fragment.is_empty() {
            return Ok(());
        }

        self.events
            .send(EngineEvent::Token(fragment))
            .await
            .map_err(|_| SinkError::Closed)?;
        self.emitted += 1;
        Ok(())
    }

    pub fn emitted(&self) -> u32 {
        self.emitted
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// A text-generation backend. Implementations may assume they are never
/// asked to run two generations at once.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Stream fragments for `prompt` into `sink` until the model stops,
    /// the sink refuses more, or an error occurs.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<(), EngineError>;
}
