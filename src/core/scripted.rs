//! Deterministic engine that replays a fixed list of fragments.
//! Backs the `mock` engine backend and the test suite.

use super::engine::{EngineError, GenerationParams, InferenceEngine, TokenSink};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

pub struct ScriptedEngine {
    fragments: Vec<String>,
    delay: Option<Duration>,
    failure: Option<(usize, String)>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            delay: None,
            failure: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Split a reply on spaces, keeping the leading space on every word after
    /// the first, the way tokenizers usually emit text.
    pub fn from_reply(reply: &str) -> Self {
        let mut fragments = Vec::new();
        for (i, word) in reply.split(' ').enumerate() {
            if i == 0 {
                fragments.push(word.to_string());
            } else {
                fragments.push(format!(" {}", word));
            }
        }
        Self::new(fragments)
    }

    /// Pause before every fragment
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail with `message` once `after` fragments were produced
    pub fn fail_after(mut self, after: usize, message: impl Into<String>) -> Self {
        self.failure = Some((after, message.into()));
        self
    }

    /// Every prompt this engine was asked to complete, oldest first
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<(), EngineError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        for (i, fragment) in self.fragments.iter().enumerate() {
            if let Some((after, message)) = &self.failure {
                if i == *after {
                    return Err(EngineError::Generation(message.clone()));
                }
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            sink.send(fragment.as_str()).await?;
        }

        match &self.failure {
            Some((after, message)) if *after >= self.fragments.len() => {
                Err(EngineError::Generation(message.clone()))
            }
            _ => Ok(()),
        }
    }
}
