//! Streaming Pipeline
//!
//! Information Hiding:
//! - One spawned task per request; callers only see a stream of events
//! - The session lease is held for the whole request, so requests for one
//!   session run one after another while other sessions proceed
//! - The engine actor's mailbox serializes generations across all sessions
//!
//! Suspension points: waiting for the session lease, waiting for a slot in
//! the engine queue, waiting for the next engine event and waiting for the
//! caller to accept a fragment. Any other request may run at each of them.

use crate::actors::engine_actor::EngineActorHandle;
use crate::actors::messages::EngineEvent;
use crate::core::engine::GenerationParams;
use crate::core::prompt::PromptBuilder;
use crate::storage::{SessionStore, Turn};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub session_id: String,
    pub prompt: String,
    pub params: GenerationParams,
    /// Clear the session's history before this turn
    pub new_context: bool,
}

/// What the caller of [`StreamingPipeline::handle`] receives
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Token(String),
    /// Generation completed and the reply was committed to the session
    Done { fragments: u32, reply_chars: usize },
    /// Generation failed or timed out; nothing was committed for the reply
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub system_prompt: String,
    pub max_prompt_chars: Option<usize>,
    /// Bound on waiting for the engine to pick the request up
    pub queue_timeout: Duration,
    /// Bound on the gap between two engine events
    pub fragment_timeout: Duration,
    pub buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            system_prompt: crate::config::DEFAULT_SYSTEM_PROMPT.to_string(),
            max_prompt_chars: None,
            queue_timeout: Duration::from_secs(300),
            fragment_timeout: Duration::from_secs(60),
            buffer: 16,
        }
    }
}

enum Abort {
    Cancelled,
    Failed(String),
}

#[derive(Clone)]
pub struct StreamingPipeline {
    store: Arc<SessionStore>,
    engine: EngineActorHandle,
    config: Arc<PipelineConfig>,
}

impl StreamingPipeline {
    pub fn new(store: Arc<SessionStore>, engine: EngineActorHandle, config: PipelineConfig) -> Self {
        Self {
            store,
            engine,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn engine(&self) -> &EngineActorHandle {
        &self.engine
    }

    /// Start serving one request. Fragments arrive as they are generated.
    /// Dropping the returned stream cancels the request; the reply is then
    /// not committed.
    pub fn handle(&self, request: GenerateRequest) -> ReceiverStream<StreamEvent> {
        let (out, rx) = mpsc::channel(self.config.buffer.max(1));
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(request, out).await });
        ReceiverStream::new(rx)
    }

    async fn run(self, request: GenerateRequest, out: Sender<StreamEvent>) {
        let GenerateRequest {
            session_id,
            prompt,
            params,
            new_context,
        } = request;

        let handle = self.store.get_or_create(&session_id).await;
        let lease = tokio::select! {
            _ = out.closed() => None,
            lease = handle.lease() => Some(lease),
        };
        // a caller that left while queued on the session leaves no trace
        let Some(lease) = lease.filter(|_| !out.is_closed()) else {
            tracing::info!(
                "[Pipeline] Session '{}': caller went away before the turn started",
                session_id
            );
            return;
        };

        if new_context {
            lease.reset().await;
        }
        lease.append(Turn::user(prompt)).await;

        let history = lease.snapshot().await;
        let wrapped = PromptBuilder::build_within(
            &self.config.system_prompt,
            &history,
            self.config.max_prompt_chars,
        );

        tracing::info!(
            "[Pipeline] Session '{}': generating with {} turns of history ({} prompt chars)",
            session_id,
            history.len(),
            wrapped.len()
        );

        match self.generate(wrapped, params, &out).await {
            Ok((reply, fragments)) => {
                let reply_chars = reply.chars().count();
                lease.append(Turn::assistant(reply)).await;
                tracing::info!(
                    "[Pipeline] Session '{}': committed reply ({} fragments)",
                    session_id,
                    fragments
                );
                let _ = out
                    .send(StreamEvent::Done {
                        fragments,
                        reply_chars,
                    })
                    .await;
            }
            Err(Abort::Cancelled) => {
                tracing::info!(
                    "[Pipeline] Session '{}': caller went away, reply discarded",
                    session_id
                );
            }
            Err(Abort::Failed(message)) => {
                tracing::warn!("[Pipeline] Session '{}': {}", session_id, message);
                let _ = out.send(StreamEvent::Error(message)).await;
            }
        }
    }

    /// Drive one generation, forwarding fragments to `out`.
    /// Returns the accumulated reply and its fragment count.
    async fn generate(
        &self,
        prompt: String,
        params: GenerationParams,
        out: &Sender<StreamEvent>,
    ) -> Result<(String, u32), Abort> {
        let submitted = tokio::select! {
            _ = out.closed() => return Err(Abort::Cancelled),
            submitted = timeout(
                self.config.queue_timeout,
                self.engine.submit(prompt, params, self.config.buffer),
            ) => submitted,
        };
        let mut events = match submitted {
            Ok(Ok(events)) => events,
            Ok(Err(e)) => return Err(Abort::Failed(e.to_string())),
            Err(_) => return Err(Abort::Failed("engine queue is full".to_string())),
        };

        match next_event(&mut events, out, self.config.queue_timeout).await? {
            EngineEvent::Started => {}
            EngineEvent::Failed(message) => return Err(Abort::Failed(message)),
            other => {
                return Err(Abort::Failed(format!(
                    "engine sent {:?} before starting",
                    other
                )))
            }
        }

        let mut reply = String::new();
        let mut fragments = 0u32;

        loop {
            match next_event(&mut events, out, self.config.fragment_timeout).await? {
                EngineEvent::Token(text) => {
                    reply.push_str(&text);
                    fragments += 1;
                    out.send(StreamEvent::Token(text))
                        .await
                        .map_err(|_| Abort::Cancelled)?;
                }
                EngineEvent::Finished => return Ok((reply, fragments)),
                EngineEvent::Failed(message) => return Err(Abort::Failed(message)),
                EngineEvent::Started => {}
            }
        }
    }
}

async fn next_event(
    events: &mut Receiver<EngineEvent>,
    out: &Sender<StreamEvent>,
    wait: Duration,
) -> Result<EngineEvent, Abort> {
    tokio::select! {
        _ = out.closed() => Err(Abort::Cancelled),
        received = timeout(wait, events.recv()) => match received {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(Abort::Failed("engine stopped before finishing".to_string())),
            Err(_) => Err(Abort::Failed(format!("engine timed out after {:?}", wait))),
        },
    }
}
