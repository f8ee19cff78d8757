use crate::actors::messages::*;
use crate::core::engine::{EngineError, GenerationParams, InferenceEngine, TokenSink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{channel, Receiver, Sender};

/// Handle to the actor that owns the inference engine.
///
/// The actor drains its mailbox one request at a time, so the mailbox is the
/// admission queue for every generation in the process.
#[derive(Clone)]
pub struct EngineActorHandle {
    sender: Sender<EngineMessage>,
    counters: Arc<EngineCounters>,
    next_request_id: Arc<AtomicU64>,
    engine_name: Arc<str>,
}

impl EngineActorHandle {
    pub fn new(engine: Arc<dyn InferenceEngine>, queue_capacity: usize) -> Self {
        let (sender, receiver) = channel(queue_capacity.max(1));
        let counters = Arc::new(EngineCounters::default());
        let engine_name: Arc<str> = Arc::from(engine.name());
        tokio::spawn(engine_actor(receiver, engine, counters.clone()));
        Self {
            sender,
            counters,
            next_request_id: Arc::new(AtomicU64::new(1)),
            engine_name,
        }
    }

    /// Queue a generation; waits while the mailbox is full.
    /// `Started` arrives on the returned receiver once the engine is ours.
    pub async fn submit(
        &self,
        prompt: String,
        params: GenerationParams,
        buffer: usize,
    ) -> Result<Receiver<EngineEvent>, EngineError> {
        let (events, receiver) = channel(buffer.max(1));
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        let request = GenerationRequest {
            request_id,
            prompt,
            params,
            events,
        };

        if let Err(e) = self.sender.send(EngineMessage::Generate(request)).await {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(EngineError::Unavailable(format!(
                "failed to send request to engine actor: {}",
                e
            )));
        }

        tracing::debug!("[EngineActor] Queued request {}", request_id);
        Ok(receiver)
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.sender
            .send(EngineMessage::Shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send shutdown to engine actor: {}", e))
    }
}

enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

async fn engine_actor(
    mut receiver: Receiver<EngineMessage>,
    engine: Arc<dyn InferenceEngine>,
    counters: Arc<EngineCounters>,
) {
    tracing::info!("[EngineActor] Started with engine '{}'", engine.name());

    while let Some(message) = receiver.recv().await {
        match message {
            EngineMessage::Generate(request) => {
                let outcome = run_generation(&engine, &request).await;
                counters.queued.fetch_sub(1, Ordering::Relaxed);
                let counter = match outcome {
                    Outcome::Completed => &counters.completed,
                    Outcome::Failed => &counters.failed,
                    Outcome::Cancelled => &counters.cancelled,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                // counters settle before the requester sees its channel close
                drop(request);
            }
            EngineMessage::Shutdown => {
                tracing::info!("[EngineActor] Received shutdown signal");
                break;
            }
        }
    }

    tracing::info!("[EngineActor] Stopped");
}

async fn run_generation(engine: &Arc<dyn InferenceEngine>, request: &GenerationRequest) -> Outcome {
    let request_id = request.request_id;
    let params = request.params;
    let events = &request.events;

    if events.send(EngineEvent::Started).await.is_err() {
        tracing::debug!("[EngineActor] Request {} abandoned while queued", request_id);
        return Outcome::Cancelled;
    }

    let task_engine = engine.clone();
    let prompt = request.prompt.clone();
    let mut sink = TokenSink::new(events.clone(), params.max_tokens);
    let mut generation = tokio::spawn(async move {
        let result = task_engine.generate(&prompt, &params, &mut sink).await;
        (result, sink.emitted())
    });

    let joined = tokio::select! {
        joined = &mut generation => joined,
        _ = events.closed() => {
            generation.abort();
            // the slot is only free once the engine has actually stopped
            let _ = generation.await;
            tracing::info!("[EngineActor] Request {} cancelled by consumer", request_id);
            return Outcome::Cancelled;
        }
    };

    match joined {
        Ok((Ok(()), emitted)) | Ok((Err(EngineError::TokenLimit), emitted)) => {
            tracing::info!(
                "[EngineActor] Request {} finished after {} fragments",
                request_id,
                emitted
            );
            if events.send(EngineEvent::Finished).await.is_err() {
                return Outcome::Cancelled;
            }
            Outcome::Completed
        }
        Ok((Err(EngineError::Cancelled), _)) => {
            tracing::info!("[EngineActor] Request {} cancelled by consumer", request_id);
            Outcome::Cancelled
        }
        Ok((Err(e), emitted)) => {
            tracing::error!(
                "[EngineActor] Request {} failed after {} fragments: {}",
                request_id,
                emitted,
                e
            );
            let _ = events.send(EngineEvent::Failed(e.to_string())).await;
            Outcome::Failed
        }
        Err(e) => {
            tracing::error!("[EngineActor] Request {} crashed the engine task: {}", request_id, e);
            let _ = events
                .send(EngineEvent::Failed("inference engine crashed".to_string()))
                .await;
            Outcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scripted::ScriptedEngine;
    use std::time::Duration;

    async fn collect(mut rx: Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_generation_event_order() {
        let handle = EngineActorHandle::new(Arc::new(ScriptedEngine::new(["Hi", " there"])), 4);
        let rx = handle
            .submit("prompt".into(), GenerationParams::default(), 8)
            .await
            .unwrap();

        assert_eq!(
            collect(rx).await,
            vec![
                EngineEvent::Started,
                EngineEvent::Token("Hi".into()),
                EngineEvent::Token(" there".into()),
                EngineEvent::Finished,
            ]
        );
    }

    #[tokio::test]
    async fn test_max_tokens_caps_fragments() {
        let handle = EngineActorHandle::new(Arc::new(ScriptedEngine::new(["a", "b", "c", "d"])), 4);
        let params = GenerationParams {
            max_tokens: 2,
            temperature: 0.0,
        };
        let rx = handle.submit("prompt".into(), params, 8).await.unwrap();

        let events = collect(rx).await;
        assert_eq!(events.len(), 4);
        assert_eq!(events.last(), Some(&EngineEvent::Finished));
    }

    #[tokio::test]
    async fn test_failure_is_reported() {
        let engine = ScriptedEngine::new(["a", "b"]).fail_after(1, "out of memory");
        let handle = EngineActorHandle::new(Arc::new(engine), 4);
        let rx = handle
            .submit("prompt".into(), GenerationParams::default(), 8)
            .await
            .unwrap();

        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(EngineEvent::Failed(msg)) if msg.contains("out of memory")));
        assert_eq!(handle.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_cancellation_releases_engine() {
        let slow = ScriptedEngine::new(["x"; 50]).with_delay(Duration::from_millis(20));
        let handle = EngineActorHandle::new(Arc::new(slow), 4);

        let mut first = handle
            .submit("one".into(), GenerationParams::default(), 1)
            .await
            .unwrap();
        assert_eq!(first.recv().await, Some(EngineEvent::Started));
        drop(first);

        let second = handle
            .submit("two".into(), GenerationParams { max_tokens: 1, temperature: 0.0 }, 8)
            .await
            .unwrap();
        let events = tokio::time::timeout(Duration::from_secs(2), collect(second))
            .await
            .unwrap();

        assert_eq!(events.last(), Some(&EngineEvent::Finished));
        let stats = handle.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.queued, 0);
    }
}
