use crate::core::engine::GenerationParams;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Progress of one generation as seen by the requester
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The request left the admission queue and owns the engine
    Started,
    Token(String),
    /// The engine stopped normally or hit the fragment limit
    Finished,
    Failed(String),
}

#[derive(Debug)]
pub struct GenerationRequest {
    pub request_id: u64,
    pub prompt: String,
    pub params: GenerationParams,
    pub events: mpsc::Sender<EngineEvent>,
}

#[derive(Debug)]
pub enum EngineMessage {
    Generate(GenerationRequest),
    Shutdown,
}

/// Counters shared between the engine actor and its handles
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub queued: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl EngineCounters {
    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            queued: self.queued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Requests waiting for or holding the engine
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}
