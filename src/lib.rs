//! Chatgate - streaming conversational inference gateway
//!
//! Keeps the conversation history of every session, turns it into a
//! role-tagged prompt and streams the engine's reply back fragment by
//! fragment, committing it to the session once generation completes.

pub mod actors;
pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod storage;
pub mod utils;

pub use api::{build_router, AppState, RequestLimits};
pub use crate::config::Settings;
pub use crate::core::pipeline::{GenerateRequest, PipelineConfig, StreamEvent, StreamingPipeline};
pub use error::GatewayError;
pub use storage::{Role, SessionStore, Turn};

use actors::EngineActorHandle;
use crate::config::EngineBackend;
use crate::core::{HttpEngine, InferenceEngine, ScriptedEngine};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A running gateway: session store, engine actor and pipeline
pub struct Gateway {
    settings: Settings,
    pipeline: StreamingPipeline,
    sweeper: Option<JoinHandle<()>>,
}

impl Gateway {
    /// Build the engine named by `settings.engine.backend` and start
    pub fn from_settings(settings: Settings) -> Result<Self, GatewayError> {
        let engine = build_engine(&settings)?;
        Ok(Self::new(engine, settings))
    }

    /// Start with an explicit engine
    pub fn new(engine: Arc<dyn InferenceEngine>, settings: Settings) -> Self {
        let store = Arc::new(SessionStore::new());
        let engine = EngineActorHandle::new(engine, settings.engine.queue_capacity);
        let pipeline = StreamingPipeline::new(
            store.clone(),
            engine,
            PipelineConfig {
                system_prompt: settings.prompt.system_prompt.clone(),
                max_prompt_chars: settings.max_prompt_chars(),
                queue_timeout: Duration::from_secs(settings.engine.queue_timeout_secs),
                fragment_timeout: Duration::from_secs(settings.engine.fragment_timeout_secs),
                ..PipelineConfig::default()
            },
        );

        let sweeper = match settings.session.idle_ttl_secs {
            0 => None,
            ttl => Some(spawn_sweeper(
                store,
                Duration::from_secs(ttl),
                Duration::from_secs(settings.session.sweep_interval_secs.max(1)),
            )),
        };

        tracing::info!("Chatgate initialized");
        Self {
            settings,
            pipeline,
            sweeper,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pipeline(&self) -> &StreamingPipeline {
        &self.pipeline
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        self.pipeline.store()
    }

    pub fn router(&self) -> axum::Router {
        let state = AppState {
            pipeline: self.pipeline.clone(),
            limits: RequestLimits::from_settings(&self.settings),
        };
        build_router(state, self.settings.server.cors_permissive)
    }

    /// Run one request to completion, handing each fragment to `on_fragment`.
    /// Returns the reply length in characters; an engine failure or timeout
    /// comes back as [`GatewayError::Generation`].
    pub async fn stream_reply<F>(
        &self,
        request: GenerateRequest,
        mut on_fragment: F,
    ) -> Result<usize, GatewayError>
    where
        F: FnMut(&str),
    {
        let mut events = self.pipeline.handle(request);
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Token(token) => on_fragment(&token),
                StreamEvent::Done { reply_chars, .. } => return Ok(reply_chars),
                StreamEvent::Error(message) => return Err(GatewayError::Generation(message)),
            }
        }
        Err(GatewayError::Generation(
            "stream ended without a result".to_string(),
        ))
    }

    /// Serve HTTP until Ctrl+C
    pub async fn serve(&self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.settings.server.host, self.settings.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;
        Ok(())
    }

    /// Stop the sweeper and the engine actor
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if let Some(sweeper) = self.sweeper {
            sweeper.abort();
        }
        self.pipeline.engine().shutdown().await?;
        tracing::info!("Chatgate shutdown complete");
        Ok(())
    }
}

fn build_engine(settings: &Settings) -> Result<Arc<dyn InferenceEngine>, GatewayError> {
    let engine: Arc<dyn InferenceEngine> = match settings.engine.backend {
        EngineBackend::Http => {
            let engine = HttpEngine::new(
                &settings.engine.base_url,
                settings.engine.model.clone(),
                Duration::from_secs(settings.engine.connect_timeout_secs),
            )
            .map_err(|e| GatewayError::EngineSetup(e.to_string()))?
            .with_api_key(Settings::api_key())
            .with_stop(vec![crate::core::prompt::STOP_SEQUENCE.to_string()]);
            Arc::new(engine)
        }
        EngineBackend::Mock => Arc::new(ScriptedEngine::from_reply(&settings.engine.mock_reply)),
    };

    tracing::info!(
        "Using {:?} engine backend ({})",
        settings.engine.backend,
        engine.name()
    );
    Ok(engine)
}

fn spawn_sweeper(store: Arc<SessionStore>, ttl: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let removed = store.prune_idle(ttl).await;
            if removed > 0 {
                tracing::info!("[Sweeper] Evicted {} idle sessions", removed);
            }
        }
    })
}
