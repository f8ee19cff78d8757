//! HTTP transport
//!
//! `POST /generate-stream` answers with server-sent events: one unnamed event
//! per fragment carrying `{"token": ...}`, then a terminal `done` or `error`
//! event.

use crate::config::Settings;
use crate::core::engine::GenerationParams;
use crate::core::pipeline::{GenerateRequest, StreamEvent, StreamingPipeline};
use crate::error::GatewayError;
use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Defaults and bounds applied to incoming requests
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub default_max_tokens: u32,
    pub default_temperature: f32,
    pub max_tokens_limit: u32,
}

impl RequestLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_max_tokens: settings.generation.default_max_tokens,
            default_temperature: settings.generation.default_temperature,
            max_tokens_limit: settings.generation.max_tokens_limit,
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: StreamingPipeline,
    pub limits: RequestLimits,
}

#[derive(Debug, Deserialize)]
pub struct GenerateStreamBody {
    pub session_id: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub new_context: bool,
}

impl GenerateStreamBody {
    pub fn into_request(self, limits: &RequestLimits) -> Result<GenerateRequest, GatewayError> {
        if self.session_id.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "session_id must not be empty".to_string(),
            ));
        }

        let max_tokens = self.max_tokens.unwrap_or(limits.default_max_tokens);
        if max_tokens == 0 || max_tokens > limits.max_tokens_limit {
            return Err(GatewayError::InvalidRequest(format!(
                "max_tokens must be between 1 and {}",
                limits.max_tokens_limit
            )));
        }

        let temperature = self.temperature.unwrap_or(limits.default_temperature);
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(GatewayError::InvalidRequest(
                "temperature must be a non-negative number".to_string(),
            ));
        }

        Ok(GenerateRequest {
            session_id: self.session_id,
            prompt: self.prompt,
            params: GenerationParams {
                max_tokens,
                temperature,
            },
            new_context: self.new_context,
        })
    }
}

/// Build the application router.
pub fn build_router(state: AppState, cors_permissive: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/generate-stream", post(generate_stream))
        .route("/sessions/:id", get(session_history))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if cors_permissive {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.pipeline.engine();
    Json(json!({
        "status": "healthy",
        "service": "chatgate",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": engine.engine_name(),
        "engine_stats": engine.stats(),
        "sessions": state.pipeline.store().session_count().await,
    }))
}

async fn generate_stream(
    State(state): State<AppState>,
    Json(body): Json<GenerateStreamBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let request = body.into_request(&state.limits)?;
    tracing::debug!("[Api] Streaming generation for session '{}'", request.session_id);

    let stream = state
        .pipeline
        .handle(request)
        .map(|event| Ok(sse_event(event)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn session_history(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let turns = state.pipeline.store().history(&session_id).await;
    Json(json!({
        "session_id": session_id,
        "turns": turns,
    }))
}

fn sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Token(token) => Event::default().data(json!({ "token": token }).to_string()),
        StreamEvent::Done {
            fragments,
            reply_chars,
        } => Event::default().event("done").data(
            json!({ "fragments": fragments, "reply_chars": reply_chars }).to_string(),
        ),
        StreamEvent::Error(message) => Event::default()
            .event("error")
            .data(json!({ "error": message }).to_string()),
    }
}
