use super::engine::{EngineError, GenerationParams, InferenceEngine, TokenSink};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "no_stop")]
    stop: &'a [String],
}

fn no_stop(stop: &&[String]) -> bool {
    stop.is_empty()
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: Option<String>,
}

/// Streaming client for an OpenAI-compatible `/v1/completions` endpoint,
/// such as a llama.cpp server hosting a local GGUF model.
pub struct HttpEngine {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    stop: Vec<String>,
}

impl HttpEngine {
    pub fn new(base_url: &str, model: impl Into<String>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: None,
            stop: Vec::new(),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    /// Handle one SSE line. Returns false once the stream signalled `[DONE]`.
    async fn handle_line(&self, line: &str, sink: &mut TokenSink) -> Result<bool, EngineError> {
        let Some(payload) = line.strip_prefix("data:") else {
            return Ok(true);
        };
        let payload = payload.trim();
        if payload == "[DONE]" {
            return Ok(false);
        }
        if payload.is_empty() {
            return Ok(true);
        }

        let chunk: CompletionChunk =
            serde_json::from_str(payload).map_err(|e| EngineError::Decode(e.to_string()))?;
        if let Some(text) = chunk.choices.into_iter().next().and_then(|c| c.text) {
            sink.send(text).await?;
        }
        Ok(true)
    }
}

#[async_trait]
impl InferenceEngine for HttpEngine {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<(), EngineError> {
        let request = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream: true,
            stop: &self.stop,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| EngineError::Request(e.to_string()))?;
            buffer.extend_from_slice(&bytes);

            // only complete lines; a multi-byte character may straddle chunks
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if !self.handle_line(line.trim_end(), sink).await? {
                    return Ok(());
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer).into_owned();
        self.handle_line(rest.trim_end(), sink).await?;
        Ok(())
    }
}
