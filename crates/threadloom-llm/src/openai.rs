use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use threadloom_core::config::ProviderConfig;
use threadloom_core::error::{Result, ThreadloomError};
use threadloom_core::traits::ChatBackend;
use threadloom_core::types::{ChatMessage, ChatRequest};

use crate::streaming::{SseEvent, SseItem, SseStream};

/// OpenAI-compatible chat client. Works with OpenAI, Ollama, vLLM,
/// OpenRouter and anything else serving `/chat/completions`.
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ThreadloomError::ProviderError(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

/// What one SSE event means for the text stream.
#[derive(Debug, PartialEq)]
enum Parsed {
    Text(String),
    Skip,
    Done,
    Failed(String),
}

fn parse_event(event: &SseEvent) -> Parsed {
    let data = event.data.trim();
    if data == "[DONE]" {
        return Parsed::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return Parsed::Failed(error.message);
            }
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta)
                .and_then(|d| d.content)
                .filter(|text| !text.is_empty())
                .map(Parsed::Text)
                .unwrap_or(Parsed::Skip)
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse completion chunk");
            Parsed::Skip
        }
    }
}

impl ChatBackend for OpenAiClient {
    fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<String>>>> {
        Box::pin(async move {
            let body = CompletionRequest {
                model: &request.model,
                messages: &request.messages,
                stream: true,
            };
            let mut req = self.http.post(&self.endpoint).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            debug!(model = %request.model, messages = request.messages.len(), "Opening completion stream");
            let response = req
                .send()
                .await
                .map_err(|e| ThreadloomError::ProviderError(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(ThreadloomError::ProviderError(format!("HTTP {status}: {body}")));
            }

            let deltas = SseStream::new(response.bytes_stream())
                .map(|item| match item {
                    SseItem::Event(event) => parse_event(&event),
                    SseItem::Failed(e) => Parsed::Failed(e),
                })
                .take_while(|parsed| futures::future::ready(*parsed != Parsed::Done))
                .filter_map(|parsed| async move {
                    match parsed {
                        Parsed::Text(text) => Some(Ok(text)),
                        Parsed::Failed(e) => Some(Err(ThreadloomError::ProviderError(e))),
                        Parsed::Skip | Parsed::Done => None,
                    }
                });

            // Nothing follows a failure.
            let mut failed = false;
            let deltas = deltas.take_while(move |item| {
                let keep = !failed;
                failed |= item.is_err();
                futures::future::ready(keep)
            });

            Ok(deltas.boxed())
        })
    }
}
