//! Chat-completions client.
//!
//! [`ChatProvider`] is the seam the agent loop and the compactor talk to;
//! [`OpenAiClient`] implements it against any endpoint that speaks the
//! `/chat/completions` protocol (blocking JSON and `data:`-framed streaming).

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use super::retry::RetryPolicy;
use super::stream::{SseDecoder, SseEvent, StreamAccumulator, StreamChunk, decode_frame};
use super::types::{ChatCompletion, ChatRequestBody, Message, WireMessage, WireTool};
use crate::error::ProviderError;
use crate::tools::ToolDefinition;

/// Minimal chat contract needed to drive the agent loop.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Blocking request; returns the assistant message.
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Message, ProviderError>;

    /// Streaming request. Every decoded chunk is handed to `on_chunk` as it
    /// arrives; the accumulated assistant message is returned at the end.
    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'c> FnMut(&'c StreamChunk) + Send),
    ) -> Result<Message, ProviderError>;
}

/// Connection settings for [`OpenAiClient`].
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    settings: ProviderSettings,
}

/// A failed streaming attempt, remembering whether the observer had already
/// seen output (in which case a retry would duplicate it).
struct StreamFailure {
    error: ProviderError,
    emitted: bool,
}

impl OpenAiClient {
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))?;
        let endpoint = format!("{}/chat/completions", settings.base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            endpoint,
            settings,
        })
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn body<'a>(
        &'a self,
        messages: &[Message],
        tools: &'a [ToolDefinition],
        stream: bool,
    ) -> ChatRequestBody<'a> {
        ChatRequestBody {
            model: &self.settings.model,
            messages: messages.iter().map(WireMessage::from).collect(),
            tools: tools.iter().map(WireTool::from).collect(),
            stream,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        }
    }

    /// Send the request and map a non-2xx status to a typed error.
    async fn send(
        &self,
        body: &ChatRequestBody<'_>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ProviderError> {
        let request = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.settings.api_key)
            .json(body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            res = request => res?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), text))
    }

    /// The callback's trait-object lifetime is separate from the borrow so
    /// each retry attempt can reborrow it.
    async fn stream_once<'f>(
        &self,
        body: &ChatRequestBody<'_>,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn FnMut(&StreamChunk) + Send + 'f),
    ) -> Result<Message, StreamFailure> {
        let not_emitted = |error| StreamFailure {
            error,
            emitted: false,
        };
        let response = self.send(body, cancel).await.map_err(not_emitted)?;

        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut accumulator = StreamAccumulator::new();
        let mut emitted = false;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(StreamFailure { error: ProviderError::Cancelled, emitted });
                }
                next = bytes.next() => next,
            };

            let at_eof = next.is_none();
            let events = match next {
                Some(Ok(chunk)) => decoder.feed(&chunk),
                Some(Err(e)) => {
                    return Err(StreamFailure {
                        error: e.into(),
                        emitted,
                    });
                }
                None => decoder.finish().into_iter().collect(),
            };

            for event in events {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(payload) => match decode_frame(&payload) {
                        Some(chunks) => {
                            for chunk in chunks {
                                accumulator.apply(&chunk);
                                on_chunk(&chunk);
                                emitted = true;
                            }
                        }
                        None => {
                            tracing::warn!(payload = %payload, "Dropping malformed stream frame");
                        }
                    },
                }
            }

            if at_eof {
                break;
            }
        }

        Ok(accumulator.into_message())
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn chat(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> Result<Message, ProviderError> {
        let body = self.body(messages, tools, false);
        let body = &body;
        self.settings
            .retry
            .run(cancel, move |_| async move {
                let response = self.send(body, cancel).await?;
                // A body that breaks off mid-read is a transport failure and stays retryable.
                let bytes = tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    bytes = response.bytes() => bytes?,
                };
                let completion: ChatCompletion =
                    serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))?;
                completion
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| Message::from(choice.message))
                    .ok_or_else(|| ProviderError::Decode("response has no choices".into()))
            })
            .await
    }

    async fn chat_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'c> FnMut(&'c StreamChunk) + Send),
    ) -> Result<Message, ProviderError> {
        let body = self.body(messages, tools, true);
        let retry = self.settings.retry;
        let mut attempt = 0;
        loop {
            let failure = match self.stream_once(&body, cancel, &mut *on_chunk).await {
                Ok(message) => return Ok(message),
                Err(failure) => failure,
            };
            if failure.emitted || !retry.should_retry(&failure.error, attempt) {
                return Err(failure.error);
            }
            tracing::warn!(
                attempt = attempt + 1,
                max_retries = retry.max_retries,
                error = %failure.error,
                "Stream request failed before any output, retrying"
            );
            retry.backoff(attempt, cancel).await?;
            attempt += 1;
        }
    }
}
