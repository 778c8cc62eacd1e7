//! OpenAI chat completions protocol, shared by xAI and Perplexity.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    decode, endpoint, ensure_success, ChatMessage, ChatProvider, ChatRequest, Completion,
    EventStream, ProviderError, StreamEvent, TokenUsage,
};
use crate::catalogue::Provider;

pub struct OpenAiCompatible {
    provider: Provider,
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatible {
    pub fn new(
        provider: Provider,
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn completions_url(&self) -> String {
        endpoint(&self.base_url, "chat/completions")
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        let mut converted = TokenUsage::new(usage.prompt_tokens, usage.completion_tokens);
        if let Some(total) = usage.total_tokens {
            converted.total_tokens = total;
        }
        converted
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

fn chunk_events(data: &str) -> Vec<Result<StreamEvent, ProviderError>> {
    if data == "[DONE]" {
        return vec![Ok(StreamEvent::Done)];
    }

    let chunk: WireChunk = match decode(data) {
        Ok(chunk) => chunk,
        Err(error) => {
            tracing::debug!(error = %error, "skipping unparseable chat completion chunk");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content.filter(|text| !text.is_empty()) {
            events.push(Ok(StreamEvent::Delta(content)));
        }
    }
    if let Some(usage) = chunk.usage {
        events.push(Ok(StreamEvent::Usage(usage.into())));
    }
    events
}

#[async_trait]
impl ChatProvider for OpenAiCompatible {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&WireRequest::from_request(request, false))
            .send()
            .await?;
        let response = ensure_success(self.provider, response).await?;

        let body: WireResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Decode(error.to_string()))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(Completion {
            content,
            usage: body.usage.map(Into::into),
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&WireRequest::from_request(request, true))
            .send()
            .await
            .map_err(|error| {
                tracing::error!(provider = %self.provider, error = %error, "upstream stream request failed");
                ProviderError::from(error)
            })?;
        let response = ensure_success(self.provider, response).await?;

        let events = response
            .bytes_stream()
            .eventsource()
            .map(|result| match result {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        Vec::new()
                    } else {
                        chunk_events(data)
                    }
                }
                Err(error) => vec![Err(ProviderError::Stream(error.to_string()))],
            })
            .flat_map(stream::iter);

        Ok(Box::pin(events))
    }

    async fn validate_key(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(endpoint(&self.base_url, "models"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        ensure_success(self.provider, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_marker_ends_stream() {
        let events = chunk_events("[DONE]");
        assert!(matches!(events.as_slice(), [Ok(StreamEvent::Done)]));
    }

    #[test]
    fn chunk_with_delta_and_usage_yields_both() {
        let events = chunk_events(
            r#"{"choices":[{"delta":{"content":"Hi"}}],"usage":{"prompt_tokens":3,"completion_tokens":1,"total_tokens":4}}"#,
        );
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Ok(StreamEvent::Delta(text)) if text == "Hi"));
        assert!(matches!(&events[1], Ok(StreamEvent::Usage(usage)) if usage.total_tokens == 4));
    }

    #[test]
    fn role_only_and_garbage_chunks_are_skipped() {
        assert!(chunk_events(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_empty());
        assert!(chunk_events("not json").is_empty());
    }

    #[test]
    fn stream_request_asks_for_usage() {
        let request = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            max_tokens: 16,
            temperature: 0.5,
        };
        let body = serde_json::to_value(WireRequest::from_request(&request, true)).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);

        let body = serde_json::to_value(WireRequest::from_request(&request, false)).unwrap();
        assert!(body.get("stream").is_none());
        assert!(body.get("stream_options").is_none());
    }
}
