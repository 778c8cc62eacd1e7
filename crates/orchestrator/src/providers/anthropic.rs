//! Anthropic Messages API.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{stream, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use super::{
    decode, endpoint, ensure_success, ChatProvider, ChatRequest, ChatRole, Completion,
    EventStream, ProviderError, StreamEvent, TokenUsage,
};
use crate::catalogue::Provider;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn authorised(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> WireRequest<'a> {
    /// System turns travel in the top-level `system` field.
    fn from_request(request: &'a ChatRequest, stream: bool) -> Self {
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|message| message.role == ChatRole::System)
            .map(|message| message.content.as_str())
            .collect();

        let messages = request
            .messages
            .iter()
            .filter(|message| message.role != ChatRole::System)
            .map(|message| WireMessage {
                role: message.role.as_str(),
                content: &message.content,
            })
            .collect();

        Self {
            model: &request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages,
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            stream,
        }
    }
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireContentBlock>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireStartMessage,
    },
    ContentBlockDelta {
        delta: WireDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: WireUsage,
    },
    MessageStop,
    Error {
        error: WireErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireStartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireErrorBody {
    message: String,
}

/// Input tokens arrive with `message_start`, output tokens with `message_delta`.
#[derive(Default)]
struct StreamState {
    input_tokens: u64,
}

impl StreamState {
    fn events(&mut self, data: &str) -> Vec<Result<StreamEvent, ProviderError>> {
        let event: WireEvent = match decode(data) {
            Ok(event) => event,
            Err(error) => {
                tracing::debug!(error = %error, "skipping unparseable Anthropic SSE event");
                return Vec::new();
            }
        };

        match event {
            WireEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                Vec::new()
            }
            WireEvent::ContentBlockDelta { delta } => delta
                .text
                .filter(|text| !text.is_empty())
                .map(|text| vec![Ok(StreamEvent::Delta(text))])
                .unwrap_or_default(),
            WireEvent::MessageDelta { usage } => vec![Ok(StreamEvent::Usage(TokenUsage::new(
                self.input_tokens,
                usage.output_tokens,
            )))],
            WireEvent::MessageStop => vec![Ok(StreamEvent::Done)],
            WireEvent::Error { error } => vec![Err(ProviderError::Upstream(error.message))],
            WireEvent::Other => Vec::new(),
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let response = self
            .authorised(self.client.post(endpoint(&self.base_url, "messages")))
            .json(&WireRequest::from_request(request, false))
            .send()
            .await?;
        let response = ensure_success(Provider::Anthropic, response).await?;

        let body: WireResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Decode(error.to_string()))?;

        let content = body
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<String>();

        Ok(Completion {
            content,
            usage: body
                .usage
                .map(|usage| TokenUsage::new(usage.input_tokens, usage.output_tokens)),
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .authorised(self.client.post(endpoint(&self.base_url, "messages")))
            .json(&WireRequest::from_request(request, true))
            .send()
            .await
            .map_err(|error| {
                tracing::error!(provider = "anthropic", error = %error, "upstream stream request failed");
                ProviderError::from(error)
            })?;
        let response = ensure_success(Provider::Anthropic, response).await?;

        let mut state = StreamState::default();
        let events = response
            .bytes_stream()
            .eventsource()
            .map(move |result| match result {
                Ok(event) => {
                    let data = event.data.trim();
                    if data.is_empty() {
                        Vec::new()
                    } else {
                        state.events(data)
                    }
                }
                Err(error) => vec![Err(ProviderError::Stream(error.to_string()))],
            })
            .flat_map(stream::iter);

        Ok(Box::pin(events))
    }

    async fn validate_key(&self) -> Result<(), ProviderError> {
        let response = self
            .authorised(self.client.get(endpoint(&self.base_url, "models")))
            .send()
            .await?;
        ensure_success(Provider::Anthropic, response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;

    #[test]
    fn system_messages_are_lifted() {
        let request = ChatRequest {
            model: "claude-3-5-haiku-20241022".into(),
            messages: vec![
                ChatMessage::new(ChatRole::System, "Be brief."),
                ChatMessage::new(ChatRole::User, "Hi"),
                ChatMessage::new(ChatRole::Assistant, "Hello"),
            ],
            max_tokens: 64,
            temperature: 0.2,
        };

        let body = serde_json::to_value(WireRequest::from_request(&request, true)).unwrap();
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn stream_state_combines_usage_from_start_and_delta() {
        let mut state = StreamState::default();
        assert!(state
            .events(r#"{"type":"message_start","message":{"usage":{"input_tokens":11}}}"#)
            .is_empty());

        let delta = state.events(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hey"}}"#,
        );
        assert!(matches!(delta.as_slice(), [Ok(StreamEvent::Delta(text))] if text == "Hey"));

        let usage = state.events(r#"{"type":"message_delta","usage":{"output_tokens":5}}"#);
        assert!(matches!(
            usage.as_slice(),
            [Ok(StreamEvent::Usage(TokenUsage { prompt_tokens: 11, completion_tokens: 5, total_tokens: 16 }))]
        ));

        assert!(matches!(
            state.events(r#"{"type":"message_stop"}"#).as_slice(),
            [Ok(StreamEvent::Done)]
        ));
        assert!(state.events(r#"{"type":"ping"}"#).is_empty());
    }

    #[test]
    fn error_events_surface_upstream_message() {
        let mut state = StreamState::default();
        let events = state.events(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#);
        assert!(matches!(events.as_slice(), [Err(ProviderError::Upstream(message))] if message == "Overloaded"));
    }
}
