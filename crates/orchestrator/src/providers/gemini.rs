//! Google Generative Language API.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    decode, endpoint, ensure_success, ChatProvider, ChatRequest, ChatRole, Completion,
    EventStream, ProviderError, StreamEvent, TokenUsage,
};
use crate::catalogue::Provider;

pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        endpoint(&self.base_url, &format!("models/{model}:{method}"))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

impl<'a> WireRequest<'a> {
    fn from_request(request: &'a ChatRequest) -> Self {
        let system_parts: Vec<WirePart<'a>> = request
            .messages
            .iter()
            .filter(|message| message.role == ChatRole::System)
            .map(|message| WirePart {
                text: &message.content,
            })
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|message| message.role != ChatRole::System)
            .map(|message| WireContent {
                role: Some(if message.role == ChatRole::Assistant {
                    "model"
                } else {
                    "user"
                }),
                parts: vec![WirePart {
                    text: &message.content,
                }],
            })
            .collect();

        Self {
            contents,
            system_instruction: (!system_parts.is_empty()).then_some(WireContent {
                role: None,
                parts: system_parts,
            }),
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    usage_metadata: Option<WireUsage>,
}

impl WireResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct WireCandidate {
    content: Option<WireCandidateContent>,
}

#[derive(Deserialize)]
struct WireCandidateContent {
    #[serde(default)]
    parts: Vec<WireCandidatePart>,
}

#[derive(Deserialize)]
struct WireCandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: Option<u64>,
}

impl From<&WireUsage> for TokenUsage {
    fn from(usage: &WireUsage) -> Self {
        let mut converted = TokenUsage::new(usage.prompt_token_count, usage.candidates_token_count);
        if let Some(total) = usage.total_token_count {
            converted.total_tokens = total;
        }
        converted
    }
}

fn chunk_events(data: &str) -> Vec<Result<StreamEvent, ProviderError>> {
    let chunk: WireResponse = match decode(data) {
        Ok(chunk) => chunk,
        Err(error) => {
            tracing::debug!(error = %error, "skipping unparseable Gemini SSE chunk");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    let text = chunk.text();
    if !text.is_empty() {
        events.push(Ok(StreamEvent::Delta(text)));
    }
    if let Some(usage) = &chunk.usage_metadata {
        events.push(Ok(StreamEvent::Usage(usage.into())));
    }
    events
}

#[async_trait]
impl ChatProvider for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let response = self
            .client
            .post(self.model_url(&request.model, "generateContent"))
            .query(&[("key", self.api_key.as_str())])
            .json(&WireRequest::from_request(request))
            .send()
            .await?;
        let response = ensure_success(Provider::Google, response).await?;

        let body: WireResponse = response
            .json()
            .await
            .map_err(|error| ProviderError::Decode(error.to_string()))?;

        Ok(Completion {
            content: body.text(),
            usage: body.usage_metadata.as_ref().map(Into::into),
        })
    }

    async fn complete_stream(&self, request: &ChatRequest) -> Result<EventStream, ProviderError> {
        let response = self
            .client
            .post(self.model_url(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&WireRequest::from_request(request))
            .send()
            .await
            .map_err(|error| {
                tracing::error!(provider = "google", error = %error, "upstream stream request failed");
                ProviderError::from(error)
            })?;
        let response = ensure_success(Provider::Google, response).await?;

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
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;
        ensure_success(Provider::Google, response).await?;
        Ok(())
    }
}
