pub mod analyzer;
pub mod catalogue;
pub mod providers;
pub mod selector;

use std::{sync::Arc, time::Duration};

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use costguard_config::{AppConfig, ChatConfig, ProvidersConfig};

pub use analyzer::{analyze, Attachment, Complexity, ContentType, PromptAnalysis};
pub use catalogue::{find_model, ModelSpec, Provider};
pub use providers::{
    ChatMessage, ChatProvider, ChatRequest, ChatRole, Completion, EventStream, ProviderError,
    StreamEvent, TokenUsage,
};
pub use selector::{
    select, OptimizationMode, Scores, Selection, SelectionError, SelectionPreferences, Weights,
};

use providers::{anthropic::AnthropicClient, gemini::GeminiClient, openai::OpenAiCompatible};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("model {0} is not in the catalogue")]
    UnknownModel(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Selection(#[from] SelectionError),
}

/// Outcome of probing a provider with a user's key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValidation {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builds per-request provider clients over one shared connection pool.
#[derive(Clone)]
pub struct Orchestrator {
    providers: ProvidersConfig,
    chat: ChatConfig,
    client: Client,
}

impl Orchestrator {
    pub fn new(config: &AppConfig) -> Result<Self, OrchestratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.providers.request_timeout_seconds))
            .build()?;

        info!(
            models = catalogue::all_models().len(),
            timeout_seconds = config.providers.request_timeout_seconds,
            "model catalogue initialised"
        );

        Ok(Self {
            providers: config.providers.clone(),
            chat: config.chat.clone(),
            client,
        })
    }

    pub fn chat_defaults(&self) -> &ChatConfig {
        &self.chat
    }

    fn base_url(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAi => &self.providers.openai.base_url,
            Provider::Anthropic => &self.providers.anthropic.base_url,
            Provider::Google => &self.providers.google.base_url,
            Provider::XAi => &self.providers.xai.base_url,
            Provider::Perplexity => &self.providers.perplexity.base_url,
        }
    }

    pub fn client_for(&self, provider: Provider, api_key: &str) -> Arc<dyn ChatProvider> {
        let base_url = self.base_url(provider).to_string();
        let client = self.client.clone();
        debug!(provider = %provider, base_url = %base_url, "building provider client");

        match provider {
            Provider::Anthropic => Arc::new(AnthropicClient::new(client, base_url, api_key)),
            Provider::Google => Arc::new(GeminiClient::new(client, base_url, api_key)),
            Provider::OpenAi | Provider::XAi | Provider::Perplexity => {
                Arc::new(OpenAiCompatible::new(provider, client, base_url, api_key))
            }
        }
    }

    /// Resolves a catalogue model and fills in the configured generation defaults.
    pub fn chat_request(
        &self,
        provider: Provider,
        model: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<(&'static ModelSpec, ChatRequest), OrchestratorError> {
        let spec = catalogue::find(provider, model)
            .ok_or_else(|| OrchestratorError::UnknownModel(format!("{provider}/{model}")))?;

        Ok((
            spec,
            ChatRequest {
                model: spec.api_model.to_string(),
                messages,
                max_tokens: self.chat.max_tokens,
                temperature: self.chat.temperature,
            },
        ))
    }

    pub async fn complete(
        &self,
        provider: Provider,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<Completion, OrchestratorError> {
        Ok(self.client_for(provider, api_key).complete(request).await?)
    }

    pub async fn stream(
        &self,
        provider: Provider,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<EventStream, OrchestratorError> {
        Ok(self
            .client_for(provider, api_key)
            .complete_stream(request)
            .await?)
    }

    pub async fn validate_key(&self, provider: Provider, api_key: &str) -> KeyValidation {
        match self.client_for(provider, api_key).validate_key().await {
            Ok(()) => KeyValidation {
                valid: true,
                error: None,
            },
            Err(error) => {
                warn!(provider = %provider, error = %error, "api key validation failed");
                KeyValidation {
                    valid: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    pub fn recommend(
        &self,
        prompt: &str,
        attachments: &[Attachment],
        preferences: &SelectionPreferences,
    ) -> Result<Selection, OrchestratorError> {
        Ok(select(prompt, attachments, preferences)?)
    }
}
