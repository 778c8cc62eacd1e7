//! Static model catalogue with per-1k-token pricing.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(alias = "claude")]
    Anthropic,
    #[serde(alias = "gemini")]
    Google,
    #[serde(rename = "xai", alias = "grok")]
    XAi,
    Perplexity,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Google,
        Provider::XAi,
        Provider::Perplexity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::XAi => "xai",
            Provider::Perplexity => "perplexity",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OpenAI",
            Provider::Anthropic => "Anthropic",
            Provider::Google => "Google",
            Provider::XAi => "xAI",
            Provider::Perplexity => "Perplexity",
        }
    }

    /// Accepts canonical names and the vendor aliases users commonly type.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "anthropic" | "claude" => Some(Provider::Anthropic),
            "google" | "gemini" => Some(Provider::Google),
            "xai" | "x.ai" | "grok" => Some(Provider::XAi),
            "perplexity" => Some(Provider::Perplexity),
            _ => None,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: &'static str,
    /// Identifier sent upstream when it differs from the catalogue name.
    pub api_model: &'static str,
    pub context_window: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub avg_latency_ms: u64,
    pub quality_score: f64,
    pub capabilities: &'static [&'static str],
    pub strengths: &'static [&'static str],
}

impl ModelSpec {
    pub fn cost(&self, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * self.input_cost
            + (completion_tokens as f64 / 1000.0) * self.output_cost
    }

    /// Cost of a message whose tokens split 40/60 between prompt and completion.
    pub fn estimated_cost(&self, estimated_tokens: u64) -> f64 {
        let tokens = estimated_tokens as f64;
        (tokens * 0.4 / 1000.0) * self.input_cost + (tokens * 0.6 / 1000.0) * self.output_cost
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn has_strength(&self, strength: &str) -> bool {
        self.strengths.contains(&strength)
    }

    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

static MODELS: &[ModelSpec] = &[
    ModelSpec {
        provider: Provider::OpenAi,
        model: "gpt-4o",
        api_model: "gpt-4o",
        context_window: 128_000,
        input_cost: 0.0025,
        output_cost: 0.01,
        avg_latency_ms: 2000,
        quality_score: 0.95,
        capabilities: &["vision", "code_generation", "reasoning", "web_browsing", "data_analysis"],
        strengths: &["complex_reasoning", "code", "multimodal"],
    },
    ModelSpec {
        provider: Provider::OpenAi,
        model: "gpt-4o-mini",
        api_model: "gpt-4o-mini",
        context_window: 128_000,
        input_cost: 0.00015,
        output_cost: 0.0006,
        avg_latency_ms: 1200,
        quality_score: 0.75,
        capabilities: &["vision", "code_generation", "reasoning"],
        strengths: &["cost_effective", "fast", "general_purpose"],
    },
    ModelSpec {
        provider: Provider::OpenAi,
        model: "gpt-4-turbo",
        api_model: "gpt-4-turbo",
        context_window: 128_000,
        input_cost: 0.01,
        output_cost: 0.03,
        avg_latency_ms: 2500,
        quality_score: 0.93,
        capabilities: &["vision", "code_generation", "reasoning", "data_analysis"],
        strengths: &["complex_reasoning", "detailed_analysis"],
    },
    ModelSpec {
        provider: Provider::OpenAi,
        model: "gpt-3.5-turbo",
        api_model: "gpt-3.5-turbo",
        context_window: 16_385,
        input_cost: 0.0005,
        output_cost: 0.0015,
        avg_latency_ms: 800,
        quality_score: 0.7,
        capabilities: &["code_generation", "reasoning"],
        strengths: &["fast", "cost_effective"],
    },
    ModelSpec {
        provider: Provider::Anthropic,
        model: "claude-3.5-sonnet",
        api_model: "claude-3-5-sonnet-20241022",
        context_window: 200_000,
        input_cost: 0.003,
        output_cost: 0.015,
        avg_latency_ms: 2200,
        quality_score: 0.96,
        capabilities: &[
            "vision",
            "code_generation",
            "reasoning",
            "data_analysis",
            "creative_writing",
        ],
        strengths: &["code", "analysis", "large_context", "safety"],
    },
    ModelSpec {
        provider: Provider::Anthropic,
        model: "claude-3.5-haiku",
        api_model: "claude-3-5-haiku-20241022",
        context_window: 200_000,
        input_cost: 0.0008,
        output_cost: 0.004,
        avg_latency_ms: 1000,
        quality_score: 0.78,
        capabilities: &["code_generation", "reasoning"],
        strengths: &["fast", "large_context", "cost_effective"],
    },
    ModelSpec {
        provider: Provider::Anthropic,
        model: "claude-3-opus",
        api_model: "claude-3-opus-20240229",
        context_window: 200_000,
        input_cost: 0.015,
        output_cost: 0.075,
        avg_latency_ms: 3000,
        quality_score: 0.94,
        capabilities: &[
            "vision",
            "code_generation",
            "reasoning",
            "data_analysis",
            "creative_writing",
        ],
        strengths: &["complex_reasoning", "research", "large_context"],
    },
    ModelSpec {
        provider: Provider::Google,
        model: "gemini-1.5-pro",
        api_model: "gemini-1.5-pro",
        context_window: 2_000_000,
        input_cost: 0.00125,
        output_cost: 0.005,
        avg_latency_ms: 1800,
        quality_score: 0.88,
        capabilities: &["vision", "code_generation", "reasoning", "data_analysis"],
        strengths: &["massive_context", "multimodal", "cost_effective"],
    },
    ModelSpec {
        provider: Provider::Google,
        model: "gemini-1.5-flash",
        api_model: "gemini-1.5-flash",
        context_window: 1_000_000,
        input_cost: 0.000075,
        output_cost: 0.0003,
        avg_latency_ms: 600,
        quality_score: 0.72,
        capabilities: &["vision", "code_generation", "reasoning"],
        strengths: &["very_fast", "very_cheap", "large_context"],
    },
    ModelSpec {
        provider: Provider::Google,
        model: "gemini-1.5-flash-8b",
        api_model: "gemini-1.5-flash-8b",
        context_window: 1_000_000,
        input_cost: 0.0000375,
        output_cost: 0.00015,
        avg_latency_ms: 400,
        quality_score: 0.65,
        capabilities: &["code_generation", "reasoning"],
        strengths: &["ultra_fast", "ultra_cheap", "large_context"],
    },
    ModelSpec {
        provider: Provider::Perplexity,
        model: "sonar-pro",
        api_model: "sonar-pro",
        context_window: 32_000,
        input_cost: 0.001,
        output_cost: 0.001,
        avg_latency_ms: 3000,
        quality_score: 0.85,
        capabilities: &["web_browsing", "reasoning", "research"],
        strengths: &["real_time_data", "citations", "research"],
    },
    ModelSpec {
        provider: Provider::Perplexity,
        model: "sonar",
        api_model: "sonar",
        context_window: 32_000,
        input_cost: 0.0005,
        output_cost: 0.0005,
        avg_latency_ms: 2000,
        quality_score: 0.75,
        capabilities: &["web_browsing", "reasoning"],
        strengths: &["real_time_data", "cost_effective"],
    },
    ModelSpec {
        provider: Provider::XAi,
        model: "grok-2",
        api_model: "grok-2-1212",
        context_window: 32_000,
        input_cost: 0.002,
        output_cost: 0.01,
        avg_latency_ms: 2000,
        quality_score: 0.89,
        capabilities: &["code_generation", "reasoning", "real_time_data"],
        strengths: &["uncensored", "real_time", "humor"],
    },
    ModelSpec {
        provider: Provider::XAi,
        model: "grok-2-mini",
        api_model: "grok-2-mini",
        context_window: 32_000,
        input_cost: 0.0002,
        output_cost: 0.001,
        avg_latency_ms: 1000,
        quality_score: 0.73,
        capabilities: &["code_generation", "reasoning"],
        strengths: &["fast", "cost_effective", "uncensored"],
    },
];

/// Model every saving is measured against.
pub const PREMIUM_MODEL: &str = "claude-3-opus";

pub fn all_models() -> &'static [ModelSpec] {
    MODELS
}

pub fn models_for(provider: Provider) -> impl Iterator<Item = &'static ModelSpec> {
    MODELS.iter().filter(move |spec| spec.provider == provider)
}

/// Resolves a catalogue name, an upstream identifier or a `provider/model` pair.
pub fn find_model(name: &str) -> Option<&'static ModelSpec> {
    let name = name.trim();
    if let Some((provider, model)) = name.split_once('/') {
        let provider = Provider::parse(provider)?;
        return find(provider, model);
    }

    MODELS
        .iter()
        .find(|spec| spec.model == name || spec.api_model == name)
}

pub fn find(provider: Provider, model: &str) -> Option<&'static ModelSpec> {
    MODELS.iter().find(|spec| {
        spec.provider == provider && (spec.model == model || spec.api_model == model)
    })
}

/// Every capability tag that at least one catalogue model advertises.
pub fn is_known_capability(capability: &str) -> bool {
    MODELS.iter().any(|spec| spec.has_capability(capability))
}

/// Rough token count used when a provider does not report usage.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}
