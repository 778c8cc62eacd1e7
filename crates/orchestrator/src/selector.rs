//! Weighted model scoring over the catalogue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::{analyze, Attachment, Complexity, ContentType, PromptAnalysis};
use crate::catalogue::{self, ModelSpec, Provider, PREMIUM_MODEL};

const MAX_EXPECTED_COST: f64 = 0.1;
const MAX_EXPECTED_LATENCY_MS: f64 = 5000.0;
const LARGE_PROMPT_TOKENS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no model satisfies the provider, blacklist and cost constraints")]
    NoEligibleModel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OptimizationMode {
    Quality,
    Budget,
    Speed,
    #[default]
    Balanced,
    Custom,
}

impl OptimizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationMode::Quality => "QUALITY",
            OptimizationMode::Budget => "BUDGET",
            OptimizationMode::Speed => "SPEED",
            OptimizationMode::Balanced => "BALANCED",
            OptimizationMode::Custom => "CUSTOM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "QUALITY" => Some(OptimizationMode::Quality),
            "BUDGET" => Some(OptimizationMode::Budget),
            "SPEED" => Some(OptimizationMode::Speed),
            "BALANCED" => Some(OptimizationMode::Balanced),
            "CUSTOM" => Some(OptimizationMode::Custom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub quality: f64,
    pub cost: f64,
    pub speed: f64,
    pub capability: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            quality: 0.4,
            cost: 0.3,
            speed: 0.2,
            capability: 0.1,
        }
    }
}

impl Weights {
    const fn new(quality: f64, cost: f64, speed: f64, capability: f64) -> Self {
        Self {
            quality,
            cost,
            speed,
            capability,
        }
    }

    pub fn is_valid(&self) -> bool {
        [self.quality, self.cost, self.speed, self.capability]
            .iter()
            .all(|weight| (0.0..=1.0).contains(weight))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionPreferences {
    #[serde(default)]
    pub mode: OptimizationMode,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub max_cost_per_message: Option<f64>,
    #[serde(default)]
    pub preferred_providers: Vec<Provider>,
    /// Entries of the form `provider/model`.
    #[serde(default)]
    pub blacklisted_models: Vec<String>,
}

impl SelectionPreferences {
    fn effective_weights(&self) -> Weights {
        match self.mode {
            OptimizationMode::Quality => Weights::new(0.7, 0.1, 0.1, 0.1),
            OptimizationMode::Budget => Weights::new(0.2, 0.6, 0.1, 0.1),
            OptimizationMode::Speed => Weights::new(0.2, 0.2, 0.5, 0.1),
            OptimizationMode::Balanced => Weights::new(0.4, 0.3, 0.2, 0.1),
            OptimizationMode::Custom => self.weights,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Scores {
    pub quality: f64,
    pub cost: f64,
    pub speed: f64,
    pub capability: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub recommended: &'static ModelSpec,
    pub alternatives: Vec<&'static ModelSpec>,
    pub reasoning: String,
    pub estimated_cost: f64,
    pub scores: Scores,
    pub analysis: PromptAnalysis,
}

pub fn select(
    prompt: &str,
    attachments: &[Attachment],
    preferences: &SelectionPreferences,
) -> Result<Selection, SelectionError> {
    let analysis = analyze(prompt, attachments);
    let candidates = eligible_models(&analysis, preferences)?;

    let mut scored: Vec<(&'static ModelSpec, Scores)> = candidates
        .into_iter()
        .map(|model| (model, score_model(model, &analysis, preferences)))
        .collect();

    scored.sort_by(|a, b| b.1.total.total_cmp(&a.1.total));

    let (recommended, scores) = scored[0];
    let alternatives = scored.iter().skip(1).take(3).map(|(model, _)| *model).collect();

    Ok(Selection {
        recommended,
        alternatives,
        reasoning: reasoning(recommended, &analysis, &scores, preferences.mode),
        estimated_cost: recommended.estimated_cost(analysis.estimated_tokens),
        scores,
        analysis,
    })
}

/// Cost saved relative to running the same prompt on the premium model.
pub fn savings_vs_premium(model: &ModelSpec, estimated_tokens: u64) -> f64 {
    let Some(premium) = catalogue::find_model(PREMIUM_MODEL) else {
        return 0.0;
    };
    (premium.estimated_cost(estimated_tokens) - model.estimated_cost(estimated_tokens)).max(0.0)
}

fn known_capabilities(analysis: &PromptAnalysis) -> Vec<&'static str> {
    analysis
        .required_capabilities
        .iter()
        .copied()
        .filter(|capability| catalogue::is_known_capability(capability))
        .collect()
}

/// Hard user constraints must hold; context and capability requirements are
/// dropped when nothing satisfies them.
fn eligible_models(
    analysis: &PromptAnalysis,
    preferences: &SelectionPreferences,
) -> Result<Vec<&'static ModelSpec>, SelectionError> {
    let allowed: Vec<&'static ModelSpec> = catalogue::all_models()
        .iter()
        .filter(|model| {
            preferences.preferred_providers.is_empty()
                || preferences.preferred_providers.contains(&model.provider)
        })
        .filter(|model| {
            let qualified = model.qualified_name();
            !preferences
                .blacklisted_models
                .iter()
                .any(|entry| entry == &qualified)
        })
        .filter(|model| match preferences.max_cost_per_message {
            Some(limit) if limit > 0.0 => {
                model.estimated_cost(analysis.estimated_tokens) <= limit
            }
            _ => true,
        })
        .collect();

    if allowed.is_empty() {
        return Err(SelectionError::NoEligibleModel);
    }

    let required = known_capabilities(analysis);
    let capable: Vec<&'static ModelSpec> = allowed
        .iter()
        .copied()
        .filter(|model| model.context_window >= analysis.min_context_window)
        .filter(|model| required.iter().all(|capability| model.has_capability(capability)))
        .collect();

    Ok(if capable.is_empty() { allowed } else { capable })
}

fn score_model(
    model: &ModelSpec,
    analysis: &PromptAnalysis,
    preferences: &SelectionPreferences,
) -> Scores {
    let mut quality = model.quality_score;
    match analysis.content_type {
        ContentType::Code if model.has_strength("code") => quality *= 1.1,
        ContentType::Creative if model.has_strength("creative_writing") => quality *= 1.1,
        ContentType::Research if model.has_strength("research") => quality *= 1.15,
        _ => {}
    }
    let quality = quality.min(1.0);

    let cost = (1.0 - model.estimated_cost(analysis.estimated_tokens) / MAX_EXPECTED_COST).max(0.0);
    let speed = (1.0 - model.avg_latency_ms as f64 / MAX_EXPECTED_LATENCY_MS).max(0.0);

    let required = known_capabilities(analysis);
    let matched = required
        .iter()
        .filter(|capability| model.has_capability(capability))
        .count();
    let mut capability = matched as f64 / required.len().max(1) as f64;
    if model.context_window >= analysis.min_context_window * 2 {
        capability += 0.1;
    }
    if model.has_strength("large_context") && analysis.estimated_tokens > LARGE_PROMPT_TOKENS {
        capability += 0.1;
    }
    let capability = capability.min(1.0);

    let weights = preferences.effective_weights();
    let total = quality * weights.quality
        + cost * weights.cost
        + speed * weights.speed
        + capability * weights.capability;

    Scores {
        quality,
        cost,
        speed,
        capability,
        total,
    }
}

fn reasoning(
    model: &ModelSpec,
    analysis: &PromptAnalysis,
    scores: &Scores,
    mode: OptimizationMode,
) -> String {
    let mut reasons = vec![match mode {
        OptimizationMode::Quality => format!("Selected {} for highest quality output", model.model),
        OptimizationMode::Budget => format!("Selected {} for cost efficiency", model.model),
        OptimizationMode::Speed => format!("Selected {} for fastest response time", model.model),
        _ => format!("Selected {} for balanced performance", model.model),
    }];

    if analysis.content_type == ContentType::Code && model.has_strength("code") {
        reasons.push("Excellent at code generation and debugging".to_string());
    }
    if analysis.content_type == ContentType::Research && model.has_strength("research") {
        reasons.push("Optimized for research with citations".to_string());
    }
    if analysis.complexity == Complexity::Expert {
        reasons.push("Capable of handling expert-level complexity".to_string());
    }
    if analysis.estimated_tokens > LARGE_PROMPT_TOKENS {
        reasons.push(format!(
            "Large context window ({} tokens)",
            group_thousands(model.context_window)
        ));
    }
    if scores.cost > 0.8 {
        reasons.push("Very cost-effective for this query".to_string());
    }
    if scores.speed > 0.8 {
        reasons.push("Fast response time".to_string());
    }

    reasons.join(". ")
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preferences(mode: OptimizationMode) -> SelectionPreferences {
        SelectionPreferences {
            mode,
            ..SelectionPreferences::default()
        }
    }

    #[test]
    fn budget_mode_picks_cheap_fast_model() {
        let selection = select("Hello there", &[], &preferences(OptimizationMode::Budget)).unwrap();
        assert_eq!(selection.recommended.model, "gemini-1.5-flash");
        assert!(selection.reasoning.starts_with("Selected gemini-1.5-flash for cost efficiency"));
        assert!(selection.reasoning.contains("Very cost-effective for this query"));
        assert!(selection.reasoning.contains("Fast response time"));
        assert_eq!(selection.alternatives.len(), 3);
    }

    #[test]
    fn quality_mode_prefers_highest_quality_for_code() {
        let selection = select(
            "const total = items.reduce((a, b) => a + b, 0); why is this slow?",
            &[],
            &preferences(OptimizationMode::Quality),
        )
        .unwrap();
        assert_eq!(selection.analysis.content_type, ContentType::Code);
        assert_eq!(selection.recommended.model, "gpt-4o");
        assert!(selection.reasoning.contains("Excellent at code generation and debugging"));
        assert!(selection.scores.quality <= 1.0);
    }

    #[test]
    fn preferred_providers_restrict_candidates() {
        let prefs = SelectionPreferences {
            preferred_providers: vec![Provider::OpenAi],
            ..preferences(OptimizationMode::Balanced)
        };
        let selection = select("Summarize the meeting", &[], &prefs).unwrap();
        assert_eq!(selection.recommended.provider, Provider::OpenAi);
        assert!(selection
            .alternatives
            .iter()
            .all(|model| model.provider == Provider::OpenAi));
    }

    #[test]
    fn blacklist_removes_models() {
        let prefs = SelectionPreferences {
            blacklisted_models: vec!["google/gemini-1.5-flash".to_string()],
            ..preferences(OptimizationMode::Budget)
        };
        let selection = select("Hello there", &[], &prefs).unwrap();
        assert_ne!(selection.recommended.model, "gemini-1.5-flash");
        assert!(selection
            .alternatives
            .iter()
            .all(|model| model.model != "gemini-1.5-flash"));
    }

    #[test]
    fn impossible_constraints_are_reported() {
        let prefs = SelectionPreferences {
            preferred_providers: vec![Provider::Perplexity],
            blacklisted_models: vec!["perplexity/sonar".into(), "perplexity/sonar-pro".into()],
            ..SelectionPreferences::default()
        };
        assert!(matches!(
            select("Hello", &[], &prefs),
            Err(SelectionError::NoEligibleModel)
        ));
    }

    #[test]
    fn unmet_capabilities_fall_back_to_allowed_models() {
        // creative_writing is only offered by anthropic models
        let prefs = SelectionPreferences {
            preferred_providers: vec![Provider::XAi],
            ..SelectionPreferences::default()
        };
        let selection = select("Write a poem about autumn", &[], &prefs).unwrap();
        assert_eq!(selection.recommended.provider, Provider::XAi);
    }

    #[test]
    fn custom_mode_uses_user_weights() {
        let prefs = SelectionPreferences {
            mode: OptimizationMode::Custom,
            weights: Weights::new(0.0, 0.0, 1.0, 0.0),
            ..SelectionPreferences::default()
        };
        let selection = select("Hello there", &[], &prefs).unwrap();
        assert_eq!(selection.recommended.model, "gemini-1.5-flash-8b");
        assert!((selection.scores.total - selection.scores.speed).abs() < 1e-12);
    }

    #[test]
    fn savings_are_measured_against_premium_model() {
        let cheap = catalogue::find_model("gpt-4o-mini").unwrap();
        let premium = catalogue::find_model(PREMIUM_MODEL).unwrap();
        assert!(savings_vs_premium(cheap, 1000) > 0.0);
        assert_eq!(savings_vs_premium(premium, 1000), 0.0);
    }

    #[test]
    fn thousands_are_grouped() {
        assert_eq!(group_thousands(200_000), "200,000");
        assert_eq!(group_thousands(2_000_000), "2,000,000");
        assert_eq!(group_thousands(999), "999");
    }

    #[test]
    fn weights_validation_rejects_out_of_range() {
        assert!(Weights::default().is_valid());
        assert!(!Weights::new(1.5, 0.0, 0.0, 0.0).is_valid());
    }
}
