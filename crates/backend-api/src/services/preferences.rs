use costguard_orchestrator::{OptimizationMode, Provider, SelectionPreferences, Weights};
use sqlx::{types::Json, FromRow, SqlitePool};

use super::error::ServiceError;
use crate::util::now_rfc3339;

#[derive(Debug, FromRow)]
struct PreferencesRow {
    mode: String,
    quality_weight: f64,
    cost_weight: f64,
    speed_weight: f64,
    capability_weight: f64,
    max_cost_per_message: Option<f64>,
    preferred_providers: Json<Vec<String>>,
    blacklisted_models: Json<Vec<String>>,
}

impl From<PreferencesRow> for SelectionPreferences {
    fn from(row: PreferencesRow) -> Self {
        Self {
            mode: OptimizationMode::parse(&row.mode).unwrap_or_default(),
            weights: Weights {
                quality: row.quality_weight,
                cost: row.cost_weight,
                speed: row.speed_weight,
                capability: row.capability_weight,
            },
            max_cost_per_message: row.max_cost_per_message,
            preferred_providers: row
                .preferred_providers
                .0
                .iter()
                .filter_map(|provider| Provider::parse(provider))
                .collect(),
            blacklisted_models: row.blacklisted_models.0,
        }
    }
}

/// Stored preferences of the user, or the defaults when none were saved.
pub async fn load_preferences(
    pool: &SqlitePool,
    user_id: i64,
) -> Result<SelectionPreferences, ServiceError> {
    let row = sqlx::query_as::<_, PreferencesRow>(
        r#"
        SELECT mode, quality_weight, cost_weight, speed_weight, capability_weight,
               max_cost_per_message, preferred_providers, blacklisted_models
        FROM prompt_preferences
        WHERE user_id = ?
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(SelectionPreferences::from).unwrap_or_default())
}

pub async fn save_preferences(
    pool: &SqlitePool,
    user_id: i64,
    preferences: SelectionPreferences,
) -> Result<SelectionPreferences, ServiceError> {
    let mut errors = Vec::new();
    if !preferences.weights.is_valid() {
        errors.push("weights must each be between 0 and 1".to_string());
    }
    if preferences
        .max_cost_per_message
        .is_some_and(|cost| cost < 0.0)
    {
        errors.push("max_cost_per_message must be zero or greater".to_string());
    }
    if !errors.is_empty() {
        return Err(ServiceError::invalid("Invalid preferences", errors));
    }

    let providers: Vec<&str> = preferences
        .preferred_providers
        .iter()
        .map(Provider::as_str)
        .collect();

    sqlx::query(
        r#"
        INSERT INTO prompt_preferences
            (user_id, mode, quality_weight, cost_weight, speed_weight, capability_weight,
             max_cost_per_message, preferred_providers, blacklisted_models, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (user_id) DO UPDATE SET
            mode = excluded.mode,
            quality_weight = excluded.quality_weight,
            cost_weight = excluded.cost_weight,
            speed_weight = excluded.speed_weight,
            capability_weight = excluded.capability_weight,
            max_cost_per_message = excluded.max_cost_per_message,
            preferred_providers = excluded.preferred_providers,
            blacklisted_models = excluded.blacklisted_models,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(preferences.mode.as_str())
    .bind(preferences.weights.quality)
    .bind(preferences.weights.cost)
    .bind(preferences.weights.speed)
    .bind(preferences.weights.capability)
    .bind(preferences.max_cost_per_message)
    .bind(Json(&providers))
    .bind(Json(&preferences.blacklisted_models))
    .bind(now_rfc3339())
    .execute(pool)
    .await?;

    load_preferences(pool, user_id).await
}
