use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use costguard_orchestrator::{catalogue, Provider};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow, SqlitePool};
use utoipa::{IntoParams, ToSchema};

use super::{error::ServiceError, page_offset, Pagination};
use crate::util::{now_rfc3339, rfc3339, round6};

const SUMMARY_ROWS: usize = 100;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct UsageLog {
    #[serde(rename = "id")]
    pub public_id: String,
    pub provider: String,
    pub model: String,
    pub operation: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub cost: f64,
    pub latency_ms: Option<i64>,
    pub endpoint: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: Json<Value>,
    pub created_at: String,
}

/// A usage row about to be written.
#[derive(Debug, Clone)]
pub struct NewUsage {
    pub user_id: i64,
    pub organization_id: i64,
    pub provider: String,
    pub model: String,
    pub operation: &'static str,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub latency_ms: Option<i64>,
    pub endpoint: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UsageQuery {
    pub days: Option<i64>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct UsageLogsQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecordUsageRequest {
    pub provider: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    pub cost: Option<f64>,
    pub endpoint: Option<String>,
    pub latency: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct UsageBucket {
    pub requests: i64,
    pub tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Default, Serialize, ToSchema)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_cost: f64,
    pub average_latency: f64,
    pub by_provider: BTreeMap<String, UsageBucket>,
    pub by_model: BTreeMap<String, UsageBucket>,
    pub by_day: BTreeMap<String, UsageBucket>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UsageReport {
    pub usage: Vec<UsageLog>,
    pub summary: UsageSummary,
    pub total_records: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UsageLogPage {
    pub data: Vec<UsageLog>,
    pub pagination: Pagination,
}

const COLUMNS: &str = "public_id, provider, model, operation, prompt_tokens, completion_tokens, total_tokens, cost, latency_ms, endpoint, metadata, created_at";

pub async fn record_usage(pool: &SqlitePool, usage: NewUsage) -> Result<UsageLog, ServiceError> {
    let public_id = costguard_auth::new_public_id();

    sqlx::query(
        r#"
        INSERT INTO usage_logs
            (public_id, user_id, organization_id, provider, model, operation, prompt_tokens,
             completion_tokens, total_tokens, cost, latency_ms, endpoint, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&public_id)
    .bind(usage.user_id)
    .bind(usage.organization_id)
    .bind(&usage.provider)
    .bind(&usage.model)
    .bind(usage.operation)
    .bind(usage.prompt_tokens)
    .bind(usage.completion_tokens)
    .bind(usage.prompt_tokens.saturating_add(usage.completion_tokens))
    .bind(round6(usage.cost))
    .bind(usage.latency_ms)
    .bind(&usage.endpoint)
    .bind(Json(&usage.metadata))
    .bind(now_rfc3339())
    .execute(pool)
    .await?;

    tracing::debug!(
        provider = %usage.provider,
        model = %usage.model,
        operation = usage.operation,
        cost = usage.cost,
        "usage recorded"
    );

    sqlx::query_as::<_, UsageLog>(&format!(
        "SELECT {COLUMNS} FROM usage_logs WHERE public_id = ?"
    ))
    .bind(&public_id)
    .fetch_one(pool)
    .await
    .map_err(ServiceError::from)
}

/// Validates a manually reported call and prices it from the catalogue when
/// the caller did not supply a cost.
pub fn manual_usage(
    user_id: i64,
    organization_id: i64,
    req: RecordUsageRequest,
) -> Result<NewUsage, ServiceError> {
    let (Some(provider), Some(model)) = (
        req.provider.filter(|p| !p.trim().is_empty()),
        req.model.filter(|m| !m.trim().is_empty()),
    ) else {
        return Err(ServiceError::bad_request("Provider and model are required"));
    };
    if req.input_tokens < 0 || req.output_tokens < 0 {
        return Err(ServiceError::bad_request("Token counts must not be negative"));
    }
    if req.input_tokens.checked_add(req.output_tokens).is_none() {
        return Err(ServiceError::bad_request("Token counts are too large"));
    }
    if req.cost.is_some_and(|cost| !cost.is_finite() || cost < 0.0) {
        return Err(ServiceError::bad_request("Cost must be a non-negative number"));
    }
    if req.latency.is_some_and(|latency| latency < 0) {
        return Err(ServiceError::bad_request("Latency must not be negative"));
    }

    let known = Provider::parse(&provider);
    let cost = req.cost.unwrap_or_else(|| {
        known
            .and_then(|provider| catalogue::find(provider, model.trim()))
            .map(|spec| spec.cost(req.input_tokens as u64, req.output_tokens as u64))
            .unwrap_or(0.0)
    });

    Ok(NewUsage {
        user_id,
        organization_id,
        provider: known
            .map(|provider| provider.as_str().to_string())
            .unwrap_or_else(|| provider.trim().to_lowercase()),
        model: model.trim().to_string(),
        operation: "manual",
        prompt_tokens: req.input_tokens,
        completion_tokens: req.output_tokens,
        cost,
        latency_ms: req.latency,
        endpoint: req.endpoint,
        metadata: serde_json::json!({ "source": "manual" }),
    })
}

pub async fn usage_report(
    pool: &SqlitePool,
    user_id: i64,
    query: &UsageQuery,
) -> Result<UsageReport, ServiceError> {
    let days = query.days.unwrap_or(30).clamp(1, 365);
    let since = rfc3339(Utc::now() - Duration::days(days));

    let rows = sqlx::query_as::<_, UsageLog>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM usage_logs
        WHERE user_id = ?1
          AND created_at >= ?2
          AND (?3 IS NULL OR provider = ?3)
          AND (?4 IS NULL OR model = ?4)
        ORDER BY created_at DESC, id DESC
        "#
    ))
    .bind(user_id)
    .bind(&since)
    .bind(&query.provider)
    .bind(&query.model)
    .fetch_all(pool)
    .await?;

    let summary = summarize(&rows);
    let total_records = rows.len();
    let usage = rows.into_iter().take(SUMMARY_ROWS).collect();

    Ok(UsageReport {
        usage,
        summary,
        total_records,
    })
}

pub fn summarize(rows: &[UsageLog]) -> UsageSummary {
    let mut summary = UsageSummary::default();
    let mut latency_total = 0i64;
    let mut latency_samples = 0i64;

    for row in rows {
        summary.total_requests += 1;
        summary.total_tokens += row.total_tokens;
        summary.total_cost += row.cost;
        if let Some(latency) = row.latency_ms {
            latency_total += latency;
            latency_samples += 1;
        }

        let day = row.created_at.get(..10).unwrap_or(&row.created_at).to_string();
        for (map, key) in [
            (&mut summary.by_provider, row.provider.clone()),
            (&mut summary.by_model, row.model.clone()),
            (&mut summary.by_day, day),
        ] {
            let bucket = map.entry(key).or_default();
            bucket.requests += 1;
            bucket.tokens += row.total_tokens;
            bucket.cost = round6(bucket.cost + row.cost);
        }
    }

    summary.total_cost = round6(summary.total_cost);
    if latency_samples > 0 {
        summary.average_latency = latency_total as f64 / latency_samples as f64;
    }
    summary
}

pub async fn list_usage_logs(
    pool: &SqlitePool,
    user_id: i64,
    query: &UsageLogsQuery,
) -> Result<UsageLogPage, ServiceError> {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_PAGE_SIZE);
    let offset = page_offset(page, limit)?;

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM usage_logs WHERE user_id = ?1 AND (?2 IS NULL OR provider = ?2)",
    )
    .bind(user_id)
    .bind(&query.provider)
    .fetch_one(pool)
    .await?;

    let data = sqlx::query_as::<_, UsageLog>(&format!(
        r#"
        SELECT {COLUMNS}
        FROM usage_logs
        WHERE user_id = ?1 AND (?2 IS NULL OR provider = ?2)
        ORDER BY created_at DESC, id DESC
        LIMIT ?3 OFFSET ?4
        "#
    ))
    .bind(user_id)
    .bind(&query.provider)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(UsageLogPage {
        data,
        pagination: Pagination::new(page, limit, total),
    })
}

/// Spend per provider across every tenant, newest window first.
pub async fn totals_by_provider(
    pool: &SqlitePool,
    days: i64,
) -> Result<Vec<(String, UsageBucket)>, ServiceError> {
    let since = rfc3339(Utc::now() - Duration::days(days.max(1)));
    let rows: Vec<(String, i64, i64, f64)> = sqlx::query_as(
        r#"
        SELECT provider, COUNT(*), COALESCE(SUM(total_tokens), 0), COALESCE(SUM(cost), 0.0)
        FROM usage_logs
        WHERE created_at >= ?
        GROUP BY provider
        ORDER BY SUM(cost) DESC
        "#,
    )
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(provider, requests, tokens, cost)| {
            (
                provider,
                UsageBucket {
                    requests,
                    tokens,
                    cost: round6(cost),
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(provider: &str, model: &str, tokens: i64, cost: f64, day: &str) -> UsageLog {
        UsageLog {
            public_id: "x".into(),
            provider: provider.into(),
            model: model.into(),
            operation: "chat".into(),
            prompt_tokens: tokens / 2,
            completion_tokens: tokens - tokens / 2,
            total_tokens: tokens,
            cost,
            latency_ms: Some(100),
            endpoint: None,
            metadata: Json(Value::Null),
            created_at: format!("{day}T10:00:00.000Z"),
        }
    }

    #[test]
    fn summary_groups_by_provider_model_and_day() {
        let rows = vec![
            log("openai", "gpt-4o", 100, 0.1, "2024-05-01"),
            log("openai", "gpt-4o-mini", 50, 0.2, "2024-05-01"),
            log("anthropic", "claude-3.5-haiku", 10, 0.0000004, "2024-05-02"),
        ];
        let summary = summarize(&rows);

        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_tokens, 160);
        assert_eq!(summary.total_cost, 0.3);
        assert_eq!(summary.average_latency, 100.0);
        assert_eq!(summary.by_provider["openai"].requests, 2);
        assert_eq!(summary.by_provider["openai"].cost, 0.3);
        assert_eq!(summary.by_model.len(), 3);
        assert_eq!(summary.by_day["2024-05-02"].tokens, 10);
    }

    fn manual(input_tokens: i64, output_tokens: i64, cost: Option<f64>) -> RecordUsageRequest {
        RecordUsageRequest {
            provider: Some("openai".into()),
            model: Some("gpt-4o".into()),
            input_tokens,
            output_tokens,
            cost,
            endpoint: None,
            latency: None,
        }
    }

    #[test]
    fn manual_usage_rejects_bad_costs_and_token_overflow() {
        for cost in [-0.01, f64::NAN, f64::INFINITY] {
            let error = manual_usage(1, 1, manual(10, 10, Some(cost))).unwrap_err();
            assert!(matches!(error, ServiceError::BadRequest(_)), "cost {cost}");
        }

        let error = manual_usage(1, 1, manual(i64::MAX, 1, Some(1.0))).unwrap_err();
        assert_eq!(error.to_string(), "Token counts are too large");

        assert!(manual_usage(1, 1, manual(10, 10, Some(0.0))).is_ok());
    }

    #[test]
    fn manual_usage_prices_known_models() {
        let usage = manual_usage(
            1,
            1,
            RecordUsageRequest {
                provider: Some("OpenAI".into()),
                model: Some("gpt-4o".into()),
                input_tokens: 1000,
                output_tokens: 1000,
                cost: None,
                endpoint: None,
                latency: None,
            },
        )
        .unwrap();
        assert_eq!(usage.provider, "openai");
        assert!((usage.cost - 0.0125).abs() < 1e-9);

        let unknown = manual_usage(
            1,
            1,
            RecordUsageRequest {
                provider: Some("mistral".into()),
                model: Some("large".into()),
                input_tokens: 10,
                output_tokens: 10,
                cost: None,
                endpoint: None,
                latency: None,
            },
        )
        .unwrap();
        assert_eq!(unknown.cost, 0.0);
    }

    #[test]
    fn manual_usage_requires_provider_and_model() {
        let error = manual_usage(
            1,
            1,
            RecordUsageRequest {
                provider: None,
                model: Some("gpt-4o".into()),
                input_tokens: 0,
                output_tokens: 0,
                cost: None,
                endpoint: None,
                latency: None,
            },
        )
        .unwrap_err();
        assert!(matches!(error, ServiceError::BadRequest(_)));
    }
}
