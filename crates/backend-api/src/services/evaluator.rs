//! Rule evaluation: measures recent spend, decides which rules fire and
//! turns each firing into an in-app notification.

use chrono::{DateTime, Duration, Utc};
use costguard_auth::User;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use utoipa::ToSchema;

use super::{
    budgets,
    error::ServiceError,
    notifications::{self, NewNotification, Notification},
    rules::{self, CustomCondition, NotificationRule},
    templates,
    vocabulary::{Channel, NotificationStatus, NotificationType, Priority},
};
use crate::{
    realtime::{ServerEvent, UserHub},
    util::{rfc3339, round6},
};

/// Window used when a rule is checked right after being created.
pub const CREATION_TEST_WINDOW_MINUTES: i64 = 24 * 60;

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageEntry {
    pub provider: String,
    pub model: String,
    pub cost: f64,
    pub tokens: i64,
    pub requests: i64,
}

/// Spend figures a rule is evaluated against. Custom conditions address
/// these fields by name, e.g. `current_cost` or `usage_data.0.provider`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationContext {
    pub window_minutes: i64,
    pub current_cost: f64,
    pub previous_cost: f64,
    /// Percentage change against the previous window.
    pub cost_increase: f64,
    pub total_tokens: i64,
    pub request_count: i64,
    pub usage_data: Vec<UsageEntry>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TestEvaluation {
    pub would_trigger: bool,
    pub throttled: bool,
    pub current_cost: f64,
    pub total_tokens: i64,
    pub usage_data_count: usize,
}

/// Starts of the current and the previous window, `None` when either falls
/// outside the representable calendar.
fn window_starts(now: DateTime<Utc>, minutes: i64) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let window = Duration::try_minutes(minutes.max(1))?;
    let current = now.checked_sub_signed(window)?;
    let previous = current.checked_sub_signed(window)?;
    Some((current, previous))
}

pub async fn build_context(
    pool: &SqlitePool,
    user_id: i64,
    window_minutes: i64,
    now: DateTime<Utc>,
) -> Result<EvaluationContext, ServiceError> {
    let (current, previous) = window_starts(now, window_minutes).ok_or_else(|| {
        ServiceError::bad_request(format!(
            "Time window of {window_minutes} minutes is out of range"
        ))
    })?;
    let current_start = rfc3339(current);
    let previous_start = rfc3339(previous);
    let now_text = rfc3339(now);

    let rows: Vec<(String, String, f64, i64, i64)> = sqlx::query_as(
        r#"
        SELECT provider, model, COALESCE(SUM(cost), 0.0), COALESCE(SUM(total_tokens), 0), COUNT(*)
        FROM usage_logs
        WHERE user_id = ? AND created_at >= ? AND created_at <= ?
        GROUP BY provider, model
        ORDER BY provider, model
        "#,
    )
    .bind(user_id)
    .bind(&current_start)
    .bind(&now_text)
    .fetch_all(pool)
    .await?;

    let previous_cost: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost), 0.0) FROM usage_logs WHERE user_id = ? AND created_at >= ? AND created_at < ?",
    )
    .bind(user_id)
    .bind(&previous_start)
    .bind(&current_start)
    .fetch_one(pool)
    .await?;

    let usage_data: Vec<UsageEntry> = rows
        .into_iter()
        .map(|(provider, model, cost, tokens, requests)| UsageEntry {
            provider,
            model,
            cost: round6(cost),
            tokens,
            requests,
        })
        .collect();

    let current_cost = round6(usage_data.iter().fold(0.0, |total, entry| total + entry.cost));
    Ok(EvaluationContext {
        window_minutes,
        current_cost,
        previous_cost: round6(previous_cost),
        cost_increase: cost_increase(current_cost, previous_cost),
        total_tokens: usage_data.iter().map(|entry| entry.tokens).sum(),
        request_count: usage_data.iter().map(|entry| entry.requests).sum(),
        usage_data,
    })
}

fn cost_increase(current: f64, previous: f64) -> f64 {
    if previous > 0.0 {
        round6((current - previous) / previous * 100.0)
    } else if current > 0.0 {
        100.0
    } else {
        0.0
    }
}

/// True when every condition the rule specifies holds for `context`.
pub fn conditions_hold(rule: &NotificationRule, context: &EvaluationContext) -> bool {
    let conditions = &rule.conditions.0;

    if let Some(threshold) = conditions.cost_threshold {
        if context.current_cost < threshold {
            return false;
        }
    }
    if let Some(threshold) = conditions.usage_threshold {
        if context.total_tokens < threshold {
            return false;
        }
    }
    if !conditions.provider_filters.is_empty()
        && !context.usage_data.iter().any(|entry| {
            conditions
                .provider_filters
                .iter()
                .any(|provider| provider.eq_ignore_ascii_case(&entry.provider))
        })
    {
        return false;
    }
    if !conditions.model_filters.is_empty()
        && !context
            .usage_data
            .iter()
            .any(|entry| conditions.model_filters.contains(&entry.model))
    {
        return false;
    }
    if !conditions.custom_conditions.is_empty() {
        let Ok(fields) = serde_json::to_value(context) else {
            return false;
        };
        if !conditions
            .custom_conditions
            .iter()
            .all(|condition| custom_condition_holds(condition, &fields))
        {
            return false;
        }
    }
    if let Some(threshold) = rule.threshold {
        let op = rule.comparison_op.as_deref().unwrap_or("gte");
        if !compare(&Value::from(context.current_cost), op, &Value::from(threshold)) {
            return false;
        }
    }

    true
}

fn custom_condition_holds(condition: &CustomCondition, fields: &Value) -> bool {
    let pointer = format!("/{}", condition.field.trim().replace('.', "/"));
    match fields.pointer(&pointer) {
        Some(actual) => compare(actual, &condition.operator, &condition.value),
        None => false,
    }
}

fn compare(actual: &Value, operator: &str, expected: &Value) -> bool {
    let numbers = actual.as_f64().zip(expected.as_f64());
    match operator {
        "gt" => numbers.is_some_and(|(a, b)| a > b),
        "gte" => numbers.is_some_and(|(a, b)| a >= b),
        "lt" => numbers.is_some_and(|(a, b)| a < b),
        "lte" => numbers.is_some_and(|(a, b)| a <= b),
        "eq" => numbers.map_or_else(|| actual == expected, |(a, b)| a == b),
        "neq" => numbers.map_or_else(|| actual != expected, |(a, b)| a != b),
        "contains" => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
        _ => false,
    }
}

/// Whether the rule's cooldown or daily cap currently blocks it.
pub fn throttled(rule: &NotificationRule, now: DateTime<Utc>) -> bool {
    if let Some(last) = rule
        .last_triggered_at
        .as_deref()
        .and_then(|last| DateTime::parse_from_rfc3339(last).ok())
    {
        let elapsed = now.signed_duration_since(last.with_timezone(&Utc));
        // A cooldown too long to represent never runs out.
        if Duration::try_minutes(rule.cooldown_minutes).map_or(true, |cooldown| elapsed < cooldown)
        {
            return true;
        }
    }

    rule.trigger_day.as_deref() == Some(utc_day(now).as_str())
        && rule.trigger_count >= rule.max_per_day
}

fn utc_day(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Trigger count after one more firing; the count restarts every UTC day.
fn next_trigger_count(rule: &NotificationRule, now: DateTime<Utc>) -> i64 {
    if rule.trigger_day.as_deref() == Some(utc_day(now).as_str()) {
        rule.trigger_count + 1
    } else {
        1
    }
}

/// Checks a rule against current usage without firing it.
pub async fn test_rule(
    pool: &SqlitePool,
    rule: &NotificationRule,
    window_minutes: i64,
) -> Result<TestEvaluation, ServiceError> {
    let now = Utc::now();
    let context = build_context(pool, rule.user_id, window_minutes, now).await?;
    Ok(TestEvaluation {
        would_trigger: conditions_hold(rule, &context),
        throttled: throttled(rule, now),
        current_cost: context.current_cost,
        total_tokens: context.total_tokens,
        usage_data_count: context.usage_data.len(),
    })
}

/// Evaluates every enabled rule of `user` and the organization's budgets, and
/// delivers whatever fires.
pub async fn evaluate_rules(
    pool: &SqlitePool,
    users: &UserHub,
    user: &User,
) -> Result<Vec<Notification>, ServiceError> {
    let rules = rules::enabled_rules(pool, user.id).await?;
    let mut fired = Vec::new();

    for rule in rules {
        let now = Utc::now();
        if window_starts(now, rule.time_window).is_none() {
            tracing::warn!(
                rule = %rule.public_id,
                time_window = rule.time_window,
                "skipping rule with an unrepresentable time window"
            );
            continue;
        }
        let context = build_context(pool, user.id, rule.time_window, now).await?;
        if !conditions_hold(&rule, &context) {
            continue;
        }
        if throttled(&rule, now) {
            tracing::debug!(rule = %rule.public_id, "rule throttled");
            continue;
        }

        let notification = fire(pool, user, &rule, &context, now).await?;
        fired.push(notification);
    }

    fired.extend(budgets::raise_budget_alerts(pool, user, Utc::now()).await?);

    if !fired.is_empty() {
        for notification in &fired {
            users
                .send(
                    user.id,
                    ServerEvent::Notification {
                        notification: serde_json::to_value(notification)?,
                    },
                )
                .await;
        }
        let count = notifications::unread_count(pool, user.id).await?;
        users
            .send(user.id, ServerEvent::NotificationUnreadCount { count })
            .await;
    }

    Ok(fired)
}

async fn fire(
    pool: &SqlitePool,
    user: &User,
    rule: &NotificationRule,
    context: &EvaluationContext,
    now: DateTime<Utc>,
) -> Result<Notification, ServiceError> {
    let notification_type =
        NotificationType::parse(&rule.rule_type).unwrap_or(NotificationType::System);
    let variables = template_variables(pool, user, rule, context).await?;

    let (title, message) = match templates::find_template(
        pool,
        notification_type.as_str(),
        Channel::InApp.as_str(),
        "en",
    )
    .await
    {
        Ok(template) => {
            let rendered = templates::render_template(&template, &variables);
            let title = rendered
                .subject
                .unwrap_or_else(|| fallback_title(notification_type, context));
            (title, rendered.body)
        }
        Err(templates::TemplateError::NotFound { .. }) => (
            fallback_title(notification_type, context),
            fallback_message(context),
        ),
        Err(error) => return Err(error.into()),
    };

    let notification = notifications::create_notification(
        pool,
        NewNotification {
            user_id: user.id,
            rule_id: Some(rule.id),
            notification_type,
            priority: Priority::parse(&rule.priority).unwrap_or(Priority::Medium),
            title,
            message,
            data: json!({
                "rule_id": rule.public_id,
                "rule_name": rule.name,
                "context": context,
            }),
            status: NotificationStatus::Delivered,
            expires_at: None,
        },
    )
    .await?;

    rules::record_trigger(
        pool,
        rule.id,
        &rfc3339(now),
        &utc_day(now),
        next_trigger_count(rule, now),
    )
    .await?;

    tracing::info!(
        rule = %rule.public_id,
        notification = %notification.public_id,
        current_cost = context.current_cost,
        "notification rule fired"
    );

    Ok(notification)
}

fn top_provider(context: &EvaluationContext) -> String {
    context
        .usage_data
        .iter()
        .max_by(|a, b| a.cost.total_cmp(&b.cost))
        .map(|entry| entry.provider.clone())
        .unwrap_or_else(|| "AI".to_string())
}

fn fallback_title(notification_type: NotificationType, context: &EvaluationContext) -> String {
    let label = match notification_type {
        NotificationType::CostAlert => "Cost Alert",
        NotificationType::UsageAlert => "Usage Alert",
        NotificationType::BudgetWarning => "Budget Warning",
        NotificationType::System => "System Notice",
        NotificationType::Report => "Usage Report",
    };
    format!("{label}: {}", top_provider(context))
}

fn fallback_message(context: &EvaluationContext) -> String {
    format!(
        "Your {} usage has exceeded the threshold.",
        top_provider(context)
    )
}

fn timeframe(minutes: i64) -> String {
    match minutes {
        m if m % 1440 == 0 && m >= 1440 => {
            let days = m / 1440;
            if days == 1 { "24 hours".to_string() } else { format!("{days} days") }
        }
        m if m % 60 == 0 && m >= 60 => format!("{} hours", m / 60),
        m => format!("{m} minutes"),
    }
}

async fn template_variables(
    pool: &SqlitePool,
    user: &User,
    rule: &NotificationRule,
    context: &EvaluationContext,
) -> Result<Value, ServiceError> {
    let organization: Option<String> =
        sqlx::query_scalar("SELECT name FROM organizations WHERE id = ?")
            .bind(user.organization_id)
            .fetch_optional(pool)
            .await?;

    let threshold = rule.threshold.or(rule.conditions.0.cost_threshold);
    Ok(json!({
        "user": {
            "id": user.public_id,
            "name": user.display_name.clone().or_else(|| user.email.clone()).unwrap_or_default(),
            "email": user.email,
        },
        "organization": {
            "id": user.organization_public_id,
            "name": organization.unwrap_or_default(),
        },
        "rule": {
            "id": rule.public_id,
            "name": rule.name,
            "type": rule.rule_type,
            "priority": rule.priority,
        },
        "context": {
            "currentCost": context.current_cost,
            "previousCost": context.previous_cost,
            "costIncrease": context.cost_increase,
            "threshold": threshold,
            "timeframe": timeframe(context.window_minutes),
            "totalTokens": context.total_tokens,
            "requestCount": context.request_count,
            "provider": top_provider(context),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::rules::RuleConditions;
    use sqlx::types::Json;

    fn rule(conditions: RuleConditions) -> NotificationRule {
        NotificationRule {
            id: 1,
            public_id: "rule".to_string(),
            user_id: 1,
            name: "Spend".to_string(),
            description: None,
            rule_type: "COST_ALERT".to_string(),
            enabled: true,
            conditions: Json(conditions),
            threshold: None,
            comparison_op: None,
            time_window: 60,
            schedule: None,
            timezone: "UTC".to_string(),
            cooldown_minutes: 60,
            max_per_day: 2,
            priority: "HIGH".to_string(),
            tags: Json(Vec::new()),
            channels: Json(Vec::new()),
            last_triggered_at: None,
            trigger_day: None,
            trigger_count: 0,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn context() -> EvaluationContext {
        EvaluationContext {
            window_minutes: 60,
            current_cost: 12.5,
            previous_cost: 10.0,
            cost_increase: 25.0,
            total_tokens: 4_000,
            request_count: 3,
            usage_data: vec![UsageEntry {
                provider: "openai".to_string(),
                model: "gpt-4o".to_string(),
                cost: 12.5,
                tokens: 4_000,
                requests: 3,
            }],
        }
    }

    #[test]
    fn thresholds_must_be_reached() {
        let ctx = context();
        assert!(conditions_hold(
            &rule(RuleConditions {
                cost_threshold: Some(12.5),
                usage_threshold: Some(4_000),
                ..Default::default()
            }),
            &ctx
        ));
        assert!(!conditions_hold(
            &rule(RuleConditions {
                cost_threshold: Some(13.0),
                ..Default::default()
            }),
            &ctx
        ));
    }

    #[test]
    fn filters_match_any_usage_entry() {
        let ctx = context();
        let matching = rule(RuleConditions {
            provider_filters: vec!["OPENAI".to_string()],
            model_filters: vec!["gpt-4o".to_string()],
            ..Default::default()
        });
        assert!(conditions_hold(&matching, &ctx));

        let other = rule(RuleConditions {
            provider_filters: vec!["anthropic".to_string()],
            ..Default::default()
        });
        assert!(!conditions_hold(&other, &ctx));
    }

    #[test]
    fn custom_conditions_read_context_fields() {
        let ctx = context();
        let condition = |field: &str, operator: &str, value: Value| CustomCondition {
            field: field.to_string(),
            operator: operator.to_string(),
            value,
        };
        let holds = rule(RuleConditions {
            custom_conditions: vec![
                condition("cost_increase", "gt", json!(20)),
                condition("request_count", "eq", json!(3)),
                condition("usage_data.0.model", "contains", json!("gpt")),
            ],
            ..Default::default()
        });
        assert!(conditions_hold(&holds, &ctx));

        let missing_field = rule(RuleConditions {
            custom_conditions: vec![condition("nope", "neq", json!(1))],
            ..Default::default()
        });
        assert!(!conditions_hold(&missing_field, &ctx));
    }

    #[test]
    fn threshold_uses_comparison_operator() {
        let ctx = context();
        let mut below = rule(RuleConditions::default());
        below.threshold = Some(20.0);
        below.comparison_op = Some("lt".to_string());
        assert!(conditions_hold(&below, &ctx));

        below.comparison_op = Some("gte".to_string());
        assert!(!conditions_hold(&below, &ctx));
    }

    #[test]
    fn cooldown_and_daily_cap_throttle() {
        let now = Utc::now();
        let mut recent = rule(RuleConditions::default());
        recent.last_triggered_at = Some(rfc3339(now - Duration::minutes(5)));
        assert!(throttled(&recent, now));

        let mut capped = rule(RuleConditions::default());
        capped.last_triggered_at = Some(rfc3339(now - Duration::minutes(90)));
        capped.trigger_day = Some(utc_day(now));
        capped.trigger_count = 2;
        assert!(throttled(&capped, now));

        capped.trigger_day = Some("2000-01-01".to_string());
        assert!(!throttled(&capped, now));
        assert_eq!(next_trigger_count(&capped, now), 1);
    }

    #[test]
    fn oversized_windows_and_cooldowns_do_not_overflow() {
        let now = Utc::now();
        assert!(window_starts(now, 60).is_some());
        assert!(window_starts(now, 200_000_000_000).is_none());
        assert!(window_starts(now, i64::MAX).is_none());

        let mut endless = rule(RuleConditions::default());
        endless.cooldown_minutes = i64::MAX;
        endless.last_triggered_at = Some(rfc3339(now - Duration::days(365)));
        assert!(throttled(&endless, now));
    }

    #[tokio::test]
    async fn empty_window_reports_positive_zero_cost() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE usage_logs (user_id INTEGER, provider TEXT, model TEXT, cost REAL, total_tokens INTEGER, created_at TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let context = build_context(&pool, 1, 60, Utc::now()).await.unwrap();
        assert_eq!(context.current_cost, 0.0);
        assert!(context.current_cost.is_sign_positive());
        assert_eq!(serde_json::to_string(&context.current_cost).unwrap(), "0.0");

        let error = build_context(&pool, 1, i64::MAX, Utc::now()).await.unwrap_err();
        assert!(matches!(error, ServiceError::BadRequest(_)));
    }

    #[test]
    fn cost_increase_handles_empty_previous_window() {
        assert_eq!(cost_increase(5.0, 0.0), 100.0);
        assert_eq!(cost_increase(0.0, 0.0), 0.0);
        assert_eq!(cost_increase(15.0, 10.0), 50.0);
    }

    #[test]
    fn timeframes_read_naturally() {
        assert_eq!(timeframe(1440), "24 hours");
        assert_eq!(timeframe(2880), "2 days");
        assert_eq!(timeframe(120), "2 hours");
        assert_eq!(timeframe(45), "45 minutes");
    }
}
