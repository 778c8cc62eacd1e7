//! Organization spending budgets. Spend is measured live from the usage log
//! over the budget's current calendar period.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, TimeZone, Utc};
use costguard_auth::{Permission, User};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, SqlitePool};
use utoipa::ToSchema;

use super::{
    error::ServiceError,
    notifications::{self, NewNotification, Notification},
    templates,
    vocabulary::{BudgetPeriod, Channel, NotificationStatus, NotificationType, Priority},
};
use crate::util::{now_rfc3339, rfc3339, round6};

const MAX_NAME_CHARS: usize = 100;
const DEFAULT_ALERT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct Budget {
    #[serde(skip)]
    pub id: i64,
    #[serde(rename = "id")]
    pub public_id: String,
    #[serde(skip)]
    pub organization_id: i64,
    pub name: String,
    pub amount: f64,
    pub period: String,
    /// Fraction of `amount` at which members are warned.
    pub alert_threshold: f64,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BudgetStatus {
    #[serde(flatten)]
    pub budget: Budget,
    pub spent: f64,
    pub percentage: f64,
    pub remaining: f64,
    pub is_over_budget: bool,
    pub alert_triggered: bool,
    pub period_start: String,
    pub period_end: String,
}

/// Body of both create and update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct BudgetRequest {
    pub name: Option<String>,
    pub amount: Option<f64>,
    pub period: Option<String>,
    pub alert_threshold: Option<f64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BudgetQuery {
    pub active_only: Option<bool>,
}

/// `[start, end)` of the calendar period containing `now`. Weeks start on Monday.
pub fn period_bounds(
    period: BudgetPeriod,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let today = now.date_naive();
    let (start, end) = match period {
        BudgetPeriod::Daily => (today, today.succ_opt()?),
        BudgetPeriod::Weekly => {
            let start = today
                .checked_sub_days(Days::new(u64::from(today.weekday().num_days_from_monday())))?;
            (start, start.checked_add_days(Days::new(7))?)
        }
        BudgetPeriod::Monthly => {
            let start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
            (start, start.checked_add_months(Months::new(1))?)
        }
        BudgetPeriod::Quarterly => {
            let first_month = today.month0() / 3 * 3 + 1;
            let start = NaiveDate::from_ymd_opt(today.year(), first_month, 1)?;
            (start, start.checked_add_months(Months::new(3))?)
        }
        BudgetPeriod::Yearly => {
            let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
            (start, start.checked_add_months(Months::new(12))?)
        }
    };
    let midnight = |date: NaiveDate| date.and_hms_opt(0, 0, 0).map(|at| Utc.from_utc_datetime(&at));
    Some((midnight(start)?, midnight(end)?))
}

fn period_label(period: BudgetPeriod) -> &'static str {
    match period {
        BudgetPeriod::Daily => "day",
        BudgetPeriod::Weekly => "week",
        BudgetPeriod::Monthly => "month",
        BudgetPeriod::Quarterly => "quarter",
        BudgetPeriod::Yearly => "year",
    }
}

fn validate(req: &BudgetRequest, creating: bool) -> Result<(), ServiceError> {
    let mut errors = Vec::new();

    match req.name.as_deref().map(str::trim) {
        Some(name) if name.is_empty() || name.chars().count() > MAX_NAME_CHARS => {
            errors.push(format!("name must be between 1 and {MAX_NAME_CHARS} characters"));
        }
        None if creating => errors.push("name is required".to_string()),
        _ => {}
    }
    match req.amount {
        Some(amount) if !amount.is_finite() || amount <= 0.0 => {
            errors.push("amount must be a positive number".to_string());
        }
        None if creating => errors.push("amount is required".to_string()),
        _ => {}
    }
    match req.period.as_deref() {
        Some(period) if BudgetPeriod::parse(period).is_none() => {
            errors.push("period must be one of DAILY, WEEKLY, MONTHLY, QUARTERLY, YEARLY".to_string());
        }
        None if creating => errors.push("period is required".to_string()),
        _ => {}
    }
    if req
        .alert_threshold
        .is_some_and(|threshold| !threshold.is_finite() || !(0.0..=1.0).contains(&threshold))
    {
        errors.push("alert_threshold must be between 0 and 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ServiceError::invalid("Invalid budget", errors))
    }
}

async fn period_spend(
    pool: &SqlitePool,
    organization_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<f64, ServiceError> {
    let spent: f64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(cost), 0.0) FROM usage_logs WHERE organization_id = ? AND created_at >= ? AND created_at < ?",
    )
    .bind(organization_id)
    .bind(rfc3339(start))
    .bind(rfc3339(end))
    .fetch_one(pool)
    .await?;
    Ok(round6(spent))
}

async fn with_spend(
    pool: &SqlitePool,
    budget: Budget,
    now: DateTime<Utc>,
) -> Result<BudgetStatus, ServiceError> {
    let period = BudgetPeriod::parse(&budget.period)
        .ok_or_else(|| ServiceError::Internal(format!("unknown budget period {}", budget.period)))?;
    let (start, end) = period_bounds(period, now)
        .ok_or_else(|| ServiceError::Internal("budget period is out of range".to_string()))?;
    let spent = period_spend(pool, budget.organization_id, start, end).await?;

    let percentage = if budget.amount > 0.0 {
        round6(spent / budget.amount * 100.0)
    } else {
        0.0
    };
    Ok(BudgetStatus {
        spent,
        percentage,
        remaining: round6((budget.amount - spent).max(0.0)),
        is_over_budget: spent > budget.amount,
        alert_triggered: spent > 0.0 && spent >= budget.amount * budget.alert_threshold,
        period_start: rfc3339(start),
        period_end: rfc3339(end),
        budget,
    })
}

const COLUMNS: &str = "id, public_id, organization_id, name, amount, period, alert_threshold, is_active, created_at, updated_at";

async fn find_budget(
    pool: &SqlitePool,
    organization_id: i64,
    public_id: &str,
) -> Result<Budget, ServiceError> {
    sqlx::query_as::<_, Budget>(&format!(
        "SELECT {COLUMNS} FROM budgets WHERE public_id = ? AND organization_id = ?"
    ))
    .bind(public_id)
    .bind(organization_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::not_found("Budget not found"))
}

pub async fn list_budgets(
    pool: &SqlitePool,
    organization_id: i64,
    query: &BudgetQuery,
) -> Result<Vec<BudgetStatus>, ServiceError> {
    let budgets = sqlx::query_as::<_, Budget>(&format!(
        "SELECT {COLUMNS} FROM budgets WHERE organization_id = ? AND (? = 0 OR is_active = 1) ORDER BY created_at DESC, id DESC"
    ))
    .bind(organization_id)
    .bind(query.active_only.unwrap_or(true))
    .fetch_all(pool)
    .await?;

    let now = Utc::now();
    let mut statuses = Vec::with_capacity(budgets.len());
    for budget in budgets {
        statuses.push(with_spend(pool, budget, now).await?);
    }
    Ok(statuses)
}

pub async fn get_budget(
    pool: &SqlitePool,
    organization_id: i64,
    public_id: &str,
) -> Result<BudgetStatus, ServiceError> {
    let budget = find_budget(pool, organization_id, public_id).await?;
    with_spend(pool, budget, Utc::now()).await
}

pub async fn create_budget(
    pool: &SqlitePool,
    user: &User,
    req: BudgetRequest,
) -> Result<BudgetStatus, ServiceError> {
    if !user.can(Permission::ManageBudgets) {
        return Err(ServiceError::forbidden(
            "Only administrators and managers can create budgets",
        ));
    }
    validate(&req, true)?;

    let public_id = costguard_auth::new_public_id();
    let now = now_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO budgets
            (public_id, organization_id, created_by, name, amount, period, alert_threshold, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&public_id)
    .bind(user.organization_id)
    .bind(user.id)
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.amount)
    .bind(&req.period)
    .bind(req.alert_threshold.unwrap_or(DEFAULT_ALERT_THRESHOLD))
    .bind(req.is_active.unwrap_or(true))
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    tracing::info!(budget = %public_id, organization = %user.organization_public_id, "budget created");
    get_budget(pool, user.organization_id, &public_id).await
}

pub async fn update_budget(
    pool: &SqlitePool,
    user: &User,
    public_id: &str,
    req: BudgetRequest,
) -> Result<BudgetStatus, ServiceError> {
    // Foreign budgets read as missing before the role is considered.
    find_budget(pool, user.organization_id, public_id).await?;
    if !user.can(Permission::ManageBudgets) {
        return Err(ServiceError::forbidden(
            "Only administrators and managers can update budgets",
        ));
    }
    validate(&req, false)?;

    sqlx::query(
        r#"
        UPDATE budgets
        SET name = COALESCE(?, name),
            amount = COALESCE(?, amount),
            period = COALESCE(?, period),
            alert_threshold = COALESCE(?, alert_threshold),
            is_active = COALESCE(?, is_active),
            updated_at = ?
        WHERE public_id = ? AND organization_id = ?
        "#,
    )
    .bind(req.name.as_deref().map(str::trim))
    .bind(req.amount)
    .bind(&req.period)
    .bind(req.alert_threshold)
    .bind(req.is_active)
    .bind(now_rfc3339())
    .bind(public_id)
    .bind(user.organization_id)
    .execute(pool)
    .await?;

    get_budget(pool, user.organization_id, public_id).await
}

pub async fn delete_budget(
    pool: &SqlitePool,
    user: &User,
    public_id: &str,
) -> Result<(), ServiceError> {
    find_budget(pool, user.organization_id, public_id).await?;
    if !user.can(Permission::ManageOrganization) {
        return Err(ServiceError::forbidden(
            "Only administrators can delete budgets",
        ));
    }

    sqlx::query("DELETE FROM budgets WHERE public_id = ? AND organization_id = ?")
        .bind(public_id)
        .bind(user.organization_id)
        .execute(pool)
        .await?;

    tracing::info!(budget = %public_id, organization = %user.organization_public_id, "budget deleted");
    Ok(())
}

/// Warns `user` about every active budget of their organization that crossed
/// its alert threshold. Each budget warns a user at most once per period.
pub async fn raise_budget_alerts(
    pool: &SqlitePool,
    user: &User,
    now: DateTime<Utc>,
) -> Result<Vec<Notification>, ServiceError> {
    let budgets = sqlx::query_as::<_, Budget>(&format!(
        "SELECT {COLUMNS} FROM budgets WHERE organization_id = ? AND is_active = 1 ORDER BY id"
    ))
    .bind(user.organization_id)
    .fetch_all(pool)
    .await?;

    let mut raised = Vec::new();
    for budget in budgets {
        let status = with_spend(pool, budget, now).await?;
        if !status.alert_triggered {
            continue;
        }

        let already_warned: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE user_id = ? AND notification_type = ?
              AND json_extract(data, '$.budget_id') = ?
              AND json_extract(data, '$.period_start') = ?
            "#,
        )
        .bind(user.id)
        .bind(NotificationType::BudgetWarning.as_str())
        .bind(&status.budget.public_id)
        .bind(&status.period_start)
        .fetch_one(pool)
        .await?;
        if already_warned > 0 {
            continue;
        }

        raised.push(warn(pool, user, &status).await?);
    }
    Ok(raised)
}

async fn warn(
    pool: &SqlitePool,
    user: &User,
    status: &BudgetStatus,
) -> Result<Notification, ServiceError> {
    let budget = &status.budget;
    let label = BudgetPeriod::parse(&budget.period).map_or("period", period_label);
    let variables = json!({
        "user": {
            "id": user.public_id,
            "name": user.display_name.clone().or_else(|| user.email.clone()).unwrap_or_default(),
        },
        "rule": { "id": budget.public_id, "name": budget.name },
        "context": {
            "currentCost": status.spent,
            "threshold": budget.amount,
            "timeframe": label,
            "percentage": status.percentage,
        },
    });

    let fallback_title = format!("Budget warning: {}", budget.name);
    let fallback_message = format!(
        "{} has used {:.1}% of its {} budget.",
        budget.name, status.percentage, label
    );
    let (title, message) = match templates::find_template(
        pool,
        NotificationType::BudgetWarning.as_str(),
        Channel::InApp.as_str(),
        "en",
    )
    .await
    {
        Ok(template) => {
            let rendered = templates::render_template(&template, &variables);
            (rendered.subject.unwrap_or(fallback_title), rendered.body)
        }
        Err(templates::TemplateError::NotFound { .. }) => (fallback_title, fallback_message),
        Err(error) => return Err(error.into()),
    };

    let notification = notifications::create_notification(
        pool,
        NewNotification {
            user_id: user.id,
            rule_id: None,
            notification_type: NotificationType::BudgetWarning,
            priority: if status.is_over_budget {
                Priority::Critical
            } else {
                Priority::High
            },
            title,
            message,
            data: json!({
                "budget_id": budget.public_id,
                "period_start": status.period_start,
                "spent": status.spent,
                "amount": budget.amount,
                "percentage": status.percentage,
            }),
            status: NotificationStatus::Delivered,
            expires_at: None,
        },
    )
    .await?;

    tracing::info!(
        budget = %budget.public_id,
        notification = %notification.public_id,
        spent = status.spent,
        "budget threshold crossed"
    );
    Ok(notification)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn periods_follow_the_utc_calendar() {
        // A Thursday in the middle of Q3.
        let now = at("2026-08-13T15:30:00Z");
        let bounds = |period| {
            let (start, end) = period_bounds(period, now).unwrap();
            (rfc3339(start), rfc3339(end))
        };

        assert_eq!(
            bounds(BudgetPeriod::Daily),
            ("2026-08-13T00:00:00.000Z".into(), "2026-08-14T00:00:00.000Z".into())
        );
        assert_eq!(
            bounds(BudgetPeriod::Weekly),
            ("2026-08-10T00:00:00.000Z".into(), "2026-08-17T00:00:00.000Z".into())
        );
        assert_eq!(
            bounds(BudgetPeriod::Monthly),
            ("2026-08-01T00:00:00.000Z".into(), "2026-09-01T00:00:00.000Z".into())
        );
        assert_eq!(
            bounds(BudgetPeriod::Quarterly),
            ("2026-07-01T00:00:00.000Z".into(), "2026-10-01T00:00:00.000Z".into())
        );
        assert_eq!(
            bounds(BudgetPeriod::Yearly),
            ("2026-01-01T00:00:00.000Z".into(), "2027-01-01T00:00:00.000Z".into())
        );
    }

    #[test]
    fn december_rolls_into_the_next_year() {
        let (start, end) =
            period_bounds(BudgetPeriod::Quarterly, at("2026-12-31T23:59:59Z")).unwrap();
        assert_eq!(rfc3339(start), "2026-10-01T00:00:00.000Z");
        assert_eq!(rfc3339(end), "2027-01-01T00:00:00.000Z");
    }

    #[test]
    fn creation_needs_name_amount_and_period() {
        let Err(ServiceError::Invalid(_, errors)) = validate(&BudgetRequest::default(), true) else {
            panic!("empty budget must be rejected");
        };
        assert_eq!(errors.len(), 3);

        assert!(validate(&BudgetRequest::default(), false).is_ok());
    }

    #[test]
    fn amounts_and_thresholds_are_bounded() {
        let request = BudgetRequest {
            name: Some("Monthly AI".into()),
            amount: Some(f64::NAN),
            period: Some("FORTNIGHTLY".into()),
            alert_threshold: Some(1.5),
            is_active: None,
        };
        let Err(ServiceError::Invalid(_, errors)) = validate(&request, true) else {
            panic!("bad budget must be rejected");
        };
        assert_eq!(errors.len(), 3);

        let negative = BudgetRequest {
            amount: Some(-5.0),
            ..BudgetRequest::default()
        };
        assert!(validate(&negative, false).is_err());
    }
}
