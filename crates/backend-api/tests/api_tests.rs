use std::str::FromStr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN,
            ACCESS_CONTROL_REQUEST_HEADERS, ACCESS_CONTROL_REQUEST_METHOD, AUTHORIZATION,
            CONTENT_TYPE, ORIGIN,
        },
        Method, Request, StatusCode,
    },
    response::IntoResponse,
    Router,
};
use costguard_auth::{Authenticator, KeyVault};
use costguard_backend_api::{build_router, ApiError, AppState};
use costguard_backend_runtime::BackendServices;
use costguard_config::AppConfig;
use costguard_orchestrator::Orchestrator;
use http_body_util::BodyExt;
use httpmock::prelude::*;
use serde_json::{json, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tempfile::TempDir;
use tower::ServiceExt;

type TestResult<T = ()> = anyhow::Result<T>;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

struct TestContext {
    _temp_dir: TempDir,
    pool: SqlitePool,
    state: AppState,
}

impl TestContext {
    async fn new() -> TestResult<Self> {
        Self::with_config(AppConfig::default()).await
    }

    /// Points every provider at the mock server.
    async fn with_providers(server: &MockServer) -> TestResult<Self> {
        let mut config = AppConfig::default();
        let base = server.base_url();
        config.providers.openai.base_url = format!("{base}/v1");
        config.providers.anthropic.base_url = format!("{base}/anthropic");
        config.providers.google.base_url = format!("{base}/gemini");
        Self::with_config(config).await
    }

    async fn with_config(config: AppConfig) -> TestResult<Self> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("backend_api.sqlite");
        let db_url = format!("sqlite://{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        let services = BackendServices {
            config: Arc::new(config.clone()),
            db_pool: pool.clone(),
            authenticator: Authenticator::new(pool.clone(), config.auth.clone()),
            orchestrator: Arc::new(Orchestrator::new(&config)?),
            vault: Arc::new(KeyVault::new(&config.security.encryption_key)),
        };

        Ok(Self {
            _temp_dir: temp_dir,
            pool,
            state: AppState::new(&services),
        })
    }

    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResult<(StatusCode, Value)> {
        let (status, bytes) = self.send_raw(method, uri, token, body).await?;
        let payload = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, payload))
    }

    async fn send_raw(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> TestResult<(StatusCode, Vec<u8>)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.router().oneshot(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes().to_vec();
        Ok((status, bytes))
    }

    async fn register(&self, email: &str) -> TestResult<String> {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({ "email": email, "password": "correct-horse", "display_name": "Test User" })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "register failed: {body}");
        body["token"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("register response has no token: {body}"))
    }

    async fn create_thread(&self, token: &str) -> TestResult<String> {
        let (status, body) = self
            .send(
                Method::POST,
                "/api/threads",
                Some(token),
                Some(json!({ "title": "Budget review" })),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "create thread failed: {body}");
        Ok(body["thread"]["id"].as_str().unwrap_or_default().to_owned())
    }
}

fn cost_rule(name: &str) -> Value {
    json!({
        "name": name,
        "type": "COST_ALERT",
        "conditions": { "cost_threshold": 0.5 },
        "priority": "HIGH"
    })
}

fn sse_data(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim().to_owned())
        .collect()
}

mod router_tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() -> TestResult {
        let ctx = TestContext::new().await?;
        let (status, body) = ctx.send(Method::GET, "/health", None, None).await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap_or_default())?;
        Ok(())
    }

    #[tokio::test]
    async fn openapi_document_lists_rest_surface() -> TestResult {
        let ctx = TestContext::new().await?;
        let (status, body) = ctx
            .send(Method::GET, "/api-docs/openapi.json", None, None)
            .await?;

        assert_eq!(status, StatusCode::OK);
        let paths = body["paths"].as_object().cloned().unwrap_or_default();
        assert!(paths.contains_key("/api/notifications/rules"));
        assert!(paths.contains_key("/api/usage"));
        assert!(body["components"]["securitySchemes"]["bearerAuth"].is_object());
        Ok(())
    }

    #[tokio::test]
    async fn cors_preflight_allows_any_origin() -> TestResult {
        let ctx = TestContext::new().await?;
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/threads")
            .header(ORIGIN, "https://example.com")
            .header(ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(ACCESS_CONTROL_REQUEST_HEADERS, "authorization, content-type")
            .body(Body::empty())?;

        let response = ctx.router().oneshot(request).await?;
        let allow_origin = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(allow_origin, "*");

        let allow_headers = response
            .headers()
            .get(ACCESS_CONTROL_ALLOW_HEADERS)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        assert!(allow_headers.contains("authorization"));
        Ok(())
    }

    #[tokio::test]
    async fn api_error_renders_details() -> TestResult {
        let response = ApiError::forbidden("nope")
            .with_details(json!({ "invalid_ids": ["a"] }))
            .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = response.into_body().collect().await?.to_bytes();
        let payload: Value = serde_json::from_slice(&body)?;
        assert_eq!(payload["error"], "nope");
        assert_eq!(payload["details"]["invalid_ids"][0], "a");
        Ok(())
    }
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn register_then_read_profile() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("owner@acme.test").await?;

        let (status, me) = ctx.send(Method::GET, "/api/me", Some(&token), None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(me["email"], "owner@acme.test");
        assert_eq!(me["role"], "ADMIN");

        let (status, org) = ctx
            .send(Method::GET, "/api/organization", Some(&token), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(org["organization"]["member_count"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_email_and_bad_password_are_rejected() -> TestResult {
        let ctx = TestContext::new().await?;
        ctx.register("dup@acme.test").await?;

        let (status, _) = ctx
            .send(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({ "email": "dup@acme.test", "password": "correct-horse" })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = ctx
            .send(
                Method::POST,
                "/api/auth/login",
                None,
                Some(json!({ "email": "dup@acme.test", "password": "wrong-password" })),
            )
            .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn protected_routes_require_bearer_token() -> TestResult {
        let ctx = TestContext::new().await?;
        let (status, body) = ctx.send(Method::GET, "/api/threads", None, None).await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = ctx
            .send(Method::GET, "/api/threads", Some("not-a-session"), None)
            .await?;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        Ok(())
    }

    #[tokio::test]
    async fn google_login_requires_configuration() -> TestResult {
        let ctx = TestContext::new().await?;
        let (status, _) = ctx
            .send(
                Method::GET,
                "/api/auth/google/login?redirect_uri=https%3A%2F%2Fexample.com%2Fcb",
                None,
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }
}

mod rule_tests {
    use super::*;

    #[tokio::test]
    async fn create_rule_returns_dry_run() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("rules@acme.test").await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/rules",
                Some(&token),
                Some(cost_rule("Daily spend")),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["data"]["name"], "Daily spend");
        assert_eq!(body["data"]["time_window"], 1440);
        assert_eq!(body["data"]["channels"][0]["type"], "IN_APP");
        assert_eq!(body["test_evaluation"]["would_trigger"], false);
        assert_eq!(body["test_evaluation"]["usage_data_count"], 0);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_name_and_bad_cron_are_rejected() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("dupes@acme.test").await?;

        ctx.send(
            Method::POST,
            "/api/notifications/rules",
            Some(&token),
            Some(cost_rule("Spend")),
        )
        .await?;
        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/rules",
                Some(&token),
                Some(cost_rule("Spend")),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Rule name already exists");

        let mut rule = cost_rule("Scheduled");
        rule["schedule"] = json!("every day");
        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/rules",
                Some(&token),
                Some(rule),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid cron expression");
        Ok(())
    }

    #[tokio::test]
    async fn rules_are_private_to_their_owner() -> TestResult {
        let ctx = TestContext::new().await?;
        let owner = ctx.register("owner@one.test").await?;
        let other = ctx.register("other@two.test").await?;

        let (_, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/rules",
                Some(&owner),
                Some(cost_rule("Mine")),
            )
            .await?;
        let rule_id = body["data"]["id"].as_str().unwrap_or_default().to_owned();

        let (status, _) = ctx
            .send(
                Method::GET,
                &format!("/api/notifications/rules/{rule_id}"),
                Some(&other),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, page) = ctx
            .send(Method::GET, "/api/notifications/rules", Some(&owner), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["pagination"]["total"], 1);
        assert_eq!(page["data"][0]["channel_count"], 1);

        let (status, _) = ctx
            .send(
                Method::GET,
                "/api/notifications/rules?limit=51",
                Some(&owner),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn oversized_windows_and_pages_are_rejected() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("bounds@acme.test").await?;

        for (field, value) in [
            ("time_window", json!(i64::MAX)),
            ("time_window", json!(0)),
            ("cooldown_minutes", json!(i64::MAX)),
            ("cooldown_minutes", json!(-1)),
        ] {
            let mut rule = cost_rule("Huge window");
            rule[field] = value;
            let (status, body) = ctx
                .send(
                    Method::POST,
                    "/api/notifications/rules",
                    Some(&token),
                    Some(rule),
                )
                .await?;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{field}: {body}");
        }

        let (status, body) = ctx
            .send(
                Method::GET,
                &format!("/api/notifications/rules?page={}", i64::MAX),
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Page is out of range");

        // The largest accepted window still evaluates.
        let mut rule = cost_rule("Year long");
        rule["time_window"] = json!(525_600);
        rule["cooldown_minutes"] = json!(525_600);
        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/rules",
                Some(&token),
                Some(rule),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        Ok(())
    }
}

mod usage_tests {
    use super::*;

    #[tokio::test]
    async fn manual_usage_fires_matching_rule_once() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("spend@acme.test").await?;

        let (_, rule) = ctx
            .send(
                Method::POST,
                "/api/notifications/rules",
                Some(&token),
                Some(cost_rule("Half a dollar")),
            )
            .await?;
        let rule_id = rule["data"]["id"].as_str().unwrap_or_default().to_owned();

        let usage = json!({
            "provider": "openai",
            "model": "gpt-4o",
            "input_tokens": 1000,
            "output_tokens": 500,
            "cost": 1.25
        });
        for _ in 0..2 {
            let (status, body) = ctx
                .send(Method::POST, "/api/usage", Some(&token), Some(usage.clone()))
                .await?;
            assert_eq!(status, StatusCode::CREATED, "{body}");
        }

        // The second usage row lands inside the rule's cooldown.
        let (status, list) = ctx
            .send(Method::GET, "/api/notifications", Some(&token), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["total"], 1);
        assert_eq!(list["unread_count"], 1);
        assert_eq!(list["notifications"][0]["rule_id"], rule_id.as_str());
        assert_eq!(list["notifications"][0]["status"], "DELIVERED");

        let (_, report) = ctx
            .send(Method::GET, "/api/usage?days=7", Some(&token), None)
            .await?;
        assert_eq!(report["total_records"], 2);
        assert_eq!(report["summary"]["total_cost"], 2.5);
        assert_eq!(report["summary"]["by_provider"]["openai"]["requests"], 2);

        let trigger_count: i64 =
            sqlx::query_scalar("SELECT trigger_count FROM notification_rules WHERE public_id = ?")
                .bind(&rule_id)
                .fetch_one(&ctx.pool)
                .await?;
        assert_eq!(trigger_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn manual_usage_requires_provider_and_model() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("missing@acme.test").await?;

        let (status, _) = ctx
            .send(
                Method::POST,
                "/api/usage",
                Some(&token),
                Some(json!({ "model": "gpt-4o", "input_tokens": 10 })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        Ok(())
    }

    #[tokio::test]
    async fn usage_logs_paginate() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("pages@acme.test").await?;

        for tokens in [10, 20, 30] {
            ctx.send(
                Method::POST,
                "/api/usage",
                Some(&token),
                Some(json!({ "provider": "anthropic", "model": "claude-3.5-haiku", "input_tokens": tokens })),
            )
            .await?;
        }

        let (status, page) = ctx
            .send(Method::GET, "/api/usage-logs?page=1&limit=2", Some(&token), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["data"].as_array().map(Vec::len), Some(2));
        assert_eq!(page["pagination"]["total_pages"], 2);
        assert_eq!(page["pagination"]["has_more"], true);

        let (status, body) = ctx
            .send(
                Method::GET,
                &format!("/api/usage-logs?page={}&limit=50", i64::MAX),
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Page is out of range");
        Ok(())
    }

    #[tokio::test]
    async fn manual_usage_rejects_negative_cost_and_token_overflow() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("refund@acme.test").await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/usage",
                Some(&token),
                Some(json!({ "provider": "openai", "model": "gpt-4o", "cost": -10.0 })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Cost must be a non-negative number");

        let (status, _) = ctx
            .send(
                Method::POST,
                "/api/usage",
                Some(&token),
                Some(json!({
                    "provider": "openai",
                    "model": "gpt-4o",
                    "input_tokens": i64::MAX,
                    "output_tokens": 1
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, report) = ctx
            .send(Method::GET, "/api/usage?days=7", Some(&token), None)
            .await?;
        assert_eq!(report["total_records"], 0);
        Ok(())
    }
}

mod notification_tests {
    use super::*;

    async fn seed(ctx: &TestContext, token: &str) -> TestResult<Vec<String>> {
        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/bulk",
                Some(token),
                Some(json!({
                    "notifications": [
                        { "type": "SYSTEM", "title": "One", "message": "First" },
                        { "type": "COST_ALERT", "priority": "HIGH", "title": "Two", "message": "Second" },
                        { "type": "NOPE", "title": "Bad", "message": "Rejected" }
                    ]
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["created_count"], 2);
        assert_eq!(body["errors"][0]["index"], 2);

        Ok(body["results"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .iter()
            .filter_map(|result| result["id"].as_str().map(str::to_owned))
            .collect())
    }

    #[tokio::test]
    async fn bulk_action_rejects_foreign_ids() -> TestResult {
        let ctx = TestContext::new().await?;
        let owner = ctx.register("inbox@one.test").await?;
        let intruder = ctx.register("intruder@two.test").await?;
        let ids = seed(&ctx, &owner).await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/bulk",
                Some(&intruder),
                Some(json!({ "action": "mark_read", "notification_ids": ids })),
            )
            .await?;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["details"]["invalid_ids"].as_array().map(Vec::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn bulk_mark_read_then_delete_and_restore() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("bulk@acme.test").await?;
        let ids = seed(&ctx, &token).await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/bulk",
                Some(&token),
                Some(json!({ "action": "mark_read", "notification_ids": ids })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["affected_count"], 2);
        assert_eq!(body["requested_count"], 2);

        let (_, unread) = ctx
            .send(Method::GET, "/api/notifications/unread-count", Some(&token), None)
            .await?;
        assert_eq!(unread["count"], 0);

        let (status, _) = ctx
            .send(
                Method::DELETE,
                &format!("/api/notifications/{}", ids[0]),
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::OK);

        let (_, list) = ctx
            .send(Method::GET, "/api/notifications", Some(&token), None)
            .await?;
        assert_eq!(list["total"], 1);

        let (_, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/bulk",
                Some(&token),
                Some(json!({ "action": "restore", "notification_ids": ids })),
            )
            .await?;
        assert_eq!(body["affected_count"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn bulk_stats_count_and_analyze() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("stats@acme.test").await?;
        seed(&ctx, &token).await?;

        let (_, count) = ctx
            .send(
                Method::GET,
                "/api/notifications/bulk?action=count&type=SYSTEM",
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(count["count"], 1);

        let (_, analysis) = ctx
            .send(
                Method::GET,
                "/api/notifications/bulk?action=analyze",
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(analysis["total"], 2);
        assert_eq!(analysis["by_priority"]["HIGH"], 1);

        let (status, _) = ctx
            .send(
                Method::GET,
                "/api/notifications/bulk?action=explode",
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        Ok(())
    }
}

mod template_tests {
    use super::*;

    #[tokio::test]
    async fn only_admins_manage_templates() -> TestResult {
        let ctx = TestContext::new().await?;
        let admin = ctx.register("admin@shared.test").await?;
        let member = ctx.register("member@shared.test").await?;

        let template = json!({
            "name": "Spend",
            "type": "COST_ALERT",
            "channel": "IN_APP",
            "subject": "{{ provider }} alert",
            "body_template": "Spent {{ formatCurrency context.currentCost }} of {{ default context.budget \"none\" }}"
        });

        let (status, _) = ctx
            .send(
                Method::POST,
                "/api/notifications/templates",
                Some(&member),
                Some(template.clone()),
            )
            .await?;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, created) = ctx
            .send(
                Method::POST,
                "/api/notifications/templates",
                Some(&admin),
                Some(template),
            )
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        let template_id = created["data"]["id"].as_str().unwrap_or_default().to_owned();

        let (status, preview) = ctx
            .send(
                Method::POST,
                &format!("/api/notifications/templates/{template_id}/preview"),
                Some(&member),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert!(preview["preview"]["body"]
            .as_str()
            .unwrap_or_default()
            .starts_with("Spent $"));
        Ok(())
    }

    #[tokio::test]
    async fn unbalanced_template_is_rejected() -> TestResult {
        let ctx = TestContext::new().await?;
        let admin = ctx.register("admin@solo.test").await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/notifications/templates",
                Some(&admin),
                Some(json!({
                    "name": "Broken",
                    "type": "SYSTEM",
                    "channel": "IN_APP",
                    "body_template": "Hello {{ name"
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].is_array() || body["details"].is_object());
        Ok(())
    }
}

mod chat_tests {
    use super::*;

    #[tokio::test]
    async fn stream_without_key_reports_error_then_done() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("nokey@acme.test").await?;
        let thread_id = ctx.create_thread(&token).await?;

        let (status, body) = ctx
            .send_raw(
                Method::POST,
                "/api/chat/stream",
                Some(&token),
                Some(json!({
                    "thread_id": thread_id,
                    "message": "Summarise our spend",
                    "model_override": "gpt-4o-mini"
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK);

        let events = sse_data(&body);
        assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
        let error: Value = serde_json::from_str(&events[0])?;
        assert_eq!(error["type"], "error");
        assert_eq!(error["error"], "No API key found for openai");

        let (_, thread) = ctx
            .send(
                Method::GET,
                &format!("/api/threads/{thread_id}"),
                Some(&token),
                None,
            )
            .await?;
        assert_eq!(thread["messages"].as_array().map(Vec::len), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn stream_relays_tokens_and_records_usage() -> TestResult {
        let server = MockServer::start_async().await;
        let models = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/models");
                then.status(200).json_body(json!({ "data": [] }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(concat!(
                        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":2,\"total_tokens\":14}}\n\n",
                        "data: [DONE]\n\n"
                    ));
            })
            .await;

        let ctx = TestContext::with_providers(&server).await?;
        let token = ctx.register("stream@acme.test").await?;

        let (status, saved) = ctx
            .send(
                Method::POST,
                "/api/api-keys",
                Some(&token),
                Some(json!({ "provider": "openai", "key": "sk-test-1234567890" })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK, "{saved}");
        models.assert_async().await;

        let thread_id = ctx.create_thread(&token).await?;
        let (status, body) = ctx
            .send_raw(
                Method::POST,
                "/api/chat/stream",
                Some(&token),
                Some(json!({
                    "thread_id": thread_id,
                    "message": "Say hello",
                    "model_override": "gpt-4o-mini"
                })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK);

        let events: Vec<Value> = sse_data(&body)
            .iter()
            .filter(|data| data.as_str() != "[DONE]")
            .map(|data| serde_json::from_str(data))
            .collect::<Result<_, _>>()?;
        let content: String = events
            .iter()
            .filter(|event| event["type"] == "content")
            .filter_map(|event| event["content"].as_str())
            .collect();
        assert_eq!(content, "Hello");
        let metadata = events
            .iter()
            .find(|event| event["type"] == "metadata")
            .ok_or_else(|| anyhow::anyhow!("no metadata event"))?;
        assert_eq!(metadata["metadata"]["selected_model"], "gpt-4o-mini");

        let (_, logs) = ctx
            .send(Method::GET, "/api/usage-logs", Some(&token), None)
            .await?;
        assert_eq!(logs["pagination"]["total"], 1);
        assert_eq!(logs["data"][0]["prompt_tokens"], 12);
        assert_eq!(logs["data"][0]["operation"], "chat");
        Ok(())
    }

    #[tokio::test]
    async fn completion_requires_configured_key() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("complete@acme.test").await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/chat",
                Some(&token),
                Some(json!({ "message": "hi", "model": "claude-3.5-haiku" })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "ANTHROPIC API key not configured. Please add your API key in Settings."
        );

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/chat",
                Some(&token),
                Some(json!({ "message": "hi", "model": "made-up-model" })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid model");
        Ok(())
    }
}

mod budget_tests {
    use super::*;

    fn monthly_budget(amount: f64) -> Value {
        json!({
            "name": "Team AI spend",
            "amount": amount,
            "period": "MONTHLY",
            "alert_threshold": 0.5
        })
    }

    #[tokio::test]
    async fn admins_manage_budgets_members_only_read() -> TestResult {
        let ctx = TestContext::new().await?;
        let admin = ctx.register("lead@budget.test").await?;
        let member = ctx.register("dev@budget.test").await?;

        let (status, body) = ctx
            .send(Method::POST, "/api/budgets", Some(&member), Some(monthly_budget(50.0)))
            .await?;
        assert_eq!(status, StatusCode::FORBIDDEN, "{body}");

        let (status, created) = ctx
            .send(Method::POST, "/api/budgets", Some(&admin), Some(monthly_budget(50.0)))
            .await?;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        assert_eq!(created["budget"]["spent"], 0.0);
        assert_eq!(created["budget"]["alert_triggered"], false);
        let budget_id = created["budget"]["id"].as_str().unwrap_or_default().to_owned();

        let (status, list) = ctx
            .send(Method::GET, "/api/budgets", Some(&member), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["budgets"].as_array().map(Vec::len), Some(1));

        let (status, _) = ctx
            .send(
                Method::DELETE,
                &format!("/api/budgets/{budget_id}"),
                Some(&member),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, updated) = ctx
            .send(
                Method::PUT,
                &format!("/api/budgets/{budget_id}"),
                Some(&admin),
                Some(json!({ "amount": 75.0, "is_active": false })),
            )
            .await?;
        assert_eq!(status, StatusCode::OK, "{updated}");
        assert_eq!(updated["budget"]["amount"], 75.0);

        let (_, active) = ctx
            .send(Method::GET, "/api/budgets", Some(&admin), None)
            .await?;
        assert_eq!(active["budgets"].as_array().map(Vec::len), Some(0));
        let (_, all) = ctx
            .send(Method::GET, "/api/budgets?active_only=false", Some(&admin), None)
            .await?;
        assert_eq!(all["budgets"].as_array().map(Vec::len), Some(1));

        let (status, _) = ctx
            .send(
                Method::DELETE,
                &format!("/api/budgets/{budget_id}"),
                Some(&admin),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn budgets_are_invisible_to_other_organizations() -> TestResult {
        let ctx = TestContext::new().await?;
        let owner = ctx.register("admin@first.test").await?;
        let outsider = ctx.register("admin@second.test").await?;

        let (_, created) = ctx
            .send(Method::POST, "/api/budgets", Some(&owner), Some(monthly_budget(10.0)))
            .await?;
        let budget_id = created["budget"]["id"].as_str().unwrap_or_default().to_owned();

        for method in [Method::GET, Method::DELETE] {
            let (status, _) = ctx
                .send(
                    method,
                    &format!("/api/budgets/{budget_id}"),
                    Some(&outsider),
                    None,
                )
                .await?;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
        let (status, _) = ctx
            .send(
                Method::PUT,
                &format!("/api/budgets/{budget_id}"),
                Some(&outsider),
                Some(json!({ "amount": 1.0 })),
            )
            .await?;
        assert_eq!(status, StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_budgets_are_rejected() -> TestResult {
        let ctx = TestContext::new().await?;
        let admin = ctx.register("admin@invalid.test").await?;

        let (status, body) = ctx
            .send(
                Method::POST,
                "/api/budgets",
                Some(&admin),
                Some(json!({ "name": "", "amount": -1, "period": "HOURLY", "alert_threshold": 2 })),
            )
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"].as_array().map(Vec::len), Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn crossing_the_threshold_warns_once_per_period() -> TestResult {
        let ctx = TestContext::new().await?;
        let admin = ctx.register("cfo@alerts.test").await?;
        ctx.send(Method::POST, "/api/budgets", Some(&admin), Some(monthly_budget(1.0)))
            .await?;

        let usage = |cost: f64| json!({ "provider": "openai", "model": "gpt-4o", "cost": cost });
        ctx.send(Method::POST, "/api/usage", Some(&admin), Some(usage(0.25)))
            .await?;
        let (_, list) = ctx
            .send(Method::GET, "/api/notifications", Some(&admin), None)
            .await?;
        assert_eq!(list["total"], 0);

        for cost in [0.5, 0.5] {
            let (status, body) = ctx
                .send(Method::POST, "/api/usage", Some(&admin), Some(usage(cost)))
                .await?;
            assert_eq!(status, StatusCode::CREATED, "{body}");
        }

        let (_, list) = ctx
            .send(Method::GET, "/api/notifications", Some(&admin), None)
            .await?;
        assert_eq!(list["total"], 1);
        let warning = &list["notifications"][0];
        assert_eq!(warning["type"], "BUDGET_WARNING");
        assert_eq!(warning["priority"], "HIGH");
        assert_eq!(warning["title"], "Budget warning: Team AI spend");
        assert_eq!(warning["data"]["spent"], 0.75);

        let (_, budgets) = ctx
            .send(Method::GET, "/api/budgets", Some(&admin), None)
            .await?;
        assert_eq!(budgets["budgets"][0]["is_over_budget"], true);
        assert_eq!(budgets["budgets"][0]["alert_triggered"], true);
        Ok(())
    }
}

mod websocket_tests {
    use std::{net::SocketAddr, time::Duration};

    use futures_util::{SinkExt, StreamExt};
    use tokio::{net::TcpStream, time::timeout};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{Error as WsError, Message},
        MaybeTlsStream, WebSocketStream,
    };

    use super::*;

    type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(ctx: &TestContext) -> TestResult<SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = ctx.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok(addr)
    }

    async fn connect(addr: SocketAddr, token: &str) -> TestResult<Socket> {
        let (socket, _) = connect_async(format!("ws://{addr}/ws?token={token}")).await?;
        Ok(socket)
    }

    async fn emit(socket: &mut Socket, event: Value) -> TestResult {
        socket.send(Message::Text(event.to_string())).await?;
        Ok(())
    }

    /// Next server event of type `kind`, skipping any others.
    async fn expect(socket: &mut Socket, kind: &str) -> TestResult<Value> {
        loop {
            let message = timeout(Duration::from_secs(5), socket.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for {kind}"))?
                .ok_or_else(|| anyhow::anyhow!("socket closed while waiting for {kind}"))??;
            if let Message::Text(text) = message {
                let event: Value = serde_json::from_str(&text)?;
                if event["type"] == kind {
                    return Ok(event);
                }
            }
        }
    }

    async fn join(socket: &mut Socket, thread_id: &str) -> TestResult<Value> {
        emit(socket, json!({ "type": "thread:join", "thread_id": thread_id })).await?;
        expect(socket, "thread:joined").await
    }

    #[tokio::test]
    async fn upgrade_requires_a_valid_session() -> TestResult {
        let ctx = TestContext::new().await?;
        let addr = serve(&ctx).await?;

        for url in [format!("ws://{addr}/ws"), format!("ws://{addr}/ws?token=forged")] {
            match connect_async(url).await {
                Err(WsError::Http(response)) => {
                    assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
                }
                Err(other) => anyhow::bail!("unexpected handshake error: {other}"),
                Ok(_) => anyhow::bail!("handshake without a session must fail"),
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn threads_of_other_users_cannot_be_joined() -> TestResult {
        let ctx = TestContext::new().await?;
        let owner = ctx.register("owner@ws.test").await?;
        let intruder = ctx.register("intruder@elsewhere.test").await?;
        let thread_id = ctx.create_thread(&owner).await?;
        let addr = serve(&ctx).await?;

        let mut socket = connect(addr, &intruder).await?;
        let connected = expect(&mut socket, "connected").await?;
        assert!(connected["user_id"].is_string());

        emit(&mut socket, json!({ "type": "thread:join", "thread_id": thread_id })).await?;
        let error = expect(&mut socket, "error").await?;
        assert_eq!(error["message"], "Thread not found");

        // Not joined, so typing is refused as well.
        emit(&mut socket, json!({ "type": "typing:start", "thread_id": thread_id })).await?;
        let error = expect(&mut socket, "error").await?;
        assert_eq!(error["message"], "Join the thread first");
        Ok(())
    }

    #[tokio::test]
    async fn typing_and_presence_need_a_join() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("typist@ws.test").await?;
        let thread_id = ctx.create_thread(&token).await?;
        let addr = serve(&ctx).await?;
        let mut socket = connect(addr, &token).await?;

        emit(&mut socket, json!({ "type": "typing:start", "thread_id": thread_id })).await?;
        assert_eq!(expect(&mut socket, "error").await?["message"], "Join the thread first");

        emit(
            &mut socket,
            json!({ "type": "presence:update", "thread_id": thread_id, "status": "away" }),
        )
        .await?;
        assert_eq!(expect(&mut socket, "error").await?["message"], "Join the thread first");

        let joined = join(&mut socket, &thread_id).await?;
        assert_eq!(joined["presence"].as_array().map(Vec::len), Some(1));

        emit(&mut socket, json!({ "type": "typing:start", "thread_id": thread_id })).await?;
        let typing = expect(&mut socket, "typing:update").await?;
        assert_eq!(typing["is_typing"], true);

        emit(&mut socket, json!({ "type": "bogus" })).await?;
        assert_eq!(expect(&mut socket, "error").await?["message"], "Invalid event format");

        emit(&mut socket, json!({ "type": "ping" })).await?;
        expect(&mut socket, "pong").await?;
        Ok(())
    }

    #[tokio::test]
    async fn message_send_streams_the_turn_to_subscribers() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("sender@ws.test").await?;
        let thread_id = ctx.create_thread(&token).await?;
        let addr = serve(&ctx).await?;
        let mut socket = connect(addr, &token).await?;
        join(&mut socket, &thread_id).await?;

        emit(
            &mut socket,
            json!({
                "type": "message:send",
                "thread_id": thread_id,
                "content": "How much did we spend?",
                "model_override": "gpt-4o-mini"
            }),
        )
        .await?;

        let message = expect(&mut socket, "message:new").await?;
        assert_eq!(message["message"]["content"], "How much did we spend?");
        let error = expect(&mut socket, "chat:error").await?;
        assert_eq!(error["error"], "No API key found for openai");
        let done = expect(&mut socket, "chat:done").await?;
        assert_eq!(done["thread_id"], thread_id.as_str());
        Ok(())
    }

    #[tokio::test]
    async fn message_send_is_chat_rate_limited() -> TestResult {
        let mut config = AppConfig::default();
        config.rate_limit.chat_requests = 1;
        let ctx = TestContext::with_config(config).await?;
        let token = ctx.register("chatty@ws.test").await?;
        let thread_id = ctx.create_thread(&token).await?;
        let addr = serve(&ctx).await?;
        let mut socket = connect(addr, &token).await?;
        join(&mut socket, &thread_id).await?;

        let send = json!({
            "type": "message:send",
            "thread_id": thread_id,
            "content": "hello",
            "model_override": "gpt-4o-mini"
        });
        emit(&mut socket, send.clone()).await?;
        expect(&mut socket, "chat:done").await?;

        emit(&mut socket, send).await?;
        let error = expect(&mut socket, "error").await?;
        assert_eq!(error["message"], "Rate limit exceeded. Please try again later.");

        let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE role = 'user'")
            .fetch_one(&ctx.pool)
            .await?;
        assert_eq!(stored, 1);
        Ok(())
    }

    #[tokio::test]
    async fn second_socket_keeps_the_thread_after_the_first_leaves() -> TestResult {
        let ctx = TestContext::new().await?;
        let token = ctx.register("tabs@ws.test").await?;
        let thread_id = ctx.create_thread(&token).await?;
        let addr = serve(&ctx).await?;

        let mut first = connect(addr, &token).await?;
        let mut second = connect(addr, &token).await?;
        join(&mut first, &thread_id).await?;
        let joined = join(&mut second, &thread_id).await?;
        assert_eq!(joined["presence"].as_array().map(Vec::len), Some(1));

        emit(&mut first, json!({ "type": "thread:leave", "thread_id": thread_id })).await?;
        expect(&mut first, "thread:left").await?;

        emit(&mut second, json!({ "type": "typing:start", "thread_id": thread_id })).await?;
        let typing = expect(&mut second, "typing:update").await?;
        assert_eq!(typing["thread_id"], thread_id.as_str());

        // Joining again from the first tab subscribes afresh.
        let rejoined = join(&mut first, &thread_id).await?;
        assert_eq!(rejoined["presence"].as_array().map(Vec::len), Some(1));
        emit(&mut second, json!({ "type": "typing:stop", "thread_id": thread_id })).await?;
        let typing = expect(&mut first, "typing:update").await?;
        assert_eq!(typing["is_typing"], false);
        Ok(())
    }
}
