mod error;
mod middleware;
mod rate_limit;
mod realtime;
mod state;
mod util;

pub mod docs;
pub mod routes;
pub mod services;

pub use error::{ApiError, ErrorResponse};
pub use rate_limit::{Bucket, RateLimiter};
pub use realtime::{ServerEvent, ThreadHub, UserHub};
pub use state::{AppState, OAuthStateStore};

use axum::{
    http::header::{AUTHORIZATION, CONTENT_TYPE},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api-docs/openapi.json", get(openapi_json))
        // Auth
        .route("/api/auth/register", post(routes::auth::register))
        .route("/api/auth/login", post(routes::auth::login))
        .route("/api/auth/google/login", get(routes::auth::google_login))
        .route(
            "/api/auth/google/callback",
            post(routes::auth::google_callback),
        )
        .route("/api/auth/logout", post(routes::auth::logout))
        .route(
            "/api/me",
            get(routes::auth::current_user).patch(routes::auth::update_current_user),
        )
        // Organization
        .route(
            "/api/organization",
            get(routes::organization::get_organization)
                .patch(routes::organization::update_organization),
        )
        .route(
            "/api/organization/members",
            get(routes::organization::list_members),
        )
        // Budgets
        .route(
            "/api/budgets",
            get(routes::budgets::list_budgets).post(routes::budgets::create_budget),
        )
        .route(
            "/api/budgets/:budget_id",
            get(routes::budgets::get_budget)
                .put(routes::budgets::update_budget)
                .delete(routes::budgets::delete_budget),
        )
        // Provider keys
        .route(
            "/api/api-keys",
            get(routes::api_keys::list_api_keys)
                .post(routes::api_keys::save_api_key)
                .delete(routes::api_keys::delete_api_key)
                .patch(routes::api_keys::test_api_key),
        )
        // Models and selection
        .route("/api/models", get(routes::models::list_models))
        .route(
            "/api/models/recommend",
            post(routes::models::recommend_model),
        )
        .route(
            "/api/preferences",
            get(routes::preferences::get_preferences).put(routes::preferences::update_preferences),
        )
        // Threads
        .route(
            "/api/threads",
            get(routes::threads::list_threads).post(routes::threads::create_thread),
        )
        .route(
            "/api/threads/:thread_id",
            get(routes::threads::get_thread)
                .patch(routes::threads::update_thread)
                .delete(routes::threads::delete_thread),
        )
        // Chat
        .route("/api/chat", post(routes::chat::chat_completion))
        .route("/api/chat/stream", post(routes::chat::chat_stream))
        .route("/api/chat/models", get(routes::models::available_models))
        // Usage
        .route(
            "/api/usage",
            get(routes::usage::usage_report).post(routes::usage::record_usage),
        )
        .route("/api/usage-logs", get(routes::usage::list_usage_logs))
        // Notification rules
        .route(
            "/api/notifications/rules",
            get(routes::rules::list_rules).post(routes::rules::create_rule),
        )
        .route(
            "/api/notifications/rules/:rule_id",
            get(routes::rules::get_rule)
                .put(routes::rules::update_rule)
                .delete(routes::rules::delete_rule),
        )
        .route(
            "/api/notifications/rules/:rule_id/test",
            post(routes::rules::test_rule),
        )
        // Notification templates
        .route(
            "/api/notifications/templates",
            get(routes::templates::list_templates).post(routes::templates::create_template),
        )
        .route(
            "/api/notifications/templates/:template_id",
            get(routes::templates::get_template)
                .put(routes::templates::update_template)
                .delete(routes::templates::delete_template),
        )
        .route(
            "/api/notifications/templates/:template_id/preview",
            post(routes::templates::preview_template),
        )
        // Notifications
        .route(
            "/api/notifications",
            get(routes::notifications::list_notifications),
        )
        .route(
            "/api/notifications/unread-count",
            get(routes::notifications::unread_count),
        )
        .route(
            "/api/notifications/mark-all-read",
            post(routes::notifications::mark_all_read),
        )
        .route(
            "/api/notifications/bulk",
            get(routes::notifications::bulk_stats).post(routes::notifications::bulk_operation),
        )
        .route(
            "/api/notifications/:notification_id",
            get(routes::notifications::get_notification)
                .patch(routes::notifications::update_notification)
                .delete(routes::notifications::delete_notification),
        )
        // WebSocket route
        .route("/ws", get(routes::websocket::websocket_handler))
        .layer(from_fn_with_state(
            state.clone(),
            rate_limit::api_rate_limit,
        ))
        .with_state(state)
        .layer(from_fn(middleware::logging_middleware))
        .layer(middleware::trace_layer())
        .layer(cors_layer())
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(docs::ApiDoc::openapi())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
}
