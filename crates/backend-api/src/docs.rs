use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::auth::register,
        crate::routes::auth::login,
        crate::routes::auth::google_login,
        crate::routes::auth::google_callback,
        crate::routes::auth::logout,
        crate::routes::auth::current_user,
        crate::routes::auth::update_current_user,
        crate::routes::organization::get_organization,
        crate::routes::organization::list_members,
        crate::routes::organization::update_organization,
        crate::routes::budgets::list_budgets,
        crate::routes::budgets::create_budget,
        crate::routes::budgets::get_budget,
        crate::routes::budgets::update_budget,
        crate::routes::budgets::delete_budget,
        crate::routes::api_keys::list_api_keys,
        crate::routes::api_keys::save_api_key,
        crate::routes::api_keys::delete_api_key,
        crate::routes::api_keys::test_api_key,
        crate::routes::models::list_models,
        crate::routes::models::recommend_model,
        crate::routes::models::available_models,
        crate::routes::preferences::get_preferences,
        crate::routes::preferences::update_preferences,
        crate::routes::threads::list_threads,
        crate::routes::threads::create_thread,
        crate::routes::threads::get_thread,
        crate::routes::threads::update_thread,
        crate::routes::threads::delete_thread,
        crate::routes::chat::chat_completion,
        crate::routes::chat::chat_stream,
        crate::routes::usage::usage_report,
        crate::routes::usage::record_usage,
        crate::routes::usage::list_usage_logs,
        crate::routes::rules::list_rules,
        crate::routes::rules::create_rule,
        crate::routes::rules::get_rule,
        crate::routes::rules::update_rule,
        crate::routes::rules::delete_rule,
        crate::routes::rules::test_rule,
        crate::routes::notifications::list_notifications,
        crate::routes::notifications::unread_count,
        crate::routes::notifications::get_notification,
        crate::routes::notifications::update_notification,
        crate::routes::notifications::delete_notification,
        crate::routes::notifications::mark_all_read,
        crate::routes::notifications::bulk_operation,
        crate::routes::notifications::bulk_stats,
        crate::routes::templates::list_templates,
        crate::routes::templates::create_template,
        crate::routes::templates::get_template,
        crate::routes::templates::update_template,
        crate::routes::templates::delete_template,
        crate::routes::templates::preview_template
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            crate::services::Pagination,
            crate::routes::health::HealthResponse,
            crate::routes::auth::GoogleLoginResponse,
            crate::routes::auth::GoogleCallbackRequest,
            crate::routes::auth::SessionResponse,
            crate::routes::auth::UserResponse,
            crate::routes::auth::UpdateProfileRequest,
            crate::services::auth::RegisterRequest,
            crate::services::auth::LoginRequest,
            crate::routes::organization::OrganizationResponse,
            crate::routes::organization::MembersResponse,
            crate::services::organization::Organization,
            crate::services::organization::Member,
            crate::services::organization::UpdateOrganizationRequest,
            crate::routes::budgets::BudgetsResponse,
            crate::routes::budgets::BudgetResponse,
            crate::routes::budgets::DeleteBudgetResponse,
            crate::services::budgets::Budget,
            crate::services::budgets::BudgetStatus,
            crate::services::budgets::BudgetRequest,
            crate::routes::api_keys::ApiKeysResponse,
            crate::routes::api_keys::TestApiKeyRequest,
            crate::routes::api_keys::DeleteApiKeyResponse,
            crate::services::api_keys::MaskedApiKey,
            crate::services::api_keys::SaveApiKeyRequest,
            crate::services::api_keys::SaveApiKeyResponse,
            crate::services::api_keys::TestApiKeyResponse,
            crate::routes::models::ModelsResponse,
            crate::routes::models::RecommendRequest,
            crate::routes::models::RecommendResponse,
            crate::routes::models::AvailableModel,
            crate::routes::models::AvailableModelsResponse,
            crate::routes::preferences::PreferencesResponse,
            crate::routes::threads::ThreadsResponse,
            crate::routes::threads::ThreadResponse,
            crate::routes::threads::ThreadDetailResponse,
            crate::services::threads::Thread,
            crate::services::threads::Message,
            crate::services::threads::CreateThreadRequest,
            crate::services::threads::UpdateThreadRequest,
            crate::routes::chat::HistoryMessage,
            crate::routes::chat::ChatCompletionRequest,
            crate::routes::chat::CompletionUsage,
            crate::routes::chat::CompletionBody,
            crate::routes::chat::ChatCompletionResponse,
            crate::routes::chat::ChatStreamRequest,
            crate::routes::usage::RecordUsageResponse,
            crate::services::usage::UsageLog,
            crate::services::usage::RecordUsageRequest,
            crate::services::usage::UsageBucket,
            crate::services::usage::UsageSummary,
            crate::services::usage::UsageReport,
            crate::services::usage::UsageLogPage,
            crate::routes::rules::RuleResponse,
            crate::routes::rules::CreatedRuleResponse,
            crate::routes::rules::RuleTestResponse,
            crate::routes::rules::DeletedResponse,
            crate::services::rules::RuleConditions,
            crate::services::rules::CustomCondition,
            crate::services::rules::ChannelConfig,
            crate::services::rules::NotificationRule,
            crate::services::rules::RuleListItem,
            crate::services::rules::RuleRequest,
            crate::services::rules::RulePage,
            crate::services::evaluator::TestEvaluation,
            crate::routes::notifications::NotificationResponse,
            crate::routes::notifications::UnreadCountResponse,
            crate::routes::notifications::MarkAllReadResponse,
            crate::routes::notifications::NotificationDeletedResponse,
            crate::routes::notifications::BulkResponse,
            crate::routes::notifications::BulkStatsResponse,
            crate::services::notifications::Notification,
            crate::services::notifications::NotificationList,
            crate::services::notifications::UpdateNotificationRequest,
            crate::services::notifications::BulkRequest,
            crate::services::notifications::BulkNotificationInput,
            crate::services::notifications::BulkFilters,
            crate::services::notifications::BulkCreateResult,
            crate::services::notifications::BulkCreateError,
            crate::services::notifications::BulkCreateResponse,
            crate::services::notifications::BulkActionResponse,
            crate::services::notifications::BulkAnalysis,
            crate::routes::templates::TemplatesResponse,
            crate::routes::templates::TemplateResponse,
            crate::routes::templates::PreviewResponse,
            crate::services::templates::NotificationTemplate,
            crate::services::templates::CreateTemplateRequest,
            crate::services::templates::UpdateTemplateRequest,
            crate::services::templates::RenderedTemplate
        )
    ),
    tags(
        (name = "Health", description = "Service health endpoints"),
        (name = "Auth", description = "Registration, sign-in and session management"),
        (name = "Organization", description = "Tenant settings and membership"),
        (name = "Budgets", description = "Organization spending budgets"),
        (name = "API Keys", description = "Encrypted provider credentials"),
        (name = "Models", description = "Model catalogue and recommendations"),
        (name = "Preferences", description = "Per-user model selection preferences"),
        (name = "Threads", description = "Conversation threads"),
        (name = "Chat", description = "Provider chat completions and streaming relay"),
        (name = "Usage", description = "Spend and token usage tracking"),
        (name = "Notification Rules", description = "Spend alert rules"),
        (name = "Notifications", description = "User notifications and bulk operations"),
        (name = "Notification Templates", description = "Templates used to render alerts")
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        let schemes = &mut components.security_schemes;

        let mut scheme = SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer));
        if let SecurityScheme::Http(http) = &mut scheme {
            http.bearer_format = Some("Bearer".to_string());
        }

        schemes.insert("bearerAuth".to_string(), scheme);
    }
}
