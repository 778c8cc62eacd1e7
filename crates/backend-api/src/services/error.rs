use crate::ApiError;

#[derive(Debug)]
pub enum ServiceError {
    NotFound(String),
    Forbidden(String),
    BadRequest(String),
    /// Validation failure carrying one message per violated constraint.
    Invalid(String, Vec<String>),
    /// Duplicate of an existing unique resource.
    Conflict(String),
    /// Some of the referenced ids are missing or belong to someone else.
    Inaccessible(String, Vec<String>),
    Database(sqlx::Error),
    Auth(costguard_auth::AuthError),
    Provider(String),
    Internal(String),
}

impl ServiceError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn invalid(msg: impl Into<String>, details: Vec<String>) -> Self {
        Self::Invalid(msg.into(), details)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::NotFound(msg)
            | ServiceError::Forbidden(msg)
            | ServiceError::BadRequest(msg)
            | ServiceError::Invalid(msg, _)
            | ServiceError::Conflict(msg)
            | ServiceError::Inaccessible(msg, _)
            | ServiceError::Provider(msg)
            | ServiceError::Internal(msg) => f.write_str(msg),
            ServiceError::Database(error) => write!(f, "database error: {error}"),
            ServiceError::Auth(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl ServiceError {
    /// Text safe to hand to a client. Storage and internal failures are
    /// logged here and replaced with a generic message.
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::Database(error) => {
                tracing::error!(error = %error, "database error");
                "Database operation failed".to_string()
            }
            ServiceError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        }
    }
}

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(msg) => ApiError::not_found(msg),
            ServiceError::Forbidden(msg) => ApiError::forbidden(msg),
            ServiceError::BadRequest(msg) => ApiError::bad_request(msg),
            ServiceError::Invalid(msg, details) => {
                ApiError::bad_request(msg).with_details(serde_json::json!(details))
            }
            ServiceError::Conflict(msg) => ApiError::bad_request(msg),
            ServiceError::Inaccessible(msg, ids) => {
                ApiError::forbidden(msg).with_details(serde_json::json!({ "invalid_ids": ids }))
            }
            ServiceError::Database(db_err) => {
                tracing::error!(error = %db_err, "database error");
                ApiError::internal_server_error("Database operation failed")
            }
            ServiceError::Auth(auth_err) => ApiError::from(auth_err),
            ServiceError::Provider(msg) => {
                tracing::warn!(error = %msg, "provider call failed");
                ApiError::bad_gateway(msg)
            }
            ServiceError::Internal(detail) => {
                tracing::error!(error = %detail, "internal error");
                ApiError::internal_server_error(INTERNAL_ERROR_MESSAGE)
            }
        }
    }
}

impl From<sqlx::Error> for ServiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err)
    }
}

impl From<costguard_auth::AuthError> for ServiceError {
    fn from(err: costguard_auth::AuthError) -> Self {
        Self::Auth(err)
    }
}

impl From<costguard_auth::VaultError> for ServiceError {
    fn from(err: costguard_auth::VaultError) -> Self {
        tracing::error!(error = ?err, "key vault error");
        Self::Internal("Failed to decrypt API key".to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("invalid stored json: {err}"))
    }
}

impl From<costguard_orchestrator::OrchestratorError> for ServiceError {
    fn from(err: costguard_orchestrator::OrchestratorError) -> Self {
        use costguard_orchestrator::OrchestratorError;
        match err {
            OrchestratorError::UnknownModel(_) => Self::BadRequest("Invalid model".to_string()),
            OrchestratorError::Selection(selection) => Self::BadRequest(selection.to_string()),
            OrchestratorError::Provider(provider) => Self::Provider(provider.to_string()),
            OrchestratorError::HttpClient(client) => Self::Internal(client.to_string()),
        }
    }
}

impl From<costguard_orchestrator::SelectionError> for ServiceError {
    fn from(err: costguard_orchestrator::SelectionError) -> Self {
        Self::BadRequest(err.to_string())
    }
}
