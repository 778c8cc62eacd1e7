pub mod api_keys;
pub mod auth;
pub mod budgets;
pub mod error;
pub mod evaluator;
pub mod notifications;
pub mod organization;
pub mod preferences;
pub mod relay;
pub mod renderer;
pub mod rules;
pub mod templates;
pub mod threads;
pub mod usage;
pub mod vocabulary;

pub use error::*;

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
    pub has_more: bool,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let total_pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
        Self {
            page,
            limit,
            total,
            total_pages,
            has_more: page < total_pages,
        }
    }
}

/// Row offset of a 1-based `page`; pages past `i64` range are a client error.
pub fn page_offset(page: i64, limit: i64) -> Result<i64, ServiceError> {
    (page.max(1) - 1)
        .checked_mul(limit)
        .ok_or_else(|| ServiceError::bad_request("Page is out of range"))
}
