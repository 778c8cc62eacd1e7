pub mod api_keys;
pub mod auth;
pub mod budgets;
pub mod chat;
pub mod health;
pub mod models;
pub mod notifications;
pub mod organization;
pub mod preferences;
pub mod rules;
pub mod templates;
pub mod threads;
pub mod usage;
pub mod websocket;
