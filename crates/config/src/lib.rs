use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "costguard.toml",
    "config/costguard.toml",
    "crates/config/costguard.toml",
    "../costguard.toml",
    "../config/costguard.toml",
    "../crates/config/costguard.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://costguard.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "AuthConfig::default_session_ttl")]
    pub session_ttl_seconds: u64,
    #[serde(default)]
    pub google: GoogleAuthConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: Self::default_session_ttl(),
            google: GoogleAuthConfig::default(),
        }
    }
}

impl AuthConfig {
    fn default_session_ttl() -> u64 {
        86_400
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GoogleAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// Upstream API roots for every supported AI vendor.
///
/// Overriding a `base_url` points the relay at a proxy or a local mock.
///
/// ```
/// use costguard_config::ProvidersConfig;
///
/// let providers = ProvidersConfig::default();
/// assert_eq!(providers.openai.base_url, "https://api.openai.com/v1");
/// assert_eq!(providers.anthropic.base_url, "https://api.anthropic.com/v1");
/// assert_eq!(providers.request_timeout_seconds, 60);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "ProvidersConfig::default_openai")]
    pub openai: ProviderEndpoint,
    #[serde(default = "ProvidersConfig::default_anthropic")]
    pub anthropic: ProviderEndpoint,
    #[serde(default = "ProvidersConfig::default_google")]
    pub google: ProviderEndpoint,
    #[serde(default = "ProvidersConfig::default_xai")]
    pub xai: ProviderEndpoint,
    #[serde(default = "ProvidersConfig::default_perplexity")]
    pub perplexity: ProviderEndpoint,
    #[serde(default = "ProvidersConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl ProvidersConfig {
    fn default_openai() -> ProviderEndpoint {
        ProviderEndpoint::new("https://api.openai.com/v1")
    }

    fn default_anthropic() -> ProviderEndpoint {
        ProviderEndpoint::new("https://api.anthropic.com/v1")
    }

    fn default_google() -> ProviderEndpoint {
        ProviderEndpoint::new("https://generativelanguage.googleapis.com/v1beta")
    }

    fn default_xai() -> ProviderEndpoint {
        ProviderEndpoint::new("https://api.x.ai/v1")
    }

    fn default_perplexity() -> ProviderEndpoint {
        ProviderEndpoint::new("https://api.perplexity.ai")
    }

    const fn default_request_timeout() -> u64 {
        60
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: Self::default_openai(),
            anthropic: Self::default_anthropic(),
            google: Self::default_google(),
            xai: Self::default_xai(),
            perplexity: Self::default_perplexity(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
}

impl ProviderEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Secret the provider key vault derives its cipher key from.
    pub encryption_key: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            encryption_key: "default-encryption-key-change-in-production".to_string(),
        }
    }
}

/// Fixed-window request budgets, one per limiter bucket.
///
/// ```
/// use costguard_config::RateLimitConfig;
///
/// let limits = RateLimitConfig::default();
/// assert_eq!(limits.window_seconds, 60);
/// assert_eq!(limits.rule_requests, 30);
/// assert_eq!(limits.bulk_requests, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_seconds: u64,
    pub api_requests: u32,
    pub rule_requests: u32,
    pub bulk_requests: u32,
    pub chat_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            api_requests: 300,
            rule_requests: 30,
            bulk_requests: 5,
            chat_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use costguard_config::load;
///
/// std::env::remove_var("COSTGUARD_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.http.address.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let mut builder = config::Config::builder()
        .set_default("http.address", defaults.http.address.clone())?
        .set_default("http.port", i64::from(defaults.http.port))?
        .set_default("database.url", defaults.database.url.clone())?
        .set_default(
            "database.max_connections",
            i64::from(defaults.database.max_connections),
        )?
        .set_default(
            "auth.session_ttl_seconds",
            as_i64(defaults.auth.session_ttl_seconds),
        )?
        .set_default(
            "security.encryption_key",
            defaults.security.encryption_key.clone(),
        )?
        .set_default(
            "providers.request_timeout_seconds",
            as_i64(defaults.providers.request_timeout_seconds),
        )?;

    let environment_overrides = config::Environment::with_prefix("COSTGUARD").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("COSTGUARD_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via COSTGUARD_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    if config.auth.session_ttl_seconds > i64::MAX as u64 {
        config.auth.session_ttl_seconds = i64::MAX as u64;
    }

    debug!(
        http.address = %config.http.address,
        http.port = config.http.port,
        database.url = %config.database.url,
        "loaded backend configuration"
    );
    Ok(config)
}
