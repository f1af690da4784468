use crate::env::{self, env_opt};
use crate::record::{LevelName, StaticMetadata, DEFAULT_LEVEL};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Default buffer capacity that triggers an immediate flush.
pub const DEFAULT_BUFFER_SIZE: usize = 50;
/// Default periodic flush cadence.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
/// Default bound on the initial connect and each reconnect attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default bound on worker teardown before the worker is abandoned.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;
/// Default first delay between failed reconnect attempts.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;
/// Default ceiling for the reconnect delay.
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;

const MIN_FLUSH_INTERVAL_MS: u64 = 10;

/// Where the transport session is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPreference {
    /// Try a dedicated worker thread first, fall back to inline.
    #[default]
    Auto,
    /// Always own the session on the caller's runtime.
    Inline,
}

/// Exponential backoff between failed reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            cap_ms: DEFAULT_BACKOFF_CAP_MS,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never delays a reconnect attempt.
    pub fn none() -> Self {
        Self { base_ms: 0, cap_ms: 0 }
    }

    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms.max(self.base_ms))
    }
}

/// Publisher configuration.
///
/// Every field has a default, so callers typically override only what they
/// need with struct update syntax:
///
/// ```
/// use tracing_log_publisher::config::PublisherConfig;
///
/// let config = PublisherConfig {
///     endpoint_url: "nats://127.0.0.1:4222".into(),
///     topic: "logs.billing".into(),
///     ..PublisherConfig::default()
/// };
/// assert_eq!(config.buffer_size, 50);
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub enabled: bool,
    pub endpoint_url: String,
    pub topic: String,
    pub client_name: Option<String>,
    pub min_level: u32,
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
    pub token: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub metadata: StaticMetadata,
    pub execution: ExecutionPreference,
    pub connect_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub reconnect_backoff: BackoffPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint_url: "nats://127.0.0.1:4222".to_string(),
            topic: "logs".to_string(),
            client_name: None,
            min_level: DEFAULT_LEVEL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            token: None,
            user: None,
            password: None,
            metadata: StaticMetadata::default(),
            execution: ExecutionPreference::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            reconnect_backoff: BackoffPolicy::default(),
        }
    }
}

impl fmt::Debug for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublisherConfig")
            .field("enabled", &self.enabled)
            .field("endpoint_url", &self.endpoint_url)
            .field("topic", &self.topic)
            .field("client_name", &self.client_name)
            .field("min_level", &self.min_level)
            .field("buffer_size", &self.buffer_size)
            .field("flush_interval_ms", &self.flush_interval_ms)
            .field("credentials", &self.credentials())
            .field("metadata", &self.metadata)
            .field("execution", &self.execution)
            .finish_non_exhaustive()
    }
}

impl PublisherConfig {
    /// Build a config from `LOG_PUBLISHER_*` environment variables, using
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = env_opt(env::LOG_PUBLISHER_ENABLED_ENV)
            .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(defaults.enabled);
        let min_level = env_opt(env::LOG_PUBLISHER_MIN_LEVEL_ENV)
            .and_then(|v| {
                LevelName::parse(&v)
                    .map(LevelName::ordinal)
                    .or_else(|| v.trim().parse().ok())
            })
            .unwrap_or(defaults.min_level);

        Self {
            enabled,
            endpoint_url: env_opt(env::LOG_PUBLISHER_URL_ENV).unwrap_or(defaults.endpoint_url),
            topic: env_opt(env::LOG_PUBLISHER_TOPIC_ENV).unwrap_or(defaults.topic),
            client_name: env_opt(env::LOG_PUBLISHER_CLIENT_NAME_ENV),
            min_level,
            buffer_size: env_opt(env::LOG_PUBLISHER_BUFFER_SIZE_ENV)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.buffer_size),
            flush_interval_ms: env_opt(env::LOG_PUBLISHER_FLUSH_INTERVAL_MS_ENV)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.flush_interval_ms),
            token: env_opt(env::LOG_PUBLISHER_TOKEN_ENV),
            user: env_opt(env::LOG_PUBLISHER_USER_ENV),
            password: env_opt(env::LOG_PUBLISHER_PASSWORD_ENV),
            ..defaults
        }
    }

    /// Buffer capacity, at least one record.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_size.max(1)
    }

    /// Flush cadence, never shorter than 10ms.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(MIN_FLUSH_INTERVAL_MS))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Token wins over user/password; a user without a password is ignored.
    pub fn credentials(&self) -> Credentials {
        if let Some(token) = &self.token {
            return Credentials::Token(token.clone());
        }
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Credentials::UserPassword {
                user: user.clone(),
                password: password.clone(),
            },
            _ => Credentials::None,
        }
    }

    /// Connection parameters handed to the transport session.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            url: self.endpoint_url.clone(),
            topic: self.topic.clone(),
            client_name: self.client_name.clone(),
            credentials: self.credentials(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect_backoff: self.reconnect_backoff.clone(),
        }
    }
}

/// Authentication material, passed through to the transport opaquely.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Token(String),
    UserPassword { user: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
            Credentials::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything a [`crate::transport::Connector`] needs to open a session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub topic: String,
    pub client_name: Option<String>,
    pub credentials: Credentials,
    pub connect_timeout: Duration,
    pub reconnect_backoff: BackoffPolicy,
}
