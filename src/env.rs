/// Environment variable names used by this crate for convenient
/// configuration of the publisher from services.
///
/// These are purely helpers; [`crate::config::PublisherConfig`] can always
/// be built by hand.

/// Set to `false`/`0` to disable publishing entirely.
pub const LOG_PUBLISHER_ENABLED_ENV: &str = "LOG_PUBLISHER_ENABLED";

/// Endpoint URL, e.g. `nats://127.0.0.1:4222`.
pub const LOG_PUBLISHER_URL_ENV: &str = "LOG_PUBLISHER_URL";

/// Topic (subject) every record is published to.
pub const LOG_PUBLISHER_TOPIC_ENV: &str = "LOG_PUBLISHER_TOPIC";

/// Client name announced to the endpoint.
pub const LOG_PUBLISHER_CLIENT_NAME_ENV: &str = "LOG_PUBLISHER_CLIENT_NAME";

/// Minimum ordinal level (number) or level name.
pub const LOG_PUBLISHER_MIN_LEVEL_ENV: &str = "LOG_PUBLISHER_MIN_LEVEL";

/// Buffer capacity that triggers an immediate flush.
pub const LOG_PUBLISHER_BUFFER_SIZE_ENV: &str = "LOG_PUBLISHER_BUFFER_SIZE";

/// Periodic flush cadence in milliseconds.
pub const LOG_PUBLISHER_FLUSH_INTERVAL_MS_ENV: &str = "LOG_PUBLISHER_FLUSH_INTERVAL_MS";

/// Optional auth token; wins over user/password.
pub const LOG_PUBLISHER_TOKEN_ENV: &str = "LOG_PUBLISHER_TOKEN";

/// Optional user name.
pub const LOG_PUBLISHER_USER_ENV: &str = "LOG_PUBLISHER_USER";

/// Optional password.
pub const LOG_PUBLISHER_PASSWORD_ENV: &str = "LOG_PUBLISHER_PASSWORD";

/// Application name attached to every record.
pub const LOG_PUBLISHER_APP_ENV: &str = "LOG_PUBLISHER_APP";

/// Application version attached to every record.
pub const LOG_PUBLISHER_APP_VERSION_ENV: &str = "LOG_PUBLISHER_APP_VERSION";

/// Deployment environment attached to every record.
pub const LOG_PUBLISHER_ENVIRONMENT_ENV: &str = "LOG_PUBLISHER_ENVIRONMENT";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read an environment variable, treating empty values as unset.
pub fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
