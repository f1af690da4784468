use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Ordinal assigned to records that carry no usable `level`.
pub const DEFAULT_LEVEL: u32 = 30;

/// Severity tag derived from an ordinal level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelName {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LevelName {
    /// Map an ordinal onto its tag using fixed thresholds
    /// (>=60 fatal, >=50 error, >=40 warn, >=30 info, >=20 debug, else trace).
    pub fn from_ordinal(level: u32) -> Self {
        match level {
            60.. => LevelName::Fatal,
            50..=59 => LevelName::Error,
            40..=49 => LevelName::Warn,
            30..=39 => LevelName::Info,
            20..=29 => LevelName::Debug,
            _ => LevelName::Trace,
        }
    }

    /// Canonical ordinal of the tag.
    pub fn ordinal(self) -> u32 {
        match self {
            LevelName::Trace => 10,
            LevelName::Debug => 20,
            LevelName::Info => 30,
            LevelName::Warn => 40,
            LevelName::Error => 50,
            LevelName::Fatal => 60,
        }
    }

    /// Parse a level name such as `"warn"` or `"WARNING"`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(LevelName::Trace),
            "debug" => Some(LevelName::Debug),
            "info" => Some(LevelName::Info),
            "warn" | "warning" => Some(LevelName::Warn),
            "error" => Some(LevelName::Error),
            "fatal" | "critical" => Some(LevelName::Fatal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LevelName::Trace => "trace",
            LevelName::Debug => "debug",
            LevelName::Info => "info",
            LevelName::Warn => "warn",
            LevelName::Error => "error",
            LevelName::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LevelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide metadata attached to every record.
///
/// Set once when the publisher is initialized and shared by reference
/// afterwards; records never carry a private copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticMetadata {
    pub app: String,
    pub version: String,
    pub environment: String,
    pub host: String,
    /// Additional caller-supplied keys, serialized next to the fixed ones.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for StaticMetadata {
    fn default() -> Self {
        Self {
            app: crate::env::env_or(crate::env::LOG_PUBLISHER_APP_ENV, "app"),
            version: crate::env::env_or(crate::env::LOG_PUBLISHER_APP_VERSION_ENV, "0.0.0"),
            environment: crate::env::env_or(crate::env::LOG_PUBLISHER_ENVIRONMENT_ENV, "development"),
            host: crate::env::env_or("HOSTNAME", "unknown"),
            extra: BTreeMap::new(),
        }
    }
}

/// Canonical, immutable log record produced by [`crate::normalize::normalize`].
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: u32,
    pub level_name: LevelName,
    pub message: String,
    pub source: String,
    pub fields: Map<String, Value>,
    pub metadata: Arc<StaticMetadata>,
}

/// JSON document published for each record.
#[derive(Debug, Serialize)]
pub struct WirePayload<'a> {
    pub ts: String,
    pub level: u32,
    #[serde(rename = "levelName")]
    pub level_name: LevelName,
    pub msg: &'a str,
    pub logger: &'a str,
    pub data: &'a Map<String, Value>,
    pub meta: &'a StaticMetadata,
}

impl LogRecord {
    pub fn wire_payload(&self) -> WirePayload<'_> {
        WirePayload {
            ts: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            level: self.level,
            level_name: self.level_name,
            msg: &self.message,
            logger: &self.source,
            data: &self.fields,
            meta: &self.metadata,
        }
    }

    /// UTF-8 JSON encoding of [`LogRecord::wire_payload`].
    pub fn to_wire_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.wire_payload())
    }
}
