use crate::record::{LevelName, LogRecord, StaticMetadata, DEFAULT_LEVEL};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Logger name used when the raw object names no emitter.
pub const DEFAULT_SOURCE: &str = "app";

/// Keys probed, in order, for the logical emitter name.
const SOURCE_KEYS: [&str; 3] = ["component", "service", "module"];

/// Bookkeeping keys that never survive into `fields`.
const RESERVED_KEYS: [&str; 3] = ["level", "time", "msg"];

/// Convert a loosely-typed log object into a canonical [`LogRecord`].
///
/// Never fails: missing or malformed keys fall back to defaults. A bare
/// string is taken as the message; any other non-object value yields an
/// empty info record.
pub fn normalize(raw: Value, metadata: &Arc<StaticMetadata>) -> LogRecord {
    let timestamp = Utc::now();
    let mut fields = match raw {
        Value::Object(map) => map,
        Value::String(message) => {
            let mut map = Map::new();
            map.insert("msg".to_string(), Value::String(message));
            map
        }
        _ => Map::new(),
    };

    let level = fields.get("level").and_then(level_of).unwrap_or(DEFAULT_LEVEL);
    let message = match fields.get("msg") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let mut source = None;
    for key in SOURCE_KEYS {
        if let Some(Value::String(name)) = fields.get(key) {
            source = Some((key, name.clone()));
            break;
        }
    }

    for key in RESERVED_KEYS {
        fields.remove(key);
    }
    let source = match source {
        Some((key, name)) => {
            fields.remove(key);
            name
        }
        None => DEFAULT_SOURCE.to_string(),
    };

    LogRecord {
        timestamp,
        level,
        level_name: LevelName::from_ordinal(level),
        message,
        source,
        fields,
        metadata: Arc::clone(metadata),
    }
}

/// Numeric ordinals are taken as-is (clamped, fractions truncated);
/// names such as `"warn"` map onto their canonical ordinal.
fn level_of(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                Some(v.min(u64::from(u32::MAX)) as u32)
            } else if n.is_i64() {
                // negative
                Some(0)
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .map(|f| f.clamp(0.0, f64::from(u32::MAX)) as u32)
            }
        }
        Value::String(s) => LevelName::parse(s)
            .map(LevelName::ordinal)
            .or_else(|| s.trim().parse::<u32>().ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> Arc<StaticMetadata> {
        Arc::new(StaticMetadata::default())
    }

    #[test]
    fn strips_derived_keys_from_fields() {
        let record = normalize(
            json!({"level": 50, "msg": "x", "component": "C", "time": 1, "order": 7}),
            &meta(),
        );
        assert_eq!(record.level, 50);
        assert_eq!(record.level_name, LevelName::Error);
        assert_eq!(record.message, "x");
        assert_eq!(record.source, "C");
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.fields["order"], 7);
    }

    #[test]
    fn source_precedence_keeps_unchosen_keys() {
        let record = normalize(json!({"service": "api", "module": "db"}), &meta());
        assert_eq!(record.source, "api");
        assert!(!record.fields.contains_key("service"));
        assert_eq!(record.fields["module"], "db");

        let record = normalize(json!({"module": "db"}), &meta());
        assert_eq!(record.source, "db");
        assert!(record.fields.is_empty());
    }

    #[test]
    fn non_string_source_is_ignored() {
        let record = normalize(json!({"component": 3, "service": "api"}), &meta());
        assert_eq!(record.source, "api");
        assert_eq!(record.fields["component"], 3);
    }

    #[test]
    fn empty_object_gets_defaults() {
        let record = normalize(json!({}), &meta());
        assert_eq!(record.level, DEFAULT_LEVEL);
        assert_eq!(record.level_name, LevelName::Info);
        assert_eq!(record.message, "");
        assert_eq!(record.source, DEFAULT_SOURCE);
    }

    #[test]
    fn malformed_values_degrade() {
        let record = normalize(json!({"level": "loud", "msg": null}), &meta());
        assert_eq!(record.level, DEFAULT_LEVEL);
        assert_eq!(record.message, "");

        let record = normalize(json!({"level": -5, "msg": 12}), &meta());
        assert_eq!(record.level, 0);
        assert_eq!(record.level_name, LevelName::Trace);
        assert_eq!(record.message, "12");

        let record = normalize(json!({"level": 45.9}), &meta());
        assert_eq!(record.level, 45);

        let record = normalize(json!([1, 2, 3]), &meta());
        assert_eq!(record.level, DEFAULT_LEVEL);
        assert!(record.fields.is_empty());
    }

    #[test]
    fn level_names_and_bare_strings() {
        let record = normalize(json!({"level": "WARN"}), &meta());
        assert_eq!(record.level, 40);

        let record = normalize(json!("plain line"), &meta());
        assert_eq!(record.message, "plain line");
        assert!(record.fields.is_empty());
    }

    #[test]
    fn metadata_is_shared() {
        let metadata = meta();
        let record = normalize(json!({}), &metadata);
        assert!(Arc::ptr_eq(&record.metadata, &metadata));
    }
}
