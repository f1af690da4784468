use crate::publisher::Publisher;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Target prefix of this crate's own diagnostics, which are never
/// published.
const OWN_TARGET: &str = "tracing_log_publisher";

/// `tracing_subscriber` layer that turns every event into a raw log object
/// and hands it to a [`Publisher`].
///
/// Level filtering, buffering and delivery all happen in the publisher;
/// the layer only converts. `on_event` never blocks on I/O.
pub struct PublisherLayer {
    publisher: Publisher,
}

impl PublisherLayer {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

/// Ordinal used by the publisher for a `tracing` level.
pub fn level_ordinal(level: &Level) -> u32 {
    match *level {
        Level::TRACE => 10,
        Level::DEBUG => 20,
        Level::INFO => 30,
        Level::WARN => 40,
        Level::ERROR => 50,
    }
}

impl<S> Layer<S> for PublisherLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if meta.target().starts_with(OWN_TARGET) || !self.publisher.is_initialized() {
            return;
        }

        let mut fields = Map::new();
        let mut message: Option<String> = None;
        let mut visitor = FieldVisitor {
            fields: &mut fields,
            message: &mut message,
        };
        event.record(&mut visitor);

        fields.insert("level".to_string(), Value::from(level_ordinal(meta.level())));
        fields.insert("msg".to_string(), Value::from(message.unwrap_or_default()));
        fields
            .entry("module".to_string())
            .or_insert_with(|| Value::from(meta.target()));

        self.publisher.push(Value::Object(fields));
    }
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut Map<String, Value>,
    pub message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.fields.insert(field.name().to_string(), Value::String(format!("{:?}", value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionPreference, PublisherConfig};
    use crate::memory::MemoryConnector;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    #[tokio::test]
    async fn events_become_records() {
        let connector = MemoryConnector::new();
        let publisher = Publisher::new(Arc::new(connector.clone()));
        publisher
            .initialize(PublisherConfig {
                execution: ExecutionPreference::Inline,
                flush_interval_ms: 60_000,
                ..PublisherConfig::default()
            })
            .await;

        let subscriber = tracing_subscriber::registry().with(PublisherLayer::new(publisher.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "billing::invoices", user_id = 42, component = "invoices", "charge failed");
            tracing::debug!("below the default minimum level");
        });
        assert_eq!(publisher.pending_count(), 1);

        publisher.shutdown().await;
        let published = connector.published();
        assert_eq!(published.len(), 1);
        let json = published[0].json();
        assert_eq!(json["level"], 50);
        assert_eq!(json["levelName"], "error");
        assert_eq!(json["msg"], "charge failed");
        assert_eq!(json["logger"], "invoices");
        assert_eq!(json["data"]["user_id"], 42);
        assert_eq!(json["data"]["module"], "billing::invoices");
    }

    #[test]
    fn maps_tracing_levels() {
        assert_eq!(level_ordinal(&Level::TRACE), 10);
        assert_eq!(level_ordinal(&Level::WARN), 40);
        assert_eq!(level_ordinal(&Level::ERROR), 50);
    }
}
