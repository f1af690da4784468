use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast;
use tracing_log_publisher::{
    config::ConnectOptions,
    error::{ConnectError, PublishError},
    transport::{ConnectionEvent, Connector, SessionClosed, SessionSignals, TransportSession},
    Publisher, PublisherConfig,
};

/// Example of integrating a completely custom endpoint by implementing
/// the `Connector` and `TransportSession` traits directly. Imagine this
/// talks to some proprietary bus for which this crate does not provide a
/// built-in transport.
struct StdoutConnector;

struct StdoutSession {
    signals: SessionSignals,
}

#[async_trait]
impl Connector for StdoutConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TransportSession>, ConnectError> {
        println!("[stdout-bus] connecting to {}", options.url);
        Ok(Arc::new(StdoutSession {
            signals: SessionSignals::new(),
        }))
    }
}

#[async_trait]
impl TransportSession for StdoutSession {
    fn is_connected(&self) -> bool {
        !self.signals.is_closed()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        // Here you would call your own client library for the target bus.
        // For the sake of example we just print the payload.
        println!("[stdout-bus] {} {}", topic, String::from_utf8_lossy(&payload));
        Ok(())
    }

    fn status_stream(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.subscribe()
    }

    async fn closed(&self) -> SessionClosed {
        self.signals.wait_closed().await
    }

    async fn drain_and_close(&self) {
        self.signals.close(None);
    }
}

#[tokio::main]
async fn main() {
    let publisher = Publisher::new(Arc::new(StdoutConnector));
    publisher
        .initialize(PublisherConfig {
            endpoint_url: "stdout://local".to_string(),
            topic: "logs.example".to_string(),
            ..PublisherConfig::default()
        })
        .await;

    publisher.push(json!({"level": 30, "msg": "custom transport example started", "component": "demo"}));
    publisher.push(json!({"level": 50, "msg": "simulated error", "component": "demo", "attempt": 3}));

    publisher.shutdown().await;
}
