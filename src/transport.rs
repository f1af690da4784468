use crate::config::ConnectOptions;
use crate::error::{ConnectError, PublishError};
use crate::record::LogRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Connection lifecycle transitions reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
}

impl ConnectionEvent {
    /// Whether the session can publish after this transition.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionEvent::Connected | ConnectionEvent::Reconnected)
    }
}

/// Terminal notice delivered once when a session ends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionClosed {
    /// `None` for a voluntary close.
    pub error: Option<String>,
}

/// Opens [`TransportSession`]s against a remote pub/sub endpoint.
///
/// A connector never retries on its own; the caller owns retry scheduling.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TransportSession>, ConnectError>;
}

/// A single logical connection to the endpoint.
///
/// Sessions are owned by exactly one execution strategy; the publisher
/// never touches them directly.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Whether the session currently believes itself connected.
    fn is_connected(&self) -> bool;

    /// Publish one encoded payload to `topic`.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    /// Publish every record of a batch, in order, one message per record.
    ///
    /// Stops at the first failure; the caller treats the whole batch as
    /// dropped.
    async fn publish_batch(&self, topic: &str, records: &[LogRecord]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        for record in records {
            let payload = record.to_wire_bytes()?;
            self.publish(topic, payload).await?;
        }
        Ok(())
    }

    /// Subscribe to connection lifecycle events. This stream is the single
    /// source of truth for the connected flag.
    fn status_stream(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Resolves when the session terminates, voluntarily or not.
    async fn closed(&self) -> SessionClosed;

    /// Flush outstanding sends if possible, then close. Never fails.
    async fn drain_and_close(&self);
}

const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Status broadcast and exactly-once close signal shared by the bundled
/// session implementations.
#[derive(Debug)]
pub struct SessionSignals {
    status: broadcast::Sender<ConnectionEvent>,
    closed: watch::Sender<Option<SessionClosed>>,
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSignals {
    pub fn new() -> Self {
        let (status, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (closed, _) = watch::channel(None);
        Self { status, closed }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.status.subscribe()
    }

    /// Broadcast an event; having no subscribers is fine.
    pub fn emit(&self, event: ConnectionEvent) {
        let _ = self.status.send(event);
    }

    /// Record the terminal close. Only the first call has an effect;
    /// returns whether this call was it.
    pub fn close(&self, error: Option<String>) -> bool {
        let first = self.closed.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(SessionClosed { error: error.clone() });
            true
        });
        if first {
            self.emit(ConnectionEvent::Disconnected);
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    pub async fn wait_closed(&self) -> SessionClosed {
        let mut rx = self.closed.subscribe();
        let closed = match rx.wait_for(Option::is_some).await {
            Ok(closed) => closed.clone().unwrap_or_default(),
            Err(_) => SessionClosed::default(),
        };
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_fires_once() {
        let signals = SessionSignals::new();
        let mut status = signals.subscribe();

        assert!(signals.close(Some("reset by peer".into())));
        assert!(!signals.close(None));
        assert!(signals.is_closed());

        let closed = signals.wait_closed().await;
        assert_eq!(closed.error.as_deref(), Some("reset by peer"));
        assert_eq!(status.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert!(status.try_recv().is_err());
    }
}
