use crate::config::ConnectOptions;
use crate::error::{ConnectError, PublishError};
use crate::transport::{ConnectionEvent, Connector, SessionClosed, SessionSignals, TransportSession};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::broadcast;

/// A message accepted by a [`MemoryConnector`] session.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Decode the payload as JSON; `Value::Null` if it is not valid JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Default)]
struct MemoryShared {
    connect_attempts: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_publishes: AtomicUsize,
    stall_connects: AtomicUsize,
    publish_calls: AtomicUsize,
    published: Mutex<Vec<PublishedMessage>>,
    sessions: Mutex<Vec<Weak<MemorySession>>>,
}

/// In-process endpoint that keeps every published message.
///
/// Useful for measuring the overhead of the publisher without any network
/// I/O, and for tests that need to inject connect or publish failures.
/// Clones share the same endpoint.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<MemoryShared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.shared.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` connect attempts hang forever.
    pub fn stall_next_connects(&self, count: usize) {
        self.shared.stall_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` publish calls.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.fail_publishes.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of publish calls, failed ones included.
    pub fn publish_calls(&self) -> usize {
        self.shared.publish_calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Terminate every live session as if the endpoint went away.
    pub fn drop_connections(&self) {
        let sessions: Vec<_> = self
            .shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|s| s.upgrade())
            .collect();
        for session in sessions {
            session.terminate(Some("connection reset by endpoint".to_string()));
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TransportSession>, ConnectError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.shared.stall_connects) {
            std::future::pending::<()>().await;
        }
        if take_one(&self.shared.fail_connects) {
            return Err(ConnectError::Rejected(format!(
                "memory endpoint {} refused connection",
                options.url
            )));
        }
        let session = Arc::new(MemorySession {
            shared: Arc::clone(&self.shared),
            connected: AtomicBool::new(true),
            signals: SessionSignals::new(),
        });
        let mut sessions = self
            .shared
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        drop(sessions);
        Ok(session)
    }
}

struct MemorySession {
    shared: Arc<MemoryShared>,
    connected: AtomicBool,
    signals: SessionSignals,
}

impl MemorySession {
    fn terminate(&self, error: Option<String>) {
        self.connected.store(false, Ordering::SeqCst);
        self.signals.close(error);
    }
}

#[async_trait]
impl TransportSession for MemorySession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.shared.publish_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        if take_one(&self.shared.fail_publishes) {
            return Err(PublishError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected publish failure",
            )));
        }
        self.shared
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
            });
        Ok(())
    }

    fn status_stream(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.subscribe()
    }

    async fn closed(&self) -> SessionClosed {
        self.signals.wait_closed().await
    }

    async fn drain_and_close(&self) {
        self.terminate(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let connector = MemoryConnector::new();
        let options = PublisherConfig::default().connect_options();

        connector.fail_next_connects(1);
        assert!(connector.connect(&options).await.is_err());
        let session = connector.connect(&options).await.unwrap();
        assert_eq!(connector.connect_attempts(), 2);

        connector.fail_next_publishes(1);
        assert!(session.publish("t", b"1".to_vec()).await.is_err());
        session.publish("t", b"2".to_vec()).await.unwrap();
        assert_eq!(connector.publish_calls(), 2);
        assert_eq!(connector.published().len(), 1);
    }

    #[tokio::test]
    async fn released_sessions_are_forgotten() {
        let connector = MemoryConnector::new();
        let options = PublisherConfig::default().connect_options();
        for _ in 0..10 {
            let session = connector.connect(&options).await.unwrap();
            session.drain_and_close().await;
        }
        let _live = connector.connect(&options).await.unwrap();
        let tracked = connector.shared.sessions.lock().unwrap().len();
        assert_eq!(tracked, 1);
    }

    #[tokio::test]
    async fn dropped_connections_close_sessions() {
        let connector = MemoryConnector::new();
        let options = PublisherConfig::default().connect_options();
        let session = connector.connect(&options).await.unwrap();

        connector.drop_connections();
        assert!(!session.is_connected());
        let closed = session.closed().await;
        assert!(closed.error.is_some());
        assert!(matches!(
            session.publish("t", Vec::new()).await,
            Err(PublishError::Disconnected)
        ));
    }
}
