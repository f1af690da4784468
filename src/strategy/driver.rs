//! Session ownership shared by both execution strategies.
//!
//! The driver holds at most one live [`TransportSession`], dials it on
//! demand, watches its lifecycle and turns publish outcomes into counter
//! updates. It is always driven serially by its owner (the inline job pump
//! or the worker loop); only the lifecycle monitor runs beside it.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Instant;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backoff::ReconnectBackoff;
use crate::config::ConnectOptions;
use crate::error::ConnectError;
use crate::record::LogRecord;
use crate::state::PublisherState;
use crate::transport::{ConnectionEvent, Connector, TransportSession};

/// Receives status and delivery updates from a [`SessionDriver`].
pub(crate) trait StatusReporter: Send + Sync {
    fn status(&self, event: ConnectionEvent);
    /// Counts are increments, not totals.
    fn delivered(&self, published: u64, dropped: u64);
}

impl StatusReporter for PublisherState {
    fn status(&self, event: ConnectionEvent) {
        self.apply(event);
    }

    fn delivered(&self, published: u64, dropped: u64) {
        self.add_published(published);
        self.add_dropped(dropped);
    }
}

pub(crate) struct SessionDriver {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    reporter: Arc<dyn StatusReporter>,
    session: Mutex<Option<Arc<dyn TransportSession>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    backoff: Mutex<ReconnectBackoff>,
}

impl SessionDriver {
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        let backoff = ReconnectBackoff::new(options.reconnect_backoff.clone());
        Self {
            connector,
            options,
            reporter,
            session: Mutex::new(None),
            monitor: Mutex::new(None),
            backoff: Mutex::new(backoff),
        }
    }

    fn current(&self) -> Option<Arc<dyn TransportSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Initial connection attempt. Failure is logged and reported as
    /// `disconnected`; the next flush retries.
    pub async fn connect(self: &Arc<Self>) -> bool {
        self.dial(ConnectionEvent::Connected).await
    }

    /// Demand-driven reconnect, gated by the backoff window.
    pub async fn reconnect(self: &Arc<Self>) {
        if self.current().is_some_and(|s| s.is_connected()) {
            self.reporter.status(ConnectionEvent::Reconnected);
            return;
        }
        let ready = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready(Instant::now());
        if !ready {
            debug!("reconnect to log endpoint deferred by backoff");
            self.reporter.status(ConnectionEvent::Disconnected);
            return;
        }
        self.reporter.status(ConnectionEvent::Reconnecting);
        self.dial(ConnectionEvent::Reconnected).await;
    }

    async fn dial(self: &Arc<Self>, on_success: ConnectionEvent) -> bool {
        self.discard_session().await;
        // Bounded here whatever the connector does internally.
        let timeout = self.options.connect_timeout;
        let attempt = tokio::time::timeout(timeout, self.connector.connect(&self.options))
            .await
            .unwrap_or(Err(ConnectError::Timeout(timeout)));
        match attempt {
            Ok(session) => {
                self.backoff
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_success();
                self.install(session);
                self.reporter.status(on_success);
                true
            }
            Err(err) => {
                let retry_in = self
                    .backoff
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_failure(Instant::now());
                warn!(
                    error = %err,
                    url = %self.options.url,
                    ?retry_in,
                    "failed to connect to log endpoint"
                );
                self.reporter.status(ConnectionEvent::Disconnected);
                false
            }
        }
    }

    fn install(self: &Arc<Self>, session: Arc<dyn TransportSession>) {
        let monitor = tokio::spawn(monitor_session(
            Arc::downgrade(self),
            Arc::clone(&session),
        ));
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
        if let Some(old) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(monitor)
        {
            old.abort();
        }
    }

    /// Forget the session if it is still the current one.
    fn session_lost(&self, lost: &Arc<dyn TransportSession>) {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, lost)) {
            *slot = None;
        }
    }

    async fn discard_session(&self) {
        if let Some(monitor) = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.drain_and_close().await;
        }
    }

    /// Publish one batch. Any failure drops the whole batch and marks the
    /// connection down.
    pub async fn publish(&self, batch: Vec<LogRecord>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len() as u64;
        let session = match self.current() {
            Some(session) if session.is_connected() => session,
            _ => {
                warn!(dropped = count, "no live log session; dropping batch");
                self.reporter.status(ConnectionEvent::Disconnected);
                self.reporter.delivered(0, count);
                return;
            }
        };

        match session.publish_batch(&self.options.topic, &batch).await {
            Ok(()) => {
                debug!(published = count, "published log batch");
                self.reporter.delivered(count, 0);
            }
            Err(err) => {
                warn!(error = %err, dropped = count, "failed to publish log batch");
                self.discard_session().await;
                self.reporter.status(ConnectionEvent::Disconnected);
                self.reporter.delivered(0, count);
            }
        }
    }

    /// Drain and close the current session, if any.
    pub async fn close(&self) {
        self.discard_session().await;
    }
}

/// Relay session lifecycle events to the reporter until the session ends.
async fn monitor_session(driver: Weak<SessionDriver>, session: Arc<dyn TransportSession>) {
    let mut events = session.status_stream();
    loop {
        tokio::select! {
            closed = session.closed() => {
                if let Some(driver) = driver.upgrade() {
                    if let Some(error) = closed.error {
                        warn!(%error, "log session closed");
                    }
                    driver.session_lost(&session);
                    driver.reporter.status(ConnectionEvent::Disconnected);
                }
                return;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let Some(driver) = driver.upgrade() else { return };
                    driver.reporter.status(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "log session status stream lagged");
                }
                Err(RecvError::Closed) => {
                    // Sender gone; the closed signal decides the outcome.
                    let closed = session.closed().await;
                    if let Some(driver) = driver.upgrade() {
                        debug!(error = ?closed.error, "log session status stream ended");
                        driver.session_lost(&session);
                        driver.reporter.status(ConnectionEvent::Disconnected);
                    }
                    return;
                }
            }
        }
    }
}
