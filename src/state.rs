use crate::transport::ConnectionEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Connection status as observed by the publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Reconnecting,
    Connected,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            CONNECTED => ConnectionStatus::Connected,
            RECONNECTING => ConnectionStatus::Reconnecting,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

const DISCONNECTED: u8 = 0;
const RECONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// Observable state shared between the publisher and whichever execution
/// strategy is active.
///
/// One instance lives for one initialize/shutdown cycle, so counters only
/// ever grow while it is current.
#[derive(Debug)]
pub struct PublisherState {
    status: AtomicU8,
    published: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
    /// Woken when buffered records should be flushed right away.
    pub(crate) flush_requested: Notify,
    /// Woken when the worker boundary failed and inline execution must
    /// take over.
    pub(crate) strategy_failed: Notify,
}

impl Default for PublisherState {
    fn default() -> Self {
        Self {
            status: AtomicU8::new(DISCONNECTED),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_requested: Notify::new(),
            strategy_failed: Notify::new(),
        }
    }
}

impl PublisherState {
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Apply a lifecycle event coming from the session owner.
    pub fn apply(&self, event: ConnectionEvent) {
        let next = match event {
            ConnectionEvent::Connected | ConnectionEvent::Reconnected => CONNECTED,
            ConnectionEvent::Reconnecting => RECONNECTING,
            ConnectionEvent::Disconnected => DISCONNECTED,
        };
        let previous = self.status.swap(next, Ordering::AcqRel);
        if previous == next {
            return;
        }
        match event {
            ConnectionEvent::Connected => info!("log endpoint connected"),
            ConnectionEvent::Reconnected => {
                info!("log endpoint reconnected");
                // Records buffered while disconnected go out right away.
                self.flush_requested.notify_one();
            }
            ConnectionEvent::Disconnected if previous == CONNECTED => {
                warn!("log endpoint disconnected");
            }
            _ => debug!(?event, "log endpoint status changed"),
        }
    }

    /// Move from disconnected to reconnecting. Only the caller that wins
    /// this transition may start a reconnect attempt.
    pub fn begin_reconnect(&self) -> bool {
        self.status
            .compare_exchange(DISCONNECTED, RECONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Force the disconnected status without side effects.
    pub(crate) fn reset_status(&self) {
        self.status.store(DISCONNECTED, Ordering::Release);
    }

    pub fn add_published(&self, count: u64) {
        self.published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
