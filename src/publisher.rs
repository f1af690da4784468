use crate::backend::{connector_for_url, BackendError};
use crate::buffer::RecordBuffer;
use crate::config::PublisherConfig;
use crate::normalize::normalize;
use crate::record::{LogRecord, StaticMetadata};
use crate::state::{ConnectionStatus, PublisherState};
use crate::strategy::{self, ExecutionMode, ExecutionStrategy, InlineStrategy};
use crate::transport::Connector;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Buffered, non-blocking publisher of structured log records.
///
/// A `Publisher` is an explicit context object: construct it with a
/// [`Connector`], call [`Publisher::initialize`] once a Tokio runtime is
/// available, feed it with [`Publisher::push`] from anywhere and call
/// [`Publisher::shutdown`] on teardown. Clones share the same state.
///
/// `push` and `flush` never wait on network I/O and never fail; transport
/// problems only show up in the counters, the connection status and
/// `tracing` diagnostics.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    lifecycle: Mutex<Lifecycle>,
    state: RwLock<Arc<PublisherState>>,
    initialized: AtomicBool,
}

enum Lifecycle {
    Uninitialized,
    Initializing,
    Running(Box<Running>),
    ShuttingDown,
}

struct Running {
    config: PublisherConfig,
    metadata: Arc<StaticMetadata>,
    buffer: RecordBuffer,
    strategy: Arc<dyn ExecutionStrategy>,
    state: Arc<PublisherState>,
    timer: JoinHandle<()>,
    fell_back: bool,
}

/// Work decided under the lifecycle lock and carried out after it is
/// released.
#[derive(Default)]
struct FlushPlan {
    submit: Option<(Arc<dyn ExecutionStrategy>, Vec<LogRecord>)>,
    reconnect: Option<Arc<dyn ExecutionStrategy>>,
}

impl FlushPlan {
    fn run(self) {
        if let Some((strategy, batch)) = self.submit {
            strategy.submit(batch);
        }
        if let Some(strategy) = self.reconnect {
            strategy.reconnect();
        }
    }
}

impl Running {
    fn plan_flush(&mut self) -> FlushPlan {
        let mut plan = FlushPlan::default();
        if self.buffer.is_empty() {
            return plan;
        }
        self.state.record_flush();

        if self.state.is_connected() {
            plan.submit = Some((Arc::clone(&self.strategy), self.buffer.drain_all()));
            return plan;
        }

        // Disconnected: keep records for the reconnect unless the buffer
        // is already full, in which case this batch is lost.
        if self.buffer.is_full() {
            let dropped = self.buffer.drain_all().len();
            warn!(dropped, "log endpoint unavailable; dropping buffered records");
            self.state.add_dropped(dropped as u64);
        }
        if self.state.begin_reconnect() {
            plan.reconnect = Some(Arc::clone(&self.strategy));
        }
        plan
    }
}

impl Publisher {
    /// Create an uninitialized publisher that will open sessions with
    /// `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                lifecycle: Mutex::new(Lifecycle::Uninitialized),
                state: RwLock::new(Arc::new(PublisherState::default())),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Create a publisher whose transport is chosen from the URL scheme.
    pub fn from_url(url: &str) -> Result<Self, BackendError> {
        Ok(Self::new(connector_for_url(url)?))
    }

    /// Start publishing with `config`.
    ///
    /// No-op when the config is disabled or the publisher is not
    /// uninitialized. Connection failures are logged and retried on later
    /// flushes; this never fails.
    pub async fn initialize(&self, config: PublisherConfig) {
        if !config.enabled {
            debug!("log publisher disabled by config");
            return;
        }
        {
            let mut lifecycle = self.inner.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Uninitialized) {
                debug!("log publisher already initialized");
                return;
            }
            *lifecycle = Lifecycle::Initializing;
        }

        let state = Arc::new(PublisherState::default());
        *self.inner.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&state);

        let strategy = strategy::select_strategy(
            config.execution,
            Arc::clone(&self.inner.connector),
            config.connect_options(),
            Arc::clone(&state),
            config.shutdown_timeout(),
        )
        .await;
        let timer = tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            Arc::clone(&state),
            config.flush_interval(),
        ));

        info!(
            url = %config.endpoint_url,
            topic = %config.topic,
            mode = ?strategy.mode(),
            connected = state.is_connected(),
            "log publisher initialized"
        );
        let running = Running {
            metadata: Arc::new(config.metadata.clone()),
            buffer: RecordBuffer::new(config.buffer_capacity()),
            config,
            strategy,
            state,
            timer,
            fell_back: false,
        };
        *self.inner.lifecycle() = Lifecycle::Running(Box::new(running));
        self.inner.initialized.store(true, Ordering::Release);
    }

    /// Normalize `raw` and buffer it. Flushes when the buffer reaches
    /// capacity. Silently ignored when the publisher is not running or the
    /// record is below the minimum level.
    pub fn push(&self, raw: Value) {
        if !self.inner.initialized.load(Ordering::Acquire) {
            return;
        }
        let (metadata, min_level) = {
            let lifecycle = self.inner.lifecycle();
            let Lifecycle::Running(running) = &*lifecycle else {
                return;
            };
            (Arc::clone(&running.metadata), running.config.min_level)
        };

        let record = normalize(raw, &metadata);
        if record.level < min_level {
            return;
        }

        let plan = {
            let mut lifecycle = self.inner.lifecycle();
            let Lifecycle::Running(running) = &mut *lifecycle else {
                return;
            };
            if running.buffer.push(record) {
                running.plan_flush()
            } else {
                FlushPlan::default()
            }
        };
        plan.run();
    }

    /// Hand buffered records to the active execution strategy without
    /// waiting for delivery. No-op when nothing is buffered.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Stop accepting records, publish what is buffered and release the
    /// transport. Idempotent, bounded by the configured shutdown timeout,
    /// and never fails.
    pub async fn shutdown(&self) {
        let mut running = {
            let mut lifecycle = self.inner.lifecycle();
            match std::mem::replace(&mut *lifecycle, Lifecycle::ShuttingDown) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };
        self.inner.initialized.store(false, Ordering::Release);
        running.timer.abort();

        let batch = running.buffer.drain_all();
        if !batch.is_empty() {
            running.state.record_flush();
            running.strategy.submit(batch);
        }
        running.strategy.teardown(running.config.shutdown_timeout()).await;

        info!(
            published = running.state.published(),
            dropped = running.state.dropped(),
            "log publisher shut down"
        );
        *self.inner.lifecycle() = Lifecycle::Uninitialized;
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().is_connected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state().status()
    }

    pub fn endpoint_url(&self) -> Option<String> {
        self.with_running(|running| running.config.endpoint_url.clone())
    }

    pub fn topic(&self) -> Option<String> {
        self.with_running(|running| running.config.topic.clone())
    }

    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.with_running(|running| running.strategy.mode())
    }

    /// Records delivered since the last initialize.
    pub fn total_published(&self) -> u64 {
        self.inner.state().published()
    }

    /// Records lost since the last initialize.
    pub fn total_dropped(&self) -> u64 {
        self.inner.state().dropped()
    }

    /// Non-empty flush attempts since the last initialize.
    pub fn flush_count(&self) -> u64 {
        self.inner.state().flushes()
    }

    /// Records currently buffered.
    pub fn pending_count(&self) -> usize {
        self.with_running(|running| running.buffer.len()).unwrap_or(0)
    }

    fn with_running<T>(&self, f: impl FnOnce(&Running) -> T) -> Option<T> {
        match &*self.inner.lifecycle() {
            Lifecycle::Running(running) => Some(f(running)),
            _ => None,
        }
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> Arc<PublisherState> {
        Arc::clone(&*self.state.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn flush(&self) {
        let plan = match &mut *self.lifecycle() {
            Lifecycle::Running(running) => running.plan_flush(),
            _ => return,
        };
        plan.run();
    }

    /// Replace a failed worker with inline execution. Happens at most once
    /// per initialize.
    async fn fall_back_to_inline(&self) {
        let (failed, inline, state, timeout) = {
            let mut lifecycle = self.lifecycle();
            let Lifecycle::Running(running) = &mut *lifecycle else {
                return;
            };
            if running.fell_back || running.strategy.mode() == ExecutionMode::Inline {
                return;
            }
            running.fell_back = true;
            running.state.reset_status();
            let inline: Arc<dyn ExecutionStrategy> = Arc::new(InlineStrategy::new(
                Arc::clone(&self.connector),
                running.config.connect_options(),
                Arc::clone(&running.state),
            ));
            let failed = std::mem::replace(&mut running.strategy, Arc::clone(&inline));
            (
                failed,
                inline,
                Arc::clone(&running.state),
                running.config.shutdown_timeout(),
            )
        };

        warn!("log publisher worker failed; continuing in inline mode");
        failed.teardown(timeout).await;
        if state.begin_reconnect() {
            inline.reconnect();
        }
    }
}

/// Periodic flush, plus immediate flushes after a (re)connect and the
/// worker fallback. Ends when the publisher is dropped or shut down.
async fn run_timer(inner: Weak<Inner>, state: Arc<PublisherState>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.flush_requested.notified() => {}
            _ = state.strategy_failed.notified() => {
                let Some(inner) = inner.upgrade() else { return };
                inner.fall_back_to_inline().await;
                continue;
            }
        }
        let Some(inner) = inner.upgrade() else { return };
        inner.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffPolicy, ExecutionPreference};
    use crate::memory::MemoryConnector;
    use serde_json::json;

    fn config(buffer_size: usize) -> PublisherConfig {
        PublisherConfig {
            endpoint_url: "memory://".into(),
            topic: "logs.test".into(),
            buffer_size,
            flush_interval_ms: 60_000,
            execution: ExecutionPreference::Inline,
            reconnect_backoff: BackoffPolicy::none(),
            ..PublisherConfig::default()
        }
    }

    #[tokio::test]
    async fn push_before_initialize_is_ignored() {
        let publisher = Publisher::new(Arc::new(MemoryConnector::new()));
        publisher.push(json!({"msg": "early"}));
        publisher.flush();
        assert!(!publisher.is_initialized());
        assert_eq!(publisher.pending_count(), 0);
        assert_eq!(publisher.endpoint_url(), None);
    }

    #[tokio::test]
    async fn disabled_config_does_nothing() {
        let publisher = Publisher::new(Arc::new(MemoryConnector::new()));
        publisher
            .initialize(PublisherConfig {
                enabled: false,
                ..config(5)
            })
            .await;
        assert!(!publisher.is_initialized());
    }

    #[tokio::test]
    async fn second_initialize_is_a_no_op() {
        let connector = MemoryConnector::new();
        let publisher = Publisher::new(Arc::new(connector.clone()));
        publisher.initialize(config(5)).await;
        publisher
            .initialize(PublisherConfig {
                topic: "other".into(),
                ..config(5)
            })
            .await;
        assert_eq!(publisher.topic().as_deref(), Some("logs.test"));
        assert_eq!(connector.connect_attempts(), 1);
        publisher.shutdown().await;
    }

    #[tokio::test]
    async fn full_buffer_is_dropped_while_disconnected() {
        let connector = MemoryConnector::new();
        connector.fail_next_connects(usize::MAX);
        let publisher = Publisher::new(Arc::new(connector.clone()));
        publisher
            .initialize(PublisherConfig {
                reconnect_backoff: BackoffPolicy {
                    base_ms: 60_000,
                    cap_ms: 60_000,
                },
                ..config(2)
            })
            .await;
        assert!(!publisher.is_connected());

        publisher.push(json!({"msg": "a"}));
        publisher.push(json!({"msg": "b"}));
        assert_eq!(publisher.pending_count(), 0);
        assert_eq!(publisher.total_dropped(), 2);
        assert_eq!(publisher.total_published(), 0);
        publisher.shutdown().await;
    }
}
