//! Execution strategies hosting the transport session.
//!
//! The publisher only ever talks to an [`ExecutionStrategy`]; which one is
//! active is decided once by [`select_strategy`].

mod driver;
mod inline;
mod worker;

pub use worker::{WorkerCommand, WorkerEvent, WORKER_THREAD_NAME};

pub(crate) use inline::InlineStrategy;
pub(crate) use worker::WorkerStrategy;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::config::{ConnectOptions, ExecutionPreference};
use crate::error::WorkerChannelError;
use crate::record::LogRecord;
use crate::state::PublisherState;
use crate::transport::Connector;

/// Which host currently owns the transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Worker,
    Inline,
}

/// Host for the transport session.
///
/// Both implementations report into the same [`PublisherState`], so the
/// publisher observes identical counters and status either way.
#[async_trait]
pub(crate) trait ExecutionStrategy: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Open the initial session. A transport failure is not an error here;
    /// only a broken execution boundary is.
    async fn start(&self) -> Result<(), WorkerChannelError>;

    /// Hand over a batch for publishing without waiting on I/O.
    fn submit(&self, batch: Vec<LogRecord>);

    /// Request a reconnect attempt without waiting on I/O.
    fn reconnect(&self);

    /// Finish submitted work and release the session within `timeout`.
    async fn teardown(&self, timeout: Duration);
}

/// Pick and start the execution strategy for one publisher lifetime.
pub(crate) async fn select_strategy(
    preference: ExecutionPreference,
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    state: Arc<PublisherState>,
    teardown_timeout: Duration,
) -> Arc<dyn ExecutionStrategy> {
    if preference == ExecutionPreference::Auto {
        match WorkerStrategy::spawn(Arc::clone(&connector), options.clone(), Arc::clone(&state)) {
            Ok(worker) => match worker.start().await {
                Ok(()) => return Arc::new(worker),
                Err(err) => {
                    warn!(error = %err, "log publisher worker failed to start; using inline mode");
                    worker.teardown(teardown_timeout).await;
                    state.reset_status();
                }
            },
            Err(err) => {
                warn!(error = %err, "log publisher worker unavailable; using inline mode");
            }
        }
    }

    let inline = InlineStrategy::new(connector, options, state);
    // Inline start cannot fail; a refused connection is retried on flush.
    let _ = inline.start().await;
    Arc::new(inline)
}
