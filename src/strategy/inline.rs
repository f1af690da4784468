use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::driver::SessionDriver;
use super::{ExecutionMode, ExecutionStrategy};
use crate::config::ConnectOptions;
use crate::error::WorkerChannelError;
use crate::record::LogRecord;
use crate::state::PublisherState;
use crate::transport::Connector;

enum Job {
    Publish(Vec<LogRecord>),
    Reconnect,
}

/// Owns the transport session on the caller's runtime.
///
/// Submissions are queued to a single task that performs them in order,
/// so `submit` never waits on I/O.
pub(crate) struct InlineStrategy {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    driver: Arc<SessionDriver>,
    state: Arc<PublisherState>,
}

impl InlineStrategy {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
        state: Arc<PublisherState>,
    ) -> Self {
        let reporter = Arc::clone(&state);
        let driver = Arc::new(SessionDriver::new(connector, options, reporter));
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(run_jobs(rx, Arc::clone(&driver)));
        Self {
            jobs: Mutex::new(Some(tx)),
            pump: Mutex::new(Some(pump)),
            driver,
            state,
        }
    }

    fn enqueue(&self, job: Job) -> Result<(), Job> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.as_ref() {
            Some(tx) => tx.send(job).map_err(|err| err.0),
            None => Err(job),
        }
    }
}

async fn run_jobs(mut jobs: mpsc::UnboundedReceiver<Job>, driver: Arc<SessionDriver>) {
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Publish(batch) => driver.publish(batch).await,
            Job::Reconnect => driver.reconnect().await,
        }
    }
}

#[async_trait]
impl ExecutionStrategy for InlineStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    async fn start(&self) -> Result<(), WorkerChannelError> {
        self.driver.connect().await;
        Ok(())
    }

    fn submit(&self, batch: Vec<LogRecord>) {
        if let Err(Job::Publish(batch)) = self.enqueue(Job::Publish(batch)) {
            warn!(dropped = batch.len(), "log publisher stopped; dropping batch");
            self.state.add_dropped(batch.len() as u64);
        }
    }

    fn reconnect(&self) {
        if self.enqueue(Job::Reconnect).is_err() {
            self.state.reset_status();
        }
    }

    async fn teardown(&self, timeout: Duration) {
        // Closing the queue lets the pump finish what was already submitted.
        drop(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take());
        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(timeout, &mut pump).await.is_err() {
                warn!(?timeout, "pending log publishes did not finish in time");
                pump.abort();
            }
        }
        if tokio::time::timeout(timeout, self.driver.close()).await.is_err() {
            warn!(?timeout, "closing log session timed out");
        }
    }
}
