//! Transport session hosted on a dedicated thread.
//!
//! The publisher talks to the worker only through two channels carrying the
//! tagged [`WorkerCommand`] / [`WorkerEvent`] unions. The worker runs its
//! own single-threaded Tokio runtime, owns the session and serializes
//! connects, reconnects and publishes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::driver::{SessionDriver, StatusReporter};
use super::{ExecutionMode, ExecutionStrategy};
use crate::config::ConnectOptions;
use crate::error::WorkerChannelError;
use crate::record::LogRecord;
use crate::state::PublisherState;
use crate::transport::{ConnectionEvent, Connector};

/// Name given to the worker thread.
pub const WORKER_THREAD_NAME: &str = "log-publisher-worker";

/// Extra time granted on top of the connect timeout for the worker to
/// answer `init`.
const INIT_GRACE: Duration = Duration::from_secs(1);

/// Messages sent from the publisher to the worker.
#[derive(Debug)]
pub enum WorkerCommand {
    Init { options: ConnectOptions },
    Flush { records: Vec<LogRecord> },
    Reconnect,
    Shutdown,
}

/// Messages sent from the worker back to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Status {
        connected: bool,
        status: ConnectionEvent,
    },
    /// Cumulative totals since the worker started.
    Stats {
        published_count: u64,
        dropped_count: u64,
    },
    Error {
        error: String,
    },
    ShutdownComplete,
}

type InitResult = Result<(), WorkerChannelError>;

pub(crate) struct WorkerStrategy {
    commands: Mutex<Option<mpsc::UnboundedSender<WorkerCommand>>>,
    options: ConnectOptions,
    state: Arc<PublisherState>,
    closing: Arc<AtomicBool>,
    init_done: Mutex<Option<oneshot::Receiver<InitResult>>>,
    shutdown_done: Mutex<Option<oneshot::Receiver<()>>>,
    events: Mutex<Option<JoinHandle<()>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerStrategy {
    /// Spawn the worker thread and the event pump. Must be called from
    /// within a Tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        options: ConnectOptions,
        state: Arc<PublisherState>,
    ) -> Result<Self, WorkerChannelError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || run_worker(connector, command_rx, event_tx))
            .map_err(|err| WorkerChannelError::Spawn(err.to_string()))?;

        let closing = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let events = tokio::spawn(pump_events(
            event_rx,
            Arc::clone(&state),
            Arc::clone(&closing),
            init_tx,
            shutdown_tx,
        ));

        Ok(Self {
            commands: Mutex::new(Some(command_tx)),
            options,
            state,
            closing,
            init_done: Mutex::new(Some(init_rx)),
            shutdown_done: Mutex::new(Some(shutdown_rx)),
            events: Mutex::new(Some(events)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send(&self, command: WorkerCommand) -> Result<(), WorkerCommand> {
        let commands = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        match commands.as_ref() {
            Some(tx) => tx.send(command).map_err(|err| err.0),
            None => Err(command),
        }
    }

    fn channel_failed(&self) {
        if !self.closing.load(Ordering::Acquire) {
            self.state.strategy_failed.notify_one();
        }
    }
}

#[async_trait]
impl ExecutionStrategy for WorkerStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Worker
    }

    async fn start(&self) -> Result<(), WorkerChannelError> {
        let init_done = self
            .init_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(WorkerChannelError::Closed)?;
        let init = WorkerCommand::Init {
            options: self.options.clone(),
        };
        self.send(init).map_err(|_| WorkerChannelError::Closed)?;

        let wait = self.options.connect_timeout + INIT_GRACE;
        match tokio::time::timeout(wait, init_done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WorkerChannelError::Closed),
            Err(_) => Err(WorkerChannelError::InitTimeout(wait)),
        }
    }

    fn submit(&self, batch: Vec<LogRecord>) {
        if let Err(WorkerCommand::Flush { records }) = self.send(WorkerCommand::Flush { records: batch }) {
            warn!(dropped = records.len(), "log publisher worker unavailable; dropping batch");
            self.state.add_dropped(records.len() as u64);
            self.channel_failed();
        }
    }

    fn reconnect(&self) {
        if self.send(WorkerCommand::Reconnect).is_err() {
            self.state.reset_status();
            self.channel_failed();
        }
    }

    async fn teardown(&self, timeout: Duration) {
        self.closing.store(true, Ordering::Release);
        let sent = self.send(WorkerCommand::Shutdown).is_ok();
        // Dropping the sender ends the worker loop even if it never sees
        // the shutdown command.
        drop(self.commands.lock().unwrap_or_else(PoisonError::into_inner).take());

        let shutdown_done = self
            .shutdown_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (true, Some(done)) = (sent, shutdown_done) {
            match tokio::time::timeout(timeout, done).await {
                Ok(Ok(())) => debug!("log publisher worker shut down"),
                Ok(Err(_)) => debug!("log publisher worker exited before confirming shutdown"),
                Err(_) => warn!(?timeout, "log publisher worker did not shut down in time; abandoning it"),
            }
        }

        if let Some(events) = self.events.lock().unwrap_or_else(PoisonError::into_inner).take() {
            events.abort();
        }
        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            // A worker stuck in I/O is detached rather than joined.
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
    }
}

/// Apply worker events to the shared publisher state.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    state: Arc<PublisherState>,
    closing: Arc<AtomicBool>,
    init_tx: oneshot::Sender<InitResult>,
    shutdown_tx: oneshot::Sender<()>,
) {
    let mut init_tx = Some(init_tx);
    let (mut seen_published, mut seen_dropped) = (0u64, 0u64);

    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Status { status, .. } => {
                state.apply(status);
                if let Some(tx) = init_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            WorkerEvent::Stats {
                published_count,
                dropped_count,
            } => {
                state.add_published(published_count.saturating_sub(seen_published));
                state.add_dropped(dropped_count.saturating_sub(seen_dropped));
                seen_published = seen_published.max(published_count);
                seen_dropped = seen_dropped.max(dropped_count);
            }
            WorkerEvent::Error { error } => {
                warn!(%error, "log publisher worker reported an error");
                match init_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(WorkerChannelError::Reported(error)));
                    }
                    None if !closing.load(Ordering::Acquire) => state.strategy_failed.notify_one(),
                    None => {}
                }
            }
            WorkerEvent::ShutdownComplete => {
                let _ = shutdown_tx.send(());
                return;
            }
        }
    }

    match init_tx.take() {
        Some(tx) => {
            let _ = tx.send(Err(WorkerChannelError::Closed));
        }
        None if !closing.load(Ordering::Acquire) => {
            warn!("log publisher worker exited unexpectedly");
            state.strategy_failed.notify_one();
        }
        None => {}
    }
}

/// Worker-side reporter that turns driver updates into events.
struct ChannelReporter {
    events: mpsc::UnboundedSender<WorkerEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl StatusReporter for ChannelReporter {
    fn status(&self, event: ConnectionEvent) {
        let _ = self.events.send(WorkerEvent::Status {
            connected: event.is_connected(),
            status: event,
        });
    }

    fn delivered(&self, published: u64, dropped: u64) {
        let published_count = self.published.fetch_add(published, Ordering::Relaxed) + published;
        let dropped_count = self.dropped.fetch_add(dropped, Ordering::Relaxed) + dropped;
        let _ = self.events.send(WorkerEvent::Stats {
            published_count,
            dropped_count,
        });
    }
}

fn run_worker(
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let error = WorkerChannelError::Runtime(err.to_string()).to_string();
            let _ = events.send(WorkerEvent::Error { error });
            return;
        }
    };
    runtime.block_on(worker_loop(connector, commands, events));
}

async fn worker_loop(
    connector: Arc<dyn Connector>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let reporter = Arc::new(ChannelReporter {
        events: events.clone(),
        published: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    let mut driver: Option<Arc<SessionDriver>> = None;

    while let Some(command) = commands.recv().await {
        match command {
            WorkerCommand::Init { options } => {
                if driver.is_some() {
                    let _ = events.send(WorkerEvent::Error {
                        error: "worker initialized twice".to_string(),
                    });
                    continue;
                }
                let fresh = Arc::new(SessionDriver::new(
                    Arc::clone(&connector),
                    options,
                    reporter.clone(),
                ));
                fresh.connect().await;
                driver = Some(fresh);
            }
            WorkerCommand::Flush { records } => match &driver {
                Some(driver) => driver.publish(records).await,
                None => reporter.delivered(0, records.len() as u64),
            },
            WorkerCommand::Reconnect => match &driver {
                Some(driver) => driver.reconnect().await,
                None => reporter.status(ConnectionEvent::Disconnected),
            },
            WorkerCommand::Shutdown => {
                if let Some(driver) = driver.take() {
                    driver.close().await;
                }
                let _ = events.send(WorkerEvent::ShutdownComplete);
                return;
            }
        }
    }

    if let Some(driver) = driver.take() {
        driver.close().await;
    }
}
