//! Minimal NATS publisher over the text protocol.
//!
//! Only what a log publisher needs is implemented: the `INFO`/`CONNECT`
//! handshake with token or user/password auth, `PUB`, keep-alive
//! `PING`/`PONG` and `-ERR` handling. Nothing is subscribed, so the server
//! never sends `MSG` frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ConnectOptions, Credentials};
use crate::error::{ConnectError, PublishError};
use crate::record::LogRecord;
use crate::transport::{ConnectionEvent, Connector, SessionClosed, SessionSignals, TransportSession};

/// Port used when the endpoint URL names none.
pub const DEFAULT_NATS_PORT: u16 = 4222;

const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Subset of the server `INFO` document we rely on.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    #[serde(default)]
    pub auth_required: bool,
}

fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD
}

#[derive(Serialize)]
struct ConnectFrame<'a> {
    verbose: bool,
    pedantic: bool,
    tls_required: bool,
    lang: &'static str,
    version: &'static str,
    protocol: u8,
    echo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<&'a str>,
}

impl<'a> ConnectFrame<'a> {
    fn new(options: &'a ConnectOptions) -> Self {
        let (auth_token, user, pass) = match &options.credentials {
            Credentials::None => (None, None, None),
            Credentials::Token(token) => (Some(token.as_str()), None, None),
            Credentials::UserPassword { user, password } => {
                (None, Some(user.as_str()), Some(password.as_str()))
            }
        };
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 0,
            echo: false,
            name: options.client_name.as_deref(),
            auth_token,
            user,
            pass,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ServerOp<'a> {
    Info(&'a str),
    Ping,
    Pong,
    Ok,
    Err(&'a str),
    Other(&'a str),
}

fn parse_op(line: &str) -> ServerOp<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
    match op.to_ascii_uppercase().as_str() {
        "INFO" => ServerOp::Info(rest.trim()),
        "PING" => ServerOp::Ping,
        "PONG" => ServerOp::Pong,
        "+OK" => ServerOp::Ok,
        "-ERR" => ServerOp::Err(rest.trim().trim_matches('\'')),
        _ => ServerOp::Other(line),
    }
}

/// Errors after which the server keeps the connection open.
fn is_recoverable(error: &str) -> bool {
    let error = error.to_ascii_lowercase();
    error.starts_with("permissions violation") || error.starts_with("invalid subject")
}

/// Resolve `nats://[user:pass@]host[:port][,more]` to `host:port`.
/// Only the first server of a list is used.
pub fn server_address(url: &str) -> Result<String, ConnectError> {
    let first = url.split(',').next().unwrap_or_default().trim();
    let rest = first
        .strip_prefix("nats://")
        .or_else(|| first.strip_prefix("tcp://"))
        .unwrap_or(first);
    if rest.contains("://") {
        return Err(ConnectError::InvalidUrl(url.to_string()));
    }
    let host_port = rest.rsplit('@').next().unwrap_or(rest).trim_end_matches('/');
    if host_port.is_empty() {
        return Err(ConnectError::InvalidUrl(url.to_string()));
    }
    match host_port.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && (host.starts_with('[') || !host.contains(':')) => {
            let port: u16 = port
                .parse()
                .map_err(|_| ConnectError::InvalidUrl(url.to_string()))?;
            Ok(format!("{host}:{port}"))
        }
        _ => Ok(format!("{host_port}:{DEFAULT_NATS_PORT}")),
    }
}

fn valid_subject(topic: &str) -> bool {
    !topic.is_empty() && !topic.chars().any(char::is_whitespace)
}

/// Opens [`NatsSession`]s.
#[derive(Debug, Clone, Default)]
pub struct NatsConnector;

impl NatsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TransportSession>, ConnectError> {
        let address = server_address(&options.url)?;
        let timeout = options.connect_timeout;
        let (reader, writer, info) = tokio::time::timeout(timeout, open(&address, options))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

        debug!(server_id = %info.server_id, %address, "connected to nats");
        let session = Arc::new(NatsSession {
            writer: tokio::sync::Mutex::new(writer),
            pongs: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(true),
            max_payload: info.max_payload,
            signals: SessionSignals::new(),
            reader: Mutex::new(None),
        });
        let task = tokio::spawn(read_loop(Arc::clone(&session), reader));
        *session.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(session)
    }
}

async fn open(
    address: &str,
    options: &ConnectOptions,
) -> Result<(BufReader<OwnedReadHalf>, BufWriter<OwnedWriteHalf>, ServerInfo), ConnectError> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut writer = BufWriter::new(write);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Err(ConnectError::Protocol("connection closed before INFO".to_string()));
    }
    let info: ServerInfo = match parse_op(&line) {
        ServerOp::Info(json) => serde_json::from_str(json)
            .map_err(|err| ConnectError::Protocol(format!("invalid INFO: {err}")))?,
        _ => {
            return Err(ConnectError::Protocol(format!(
                "expected INFO, got {:?}",
                line.trim_end()
            )))
        }
    };
    if info.auth_required && options.credentials == Credentials::None {
        debug!("nats server requires auth but no credentials are configured");
    }

    let frame = serde_json::to_string(&ConnectFrame::new(options))
        .map_err(|err| ConnectError::Protocol(err.to_string()))?;
    writer
        .write_all(format!("CONNECT {frame}\r\nPING\r\n").as_bytes())
        .await?;
    writer.flush().await?;

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ConnectError::Rejected(
                "connection closed during handshake".to_string(),
            ));
        }
        match parse_op(&line) {
            ServerOp::Pong => return Ok((reader, writer, info)),
            ServerOp::Ping => {
                writer.write_all(b"PONG\r\n").await?;
                writer.flush().await?;
            }
            ServerOp::Err(error) => return Err(ConnectError::Rejected(error.to_string())),
            ServerOp::Ok | ServerOp::Info(_) | ServerOp::Other(_) => {}
        }
    }
}

/// Publishing half of a NATS connection.
pub struct NatsSession {
    writer: tokio::sync::Mutex<BufWriter<OwnedWriteHalf>>,
    pongs: Mutex<VecDeque<oneshot::Sender<()>>>,
    connected: AtomicBool,
    max_payload: usize,
    signals: SessionSignals,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl NatsSession {
    fn mark_closed(&self, error: Option<String>) {
        self.connected.store(false, Ordering::SeqCst);
        self.pongs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.signals.close(error);
    }

    fn check_publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        if !valid_subject(topic) {
            return Err(PublishError::Rejected(format!("invalid subject {topic:?}")));
        }
        if payload.len() > self.max_payload {
            return Err(PublishError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        Ok(())
    }

    async fn write_frames(&self, frames: &[(&str, &[u8])]) -> Result<(), PublishError> {
        let mut writer = self.writer.lock().await;
        let result: std::io::Result<()> = async {
            for (topic, payload) in frames {
                writer
                    .write_all(format!("PUB {topic} {}\r\n", payload.len()).as_bytes())
                    .await?;
                writer.write_all(payload).await?;
                writer.write_all(b"\r\n").await?;
            }
            writer.flush().await
        }
        .await;
        drop(writer);

        if let Err(err) = result {
            self.mark_closed(Some(err.to_string()));
            return Err(err.into());
        }
        Ok(())
    }

    async fn send_raw(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    fn resolve_pong(&self) {
        if let Some(waiter) = self
            .pongs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            let _ = waiter.send(());
        }
    }
}

async fn read_loop(session: Arc<NatsSession>, mut reader: BufReader<OwnedReadHalf>) {
    let mut line = String::new();
    let cause = loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break Some("connection closed by server".to_string()),
            Ok(_) => match parse_op(&line) {
                ServerOp::Ping => {
                    if let Err(err) = session.send_raw(b"PONG\r\n").await {
                        break Some(err.to_string());
                    }
                }
                ServerOp::Pong => session.resolve_pong(),
                ServerOp::Err(error) if is_recoverable(error) => {
                    warn!(%error, "nats server rejected an operation");
                }
                ServerOp::Err(error) => break Some(error.to_string()),
                ServerOp::Ok | ServerOp::Info(_) => {}
                ServerOp::Other(other) => debug!(frame = other, "ignoring unexpected nats frame"),
            },
            Err(err) => break Some(err.to_string()),
        }
    };
    session.mark_closed(cause);
}

#[async_trait]
impl TransportSession for NatsSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.check_publish(topic, &payload)?;
        self.write_frames(&[(topic, &payload)]).await
    }

    /// Writes every frame of the batch before a single flush.
    async fn publish_batch(&self, topic: &str, records: &[LogRecord]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        let mut payloads = Vec::with_capacity(records.len());
        for record in records {
            let payload = record.to_wire_bytes()?;
            self.check_publish(topic, &payload)?;
            payloads.push(payload);
        }
        let frames: Vec<(&str, &[u8])> = payloads.iter().map(|p| (topic, p.as_slice())).collect();
        self.write_frames(&frames).await
    }

    fn status_stream(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.subscribe()
    }

    async fn closed(&self) -> SessionClosed {
        self.signals.wait_closed().await
    }

    async fn drain_and_close(&self) {
        if self.is_connected() {
            let (tx, rx) = oneshot::channel();
            self.pongs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(tx);
            match self.send_raw(b"PING\r\n").await {
                Ok(()) => {
                    if tokio::time::timeout(DRAIN_TIMEOUT, rx).await.is_err() {
                        debug!("nats drain timed out");
                    }
                }
                Err(err) => debug!(error = %err, "nats drain failed"),
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        self.mark_closed(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_ops() {
        assert_eq!(parse_op("PING\r\n"), ServerOp::Ping);
        assert_eq!(parse_op("pong\r\n"), ServerOp::Pong);
        assert_eq!(parse_op("+OK\r\n"), ServerOp::Ok);
        assert_eq!(
            parse_op("-ERR 'Authorization Violation'\r\n"),
            ServerOp::Err("Authorization Violation")
        );
        assert_eq!(parse_op("INFO {\"a\":1}\r\n"), ServerOp::Info("{\"a\":1}"));
    }

    #[test]
    fn resolves_server_addresses() {
        assert_eq!(server_address("nats://127.0.0.1:4333").unwrap(), "127.0.0.1:4333");
        assert_eq!(server_address("nats://logs.internal").unwrap(), "logs.internal:4222");
        assert_eq!(server_address("tcp://u:p@host:1/").unwrap(), "host:1");
        assert_eq!(server_address("a:1,b:2").unwrap(), "a:1");
        assert_eq!(server_address("nats://[::1]:4222").unwrap(), "[::1]:4222");
        assert!(server_address("nats://host:notaport").is_err());
        assert!(server_address("http://host:1").is_err());
        assert!(server_address("").is_err());
    }

    #[test]
    fn recoverable_errors() {
        assert!(is_recoverable("Permissions Violation for Publish to \"x\""));
        assert!(!is_recoverable("Stale Connection"));
    }

    #[test]
    fn connect_frame_uses_one_auth_mode() {
        let mut options = crate::config::PublisherConfig {
            token: Some("secret".into()),
            user: Some("u".into()),
            password: Some("p".into()),
            client_name: Some("billing".into()),
            ..Default::default()
        }
        .connect_options();
        let json = serde_json::to_value(ConnectFrame::new(&options)).unwrap();
        assert_eq!(json["auth_token"], "secret");
        assert_eq!(json["name"], "billing");
        assert!(json.get("user").is_none());

        options.credentials = Credentials::None;
        let json = serde_json::to_value(ConnectFrame::new(&options)).unwrap();
        assert!(json.get("auth_token").is_none());
        assert!(json.get("pass").is_none());
    }
}
