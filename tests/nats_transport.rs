use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_log_publisher::config::{ConnectOptions, ExecutionPreference};
use tracing_log_publisher::error::{ConnectError, PublishError};
use tracing_log_publisher::nats::NatsConnector;
use tracing_log_publisher::normalize::normalize;
use tracing_log_publisher::record::StaticMetadata;
use tracing_log_publisher::transport::{ConnectionEvent, Connector};
use tracing_log_publisher::{Publisher, PublisherConfig};

const INFO: &[u8] = b"INFO {\"server_id\":\"fake\",\"max_payload\":1024}\r\n";

struct FakeServer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    connect: Value,
}

impl FakeServer {
    /// Accept one client and complete the handshake.
    async fn accept(listener: &TcpListener) -> FakeServer {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut writer) = stream.into_split();
        writer.write_all(INFO).await.unwrap();
        let mut reader = BufReader::new(read);

        let line = read_line(&mut reader).await;
        let connect = line
            .strip_prefix("CONNECT ")
            .map(|json| serde_json::from_str(json.trim_end()).unwrap())
            .unwrap_or_else(|| panic!("expected CONNECT, got {line:?}"));
        assert_eq!(read_line(&mut reader).await, "PING\r\n");
        writer.write_all(b"PONG\r\n").await.unwrap();

        FakeServer {
            reader,
            writer,
            connect,
        }
    }

    /// Read one `PUB` frame, answering keep-alives on the way.
    async fn next_pub(&mut self) -> (String, Value) {
        loop {
            let line = read_line(&mut self.reader).await;
            if line == "PING\r\n" {
                self.writer.write_all(b"PONG\r\n").await.unwrap();
                continue;
            }
            let mut parts = line.trim_end().split(' ');
            assert_eq!(parts.next(), Some("PUB"), "unexpected frame {line:?}");
            let subject = parts.next().unwrap().to_string();
            let size: usize = parts.next().unwrap().parse().unwrap();
            let mut payload = vec![0; size + 2];
            self.reader.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload[size..], b"\r\n");
            return (subject, serde_json::from_slice(&payload[..size]).unwrap());
        }
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("nats://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn options(url: &str) -> ConnectOptions {
    PublisherConfig {
        endpoint_url: url.to_string(),
        connect_timeout_ms: 2_000,
        ..PublisherConfig::default()
    }
    .connect_options()
}

fn record(msg: &str) -> tracing_log_publisher::LogRecord {
    normalize(json!({"msg": msg, "component": "nats-test"}), &Arc::new(StaticMetadata::default()))
}

#[tokio::test]
async fn handshake_sends_token_and_name() {
    let (listener, url) = listener().await;
    let options = PublisherConfig {
        token: Some("s3cret".to_string()),
        user: Some("ignored".to_string()),
        password: Some("ignored".to_string()),
        client_name: Some("billing-api".to_string()),
        ..PublisherConfig::default()
    };
    let options = ConnectOptions {
        url,
        ..options.connect_options()
    };

    let connector = NatsConnector::new();
    let (server, session) = tokio::join!(FakeServer::accept(&listener), connector.connect(&options));
    let session = session.unwrap();
    assert!(session.is_connected());
    assert_eq!(server.connect["auth_token"], "s3cret");
    assert_eq!(server.connect["name"], "billing-api");
    assert!(server.connect.get("user").is_none());
    assert!(server.connect.get("pass").is_none());
    assert_eq!(server.connect["verbose"], false);
}

#[tokio::test]
async fn user_password_is_sent_without_token() {
    let (listener, url) = listener().await;
    let options = ConnectOptions {
        url,
        ..PublisherConfig {
            user: Some("svc".to_string()),
            password: Some("pw".to_string()),
            ..PublisherConfig::default()
        }
        .connect_options()
    };

    let connector = NatsConnector::new();
    let (server, session) = tokio::join!(FakeServer::accept(&listener), connector.connect(&options));
    session.unwrap();
    assert_eq!(server.connect["user"], "svc");
    assert_eq!(server.connect["pass"], "pw");
    assert!(server.connect.get("auth_token").is_none());
}

#[tokio::test]
async fn batch_is_published_in_order() {
    let (listener, url) = listener().await;
    let connector = NatsConnector::new();
    let opts = options(&url);
    let (mut server, session) =
        tokio::join!(FakeServer::accept(&listener), connector.connect(&opts));
    let session = session.unwrap();

    session
        .publish_batch("logs.app", &[record("first"), record("second")])
        .await
        .unwrap();

    let (subject, payload) = server.next_pub().await;
    assert_eq!(subject, "logs.app");
    assert_eq!(payload["msg"], "first");
    assert_eq!(payload["logger"], "nats-test");
    assert_eq!(payload["levelName"], "info");
    let (_, payload) = server.next_pub().await;
    assert_eq!(payload["msg"], "second");
}

#[tokio::test]
async fn oversized_payload_is_refused() {
    let (listener, url) = listener().await;
    let connector = NatsConnector::new();
    let opts = options(&url);
    let (_server, session) =
        tokio::join!(FakeServer::accept(&listener), connector.connect(&opts));
    let session = session.unwrap();

    let err = session.publish("logs", vec![b'x'; 2048]).await.unwrap_err();
    assert!(matches!(err, PublishError::PayloadTooLarge { size: 2048, max: 1024 }));
    assert!(session.is_connected());

    let err = session.publish("bad subject", b"{}".to_vec()).await.unwrap_err();
    assert!(matches!(err, PublishError::Rejected(_)));
}

#[tokio::test]
async fn auth_rejection_fails_connect() {
    let (listener, url) = listener().await;
    let server = async {
        let (stream, _) = listener.accept().await.unwrap();
        let (read, mut writer) = stream.into_split();
        writer.write_all(INFO).await.unwrap();
        let mut reader = BufReader::new(read);
        read_line(&mut reader).await;
        read_line(&mut reader).await;
        writer
            .write_all(b"-ERR 'Authorization Violation'\r\n")
            .await
            .unwrap();
        // Keep the socket open until the client has read the error.
        (reader, writer)
    };

    let connector = NatsConnector::new();
    let opts = options(&url);
    let (_server, result) = tokio::join!(server, connector.connect(&opts));
    match result {
        Err(ConnectError::Rejected(reason)) => assert_eq!(reason, "Authorization Violation"),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("connect should fail"),
    }
}

#[tokio::test]
async fn silent_server_times_out() {
    let (listener, url) = listener().await;
    let hold = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let options = ConnectOptions {
        connect_timeout: Duration::from_millis(100),
        ..options(&url)
    };
    let result = NatsConnector::new().connect(&options).await;
    assert!(matches!(result, Err(ConnectError::Timeout(_))));
    hold.abort();
}

#[tokio::test]
async fn refused_connection_is_an_io_error() {
    let (listener, url) = listener().await;
    drop(listener);
    let result = NatsConnector::new().connect(&options(&url)).await;
    assert!(matches!(result, Err(ConnectError::Io(_))));
}

#[tokio::test]
async fn server_close_ends_the_session() {
    let (listener, url) = listener().await;
    let connector = NatsConnector::new();
    let opts = options(&url);
    let (server, session) =
        tokio::join!(FakeServer::accept(&listener), connector.connect(&opts));
    let session = session.unwrap();
    let mut status = session.status_stream();

    drop(server);
    let closed = tokio::time::timeout(Duration::from_secs(2), session.closed())
        .await
        .expect("session closed");
    assert!(closed.error.is_some());
    assert!(!session.is_connected());
    assert_eq!(status.recv().await.unwrap(), ConnectionEvent::Disconnected);

    let err = session.publish("logs", b"{}".to_vec()).await.unwrap_err();
    assert!(matches!(err, PublishError::Disconnected));
}

#[tokio::test]
async fn server_ping_is_answered() {
    let (listener, url) = listener().await;
    let connector = NatsConnector::new();
    let opts = options(&url);
    let (mut server, session) =
        tokio::join!(FakeServer::accept(&listener), connector.connect(&opts));
    let _session = session.unwrap();

    server.writer.write_all(b"PING\r\n").await.unwrap();
    assert_eq!(read_line(&mut server.reader).await, "PONG\r\n");
}

#[tokio::test]
async fn drain_round_trips_a_ping() {
    let (listener, url) = listener().await;
    let connector = NatsConnector::new();
    let opts = options(&url);
    let (mut server, session) =
        tokio::join!(FakeServer::accept(&listener), connector.connect(&opts));
    let session = session.unwrap();

    let server_side = async {
        assert_eq!(read_line(&mut server.reader).await, "PING\r\n");
        server.writer.write_all(b"PONG\r\n").await.unwrap();
        // Client shuts down its write half after the drain.
        assert_eq!(read_line(&mut server.reader).await, "");
    };
    tokio::join!(server_side, session.drain_and_close());

    assert!(!session.is_connected());
    let closed = session.closed().await;
    assert!(closed.error.is_none());
}

#[tokio::test]
async fn publisher_delivers_through_nats() {
    let (listener, url) = listener().await;
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        loop {
            let (subject, payload) = server.next_pub().await;
            if frames_tx.send((subject, payload)).is_err() {
                return;
            }
        }
    });

    let publisher = Publisher::new(Arc::new(NatsConnector::new()));
    publisher
        .initialize(PublisherConfig {
            endpoint_url: url,
            topic: "logs.billing".to_string(),
            buffer_size: 2,
            flush_interval_ms: 60_000,
            execution: ExecutionPreference::Inline,
            ..PublisherConfig::default()
        })
        .await;
    assert!(publisher.is_connected());

    publisher.push(json!({"level": "warn", "msg": "card declined", "service": "payments"}));
    publisher.push(json!({"level": 50, "msg": "gateway down"}));

    let (subject, payload) = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(subject, "logs.billing");
    assert_eq!(payload["levelName"], "warn");
    assert_eq!(payload["logger"], "payments");
    let (_, payload) = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["levelName"], "error");
    assert_eq!(payload["logger"], "app");

    server.abort();
    publisher.shutdown().await;
    assert_eq!(publisher.total_published(), 2);
}
