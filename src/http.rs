use crate::config::{ConnectOptions, Credentials};
use crate::error::{ConnectError, PublishError};
use crate::transport::{ConnectionEvent, Connector, SessionClosed, SessionSignals, TransportSession};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Publishes over a REST pub/sub gateway: one `POST {endpoint}/{topic}`
/// per record with the JSON payload as body.
#[derive(Clone, Default)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing client (connection pool, proxies, TLS roots).
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn authorize(request: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
    match credentials {
        Credentials::None => request,
        Credentials::Token(token) => request.bearer_auth(token),
        Credentials::UserPassword { user, password } => request.basic_auth(user, Some(password)),
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn TransportSession>, ConnectError> {
        let base = options.url.trim_end_matches('/').to_string();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConnectError::InvalidUrl(options.url.clone()));
        }

        // Any HTTP answer proves reachability; only auth failures are fatal.
        let probe = authorize(self.client.get(&base), &options.credentials)
            .timeout(options.connect_timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ConnectError::Timeout(options.connect_timeout)
                } else {
                    ConnectError::Io(io::Error::new(io::ErrorKind::Other, err))
                }
            })?;
        if matches!(probe.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(ConnectError::Rejected(format!(
                "endpoint answered {}",
                probe.status()
            )));
        }

        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
            base,
            credentials: options.credentials.clone(),
            client_name: options.client_name.clone(),
            connected: AtomicBool::new(true),
            signals: SessionSignals::new(),
        }))
    }
}

struct HttpSession {
    client: Client,
    base: String,
    credentials: Credentials,
    client_name: Option<String>,
    connected: AtomicBool,
    signals: SessionSignals,
}

impl HttpSession {
    fn endpoint(&self, topic: &str) -> String {
        format!("{}/{}", self.base, urlencoding::encode(topic))
    }

    fn mark_closed(&self, error: Option<String>) {
        self.connected.store(false, Ordering::SeqCst);
        self.signals.close(error);
    }
}

#[async_trait]
impl TransportSession for HttpSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::Disconnected);
        }
        let mut request = self
            .client
            .post(self.endpoint(topic))
            .header("Content-Type", "application/json")
            .body(payload);
        if let Some(name) = &self.client_name {
            request = request.header("X-Client-Name", name);
        }

        let resp = match authorize(request, &self.credentials).send().await {
            Ok(resp) => resp,
            Err(err) => {
                self.mark_closed(Some(err.to_string()));
                return Err(PublishError::Io(io::Error::new(io::ErrorKind::Other, err)));
            }
        };
        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(PublishError::Rejected(format!("status {}: {}", status, text)))
        }
    }

    fn status_stream(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signals.subscribe()
    }

    async fn closed(&self) -> SessionClosed {
        self.signals.wait_closed().await
    }

    /// Every publish is awaited, so there is nothing left to drain.
    async fn drain_and_close(&self) {
        self.mark_closed(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PublisherConfig;

    #[tokio::test]
    async fn rejects_non_http_urls() {
        let options = PublisherConfig {
            endpoint_url: "nats://127.0.0.1:4222".into(),
            ..PublisherConfig::default()
        }
        .connect_options();
        let err = HttpConnector::new().connect(&options).await.err().unwrap();
        assert!(matches!(err, ConnectError::InvalidUrl(_)));
    }

    #[test]
    fn topic_is_path_encoded() {
        let session = HttpSession {
            client: Client::new(),
            base: "http://gw:8080/pub".into(),
            credentials: Credentials::None,
            client_name: None,
            connected: AtomicBool::new(true),
            signals: SessionSignals::new(),
        };
        assert_eq!(session.endpoint("logs/app one"), "http://gw:8080/pub/logs%2Fapp%20one");
    }
}
