//! Outbound WebSocket connection source, plain or TLS.

use super::{drive_websocket, SessionError, SessionState, WRITE_LANE_CAPACITY};
use crate::event::{ReplyHandle, StreamItem};
use crate::stream::EventSource;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::client_async;
use tracing::{debug, info};

/// Configuration for one outbound WebSocket connection.
#[derive(Debug, Clone)]
pub struct WebsocketClientConfig {
    pub host: String,
    pub port: u16,
    pub target: String,
    pub ssl: bool,
}

impl WebsocketClientConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            target: "/".to_string(),
            ssl: false,
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = target.to_string();
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    fn url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.target)
    }
}

/// WebSocket client source: dials once per activation, feeds the stream
/// until the connection terminates. No retries; reconnect policy belongs
/// to whoever resubscribes.
pub struct WebsocketClientSource {
    name: String,
    config: WebsocketClientConfig,
    close_tx: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WebsocketClientSource {
    pub fn new(name: &str, config: WebsocketClientConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            close_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl EventSource for WebsocketClientSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        self.close_tx = Some(close_tx);

        let name = self.name.clone();
        let config = self.config.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = run_client(&name, &config, &tx, close_rx).await {
                info!(session = %name, error = %e, "client session failed");
                let _ = tx.send(StreamItem::failed(e));
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(task) = self.task.take() {
            // The session drains the close handshake on its own; only a
            // session that no longer runs needs reaping.
            if task.is_finished() {
                let _ = task.await;
            }
        }
    }
}

/// Linear connection sequence. Failures anywhere before streaming are
/// returned (and surfaced once by the caller) without a `Connected` ever
/// being emitted.
async fn run_client(
    name: &str,
    config: &WebsocketClientConfig,
    tx: &broadcast::Sender<StreamItem>,
    close_rx: mpsc::UnboundedReceiver<()>,
) -> Result<(), SessionError> {
    let mut state = SessionState::Resolving;
    debug!(session = %name, state = %state, host = %config.host, "resolving");

    let addrs: Vec<SocketAddr> = lookup_host((config.host.as_str(), config.port))
        .await
        .map_err(|e| SessionError::Resolution(e.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(SessionError::Resolution(format!(
            "no addresses for {}",
            config.host
        )));
    }

    state = SessionState::Connecting;
    debug!(session = %name, state = %state, "connecting");
    let mut stream = None;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => last_err = Some(e),
        }
    }
    let stream = stream.ok_or_else(|| {
        SessionError::Connection(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "connect failed".to_string()),
        )
    })?;

    let (write_tx, write_rx) = mpsc::channel(WRITE_LANE_CAPACITY);
    let reply = ReplyHandle::for_connection(write_tx);

    if config.ssl {
        state = SessionState::TlsHandshaking;
        debug!(session = %name, state = %state, "negotiating tls");
        let connector = native_tls::TlsConnector::new()
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector
            .connect(&config.host, stream)
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;

        state = SessionState::Handshaking;
        debug!(session = %name, state = %state, url = %config.url(), "websocket handshake");
        let (ws, _) = client_async(config.url(), tls)
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        drive_websocket(name, ws, tx, reply, write_rx, close_rx).await;
    } else {
        state = SessionState::Handshaking;
        debug!(session = %name, state = %state, url = %config.url(), "websocket handshake");
        let (ws, _) = client_async(config.url(), stream)
            .await
            .map_err(|e| SessionError::Handshake(e.to_string()))?;
        drive_websocket(name, ws, tx, reply, write_rx, close_rx).await;
    }

    Ok(())
}
