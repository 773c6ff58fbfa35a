//! Listening WebSocket source: one acceptor, many tracked sessions, one
//! multiplexed stream.

use super::pool::{ConnectionPool, SessionHandle};
use super::{drive_websocket, SessionError, SessionState, WRITE_LANE_CAPACITY};
use crate::event::{ReplyHandle, StreamItem};
use crate::stream::EventSource;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

/// WebSocket server source. Binds on activation; every accepted peer runs
/// its own session feeding the shared stream and registers in the pool for
/// broadcast and mass-disconnect.
pub struct WebsocketServerSource {
    name: String,
    host: String,
    port: u16,
    pool: ConnectionPool,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WebsocketServerSource {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            pool: ConnectionPool::new(name.to_string()),
            shutdown_tx: None,
            task: None,
        }
    }

    /// The pool tracking this source's live sessions.
    pub fn pool(&self) -> ConnectionPool {
        self.pool.clone()
    }
}

#[async_trait]
impl EventSource for WebsocketServerSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SessionError::Connection(format!("bind {}: {}", addr, e)))?;
        info!(source = %self.name, %addr, "listening for websocket connections");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let name = self.name.clone();
        let pool = self.pool.clone();
        self.task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!(source = %name, "acceptor shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            debug!(source = %name, %peer, "client connected");
                            tokio::spawn(run_accepted_session(
                                name.clone(),
                                socket,
                                tx.clone(),
                                pool.clone(),
                            ));
                        }
                        Err(e) => {
                            let _ = tx.send(StreamItem::failed(SessionError::Connection(
                                e.to_string(),
                            )));
                            break;
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.pool.disconnect_all().await;
    }
}

/// One accepted connection: websocket handshake, pool registration, the
/// shared streaming loop, deregistration. A handshake or read failure here
/// never stops the acceptor; it is scoped to this session.
async fn run_accepted_session(
    source: String,
    socket: TcpStream,
    tx: broadcast::Sender<StreamItem>,
    pool: ConnectionPool,
) {
    let id = pool.next_id();
    let label = format!("{}#{}", source, id);
    let state = SessionState::Accepted;
    debug!(session = %label, state = %state, "websocket handshake");

    let ws = match accept_async(socket).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(session = %label, error = %e, "handshake failed, dropping peer");
            return;
        }
    };

    let (write_tx, write_rx) = mpsc::channel(WRITE_LANE_CAPACITY);
    let (close_tx, close_rx) = mpsc::unbounded_channel();
    let reply = ReplyHandle::for_connection(write_tx);

    pool.accept(SessionHandle::new(id, reply.clone(), close_tx)).await;

    drive_websocket(&label, ws, &tx, reply, write_rx, close_rx).await;

    pool.remove(id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use futures_util::{SinkExt, StreamExt};
    use seine_core::EventKind;
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    async fn recv_event(rx: &mut broadcast::Receiver<StreamItem>) -> Event {
        match rx.recv().await.unwrap() {
            StreamItem::Event(ev) => ev,
            StreamItem::Failed(e) => panic!("unexpected failure: {}", e),
        }
    }

    async fn started_server() -> (WebsocketServerSource, broadcast::Receiver<StreamItem>, u16) {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut source = WebsocketServerSource::new("srv", "127.0.0.1", port);
        let (tx, rx) = broadcast::channel(64);
        source.start(tx).await.unwrap();
        (source, rx, port)
    }

    #[tokio::test]
    async fn test_bind_conflict_is_a_start_error() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        let mut source = WebsocketServerSource::new("srv", "127.0.0.1", port);
        let (tx, _rx) = broadcast::channel(16);
        let err = source.start(tx).await.unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
    }

    #[tokio::test]
    async fn test_accepted_peer_lifecycle() {
        let (mut source, mut rx, port) = started_server().await;

        let url = format!("ws://127.0.0.1:{}/", port);
        let (mut client, _) = connect_async(url).await.unwrap();

        let connected = recv_event(&mut rx).await;
        assert_eq!(connected.kind, EventKind::Connected);

        client.send(Message::Text("ping".to_string())).await.unwrap();
        let data = recv_event(&mut rx).await;
        assert_eq!(data.kind, EventKind::Data);
        assert_eq!(data.payload.as_str(), "ping");

        // Reply goes back down this specific connection.
        assert!(data.reply("pong"));
        let echoed = client.next().await.unwrap().unwrap();
        assert_eq!(echoed, Message::Text("pong".to_string()));

        client.close(None).await.unwrap();
        let terminal = recv_event(&mut rx).await;
        assert_eq!(terminal.kind, EventKind::Disconnected);

        source.stop().await;
    }

    #[tokio::test]
    async fn test_pool_tracks_sessions_until_close() {
        let (mut source, mut rx, port) = started_server().await;
        let pool = source.pool();

        let url = format!("ws://127.0.0.1:{}/", port);
        let (mut client, _) = connect_async(url).await.unwrap();
        let _ = recv_event(&mut rx).await; // connected
        assert_eq!(pool.len().await, 1);

        client.close(None).await.unwrap();
        let _ = recv_event(&mut rx).await; // disconnected
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(pool.is_empty().await);

        source.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_peers() {
        let (mut source, mut rx, port) = started_server().await;
        let pool = source.pool();
        let url = format!("ws://127.0.0.1:{}/", port);

        let (mut a, _) = connect_async(&url).await.unwrap();
        let _ = recv_event(&mut rx).await;
        let (mut b, _) = connect_async(&url).await.unwrap();
        let _ = recv_event(&mut rx).await;

        pool.broadcast("announcement".into()).await;

        assert_eq!(
            a.next().await.unwrap().unwrap(),
            Message::Text("announcement".to_string())
        );
        assert_eq!(
            b.next().await.unwrap().unwrap(),
            Message::Text("announcement".to_string())
        );

        source.stop().await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_peers() {
        let (mut source, mut rx, port) = started_server().await;
        let url = format!("ws://127.0.0.1:{}/", port);

        let (mut client, _) = connect_async(&url).await.unwrap();
        let _ = recv_event(&mut rx).await;

        source.stop().await;

        // The peer observes a close frame.
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(msg)) = client.next().await {
                if msg.is_close() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(deadline);
    }
}
