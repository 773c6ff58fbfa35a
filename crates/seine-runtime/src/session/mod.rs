//! Connection sessions: one task per physical connection.
//!
//! Every session walks the same linear state machine
//! (`Resolving -> Connecting -> TlsHandshaking -> Handshaking -> Streaming
//! -> Closing -> Closed`; accepted server sessions start at `Accepted`)
//! and guarantees its subscribers the sequence `Connected`, `Data*`, then
//! exactly one of `Disconnected` or a terminal failure.

pub mod http_server;
pub mod pool;
pub mod ws_client;
pub mod ws_server;

pub use http_server::HttpServerSource;
pub use pool::{ConnectionPool, SessionHandle, SessionId};
pub use ws_client::WebsocketClientSource;
pub use ws_server::WebsocketServerSource;

use crate::event::{Event, Payload, ReplyHandle, StreamItem};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

/// Depth of the per-connection write lane. Replies beyond this queue
/// briefly block the replier, never the connection's read path.
pub(crate) const WRITE_LANE_CAPACITY: usize = 64;

/// Transport-level failures, surfaced at most once per connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("address resolution failed: {0}")]
    Resolution(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("read failed: {0}")]
    Read(String),
    /// A stage transform failed; terminal for the stream the stage
    /// produces, invisible to its input stream.
    #[error("transform failed: {0}")]
    Transform(String),
}

/// Current position in a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Connecting,
    TlsHandshaking,
    Handshaking,
    Accepted,
    Streaming,
    Closing,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Resolving => "resolving",
            SessionState::Connecting => "connecting",
            SessionState::TlsHandshaking => "tls-handshaking",
            SessionState::Handshaking => "handshaking",
            SessionState::Accepted => "accepted",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// True for the error codes that mean "the peer went away cleanly".
fn is_clean_close(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset
        ),
        WsError::Protocol(p) => matches!(
            p,
            tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake
        ),
        _ => false,
    }
}

/// Drive one established WebSocket connection until it terminates.
///
/// Emits `Connected` on entry, one `Data` per received frame in wire
/// order, and exactly one terminal: `Disconnected` on clean close,
/// `Failed` on a read error. Writes arrive over `write_rx` and are
/// serialized here; a close request flips the session to `Closing`, sends
/// the close frame and drains until the peer acknowledges. Write failures
/// are swallowed (the subsequent read surfaces any real problem).
pub(crate) async fn drive_websocket<S>(
    name: &str,
    ws: WebSocketStream<S>,
    tx: &broadcast::Sender<StreamItem>,
    reply: ReplyHandle,
    mut write_rx: mpsc::Receiver<Payload>,
    mut close_rx: mpsc::UnboundedReceiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = ws.split();
    let mut state = SessionState::Streaming;
    debug!(session = %name, state = %state, "session established");

    let _ = tx.send(StreamItem::Event(Event::connected(Some(reply.clone()))));

    let terminal = loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = tx.send(StreamItem::Event(Event::data(
                        text,
                        Some(reply.clone()),
                    )));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = tx.send(StreamItem::Event(Event::data(
                        bytes,
                        Some(reply.clone()),
                    )));
                }
                Some(Ok(Message::Close(_))) => {
                    state = SessionState::Closing;
                    debug!(session = %name, state = %state, "close frame received");
                }
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                Some(Err(e)) if is_clean_close(&e) => {
                    break StreamItem::Event(Event::disconnected());
                }
                Some(Err(e)) => {
                    break StreamItem::failed(SessionError::Read(e.to_string()));
                }
                None => {
                    break StreamItem::Event(Event::disconnected());
                }
            },
            Some(payload) = write_rx.recv() => {
                if state == SessionState::Streaming {
                    let text = payload.as_str().into_owned();
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(session = %name, error = %e, "write failed");
                    }
                }
                // Writes after Closing are dropped.
            }
            Some(()) = close_rx.recv() => {
                if state == SessionState::Streaming {
                    state = SessionState::Closing;
                    debug!(session = %name, state = %state, "disconnect requested");
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(session = %name, error = %e, "close frame failed");
                        break StreamItem::Event(Event::disconnected());
                    }
                }
            }
        }
    };

    state = SessionState::Closed;
    info!(session = %name, state = %state, "session finished");
    let _ = tx.send(terminal);
}
