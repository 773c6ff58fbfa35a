//! Listening HTTP/1 source with per-connection lifecycle.
//!
//! Each TCP connection contributes one `Connected` and one terminal event
//! to the stream; each request/response exchange on it becomes exactly one
//! `Data` event whose payload is `{method, target, body, headers}` and
//! whose reply capability resolves the pending response.

use super::{SessionError, SessionState};
use crate::event::{Event, Payload, ReplyHandle, StreamItem};
use crate::stream::EventSource;
use async_trait::async_trait;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// HTTP server source. Persistent connections: the session keeps reading
/// requests until the peer closes.
pub struct HttpServerSource {
    name: String,
    host: String,
    port: u16,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl HttpServerSource {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            shutdown_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl EventSource for HttpServerSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SessionError::Connection(format!("bind {}: {}", addr, e)))?;
        info!(source = %self.name, %addr, "listening for http connections");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let name = self.name.clone();
        self.task = Some(tokio::spawn(async move {
            let mut acceptor_shutdown = shutdown_rx.clone();
            loop {
                tokio::select! {
                    _ = acceptor_shutdown.changed() => {
                        debug!(source = %name, "acceptor shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            debug!(source = %name, %peer, "client connected");
                            tokio::spawn(serve_http_session(
                                format!("{}#{}", name, peer),
                                socket,
                                tx.clone(),
                                shutdown_rx.clone(),
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
            let _ = shutdown_tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// One HTTP connection: `Connected`, one `Data` per request, then exactly
/// one of `Disconnected` (clean close) or `Failed` (protocol error).
async fn serve_http_session(
    label: String,
    socket: TcpStream,
    tx: broadcast::Sender<StreamItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let state = SessionState::Accepted;
    debug!(session = %label, state = %state, "http session open");

    let _ = tx.send(StreamItem::Event(Event::connected(None)));

    let request_tx = tx.clone();
    let service = service_fn(move |req: Request<Body>| {
        let tx = request_tx.clone();
        async move {
            let response = handle_request(req, &tx).await;
            Ok::<_, Infallible>(response)
        }
    });

    let conn = Http::new()
        .http1_keep_alive(true)
        .serve_connection(socket, service);

    let terminal = tokio::select! {
        result = conn => match result {
            Ok(()) => StreamItem::Event(Event::disconnected()),
            Err(e) => StreamItem::failed(SessionError::Read(e.to_string())),
        },
        // Teardown cancels the connection outright.
        _ = shutdown_rx.changed() => StreamItem::Event(Event::disconnected()),
    };

    debug!(session = %label, state = %SessionState::Closed, "http session finished");
    let _ = tx.send(terminal);
}

/// Assemble the request into one data event and wait for a subscriber to
/// answer it. An unanswered request (every reply handle dropped) becomes
/// 204 No Content so the connection stays usable.
async fn handle_request(req: Request<Body>, tx: &broadcast::Sender<StreamItem>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body_bytes = hyper::body::to_bytes(body).await.unwrap_or_default();

    let mut headers = serde_json::Map::new();
    for (name, value) in parts.headers.iter() {
        headers.insert(
            name.as_str().to_string(),
            serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }

    let payload = serde_json::json!({
        "method": parts.method.as_str(),
        "target": parts.uri.to_string(),
        "body": String::from_utf8_lossy(&body_bytes).into_owned(),
        "headers": headers,
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    let delivered = tx
        .send(StreamItem::Event(Event::data(
            payload,
            Some(ReplyHandle::for_request(reply_tx)),
        )))
        .is_ok();

    if delivered {
        if let Ok(reply) = reply_rx.await {
            return text_response(StatusCode::OK, reply);
        }
    }
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}

fn text_response(status: StatusCode, payload: Payload) -> Response<Body> {
    let mut response = Response::new(Body::from(payload.as_bytes().to_vec()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("text/html"));
    response
}
