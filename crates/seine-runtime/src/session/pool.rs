//! Tracking of live sessions spawned by a listening source.

use crate::event::{Payload, ReplyHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub type SessionId = u64;

/// Non-owning handle to one tracked session: enough to reply and to
/// request a close, never to touch the socket directly.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    reply: ReplyHandle,
    close: mpsc::UnboundedSender<()>,
}

impl SessionHandle {
    pub fn new(id: SessionId, reply: ReplyHandle, close: mpsc::UnboundedSender<()>) -> Self {
        Self { id, reply, close }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn reply(&self, payload: impl Into<Payload>) -> bool {
        self.reply.reply(payload)
    }

    /// Ask the session to close gracefully. Idempotent; a no-op once the
    /// session is gone.
    pub fn request_close(&self) {
        let _ = self.close.send(());
    }
}

/// The set of live sessions behind one listening source.
///
/// All mutation goes through one async mutex, so iteration for broadcast
/// or mass-disconnect never races an insertion or removal. Sessions
/// deregister themselves when they reach `Closed`.
#[derive(Clone)]
pub struct ConnectionPool {
    name: Arc<str>,
    next_id: Arc<AtomicU64>,
    sessions: Arc<Mutex<HashMap<SessionId, SessionHandle>>>,
}

impl ConnectionPool {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identifier for a session about to be accepted.
    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn accept(&self, handle: SessionHandle) {
        let mut sessions = self.sessions.lock().await;
        debug!(pool = %self.name, session = handle.id(), "session accepted");
        sessions.insert(handle.id(), handle);
    }

    pub async fn remove(&self, id: SessionId) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(&id).is_some() {
            debug!(pool = %self.name, session = id, "session removed");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Reply on every tracked session. Best-effort: sessions mid-close
    /// simply drop the write.
    pub async fn broadcast(&self, payload: Payload) {
        let sessions = self.sessions.lock().await;
        debug!(pool = %self.name, peers = sessions.len(), "broadcast");
        for handle in sessions.values() {
            handle.reply(payload.clone());
        }
    }

    /// Request a graceful close of every tracked session.
    pub async fn disconnect_all(&self) {
        let sessions = self.sessions.lock().await;
        debug!(pool = %self.name, peers = sessions.len(), "disconnect all");
        for handle in sessions.values() {
            handle.request_close();
        }
    }
}
