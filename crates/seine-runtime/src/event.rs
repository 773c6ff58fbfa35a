//! Event envelopes flowing through streams.
//!
//! An [`Event`] carries a lifecycle kind, an opaque payload and an optional
//! reply capability bound to the connection that produced it. Payload
//! interpretation (text, JSON) is requested by the consumer, never imposed
//! by the producer.

use crate::session::SessionError;
use bytes::Bytes;
use seine_core::EventKind;
use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Opaque event payload, lazily interpretable as text or JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload(Bytes);

impl Payload {
    pub fn empty() -> Self {
        Self(Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload as text; invalid UTF-8 is replaced lossily.
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// Payload parsed as a single JSON value, if it is one.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.0).ok()
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self(Bytes::from(v.to_string()))
    }
}

/// Connection-bound reply capability.
///
/// Invoking [`reply`](Self::reply) writes a payload back down the
/// connection that produced the event. Replies are best-effort: once the
/// connection is closing, or a request has already been answered, the call
/// is a logged no-op. It never panics and never surfaces a write error.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    target: ReplyTarget,
}

#[derive(Debug, Clone)]
enum ReplyTarget {
    /// Serialized per-connection write lane (WebSocket sessions).
    Connection(mpsc::Sender<Payload>),
    /// One-shot response slot for a single HTTP exchange.
    Request(Arc<Mutex<Option<oneshot::Sender<Payload>>>>),
}

impl ReplyHandle {
    /// Reply capability writing onto a connection's write lane.
    pub fn for_connection(tx: mpsc::Sender<Payload>) -> Self {
        Self {
            target: ReplyTarget::Connection(tx),
        }
    }

    /// One-shot reply capability answering a single pending request.
    pub fn for_request(tx: oneshot::Sender<Payload>) -> Self {
        Self {
            target: ReplyTarget::Request(Arc::new(Mutex::new(Some(tx)))),
        }
    }

    /// Queue a payload back to the peer. Returns false if the write could
    /// not be queued (connection closing, request already answered).
    pub fn reply(&self, payload: impl Into<Payload>) -> bool {
        match &self.target {
            ReplyTarget::Connection(tx) => match tx.try_send(payload.into()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("reply dropped: {}", e);
                    false
                }
            },
            ReplyTarget::Request(slot) => {
                let sender = slot.lock().expect("reply slot poisoned").take();
                match sender {
                    Some(tx) => tx.send(payload.into()).is_ok(),
                    None => {
                        debug!("reply dropped: request already answered");
                        false
                    }
                }
            }
        }
    }
}

/// One event observed on a stream.
///
/// For any connection the delivered sequence is exactly `Connected`, then
/// zero or more `Data` in wire order, then one `Disconnected` (unless the
/// stream terminates with [`StreamItem::Failed`] instead).
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Payload,
    reply: Option<ReplyHandle>,
}

impl Event {
    pub fn connected(reply: Option<ReplyHandle>) -> Self {
        Self {
            kind: EventKind::Connected,
            payload: Payload::empty(),
            reply,
        }
    }

    pub fn data(payload: impl Into<Payload>, reply: Option<ReplyHandle>) -> Self {
        Self {
            kind: EventKind::Data,
            payload: payload.into(),
            reply,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            kind: EventKind::Disconnected,
            payload: Payload::empty(),
            reply: None,
        }
    }

    /// Same kind and reply capability, different payload. This is how
    /// stages derive output events from their input.
    pub fn with_payload(&self, payload: impl Into<Payload>) -> Self {
        Self {
            kind: self.kind,
            payload: payload.into(),
            reply: self.reply.clone(),
        }
    }

    pub fn reply_handle(&self) -> Option<&ReplyHandle> {
        self.reply.as_ref()
    }

    /// Invoke the reply capability if present. Returns true only when a
    /// write was actually queued.
    pub fn reply(&self, payload: impl Into<Payload>) -> bool {
        match &self.reply {
            Some(handle) => handle.reply(payload),
            None => false,
        }
    }
}

/// What actually flows on a stream: an event, or the terminal transport
/// failure that ends it. `Failed` passes every kind filter and propagates
/// through stages unchanged.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Event),
    Failed(Arc<SessionError>),
}

impl StreamItem {
    pub fn failed(err: SessionError) -> Self {
        Self::Failed(Arc::new(err))
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            StreamItem::Event(ev) => Some(ev),
            StreamItem::Failed(_) => None,
        }
    }
}
