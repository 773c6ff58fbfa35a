//! Multicast stream abstraction.
//!
//! An [`EventStream`] makes one underlying producer (a connection session,
//! a listening acceptor, or a stage) observable by any number of
//! independent subscribers. The first subscription starts the producer,
//! further subscriptions share it, and the producer is stopped when the
//! last subscriber leaves. Late subscribers do not see earlier events.
//!
//! Ownership is deliberately one-sided: a manager task owns the producer
//! and everything else holds non-owning handles, so teardown has a single
//! authority.

use crate::context::RuntimeHandles;
use crate::event::StreamItem;
use crate::session::SessionError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Ring-buffer depth per stream. A subscriber that falls further behind
/// than this skips ahead and logs the gap.
const STREAM_CAPACITY: usize = 256;

/// A producer of stream items: a network session, a listening acceptor,
/// or a transform stage. Started when a stream gains its first subscriber
/// and stopped when the last one leaves.
#[async_trait]
pub trait EventSource: Send + 'static {
    fn name(&self) -> &str;

    /// Begin producing into `tx`. Implementations spawn their own tasks
    /// and return immediately; a startup failure is reported here and the
    /// manager turns it into a terminal [`StreamItem::Failed`].
    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError>;

    /// Stop producing and release the transport. Must be idempotent and
    /// must leave the source restartable.
    async fn stop(&mut self);
}

enum LifecycleCmd {
    Joined,
    Left,
}

struct StreamInner {
    name: String,
    tx: broadcast::Sender<StreamItem>,
    lifecycle: mpsc::UnboundedSender<LifecycleCmd>,
    subscribers: Arc<AtomicUsize>,
}

/// Handle to a named multicast stream. Clones share the same underlying
/// producer.
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl EventStream {
    /// Create a stream around `source`, spawning its manager task on the
    /// I/O pool. The source stays idle until the first subscription.
    pub fn spawn(
        handles: &RuntimeHandles,
        name: impl Into<String>,
        source: Box<dyn EventSource>,
    ) -> Self {
        let name = name.into();
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let subscribers = Arc::new(AtomicUsize::new(0));

        handles.spawn_io(manage_source(
            name.clone(),
            source,
            tx.clone(),
            cmd_rx,
            subscribers.clone(),
        ));

        Self {
            inner: Arc::new(StreamInner {
                name,
                tx,
                lifecycle: cmd_tx,
                subscribers,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    /// Attach a new subscriber. The receiver misses nothing produced after
    /// this call; events produced before it are gone (no replay).
    pub fn subscribe(&self) -> StreamSubscription {
        let rx = self.inner.tx.subscribe();
        let _ = self.inner.lifecycle.send(LifecycleCmd::Joined);
        StreamSubscription {
            name: self.inner.name.clone(),
            rx: Some(rx),
            lifecycle: self.inner.lifecycle.clone(),
        }
    }
}

/// One subscriber's view of a stream. Dropping it (or calling
/// [`unsubscribe`](Self::unsubscribe)) detaches immediately; the last
/// detachment stops the underlying producer.
pub struct StreamSubscription {
    name: String,
    rx: Option<broadcast::Receiver<StreamItem>>,
    lifecycle: mpsc::UnboundedSender<LifecycleCmd>,
}

impl StreamSubscription {
    /// Next item, or `None` once the stream is gone or this subscription
    /// was cancelled. A lagged subscriber skips ahead rather than stalling
    /// the producer.
    pub async fn next(&mut self) -> Option<StreamItem> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(item) => return Some(item),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        stream = %self.name,
                        skipped, "subscriber lagged behind, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Detach from the stream. Synchronous and idempotent: no further
    /// items will be observed after this returns.
    pub fn unsubscribe(&mut self) {
        if self.rx.take().is_some() {
            let _ = self.lifecycle.send(LifecycleCmd::Left);
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Owns one producer: reference-counts subscribers, starts the producer on
/// the first join, stops it on the last leave, and shuts down when every
/// stream handle and subscription is gone.
async fn manage_source(
    name: String,
    mut source: Box<dyn EventSource>,
    tx: broadcast::Sender<StreamItem>,
    mut cmd_rx: mpsc::UnboundedReceiver<LifecycleCmd>,
    subscribers: Arc<AtomicUsize>,
) {
    let mut count = 0usize;
    let mut running = false;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            LifecycleCmd::Joined => {
                count += 1;
                subscribers.store(count, Ordering::SeqCst);
                if count == 1 && !running {
                    debug!(stream = %name, "first subscriber, starting source");
                    match source.start(tx.clone()).await {
                        Ok(()) => running = true,
                        Err(e) => {
                            error!(stream = %name, error = %e, "source failed to start");
                            let _ = tx.send(StreamItem::failed(e));
                        }
                    }
                }
            }
            LifecycleCmd::Left => {
                count = count.saturating_sub(1);
                subscribers.store(count, Ordering::SeqCst);
                if count == 0 && running {
                    debug!(stream = %name, "last subscriber left, stopping source");
                    source.stop().await;
                    running = false;
                }
            }
        }
    }

    if running {
        source.stop().await;
    }
    debug!(stream = %name, "stream manager finished");
}

/// A live endpoint wiring created by the topology resolver. Unsubscribing
/// aborts the delivery task, which in turn releases its stream
/// subscription and, transitively, any transport nobody else uses.
pub struct Subscription {
    name: String,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_subscribed(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel delivery. Idempotent; the task observes the abort at its
    /// next suspension point.
    pub fn unsubscribe(&self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
