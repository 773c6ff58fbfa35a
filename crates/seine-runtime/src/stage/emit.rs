//! Literal-emit stage: replaces every accepted payload with a fixed
//! configured string.

use crate::context::RuntimeHandles;
use crate::event::StreamItem;
use crate::session::SessionError;
use crate::stream::{EventSource, EventStream};
use async_trait::async_trait;
use seine_core::EventKindSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct EmitStage {
    name: String,
    upstream: EventStream,
    events: EventKindSet,
    data: String,
    handles: RuntimeHandles,
    task: Option<JoinHandle<()>>,
}

impl EmitStage {
    pub fn new(
        name: &str,
        upstream: EventStream,
        events: EventKindSet,
        data: &str,
        handles: RuntimeHandles,
    ) -> Self {
        Self {
            name: name.to_string(),
            upstream,
            events,
            data: data.to_string(),
            handles,
            task: None,
        }
    }
}

#[async_trait]
impl EventSource for EmitStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let mut upstream = self.upstream.subscribe();
        let events = self.events.clone();
        let data = self.data.clone();
        let name = self.name.clone();

        self.task = Some(self.handles.spawn_app(async move {
            while let Some(item) = upstream.next().await {
                match item {
                    StreamItem::Failed(e) => {
                        let _ = tx.send(StreamItem::Failed(e));
                        break;
                    }
                    StreamItem::Event(ev) => {
                        if !events.accepts(ev.kind) {
                            continue;
                        }
                        debug!(stage = %name, "emitting {}", data);
                        let _ = tx.send(StreamItem::Event(ev.with_payload(data.as_str())));
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::stage::tests_support::{feed_stream, next_event};
    use seine_core::EventKind;

    #[tokio::test]
    async fn test_emit_replaces_payload_one_to_one() {
        let (upstream, feed) = feed_stream("in");
        let mut stage = EmitStage::new(
            "hello",
            upstream,
            EventKindSet::data_only(),
            "fixed",
            RuntimeHandles::current(),
        );
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        feed.send(StreamItem::Event(Event::data("anything", None))).unwrap();
        let out = next_event(&mut rx).await;
        assert_eq!(out.kind, EventKind::Data);
        assert_eq!(out.payload.as_str(), "fixed");

        feed.send(StreamItem::Event(Event::data("more", None))).unwrap();
        assert_eq!(next_event(&mut rx).await.payload.as_str(), "fixed");
    }

    #[tokio::test]
    async fn test_emit_filters_kinds() {
        let (upstream, feed) = feed_stream("in");
        let mut stage = EmitStage::new(
            "hello",
            upstream,
            EventKindSet(vec![EventKind::Connected]),
            "greetings",
            RuntimeHandles::current(),
        );
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        feed.send(StreamItem::Event(Event::data("ignored", None))).unwrap();
        feed.send(StreamItem::Event(Event::connected(None))).unwrap();

        let out = next_event(&mut rx).await;
        assert_eq!(out.kind, EventKind::Connected);
        assert_eq!(out.payload.as_str(), "greetings");
    }

    #[tokio::test]
    async fn test_emit_preserves_reply_capability() {
        use crate::event::ReplyHandle;
        use tokio::sync::mpsc;

        let (upstream, feed) = feed_stream("in");
        let mut stage = EmitStage::new(
            "hello",
            upstream,
            EventKindSet::data_only(),
            "ack",
            RuntimeHandles::current(),
        );
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        let (write_tx, mut write_rx) = mpsc::channel(4);
        feed.send(StreamItem::Event(Event::data(
            "x",
            Some(ReplyHandle::for_connection(write_tx)),
        )))
        .unwrap();

        let out = next_event(&mut rx).await;
        assert!(out.reply("routed"));
        assert_eq!(write_rx.recv().await.unwrap().as_str(), "routed");
    }
}
