//! Combine-latest stage: pairs each trigger event with the most recent
//! source event.
//!
//! Output ordering follows the trigger stream. Triggers arriving before
//! the first source event are skipped; afterwards every trigger produces
//! exactly one event whose payload is `{"source": ..., "trigger": ...}`
//! and whose reply capability is the trigger's.

use super::payload_to_json;
use crate::context::RuntimeHandles;
use crate::event::{Payload, StreamItem};
use crate::session::SessionError;
use crate::stream::{EventSource, EventStream};
use async_trait::async_trait;
use seine_core::EventKindSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct BufferStage {
    name: String,
    source: EventStream,
    events: EventKindSet,
    trigger_source: EventStream,
    trigger_events: EventKindSet,
    handles: RuntimeHandles,
    task: Option<JoinHandle<()>>,
}

impl BufferStage {
    pub fn new(
        name: &str,
        source: EventStream,
        events: EventKindSet,
        trigger_source: EventStream,
        trigger_events: EventKindSet,
        handles: RuntimeHandles,
    ) -> Self {
        Self {
            name: name.to_string(),
            source,
            events,
            trigger_source,
            trigger_events,
            handles,
            task: None,
        }
    }
}

#[async_trait]
impl EventSource for BufferStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let mut source_sub = self.source.subscribe();
        let mut trigger_sub = self.trigger_source.subscribe();
        let events = self.events.clone();
        let trigger_events = self.trigger_events.clone();
        let name = self.name.clone();

        self.task = Some(self.handles.spawn_app(async move {
            let mut latest: Option<Payload> = None;
            let mut source_open = true;

            loop {
                tokio::select! {
                    item = source_sub.next(), if source_open => match item {
                        Some(StreamItem::Event(ev)) => {
                            if events.accepts(ev.kind) {
                                latest = Some(ev.payload.clone());
                            }
                        }
                        Some(StreamItem::Failed(e)) => {
                            let _ = tx.send(StreamItem::Failed(e));
                            break;
                        }
                        // Source exhausted: keep combining with what we have.
                        None => source_open = false,
                    },
                    item = trigger_sub.next() => match item {
                        Some(StreamItem::Event(ev)) => {
                            if !trigger_events.accepts(ev.kind) {
                                continue;
                            }
                            let Some(source_payload) = &latest else {
                                debug!(stage = %name, "trigger before first source event, skipped");
                                continue;
                            };
                            let merged = serde_json::json!({
                                "source": payload_to_json(source_payload),
                                "trigger": payload_to_json(&ev.payload),
                            });
                            let _ = tx.send(StreamItem::Event(ev.with_payload(merged)));
                        }
                        Some(StreamItem::Failed(e)) => {
                            let _ = tx.send(StreamItem::Failed(e));
                            break;
                        }
                        None => break,
                    },
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
