//! Template stage: renders a template against the payload interpreted as
//! JSON, exposed to the template as `payload`.

use super::StageError;
use crate::context::RuntimeHandles;
use crate::event::{Event, StreamItem};
use crate::session::SessionError;
use crate::stream::{EventSource, EventStream};
use async_trait::async_trait;
use seine_core::EventKindSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct TemplateStage {
    name: String,
    upstream: EventStream,
    events: EventKindSet,
    template: Arc<str>,
    handles: RuntimeHandles,
    task: Option<JoinHandle<()>>,
}

impl TemplateStage {
    /// Validates the template once; a syntax error is rejected here.
    pub fn new(
        name: &str,
        upstream: EventStream,
        events: EventKindSet,
        template: &str,
        handles: RuntimeHandles,
    ) -> Result<Self, StageError> {
        let env = minijinja::Environment::new();
        env.template_from_str(template)
            .map_err(|e| StageError::Compile(format!("template error: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            upstream,
            events,
            template: Arc::from(template),
            handles,
            task: None,
        })
    }
}

/// Render one event. An empty payload renders to the empty string without
/// touching the engine; a render failure is terminal for the produced
/// stream.
fn render(template: &str, input: &Event) -> Result<String, SessionError> {
    if input.payload.is_empty() {
        return Ok(String::new());
    }
    let context = serde_json::json!({
        "payload": super::payload_to_json(&input.payload),
    });
    let env = minijinja::Environment::new();
    env.render_str(template, context)
        .map_err(|e| SessionError::Transform(format!("template render: {}", e)))
}

#[async_trait]
impl EventSource for TemplateStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let mut upstream = self.upstream.subscribe();
        let events = self.events.clone();
        let template = self.template.clone();
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
                        match render(&template, &ev) {
                            Ok(out) => {
                                debug!(stage = %name, "rendered {} bytes", out.len());
                                let _ = tx.send(StreamItem::Event(ev.with_payload(out)));
                            }
                            Err(e) => {
                                warn!(stage = %name, error = %e, "render failed");
                                let _ = tx.send(StreamItem::failed(e));
                                break;
                            }
                        }
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
    use crate::stage::tests_support::{feed_stream, next_event, next_failure};

    fn stage(
        template: &str,
    ) -> Result<
        (
            TemplateStage,
            tokio::sync::mpsc::UnboundedSender<StreamItem>,
        ),
        StageError,
    > {
        let (upstream, feed) = feed_stream("in");
        let stage = TemplateStage::new(
            "t",
            upstream,
            EventKindSet::data_only(),
            template,
            RuntimeHandles::current(),
        )?;
        Ok((stage, feed))
    }

    #[tokio::test]
    async fn test_bad_template_fails_at_construction() {
        let err = stage("{% broken").err().expect("must not compile");
        assert!(matches!(err, StageError::Compile(_)));
    }

    #[tokio::test]
    async fn test_renders_payload_fields() {
        let (mut stage, feed) = stage("name={{ payload.name }}").unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        feed.send(StreamItem::Event(Event::data(r#"{"name": "ada"}"#, None)))
            .unwrap();
        assert_eq!(next_event(&mut rx).await.payload.as_str(), "name=ada");
    }

    #[tokio::test]
    async fn test_non_json_payload_renders_as_string() {
        let (mut stage, feed) = stage("got: {{ payload }}").unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        feed.send(StreamItem::Event(Event::data("raw text", None)))
            .unwrap();
        assert_eq!(next_event(&mut rx).await.payload.as_str(), "got: raw text");
    }

    #[tokio::test]
    async fn test_empty_payload_renders_empty() {
        let (mut stage, feed) = stage("never: {{ payload.x }}").unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        feed.send(StreamItem::Event(Event::data("", None))).unwrap();
        let out = next_event(&mut rx).await;
        assert!(out.payload.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_passes_through() {
        let (mut stage, feed) = stage("{{ payload }}").unwrap();
        let (tx, mut rx) = broadcast::channel(16);
        stage.start(tx).await.unwrap();

        feed.send(StreamItem::failed(SessionError::Handshake("tls".into())))
            .unwrap();
        let err = next_failure(&mut rx).await;
        assert!(matches!(*err, SessionError::Handshake(_)));
    }
}
