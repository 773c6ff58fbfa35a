//! Outbound-call stage: performs the HTTP GET described by each payload
//! and replaces it with the response.
//!
//! The payload must be JSON carrying string fields `host`, `port` and
//! `target` (plus an optional `version`, accepted for compatibility). The
//! response becomes `{"headers": {...}, "body": ...}` where the body is
//! parsed JSON when the response says `application/json` and plain text
//! otherwise. A malformed description or a transport failure is terminal
//! for the produced stream.

use crate::context::RuntimeHandles;
use crate::event::{Event, StreamItem};
use crate::session::SessionError;
use crate::stream::{EventSource, EventStream};
use async_trait::async_trait;
use seine_core::EventKindSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct HttpCallStage {
    name: String,
    upstream: EventStream,
    events: EventKindSet,
    ssl: bool,
    client: reqwest::Client,
    handles: RuntimeHandles,
    task: Option<JoinHandle<()>>,
}

impl HttpCallStage {
    pub fn new(
        name: &str,
        upstream: EventStream,
        events: EventKindSet,
        ssl: bool,
        handles: RuntimeHandles,
    ) -> Self {
        Self {
            name: name.to_string(),
            upstream,
            events,
            ssl,
            client: reqwest::Client::new(),
            handles,
            task: None,
        }
    }
}

fn required_str(json: &serde_json::Value, field: &str) -> Result<String, SessionError> {
    json.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SessionError::Transform(format!("key {:?} required", field)))
}

async fn perform_call(
    client: &reqwest::Client,
    ssl: bool,
    input: &Event,
) -> Result<serde_json::Value, SessionError> {
    let description = input
        .payload
        .as_json()
        .ok_or_else(|| SessionError::Transform("request description must be JSON".to_string()))?;

    let host = required_str(&description, "host")?;
    let port = required_str(&description, "port")?;
    let target = required_str(&description, "target")?;
    let scheme = if ssl { "https" } else { "http" };
    let url = format!("{}://{}:{}{}", scheme, host, port, target);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| SessionError::Transform(format!("request to {}: {}", url, e)))?;

    let mut headers = serde_json::Map::new();
    for (name, value) in response.headers().iter() {
        headers.insert(
            name.as_str().to_string(),
            serde_json::Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        );
    }

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    let text = response
        .text()
        .await
        .map_err(|e| SessionError::Transform(format!("response from {}: {}", url, e)))?;

    let body = if is_json {
        serde_json::from_str(&text)
            .map_err(|e| SessionError::Transform(format!("response json: {}", e)))?
    } else {
        serde_json::Value::String(text)
    };

    Ok(serde_json::json!({ "headers": headers, "body": body }))
}

#[async_trait]
impl EventSource for HttpCallStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let mut upstream = self.upstream.subscribe();
        let events = self.events.clone();
        let client = self.client.clone();
        let ssl = self.ssl;
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
                        match perform_call(&client, ssl, &ev).await {
                            Ok(json) => {
                                debug!(stage = %name, "call completed");
                                let _ = tx.send(StreamItem::Event(ev.with_payload(json)));
                            }
                            Err(e) => {
                                warn!(stage = %name, error = %e, "call failed");
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
