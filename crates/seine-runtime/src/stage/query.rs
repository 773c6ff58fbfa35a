//! Query stage: evaluates a jq filter over each JSON value in the
//! payload and emits one event per non-null result.

use super::StageError;
use crate::context::RuntimeHandles;
use crate::event::{Event, StreamItem};
use crate::session::SessionError;
use crate::stream::{EventSource, EventStream};
use async_trait::async_trait;
use jaq_interpret::{Ctx, FilterT, ParseCtx, RcIter, Val};
use seine_core::EventKindSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct QueryStage {
    name: String,
    upstream: EventStream,
    events: EventKindSet,
    filter: Arc<jaq_interpret::Filter>,
    handles: RuntimeHandles,
    task: Option<JoinHandle<()>>,
}

impl QueryStage {
    /// Compiles the script once; a bad script is rejected here and never
    /// reaches the running topology.
    pub fn new(
        name: &str,
        upstream: EventStream,
        events: EventKindSet,
        script: &str,
        handles: RuntimeHandles,
    ) -> Result<Self, StageError> {
        let filter = compile_filter(script)?;
        Ok(Self {
            name: name.to_string(),
            upstream,
            events,
            filter: Arc::new(filter),
            handles,
            task: None,
        })
    }
}

fn compile_filter(script: &str) -> Result<jaq_interpret::Filter, StageError> {
    let mut defs = ParseCtx::new(Vec::new());
    defs.insert_natives(jaq_core::core());
    defs.insert_defs(jaq_std::std());

    let (main, parse_errs) = jaq_parse::parse(script, jaq_parse::main());
    if !parse_errs.is_empty() || main.is_none() {
        return Err(StageError::Compile(format!(
            "jq parse error in {:?}",
            script
        )));
    }

    let filter = defs.compile(main.expect("checked above"));
    if !defs.errs.is_empty() {
        return Err(StageError::Compile(format!(
            "jq compile error in {:?}",
            script
        )));
    }
    Ok(filter)
}

/// Run the filter over every JSON value in the payload. The payload may
/// hold a whole sequence of concatenated values; each is queried
/// independently. Unparseable or empty input yields no output.
fn evaluate(
    filter: &jaq_interpret::Filter,
    input: &Event,
) -> Result<Vec<serde_json::Value>, SessionError> {
    let text = input.payload.as_str();
    let mut outputs = Vec::new();

    let values = serde_json::Deserializer::from_str(&text).into_iter::<serde_json::Value>();
    for value in values {
        let value = match value {
            Ok(v) => v,
            Err(_) => break, // trailing garbage ends the sequence
        };
        let inputs = RcIter::new(core::iter::empty());
        for result in filter.run((Ctx::new([], &inputs), Val::from(value))) {
            match result {
                Ok(val) => {
                    let json = serde_json::Value::from(val);
                    if !json.is_null() {
                        outputs.push(json);
                    }
                }
                Err(e) => {
                    return Err(SessionError::Transform(format!("jq evaluation: {}", e)));
                }
            }
        }
    }
    Ok(outputs)
}

#[async_trait]
impl EventSource for QueryStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, tx: broadcast::Sender<StreamItem>) -> Result<(), SessionError> {
        let mut upstream = self.upstream.subscribe();
        let events = self.events.clone();
        let filter = self.filter.clone();
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
                        match evaluate(&filter, &ev) {
                            Ok(results) => {
                                for json in results {
                                    debug!(stage = %name, "emitting {}", json);
                                    let _ =
                                        tx.send(StreamItem::Event(ev.with_payload(json)));
                                }
                            }
                            Err(e) => {
                                warn!(stage = %name, error = %e, "query failed");
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
