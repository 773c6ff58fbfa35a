//! Named transform stages.
//!
//! A stage consumes one resolved stream (two for combine-latest), filters
//! by event kind (data-only unless configured otherwise), transforms, and
//! produces a new stream. Stages are [`EventSource`](crate::stream::EventSource)s
//! themselves: they subscribe upstream only while their own stream has
//! subscribers, so laziness chains all the way back to the transport.
//!
//! Terminal failures ([`StreamItem::Failed`](crate::event::StreamItem))
//! pass through every stage unchanged; a stage's own failure (template
//! render error, malformed outbound-call description, transport failure
//! of the call itself) ends its output stream the same way.

pub mod buffer;
pub mod emit;
pub mod http_call;
pub mod query;
pub mod template;

pub use buffer::BufferStage;
pub use emit::EmitStage;
pub use http_call::HttpCallStage;
pub use query::QueryStage;
pub use template::TemplateStage;

use crate::event::Payload;
use thiserror::Error;

/// Construction-time stage failure, reported once by the resolver.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("compile failed: {0}")]
    Compile(String),
}

/// A payload as one side of a structured merge: parsed JSON when it is
/// JSON, the raw text otherwise.
pub(crate) fn payload_to_json(payload: &Payload) -> serde_json::Value {
    payload
        .as_json()
        .unwrap_or_else(|| serde_json::Value::String(payload.as_str().into_owned()))
}
