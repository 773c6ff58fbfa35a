//! Seine runtime - streaming connection runtime and topology assembly.
//!
//! This crate implements the live half of a seine deployment: connection
//! sessions (WebSocket client/server, HTTP server), the multicast stream
//! abstraction that shares one connection across any number of
//! subscribers, the transform stages, and the topology resolver that
//! wires a declarative node list into a running graph.

pub mod context;
pub mod event;
pub mod session;
pub mod stage;
pub mod stream;
pub mod topology;

pub use context::{ContextError, ExecutionContext, RuntimeHandles};
pub use event::{Event, Payload, ReplyHandle, StreamItem};
pub use seine_core::EventKind;
pub use session::{ConnectionPool, SessionError, SessionState};
pub use stream::{EventSource, EventStream, StreamSubscription, Subscription};
pub use topology::{Topology, TopologyError};
