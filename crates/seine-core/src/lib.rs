//! Core data model for the seine event-pipeline runtime.
//!
//! This crate defines the typed node configurations (sources, stages,
//! endpoints) that the topology resolver consumes, together with the
//! event-kind filters and reply policies shared between the runtime and
//! the configuration loader.

pub mod config;

pub use config::{
    EndpointConfig, EventKind, EventKindSet, ReplyPolicy, SourceConfig, StageConfig,
};
