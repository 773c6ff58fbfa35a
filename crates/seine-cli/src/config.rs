//! Configuration document support.
//!
//! A deployment is declared in one YAML document with three ordered
//! lists, discriminated by their `service`/`pipeline` tags:
//!
//! ```yaml
//! services:
//!   - name: feed
//!     service: websocket-client
//!     host: stream.example.com
//!     port: 443
//!     target: /live
//!     ssl: true
//!
//! pipelines:
//!   - name: extract
//!     pipeline: query
//!     source: feed
//!     script: ".payload"
//!
//! endpoints:
//!   - name: sink
//!     source: extract
//!     event: data
//! ```

use seine_core::{EndpointConfig, SourceConfig, StageConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    ReadError(String),
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
}

/// The whole declarative topology: ordered node lists, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub services: Vec<SourceConfig>,
    pub pipelines: Vec<StageConfig>,
    pub endpoints: Vec<EndpointConfig>,
}

impl Document {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.pipelines.is_empty() && self.endpoints.is_empty()
    }

    /// A commented starting point for `--example`.
    pub fn example() -> Self {
        use seine_core::{EventKind, EventKindSet, ReplyPolicy};
        Self {
            services: vec![SourceConfig::WebsocketServer {
                name: "inbound".to_string(),
                host: "127.0.0.1".to_string(),
                port: 9000,
            }],
            pipelines: vec![StageConfig::Query {
                name: "extract".to_string(),
                source: "inbound".to_string(),
                script: ".message".to_string(),
                events: EventKindSet::data_only(),
            }],
            endpoints: vec![EndpointConfig {
                name: "echo".to_string(),
                source: "extract".to_string(),
                event: Some(EventKind::Data),
                data: None,
                reply: ReplyPolicy::Echo,
            }],
        }
    }

    pub fn example_yaml() -> String {
        serde_yaml::to_string(&Self::example()).unwrap_or_default()
    }
}
