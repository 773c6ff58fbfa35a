//! Typed node configurations for sources, stages and endpoints.
//!
//! A topology is declared as three ordered lists. Sources and stages share
//! one namespace: a stage may name either a source or an earlier stage as
//! its input. The resolver consumes these lists as-is; all parsing from a
//! configuration document happens upstream (see the CLI crate).

use serde::{Deserialize, Serialize};

/// Lifecycle kind of an event envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connected,
    Data,
    Disconnected,
}

/// Set of event kinds a stage or endpoint accepts.
///
/// Stages default to data-only; an empty set accepts nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKindSet(pub Vec<EventKind>);

impl EventKindSet {
    pub fn data_only() -> Self {
        Self(vec![EventKind::Data])
    }

    pub fn all() -> Self {
        Self(vec![
            EventKind::Connected,
            EventKind::Data,
            EventKind::Disconnected,
        ])
    }

    pub fn accepts(&self, kind: EventKind) -> bool {
        self.0.contains(&kind)
    }
}

impl Default for EventKindSet {
    fn default() -> Self {
        Self::data_only()
    }
}

impl From<Vec<EventKind>> for EventKindSet {
    fn from(kinds: Vec<EventKind>) -> Self {
        Self(kinds)
    }
}

/// What an endpoint writes back to the connection that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyPolicy {
    /// Reply with the endpoint's configured literal data.
    Literal,
    /// Reply with the event payload, unless it is empty or a lone newline.
    #[default]
    Echo,
    /// Never reply.
    None,
}

/// A named network-facing source producing an event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "kebab-case")]
pub enum SourceConfig {
    /// Outbound WebSocket connection, plain or TLS.
    WebsocketClient {
        name: String,
        host: String,
        port: u16,
        #[serde(default = "default_target")]
        target: String,
        #[serde(default)]
        ssl: bool,
    },
    /// Listening WebSocket acceptor; every accepted peer feeds one stream.
    WebsocketServer {
        name: String,
        host: String,
        port: u16,
    },
    /// Listening HTTP/1 server; each request becomes one data event.
    HttpServer {
        name: String,
        host: String,
        port: u16,
    },
}

impl SourceConfig {
    pub fn name(&self) -> &str {
        match self {
            SourceConfig::WebsocketClient { name, .. }
            | SourceConfig::WebsocketServer { name, .. }
            | SourceConfig::HttpServer { name, .. } => name,
        }
    }
}

fn default_target() -> String {
    "/".to_string()
}

/// A named transform consuming one stream and producing another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pipeline", rename_all = "kebab-case")]
pub enum StageConfig {
    /// Evaluate a jq filter over each JSON value in the payload; one output
    /// event per non-null result.
    Query {
        name: String,
        source: String,
        script: String,
        #[serde(default)]
        events: EventKindSet,
    },
    /// Render a template against the payload interpreted as JSON.
    Template {
        name: String,
        source: String,
        template: String,
        #[serde(default)]
        events: EventKindSet,
    },
    /// Replace the payload with a fixed literal.
    Emit {
        name: String,
        source: String,
        data: String,
        #[serde(default)]
        events: EventKindSet,
    },
    /// Combine-latest: each trigger event is merged with the most recent
    /// source event into one `{source, trigger}` payload.
    Buffer {
        name: String,
        source: String,
        #[serde(default)]
        events: EventKindSet,
        trigger_source: String,
        #[serde(default)]
        trigger_events: EventKindSet,
    },
    /// Perform the HTTP GET described by the payload and emit the response.
    HttpCall {
        name: String,
        source: String,
        #[serde(default)]
        ssl: bool,
        #[serde(default)]
        events: EventKindSet,
    },
}

impl StageConfig {
    pub fn name(&self) -> &str {
        match self {
            StageConfig::Query { name, .. }
            | StageConfig::Template { name, .. }
            | StageConfig::Emit { name, .. }
            | StageConfig::Buffer { name, .. }
            | StageConfig::HttpCall { name, .. } => name,
        }
    }

    /// Name of the stream this stage consumes.
    pub fn source(&self) -> &str {
        match self {
            StageConfig::Query { source, .. }
            | StageConfig::Template { source, .. }
            | StageConfig::Emit { source, .. }
            | StageConfig::Buffer { source, .. }
            | StageConfig::HttpCall { source, .. } => source,
        }
    }
}

/// A named consumer of a stream, optionally replying to the originating
/// connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    /// Name of the source or stage to subscribe to.
    pub source: String,
    /// Accept only this kind; absent means all kinds.
    #[serde(default)]
    pub event: Option<EventKind>,
    /// Literal reply data for the `literal` policy.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub reply: ReplyPolicy,
}

impl EndpointConfig {
    pub fn accepts(&self, kind: EventKind) -> bool {
        self.event.map_or(true, |e| e == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // EventKindSet
    // ==========================================================================

    #[test]
    fn test_kind_set_default_is_data_only() {
        let set = EventKindSet::default();
        assert!(set.accepts(EventKind::Data));
        assert!(!set.accepts(EventKind::Connected));
        assert!(!set.accepts(EventKind::Disconnected));
    }

    #[test]
    fn test_kind_set_all() {
        let set = EventKindSet::all();
        assert!(set.accepts(EventKind::Connected));
        assert!(set.accepts(EventKind::Data));
        assert!(set.accepts(EventKind::Disconnected));
    }

    #[test]
    fn test_kind_set_empty_accepts_nothing() {
        let set = EventKindSet(vec![]);
        assert!(!set.accepts(EventKind::Data));
    }

    #[test]
    fn test_kind_set_yaml_round_trip() {
        let set = EventKindSet(vec![EventKind::Connected, EventKind::Data]);
        let yaml = serde_yaml::to_string(&set).unwrap();
        let restored: EventKindSet = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(set, restored);
    }

    // ==========================================================================
    // SourceConfig
    // ==========================================================================

    #[test]
    fn test_websocket_client_from_yaml() {
        let yaml = r#"
            name: feed
            service: websocket-client
            host: example.com
            port: 443
            target: /stream
            ssl: true
        "#;
        let cfg: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.name(), "feed");
        match cfg {
            SourceConfig::WebsocketClient {
                host,
                port,
                target,
                ssl,
                ..
            } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
                assert_eq!(target, "/stream");
                assert!(ssl);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_websocket_client_defaults() {
        let yaml = r#"
            name: feed
            service: websocket-client
            host: localhost
            port: 8080
        "#;
        let cfg: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        match cfg {
            SourceConfig::WebsocketClient { target, ssl, .. } => {
                assert_eq!(target, "/");
                assert!(!ssl);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_http_server_from_yaml() {
        let yaml = r#"
            name: ingress
            service: http-server
            host: 127.0.0.1
            port: 9090
        "#;
        let cfg: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.name(), "ingress");
        assert!(matches!(cfg, SourceConfig::HttpServer { port: 9090, .. }));
    }

    #[test]
    fn test_unknown_service_tag_is_rejected() {
        let yaml = r#"
            name: x
            service: carrier-pigeon
            host: h
            port: 1
        "#;
        assert!(serde_yaml::from_str::<SourceConfig>(yaml).is_err());
    }

    // ==========================================================================
    // StageConfig
    // ==========================================================================

    #[test]
    fn test_query_stage_from_yaml() {
        let yaml = r#"
            name: extract
            pipeline: query
            source: feed
            script: ".key"
        "#;
        let cfg: StageConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.name(), "extract");
        assert_eq!(cfg.source(), "feed");
        match cfg {
            StageConfig::Query { script, events, .. } => {
                assert_eq!(script, ".key");
                assert_eq!(events, EventKindSet::data_only());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_buffer_stage_from_yaml() {
        let yaml = r#"
            name: merge
            pipeline: buffer
            source: feed
            trigger_source: tick
            trigger_events: [data]
        "#;
        let cfg: StageConfig = serde_yaml::from_str(yaml).unwrap();
        match cfg {
            StageConfig::Buffer {
                trigger_source,
                trigger_events,
                ..
            } => {
                assert_eq!(trigger_source, "tick");
                assert!(trigger_events.accepts(EventKind::Data));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_stage_event_filter_override() {
        let yaml = r#"
            name: hello
            pipeline: emit
            source: feed
            data: "hi"
            events: [connected]
        "#;
        let cfg: StageConfig = serde_yaml::from_str(yaml).unwrap();
        match cfg {
            StageConfig::Emit { events, .. } => {
                assert!(events.accepts(EventKind::Connected));
                assert!(!events.accepts(EventKind::Data));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_stage_yaml_round_trip() {
        let cfg = StageConfig::HttpCall {
            name: "fetch".to_string(),
            source: "requests".to_string(),
            ssl: true,
            events: EventKindSet::data_only(),
        };
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let restored: StageConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(cfg, restored);
    }

    // ==========================================================================
    // EndpointConfig
    // ==========================================================================

    #[test]
    fn test_endpoint_defaults() {
        let yaml = r#"
            name: sink
            source: extract
        "#;
        let cfg: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.reply, ReplyPolicy::Echo);
        assert!(cfg.event.is_none());
        assert!(cfg.data.is_none());
        assert!(cfg.accepts(EventKind::Connected));
        assert!(cfg.accepts(EventKind::Data));
    }

    #[test]
    fn test_endpoint_event_filter() {
        let yaml = r#"
            name: sink
            source: feed
            event: data
            reply: none
        "#;
        let cfg: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.accepts(EventKind::Data));
        assert!(!cfg.accepts(EventKind::Disconnected));
        assert_eq!(cfg.reply, ReplyPolicy::None);
    }

    #[test]
    fn test_endpoint_literal_reply() {
        let yaml = r#"
            name: ack
            source: feed
            event: data
            data: "ok"
            reply: literal
        "#;
        let cfg: EndpointConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.data.as_deref(), Some("ok"));
        assert_eq!(cfg.reply, ReplyPolicy::Literal);
    }
}
