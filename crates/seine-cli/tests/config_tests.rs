//! Configuration document tests.

use seine_cli::config::{ConfigError, Document};
use seine_core::{EventKind, ReplyPolicy, SourceConfig, StageConfig};
use std::io::Write;
use tempfile::NamedTempFile;

const FULL_DOCUMENT: &str = r#"
services:
  - name: market
    service: websocket-client
    host: stream.example.com
    port: 443
    target: /live
    ssl: true
  - name: control
    service: websocket-server
    host: 127.0.0.1
    port: 9000
  - name: ingress
    service: http-server
    host: 0.0.0.0
    port: 8080

pipelines:
  - name: prices
    pipeline: query
    source: market
    script: ".price"
  - name: pretty
    pipeline: template
    source: prices
    template: "price is {{ payload }}"
  - name: hello
    pipeline: emit
    source: control
    data: "hi"
    events: [connected]
  - name: snapshot
    pipeline: buffer
    source: prices
    trigger_source: control
  - name: lookup
    pipeline: http-call
    source: ingress
    ssl: false

endpoints:
  - name: reply-prices
    source: pretty
    event: data
  - name: greet
    source: hello
    event: data
    data: "welcome"
  - name: observer
    source: snapshot
    reply: none
"#;

#[test]
fn test_full_document_parses() {
    let doc = Document::from_str(FULL_DOCUMENT).unwrap();
    assert_eq!(doc.services.len(), 3);
    assert_eq!(doc.pipelines.len(), 5);
    assert_eq!(doc.endpoints.len(), 3);
}

#[test]
fn test_declaration_order_is_preserved() {
    let doc = Document::from_str(FULL_DOCUMENT).unwrap();
    let names: Vec<&str> = doc.pipelines.iter().map(|p| p.name()).collect();
    assert_eq!(names, ["prices", "pretty", "hello", "snapshot", "lookup"]);
}

#[test]
fn test_service_variants() {
    let doc = Document::from_str(FULL_DOCUMENT).unwrap();
    assert!(matches!(
        doc.services[0],
        SourceConfig::WebsocketClient { ssl: true, .. }
    ));
    assert!(matches!(doc.services[1], SourceConfig::WebsocketServer { .. }));
    assert!(matches!(doc.services[2], SourceConfig::HttpServer { .. }));
}

#[test]
fn test_stage_wiring_fields() {
    let doc = Document::from_str(FULL_DOCUMENT).unwrap();
    match &doc.pipelines[3] {
        StageConfig::Buffer {
            source,
            trigger_source,
            ..
        } => {
            assert_eq!(source, "prices");
            assert_eq!(trigger_source, "control");
        }
        other => panic!("unexpected stage: {:?}", other),
    }
}

#[test]
fn test_endpoint_fields() {
    let doc = Document::from_str(FULL_DOCUMENT).unwrap();
    assert_eq!(doc.endpoints[0].event, Some(EventKind::Data));
    assert_eq!(doc.endpoints[0].reply, ReplyPolicy::Echo);
    assert_eq!(doc.endpoints[1].data.as_deref(), Some("welcome"));
    assert_eq!(doc.endpoints[2].reply, ReplyPolicy::None);
}

#[test]
fn test_missing_sections_default_to_empty() {
    let doc = Document::from_str("services: []").unwrap();
    assert!(doc.pipelines.is_empty());
    assert!(doc.endpoints.is_empty());

    let doc = Document::from_str("{}").unwrap();
    assert!(doc.is_empty());
}

#[test]
fn test_malformed_yaml_is_a_parse_error() {
    let err = Document::from_str("services: [ {name: x").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn test_unknown_pipeline_tag_is_a_parse_error() {
    let err = Document::from_str(
        r#"
pipelines:
  - name: mystery
    pipeline: teleport
    source: a
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn test_from_file_round_trip() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(FULL_DOCUMENT.as_bytes()).unwrap();

    let doc = Document::from_file(file.path()).unwrap();
    assert_eq!(doc.services.len(), 3);
}

#[test]
fn test_from_file_missing_is_a_read_error() {
    let err = Document::from_file(std::path::Path::new("/no/such/file.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::ReadError(_)));
}

#[test]
fn test_example_round_trips() {
    let yaml = Document::example_yaml();
    let doc = Document::from_str(&yaml).unwrap();
    assert!(!doc.is_empty());
    assert_eq!(doc.services[0].name(), "inbound");
    assert_eq!(doc.pipelines[0].name(), "extract");
    assert_eq!(doc.endpoints[0].name, "echo");
}

#[test]
fn test_yaml_round_trip_preserves_document() {
    let doc = Document::from_str(FULL_DOCUMENT).unwrap();
    let yaml = serde_yaml::to_string(&doc).unwrap();
    let restored = Document::from_str(&yaml).unwrap();
    assert_eq!(doc.services, restored.services);
    assert_eq!(doc.pipelines, restored.pipelines);
    assert_eq!(doc.endpoints, restored.endpoints);
}
