//! Topology resolver: turns the ordered node lists into a live graph.
//!
//! Sources are instantiated first, stages next in configuration order
//! (each resolving its inputs against everything already built; a stage
//! cannot reference a later declaration), endpoints last. Construction
//! failures are fatal: the partially built graph is dropped and zero live
//! subscriptions remain.

use crate::context::RuntimeHandles;
use crate::event::{Event, StreamItem};
use crate::session::{HttpServerSource, WebsocketClientSource, WebsocketServerSource};
use crate::session::ws_client::WebsocketClientConfig;
use crate::stage::{BufferStage, EmitStage, HttpCallStage, QueryStage, StageError, TemplateStage};
use crate::stream::{EventSource, EventStream, Subscription};
use seine_core::{EndpointConfig, ReplyPolicy, SourceConfig, StageConfig};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("node [{node}] references unknown source [{reference}]")]
    UnresolvedReference { node: String, reference: String },
    #[error("node [{node}] failed to compile: {message}")]
    Compile { node: String, message: String },
    #[error("node [{node}] is misconfigured: {message}")]
    Configuration { node: String, message: String },
}

impl TopologyError {
    fn compile(node: &str, err: StageError) -> Self {
        TopologyError::Compile {
            node: node.to_string(),
            message: err.to_string(),
        }
    }
}

/// What an endpoint does with an accepted event, fixed at wiring time.
enum ReplyAction {
    None,
    Literal(String),
    Echo,
}

impl ReplyAction {
    fn apply(&self, name: &str, event: &Event) {
        match self {
            ReplyAction::None => {}
            ReplyAction::Literal(data) => {
                debug!(endpoint = %name, "replying with configured data");
                event.reply(data.as_str());
            }
            ReplyAction::Echo => {
                let payload = event.payload.as_str();
                if payload.is_empty() || payload == "\n" {
                    debug!(endpoint = %name, "no payload to reply with");
                } else {
                    debug!(endpoint = %name, "replying with payload");
                    let owned = payload.into_owned();
                    event.reply(owned);
                }
            }
        }
    }
}

/// The live graph: every stream created by resolution plus the endpoint
/// subscriptions that keep it flowing.
pub struct Topology {
    streams: Vec<(String, EventStream)>,
    subscriptions: Vec<Subscription>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology")
            .field("streams", &self.streams.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("subscriptions", &self.subscriptions.len())
            .finish()
    }
}

impl Topology {
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// First stream registered under `name`, sources before stages.
    pub fn stream(&self, name: &str) -> Option<&EventStream> {
        self.streams
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    /// Cancel every endpoint subscription. Transports wind down as their
    /// streams lose their last subscribers.
    pub fn unsubscribe_all(&self) {
        for sub in &self.subscriptions {
            sub.unsubscribe();
        }
    }

    /// Tear the topology down, waiting at most `grace` for the endpoint
    /// tasks to observe their cancellation.
    pub async fn shutdown(self, grace: Duration) {
        self.unsubscribe_all();
        let deadline = Instant::now() + grace;
        while self.subscriptions.iter().any(|s| s.is_subscribed()) {
            if Instant::now() >= deadline {
                error!("shutdown grace period elapsed with subscriptions still live");
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Build the live graph from the ordered node lists.
pub fn resolve(
    handles: &RuntimeHandles,
    sources: &[SourceConfig],
    stages: &[StageConfig],
    endpoints: &[EndpointConfig],
) -> Result<Topology, TopologyError> {
    let mut streams: Vec<(String, EventStream)> = Vec::new();

    debug!("spawning sources");
    for cfg in sources {
        let name = cfg.name().to_string();
        let source: Box<dyn EventSource> = match cfg {
            SourceConfig::WebsocketClient {
                host,
                port,
                target,
                ssl,
                ..
            } => {
                info!(source = %name, %host, port, ssl, "creating websocket client");
                let config = WebsocketClientConfig::new(host, *port)
                    .with_target(target)
                    .with_ssl(*ssl);
                Box::new(WebsocketClientSource::new(&name, config))
            }
            SourceConfig::WebsocketServer { host, port, .. } => {
                info!(source = %name, %host, port, "creating websocket server");
                Box::new(WebsocketServerSource::new(&name, host, *port))
            }
            SourceConfig::HttpServer { host, port, .. } => {
                info!(source = %name, %host, port, "creating http server");
                Box::new(HttpServerSource::new(&name, host, *port))
            }
        };
        let stream = EventStream::spawn(handles, name.clone(), source);
        streams.push((name, stream));
    }

    debug!("spawning stages");
    for cfg in stages {
        let name = cfg.name().to_string();
        let upstream = find_stream(&streams, &name, cfg.source())?;

        let stage: Box<dyn EventSource> = match cfg {
            StageConfig::Query { script, events, .. } => {
                info!(stage = %name, "creating query stage");
                Box::new(
                    QueryStage::new(&name, upstream, events.clone(), script, handles.clone())
                        .map_err(|e| TopologyError::compile(&name, e))?,
                )
            }
            StageConfig::Template {
                template, events, ..
            } => {
                info!(stage = %name, "creating template stage");
                Box::new(
                    TemplateStage::new(&name, upstream, events.clone(), template, handles.clone())
                        .map_err(|e| TopologyError::compile(&name, e))?,
                )
            }
            StageConfig::Emit { data, events, .. } => {
                info!(stage = %name, "creating emit stage");
                Box::new(EmitStage::new(
                    &name,
                    upstream,
                    events.clone(),
                    data,
                    handles.clone(),
                ))
            }
            StageConfig::Buffer {
                events,
                trigger_source,
                trigger_events,
                ..
            } => {
                info!(stage = %name, "creating buffer stage");
                let trigger = find_stream(&streams, &name, trigger_source)?;
                Box::new(BufferStage::new(
                    &name,
                    upstream,
                    events.clone(),
                    trigger,
                    trigger_events.clone(),
                    handles.clone(),
                ))
            }
            StageConfig::HttpCall { ssl, events, .. } => {
                info!(stage = %name, "creating http-call stage");
                Box::new(HttpCallStage::new(
                    &name,
                    upstream,
                    events.clone(),
                    *ssl,
                    handles.clone(),
                ))
            }
        };
        let stream = EventStream::spawn(handles, name.clone(), stage);
        streams.push((name, stream));
    }

    debug!("spawning endpoints");
    let mut subscriptions = Vec::new();
    for cfg in endpoints {
        let stream = find_stream(&streams, &cfg.name, &cfg.source)?;
        let action = reply_action(cfg)?;

        info!(endpoint = %cfg.name, source = %cfg.source, "creating endpoint");
        let name = cfg.name.clone();
        let filter = cfg.clone();
        let mut subscription = stream.subscribe();
        let task = handles.spawn_app(async move {
            while let Some(item) = subscription.next().await {
                match item {
                    StreamItem::Failed(e) => {
                        error!(endpoint = %name, error = %e, "stream terminated");
                        break;
                    }
                    StreamItem::Event(ev) => {
                        if !filter.accepts(ev.kind) {
                            continue;
                        }
                        debug!(endpoint = %name, kind = ?ev.kind, "event received");
                        action.apply(&name, &ev);
                    }
                }
            }
        });
        subscriptions.push(Subscription::new(cfg.name.clone(), task));
    }

    Ok(Topology {
        streams,
        subscriptions,
    })
}

fn find_stream(
    streams: &[(String, EventStream)],
    node: &str,
    reference: &str,
) -> Result<EventStream, TopologyError> {
    streams
        .iter()
        .find(|(name, _)| name == reference)
        .map(|(_, stream)| stream.clone())
        .ok_or_else(|| TopologyError::UnresolvedReference {
            node: node.to_string(),
            reference: reference.to_string(),
        })
}

/// The configured data wins over the default echo; a literal policy
/// without data is rejected rather than silently downgraded.
fn reply_action(cfg: &EndpointConfig) -> Result<ReplyAction, TopologyError> {
    match (cfg.reply, &cfg.data) {
        (ReplyPolicy::None, _) => Ok(ReplyAction::None),
        (ReplyPolicy::Literal, Some(data)) | (ReplyPolicy::Echo, Some(data)) => {
            Ok(ReplyAction::Literal(data.clone()))
        }
        (ReplyPolicy::Literal, None) => Err(TopologyError::Configuration {
            node: cfg.name.clone(),
            message: "literal reply policy requires data".to_string(),
        }),
        (ReplyPolicy::Echo, None) => Ok(ReplyAction::Echo),
    }
}
