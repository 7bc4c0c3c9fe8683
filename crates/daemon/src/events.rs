//! Container runtime event source.
//!
//! Connects to the local Docker daemon and turns its container events into
//! [`LifecycleEvent`]s for the controller.

use std::collections::HashMap;

use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, TimeZone, Utc};
use futures::Stream;
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
    Destroy,
    Restart,
    Pause,
    Unpause,
    HealthStatus,
}

impl EventKind {
    /// `health_status` actions carry the status after a colon, e.g.
    /// `health_status: healthy`.
    pub fn parse(action: &str) -> Option<Self> {
        let verb = action.split(':').next().unwrap_or_default().trim();
        match verb {
            "start" => Some(EventKind::Start),
            "stop" => Some(EventKind::Stop),
            "destroy" => Some(EventKind::Destroy),
            "restart" => Some(EventKind::Restart),
            "pause" => Some(EventKind::Pause),
            "unpause" => Some(EventKind::Unpause),
            "health_status" => Some(EventKind::HealthStatus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub container_id: Option<String>,
    pub name: String,
    pub image: String,
    pub time: DateTime<Utc>,
    pub action: String,
}

const RANCHER_NAME: &str = "io.rancher.container.name";
const RANCHER_UUID: &str = "io.rancher.container.uuid";

impl LifecycleEvent {
    pub fn from_message(msg: EventMessage) -> Option<Self> {
        if msg.typ != Some(EventMessageTypeEnum::CONTAINER) {
            return None;
        }
        let action = msg.action?;
        let kind = EventKind::parse(&action)?;

        let attributes: HashMap<String, String> = msg
            .actor
            .and_then(|a| a.attributes)
            .unwrap_or_default();
        let name = attributes
            .get(RANCHER_NAME)
            .or_else(|| attributes.get("name"))
            .cloned()
            .unwrap_or_default();
        let time = msg
            .time_nano
            .map(|ns| Utc.timestamp_nanos(ns))
            .or_else(|| msg.time.and_then(|s| Utc.timestamp_opt(s, 0).single()))
            .unwrap_or_else(Utc::now);

        Some(LifecycleEvent {
            kind,
            container_id: attributes.get(RANCHER_UUID).cloned(),
            image: attributes.get("image").cloned().unwrap_or_default(),
            name,
            time,
            action,
        })
    }
}

/// Connect to the runtime and verify it answers.
pub async fn connect(docker_host: Option<&str>) -> Result<Docker> {
    let docker = match docker_host {
        Some(host) if host.starts_with("unix://") => {
            Docker::connect_with_socket(host, 120, bollard::API_DEFAULT_VERSION)?
        }
        Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)?,
        None => Docker::connect_with_local_defaults()?,
    };
    docker.ping().await?;
    info!("connected to docker api");
    Ok(docker)
}

/// Container events from `since` onwards, so events raised while the
/// initial sync runs are replayed rather than lost.
pub fn subscribe(
    docker: &Docker,
    since: DateTime<Utc>,
) -> impl Stream<Item = Result<EventMessage, bollard::errors::Error>> + '_ {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    docker.events(Some(EventsOptions::<String> {
        since: Some(since.timestamp().to_string()),
        until: None,
        filters,
    }))
}
