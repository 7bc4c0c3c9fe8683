//! Reconciliation controller.
//!
//! `Disconnected -> Syncing -> Steady`. Syncing wipes every catalog entry
//! owned by this host and registers all running containers; any failure
//! there is fatal. In Steady, `start` registers the container after a settle
//! delay and `stop` deregisters every entry of the container. Other events
//! are logged only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{
    derive_records, CatalogClient, DerivationSettings, HostIdentity, MetadataClient, Outcome, Skip,
};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventKind, LifecycleEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Syncing,
    Steady,
}

struct Shared {
    metadata: MetadataClient,
    catalog: CatalogClient,
    settings: DerivationSettings,
    settle_delay: Duration,
}

pub struct Controller {
    shared: Arc<Shared>,
    state: State,
    host: Option<HostIdentity>,
    tasks: JoinSet<()>,
    pending_starts: HashMap<String, AbortHandle>,
}

fn log_outcomes(outcomes: &[Outcome]) {
    for outcome in outcomes {
        if outcome.ok {
            info!("{}", outcome);
        } else {
            warn!("{}", outcome);
        }
    }
}

/// Derive and register one container's records. Skips are logged here and
/// never propagate.
async fn register_container(
    shared: &Shared,
    host: &HostIdentity,
    container: &common::ContainerObservation,
) -> Vec<Outcome> {
    match derive_records(host, container, &shared.settings) {
        Ok(records) => {
            info!(
                "registering {} (image : {}, {} record(s))",
                container.display_name,
                container.image,
                records.len()
            );
            let outcomes = shared.catalog.register_all(&records).await;
            log_outcomes(&outcomes);
            outcomes
        }
        Err(skip) => {
            info!("{}", skip);
            Vec::new()
        }
    }
}

async fn handle_start(shared: Arc<Shared>, host: HostIdentity, container_id: String, name: String) {
    tokio::time::sleep(shared.settle_delay).await;

    let result = match shared.metadata.container_by_id(&host, &container_id).await {
        Ok(Some(container)) => Ok(container),
        Ok(None) => Err(Skip::NotFound(container_id.clone())),
        Err(source) => Err(Skip::Lookup {
            container: name.clone(),
            source,
        }),
    };

    match result {
        Ok(container) => {
            register_container(&shared, &host, &container).await;
        }
        Err(skip) => warn!("start skipped: {}", skip),
    }
}

impl Controller {
    pub fn new(
        metadata: MetadataClient,
        catalog: CatalogClient,
        settings: DerivationSettings,
        settle_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                metadata,
                catalog,
                settings,
                settle_delay,
            }),
            state: State::Disconnected,
            host: None,
            tasks: JoinSet::new(),
            pending_starts: HashMap::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Full resync after (re)connecting to the event stream. Returns the
    /// per-record outcomes of the registration batch.
    pub async fn on_connect(&mut self) -> Result<Vec<Outcome>> {
        self.state = State::Syncing;
        info!("register existing containers");

        let host = self
            .shared
            .metadata
            .host_identity()
            .await
            .map_err(|source| Error::Sync {
                stage: "resolving host identity",
                source,
            })?;
        info!("host uuid: {}", host.uuid);

        let stale = self
            .shared
            .catalog
            .list_host(&host.uuid)
            .await
            .map_err(|source| Error::Sync {
                stage: "listing catalog entries",
                source,
            })?;
        info!("services for node: {}", stale.len());
        let removed = self
            .shared
            .catalog
            .deregister_all(stale.into_iter().map(|e| e.service.id))
            .await;
        log_outcomes(&removed);

        let containers = self
            .shared
            .metadata
            .running_containers(&host)
            .await
            .map_err(|source| Error::Sync {
                stage: "listing running containers",
                source,
            })?;
        info!("running containers on node: {}", containers.len());

        let mut outcomes = Vec::new();
        for container in &containers {
            outcomes.extend(register_container(&self.shared, &host, container).await);
        }

        let failed = outcomes.iter().filter(|o| !o.ok).count();
        if failed > 0 {
            warn!("{} of {} registrations failed during sync", failed, outcomes.len());
        }

        self.host = Some(host);
        self.state = State::Steady;
        Ok(outcomes)
    }

    pub fn on_disconnect(&mut self) {
        warn!("lost connection to docker api");
        self.state = State::Disconnected;
    }

    fn reap(&mut self) {
        while let Some(res) = self.tasks.try_join_next() {
            if let Err(e) = res {
                if !e.is_cancelled() {
                    error!("start handler panicked: {}", e);
                }
            }
        }
        self.pending_starts.retain(|_, handle| !handle.is_finished());
    }

    pub async fn on_event(&mut self, event: LifecycleEvent) {
        self.reap();

        if self.state != State::Steady {
            debug!("ignoring {} event while {:?}", event.action, self.state);
            return;
        }
        let Some(host) = self.host.clone() else {
            return;
        };

        match event.kind {
            EventKind::Start => {
                info!(
                    "{} - container start {} (image : {})",
                    event.time, event.name, event.image
                );
                let Some(container_id) = event.container_id else {
                    warn!("start event for {} has no container uuid", event.name);
                    return;
                };
                if let Some(previous) = self.pending_starts.remove(&container_id) {
                    previous.abort();
                }
                let handle = self.tasks.spawn(handle_start(
                    self.shared.clone(),
                    host,
                    container_id.clone(),
                    event.name,
                ));
                self.pending_starts.insert(container_id, handle);
            }
            EventKind::Stop => {
                info!(
                    "{} - container stop {} (image : {})",
                    event.time, event.name, event.image
                );
                let Some(container_id) = event.container_id else {
                    warn!("stop event for {} has no container uuid", event.name);
                    return;
                };
                if let Some(pending) = self.pending_starts.remove(&container_id) {
                    debug!("cancelling pending registration of {}", container_id);
                    pending.abort();
                }
                self.deregister_container(&host, &container_id).await;
            }
            EventKind::Destroy
            | EventKind::Restart
            | EventKind::Pause
            | EventKind::Unpause
            | EventKind::HealthStatus => {
                info!("{}: {} ({})", event.action, event.name, event.image);
            }
        }
    }

    async fn deregister_container(&self, host: &HostIdentity, container_id: &str) -> Vec<Outcome> {
        let entries = match self.shared.catalog.list_container(&host.uuid, container_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("deregistration lookup failed: {}", e);
                return Vec::new();
            }
        };
        if entries.is_empty() {
            info!("no catalog entries for container {}, nothing to deregister", container_id);
            return Vec::new();
        }
        let outcomes = self
            .shared
            .catalog
            .deregister_all(entries.into_iter().map(|e| e.service.id))
            .await;
        log_outcomes(&outcomes);
        outcomes
    }

    /// Wait for every in-flight start handler.
    pub async fn drain(&mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                if !e.is_cancelled() {
                    error!("start handler panicked: {}", e);
                }
            }
        }
        self.pending_starts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use httpmock::prelude::*;
    use serde_json::json;

    fn controller(metadata: &MockServer, catalog: &MockServer) -> Controller {
        Controller::new(
            MetadataClient::new(metadata.base_url(), Duration::from_secs(2)).unwrap(),
            CatalogClient::new(catalog.base_url(), None, Duration::from_secs(2)).unwrap(),
            DerivationSettings {
                prefix: String::new(),
                base_tags: vec!["prod".into()],
                ignore_unnamed: false,
            },
            Duration::ZERO,
        )
    }

    fn mock_host(server: &MockServer) {
        server.mock(|when, then| {
            when.method(GET).path("/latest/self/host");
            then.status(200)
                .json_body(json!({"uuid": "host-a", "agent_ip": "10.0.0.5"}));
        });
    }

    fn container(uuid: &str, ports: serde_json::Value, labels: serde_json::Value) -> serde_json::Value {
        json!({
            "uuid": uuid,
            "name": format!("{uuid}_1"),
            "host_uuid": "host-a",
            "state": "running",
            "ports": ports,
            "labels": labels
        })
    }

    fn event(kind: EventKind, uuid: &str) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            container_id: Some(uuid.to_string()),
            name: format!("stack/{uuid}"),
            image: "acme/app:1".into(),
            time: Utc::now(),
            action: format!("{kind:?}").to_lowercase(),
        }
    }

    #[tokio::test]
    async fn sync_replaces_stale_entries_with_running_containers() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        metadata.mock(|when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(json!([
                container("c1", json!(["0.0.0.0:33001:8080/tcp"]), json!({"SERVICE_NAME": "api"})),
                container("c2", json!(["0.0.0.0:33002:53/udp"]), json!({"SERVICE_NAME": "dns"})),
            ]));
        });
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({
                "host-a:old1:30000": {"ID": "host-a:old1:30000", "Service": "gone"},
                "host-a:c1:33001": {"ID": "host-a:c1:33001", "Service": "api"},
                "host-b:c7:30000": {"ID": "host-b:c7:30000", "Service": "elsewhere"},
                "consul": {"ID": "consul", "Service": "consul"}
            }));
        });
        let stale_old = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:old1:30000");
            then.status(200);
        });
        let stale_c1 = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:c1:33001");
            then.status(200);
        });
        let foreign = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-b:c7:30000");
            then.status(200);
        });
        let other = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/consul");
            then.status(200);
        });
        let register_c1 = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register").json_body(json!({
                "ID": "host-a:c1:33001", "Name": "api", "Address": "10.0.0.5",
                "Port": 33001, "Tags": ["prod"]
            }));
            then.status(200);
        });
        let register_c2 = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register").json_body(json!({
                "ID": "host-a:c2:33002:udp", "Name": "dns", "Address": "10.0.0.5",
                "Port": 33002, "Tags": ["prod"]
            }));
            then.status(200);
        });

        let mut ctl = controller(&metadata, &catalog);
        assert_eq!(ctl.state(), State::Disconnected);
        let outcomes = ctl.on_connect().await.unwrap();

        assert_eq!(ctl.state(), State::Steady);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.ok));
        stale_old.assert_hits(1);
        stale_c1.assert_hits(1);
        foreign.assert_hits(0);
        other.assert_hits(0);
        register_c1.assert_hits(1);
        register_c2.assert_hits(1);
    }

    #[tokio::test]
    async fn one_bad_container_does_not_block_the_batch() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        metadata.mock(|when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(json!([
                container("c1", json!(["0.0.0.0:31001:80/tcp"]), json!({})),
                container("c2", json!(["0.0.0.0:31002:80/tcp"]), json!({})),
                {"uuid": "c3", "name": "c3_1", "host_uuid": "host-a", "state": "running", "labels": {}},
                container("c4", json!(["0.0.0.0:31004:80/tcp"]), json!({})),
                container("c5", json!(["0.0.0.0:31005:80/tcp"]), json!({})),
            ]));
        });
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({}));
        });
        let register = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });

        let mut ctl = controller(&metadata, &catalog);
        let outcomes = ctl.on_connect().await.unwrap();
        let ids: Vec<_> = outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["host-a:c1:31001", "host-a:c2:31002", "host-a:c4:31004", "host-a:c5:31005"]
        );
        register.assert_hits(4);
    }

    #[tokio::test]
    async fn sync_fails_when_catalog_is_unreachable() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(500);
        });

        let mut ctl = controller(&metadata, &catalog);
        let err = ctl.on_connect().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Sync {
                stage: "listing catalog entries",
                ..
            }
        ));
        assert_ne!(ctl.state(), State::Steady);
    }

    #[tokio::test]
    async fn ignored_container_is_never_registered() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        metadata.mock(|when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(json!([container(
                "c1",
                json!(["0.0.0.0:33001:8080/tcp"]),
                json!({"SERVICE_IGNORE": "1", "SERVICE_NAME": "api", "SERVICE_8080_NAME": "web"})
            )]));
        });
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({}));
        });
        let register = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });

        let mut ctl = controller(&metadata, &catalog);
        assert!(ctl.on_connect().await.unwrap().is_empty());
        register.assert_hits(0);
    }

    #[tokio::test]
    async fn start_registers_and_stop_deregisters_every_port() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        metadata.mock(|when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(json!([container(
                "c1",
                json!(["0.0.0.0:33001:8080/tcp", "0.0.0.0:33002:9090/tcp"]),
                json!({"SERVICE_NAME": "api"})
            )]));
        });
        let mut services = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({}));
        });
        let register = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });

        let mut ctl = controller(&metadata, &catalog);
        ctl.on_connect().await.unwrap();
        register.assert_hits(2);

        ctl.on_event(event(EventKind::Start, "c1")).await;
        ctl.drain().await;
        register.assert_hits(4);

        services.delete();
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({
                "host-a:c1:33001": {"ID": "host-a:c1:33001", "Service": "api-8080"},
                "host-a:c1:33002": {"ID": "host-a:c1:33002", "Service": "api-9090"},
                "host-a:c2:33003": {"ID": "host-a:c2:33003", "Service": "other"}
            }));
        });
        let dereg_8080 = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:c1:33001");
            then.status(200);
        });
        let dereg_9090 = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:c1:33002");
            then.status(200);
        });
        let dereg_other = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:c2:33003");
            then.status(200);
        });

        ctl.on_event(event(EventKind::Stop, "c1")).await;
        dereg_8080.assert_hits(1);
        dereg_9090.assert_hits(1);
        dereg_other.assert_hits(0);
    }

    #[tokio::test]
    async fn stop_for_unknown_container_is_a_no_op() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        metadata.mock(|when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(json!([]));
        });
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({
                "host-a:c1:33001": {"ID": "host-a:c1:33001", "Service": "api"}
            }));
        });
        let dereg = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:c1:33001");
            then.status(200);
        });

        let mut ctl = controller(&metadata, &catalog);
        ctl.on_connect().await.unwrap();
        dereg.assert_hits(1);

        ctl.on_event(event(EventKind::Stop, "c9")).await;
        ctl.on_event(event(EventKind::Pause, "c1")).await;
        ctl.on_event(event(EventKind::HealthStatus, "c1")).await;
        dereg.assert_hits(1);
        assert_eq!(ctl.state(), State::Steady);
    }

    #[tokio::test]
    async fn stop_cancels_pending_start() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        mock_host(&metadata);
        let mut stopped = container("c1", json!(["0.0.0.0:33001:8080/tcp"]), json!({"SERVICE_NAME": "api"}));
        stopped["state"] = json!("stopped");
        let body = json!([stopped]);
        metadata.mock(move |when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(body);
        });
        catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({}));
        });
        let register = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });

        let mut ctl = Controller::new(
            MetadataClient::new(metadata.base_url(), Duration::from_secs(2)).unwrap(),
            CatalogClient::new(catalog.base_url(), None, Duration::from_secs(2)).unwrap(),
            DerivationSettings::default(),
            Duration::from_millis(200),
        );
        ctl.on_connect().await.unwrap();
        register.assert_hits(0);

        ctl.on_event(event(EventKind::Start, "c1")).await;
        assert_eq!(ctl.pending_starts.len(), 1);
        ctl.on_event(event(EventKind::Stop, "c1")).await;
        assert!(ctl.pending_starts.is_empty());
        ctl.drain().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        register.assert_hits(0);

        // Without the stop, the same start does register.
        ctl.on_event(event(EventKind::Start, "c1")).await;
        ctl.drain().await;
        register.assert_hits(1);
    }

    #[tokio::test]
    async fn reconnect_runs_a_full_resync() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        let host = metadata.mock(|when, then| {
            when.method(GET).path("/latest/self/host");
            then.status(200)
                .json_body(json!({"uuid": "host-a", "agent_ip": "10.0.0.5"}));
        });
        metadata.mock(|when, then| {
            when.method(GET).path("/latest/containers/");
            then.status(200).json_body(json!([container(
                "c1",
                json!(["0.0.0.0:33001:8080/tcp"]),
                json!({"SERVICE_NAME": "api"})
            )]));
        });
        let services = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({
                "host-a:c1:33001": {"ID": "host-a:c1:33001", "Service": "api"}
            }));
        });
        let dereg = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/service/deregister/host-a:c1:33001");
            then.status(200);
        });
        let register = catalog.mock(|when, then| {
            when.method(PUT).path("/v1/agent/service/register");
            then.status(200);
        });

        let mut ctl = controller(&metadata, &catalog);
        ctl.on_connect().await.unwrap();
        ctl.on_disconnect();
        assert_eq!(ctl.state(), State::Disconnected);

        ctl.on_event(event(EventKind::Stop, "c1")).await;
        dereg.assert_hits(1);

        let outcomes = ctl.on_connect().await.unwrap();
        assert_eq!(ctl.state(), State::Steady);
        assert_eq!(outcomes.len(), 1);
        services.assert_hits(2);
        dereg.assert_hits(2);
        register.assert_hits(2);
        host.assert_hits(1);
    }

    #[tokio::test]
    async fn events_before_sync_are_ignored() {
        let metadata = MockServer::start();
        let catalog = MockServer::start();
        let services = catalog.mock(|when, then| {
            when.method(GET).path("/v1/agent/services");
            then.status(200).json_body(json!({}));
        });

        let mut ctl = controller(&metadata, &catalog);
        ctl.on_event(event(EventKind::Stop, "c1")).await;
        services.assert_hits(0);

        ctl.on_disconnect();
        assert_eq!(ctl.state(), State::Disconnected);
    }
}
