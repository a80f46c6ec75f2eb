//! Member controller.
//!
//! Runs next to the database in every member pod: resolves the member's
//! identity, writes its configuration, starts the database and answers the
//! operator's decommission requests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::Cluster;
use crate::resources::common::{
    CLUSTER_NAME_LABEL, DATACENTER_NAME_LABEL, DECOMMISSIONED_LABEL, DEVELOPER_MODE_ANNOTATION,
    LABEL_VALUE_FALSE, LABEL_VALUE_TRUE, RACK_NAME_LABEL, seed_selector,
};
use crate::sidecar::config::{
    ConfigContext, ENTRYPOINT_PATH, database_for, read_inputs, write_config,
};
use crate::sidecar::env::SidecarEnv;
use crate::sidecar::jolokia::{JolokiaClient, JolokiaError, OperationMode};
use crate::sidecar::probes::{DecommissionStatus, ProbeState, run_probe_server};
use crate::sidecar::{Result, SidecarError};

const SERVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const SEED_POLL_INTERVAL: Duration = Duration::from_secs(1);
const OPERATION_MODE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Where a member sits in the cluster, read from its pod labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberIdentity {
    pub cluster: String,
    pub datacenter: String,
    pub rack: String,
}

impl MemberIdentity {
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let labels = pod.labels();
        let label = |key: &'static str| {
            labels
                .get(key)
                .cloned()
                .ok_or(SidecarError::MissingLabel(key))
        };
        Ok(Self {
            cluster: label(CLUSTER_NAME_LABEL)?,
            datacenter: label(DATACENTER_NAME_LABEL)?,
            rack: label(RACK_NAME_LABEL)?,
        })
    }
}

/// Whether the Cluster asks Scylla to run in developer mode.
pub fn developer_mode(cluster: &Cluster) -> bool {
    cluster
        .annotations()
        .get(DEVELOPER_MODE_ANNOTATION)
        .is_some_and(|v| v == LABEL_VALUE_TRUE)
}

/// Whether the operator has asked this member to decommission.
pub fn decommission_requested(service: &Service) -> bool {
    service
        .labels()
        .get(DECOMMISSIONED_LABEL)
        .is_some_and(|v| v == LABEL_VALUE_FALSE)
}

/// Comma-joined ClusterIPs of seed services.
pub fn seed_addresses(services: &[Service]) -> String {
    services
        .iter()
        .filter_map(|svc| svc.spec.as_ref()?.cluster_ip.clone())
        .filter(|ip| !ip.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Poll the operation mode until the member reports `DECOMMISSIONED`.
///
/// `LEAVING` keeps the poll going for as long as streaming takes, and so do
/// failed HTTP requests. Any other mode, or an error reported by Jolokia
/// itself, ends the decommission.
pub async fn wait_until_decommissioned<F, Fut>(mut operation_mode: F, interval: Duration) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<OperationMode, JolokiaError>>,
{
    loop {
        match operation_mode().await {
            Ok(OperationMode::Decommissioned) => return Ok(()),
            Ok(OperationMode::Leaving) => debug!("Member is still leaving the ring"),
            Ok(mode) => return Err(SidecarError::DecommissionFailed(mode.to_string())),
            Err(JolokiaError::Http(e)) => warn!(error = %e, "Reading operation mode failed"),
            Err(e) => return Err(e.into()),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Key of the rack ConfigMap holding the YAML template for a database.
pub fn user_config_key(mode: crate::crd::ClusterMode) -> &'static str {
    match mode {
        crate::crd::ClusterMode::Cassandra => "cassandra.yaml",
        crate::crd::ClusterMode::Scylla => "scylla.yaml",
    }
}

pub struct MemberController {
    client: Client,
    env: SidecarEnv,
    name: String,
    namespace: String,
    jolokia: JolokiaClient,
    decommission: Arc<DecommissionStatus>,
    mode_poll_interval: Duration,
}

impl MemberController {
    pub fn new(client: Client, env: SidecarEnv) -> Result<Self> {
        let name = env.pod_name()?.to_string();
        let namespace = env.pod_namespace()?.to_string();
        Ok(Self {
            client,
            env,
            name,
            namespace,
            jolokia: JolokiaClient::default(),
            decommission: Arc::default(),
            mode_poll_interval: OPERATION_MODE_POLL_INTERVAL,
        })
    }

    pub fn with_jolokia(mut self, jolokia: JolokiaClient) -> Self {
        self.jolokia = jolokia;
        self
    }

    pub fn with_mode_poll_interval(mut self, interval: Duration) -> Self {
        self.mode_poll_interval = interval;
        self
    }

    /// Probe state for a member known in the ring as `broadcast_ip`.
    pub fn probe_state(&self, broadcast_ip: impl Into<String>) -> Arc<ProbeState> {
        Arc::new(ProbeState {
            jolokia: self.jolokia.clone(),
            broadcast_ip: broadcast_ip.into(),
            decommission: self.decommission.clone(),
        })
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Start the member and serve until the database exits.
    pub async fn run(self) -> Result<()> {
        let local_ip = self.env.pod_ip()?.to_string();
        let limits = self.env.limits()?;

        let member_ip = self.wait_for_service_ip().await?;
        info!(member = %self.name, ip = %member_ip, "Member service is ready");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let identity = MemberIdentity::from_pod(&pods.get(&self.name).await?)?;

        let clusters: Api<Cluster> = Api::namespaced(self.client.clone(), &self.namespace);
        let cluster = clusters.get(&identity.cluster).await?;
        let database = database_for(cluster.spec.mode);

        let probes = tokio::spawn(run_probe_server(self.probe_state(member_ip.clone())));

        let seeds = self.discover_seeds(&identity.cluster).await?;
        let user_config = self.user_config(&cluster, &identity).await?;

        let ctx = ConfigContext {
            cluster_name: identity.cluster.clone(),
            datacenter: identity.datacenter.clone(),
            rack: identity.rack.clone(),
            member_name: self.name.clone(),
            namespace: self.namespace.clone(),
            member_service_ip: member_ip,
            local_ip,
            seeds,
            limits,
            developer_mode: developer_mode(&cluster),
            user_config,
        };

        info!(mode = %database.mode(), "Generating config files");
        let existing = read_inputs(database.as_ref()).await?;
        let files = database.generate_config(&ctx, &existing)?;
        write_config(&files).await?;

        info!(entrypoint = ENTRYPOINT_PATH, "Starting database");
        let mut child = Command::new(ENTRYPOINT_PATH)
            .envs(database.child_env(&ctx))
            .spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                error!(status = %status, "Database process exited");
                Err(SidecarError::DatabaseExited(status.to_string()))
            }
            result = probes => {
                match result {
                    Ok(Ok(())) => Err(SidecarError::ProbeServer("probe server stopped".to_string())),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(SidecarError::ProbeServer(e.to_string())),
                }
            }
            result = self.watch_service() => result,
        }
    }

    /// Poll the member service until it has a ClusterIP.
    #[instrument(skip(self), fields(member = %self.name))]
    async fn wait_for_service_ip(&self) -> Result<String> {
        let services = self.services();
        loop {
            match services.get_opt(&self.name).await? {
                Some(svc) => {
                    let ip = svc.spec.and_then(|spec| spec.cluster_ip).unwrap_or_default();
                    if !ip.is_empty() {
                        return Ok(ip);
                    }
                    info!("Member service has no ClusterIP yet");
                }
                None => info!("Member service does not exist yet"),
            }
            tokio::time::sleep(SERVICE_POLL_INTERVAL).await;
        }
    }

    /// Poll for seed services until at least one exists.
    #[instrument(skip(self))]
    async fn discover_seeds(&self, cluster: &str) -> Result<String> {
        let params = ListParams::default().labels(&seed_selector(cluster));
        let services = self.services();
        loop {
            let seeds = seed_addresses(&services.list(&params).await?.items);
            if !seeds.is_empty() {
                info!(seeds = %seeds, "Found seeds");
                return Ok(seeds);
            }
            info!("No seeds yet, retrying");
            tokio::time::sleep(SEED_POLL_INTERVAL).await;
        }
    }

    async fn user_config(
        &self,
        cluster: &Cluster,
        identity: &MemberIdentity,
    ) -> Result<Option<String>> {
        let Some(name) = cluster
            .rack(&identity.rack)
            .and_then(|rack| rack.config_map_name.as_deref())
        else {
            return Ok(None);
        };

        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let Some(config_map) = config_maps.get_opt(name).await? else {
            warn!(config_map = %name, "Rack ConfigMap does not exist");
            return Ok(None);
        };
        let key = user_config_key(cluster.spec.mode);
        Ok(config_map.data.and_then(|mut data| data.remove(key)))
    }

    /// Follow the member service and decommission when the operator asks.
    async fn watch_service(&self) -> Result<()> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.name));
        let mut events = watcher(self.services(), config).default_backoff().boxed();

        while let Some(event) = events.try_next().await? {
            match event {
                watcher::Event::Apply(svc) | watcher::Event::InitApply(svc) => {
                    self.handle_service(&svc).await;
                }
                watcher::Event::Delete(svc) => {
                    warn!(service = %svc.name_any(), "Member service was deleted");
                }
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        }
        Ok(())
    }

    /// React to one observed state of the member service. The first
    /// decommission request is carried out; a failure flips liveness.
    pub async fn handle_service(&self, svc: &Service) {
        if !decommission_requested(svc) || !self.decommission.start() {
            return;
        }
        if let Err(e) = self.decommission().await {
            error!(error = %e, "Decommission failed, liveness now fails");
            self.decommission.mark_failed();
        }
    }

    #[instrument(skip(self), fields(member = %self.name))]
    async fn decommission(&self) -> Result<()> {
        info!("Decommissioning member");
        self.jolokia.decommission().await?;

        let jolokia = &self.jolokia;
        wait_until_decommissioned(|| jolokia.operation_mode(), self.mode_poll_interval).await?;

        let patch = json!({ "metadata": { "labels": { DECOMMISSIONED_LABEL: LABEL_VALUE_TRUE } } });
        self.services()
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!("Member decommissioned");
        Ok(())
    }
}
