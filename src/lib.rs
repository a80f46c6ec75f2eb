//! cassandra-operator library crate
//!
//! Exports the Cluster controller, the CRD, resource builders, the admission
//! webhook and the member sidecar.

pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;
pub mod sidecar;
pub mod webhooks;

pub use config::OperatorConfig;
pub use health::HealthState;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use futures::{Stream, StreamExt, TryStreamExt, future};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::cluster_reconciler::{error_policy, reconcile};
use controller::context::Context;
use controller::status::is_observed;
use crd::Cluster;
use resources::common::{CLUSTER_NAME_LABEL, common_labels, selector_string};
use resources::services::is_headless;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watcher configuration for objects the operator creates.
fn managed_watcher_config() -> WatcherConfig {
    WatcherConfig::default()
        .any_semantic()
        .labels(&selector_string(&common_labels()))
}

/// Create a reflector-backed Cluster stream that skips status-only updates.
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Map a member pod to the Cluster named by its labels.
fn cluster_for_pod<K: Resource>(pod: &K) -> Option<ObjectRef<Cluster>> {
    let name = pod.labels().get(CLUSTER_NAME_LABEL)?;
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Run the Cluster controller until its stream ends.
///
/// Watches Clusters and triggers on:
/// - owned StatefulSets, once their controller has observed the latest spec
/// - owned member services (the headless service never changes)
/// - member pods, mapped to their Cluster by label
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    info!(
        scope = namespace.unwrap_or("cluster-wide"),
        workers = config.workers,
        "Starting controller for Cluster resources"
    );

    if let Some(ref state) = health_state {
        state.set_ready(true);
    }

    let workers = config.workers;
    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let clusters: Api<Cluster> = scoped_api(client.clone(), namespace);
    let stateful_sets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);

    let (reader, cluster_stream) =
        create_filtered_stream(clusters, WatcherConfig::default().any_semantic());

    let stateful_set_stream = watcher(stateful_sets, managed_watcher_config())
        .default_backoff()
        .touched_objects()
        .try_filter(|sts| future::ready(is_observed(sts)));
    let service_stream = watcher(services, managed_watcher_config())
        .default_backoff()
        .touched_objects()
        .try_filter(|svc| future::ready(!is_headless(svc)));
    // Only pod metadata is needed to find the owning Cluster.
    let pod_stream = metadata_watcher(pods, managed_watcher_config())
        .default_backoff()
        .touched_objects();

    Controller::for_stream(cluster_stream, reader)
        .with_config(ControllerConfig::default().concurrency(u16::max(workers, 1)))
        .owns_stream(stateful_set_stream)
        .owns_stream(service_stream)
        .watches_stream(pod_stream, |pod| cluster_for_pod(&pod))
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // Watch events for a deleted Cluster still trigger a
                    // reconcile; those are expected.
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    error!("Controller stream ended unexpectedly");
}
