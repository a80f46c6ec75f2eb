//! [`ClusterBackend`] backed by the Kubernetes API.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use kube::runtime::events::EventType;
use serde_json::json;
use tracing::debug;

use crate::controller::backend::{ClusterBackend, SyncEvent};
use crate::controller::context::{Context, FIELD_MANAGER};
use crate::controller::error::{Error, Result};
use crate::crd::{Cluster, ClusterStatus};
use crate::resources::common::selector_string;

/// Talks to the API server through the controller context's client.
pub struct KubeBackend {
    ctx: Arc<Context>,
}

impl KubeBackend {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.ctx.client.clone(), namespace)
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Treat a 404 on delete as success.
fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl ClusterBackend for KubeBackend {
    async fn get_stateful_set(&self, namespace: &str, name: &str) -> Result<Option<StatefulSet>> {
        Ok(self.api::<StatefulSet>(namespace).get_opt(name).await?)
    }

    async fn create_stateful_set(&self, namespace: &str, stateful_set: &StatefulSet) -> Result<()> {
        self.api::<StatefulSet>(namespace)
            .create(&Self::post_params(), stateful_set)
            .await?;
        Ok(())
    }

    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.api::<StatefulSet>(namespace)
            .patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api::<Service>(namespace).get_opt(name).await?)
    }

    async fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Service>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<Service>(namespace).list(&params).await?.items)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<()> {
        self.api::<Service>(namespace)
            .create(&Self::post_params(), service)
            .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.api::<Service>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn patch_service_labels(
        &self,
        namespace: &str,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "labels": labels } });
        self.api::<Service>(namespace)
            .patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(self.api::<Pod>(namespace).list(&params).await?.items)
    }

    async fn delete_persistent_volume_claim(&self, namespace: &str, name: &str) -> Result<()> {
        ignore_not_found(
            self.api::<PersistentVolumeClaim>(namespace)
                .delete(name, &DeleteParams::default())
                .await,
        )
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        Ok(self.api::<ConfigMap>(namespace).get_opt(name).await?)
    }

    async fn set_config_map_owners(
        &self,
        namespace: &str,
        name: &str,
        owners: &[OwnerReference],
    ) -> Result<()> {
        let patch = json!({ "metadata": { "ownerReferences": owners } });
        self.api::<ConfigMap>(namespace)
            .patch(name, &Self::patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_cluster_status(&self, cluster: &Cluster, status: &ClusterStatus) -> Result<()> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        let name = cluster.name_any();

        let operations = json!([{ "op": "add", "path": "/status", "value": status }]);
        let patch: json_patch::Patch = serde_json::from_value(operations)?;

        debug!(cluster = %name, "Patching cluster status");
        self.api::<Cluster>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        Ok(())
    }

    async fn record_event(&self, cluster: &Cluster, event: &SyncEvent) {
        if let Some(ref health_state) = self.ctx.health_state {
            health_state.metrics.record_event(event.reason());
        }
        let type_ = if event.is_warning() {
            EventType::Warning
        } else {
            EventType::Normal
        };
        self.ctx
            .publish_event(cluster, type_, event.reason(), event.action(), Some(event.note()))
            .await;
    }
}
