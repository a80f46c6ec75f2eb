//! State shared by every reconcile of the Cluster controller.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::config::OperatorConfig;
use crate::controller::backoff::RequeueSchedule;
use crate::crd::Cluster;
use crate::health::HealthState;

/// Field manager and event reporter name.
pub const FIELD_MANAGER: &str = "cassandra-operator";

pub struct Context {
    pub client: Client,
    reporter: Reporter,
    pub config: OperatorConfig,
    /// Failure counts keyed by `namespace/name`.
    pub requeue: RequeueSchedule,
    /// Absent when running without the health server.
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            config,
            requeue: RequeueSchedule::new(),
            health_state,
        }
    }

    /// Publish an event on a Cluster. Failures are logged and never
    /// propagated.
    pub async fn publish_event(
        &self,
        cluster: &Cluster,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone());
        let event = Event {
            type_,
            reason: reason.into(),
            note,
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(&event, &cluster.object_ref(&())).await {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }
}
