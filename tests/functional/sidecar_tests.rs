//! Decommission handshake of the member sidecar against local HTTP stubs
//! for Jolokia and the Kubernetes API.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::{patch, post};
use axum::{Json, Router};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use reqwest::StatusCode;
use serde_json::{Value, json};

use cassandra_operator::resources::common::DECOMMISSIONED_LABEL;
use cassandra_operator::sidecar::probes::create_router;
use cassandra_operator::sidecar::{JolokiaClient, MemberController, SidecarEnv};

use crate::mock_state::NAMESPACE;

const MEMBER: &str = "c1-dc1-r1-2";
const MEMBER_IP: &str = "10.96.0.12";

/// Jolokia agent of a member: answers status reads, decommission and
/// operation mode reads from a script.
#[derive(Default)]
struct JolokiaStub {
    fail_decommission: bool,
    modes: Mutex<VecDeque<&'static str>>,
    decommissions: Mutex<usize>,
    mode_reads: Mutex<usize>,
}

impl JolokiaStub {
    fn new(fail_decommission: bool, modes: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            fail_decommission,
            modes: Mutex::new(modes.into()),
            ..Default::default()
        })
    }

    fn decommissions(&self) -> usize {
        *self.decommissions.lock().unwrap()
    }

    fn mode_reads(&self) -> usize {
        *self.mode_reads.lock().unwrap()
    }
}

async fn jolokia(State(stub): State<Arc<JolokiaStub>>, body: Bytes) -> Json<Value> {
    let request: Value = serde_json::from_slice(&body).unwrap();
    if request["type"] == "exec" {
        *stub.decommissions.lock().unwrap() += 1;
        if stub.fail_decommission {
            return Json(json!({"status": 500, "error": "java.lang.IllegalStateException"}));
        }
        return Json(json!({"status": 200, "value": null}));
    }
    if request["attribute"] == "OperationMode" {
        *stub.mode_reads.lock().unwrap() += 1;
        let mode = stub.modes.lock().unwrap().pop_front().unwrap_or("DECOMMISSIONED");
        return Json(json!({"status": 200, "value": mode}));
    }
    Json(json!({
        "status": 200,
        "value": {
            "LiveNodes": [MEMBER_IP],
            "UnreachableNodes": [],
            "LeavingNodes": [],
            "JoiningNodes": [],
            "MovingNodes": []
        }
    }))
}

/// Kubernetes API serving merge patches of services.
#[derive(Default)]
struct ApiStub {
    patches: Mutex<Vec<(String, Value)>>,
}

impl ApiStub {
    fn patches(&self) -> Vec<(String, Value)> {
        self.patches.lock().unwrap().clone()
    }
}

async fn patch_service(
    State(stub): State<Arc<ApiStub>>,
    Path((namespace, name)): Path<(String, String)>,
    body: Bytes,
) -> Json<Value> {
    let patch: Value = serde_json::from_slice(&body).unwrap();
    stub.patches.lock().unwrap().push((name.clone(), patch.clone()));
    Json(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": patch["metadata"]["labels"]
        }
    }))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    format!("http://{}", addr)
}

struct Harness {
    controller: MemberController,
    jolokia: Arc<JolokiaStub>,
    api: Arc<ApiStub>,
    probes_url: String,
}

async fn harness(jolokia_stub: Arc<JolokiaStub>) -> Harness {
    let jolokia_url = serve(
        Router::new()
            .route("/jolokia/", post(jolokia))
            .with_state(jolokia_stub.clone()),
    )
    .await;

    let api = Arc::new(ApiStub::default());
    let api_url = serve(
        Router::new()
            .route(
                "/api/v1/namespaces/{namespace}/services/{name}",
                patch(patch_service),
            )
            .with_state(api.clone()),
    )
    .await;
    let client = kube::Client::try_from(kube::Config::new(api_url.parse().unwrap())).unwrap();

    let env = SidecarEnv {
        pod_ip: Some("10.0.0.7".to_string()),
        pod_name: Some(MEMBER.to_string()),
        pod_namespace: Some(NAMESPACE.to_string()),
        ..Default::default()
    };
    let controller = MemberController::new(client, env)
        .unwrap()
        .with_jolokia(JolokiaClient::new(format!("{}/jolokia/", jolokia_url)))
        .with_mode_poll_interval(Duration::from_millis(1));
    let probes_url = serve(create_router(controller.probe_state(MEMBER_IP))).await;

    Harness {
        controller,
        jolokia: jolokia_stub,
        api,
        probes_url,
    }
}

fn member_service(decommissioned: Option<&str>) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(MEMBER.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: decommissioned
                .map(|v| BTreeMap::from([(DECOMMISSIONED_LABEL.to_string(), v.to_string())])),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn healthz(h: &Harness) -> StatusCode {
    reqwest::get(format!("{}/healthz", h.probes_url))
        .await
        .unwrap()
        .status()
}

#[tokio::test]
async fn test_decommission_marks_service_done() {
    let mut modes = vec!["LEAVING"; 15];
    modes.push("DECOMMISSIONED");
    let h = harness(JolokiaStub::new(false, modes)).await;

    h.controller.handle_service(&member_service(Some("false"))).await;

    assert_eq!(h.jolokia.decommissions(), 1);
    assert_eq!(h.jolokia.mode_reads(), 16);
    assert_eq!(
        h.api.patches(),
        vec![(
            MEMBER.to_string(),
            json!({"metadata": {"labels": {DECOMMISSIONED_LABEL: "true"}}})
        )]
    );
    assert_eq!(healthz(&h).await, StatusCode::OK);

    // Later events for the same request do not start another decommission.
    h.controller.handle_service(&member_service(Some("false"))).await;
    assert_eq!(h.jolokia.decommissions(), 1);
    assert_eq!(h.api.patches().len(), 1);
}

#[tokio::test]
async fn test_service_without_request_is_left_alone() {
    let h = harness(JolokiaStub::new(false, vec![])).await;

    h.controller.handle_service(&member_service(None)).await;
    h.controller.handle_service(&member_service(Some("true"))).await;

    assert_eq!(h.jolokia.decommissions(), 0);
    assert!(h.api.patches().is_empty());
}

#[tokio::test]
async fn test_failed_decommission_fails_liveness() {
    let h = harness(JolokiaStub::new(true, vec![])).await;
    assert_eq!(healthz(&h).await, StatusCode::OK);

    h.controller.handle_service(&member_service(Some("false"))).await;

    assert_eq!(h.jolokia.decommissions(), 1);
    assert!(h.api.patches().is_empty());
    assert_eq!(healthz(&h).await, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_member_left_in_normal_mode_fails_liveness() {
    let h = harness(JolokiaStub::new(false, vec!["LEAVING", "NORMAL"])).await;

    h.controller.handle_service(&member_service(Some("false"))).await;

    assert_eq!(h.jolokia.mode_reads(), 2);
    assert!(h.api.patches().is_empty());
    assert_eq!(healthz(&h).await, StatusCode::SERVICE_UNAVAILABLE);
}
