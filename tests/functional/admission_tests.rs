//! AdmissionReview handling of Cluster updates.

use kube::core::DynamicObject;
use serde_json::{Value, json};

use cassandra_operator::webhooks::{AdmissionRequest, AdmissionReview, review_request};

fn cluster_object(version: &str, racks: Value) -> Value {
    json!({
        "apiVersion": "cassandra.rook.io/v1alpha1",
        "kind": "Cluster",
        "metadata": { "name": "c1", "namespace": "t", "uid": "uid-c1" },
        "spec": {
            "version": version,
            "mode": "cassandra",
            "datacenter": { "name": "dc1", "racks": racks }
        }
    })
}

fn rack(name: &str, members: i32) -> Value {
    json!({
        "name": name,
        "members": members,
        "storage": { "volumeClaimTemplates": [ { "metadata": { "name": "data" } } ] }
    })
}

fn review(operation: &str, object: Value, old_object: Option<Value>) -> (bool, String) {
    let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "req-1",
            "kind": { "group": "cassandra.rook.io", "version": "v1alpha1", "kind": "Cluster" },
            "resource": { "group": "cassandra.rook.io", "version": "v1alpha1", "resource": "clusters" },
            "name": "c1",
            "namespace": "t",
            "operation": operation,
            "userInfo": {},
            "object": object,
            "oldObject": old_object,
            "dryRun": false
        }
    }))
    .unwrap();
    let request: AdmissionRequest<DynamicObject> = review.try_into().unwrap();
    let response = review_request(&request).response.unwrap();
    (response.allowed, response.result.message)
}

#[test]
fn test_reject_version_change() {
    let (allowed, message) = review(
        "UPDATE",
        cluster_object("3.2.0", json!([rack("r1", 3)])),
        Some(cluster_object("3.1.11", json!([rack("r1", 3)]))),
    );
    assert!(!allowed);
    assert_eq!(message, "change of version is currently not supported");
}

#[test]
fn test_reject_rack_removal() {
    let (allowed, message) = review(
        "UPDATE",
        cluster_object("3.1.11", json!([rack("r2", 3)])),
        Some(cluster_object("3.1.11", json!([rack("r1", 3), rack("r2", 3)]))),
    );
    assert!(!allowed);
    assert!(message.contains("r1"), "message: {}", message);
}

#[test]
fn test_allow_member_count_change_and_new_rack() {
    let (allowed, _) = review(
        "UPDATE",
        cluster_object("3.1.11", json!([rack("r1", 5), rack("r2", 2)])),
        Some(cluster_object("3.1.11", json!([rack("r1", 3)]))),
    );
    assert!(allowed);
}

#[test]
fn test_reject_rack_without_storage() {
    let (allowed, message) = review(
        "CREATE",
        cluster_object("3.1.11", json!([{ "name": "r1", "members": 3 }])),
        None,
    );
    assert!(!allowed);
    assert!(message.contains("r1"), "message: {}", message);
}
