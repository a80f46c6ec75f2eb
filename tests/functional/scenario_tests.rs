//! End-to-end sync scenarios against the in-memory orchestrator.

use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use cassandra_operator::controller::backend::{SyncEvent, SyncPhase};
use cassandra_operator::controller::cluster_sync::reconcile_cluster;
use cassandra_operator::controller::error::Error;
use cassandra_operator::crd::{Cluster, RackStatus};
use cassandra_operator::resources::common::{DECOMMISSIONED_LABEL, SEED_LABEL, member_index};
use cassandra_operator::resources::services::is_headless;

use crate::mock_state::{
    MockCluster, SIDECAR_IMAGE, Write, cluster, converge, rack, round,
};

async fn steady(members: i32) -> (MockCluster, Cluster) {
    let mock = MockCluster::new();
    let mut c1 = cluster(vec![rack("r1", members)]);
    converge(&mock, &mut c1, 20).await;
    mock.take_events();
    (mock, c1)
}

fn rack_status(mock: &MockCluster, rack: &str) -> RackStatus {
    mock.status().unwrap().racks[rack].clone()
}

fn is_seed(svc: &Service) -> bool {
    svc.metadata
        .labels
        .as_ref()
        .is_some_and(|l| l.contains_key(SEED_LABEL))
}

fn scales(writes: &[Write]) -> Vec<i32> {
    writes
        .iter()
        .filter_map(|w| match w {
            Write::Scale { replicas, .. } => Some(*replicas),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_create_cluster() {
    let mock = MockCluster::new();
    let mut c1 = cluster(vec![rack("r1", 3)]);

    let rounds = converge(&mock, &mut c1, 20).await;
    assert!(rounds >= 3);

    assert_eq!(mock.stateful_set_replicas("c1-dc1-r1"), Some(3));
    for (name, seed) in [("c1-dc1-r1-0", true), ("c1-dc1-r1-1", true), ("c1-dc1-r1-2", false)] {
        let svc = mock.service(name).unwrap();
        assert_eq!(is_seed(&svc), seed, "seed label on {}", name);
    }

    let headless = mock.service("c1-client").unwrap();
    assert!(is_headless(&headless));

    let status = rack_status(&mock, "r1");
    assert_eq!(status.members, 3);
    assert_eq!(status.ready_members, 3);
    assert!(status.conditions.is_empty());

    let events = mock.take_events();
    assert_eq!(events[0].reason(), "RackCreated");
    assert_eq!(
        events.iter().filter(|e| e.reason() == "RackScaledUp").count(),
        3
    );
}

#[tokio::test]
async fn test_scale_up_one_member_per_reconcile() {
    let (mock, mut c1) = steady(2).await;

    c1.spec.datacenter.racks[0].members = 3;
    round(&mock, &mut c1).await.unwrap();
    assert_eq!(scales(&mock.take_writes()), vec![3]);

    converge(&mock, &mut c1, 10).await;
    let svc = mock.service("c1-dc1-r1-2").unwrap();
    assert!(!is_seed(&svc));
    assert_eq!(rack_status(&mock, "r1").members, 3);
}

#[tokio::test]
async fn test_scale_down_decommissions_last_member() {
    let (mock, mut c1) = steady(3).await;
    c1.spec.datacenter.racks[0].members = 2;

    // Ask the last member to leave.
    cluster_reconcile_without_sidecar(&mock, &mut c1).await;
    let svc = mock.service("c1-dc1-r1-2").unwrap();
    assert_eq!(
        svc.metadata.labels.unwrap().get(DECOMMISSIONED_LABEL).map(String::as_str),
        Some("false")
    );
    assert_eq!(mock.stateful_set_replicas("c1-dc1-r1"), Some(3));
    assert_eq!(
        mock.take_events(),
        vec![SyncEvent::RackScaleDownInProgress {
            rack: "r1".to_string(),
            member: "c1-dc1-r1-2".to_string(),
        }]
    );

    // No scale while the member has not confirmed.
    mock.take_writes();
    cluster_reconcile_without_sidecar(&mock, &mut c1).await;
    assert!(scales(&mock.take_writes()).is_empty());
    assert!(rack_status(&mock, "r1").is_member_leaving());

    // Sidecar confirms; the rack shrinks by one.
    mock.complete_decommissions();
    round(&mock, &mut c1).await.unwrap();
    assert_eq!(scales(&mock.take_writes()), vec![2]);
    assert_eq!(mock.stateful_set_replicas("c1-dc1-r1"), Some(2));

    // The removed member's claim and service go away next.
    assert!(mock.has_claim("data-c1-dc1-r1-2"));
    round(&mock, &mut c1).await.unwrap();
    let writes = mock.take_writes();
    assert!(writes.contains(&Write::DeleteClaim("data-c1-dc1-r1-2".to_string())));
    assert!(writes.contains(&Write::DeleteService("c1-dc1-r1-2".to_string())));
    assert!(!mock.has_claim("data-c1-dc1-r1-2"));
    assert!(mock.service("c1-dc1-r1-2").is_none());

    let status = rack_status(&mock, "r1");
    assert_eq!(status.members, 2);
    assert!(!status.is_member_leaving());
}

/// Reconcile and settle without playing the sidecar.
async fn cluster_reconcile_without_sidecar(mock: &MockCluster, c1: &mut Cluster) {
    c1.status = mock.status();
    reconcile_cluster(c1, mock, SIDECAR_IMAGE).await.unwrap();
    mock.settle();
}

#[tokio::test]
async fn test_add_rack() {
    let (mock, mut c1) = steady(2).await;
    c1.spec.datacenter.racks.push(rack("r2", 2));

    round(&mock, &mut c1).await.unwrap();
    assert_eq!(
        mock.take_writes(),
        vec![Write::CreateStatefulSet("c1-dc1-r2".to_string())]
    );
    assert_eq!(mock.stateful_set_replicas("c1-dc1-r2"), Some(0));

    let mut observed = Vec::new();
    for _ in 0..10 {
        round(&mock, &mut c1).await.unwrap();
        observed.extend(scales(&mock.take_writes()));
    }
    assert_eq!(observed, vec![1, 2]);
    assert_eq!(rack_status(&mock, "r2").ready_members, 2);
    assert_eq!(rack_status(&mock, "r1").members, 2);
}

#[tokio::test]
async fn test_decommission_label_on_wrong_member_fails_sync() {
    let (mock, mut c1) = steady(3).await;
    mock.take_writes();
    mock.label_service("c1-dc1-r1-0", DECOMMISSIONED_LABEL, "false");

    c1.status = mock.status();
    let result = reconcile_cluster(&c1, &mock, SIDECAR_IMAGE).await;
    assert!(matches!(result, Err(Error::InvariantViolation(_))));

    let events = mock.take_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_warning());
    assert!(matches!(
        events[0],
        SyncEvent::SyncFailed {
            phase: SyncPhase::Status,
            ..
        }
    ));
    assert!(scales(&mock.take_writes()).is_empty());
    assert_eq!(mock.stateful_set_replicas("c1-dc1-r1"), Some(3));
}

#[tokio::test]
async fn test_steady_state_is_a_no_op() {
    let (mock, mut c1) = steady(3).await;
    mock.take_writes();

    for _ in 0..3 {
        round(&mock, &mut c1).await.unwrap();
        assert!(mock.take_writes().is_empty());
        assert!(mock.take_events().is_empty());
    }
}

#[tokio::test]
async fn test_waits_for_stale_stateful_set() {
    let (mock, mut c1) = steady(1).await;
    c1.spec.datacenter.racks[0].members = 3;
    c1.status = mock.status();

    reconcile_cluster(&c1, &mock, SIDECAR_IMAGE).await.unwrap();
    assert_eq!(scales(&mock.take_writes()), vec![2]);

    // The StatefulSet controller has not caught up yet.
    reconcile_cluster(&c1, &mock, SIDECAR_IMAGE).await.unwrap();
    assert!(mock.take_writes().is_empty());
}

#[tokio::test]
async fn test_waits_for_ready_members_before_scaling() {
    let (mock, mut c1) = steady(1).await;
    mock.hold_readiness(true);
    c1.spec.datacenter.racks[0].members = 3;

    round(&mock, &mut c1).await.unwrap();
    assert_eq!(scales(&mock.take_writes()), vec![2]);

    round(&mock, &mut c1).await.unwrap();
    round(&mock, &mut c1).await.unwrap();
    assert!(scales(&mock.take_writes()).is_empty());
    let status = rack_status(&mock, "r1");
    assert_eq!((status.members, status.ready_members), (2, 1));

    mock.release_readiness();
    round(&mock, &mut c1).await.unwrap();
    assert_eq!(scales(&mock.take_writes()), vec![3]);
}

#[tokio::test]
async fn test_scale_to_zero_takes_two_rounds_per_member() {
    let (mock, mut c1) = steady(3).await;
    mock.take_writes();
    c1.spec.datacenter.racks[0].members = 0;

    let mut observed = Vec::new();
    let mut rounds = 0;
    while rounds < 30 {
        round(&mock, &mut c1).await.unwrap();
        rounds += 1;
        observed.extend(scales(&mock.take_writes()));
        if observed.last() == Some(&0) {
            break;
        }
    }
    assert_eq!(observed, vec![2, 1, 0]);
    assert!(rounds >= 6);

    converge(&mock, &mut c1, 10).await;
    let members: Vec<String> = mock
        .service_names()
        .into_iter()
        .filter(|name| name.starts_with("c1-dc1-r1-"))
        .collect();
    assert!(members.is_empty());
}

#[tokio::test]
async fn test_deleted_services_are_restored() {
    let (mock, mut c1) = steady(2).await;
    let headless = mock.service("c1-client").unwrap();
    let member = mock.service("c1-dc1-r1-1").unwrap();
    mock.remove_service("c1-client");
    mock.remove_service("c1-dc1-r1-1");

    round(&mock, &mut c1).await.unwrap();

    let restored = mock.service("c1-client").unwrap();
    assert_eq!(restored.metadata.labels, headless.metadata.labels);
    assert_eq!(restored.spec, headless.spec);

    let restored = mock.service("c1-dc1-r1-1").unwrap();
    assert_eq!(restored.metadata.labels, member.metadata.labels);
    let mut spec = restored.spec.unwrap();
    let mut expected = member.spec.unwrap();
    spec.cluster_ip = None;
    expected.cluster_ip = None;
    assert_eq!(spec, expected);
}

#[tokio::test]
async fn test_foreign_headless_service_is_an_ownership_conflict() {
    let mock = MockCluster::new();
    mock.insert_service(Service {
        metadata: ObjectMeta {
            name: Some("c1-client".to_string()),
            ..Default::default()
        },
        ..Default::default()
    });
    let mut c1 = cluster(vec![rack("r1", 1)]);

    let result = round(&mock, &mut c1).await;
    assert!(matches!(result, Err(Error::OwnershipConflict { .. })));
    assert!(mock.stateful_set("c1-dc1-r1").is_none());
    assert!(mock.take_events().iter().any(SyncEvent::is_warning));
}

#[tokio::test]
async fn test_owned_objects_have_one_controller_reference() {
    let (mock, _c1) = steady(3).await;

    let controllers = |owners: Option<Vec<OwnerReference>>| {
        owners
            .unwrap_or_default()
            .into_iter()
            .filter(|o| o.controller == Some(true) && o.uid == "uid-c1")
            .count()
    };
    for svc in mock.all_services() {
        assert_eq!(controllers(svc.metadata.owner_references), 1);
    }
    for sts in mock.all_stateful_sets() {
        assert_eq!(controllers(sts.metadata.owner_references), 1);
    }
}

#[tokio::test]
async fn test_config_map_gets_non_controlling_owner() {
    let mock = MockCluster::new();
    let existing_owner = OwnerReference {
        api_version: "v1".to_string(),
        kind: "Namespace".to_string(),
        name: "t".to_string(),
        uid: "uid-ns".to_string(),
        ..Default::default()
    };
    mock.insert_config_map(ConfigMap {
        metadata: ObjectMeta {
            name: Some("c1-config".to_string()),
            owner_references: Some(vec![existing_owner.clone()]),
            ..Default::default()
        },
        ..Default::default()
    });
    let mut r1 = rack("r1", 1);
    r1.config_map_name = Some("c1-config".to_string());
    let mut c1 = cluster(vec![r1]);

    round(&mock, &mut c1).await.unwrap();
    let owners = mock
        .config_map("c1-config")
        .unwrap()
        .metadata
        .owner_references
        .unwrap();
    assert_eq!(owners.len(), 2);
    assert_eq!(owners[0], existing_owner);
    assert_eq!(owners[1].uid, "uid-c1");
    assert_eq!(owners[1].controller, Some(false));
    mock.take_writes();

    round(&mock, &mut c1).await.unwrap();
    assert!(
        !mock
            .take_writes()
            .iter()
            .any(|w| matches!(w, Write::SetConfigMapOwners(_)))
    );
}

#[tokio::test]
async fn test_rack_bounds_hold_through_scaling() {
    let mock = MockCluster::new();
    let mut c1 = cluster(vec![rack("r1", 3)]);

    for members in [3, 1, 4, 0] {
        c1.spec.datacenter.racks[0].members = members;
        for _ in 0..30 {
            round(&mock, &mut c1).await.unwrap();

            let replicas = mock.stateful_set_replicas("c1-dc1-r1").unwrap_or(0);
            let services: Vec<Service> = mock
                .all_services()
                .into_iter()
                .filter(|svc| svc.name_any().starts_with("c1-dc1-r1-"))
                .collect();
            assert!(services.len() as i32 <= replicas + 1);

            let Some(status) = mock.status().and_then(|s| s.racks.get("r1").cloned()) else {
                continue;
            };
            assert!(status.ready_members <= status.members);

            let leaving: Vec<&Service> = services
                .iter()
                .filter(|svc| svc.labels().contains_key(DECOMMISSIONED_LABEL))
                .collect();
            assert!(leaving.len() <= 1);
            if let Some(svc) = leaving.first() {
                assert_eq!(member_index(&svc.name_any()).unwrap(), status.members - 1);
            }
        }
        assert_eq!(mock.stateful_set_replicas("c1-dc1-r1"), Some(members));
    }
}
