use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kubewarden_controller::rollout::{
    CONFIG_VERSION_ANNOTATION, POD_TEMPLATE_HASH_LABEL, REVISION_ANNOTATION,
    is_latest_replica_set, is_policy_uniquely_reachable,
};
use serde_json::json;

fn deployment(revision: &str, config_version: &str, reason: &str) -> Deployment {
    serde_json::from_value(json!({
        "metadata": {
            "name": "policy-server-default",
            "annotations": {
                REVISION_ANNOTATION: revision,
                CONFIG_VERSION_ANNOTATION: config_version,
            },
        },
        "status": {
            "conditions": [{ "type": "Progressing", "status": "True", "reason": reason }],
        },
    }))
    .unwrap()
}

fn replica_set(revision: &str, config_version: &str, hash: &str, ready: i32) -> ReplicaSet {
    serde_json::from_value(json!({
        "metadata": {
            "name": format!("policy-server-default-{hash}"),
            "labels": { POD_TEMPLATE_HASH_LABEL: hash },
            "annotations": {
                REVISION_ANNOTATION: revision,
                CONFIG_VERSION_ANNOTATION: config_version,
            },
        },
        "status": { "replicas": ready, "readyReplicas": ready },
    }))
    .unwrap()
}

fn pod(hash: &str, ip: &str) -> Pod {
    serde_json::from_value(json!({
        "metadata": {
            "name": format!("policy-server-default-{hash}-{ip}"),
            "labels": { POD_TEMPLATE_HASH_LABEL: hash },
        },
        "status": {
            "podIP": ip,
            "conditions": [{ "type": "Ready", "status": "True" }],
        },
    }))
    .unwrap()
}

fn endpoints(ips: &[&str]) -> Endpoints {
    let addresses: Vec<_> = ips.iter().map(|ip| json!({ "ip": ip })).collect();
    serde_json::from_value(json!({
        "metadata": { "name": "policy-server-default" },
        "subsets": [{ "addresses": addresses }],
    }))
    .unwrap()
}

#[test]
fn config_change_becomes_reachable_once_rollout_settles() {
    // A new configuration version triggered revision 3.
    let rolling = deployment("3", "101", "ReplicaSetUpdated");
    let old = replica_set("2", "100", "aaa", 1);
    let new = replica_set("3", "101", "bbb", 1);
    assert!(is_latest_replica_set(&new, &rolling));
    assert!(!is_latest_replica_set(&old, &rolling));

    let pods = [pod("aaa", "10.0.0.1"), pod("bbb", "10.0.0.2")];
    let ep = endpoints(&["10.0.0.1", "10.0.0.2"]);
    assert!(!is_policy_uniquely_reachable(&rolling, &[old.clone(), new.clone()], &pods, Some(&ep)));

    // Deployment reports completion but the old replica set still has a ready pod.
    let done = deployment("3", "101", "NewReplicaSetAvailable");
    assert!(!is_policy_uniquely_reachable(&done, &[old, new.clone()], &pods, Some(&ep)));

    // Old pods are gone but the endpoints still route to them.
    let drained = replica_set("2", "100", "aaa", 0);
    let pods = [pod("bbb", "10.0.0.2")];
    let replica_sets = [drained, new];
    assert!(!is_policy_uniquely_reachable(&done, &replica_sets, &pods, Some(&ep)));

    let ep = endpoints(&["10.0.0.2"]);
    assert!(is_policy_uniquely_reachable(&done, &replica_sets, &pods, Some(&ep)));
}

#[test]
fn replica_set_from_another_config_version_is_not_latest() {
    let d = deployment("3", "101", "NewReplicaSetAvailable");
    assert!(!is_latest_replica_set(&replica_set("3", "100", "bbb", 1), &d));
}
