//! Decides whether a policy server rollout has settled.
//!
//! Every input is a point-in-time snapshot that may lag behind the others.
//! Anything ambiguous answers `false`: a false negative only delays a policy
//! becoming active, a false positive would route admission requests to pods
//! running a stale configuration.

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Endpoints, Pod};
use kube::ResourceExt;
use tracing::debug;

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";
/// Resource version of the ConfigMap the deployment was rendered from.
pub const CONFIG_VERSION_ANNOTATION: &str = "kubewarden/config-version";
/// Label selecting every workload object of one policy server.
pub const POLICY_SERVER_LABEL: &str = "kubewarden/policy-server";

pub fn is_rollout_completed(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "Progressing"
                    && c.status == "True"
                    && c.reason.as_deref() == Some("NewReplicaSetAvailable")
            })
        })
}

/// A replica set is the latest one when it carries the deployment's current
/// revision and configuration version.
pub fn is_latest_replica_set(replica_set: &ReplicaSet, deployment: &Deployment) -> bool {
    let Some(revision) = deployment.annotations().get(REVISION_ANNOTATION) else {
        return false;
    };
    let rs = replica_set.annotations();
    rs.get(REVISION_ANNOTATION) == Some(revision)
        && rs.get(CONFIG_VERSION_ANNOTATION) == deployment.annotations().get(CONFIG_VERSION_ANNOTATION)
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True")
}

fn has_live_replicas(replica_set: &ReplicaSet) -> bool {
    replica_set
        .status
        .as_ref()
        .is_some_and(|s| s.replicas > 0 || s.ready_replicas.unwrap_or_default() > 0)
}

fn endpoint_ips(endpoints: &Endpoints) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|address| address.ip.clone())
        .collect()
}

/// Whether every live request for the server lands on a pod of the latest
/// replica set.
pub fn is_policy_uniquely_reachable(
    deployment: &Deployment,
    replica_sets: &[ReplicaSet],
    pods: &[Pod],
    endpoints: Option<&Endpoints>,
) -> bool {
    let name = deployment.name_any();
    if !is_rollout_completed(deployment) {
        debug!(deployment = %name, "rollout still in progress");
        return false;
    }

    let mut template_hash = None;
    for rs in replica_sets {
        if is_latest_replica_set(rs, deployment) {
            template_hash = rs.labels().get(POD_TEMPLATE_HASH_LABEL).cloned();
        } else if has_live_replicas(rs) {
            debug!(deployment = %name, replica_set = %rs.name_any(), "older replica set still serving");
            return false;
        }
    }
    let Some(template_hash) = template_hash.filter(|h| !h.is_empty()) else {
        debug!(deployment = %name, "no replica set matches the current revision");
        return false;
    };

    let mut pod_ips = Vec::new();
    for pod in pods.iter().filter(|p| p.metadata.deletion_timestamp.is_none()) {
        if pod.labels().get(POD_TEMPLATE_HASH_LABEL) != Some(&template_hash) || !is_pod_ready(pod) {
            debug!(deployment = %name, pod = %pod.name_any(), "pod is stale or not ready");
            return false;
        }
        match pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
            Some(ip) => pod_ips.push(ip),
            None => return false,
        }
    }
    if pod_ips.is_empty() {
        return false;
    }

    let Some(endpoints) = endpoints else {
        return false;
    };
    let mut endpoint_ips = endpoint_ips(endpoints);
    pod_ips.sort();
    endpoint_ips.sort();
    pod_ips == endpoint_ips
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(progressing_reason: &str) -> Deployment {
        serde_json::from_value(json!({
            "metadata": {
                "name": "policy-server-default",
                "annotations": {
                    REVISION_ANNOTATION: "2",
                    CONFIG_VERSION_ANNOTATION: "42",
                },
            },
            "status": {
                "conditions": [{
                    "type": "Progressing",
                    "status": "True",
                    "reason": progressing_reason,
                }],
            },
        }))
        .unwrap()
    }

    fn replica_set(name: &str, revision: &str, hash: &str, replicas: i32) -> ReplicaSet {
        serde_json::from_value(json!({
            "metadata": {
                "name": name,
                "labels": { POD_TEMPLATE_HASH_LABEL: hash },
                "annotations": {
                    REVISION_ANNOTATION: revision,
                    CONFIG_VERSION_ANNOTATION: "42",
                },
            },
            "status": { "replicas": replicas, "readyReplicas": replicas },
        }))
        .unwrap()
    }

    fn pod(name: &str, hash: &str, ip: &str, ready: bool) -> Pod {
        serde_json::from_value(json!({
            "metadata": { "name": name, "labels": { POD_TEMPLATE_HASH_LABEL: hash } },
            "status": {
                "podIP": ip,
                "conditions": [{ "type": "Ready", "status": if ready { "True" } else { "False" } }],
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

    fn settled() -> (Deployment, Vec<ReplicaSet>, Vec<Pod>, Endpoints) {
        (
            deployment("NewReplicaSetAvailable"),
            vec![replica_set("old", "1", "aaa", 0), replica_set("new", "2", "bbb", 2)],
            vec![pod("p1", "bbb", "10.0.0.1", true), pod("p2", "bbb", "10.0.0.2", true)],
            endpoints(&["10.0.0.2", "10.0.0.1"]),
        )
    }

    #[test]
    fn settled_rollout_is_uniquely_reachable() {
        let (d, rs, pods, ep) = settled();
        assert!(is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));
    }

    #[test]
    fn rollout_in_progress() {
        let (_, rs, pods, ep) = settled();
        let d = deployment("ReplicaSetUpdated");
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));
    }

    #[test]
    fn older_replica_set_still_serving() {
        let (d, mut rs, pods, ep) = settled();
        rs[0] = replica_set("old", "1", "aaa", 1);
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));
    }

    #[test]
    fn no_latest_replica_set() {
        let (d, _, pods, ep) = settled();
        let rs = vec![replica_set("old", "1", "aaa", 0)];
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));
    }

    #[test]
    fn stale_or_unready_pods() {
        let (d, rs, mut pods, ep) = settled();
        pods[1] = pod("p2", "aaa", "10.0.0.2", true);
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));

        pods[1] = pod("p2", "bbb", "10.0.0.2", false);
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));
    }

    #[test]
    fn terminating_pods_are_ignored() {
        let (d, rs, mut pods, ep) = settled();
        let mut terminating = pod("p0", "aaa", "10.0.0.9", false);
        terminating.metadata.deletion_timestamp = serde_json::from_value(json!("2026-01-01T00:00:00Z")).unwrap();
        pods.push(terminating);
        assert!(is_policy_uniquely_reachable(&d, &rs, &pods, Some(&ep)));
    }

    #[test]
    fn endpoints_must_match_latest_pods() {
        let (d, rs, pods, _) = settled();
        let stale = endpoints(&["10.0.0.1", "10.0.0.2", "10.0.0.9"]);
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&stale)));

        let lagging = endpoints(&["10.0.0.1"]);
        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, Some(&lagging)));

        assert!(!is_policy_uniquely_reachable(&d, &rs, &pods, None));
    }

    #[test]
    fn no_pods_is_not_reachable() {
        let (d, rs, _, ep) = settled();
        assert!(!is_policy_uniquely_reachable(&d, &rs, &[], Some(&ep)));
    }
}
