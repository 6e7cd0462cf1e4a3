use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Pod};
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::{
    conditions::{
        CONFIGURATION_UP_TO_DATE, Condition, ConditionStatus, POLICY_UNIQUELY_REACHABLE,
        is_condition_true, set_condition,
    },
    crds::{Policy, PolicyServer, PolicyStatusEnum},
    error::ReconcileError,
    policy_config::{self, POLICIES_KEY},
    policy_server_controller::Ctx,
    rollout::{CONFIG_VERSION_ANNOTATION, POLICY_SERVER_LABEL, is_policy_uniquely_reachable},
    store::{Labels, ObjectStore},
};

pub const CONFIGURATION_VERSION_MATCH: &str = "ConfigurationVersionMatch";
pub const CONFIGURATION_VERSION_MISMATCH: &str = "ConfigurationVersionMismatch";
pub const UNKNOWN_CONFIGURATION_VERSION: &str = "UnknownConfigurationVersion";
pub const UNIQUELY_REACHABLE: &str = "PolicyUniquelyReachable";
pub const NOT_UNIQUELY_REACHABLE: &str = "PolicyNotUniquelyReachable";

pub fn controller<P: Policy>(client: Client) -> Controller<P> {
    let api: Api<P> = Api::all(client);
    Controller::new(api, watcher::Config::default()).shutdown_on_signal()
}

pub async fn reconcile<P: Policy, S: ObjectStore>(
    policy: Arc<P>,
    ctx: Arc<Ctx<S>>,
) -> Result<Action, ReconcileError> {
    if policy.is_deleting() {
        return release(&*policy, &ctx).await;
    }

    let mut status = policy.policy_status().cloned().unwrap_or_default();
    status.mode = Some(policy.mode());
    status.policy_status = derive_status(&*policy, &ctx, &mut status.conditions).await?;

    ctx.store
        .patch_status::<P>(policy.namespace().as_deref(), &policy.name_any(), &json!(status))
        .await
        .map_err(ReconcileError::store("cannot update policy status"))?;
    debug!(policy = %policy.unique_name(), status = %status.policy_status, "policy status updated");

    match status.policy_status {
        PolicyStatusEnum::Scheduled | PolicyStatusEnum::Pending => Ok(Action::requeue(Duration::from_secs(5))),
        PolicyStatusEnum::Unscheduled | PolicyStatusEnum::Active => Ok(Action::requeue(Duration::from_secs(60))),
    }
}

pub fn error_policy<P: Policy, S>(policy: Arc<P>, err: &ReconcileError, _ctx: Arc<Ctx<S>>) -> Action {
    warn!(policy = %policy.unique_name(), error = ?err, "policy reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

/// Drops the finalizers owned by this controller once deletion was requested.
async fn release<P: Policy, S: ObjectStore>(policy: &P, ctx: &Ctx<S>) -> Result<Action, ReconcileError> {
    let mut released = policy.clone();
    released
        .finalizers_mut()
        .retain(|f| !ctx.config.is_owned_finalizer(f));
    if released.finalizers().len() == policy.finalizers().len() {
        return Ok(Action::await_change());
    }
    match ctx.store.replace(&released).await {
        Ok(_) => debug!(policy = %policy.unique_name(), "policy finalizers removed"),
        Err(err) if err.is_conflict() || err.is_not_found() => {
            debug!(policy = %policy.unique_name(), error = %err, "policy changed during cleanup");
        }
        Err(err) => return Err(ReconcileError::store("cannot remove policy finalizers")(err)),
    }
    Ok(Action::await_change())
}

async fn derive_status<P: Policy, S: ObjectStore>(
    policy: &P,
    ctx: &Ctx<S>,
    conditions: &mut Vec<Condition>,
) -> Result<PolicyStatusEnum, ReconcileError> {
    let server_name = policy.policy_server();
    if server_name.is_empty() {
        return Ok(PolicyStatusEnum::Unscheduled);
    }
    let Some(server) = ctx
        .store
        .get::<PolicyServer>(None, server_name)
        .await
        .map_err(ReconcileError::store("cannot fetch policy server"))?
    else {
        return Ok(PolicyStatusEnum::Scheduled);
    };

    let ns = Some(ctx.config.deployments_namespace.as_str());
    let name = server.resource_name();
    let deployment = ctx
        .store
        .get::<Deployment>(ns, &name)
        .await
        .map_err(ReconcileError::store("cannot fetch policy server deployment"))?;
    let config_map = ctx
        .store
        .get::<ConfigMap>(ns, &name)
        .await
        .map_err(ReconcileError::store("cannot fetch policy server configmap"))?;
    let (Some(deployment), Some(config_map)) = (deployment, config_map) else {
        return Ok(PolicyStatusEnum::Pending);
    };

    set_configuration_condition(&config_map, &deployment, conditions);
    let entries = policy_config::decode(
        config_map
            .data
            .as_ref()
            .and_then(|d| d.get(POLICIES_KEY))
            .map(String::as_str),
    )?;
    let configured = entries.contains_key(&policy.unique_name());

    let selector = Labels::from([(POLICY_SERVER_LABEL.to_string(), server.name_any())]);
    let replica_sets = ctx
        .store
        .list::<ReplicaSet>(ns, &selector)
        .await
        .map_err(ReconcileError::store("cannot list policy server replica sets"))?;
    let pods = ctx
        .store
        .list::<Pod>(ns, &selector)
        .await
        .map_err(ReconcileError::store("cannot list policy server pods"))?;
    let endpoints = ctx
        .store
        .get::<Endpoints>(ns, &name)
        .await
        .map_err(ReconcileError::store("cannot fetch policy server endpoints"))?;

    let reachable = is_policy_uniquely_reachable(&deployment, &replica_sets, &pods, endpoints.as_ref());
    let (reason, message) = if reachable {
        (UNIQUELY_REACHABLE, "Policy is uniquely reachable")
    } else {
        (NOT_UNIQUELY_REACHABLE, "Policy is not uniquely reachable")
    };
    set_condition(
        conditions,
        Condition::new(POLICY_UNIQUELY_REACHABLE, reachable.into(), reason, message),
    );

    if configured && reachable && is_condition_true(conditions, CONFIGURATION_UP_TO_DATE) {
        Ok(PolicyStatusEnum::Active)
    } else {
        Ok(PolicyStatusEnum::Pending)
    }
}

/// Compares the configuration version the deployment was rendered with to
/// the live ConfigMap.
pub fn set_configuration_condition(
    config_map: &ConfigMap,
    deployment: &Deployment,
    conditions: &mut Vec<Condition>,
) {
    let condition = match deployment.annotations().get(CONFIG_VERSION_ANNOTATION) {
        Some(version) if Some(version) == config_map.metadata.resource_version.as_ref() => Condition::new(
            CONFIGURATION_UP_TO_DATE,
            ConditionStatus::True,
            CONFIGURATION_VERSION_MATCH,
            "Configuration for this policy is up to date",
        ),
        Some(_) => Condition::new(
            CONFIGURATION_UP_TO_DATE,
            ConditionStatus::False,
            CONFIGURATION_VERSION_MISMATCH,
            "Configuration for this policy is not up to date",
        ),
        None => Condition::new(
            CONFIGURATION_UP_TO_DATE,
            ConditionStatus::False,
            UNKNOWN_CONFIGURATION_VERSION,
            format!(
                "Configuration version annotation ({CONFIG_VERSION_ANNOTATION}) in deployment {} is missing",
                deployment.name_any()
            ),
        ),
    };
    set_condition(conditions, condition);
}
