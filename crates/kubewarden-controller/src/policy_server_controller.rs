use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, HTTPGetAction,
    PodSpec, PodTemplateSpec, Probe, Secret, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    Api, Client, ResourceExt,
    core::ObjectMeta,
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{
    certs::{self, CERT_KEY, PRIVATE_KEY_KEY, generate_serving_certificate, service_dns_names},
    conditions::{
        CERT_SECRET_RECONCILED, CONFIG_MAP_RECONCILED, Condition, DEPLOYMENT_RECONCILED,
        POD_DISRUPTION_BUDGET_RECONCILED, SERVICE_RECONCILED, set_false_condition,
        set_true_condition,
    },
    config::{ControllerConfig, TelemetryConfig},
    crds::{
        AdmissionPolicy, AdmissionPolicyGroup, AnyPolicy, ClusterAdmissionPolicy,
        ClusterAdmissionPolicyGroup, GROUP, Policy, PolicyServer,
    },
    error::ReconcileError,
    index::{PolicyIndex, indexed_policies, policy_server_request},
    policy_config::{self, POLICIES_KEY},
    rollout::{CONFIG_VERSION_ANNOTATION, POLICY_SERVER_LABEL},
    store::{ObjectStore, StoreError},
    with_policy,
};

/// Secret version the pods were rendered with, so a new certificate rolls them.
pub const CERT_VERSION_ANNOTATION: &str = "kubewarden/cert-version";

const CONTAINER_NAME: &str = "policy-server";
const POLICY_SERVER_PORT: i32 = 8443;
const READINESS_PORT: i32 = 8081;
const CONFIG_MOUNT: &str = "/config";
const CERTS_MOUNT: &str = "/pki";

pub struct Ctx<S> {
    pub store: S,
    /// Policies by policy server, fed by the policy watches
    pub index: PolicyIndex,
    pub config: ControllerConfig,
}

pub fn controller(client: Client, config: &ControllerConfig, index: &PolicyIndex) -> Controller<PolicyServer> {
    let ns = &config.deployments_namespace;
    let servers: Api<PolicyServer> = Api::all(client.clone());
    Controller::new(servers, watcher::Config::default())
        .owns(Api::<Deployment>::namespaced(client.clone(), ns), watcher::Config::default())
        .owns(Api::<ConfigMap>::namespaced(client.clone(), ns), watcher::Config::default())
        .owns(Api::<Service>::namespaced(client.clone(), ns), watcher::Config::default())
        .watches_stream(
            indexed_policies::<ClusterAdmissionPolicy>(client.clone(), index.clone()),
            policy_server_request::<ClusterAdmissionPolicy>,
        )
        .watches_stream(
            indexed_policies::<AdmissionPolicy>(client.clone(), index.clone()),
            policy_server_request::<AdmissionPolicy>,
        )
        .watches_stream(
            indexed_policies::<AdmissionPolicyGroup>(client.clone(), index.clone()),
            policy_server_request::<AdmissionPolicyGroup>,
        )
        .watches_stream(
            indexed_policies::<ClusterAdmissionPolicyGroup>(client, index.clone()),
            policy_server_request::<ClusterAdmissionPolicyGroup>,
        )
        .shutdown_on_signal()
}

pub async fn reconcile<S: ObjectStore>(
    server: Arc<PolicyServer>,
    ctx: Arc<Ctx<S>>,
) -> Result<Action, ReconcileError> {
    let name = server.name_any();
    let policies = ctx.index.bound_policies(&name);

    if server.metadata.deletion_timestamp.is_some() {
        return reconcile_deletion(&server, &policies, &ctx).await;
    }

    let Some(server) = ensure_finalizer(&server, &ctx).await? else {
        return Ok(Action::requeue(Duration::from_secs(1)));
    };

    let mut conditions = server
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let result = reconcile_resources(&server, &policies, &ctx, &mut conditions).await;

    // Conditions are persisted even when a step failed.
    let persisted = ctx
        .store
        .patch_status::<PolicyServer>(None, &name, &json!({ "conditions": conditions }))
        .await
        .map_err(ReconcileError::store("update policy server status error"));
    result?;
    persisted?;

    info!(policy_server = %name, policies = policies.len(), "policy server reconciled");
    Ok(Action::requeue(Duration::from_secs(300)))
}

pub fn error_policy<S>(server: Arc<PolicyServer>, err: &ReconcileError, _ctx: Arc<Ctx<S>>) -> Action {
    warn!(policy_server = %server.name_any(), error = ?err, "policy server reconcile failed");
    Action::requeue(Duration::from_secs(30))
}

async fn reconcile_resources<S: ObjectStore>(
    server: &PolicyServer,
    policies: &[AnyPolicy],
    ctx: &Ctx<S>,
    conditions: &mut Vec<Condition>,
) -> Result<(), ReconcileError> {
    let cert_version = record(
        conditions,
        CERT_SECRET_RECONCILED,
        "certificate secret",
        reconcile_cert_secret(server, ctx).await,
    )?;
    let config_version = record(
        conditions,
        CONFIG_MAP_RECONCILED,
        "configmap",
        reconcile_config_map(server, policies, ctx).await,
    )?;
    record(
        conditions,
        POD_DISRUPTION_BUDGET_RECONCILED,
        "policy server PodDisruptionBudget",
        reconcile_pod_disruption_budget(server, ctx).await,
    )?;
    record(
        conditions,
        DEPLOYMENT_RECONCILED,
        "deployment",
        reconcile_deployment(server, &config_version, &cert_version, ctx).await,
    )?;
    record(
        conditions,
        SERVICE_RECONCILED,
        "service",
        reconcile_service(server, ctx).await,
    )?;
    Ok(())
}

fn record<T>(
    conditions: &mut Vec<Condition>,
    type_: &str,
    what: &str,
    result: Result<T, ReconcileError>,
) -> Result<T, ReconcileError> {
    match &result {
        Ok(_) => set_true_condition(conditions, type_),
        Err(err) => set_false_condition(conditions, type_, format!("error reconciling {what}: {err}")),
    }
    result
}

async fn reconcile_deletion<S: ObjectStore>(
    server: &PolicyServer,
    policies: &[AnyPolicy],
    ctx: &Ctx<S>,
) -> Result<Action, ReconcileError> {
    let name = server.name_any();
    if !policies.is_empty() {
        // Wait for every bound policy to be gone before releasing the server.
        let mut errors = Vec::new();
        for policy in policies.iter().filter(|p| !p.is_deleting()) {
            let deleted = with_policy!(policy, p => delete_policy(&ctx.store, p).await);
            match deleted {
                Ok(()) => debug!(policy_server = %name, policy = %policy.unique_name(), "policy deletion requested"),
                Err(err) if err.is_not_found() => {}
                Err(err) => errors.push(err),
            }
        }
        if !errors.is_empty() {
            error!(policy_server = %name, errors = errors.len(), "could not remove all policies bound to policy server");
            return Err(ReconcileError::PolicyCleanup {
                policy_server: name,
                errors,
            });
        }
        return Ok(Action::requeue(Duration::from_secs(2)));
    }

    let mut released = server.clone();
    released
        .finalizers_mut()
        .retain(|f| !ctx.config.is_owned_finalizer(f));
    match ctx.store.replace(&released).await {
        Ok(_) => info!(policy_server = %name, "policy server finalizers removed"),
        // Already changed or gone: the next event carries the fresh object.
        Err(err) if err.is_conflict() || err.is_not_found() => {
            debug!(policy_server = %name, error = %err, "policy server changed during cleanup");
        }
        Err(err) => return Err(ReconcileError::store("cannot update policy server")(err)),
    }
    Ok(Action::await_change())
}

async fn delete_policy<P: Policy, S: ObjectStore>(store: &S, policy: &P) -> Result<(), StoreError> {
    store
        .delete::<P>(policy.namespace().as_deref(), &policy.name_any())
        .await
}

/// Returns the server carrying the finalizer, or `None` when the update lost
/// a race and the pass has to start over.
async fn ensure_finalizer<S: ObjectStore>(
    server: &PolicyServer,
    ctx: &Ctx<S>,
) -> Result<Option<PolicyServer>, ReconcileError> {
    if server.finalizers().iter().any(|f| *f == ctx.config.finalizer) {
        return Ok(Some(server.clone()));
    }
    let mut updated = server.clone();
    updated.finalizers_mut().push(ctx.config.finalizer.clone());
    match ctx.store.replace(&updated).await {
        Ok(updated) => Ok(Some(updated)),
        Err(err) if err.is_conflict() => {
            debug!(policy_server = %server.name_any(), "conflict while adding finalizer");
            Ok(None)
        }
        Err(err) => Err(ReconcileError::store("cannot add policy server finalizer")(err)),
    }
}

/// Ensures the TLS secret exists and returns its resource version. An
/// existing secret is never regenerated.
async fn reconcile_cert_secret<S: ObjectStore>(
    server: &PolicyServer,
    ctx: &Ctx<S>,
) -> Result<String, ReconcileError> {
    let ns = ctx.config.deployments_namespace.as_str();
    let name = server.resource_name();
    let lookup = ReconcileError::store("cannot fetch policy server secret");
    if let Some(secret) = ctx.store.get::<Secret>(Some(ns), &name).await.map_err(lookup)? {
        return Ok(secret.resource_version().unwrap_or_default());
    }

    let cert = generate_serving_certificate(service_dns_names(&name, ns))?;
    match ctx.store.create(&build_cert_secret(server, ns, &cert)).await {
        Ok(created) => Ok(created.resource_version().unwrap_or_default()),
        Err(StoreError::AlreadyExists { .. }) => {
            let secret = ctx
                .store
                .get::<Secret>(Some(ns), &name)
                .await
                .map_err(ReconcileError::store("cannot fetch policy server secret"))?;
            Ok(secret.and_then(|s| s.resource_version()).unwrap_or_default())
        }
        Err(err) => Err(ReconcileError::store("cannot create policy server secret")(err)),
    }
}

/// Writes the policies configuration when it changed and returns the
/// ConfigMap resource version.
async fn reconcile_config_map<S: ObjectStore>(
    server: &PolicyServer,
    policies: &[AnyPolicy],
    ctx: &Ctx<S>,
) -> Result<String, ReconcileError> {
    let ns = ctx.config.deployments_namespace.as_str();
    let name = server.resource_name();
    let desired = policy_config::build(policies);

    let existing = ctx
        .store
        .get::<ConfigMap>(Some(ns), &name)
        .await
        .map_err(ReconcileError::store("cannot fetch policy server configmap"))?;
    if let Some(existing) = &existing {
        let current = existing
            .data
            .as_ref()
            .and_then(|d| d.get(POLICIES_KEY))
            .map(String::as_str);
        if !policy_config::should_update(current, &desired)? {
            return Ok(existing.resource_version().unwrap_or_default());
        }
    }

    let data = policy_config::encode(&desired)?;
    let applied = ctx
        .store
        .apply(&build_config_map(server, ns, data))
        .await
        .map_err(ReconcileError::store("cannot write policy server configmap"))?;
    debug!(policy_server = %server.name_any(), "policy server configmap updated");
    Ok(applied.resource_version().unwrap_or_default())
}

async fn reconcile_pod_disruption_budget<S: ObjectStore>(
    server: &PolicyServer,
    ctx: &Ctx<S>,
) -> Result<(), ReconcileError> {
    let ns = ctx.config.deployments_namespace.as_str();
    match build_pod_disruption_budget(server, ns) {
        Some(pdb) => {
            ctx.store
                .apply(&pdb)
                .await
                .map_err(ReconcileError::store("cannot apply PodDisruptionBudget"))?;
        }
        None => match ctx
            .store
            .delete::<PodDisruptionBudget>(Some(ns), &server.resource_name())
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(ReconcileError::store("cannot delete PodDisruptionBudget")(err)),
        },
    }
    Ok(())
}

async fn reconcile_deployment<S: ObjectStore>(
    server: &PolicyServer,
    config_version: &str,
    cert_version: &str,
    ctx: &Ctx<S>,
) -> Result<(), ReconcileError> {
    let deployment = build_deployment(
        server,
        &ctx.config.deployments_namespace,
        config_version,
        cert_version,
        &ctx.config.telemetry,
    );
    ctx.store
        .apply(&deployment)
        .await
        .map_err(ReconcileError::store("cannot apply policy server deployment"))?;
    Ok(())
}

async fn reconcile_service<S: ObjectStore>(
    server: &PolicyServer,
    ctx: &Ctx<S>,
) -> Result<(), ReconcileError> {
    let service = build_service(server, &ctx.config.deployments_namespace);
    ctx.store
        .apply(&service)
        .await
        .map_err(ReconcileError::store("cannot apply policy server service"))?;
    Ok(())
}

fn owner_ref(server: &PolicyServer) -> OwnerReference {
    OwnerReference {
        api_version: format!("{GROUP}/v1"),
        kind: "PolicyServer".into(),
        name: server.name_any(),
        uid: server.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub fn labels(server: &PolicyServer) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), format!("kubewarden-{}", server.resource_name())),
        (POLICY_SERVER_LABEL.to_string(), server.name_any()),
    ])
}

fn metadata(server: &PolicyServer, ns: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(server.resource_name()),
        namespace: Some(ns.to_string()),
        labels: Some(labels(server)),
        owner_references: Some(vec![owner_ref(server)]),
        ..Default::default()
    }
}

fn build_cert_secret(server: &PolicyServer, ns: &str, cert: &certs::ServingCertificate) -> Secret {
    Secret {
        metadata: metadata(server, ns),
        type_: Some("kubernetes.io/tls".into()),
        string_data: Some(BTreeMap::from([
            (CERT_KEY.to_string(), cert.cert_pem.clone()),
            (PRIVATE_KEY_KEY.to_string(), cert.key_pem.clone()),
        ])),
        ..Default::default()
    }
}

fn build_config_map(server: &PolicyServer, ns: &str, policies: String) -> ConfigMap {
    ConfigMap {
        metadata: metadata(server, ns),
        data: Some(BTreeMap::from([(POLICIES_KEY.to_string(), policies)])),
        ..Default::default()
    }
}

fn build_pod_disruption_budget(server: &PolicyServer, ns: &str) -> Option<PodDisruptionBudget> {
    let spec = &server.spec;
    if spec.min_available.is_none() && spec.max_unavailable.is_none() {
        return None;
    }
    Some(PodDisruptionBudget {
        metadata: metadata(server, ns),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: spec.min_available.clone(),
            // Only one of the two may be set.
            max_unavailable: spec
                .min_available
                .is_none()
                .then(|| spec.max_unavailable.clone())
                .flatten(),
            selector: Some(LabelSelector {
                match_labels: Some(labels(server)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn container_env(server: &PolicyServer, telemetry: &TelemetryConfig) -> Vec<EnvVar> {
    let mut vars = vec![
        env("KUBEWARDEN_CERT_FILE", format!("{CERTS_MOUNT}/{CERT_KEY}")),
        env("KUBEWARDEN_KEY_FILE", format!("{CERTS_MOUNT}/{PRIVATE_KEY_KEY}")),
        env("KUBEWARDEN_PORT", POLICY_SERVER_PORT.to_string()),
        env("KUBEWARDEN_POLICIES", format!("{CONFIG_MOUNT}/{POLICIES_KEY}")),
        env("KUBEWARDEN_POLICY_SERVER_NAME", server.name_any()),
    ];
    if telemetry.metrics_enabled {
        vars.push(env("KUBEWARDEN_ENABLE_METRICS", "1"));
    }
    if telemetry.tracing_enabled {
        vars.push(env("KUBEWARDEN_LOG_FMT", "otlp"));
    }
    vars.extend(server.spec.env.iter().cloned());
    vars
}

fn build_deployment(
    server: &PolicyServer,
    ns: &str,
    config_version: &str,
    cert_version: &str,
    telemetry: &TelemetryConfig,
) -> Deployment {
    let labels = labels(server);
    let name = server.resource_name();

    let mut meta = metadata(server, ns);
    meta.annotations = Some(BTreeMap::from([(
        CONFIG_VERSION_ANNOTATION.to_string(),
        config_version.to_string(),
    )]));

    let mut pod_annotations = server.spec.annotations.clone();
    pod_annotations.insert(CONFIG_VERSION_ANNOTATION.into(), config_version.into());
    pod_annotations.insert(CERT_VERSION_ANNOTATION.into(), cert_version.into());

    Deployment {
        metadata: meta,
        spec: Some(DeploymentSpec {
            replicas: Some(server.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: server.spec.service_account_name.clone(),
                    containers: vec![Container {
                        name: CONTAINER_NAME.into(),
                        image: Some(server.spec.image.clone()),
                        env: Some(container_env(server, telemetry)),
                        ports: Some(vec![ContainerPort {
                            container_port: POLICY_SERVER_PORT,
                            ..Default::default()
                        }]),
                        readiness_probe: Some(Probe {
                            http_get: Some(HTTPGetAction {
                                path: Some("/readiness".into()),
                                port: IntOrString::Int(READINESS_PORT),
                                scheme: Some("HTTP".into()),
                                ..Default::default()
                            }),
                            period_seconds: Some(5),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "policies".into(),
                                mount_path: CONFIG_MOUNT.into(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "certs".into(),
                                mount_path: CERTS_MOUNT.into(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "policies".into(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: name.clone(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "certs".into(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(name),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_service(server: &PolicyServer, ns: &str) -> Service {
    Service {
        metadata: metadata(server, ns),
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                "app".to_string(),
                format!("kubewarden-{}", server.resource_name()),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("policy-server".into()),
                port: 443,
                target_port: Some(IntOrString::Int(POLICY_SERVER_PORT)),
                protocol: Some("TCP".into()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
