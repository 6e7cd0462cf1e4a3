use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "PolicyServer",
    plural = "policyservers",
    status = "PolicyServerStatus",
    shortname = "ps"
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyServerSpec {
    /// Container image running the policy server
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    pub service_account_name: Option<String>,
    /// Mutually exclusive with `maxUnavailable`. When neither is set no
    /// PodDisruptionBudget is kept.
    pub min_available: Option<IntOrString>,
    pub max_unavailable: Option<IntOrString>,
    /// Extra annotations for the policy-server pods
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Extra environment for the policy-server container
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
pub struct PolicyServerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PolicyServer {
    /// Name shared by every sub-resource of this policy server.
    pub fn resource_name(&self) -> String {
        resource_name(&self.metadata.name.clone().unwrap_or_default())
    }
}

pub fn resource_name(policy_server: &str) -> String {
    format!("policy-server-{policy_server}")
}
