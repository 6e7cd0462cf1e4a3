//! The four policy resources and the capability set they share.
//!
//! Controllers and webhooks are written once against [`Policy`]; each
//! resource only provides storage for the shared fields.

use std::{collections::BTreeMap, fmt};

use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::conditions::Condition;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Protect,
    Monitor,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protect => f.write_str("protect"),
            Self::Monitor => f.write_str("monitor"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatusEnum {
    /// No policy server assigned
    #[default]
    Unscheduled,
    /// Policy server assigned but not found
    Scheduled,
    /// Policy server exists but is not yet serving the latest configuration
    Pending,
    /// Policy server is uniquely reachable with the current configuration
    Active,
}

impl fmt::Display for PolicyStatusEnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unscheduled => "unscheduled",
            Self::Scheduled => "scheduled",
            Self::Pending => "pending",
            Self::Active => "active",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default)]
    pub policy_status: PolicyStatusEnum,
    /// Mode last observed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PolicyMode>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyGroupMember {
    /// Location of the WebAssembly module, e.g. `registry://ghcr.io/...`
    pub module: String,
    #[serde(default)]
    #[schemars(schema_with = "arbitrary_settings")]
    pub settings: Option<Value>,
}

fn arbitrary_settings(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicy",
    plural = "admissionpolicies",
    namespaced,
    status = "PolicyStatus",
    shortname = "ap"
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicySpec {
    #[serde(default)]
    pub policy_server: String,
    #[serde(default)]
    pub mode: PolicyMode,
    pub module: String,
    #[serde(default)]
    #[schemars(schema_with = "arbitrary_settings")]
    pub settings: Option<Value>,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default)]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(default)]
    pub mutating: bool,
    pub failure_policy: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub object_selector: Option<LabelSelector>,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicy",
    plural = "clusteradmissionpolicies",
    status = "PolicyStatus",
    shortname = "cap"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdmissionPolicySpec {
    #[serde(default)]
    pub policy_server: String,
    #[serde(default)]
    pub mode: PolicyMode,
    pub module: String,
    #[serde(default)]
    #[schemars(schema_with = "arbitrary_settings")]
    pub settings: Option<Value>,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default)]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(default)]
    pub mutating: bool,
    pub failure_policy: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub object_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicyGroup",
    plural = "admissionpolicygroups",
    namespaced,
    status = "PolicyStatus",
    shortname = "apg"
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicyGroupSpec {
    #[serde(default)]
    pub policy_server: String,
    #[serde(default)]
    pub mode: PolicyMode,
    /// Settings shared by the group evaluation
    #[serde(default)]
    #[schemars(schema_with = "arbitrary_settings")]
    pub settings: Option<Value>,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default)]
    pub match_conditions: Vec<MatchCondition>,
    /// Group members by name. Must not be empty.
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyGroupMember>,
    /// Expression combining the members' verdicts
    #[serde(default)]
    pub expression: String,
    /// Message returned when the group rejects a request
    #[serde(default)]
    pub message: String,
    pub failure_policy: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub object_selector: Option<LabelSelector>,
}

#[derive(CustomResource, Debug, Serialize, Deserialize, Clone, Default, PartialEq, JsonSchema)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicyGroup",
    plural = "clusteradmissionpolicygroups",
    status = "PolicyStatus",
    shortname = "capg"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdmissionPolicyGroupSpec {
    #[serde(default)]
    pub policy_server: String,
    #[serde(default)]
    pub mode: PolicyMode,
    #[serde(default)]
    #[schemars(schema_with = "arbitrary_settings")]
    pub settings: Option<Value>,
    #[serde(default)]
    pub rules: Vec<RuleWithOperations>,
    #[serde(default)]
    pub match_conditions: Vec<MatchCondition>,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicyGroupMember>,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub message: String,
    pub failure_policy: Option<String>,
    pub timeout_seconds: Option<i32>,
    pub object_selector: Option<LabelSelector>,
    pub namespace_selector: Option<LabelSelector>,
}

/// Accessors shared by every policy resource.
///
/// Finalizers are reached through [`ResourceExt::finalizers`] and
/// [`ResourceExt::finalizers_mut`].
pub trait Policy:
    Resource<DynamicType = ()> + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn policy_server(&self) -> &str;
    fn set_policy_server(&mut self, policy_server: String);

    fn mode(&self) -> PolicyMode;
    fn set_mode(&mut self, mode: PolicyMode);

    fn rules(&self) -> &[RuleWithOperations];
    fn set_rules(&mut self, rules: Vec<RuleWithOperations>);

    fn match_conditions(&self) -> &[MatchCondition];
    fn set_match_conditions(&mut self, match_conditions: Vec<MatchCondition>);

    fn settings(&self) -> Option<&Value>;
    fn set_settings(&mut self, settings: Option<Value>);

    fn policy_status(&self) -> Option<&PolicyStatus>;
    fn set_policy_status(&mut self, status: PolicyStatus);

    /// WebAssembly module of a single policy. `None` for groups.
    fn module(&self) -> Option<&str> {
        None
    }

    fn is_mutating(&self) -> bool {
        false
    }

    /// Members of a policy group. `None` for single policies.
    fn members(&self) -> Option<&BTreeMap<String, PolicyGroupMember>> {
        None
    }

    fn set_members(&mut self, _members: BTreeMap<String, PolicyGroupMember>) {}

    /// `(expression, message)` of a policy group.
    fn group_verdict(&self) -> Option<(&str, &str)> {
        None
    }

    /// Name identifying the policy inside a policy server configuration.
    fn unique_name(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("namespaced-{}-{}", ns, self.name_any()),
            None => format!("clusterwide-{}", self.name_any()),
        }
    }

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

macro_rules! impl_policy_common {
    () => {
        fn policy_server(&self) -> &str {
            &self.spec.policy_server
        }

        fn set_policy_server(&mut self, policy_server: String) {
            self.spec.policy_server = policy_server;
        }

        fn mode(&self) -> PolicyMode {
            self.spec.mode
        }

        fn set_mode(&mut self, mode: PolicyMode) {
            self.spec.mode = mode;
        }

        fn rules(&self) -> &[RuleWithOperations] {
            &self.spec.rules
        }

        fn set_rules(&mut self, rules: Vec<RuleWithOperations>) {
            self.spec.rules = rules;
        }

        fn match_conditions(&self) -> &[MatchCondition] {
            &self.spec.match_conditions
        }

        fn set_match_conditions(&mut self, match_conditions: Vec<MatchCondition>) {
            self.spec.match_conditions = match_conditions;
        }

        fn settings(&self) -> Option<&Value> {
            self.spec.settings.as_ref()
        }

        fn set_settings(&mut self, settings: Option<Value>) {
            self.spec.settings = settings;
        }

        fn policy_status(&self) -> Option<&PolicyStatus> {
            self.status.as_ref()
        }

        fn set_policy_status(&mut self, status: PolicyStatus) {
            self.status = Some(status);
        }
    };
}

macro_rules! impl_single_policy {
    ($kind:ty) => {
        impl Policy for $kind {
            impl_policy_common!();

            fn module(&self) -> Option<&str> {
                Some(&self.spec.module)
            }

            fn is_mutating(&self) -> bool {
                self.spec.mutating
            }
        }
    };
}

macro_rules! impl_policy_group {
    ($kind:ty) => {
        impl Policy for $kind {
            impl_policy_common!();

            fn members(&self) -> Option<&BTreeMap<String, PolicyGroupMember>> {
                Some(&self.spec.policies)
            }

            fn set_members(&mut self, members: BTreeMap<String, PolicyGroupMember>) {
                self.spec.policies = members;
            }

            fn group_verdict(&self) -> Option<(&str, &str)> {
                Some((self.spec.expression.as_str(), self.spec.message.as_str()))
            }
        }
    };
}

impl_single_policy!(AdmissionPolicy);
impl_single_policy!(ClusterAdmissionPolicy);
impl_policy_group!(AdmissionPolicyGroup);
impl_policy_group!(ClusterAdmissionPolicyGroup);

/// A policy of any of the four kinds, as gathered for one policy server.
#[derive(Debug, Clone)]
pub enum AnyPolicy {
    ClusterAdmissionPolicy(ClusterAdmissionPolicy),
    AdmissionPolicy(AdmissionPolicy),
    AdmissionPolicyGroup(AdmissionPolicyGroup),
    ClusterAdmissionPolicyGroup(ClusterAdmissionPolicyGroup),
}

/// Runs `$body` with `$p` bound to the inner policy, whatever its kind.
#[macro_export]
macro_rules! with_policy {
    ($any:expr, $p:ident => $body:expr) => {
        match $any {
            $crate::crds::AnyPolicy::ClusterAdmissionPolicy($p) => $body,
            $crate::crds::AnyPolicy::AdmissionPolicy($p) => $body,
            $crate::crds::AnyPolicy::AdmissionPolicyGroup($p) => $body,
            $crate::crds::AnyPolicy::ClusterAdmissionPolicyGroup($p) => $body,
        }
    };
}

impl AnyPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClusterAdmissionPolicy(_) => "ClusterAdmissionPolicy",
            Self::AdmissionPolicy(_) => "AdmissionPolicy",
            Self::AdmissionPolicyGroup(_) => "AdmissionPolicyGroup",
            Self::ClusterAdmissionPolicyGroup(_) => "ClusterAdmissionPolicyGroup",
        }
    }

    pub fn policy_server(&self) -> &str {
        with_policy!(self, p => p.policy_server())
    }

    pub fn unique_name(&self) -> String {
        with_policy!(self, p => p.unique_name())
    }

    pub fn is_deleting(&self) -> bool {
        with_policy!(self, p => p.is_deleting())
    }
}

macro_rules! impl_from_policy {
    ($($kind:ident),+) => {
        $(
            impl From<$kind> for AnyPolicy {
                fn from(policy: $kind) -> Self {
                    Self::$kind(policy)
                }
            }
        )+
    };
}

impl_from_policy!(
    ClusterAdmissionPolicy,
    AdmissionPolicy,
    AdmissionPolicyGroup,
    ClusterAdmissionPolicyGroup
);
