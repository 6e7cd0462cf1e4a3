//! The configuration file consumed by a policy server.
//!
//! The policies bound to a server are projected into a map keyed by their
//! unique name and stored, serialized, under [`POLICIES_KEY`] of the server's
//! ConfigMap. Existing content is compared structurally so re-serializing an
//! unchanged set of policies never causes a write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crds::{AnyPolicy, Policy, PolicyMode};
use crate::with_policy;

pub const POLICIES_KEY: &str = "policies.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to unmarshal policy mapping: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to marshal policy mapping: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfigEntry {
    /// Module reference. Empty for policy groups.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// `null` and an omitted field are the same thing
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub allowed_to_mutate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_mode: Option<PolicyMode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub policies: BTreeMap<String, PolicyGroupMemberEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyGroupMemberEntry {
    pub url: String,
    #[serde(default)]
    pub settings: Option<Value>,
}

pub type PolicyConfigEntryMap = BTreeMap<String, PolicyConfigEntry>;

pub fn entry<P: Policy>(policy: &P) -> PolicyConfigEntry {
    let (expression, message) = match policy.group_verdict() {
        Some((e, m)) => (Some(e.to_string()), Some(m.to_string())),
        None => (None, None),
    };
    PolicyConfigEntry {
        url: policy.module().unwrap_or_default().to_string(),
        settings: policy.settings().cloned(),
        allowed_to_mutate: policy.is_mutating(),
        policy_mode: Some(policy.mode()),
        policies: policy
            .members()
            .map(|members| {
                members
                    .iter()
                    .map(|(name, m)| {
                        (
                            name.clone(),
                            PolicyGroupMemberEntry {
                                url: m.module.clone(),
                                settings: m.settings.clone(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default(),
        expression,
        message,
    }
}

/// Builds the configuration for a set of bound policies.
pub fn build<'a>(policies: impl IntoIterator<Item = &'a AnyPolicy>) -> PolicyConfigEntryMap {
    policies
        .into_iter()
        .map(|p| with_policy!(p, p => (p.unique_name(), entry(p))))
        .collect()
}

pub fn encode(map: &PolicyConfigEntryMap) -> Result<String, ConfigError> {
    serde_json::to_string(map).map_err(ConfigError::Encode)
}

/// Parses stored configuration. An absent value is an empty map.
pub fn decode(existing: Option<&str>) -> Result<PolicyConfigEntryMap, ConfigError> {
    match existing {
        Some(raw) => serde_json::from_str(raw).map_err(ConfigError::Decode),
        None => Ok(PolicyConfigEntryMap::new()),
    }
}

/// Whether `desired` differs structurally from the stored configuration.
pub fn should_update(existing: Option<&str>, desired: &PolicyConfigEntryMap) -> Result<bool, ConfigError> {
    Ok(decode(existing)? != *desired)
}
