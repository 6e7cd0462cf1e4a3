//! Defaulting and validation of policy resources.

use std::{fmt, marker::PhantomData, panic};

use cel_interpreter::Program;
use k8s_openapi::api::admissionregistration::v1::{MatchCondition, RuleWithOperations};
use kube::{ResourceExt, api::DynamicObject};

use super::WebhookError;
use crate::config::WebhookConfig;
use crate::crds::Policy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Converts `obj` into `P`, checking the kind it declares first.
pub fn typed<P: Policy>(obj: &DynamicObject) -> Result<P, WebhookError> {
    let expected = P::kind(&()).into_owned();
    let actual = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
    if actual != expected {
        return Err(WebhookError::UnexpectedKind { expected, actual });
    }
    let value = serde_json::to_value(obj).map_err(WebhookError::Decode)?;
    serde_json::from_value(value).map_err(WebhookError::Decode)
}

fn validate_list(field: &str, values: Option<&[String]>, errors: &mut Vec<FieldError>) {
    let values = values.unwrap_or_default();
    if values.is_empty() {
        errors.push(FieldError::new(field, "field must be non-empty"));
    } else if values.iter().any(String::is_empty) {
        errors.push(FieldError::new(field, "field value cannot contain the empty string"));
    }
}

pub fn validate_rules(rules: &[RuleWithOperations]) -> Vec<FieldError> {
    if rules.is_empty() {
        return vec![FieldError::new("spec.rules", "a value must be specified")];
    }
    let mut errors = Vec::new();
    for (i, rule) in rules.iter().enumerate() {
        validate_list(&format!("spec.rules[{i}].operations"), rule.operations.as_deref(), &mut errors);
        validate_list(&format!("spec.rules[{i}].apiGroups"), rule.api_groups.as_deref(), &mut errors);
        validate_list(&format!("spec.rules[{i}].apiVersions"), rule.api_versions.as_deref(), &mut errors);
        validate_list(&format!("spec.rules[{i}].resources"), rule.resources.as_deref(), &mut errors);
    }
    errors
}

/// The CEL parser panics on some truncated input (a trailing operator, an
/// empty string), so a panic is reported like any other compile error.
fn compile(field: String, expression: &str) -> Option<FieldError> {
    if expression.trim().is_empty() {
        return Some(FieldError::new(field, "compilation failed: empty expression"));
    }
    match panic::catch_unwind(|| Program::compile(expression).err().map(|e| e.to_string())) {
        Ok(err) => err.map(|err| FieldError::new(field, format!("compilation failed: {err}"))),
        Err(_) => Some(FieldError::new(field, "compilation failed: malformed expression")),
    }
}

pub fn validate_match_conditions(match_conditions: &[MatchCondition]) -> Vec<FieldError> {
    match_conditions
        .iter()
        .enumerate()
        .filter_map(|(i, mc)| compile(format!("spec.matchConditions[{i}].expression"), &mc.expression))
        .collect()
}

fn validate_group<P: Policy>(policy: &P) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if policy.members().is_some_and(|m| m.is_empty()) {
        errors.push(FieldError::new(
            "spec.policies",
            "policy groups must have at least one policy member",
        ));
    }
    if let Some((expression, message)) = policy.group_verdict() {
        if expression.is_empty() {
            errors.push(FieldError::new("spec.expression", "field must be non-empty"));
        } else if let Some(err) = compile("spec.expression".into(), expression) {
            errors.push(err);
        }
        if message.is_empty() {
            errors.push(FieldError::new("spec.message", "field must be non-empty"));
        }
    }
    errors
}

/// Collects every violation of a policy being created.
pub fn validate_policy<P: Policy>(policy: &P) -> Vec<FieldError> {
    let mut errors = validate_rules(policy.rules());
    errors.extend(validate_match_conditions(policy.match_conditions()));
    errors.extend(validate_group(policy));
    errors
}

/// The policy server of a policy cannot change once created.
pub fn validate_policy_server_unchanged<P: Policy>(old: &P, new: &P) -> Vec<FieldError> {
    if old.policy_server() == new.policy_server() {
        return Vec::new();
    }
    vec![FieldError::new(
        "spec.policyServer",
        "the field is immutable",
    )]
}

fn invalid<P: Policy>(policy: &P, violations: Vec<FieldError>) -> Result<(), WebhookError> {
    if violations.is_empty() {
        return Ok(());
    }
    Err(WebhookError::Invalid {
        kind: P::kind(&()).into_owned(),
        name: policy.name_any(),
        violations,
    })
}

pub struct PolicyValidator<P> {
    _kind: PhantomData<fn() -> P>,
}

impl<P: Policy> Default for PolicyValidator<P> {
    fn default() -> Self {
        Self { _kind: PhantomData }
    }
}

impl<P: Policy> PolicyValidator<P> {
    pub fn validate_create(&self, obj: &DynamicObject) -> Result<(), WebhookError> {
        let policy: P = typed(obj)?;
        invalid(&policy, validate_policy(&policy))
    }

    pub fn validate_update(&self, old: &DynamicObject, new: &DynamicObject) -> Result<(), WebhookError> {
        let new: P = typed(new)?;
        let old: P = typed(old)?;
        invalid(&new, validate_policy_server_unchanged(&old, &new))
    }

    pub fn validate_delete(&self, obj: &DynamicObject) -> Result<(), WebhookError> {
        typed::<P>(obj).map(|_| ())
    }
}

pub struct PolicyDefaulter<P> {
    config: WebhookConfig,
    _kind: PhantomData<fn() -> P>,
}

impl<P: Policy> PolicyDefaulter<P> {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            _kind: PhantomData,
        }
    }

    /// Assigns the default policy server and adds the finalizer.
    pub fn apply_defaults(&self, policy: &mut P) {
        if policy.policy_server().is_empty() {
            policy.set_policy_server(self.config.default_policy_server.clone());
        }
        if !policy.finalizers().iter().any(|f| *f == self.config.finalizer) {
            policy.finalizers_mut().push(self.config.finalizer.clone());
        }
    }

    pub fn default_object(&self, obj: &DynamicObject) -> Result<P, WebhookError> {
        let mut policy: P = typed(obj)?;
        self.apply_defaults(&mut policy);
        Ok(policy)
    }
}
