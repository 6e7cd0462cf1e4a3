//! Admission webhooks for the policy resources.
//!
//! Each policy kind gets a mutating endpoint that fills in defaults and a
//! validating endpoint that rejects malformed policies before they are
//! stored. Paths follow the `/{mutate,validate}-<group>-<version>-<kind>`
//! convention used in the webhook configurations.

pub mod validation;

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::post};
use kube::{
    ResourceExt,
    api::DynamicObject,
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::WebhookConfig;
use crate::crds::{
    AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
    Policy,
};
use validation::{FieldError, PolicyDefaulter, PolicyValidator};

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("expected {expected} object, got {actual}")]
    UnexpectedKind { expected: String, actual: String },
    #[error("{kind} {name:?} is invalid: {}", format_violations(.violations))]
    Invalid {
        kind: String,
        name: String,
        violations: Vec<FieldError>,
    },
    #[error("cannot decode object: {0}")]
    Decode(#[source] serde_json::Error),
}

fn format_violations(violations: &[FieldError]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    pub config: WebhookConfig,
}

impl WebhookState {
    pub fn new(config: WebhookConfig) -> Self {
        Self { config }
    }
}

fn webhook_path(action: &str, kind: &str) -> String {
    format!("/{action}-policies-kubewarden-io-v1-{}", kind.to_lowercase())
}

fn with_policy_routes<P: Policy>(router: Router<Arc<WebhookState>>) -> Router<Arc<WebhookState>> {
    let kind = P::kind(&());
    router
        .route(&webhook_path("mutate", &kind), post(mutate_handler::<P>))
        .route(&webhook_path("validate", &kind), post(validate_handler::<P>))
}

pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    let router = Router::new();
    let router = with_policy_routes::<AdmissionPolicy>(router);
    let router = with_policy_routes::<ClusterAdmissionPolicy>(router);
    let router = with_policy_routes::<AdmissionPolicyGroup>(router);
    let router = with_policy_routes::<ClusterAdmissionPolicyGroup>(router);
    router.with_state(state)
}

fn into_request(review: AdmissionReview<DynamicObject>) -> Result<AdmissionRequest<DynamicObject>, AdmissionResponse> {
    let request: Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
    request.map_err(|e| {
        error!(error = %e, "failed to parse admission request");
        AdmissionResponse::invalid(e.to_string())
    })
}

pub async fn mutate_handler<P: Policy>(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(req) => mutate::<P>(&PolicyDefaulter::new(state.config.clone()), &req),
        Err(response) => response,
    };
    Json(response.into_review())
}

pub async fn validate_handler<P: Policy>(
    State(_state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let response = match into_request(review) {
        Ok(req) => validate::<P>(&PolicyValidator::default(), &req),
        Err(response) => response,
    };
    Json(response.into_review())
}

/// Patch touching only the fields defaulting owns, so unknown fields of the
/// submitted object are left alone.
fn defaults_patch<P: Policy>(original: &DynamicObject, defaulted: &P) -> Result<json_patch::Patch, serde_json::Error> {
    let before = serde_json::to_value(original)?;
    let mut after = before.clone();
    after["spec"]["policyServer"] = Value::String(defaulted.policy_server().to_string());
    after["metadata"]["finalizers"] = serde_json::to_value(defaulted.finalizers())?;
    Ok(json_patch::diff(&before, &after))
}

fn mutate<P: Policy>(defaulter: &PolicyDefaulter<P>, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let Some(obj) = &req.object else {
        return response;
    };
    let defaulted = match defaulter.default_object(obj) {
        Ok(policy) => policy,
        Err(err) => return response.deny(err.to_string()),
    };
    debug!(uid = %req.uid, kind = %P::kind(&()), name = %defaulted.name_any(), "defaulting policy");
    let patch = match defaults_patch(obj, &defaulted) {
        Ok(patch) => patch,
        Err(err) => return response.deny(format!("patch serialization error: {err}")),
    };
    if patch.0.is_empty() {
        return response;
    }
    match response.with_patch(patch) {
        Ok(response) => response,
        Err(err) => {
            error!(uid = %req.uid, error = %err, "failed to serialize patch");
            AdmissionResponse::from(req).deny(format!("patch serialization error: {err}"))
        }
    }
}

fn validate<P: Policy>(validator: &PolicyValidator<P>, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let response = AdmissionResponse::from(req);
    let missing = || WebhookError::UnexpectedKind {
        expected: P::kind(&()).into_owned(),
        actual: String::new(),
    };
    let result = match req.operation {
        Operation::Create => req
            .object
            .as_ref()
            .ok_or_else(missing)
            .and_then(|obj| validator.validate_create(obj)),
        Operation::Update => match (&req.old_object, &req.object) {
            (Some(old), Some(new)) => validator.validate_update(old, new),
            _ => Err(missing()),
        },
        Operation::Delete => req
            .old_object
            .as_ref()
            .ok_or_else(missing)
            .and_then(|obj| validator.validate_delete(obj)),
        Operation::Connect => Ok(()),
    };
    match result {
        Ok(()) => response,
        Err(err) => {
            info!(uid = %req.uid, kind = %P::kind(&()), name = %req.name, error = %err, "policy rejected");
            response.deny(err.to_string())
        }
    }
}
