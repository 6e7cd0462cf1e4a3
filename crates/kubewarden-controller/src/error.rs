use thiserror::Error;

use crate::{policy_config::ConfigError, store::StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{context}: {source}")]
    Store {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not remove all policies bound to policy server {policy_server}: {}", format_errors(.errors))]
    PolicyCleanup {
        policy_server: String,
        errors: Vec<StoreError>,
    },
    #[error("cannot generate policy server certificate: {0}")]
    Certificate(#[from] rcgen::Error),
}

impl ReconcileError {
    /// Wraps a store error with what the controller was doing.
    pub fn store(context: impl Into<String>) -> impl FnOnce(StoreError) -> Self {
        let context = context.into();
        move |source| Self::Store { context, source }
    }
}

fn format_errors(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
