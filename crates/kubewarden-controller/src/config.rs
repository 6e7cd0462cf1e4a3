/// Finalizer put on policies and policy servers by this controller.
pub const KUBEWARDEN_FINALIZER: &str = "kubewarden.io/finalizer";
/// Finalizer used by controllers older than v1.14. Still removed on cleanup
/// so objects created before an upgrade can go away.
pub const KUBEWARDEN_FINALIZER_PRE_114: &str = "kubewarden";

pub const DEFAULT_POLICY_SERVER: &str = "default";
pub const DEFAULT_DEPLOYMENTS_NAMESPACE: &str = "kubewarden";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "kubewarden-controller";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Namespace holding every policy-server workload
    pub deployments_namespace: String,
    pub telemetry: TelemetryConfig,
    pub finalizer: String,
    pub legacy_finalizer: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            deployments_namespace: DEFAULT_DEPLOYMENTS_NAMESPACE.into(),
            telemetry: TelemetryConfig::default(),
            finalizer: KUBEWARDEN_FINALIZER.into(),
            legacy_finalizer: KUBEWARDEN_FINALIZER_PRE_114.into(),
        }
    }
}

impl ControllerConfig {
    pub fn is_owned_finalizer(&self, finalizer: &str) -> bool {
        finalizer == self.finalizer || finalizer == self.legacy_finalizer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub default_policy_server: String,
    pub finalizer: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            default_policy_server: DEFAULT_POLICY_SERVER.into(),
            finalizer: KUBEWARDEN_FINALIZER.into(),
        }
    }
}
