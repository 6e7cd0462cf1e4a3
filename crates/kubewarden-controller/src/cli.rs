use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, ValueEnum};

use crate::config::{
    ControllerConfig, DEFAULT_DEPLOYMENTS_NAMESPACE, DEFAULT_POLICY_SERVER, KUBEWARDEN_FINALIZER,
    KUBEWARDEN_FINALIZER_PRE_114, TelemetryConfig, WebhookConfig,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "kubewarden-controller", about = "Reconciles Kubewarden policy servers and policies")]
pub struct Args {
    /// Namespace where policy-server workloads are deployed
    #[arg(long, env = "KUBEWARDEN_DEPLOYMENTS_NAMESPACE", default_value = DEFAULT_DEPLOYMENTS_NAMESPACE)]
    pub deployments_namespace: String,

    /// Policy server assigned to policies that do not name one
    #[arg(long, env = "KUBEWARDEN_DEFAULT_POLICY_SERVER", default_value = DEFAULT_POLICY_SERVER)]
    pub default_policy_server: String,

    #[arg(long, env = "KUBEWARDEN_WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    pub webhook_addr: SocketAddr,

    #[arg(long, env = "KUBEWARDEN_TLS_CERT_FILE", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.crt")]
    pub tls_cert_file: PathBuf,

    #[arg(long, env = "KUBEWARDEN_TLS_KEY_FILE", default_value = "/tmp/k8s-webhook-server/serving-certs/tls.key")]
    pub tls_key_file: PathBuf,

    #[arg(long, env = "KUBEWARDEN_ENABLE_METRICS")]
    pub enable_metrics: bool,

    #[arg(long, env = "KUBEWARDEN_ENABLE_TRACING")]
    pub enable_tracing: bool,

    #[arg(long, env = "KUBEWARDEN_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Args {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            deployments_namespace: self.deployments_namespace.clone(),
            telemetry: TelemetryConfig {
                metrics_enabled: self.enable_metrics,
                tracing_enabled: self.enable_tracing,
            },
            finalizer: KUBEWARDEN_FINALIZER.into(),
            legacy_finalizer: KUBEWARDEN_FINALIZER_PRE_114.into(),
        }
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            default_policy_server: self.default_policy_server.clone(),
            finalizer: KUBEWARDEN_FINALIZER.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_defaults() {
        let args = Args::try_parse_from(["kubewarden-controller"]).unwrap();
        assert_eq!(args.controller_config(), ControllerConfig::default());
        assert_eq!(args.webhook_config(), WebhookConfig::default());
        assert_eq!(args.log_format, LogFormat::Text);
    }

    #[test]
    fn flags_flow_into_configs() {
        let args = Args::try_parse_from([
            "kubewarden-controller",
            "--deployments-namespace",
            "policies",
            "--default-policy-server",
            "main",
            "--enable-metrics",
            "--log-format",
            "json",
        ])
        .unwrap();
        let controller = args.controller_config();
        assert_eq!(controller.deployments_namespace, "policies");
        assert!(controller.telemetry.metrics_enabled);
        assert!(!controller.telemetry.tracing_enabled);
        assert_eq!(args.webhook_config().default_policy_server, "main");
        assert_eq!(args.log_format, LogFormat::Json);
    }
}
