use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use futures::StreamExt;
use kube::Client;
use kubewarden_controller::{
    cli::{Args, LogFormat},
    crds::{
        AdmissionPolicy, AdmissionPolicyGroup, ClusterAdmissionPolicy, ClusterAdmissionPolicyGroup,
        Policy,
    },
    index::PolicyIndex,
    policy_controller as pol,
    policy_server_controller::{self as srv, Ctx},
    store::KubeStore,
    webhook::{WebhookState, webhook_router},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

async fn run_policy_controller<P: Policy>(client: Client, ctx: Arc<Ctx<KubeStore>>) {
    pol::controller::<P>(client)
        .run(pol::reconcile::<P, KubeStore>, pol::error_policy::<P, KubeStore>, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(kind = %P::kind(&()), error = ?e, "policy reconcile error");
            }
        })
        .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }

    info!(namespace = %args.deployments_namespace, "kubewarden-controller starting up");

    let client = Client::try_default().await?;
    let config = args.controller_config();
    let ctx = Arc::new(Ctx {
        store: KubeStore::new(client.clone()),
        index: PolicyIndex::new(),
        config: config.clone(),
    });

    // Policy server controller
    let server_controller = srv::controller(client.clone(), &config, &ctx.index)
        .run(srv::reconcile::<KubeStore>, srv::error_policy::<KubeStore>, ctx.clone())
        .for_each(|res| async move {
            if let Err(e) = res {
                warn!(error = ?e, "policy server reconcile error");
            }
        });

    // Policy controllers, one per kind
    let policy_controllers = futures::future::join4(
        run_policy_controller::<ClusterAdmissionPolicy>(client.clone(), ctx.clone()),
        run_policy_controller::<AdmissionPolicy>(client.clone(), ctx.clone()),
        run_policy_controller::<AdmissionPolicyGroup>(client.clone(), ctx.clone()),
        run_policy_controller::<ClusterAdmissionPolicyGroup>(client, ctx),
    );

    // Admission webhooks
    let tls_config = RustlsConfig::from_pem_file(&args.tls_cert_file, &args.tls_key_file).await?;
    let router = webhook_router(Arc::new(WebhookState::new(args.webhook_config())));
    info!(addr = %args.webhook_addr, "starting webhook server");
    let webhook_server = axum_server::bind_rustls(args.webhook_addr, tls_config)
        .serve(router.into_make_service());

    tokio::select! {
        _ = server_controller => {},
        _ = policy_controllers => {},
        res = webhook_server => {
            if let Err(e) = res {
                error!(error = %e, "webhook server error");
            }
        },
        _ = tokio::signal::ctrl_c() => { info!("shutdown signal received"); }
    }
    Ok(())
}
