//! Vault operator entry point
//!
//! Starts the VaultService controller and the metrics endpoint.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};
use vault_k8s::config::{LogFormat, OperatorConfig};
use vault_k8s::controller::{self, Context, HttpsHealthProbe, KubeResourceApi};
use vault_k8s::Error;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = OperatorConfig::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = match config.log_format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = vault_k8s::telemetry::init_telemetry(&registry, config.trace_sample_ratio)?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }

    info!(
        git_sha = env!("GIT_SHA"),
        build_date = env!("BUILD_DATE"),
        "Starting Vault operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    #[cfg(feature = "metrics")]
    {
        let addr = config.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = vault_k8s::server::run_server(addr).await {
                tracing::error!("Metrics server error: {:?}", e);
            }
        });
    }

    let probe = HttpsHealthProbe::new(config.health_timeout());
    let ctx = Arc::new(Context::new(
        KubeResourceApi::new(client.clone()),
        probe,
        config,
    ));

    let result = controller::run_controller(client, ctx).await;

    // Flush any remaining traces
    vault_k8s::telemetry::shutdown_telemetry();

    result
}
