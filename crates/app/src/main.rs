use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use kibosh_broker::{Broker, ServiceBroker};
use kibosh_helm::{DirChartRepository, HelmCliFactory, HelmClientFactory, InstallerFactory, TillerInstallerFactory};
use kibosh_kubehub::{ClusterFactory, KubeClusterFactory, ServiceAccountInstallerFactory, TillerServiceAccountInstallerFactory};
use tracing::{info, warn};

mod config;
mod router;

use config::Settings;
use router::{build_router, AdminCredentials};

fn init_tracing() {
    let env = std::env::var("KIBOSH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KIBOSH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KIBOSH_METRICS_ADDR; expected host:port");
        }
    }
}

/// Tiller and its service account on the default cluster.
async fn bootstrap(
    clusters: &dyn ClusterFactory,
    service_accounts: &dyn ServiceAccountInstallerFactory,
    helm: &dyn HelmClientFactory,
    installers: &dyn InstallerFactory,
) -> Result<()> {
    let t0 = Instant::now();
    let cluster = clusters.default_cluster()?;
    service_accounts.installer(cluster.clone()).install().await.context("installing tiller service account")?;
    installers.installer(cluster.clone(), helm.client(cluster)).install().await.context("installing tiller")?;
    info!(took_ms = %t0.elapsed().as_millis(), "default cluster bootstrapped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let settings = Settings::parse();
    let broker_config = settings.broker_config();

    let clusters = Arc::new(KubeClusterFactory::try_default().await?);
    let service_accounts = Arc::new(TillerServiceAccountInstallerFactory::new(broker_config.tiller_namespace.clone()));
    let helm = Arc::new(HelmCliFactory::new(broker_config.clone()));
    let installers = Arc::new(TillerInstallerFactory::new(broker_config.clone()));

    if settings.skip_bootstrap {
        info!("skipping default cluster bootstrap");
    } else {
        bootstrap(clusters.as_ref(), service_accounts.as_ref(), helm.as_ref(), installers.as_ref()).await?;
    }

    let charts = Arc::new(DirChartRepository::new(
        settings.chart_dir.clone(),
        broker_config.registry.as_ref().map(|r| r.server.clone()),
    ));
    let broker: Arc<dyn ServiceBroker> =
        Arc::new(Broker::new(broker_config, charts, clusters, helm, service_accounts, installers));
    let app = build_router(
        broker,
        AdminCredentials { user: settings.admin_user.clone(), password: settings.admin_password.clone() },
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, chart_dir = %settings.chart_dir.display(), "kibosh listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("serving http")?;
    Ok(())
}
