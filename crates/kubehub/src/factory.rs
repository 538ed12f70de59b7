//! Building cluster handles: the process-wide default and per-plan ones.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use kibosh_core::ClusterConfig;
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use metrics::{counter, histogram};
use tracing::info;

use crate::{Cluster, KubeCluster};

#[async_trait::async_trait]
pub trait ClusterFactory: Send + Sync {
    /// Handle for the cluster the broker itself runs against.
    fn default_cluster(&self) -> Result<Arc<dyn Cluster>>;
    /// Fresh handle for an embedded kubeconfig. Nothing is cached.
    async fn cluster_from_config(&self, config: &ClusterConfig) -> Result<Arc<dyn Cluster>>;
}

pub struct KubeClusterFactory {
    default: Arc<dyn Cluster>,
}

impl KubeClusterFactory {
    /// Default cluster from the ambient environment (in-cluster or `~/.kube/config`).
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building default kube client")?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self { default: Arc::new(KubeCluster::new(client, None)) }
    }
}

#[async_trait::async_trait]
impl ClusterFactory for KubeClusterFactory {
    fn default_cluster(&self) -> Result<Arc<dyn Cluster>> {
        Ok(self.default.clone())
    }

    async fn cluster_from_config(&self, config: &ClusterConfig) -> Result<Arc<dyn Cluster>> {
        let t0 = Instant::now();
        let yaml = config.to_kubeconfig_yaml()?;
        let kubeconfig = Kubeconfig::from_yaml(&yaml).context("parsing plan kubeconfig")?;
        let kube_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("loading plan kubeconfig")?;
        let client = Client::try_from(kube_config).context("building plan kube client")?;
        counter!("cluster_from_config_total", 1u64);
        histogram!("cluster_from_config_ms", t0.elapsed().as_millis() as f64);
        info!(context = ?config.current_context, took_ms = %t0.elapsed().as_millis(), "cluster handle built from plan config");
        Ok(Arc::new(KubeCluster::new(client, Some(config.clone()))))
    }
}
