//! Picks the cluster an instance lives on.

use std::sync::Arc;

use kibosh_core::Plan;
use kibosh_kubehub::{Cluster, ClusterFactory};
use tracing::debug;

use crate::{BrokerError, BrokerResult};

/// Plans with an embedded kubeconfig get a handle for that cluster, everything
/// else the default one. Nothing is cached between calls.
#[derive(Clone)]
pub struct ClusterResolver {
    factory: Arc<dyn ClusterFactory>,
}

impl ClusterResolver {
    pub fn new(factory: Arc<dyn ClusterFactory>) -> Self {
        Self { factory }
    }

    pub async fn resolve(&self, plan: Option<&Plan>) -> BrokerResult<Arc<dyn Cluster>> {
        match plan.and_then(|p| p.cluster_config.as_ref()) {
            Some(cfg) => {
                let selected = cfg.select_current().map_err(|e| BrokerError::Config(e.to_string()))?;
                debug!(context = %selected.context, server = %selected.cluster.server, "using plan cluster");
                self.factory.cluster_from_config(cfg).await.map_err(BrokerError::transport)
            }
            None => self.factory.default_cluster().map_err(BrokerError::transport),
        }
    }
}
