//! Service account and cluster-admin binding the engine server runs under.

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::{
    core::v1::ServiceAccount,
    rbac::v1::{ClusterRoleBinding, RoleRef, Subject},
};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::Cluster;

pub const TILLER_SERVICE_ACCOUNT: &str = "tiller";
pub const TILLER_ROLE_BINDING: &str = "tiller-cluster-admin";

#[async_trait::async_trait]
pub trait ServiceAccountInstaller: Send + Sync {
    /// Idempotent: objects that already exist are left as they are.
    async fn install(&self) -> Result<()>;
}

pub trait ServiceAccountInstallerFactory: Send + Sync {
    fn installer(&self, cluster: Arc<dyn Cluster>) -> Box<dyn ServiceAccountInstaller>;
}

pub struct TillerServiceAccountInstaller {
    cluster: Arc<dyn Cluster>,
    namespace: String,
}

impl TillerServiceAccountInstaller {
    pub fn new(cluster: Arc<dyn Cluster>, namespace: impl Into<String>) -> Self {
        Self { cluster, namespace: namespace.into() }
    }

    fn service_account(&self) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(TILLER_SERVICE_ACCOUNT.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn role_binding(&self) -> ClusterRoleBinding {
        ClusterRoleBinding {
            metadata: ObjectMeta { name: Some(TILLER_ROLE_BINDING.to_string()), ..Default::default() },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "cluster-admin".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: TILLER_SERVICE_ACCOUNT.to_string(),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            }]),
        }
    }
}

#[async_trait::async_trait]
impl ServiceAccountInstaller for TillerServiceAccountInstaller {
    async fn install(&self) -> Result<()> {
        let ns = self.namespace.as_str();
        if self.cluster.get_service_account(ns, TILLER_SERVICE_ACCOUNT).await?.is_none() {
            self.cluster
                .create_service_account(ns, &self.service_account())
                .await
                .context("creating tiller service account")?;
            info!(namespace = %ns, "tiller service account created");
        } else {
            debug!(namespace = %ns, "tiller service account present");
        }

        if self.cluster.get_cluster_role_binding(TILLER_ROLE_BINDING).await?.is_none() {
            self.cluster
                .create_cluster_role_binding(&self.role_binding())
                .await
                .context("creating tiller cluster role binding")?;
            info!(binding = TILLER_ROLE_BINDING, "tiller cluster role binding created");
        }
        Ok(())
    }
}

pub struct TillerServiceAccountInstallerFactory {
    namespace: String,
}

impl TillerServiceAccountInstallerFactory {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }
}

impl ServiceAccountInstallerFactory for TillerServiceAccountInstallerFactory {
    fn installer(&self, cluster: Arc<dyn Cluster>) -> Box<dyn ServiceAccountInstaller> {
        Box::new(TillerServiceAccountInstaller::new(cluster, self.namespace.clone()))
    }
}
