//! Kibosh kubehub: typed access to the clusters instances are deployed on.
//!
//! The broker never holds a `kube::Client` directly. It works against
//! [`Cluster`] handles obtained from a [`ClusterFactory`], so a plan that
//! carries its own kubeconfig gets a handle for that cluster while every
//! other plan shares the default one.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Node, Pod, Secret, Service, ServiceAccount},
    rbac::v1::ClusterRoleBinding,
};
use kibosh_core::ClusterConfig;
use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    Client,
};
use tracing::{debug, info};

pub mod factory;
pub mod fake;
pub mod registry;
pub mod service_account;

pub use factory::{ClusterFactory, KubeClusterFactory};
pub use registry::PrivateRegistrySetup;
pub use service_account::{
    ServiceAccountInstaller, ServiceAccountInstallerFactory, TillerServiceAccountInstaller,
    TillerServiceAccountInstallerFactory,
};

/// Operations the broker needs against one cluster.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Kubeconfig this handle was built from; `None` for the default cluster.
    fn cluster_config(&self) -> Option<&ClusterConfig>;

    async fn create_namespace(&self, name: &str) -> Result<()>;
    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn create_namespace_if_not_exists(&self, name: &str) -> Result<()> {
        if self.namespace_exists(name).await? {
            debug!(namespace = %name, "namespace already present");
            return Ok(());
        }
        self.create_namespace(name).await
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>>;
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;
    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    async fn create_or_update_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret.metadata.name.as_deref().ok_or_else(|| anyhow!("secret has no name"))?;
        match self.get_secret(namespace, name).await? {
            Some(_) => self.update_secret(namespace, secret).await,
            None => self.create_secret(namespace, secret).await,
        }
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>>;
    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount) -> Result<()>;
    /// JSON merge patch.
    async fn patch_service_account(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<()>;

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;
    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()>;
}

/// [`Cluster`] backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    config: Option<ClusterConfig>,
}

impl KubeCluster {
    pub fn new(client: Client, config: Option<ClusterConfig>) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn secrets(&self, ns: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), ns)
    }
}

#[async_trait::async_trait]
impl Cluster for KubeCluster {
    fn cluster_config(&self) -> Option<&ClusterConfig> {
        self.config.as_ref()
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        };
        self.namespaces()
            .create(&PostParams::default(), &ns)
            .await
            .with_context(|| format!("creating namespace {}", name))?;
        info!(namespace = %name, "namespace created");
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let found = self.namespaces().get_opt(name).await.with_context(|| format!("reading namespace {}", name))?;
        Ok(found.is_some())
    }

    async fn create_namespace_if_not_exists(&self, name: &str) -> Result<()> {
        if self.namespace_exists(name).await? {
            return Ok(());
        }
        match self.create_namespace(name).await {
            Ok(()) => Ok(()),
            Err(e) => match e.downcast_ref::<kube::Error>() {
                // lost a race with a concurrent request for the same instance
                Some(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                _ => Err(e),
            },
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let _ = self
            .namespaces()
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("deleting namespace {}", name))?;
        info!(namespace = %name, "namespace delete requested");
        Ok(())
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        let list = self
            .secrets(namespace)
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing secrets in {}", namespace))?;
        Ok(list.items)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.secrets(namespace).get_opt(name).await.with_context(|| format!("reading secret {}/{}", namespace, name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let _ = self
            .secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
            .with_context(|| format!("creating secret in {}", namespace))?;
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret.metadata.name.as_deref().ok_or_else(|| anyhow!("secret has no name"))?;
        let _ = self
            .secrets(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
            .with_context(|| format!("updating secret {}/{}", namespace, name))?;
        Ok(())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await.with_context(|| format!("listing services in {}", namespace))?;
        Ok(list.items)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await.context("listing nodes")?;
        Ok(list.items)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await.with_context(|| format!("listing pods in {}", namespace))?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("reading deployment {}/{}", namespace, name))
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.with_context(|| format!("reading service account {}/{}", namespace, name))
    }

    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let _ = api
            .create(&PostParams::default(), account)
            .await
            .with_context(|| format!("creating service account in {}", namespace))?;
        Ok(())
    }

    async fn patch_service_account(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let _ = api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .with_context(|| format!("patching service account {}/{}", namespace, name))?;
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        api.get_opt(name).await.with_context(|| format!("reading cluster role binding {}", name))
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let _ = api
            .create(&PostParams::default(), binding)
            .await
            .context("creating cluster role binding")?;
        Ok(())
    }
}
