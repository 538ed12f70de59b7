//! In-memory [`Cluster`] and [`ClusterFactory`] for tests.
//!
//! Every trait call is counted by method name; any method can be told to
//! fail so error paths are reachable without a live cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use anyhow::{anyhow, Result};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Node, Pod, Secret, Service, ServiceAccount},
    rbac::v1::ClusterRoleBinding,
};
use kibosh_core::ClusterConfig;

use crate::{Cluster, ClusterFactory, ServiceAccountInstaller, ServiceAccountInstallerFactory};

#[derive(Default)]
struct State {
    namespaces: BTreeSet<String>,
    secrets: Vec<(String, Secret)>,
    services: Vec<(String, Service)>,
    pods: Vec<(String, Pod)>,
    nodes: Vec<Node>,
    deployments: BTreeMap<(String, String), Deployment>,
    service_accounts: BTreeMap<(String, String), ServiceAccount>,
    role_bindings: BTreeMap<String, ClusterRoleBinding>,
    sa_patches: Vec<(String, String, serde_json::Value)>,
    calls: BTreeMap<&'static str, usize>,
    failing: BTreeSet<&'static str>,
}

#[derive(Default)]
pub struct FakeCluster {
    config: OnceLock<ClusterConfig>,
    state: Mutex<State>,
}

fn name_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

impl FakeCluster {
    pub fn with_config(config: ClusterConfig) -> Self {
        let c = Self::default();
        let _ = c.config.set(config);
        c
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn hit(&self, method: &'static str) -> Result<MutexGuard<'_, State>> {
        let mut st = self.lock();
        *st.calls.entry(method).or_default() += 1;
        if st.failing.contains(method) {
            return Err(anyhow!("{} failed", method));
        }
        Ok(st)
    }

    /// Make every later call of `method` return an error.
    pub fn fail_on(&self, method: &'static str) {
        self.lock().failing.insert(method);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    /// Calls that changed cluster state.
    pub fn mutating_calls(&self) -> usize {
        const MUTATING: [&str; 7] = [
            "create_namespace",
            "delete_namespace",
            "create_secret",
            "update_secret",
            "create_service_account",
            "patch_service_account",
            "create_cluster_role_binding",
        ];
        MUTATING.iter().map(|m| self.calls(m)).sum()
    }

    pub fn add_namespace(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains(name)
    }

    pub fn add_secret(&self, namespace: &str, secret: Secret) {
        self.lock().secrets.push((namespace.to_string(), secret));
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock()
            .secrets
            .iter()
            .find(|(ns, s)| ns == namespace && name_of(&s.metadata) == name)
            .map(|(_, s)| s.clone())
    }

    pub fn add_service(&self, namespace: &str, service: Service) {
        self.lock().services.push((namespace.to_string(), service));
    }

    pub fn add_pod(&self, namespace: &str, pod: Pod) {
        self.lock().pods.push((namespace.to_string(), pod));
    }

    pub fn add_node(&self, node: Node) {
        self.lock().nodes.push(node);
    }

    pub fn add_deployment(&self, namespace: &str, deployment: Deployment) {
        let key = (namespace.to_string(), name_of(&deployment.metadata).to_string());
        self.lock().deployments.insert(key, deployment);
    }

    pub fn add_service_account(&self, namespace: &str, account: ServiceAccount) {
        let key = (namespace.to_string(), name_of(&account.metadata).to_string());
        self.lock().service_accounts.insert(key, account);
    }

    pub fn cluster_role_binding(&self, name: &str) -> Option<ClusterRoleBinding> {
        self.lock().role_bindings.get(name).cloned()
    }

    /// `(namespace, account, patch)` in call order.
    pub fn service_account_patches(&self) -> Vec<(String, String, serde_json::Value)> {
        self.lock().sa_patches.clone()
    }
}

#[async_trait::async_trait]
impl Cluster for FakeCluster {
    fn cluster_config(&self) -> Option<&ClusterConfig> {
        self.config.get()
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut st = self.hit("create_namespace")?;
        if !st.namespaces.insert(name.to_string()) {
            return Err(anyhow!("namespace {} already exists", name));
        }
        Ok(())
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let st = self.hit("namespace_exists")?;
        Ok(st.namespaces.contains(name))
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut st = self.hit("delete_namespace")?;
        if !st.namespaces.remove(name) {
            return Err(anyhow!("namespace {} not found", name));
        }
        Ok(())
    }

    async fn list_secrets(&self, namespace: &str) -> Result<Vec<Secret>> {
        let st = self.hit("list_secrets")?;
        Ok(st.secrets.iter().filter(|(ns, _)| ns == namespace).map(|(_, s)| s.clone()).collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let st = self.hit("get_secret")?;
        Ok(st
            .secrets
            .iter()
            .find(|(ns, s)| ns == namespace && name_of(&s.metadata) == name)
            .map(|(_, s)| s.clone()))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let mut st = self.hit("create_secret")?;
        st.secrets.push((namespace.to_string(), secret.clone()));
        Ok(())
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let mut st = self.hit("update_secret")?;
        let name = name_of(&secret.metadata).to_string();
        let slot = st
            .secrets
            .iter_mut()
            .find(|(ns, s)| ns == namespace && name_of(&s.metadata) == name)
            .ok_or_else(|| anyhow!("secret {}/{} not found", namespace, name))?;
        slot.1 = secret.clone();
        Ok(())
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let st = self.hit("list_services")?;
        Ok(st.services.iter().filter(|(ns, _)| ns == namespace).map(|(_, s)| s.clone()).collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let st = self.hit("list_nodes")?;
        Ok(st.nodes.clone())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let st = self.hit("list_pods")?;
        Ok(st.pods.iter().filter(|(ns, _)| ns == namespace).map(|(_, p)| p.clone()).collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        let st = self.hit("get_deployment")?;
        Ok(st.deployments.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn get_service_account(&self, namespace: &str, name: &str) -> Result<Option<ServiceAccount>> {
        let st = self.hit("get_service_account")?;
        Ok(st.service_accounts.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_service_account(&self, namespace: &str, account: &ServiceAccount) -> Result<()> {
        let mut st = self.hit("create_service_account")?;
        let key = (namespace.to_string(), name_of(&account.metadata).to_string());
        st.service_accounts.insert(key, account.clone());
        Ok(())
    }

    async fn patch_service_account(&self, namespace: &str, name: &str, patch: &serde_json::Value) -> Result<()> {
        let mut st = self.hit("patch_service_account")?;
        st.sa_patches.push((namespace.to_string(), name.to_string(), patch.clone()));
        Ok(())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let st = self.hit("get_cluster_role_binding")?;
        Ok(st.role_bindings.get(name).cloned())
    }

    async fn create_cluster_role_binding(&self, binding: &ClusterRoleBinding) -> Result<()> {
        let mut st = self.hit("create_cluster_role_binding")?;
        st.role_bindings.insert(name_of(&binding.metadata).to_string(), binding.clone());
        Ok(())
    }
}

/// Hands out one shared default cluster and one shared plan cluster,
/// recording every config it is asked to build from.
pub struct FakeClusterFactory {
    default: Arc<FakeCluster>,
    plan: Arc<FakeCluster>,
    configs: Mutex<Vec<ClusterConfig>>,
    default_calls: Mutex<usize>,
    fail_from_config: bool,
}

impl FakeClusterFactory {
    pub fn new(default: Arc<FakeCluster>) -> Self {
        Self {
            default,
            plan: Arc::new(FakeCluster::default()),
            configs: Mutex::new(Vec::new()),
            default_calls: Mutex::new(0),
            fail_from_config: false,
        }
    }

    pub fn with_plan_cluster(mut self, plan: Arc<FakeCluster>) -> Self {
        self.plan = plan;
        self
    }

    pub fn failing_from_config(mut self) -> Self {
        self.fail_from_config = true;
        self
    }

    pub fn default_fake(&self) -> Arc<FakeCluster> {
        self.default.clone()
    }

    pub fn plan_fake(&self) -> Arc<FakeCluster> {
        self.plan.clone()
    }

    pub fn configs(&self) -> Vec<ClusterConfig> {
        self.configs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn default_calls(&self) -> usize {
        *self.default_calls.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl ClusterFactory for FakeClusterFactory {
    fn default_cluster(&self) -> Result<Arc<dyn Cluster>> {
        *self.default_calls.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(self.default.clone())
    }

    async fn cluster_from_config(&self, config: &ClusterConfig) -> Result<Arc<dyn Cluster>> {
        self.configs.lock().unwrap_or_else(|p| p.into_inner()).push(config.clone());
        if self.fail_from_config {
            return Err(anyhow!("cluster unreachable"));
        }
        let _ = self.plan.config.set(config.clone());
        Ok(self.plan.clone())
    }
}

/// Counts installs; every installer handed out shares the counter.
#[derive(Default)]
pub struct FakeServiceAccountInstaller {
    installs: Mutex<usize>,
}

impl FakeServiceAccountInstaller {
    pub fn installs(&self) -> usize {
        *self.installs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

struct SharedServiceAccountInstaller(Arc<FakeServiceAccountInstaller>);

#[async_trait::async_trait]
impl ServiceAccountInstaller for SharedServiceAccountInstaller {
    async fn install(&self) -> Result<()> {
        *self.0.installs.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}

pub struct FakeServiceAccountInstallerFactory {
    installer: Arc<FakeServiceAccountInstaller>,
}

impl FakeServiceAccountInstallerFactory {
    pub fn new(installer: Arc<FakeServiceAccountInstaller>) -> Self {
        Self { installer }
    }
}

impl ServiceAccountInstallerFactory for FakeServiceAccountInstallerFactory {
    fn installer(&self, _cluster: Arc<dyn Cluster>) -> Box<dyn ServiceAccountInstaller> {
        Box::new(SharedServiceAccountInstaller(self.installer.clone()))
    }
}
