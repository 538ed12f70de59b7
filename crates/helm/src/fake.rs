//! Recording doubles for the engine seams.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use kibosh_core::{Chart, ClusterConfig};
use kibosh_kubehub::Cluster;

use crate::{
    ChartRepository, HelmClient, HelmClientFactory, Installer, InstallerFactory, ReleaseStatusInfo, ServerInstall,
    ServerOptions,
};

/// One install or upgrade as the engine received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartCall {
    pub namespace: Option<String>,
    pub release: String,
    pub chart: String,
    /// Empty for an upgrade that keeps the previous plan.
    pub plan: String,
    pub overrides: Vec<u8>,
}

#[derive(Default)]
struct State {
    calls: BTreeMap<&'static str, usize>,
    failing: BTreeSet<&'static str>,
    server_present: bool,
    tls_differs: bool,
    server_installs: Vec<ServerOptions>,
    installs: Vec<ChartCall>,
    upgrades: Vec<ChartCall>,
    deletes: Vec<String>,
    statuses: BTreeMap<String, ReleaseStatusInfo>,
}

#[derive(Default)]
pub struct FakeHelmClient {
    state: Mutex<State>,
}

impl FakeHelmClient {
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

    pub fn fail_on(&self, method: &'static str) {
        self.lock().failing.insert(method);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    pub fn set_server_present(&self, present: bool) {
        self.lock().server_present = present;
    }

    pub fn set_tls_differs(&self, differs: bool) {
        self.lock().tls_differs = differs;
    }

    pub fn set_status(&self, release: &str, info: ReleaseStatusInfo) {
        self.lock().statuses.insert(release.to_string(), info);
    }

    pub fn server_installs(&self) -> Vec<ServerOptions> {
        self.lock().server_installs.clone()
    }

    pub fn installs(&self) -> Vec<ChartCall> {
        self.lock().installs.clone()
    }

    pub fn upgrades(&self) -> Vec<ChartCall> {
        self.lock().upgrades.clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.lock().deletes.clone()
    }
}

#[async_trait::async_trait]
impl HelmClient for FakeHelmClient {
    async fn install_chart(&self, namespace: &str, release: &str, chart: &Chart, plan: &str, overrides: &[u8]) -> Result<()> {
        let mut st = self.hit("install_chart")?;
        st.installs.push(ChartCall {
            namespace: Some(namespace.to_string()),
            release: release.to_string(),
            chart: chart.name.clone(),
            plan: plan.to_string(),
            overrides: overrides.to_vec(),
        });
        Ok(())
    }

    async fn upgrade_chart(&self, release: &str, chart: &Chart, plan: Option<&str>, overrides: &[u8]) -> Result<()> {
        let mut st = self.hit("upgrade_chart")?;
        st.upgrades.push(ChartCall {
            namespace: None,
            release: release.to_string(),
            chart: chart.name.clone(),
            plan: plan.unwrap_or_default().to_string(),
            overrides: overrides.to_vec(),
        });
        Ok(())
    }

    async fn delete_release(&self, release: &str) -> Result<()> {
        let mut st = self.hit("delete_release")?;
        st.deletes.push(release.to_string());
        Ok(())
    }

    async fn release_status(&self, release: &str) -> Result<ReleaseStatusInfo> {
        let st = self.hit("release_status")?;
        st.statuses
            .get(release)
            .cloned()
            .ok_or_else(|| anyhow!("release: {:?} not found", release))
    }

    async fn list_releases(&self) -> Result<Vec<String>> {
        let st = self.hit("list_releases")?;
        Ok(st.statuses.keys().cloned().collect())
    }

    async fn install(&self, opts: &ServerOptions) -> Result<ServerInstall> {
        let mut st = self.hit("install")?;
        st.server_installs.push(opts.clone());
        if st.server_present {
            return Ok(ServerInstall::AlreadyExists);
        }
        st.server_present = true;
        Ok(ServerInstall::Installed)
    }

    async fn upgrade(&self, _opts: &ServerOptions) -> Result<()> {
        let _st = self.hit("upgrade")?;
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let mut st = self.hit("uninstall")?;
        st.server_present = false;
        Ok(())
    }

    async fn has_different_tls_config(&self) -> Result<bool> {
        let st = self.hit("has_different_tls_config")?;
        Ok(st.tls_differs)
    }
}

/// Hands out one shared [`FakeHelmClient`] and remembers which cluster
/// config each client was bound to (`None` for the default cluster).
pub struct FakeHelmClientFactory {
    client: Arc<FakeHelmClient>,
    bound: Mutex<Vec<Option<ClusterConfig>>>,
}

impl FakeHelmClientFactory {
    pub fn new(client: Arc<FakeHelmClient>) -> Self {
        Self { client, bound: Mutex::new(Vec::new()) }
    }

    pub fn bound_configs(&self) -> Vec<Option<ClusterConfig>> {
        self.bound.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl HelmClientFactory for FakeHelmClientFactory {
    fn client(&self, cluster: Arc<dyn Cluster>) -> Arc<dyn HelmClient> {
        self.bound.lock().unwrap_or_else(|p| p.into_inner()).push(cluster.cluster_config().cloned());
        self.client.clone()
    }
}

#[derive(Default)]
pub struct FakeInstaller {
    installs: Mutex<usize>,
    fail: bool,
}

impl FakeInstaller {
    pub fn failing() -> Self {
        Self { installs: Mutex::new(0), fail: true }
    }

    pub fn installs(&self) -> usize {
        *self.installs.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl Installer for FakeInstaller {
    async fn install(&self) -> Result<()> {
        *self.installs.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        if self.fail {
            return Err(anyhow!("tiller did not become healthy within max time"));
        }
        Ok(())
    }
}

struct SharedInstaller(Arc<FakeInstaller>);

#[async_trait::async_trait]
impl Installer for SharedInstaller {
    async fn install(&self) -> Result<()> {
        self.0.install().await
    }
}

pub struct FakeInstallerFactory {
    installer: Arc<FakeInstaller>,
}

impl FakeInstallerFactory {
    pub fn new(installer: Arc<FakeInstaller>) -> Self {
        Self { installer }
    }
}

impl InstallerFactory for FakeInstallerFactory {
    fn installer(&self, _cluster: Arc<dyn Cluster>, _helm: Arc<dyn HelmClient>) -> Box<dyn Installer> {
        Box::new(SharedInstaller(self.installer.clone()))
    }
}

/// Chart source that cannot be listed.
pub struct FailingChartRepository;

#[async_trait::async_trait]
impl ChartRepository for FailingChartRepository {
    async fn load_charts(&self) -> Result<Vec<Chart>> {
        Err(anyhow!("chart source unavailable"))
    }
}
