//! Test doubles for every broker collaborator, wired together.

use std::sync::Arc;

use kibosh_core::{BrokerConfig, Chart};
use kibosh_helm::StaticChartRepository;

pub use kibosh_helm::fake::{
    ChartCall, FailingChartRepository, FakeHelmClient, FakeHelmClientFactory, FakeInstaller, FakeInstallerFactory,
};
pub use kibosh_kubehub::fake::{
    FakeCluster, FakeClusterFactory, FakeServiceAccountInstaller, FakeServiceAccountInstallerFactory,
};

use crate::Broker;

/// A [`Broker`] over fakes, with handles to inspect what it did.
pub struct Harness {
    pub broker: Broker,
    pub cluster: Arc<FakeCluster>,
    pub plan_cluster: Arc<FakeCluster>,
    pub clusters: Arc<FakeClusterFactory>,
    pub helm: Arc<FakeHelmClient>,
    pub helm_factory: Arc<FakeHelmClientFactory>,
    pub service_accounts: Arc<FakeServiceAccountInstaller>,
    pub installer: Arc<FakeInstaller>,
}

impl Harness {
    pub fn new(charts: Vec<Chart>) -> Self {
        Self::build(BrokerConfig::default(), Arc::new(StaticChartRepository::new(charts)), FakeInstaller::default())
    }

    pub fn with_config(config: BrokerConfig, charts: Vec<Chart>) -> Self {
        Self::build(config, Arc::new(StaticChartRepository::new(charts)), FakeInstaller::default())
    }

    pub fn with_failing_installer(charts: Vec<Chart>) -> Self {
        Self::build(BrokerConfig::default(), Arc::new(StaticChartRepository::new(charts)), FakeInstaller::failing())
    }

    pub fn with_failing_charts() -> Self {
        Self::build(BrokerConfig::default(), Arc::new(FailingChartRepository), FakeInstaller::default())
    }

    fn build(config: BrokerConfig, charts: Arc<dyn kibosh_helm::ChartRepository>, installer: FakeInstaller) -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let plan_cluster = Arc::new(FakeCluster::default());
        let clusters = Arc::new(FakeClusterFactory::new(cluster.clone()).with_plan_cluster(plan_cluster.clone()));
        let helm = Arc::new(FakeHelmClient::default());
        let helm_factory = Arc::new(FakeHelmClientFactory::new(helm.clone()));
        let service_accounts = Arc::new(FakeServiceAccountInstaller::default());
        let installer = Arc::new(installer);
        let broker = Broker::new(
            config,
            charts,
            clusters.clone(),
            helm_factory.clone(),
            Arc::new(FakeServiceAccountInstallerFactory::new(service_accounts.clone())),
            Arc::new(FakeInstallerFactory::new(installer.clone())),
        );
        Self { broker, cluster, plan_cluster, clusters, helm, helm_factory, service_accounts, installer }
    }

    /// Calls that reached any external collaborator.
    pub fn external_calls(&self) -> usize {
        self.helm.total_calls()
            + self.cluster.mutating_calls()
            + self.plan_cluster.mutating_calls()
            + self.clusters.default_calls()
            + self.clusters.configs().len()
            + self.service_accounts.installs()
            + self.installer.installs()
    }
}
