//! In-process [`ServiceBroker`] over charts, clusters and the deployment engine.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use kibosh_core::{BrokerConfig, Chart, InstanceId, Operation, Plan};
use kibosh_helm::{ChartRepository, HelmClientFactory, InstallerFactory};
use kibosh_kubehub::{Cluster, ClusterFactory, PrivateRegistrySetup, ServiceAccountInstallerFactory};
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::{
    build_catalog, credentials, status, BindDetails, Binding, BrokerError, BrokerResult, ClusterResolver,
    DeprovisionDetails, LastOperation, OperationSpec, PollDetails, ProvisionDetails, Service, ServiceBroker,
    UnbindDetails, UnbindSpec, UpdateDetails,
};

/// Service account in the instance namespace that pulls chart images.
pub const INSTANCE_SERVICE_ACCOUNT: &str = "default";

pub struct Broker {
    config: BrokerConfig,
    charts: Arc<dyn ChartRepository>,
    clusters: ClusterResolver,
    helm: Arc<dyn HelmClientFactory>,
    service_accounts: Arc<dyn ServiceAccountInstallerFactory>,
    installers: Arc<dyn InstallerFactory>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        charts: Arc<dyn ChartRepository>,
        clusters: Arc<dyn ClusterFactory>,
        helm: Arc<dyn HelmClientFactory>,
        service_accounts: Arc<dyn ServiceAccountInstallerFactory>,
        installers: Arc<dyn InstallerFactory>,
    ) -> Self {
        Self { config, charts, clusters: ClusterResolver::new(clusters), helm, service_accounts, installers }
    }

    async fn load_charts(&self) -> BrokerResult<Vec<Chart>> {
        self.charts.load_charts().await.map_err(BrokerError::repository)
    }

    async fn chart(&self, service_id: &str) -> BrokerResult<Chart> {
        let charts = self.load_charts().await?;
        charts
            .into_iter()
            .find(|c| c.service_id() == service_id)
            .ok_or_else(|| BrokerError::NotFound(format!("service {}", service_id)))
    }

    /// Chart and plan both required.
    async fn lookup(&self, service_id: &str, plan_id: &str) -> BrokerResult<(Chart, Plan)> {
        let chart = self.chart(service_id).await?;
        let plan = chart
            .plan_by_id(plan_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("plan {} of service {}", plan_id, service_id)))?;
        Ok((chart, plan))
    }

    /// Plan when both ids are given and resolve; `None` otherwise.
    async fn lookup_lenient(&self, service_id: Option<&str>, plan_id: Option<&str>) -> BrokerResult<Option<Plan>> {
        let (Some(service_id), Some(plan_id)) = (service_id.filter(|s| !s.is_empty()), plan_id.filter(|s| !s.is_empty()))
        else {
            return Ok(None);
        };
        let charts = self.load_charts().await?;
        Ok(charts.iter().find(|c| c.service_id() == service_id).and_then(|c| c.plan_by_id(plan_id)).cloned())
    }

    /// Engine service account and server component on a plan's own cluster.
    async fn prepare_plan_cluster(&self, cluster: &Arc<dyn Cluster>) -> BrokerResult<()> {
        self.service_accounts
            .installer(cluster.clone())
            .install()
            .await
            .context("installing tiller service account")
            .map_err(BrokerError::transport)?;
        let helm = self.helm.client(cluster.clone());
        self.installers
            .installer(cluster.clone(), helm)
            .install()
            .await
            .context("installing tiller")
            .map_err(BrokerError::transport)
    }

    async fn setup_registry(&self, cluster: &Arc<dyn Cluster>, namespace: &str) -> BrokerResult<()> {
        let Some(reg) = &self.config.registry else { return Ok(()) };
        PrivateRegistrySetup::new(namespace, INSTANCE_SERVICE_ACCOUNT, cluster.clone(), reg.clone())
            .setup()
            .await
            .context("registry setup")
            .map_err(BrokerError::transport)
    }

    fn record_err(op: &'static str, e: &BrokerError) {
        counter!("broker_op_err_total", 1u64, "op" => op, "kind" => e.kind());
        warn!(op, error = %e, "broker op failed");
    }
}

/// Caller parameters (a JSON object, or nothing) as a YAML values document.
pub fn parameters_to_yaml(parameters: Option<&serde_json::Value>) -> BrokerResult<Vec<u8>> {
    match parameters {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(v @ serde_json::Value::Object(map)) => {
            if map.is_empty() {
                return Ok(Vec::new());
            }
            let yaml = serde_yaml::to_string(v).map_err(|e| BrokerError::Validation(e.to_string()))?;
            Ok(yaml.into_bytes())
        }
        Some(other) => Err(BrokerError::Validation(format!("parameters must be an object, got {}", other))),
    }
}

fn require_async(async_allowed: bool) -> BrokerResult<()> {
    if async_allowed {
        Ok(())
    } else {
        Err(BrokerError::AsyncRequired)
    }
}

#[async_trait::async_trait]
impl ServiceBroker for Broker {
    async fn services(&self) -> BrokerResult<Vec<Service>> {
        let charts = self.load_charts().await.map_err(|e| {
            Self::record_err("services", &e);
            e
        })?;
        let catalog = build_catalog(&charts);
        info!(services = catalog.len(), "catalog served");
        Ok(catalog)
    }

    async fn provision(&self, instance_id: &str, details: ProvisionDetails, async_allowed: bool) -> BrokerResult<OperationSpec> {
        let t0 = Instant::now();
        let instance = InstanceId::new(instance_id);
        info!(instance = %instance_id, service_id = %details.service_id, plan_id = %details.plan_id, "broker: provision start");
        counter!("broker_provision_total", 1u64);
        let res: BrokerResult<OperationSpec> = async {
            require_async(async_allowed)?;
            let (chart, plan) = self.lookup(&details.service_id, &details.plan_id).await?;
            let overrides = parameters_to_yaml(details.parameters.as_ref())?;
            let cluster = self.clusters.resolve(Some(&plan)).await?;
            if plan.cluster_config.is_some() {
                self.prepare_plan_cluster(&cluster).await?;
            }

            let namespace = instance.namespace();
            cluster
                .create_namespace_if_not_exists(&namespace)
                .await
                .with_context(|| format!("creating namespace {}", namespace))
                .map_err(BrokerError::transport)?;
            self.setup_registry(&cluster, &namespace).await?;

            self.helm
                .client(cluster)
                .install_chart(&namespace, &instance.release_name(), &chart, &plan.name, &overrides)
                .await
                .with_context(|| format!("installing chart {} plan {}", chart.name, plan.name))
                .map_err(BrokerError::transport)?;
            Ok(OperationSpec { is_async: true, operation_data: Operation::Provision.as_str().to_string() })
        }
        .await;
        match &res {
            Ok(_) => info!(instance = %instance_id, took_ms = %t0.elapsed().as_millis(), "broker: provision ok"),
            Err(e) => Self::record_err("provision", e),
        }
        res
    }

    async fn update(&self, instance_id: &str, details: UpdateDetails, async_allowed: bool) -> BrokerResult<OperationSpec> {
        let t0 = Instant::now();
        let instance = InstanceId::new(instance_id);
        info!(instance = %instance_id, service_id = %details.service_id, "broker: update start");
        counter!("broker_update_total", 1u64);
        let res: BrokerResult<OperationSpec> = async {
            require_async(async_allowed)?;
            let chart = self.chart(&details.service_id).await?;
            let plan = match details.effective_plan_id() {
                Some(plan_id) => Some(chart.plan_by_id(plan_id).cloned().ok_or_else(|| {
                    BrokerError::NotFound(format!("plan {} of service {}", plan_id, details.service_id))
                })?),
                None => None,
            };
            let overrides = parameters_to_yaml(details.parameters.as_ref())?;
            let cluster = self.clusters.resolve(plan.as_ref()).await?;
            let plan_name = plan.as_ref().map(|p| p.name.as_str());

            self.helm
                .client(cluster)
                .upgrade_chart(&instance.release_name(), &chart, plan_name, &overrides)
                .await
                .with_context(|| format!("upgrading chart {} plan {}", chart.name, plan_name.unwrap_or("<previous>")))
                .map_err(BrokerError::transport)?;
            Ok(OperationSpec { is_async: true, operation_data: Operation::Update.as_str().to_string() })
        }
        .await;
        match &res {
            Ok(_) => info!(instance = %instance_id, took_ms = %t0.elapsed().as_millis(), "broker: update ok"),
            Err(e) => Self::record_err("update", e),
        }
        res
    }

    async fn deprovision(&self, instance_id: &str, details: DeprovisionDetails, async_allowed: bool) -> BrokerResult<OperationSpec> {
        let t0 = Instant::now();
        let instance = InstanceId::new(instance_id);
        info!(instance = %instance_id, "broker: deprovision start");
        counter!("broker_deprovision_total", 1u64);
        let res: BrokerResult<OperationSpec> = async {
            require_async(async_allowed)?;
            let plan = self.lookup_lenient(details.service_id.as_deref(), details.plan_id.as_deref()).await?;
            let cluster = self.clusters.resolve(plan.as_ref()).await?;

            let release = instance.release_name();
            self.helm
                .client(cluster.clone())
                .delete_release(&release)
                .await
                .with_context(|| format!("deleting release {}", release))
                .map_err(BrokerError::transport)?;
            cluster.delete_namespace(&instance.namespace()).await.map_err(BrokerError::transport)?;
            Ok(OperationSpec { is_async: true, operation_data: Operation::Deprovision.as_str().to_string() })
        }
        .await;
        match &res {
            Ok(_) => info!(instance = %instance_id, took_ms = %t0.elapsed().as_millis(), "broker: deprovision ok"),
            Err(e) => Self::record_err("deprovision", e),
        }
        res
    }

    async fn bind(&self, instance_id: &str, binding_id: &str, details: BindDetails) -> BrokerResult<Binding> {
        let t0 = Instant::now();
        let instance = InstanceId::new(instance_id);
        info!(instance = %instance_id, binding = %binding_id, "broker: bind start");
        counter!("broker_bind_total", 1u64);
        let res: BrokerResult<Binding> = async {
            let plan = self.lookup_lenient(details.service_id.as_deref(), details.plan_id.as_deref()).await?;
            let cluster = self.clusters.resolve(plan.as_ref()).await?;
            let credentials = credentials::assemble(cluster.as_ref(), &instance.namespace())
                .await
                .context("reading binding credentials")
                .map_err(BrokerError::transport)?;
            Ok(Binding { credentials })
        }
        .await;
        match &res {
            Ok(b) => info!(
                instance = %instance_id,
                secrets = b.credentials.secrets.len(),
                services = b.credentials.services.len(),
                took_ms = %t0.elapsed().as_millis(),
                "broker: bind ok"
            ),
            Err(e) => Self::record_err("bind", e),
        }
        res
    }

    async fn unbind(&self, instance_id: &str, binding_id: &str, _details: UnbindDetails) -> BrokerResult<UnbindSpec> {
        info!(instance = %instance_id, binding = %binding_id, "broker: unbind ok");
        Ok(UnbindSpec { is_async: false })
    }

    async fn last_operation(&self, instance_id: &str, details: PollDetails) -> BrokerResult<LastOperation> {
        let t0 = Instant::now();
        let instance = InstanceId::new(instance_id);
        let op = details.operation_data.as_deref().and_then(Operation::parse);
        info!(instance = %instance_id, operation = ?details.operation_data, "broker: last_operation start");
        let res: BrokerResult<LastOperation> = async {
            let plan = self.lookup_lenient(details.service_id.as_deref(), details.plan_id.as_deref()).await?;
            let cluster = self.clusters.resolve(plan.as_ref()).await?;
            let helm = self.helm.client(cluster.clone());
            status::resolve(cluster.as_ref(), helm.as_ref(), &instance, op).await
        }
        .await;
        histogram!("broker_last_operation_ms", t0.elapsed().as_millis() as f64);
        match &res {
            Ok(l) => info!(
                instance = %instance_id,
                state = ?l.state,
                description = %l.description,
                took_ms = %t0.elapsed().as_millis(),
                "broker: last_operation ok"
            ),
            Err(e) => Self::record_err("last_operation", e),
        }
        res
    }
}
