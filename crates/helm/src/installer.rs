//! Bootstrap of the engine server component (tiller) on a cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use kibosh_core::BrokerConfig;
use kibosh_kubehub::{service_account::TILLER_SERVICE_ACCOUNT, Cluster, PrivateRegistrySetup};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::{HelmClient, ServerInstall, ServerOptions};

pub const TILLER_DEPLOYMENT: &str = "tiller-deploy";
pub const DEFAULT_TILLER_REPOSITORY: &str = "gcr.io/kubernetes-helm";

#[async_trait::async_trait]
pub trait Installer: Send + Sync {
    /// Install or upgrade the server, then wait until it answers.
    async fn install(&self) -> Result<()>;
}

pub trait InstallerFactory: Send + Sync {
    fn installer(&self, cluster: Arc<dyn Cluster>, helm: Arc<dyn HelmClient>) -> Box<dyn Installer>;
}

pub struct TillerInstaller {
    config: BrokerConfig,
    cluster: Arc<dyn Cluster>,
    helm: Arc<dyn HelmClient>,
}

impl TillerInstaller {
    pub fn new(config: BrokerConfig, cluster: Arc<dyn Cluster>, helm: Arc<dyn HelmClient>) -> Self {
        Self { config, cluster, helm }
    }

    fn image(&self) -> String {
        let repo = match &self.config.registry {
            Some(reg) => reg.server.as_str(),
            None => DEFAULT_TILLER_REPOSITORY,
        };
        format!("{}/tiller:{}", repo, self.config.tiller_image_tag)
    }

    /// True when the running deployment's image tag is older than the configured one.
    async fn needs_upgrade(&self) -> Result<bool> {
        let deployment = self
            .cluster
            .get_deployment(&self.config.tiller_namespace, TILLER_DEPLOYMENT)
            .await?
            .ok_or_else(|| anyhow!("deployment {} not found", TILLER_DEPLOYMENT))?;
        let running = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.containers.first())
            .and_then(|c| c.image.clone())
            .unwrap_or_default();
        is_older_image(&running, &self.config.tiller_image_tag)
    }

    async fn wait_until_healthy(&self) -> Result<()> {
        let max_wait = self.config.installer_max_wait;
        let step = max_wait / 10;
        let t0 = Instant::now();
        loop {
            match self.helm.list_releases().await {
                Ok(_) => {
                    histogram!("tiller_ready_ms", t0.elapsed().as_millis() as f64);
                    info!(took_ms = %t0.elapsed().as_millis(), "tiller healthy");
                    return Ok(());
                }
                Err(e) => debug!(error = %format!("{:#}", e), "tiller not ready yet"),
            }
            if t0.elapsed() >= max_wait {
                counter!("tiller_unhealthy_total", 1u64);
                return Err(anyhow!("tiller did not become healthy within max time ({:?})", max_wait));
            }
            tokio::time::sleep(step.max(Duration::from_millis(1))).await;
        }
    }
}

/// Compare the tag of `running_image` against `wanted_tag` as semver
/// (a leading `v` is ignored). Unparseable running tags count as older.
pub fn is_older_image(running_image: &str, wanted_tag: &str) -> Result<bool> {
    let wanted = parse_tag(wanted_tag).with_context(|| format!("configured tiller tag {}", wanted_tag))?;
    let running_tag = running_image.rsplit_once(':').map(|(_, t)| t).unwrap_or_default();
    match parse_tag(running_tag) {
        Ok(running) => Ok(running < wanted),
        Err(_) => {
            warn!(image = %running_image, "running tiller image has no semver tag");
            Ok(true)
        }
    }
}

fn parse_tag(tag: &str) -> Result<semver::Version> {
    Ok(semver::Version::parse(tag.trim_start_matches('v'))?)
}

#[async_trait::async_trait]
impl Installer for TillerInstaller {
    async fn install(&self) -> Result<()> {
        let t0 = Instant::now();
        let ns = self.config.tiller_namespace.as_str();
        info!(namespace = %ns, tag = %self.config.tiller_image_tag, "tiller install start");

        if let Some(reg) = &self.config.registry {
            PrivateRegistrySetup::new(ns, TILLER_SERVICE_ACCOUNT, self.cluster.clone(), reg.clone())
                .setup()
                .await
                .context("registry setup for tiller")?;
        }

        let opts = ServerOptions {
            image: self.image(),
            service_account: TILLER_SERVICE_ACCOUNT.to_string(),
            tls: self.config.helm_tls.clone(),
        };

        if opts.tls.is_some() {
            if self.helm.has_different_tls_config().await.context("comparing tiller tls config")? {
                info!(namespace = %ns, "tiller tls config changed, reinstalling");
                self.helm.uninstall().await.context("removing tiller")?;
            }
            self.helm.install(&opts).await.context("installing tiller")?;
        } else {
            match self.helm.install(&opts).await.context("installing tiller")? {
                ServerInstall::Installed => {}
                ServerInstall::AlreadyExists => {
                    if self.needs_upgrade().await? {
                        self.helm.upgrade(&opts).await.context("upgrading tiller")?;
                    } else {
                        debug!(namespace = %ns, "tiller up to date");
                    }
                }
            }
        }

        self.wait_until_healthy().await?;
        info!(namespace = %ns, took_ms = %t0.elapsed().as_millis(), "tiller install ok");
        Ok(())
    }
}

pub struct TillerInstallerFactory {
    config: BrokerConfig,
}

impl TillerInstallerFactory {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

impl InstallerFactory for TillerInstallerFactory {
    fn installer(&self, cluster: Arc<dyn Cluster>, helm: Arc<dyn HelmClient>) -> Box<dyn Installer> {
        Box::new(TillerInstaller::new(self.config.clone(), cluster, helm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHelmClient;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use kibosh_core::{HelmTlsConfig, RegistryConfig};
    use kibosh_kubehub::fake::FakeCluster;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn config() -> BrokerConfig {
        BrokerConfig { installer_max_wait: Duration::from_millis(50), ..Default::default() }
    }

    fn tiller_deployment(image: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta { name: Some(TILLER_DEPLOYMENT.into()), ..Default::default() },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container { name: "tiller".into(), image: Some(image.into()), ..Default::default() }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn semver_tags_compare() {
        assert!(is_older_image("gcr.io/kubernetes-helm/tiller:v2.8.0", "v2.9.0").expect("cmp"));
        assert!(!is_older_image("gcr.io/kubernetes-helm/tiller:v2.9.0", "v2.9.0").expect("cmp"));
        assert!(!is_older_image("gcr.io/kubernetes-helm/tiller:v2.10.1", "v2.9.0").expect("cmp"));
        assert!(is_older_image("gcr.io/kubernetes-helm/tiller:canary", "v2.9.0").expect("cmp"));
        assert!(is_older_image("tiller:v2.8.0", "latest").is_err());
    }

    #[tokio::test]
    async fn fresh_install_uses_public_image_and_waits() {
        let cluster = Arc::new(FakeCluster::default());
        let helm = Arc::new(FakeHelmClient::default());
        TillerInstaller::new(config(), cluster.clone(), helm.clone()).install().await.expect("install");

        let installs = helm.server_installs();
        assert_eq!(installs.len(), 1);
        assert_eq!(installs[0].image, "gcr.io/kubernetes-helm/tiller:v2.9.0");
        assert_eq!(helm.calls("upgrade"), 0);
        assert!(helm.calls("list_releases") >= 1);
        assert_eq!(cluster.calls("patch_service_account"), 0);
    }

    #[tokio::test]
    async fn registry_switches_image_and_sets_pull_secret() {
        let cluster = Arc::new(FakeCluster::default());
        let helm = Arc::new(FakeHelmClient::default());
        let mut cfg = config();
        cfg.registry = Some(RegistryConfig {
            server: "registry.example.com".into(),
            user: "u".into(),
            pass: "p".into(),
            email: "e@example.com".into(),
        });
        TillerInstaller::new(cfg, cluster.clone(), helm.clone()).install().await.expect("install");

        assert_eq!(helm.server_installs()[0].image, "registry.example.com/tiller:v2.9.0");
        let patches = cluster.service_account_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "kube-system");
        assert_eq!(patches[0].1, "tiller");
    }

    #[tokio::test]
    async fn existing_older_tiller_is_upgraded() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_deployment("kube-system", tiller_deployment("gcr.io/kubernetes-helm/tiller:v2.8.2"));
        let helm = Arc::new(FakeHelmClient::default());
        helm.set_server_present(true);
        TillerInstaller::new(config(), cluster, helm.clone()).install().await.expect("install");
        assert_eq!(helm.calls("upgrade"), 1);
    }

    #[tokio::test]
    async fn existing_current_tiller_is_left_alone() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_deployment("kube-system", tiller_deployment("gcr.io/kubernetes-helm/tiller:v2.9.0"));
        let helm = Arc::new(FakeHelmClient::default());
        helm.set_server_present(true);
        TillerInstaller::new(config(), cluster, helm.clone()).install().await.expect("install");
        assert_eq!(helm.calls("upgrade"), 0);
    }

    #[tokio::test]
    async fn changed_tls_config_reinstalls() {
        let cluster = Arc::new(FakeCluster::default());
        let helm = Arc::new(FakeHelmClient::default());
        helm.set_server_present(true);
        helm.set_tls_differs(true);
        let mut cfg = config();
        cfg.helm_tls = Some(HelmTlsConfig {
            ca_cert_file: "/tls/ca.crt".into(),
            cert_file: "/tls/tls.crt".into(),
            key_file: "/tls/tls.key".into(),
        });
        TillerInstaller::new(cfg, cluster, helm.clone()).install().await.expect("install");
        assert_eq!(helm.calls("uninstall"), 1);
        assert_eq!(helm.calls("install"), 1);
        assert!(helm.server_installs()[0].tls.is_some());
    }

    #[tokio::test]
    async fn unhealthy_tiller_times_out() {
        let cluster = Arc::new(FakeCluster::default());
        let helm = Arc::new(FakeHelmClient::default());
        helm.fail_on("list_releases");
        let err = TillerInstaller::new(config(), cluster, helm.clone()).install().await.unwrap_err();
        assert!(err.to_string().contains("did not become healthy within max time"));
        assert!(helm.calls("list_releases") > 1);
    }
}
