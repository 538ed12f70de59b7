//! [`HelmClient`] over the helm v2 command line.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use kibosh_core::{BrokerConfig, Chart, HelmTlsConfig};
use kibosh_kubehub::Cluster;
use metrics::{counter, histogram};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{HelmClient, HelmClientFactory, ReleaseStatus, ReleaseStatusInfo, ServerInstall, ServerOptions};

/// Secret holding the server's TLS material.
pub const TILLER_SECRET: &str = "tiller-secret";

pub struct HelmCli {
    binary: String,
    tiller_namespace: String,
    tls: Option<HelmTlsConfig>,
    cluster: Arc<dyn Cluster>,
}

impl HelmCli {
    pub fn new(cluster: Arc<dyn Cluster>, config: &BrokerConfig) -> Self {
        Self {
            binary: config.helm_binary.clone(),
            tiller_namespace: config.tiller_namespace.clone(),
            tls: config.helm_tls.clone(),
            cluster,
        }
    }

    fn client_tls_args(&self) -> Vec<String> {
        match &self.tls {
            Some(tls) => vec![
                "--tls".into(),
                "--tls-verify".into(),
                "--tls-ca-cert".into(),
                path_arg(&tls.ca_cert_file),
                "--tls-cert".into(),
                path_arg(&tls.cert_file),
                "--tls-key".into(),
                path_arg(&tls.key_file),
            ],
            None => Vec::new(),
        }
    }

    /// Runs one helm command against this client's cluster; returns stdout.
    async fn run(&self, verb: &str, mut args: Vec<String>) -> Result<String> {
        let t0 = Instant::now();
        // dropped (and deleted) only after the child exits
        let kubeconfig = match self.cluster.cluster_config() {
            Some(cfg) => Some(temp_file(cfg.to_kubeconfig_yaml()?.as_bytes())?),
            None => None,
        };
        if let Some(f) = &kubeconfig {
            args.push("--kubeconfig".into());
            args.push(path_arg(f.path()));
        }
        args.push("--tiller-namespace".into());
        args.push(self.tiller_namespace.clone());

        let out = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("running {} {}", self.binary, verb))?;
        counter!("helm_commands_total", 1u64);
        histogram!("helm_command_ms", t0.elapsed().as_millis() as f64);
        if !out.status.success() {
            counter!("helm_command_errors_total", 1u64);
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            warn!(verb, code = ?out.status.code(), stderr = %stderr, "helm command failed");
            return Err(anyhow!("helm {} failed: {}", verb, stderr));
        }
        debug!(verb, took_ms = %t0.elapsed().as_millis(), "helm command ok");
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    /// Value files in precedence order: chart base values, plan values, overrides.
    fn value_files(chart: &Chart, plan: &str, overrides: &[u8]) -> Result<Vec<NamedTempFile>> {
        let plan = chart
            .plan(plan)
            .ok_or_else(|| anyhow!("chart {} has no plan {}", chart.name, plan))?;
        non_empty_files(&[chart.values.as_slice(), plan.values.as_slice(), overrides])
    }
}

/// One temp file per non-empty layer, in order.
fn non_empty_files(layers: &[&[u8]]) -> Result<Vec<NamedTempFile>> {
    layers.iter().filter(|b| !b.is_empty()).map(|b| temp_file(b)).collect()
}

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

fn temp_file(bytes: &[u8]) -> Result<NamedTempFile> {
    let mut f = NamedTempFile::new().context("creating temp file")?;
    f.write_all(bytes).context("writing temp file")?;
    f.flush().context("flushing temp file")?;
    Ok(f)
}

fn push_values(args: &mut Vec<String>, files: &[NamedTempFile]) {
    for f in files {
        args.push("-f".into());
        args.push(path_arg(f.path()));
    }
}

pub fn install_args(chart_path: &Path, release: &str, namespace: &str) -> Vec<String> {
    vec![
        "install".into(),
        path_arg(chart_path),
        "--name".into(),
        release.into(),
        "--namespace".into(),
        namespace.into(),
    ]
}

pub fn upgrade_args(chart_path: &Path, release: &str) -> Vec<String> {
    vec!["upgrade".into(), release.into(), path_arg(chart_path)]
}

pub fn init_args(opts: &ServerOptions, upgrade: bool) -> Vec<String> {
    let mut args = vec!["init".to_string()];
    if upgrade {
        args.push("--upgrade".into());
    }
    args.extend([
        "--skip-refresh".to_string(),
        "--service-account".into(),
        opts.service_account.clone(),
        "--tiller-image".into(),
        opts.image.clone(),
    ]);
    if let Some(tls) = &opts.tls {
        args.extend([
            "--tiller-tls".to_string(),
            "--tiller-tls-verify".into(),
            "--tiller-tls-cert".into(),
            path_arg(&tls.cert_file),
            "--tiller-tls-key".into(),
            path_arg(&tls.key_file),
            "--tls-ca-cert".into(),
            path_arg(&tls.ca_cert_file),
        ]);
    }
    args
}

/// Decode `helm status --output json`. The status may be a numeric code,
/// a name under `info.status.code`, or a bare name under `info.status`.
pub fn parse_status(json: &str) -> Result<ReleaseStatusInfo> {
    let v: Value = serde_json::from_str(json).context("decoding helm status output")?;
    let info = &v["info"];
    let status = match &info["status"] {
        Value::String(s) => ReleaseStatus::from_name(s),
        obj => match &obj["code"] {
            Value::Number(n) => ReleaseStatus::from_code(n.as_i64().unwrap_or(0)),
            Value::String(s) => ReleaseStatus::from_name(s),
            _ => ReleaseStatus::Unknown,
        },
    };
    let description = info["description"].as_str().unwrap_or_default().to_string();
    Ok(ReleaseStatusInfo { status, description })
}

fn is_already_installed(output: &str) -> bool {
    output.to_ascii_lowercase().contains("already installed")
}

#[async_trait::async_trait]
impl HelmClient for HelmCli {
    async fn install_chart(&self, namespace: &str, release: &str, chart: &Chart, plan: &str, overrides: &[u8]) -> Result<()> {
        let files = Self::value_files(chart, plan, overrides)?;
        let mut args = install_args(&chart.path, release, namespace);
        push_values(&mut args, &files);
        args.extend(self.client_tls_args());
        self.run("install", args).await?;
        info!(release, namespace, chart = %chart.name, plan, "release installed");
        Ok(())
    }

    async fn upgrade_chart(&self, release: &str, chart: &Chart, plan: Option<&str>, overrides: &[u8]) -> Result<()> {
        let mut args = upgrade_args(&chart.path, release);
        let files = match plan {
            Some(plan) => Self::value_files(chart, plan, overrides)?,
            None => {
                args.push("--reuse-values".into());
                non_empty_files(&[overrides])?
            }
        };
        push_values(&mut args, &files);
        args.extend(self.client_tls_args());
        self.run("upgrade", args).await?;
        info!(release, chart = %chart.name, plan = plan.unwrap_or("<previous>"), "release upgraded");
        Ok(())
    }

    async fn delete_release(&self, release: &str) -> Result<()> {
        let mut args = vec!["delete".to_string(), release.to_string()];
        args.extend(self.client_tls_args());
        self.run("delete", args).await?;
        info!(release, "release delete requested");
        Ok(())
    }

    async fn release_status(&self, release: &str) -> Result<ReleaseStatusInfo> {
        let mut args = vec!["status".to_string(), release.to_string(), "--output".into(), "json".into()];
        args.extend(self.client_tls_args());
        let out = self.run("status", args).await?;
        parse_status(&out).with_context(|| format!("status of release {}", release))
    }

    async fn list_releases(&self) -> Result<Vec<String>> {
        let mut args = vec!["list".to_string(), "--short".into()];
        args.extend(self.client_tls_args());
        let out = self.run("list", args).await?;
        Ok(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
    }

    async fn install(&self, opts: &ServerOptions) -> Result<ServerInstall> {
        let out = self.run("init", init_args(opts, false)).await?;
        if is_already_installed(&out) {
            debug!(namespace = %self.tiller_namespace, "tiller already installed");
            return Ok(ServerInstall::AlreadyExists);
        }
        info!(namespace = %self.tiller_namespace, image = %opts.image, "tiller installed");
        Ok(ServerInstall::Installed)
    }

    async fn upgrade(&self, opts: &ServerOptions) -> Result<()> {
        self.run("init --upgrade", init_args(opts, true)).await?;
        info!(namespace = %self.tiller_namespace, image = %opts.image, "tiller upgraded");
        Ok(())
    }

    async fn uninstall(&self) -> Result<()> {
        let mut args = vec!["reset".to_string(), "--force".into()];
        args.extend(self.client_tls_args());
        self.run("reset", args).await?;
        info!(namespace = %self.tiller_namespace, "tiller removed");
        Ok(())
    }

    async fn has_different_tls_config(&self) -> Result<bool> {
        let Some(tls) = &self.tls else {
            return Ok(false);
        };
        let Some(secret) = self.cluster.get_secret(&self.tiller_namespace, TILLER_SECRET).await? else {
            return Ok(true);
        };
        let current = secret.data.as_ref().and_then(|d| d.get("ca.crt")).map(|b| b.0.as_slice());
        let wanted = tokio::fs::read(&tls.ca_cert_file)
            .await
            .with_context(|| format!("reading {}", tls.ca_cert_file.display()))?;
        Ok(current != Some(wanted.as_slice()))
    }
}

pub struct HelmCliFactory {
    config: BrokerConfig,
}

impl HelmCliFactory {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

impl HelmClientFactory for HelmCliFactory {
    fn client(&self, cluster: Arc<dyn Cluster>) -> Arc<dyn HelmClient> {
        Arc::new(HelmCli::new(cluster, &self.config))
    }
}
