//! Loading charts (and their plans) from a directory of unpacked charts.
//!
//! Layout of one chart:
//!
//! ```text
//! mysql/
//!   Chart.yaml        name, description
//!   values.yaml       required
//!   plans.yaml        optional list of plans (plans.yml also accepted)
//!   plans/<file>      values per plan
//!   plans/<creds>     kubeconfig of a plan's dedicated cluster
//! ```
//!
//! Packaged `.tgz` charts and `bind.yaml` templates are not read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use kibosh_core::{Chart, ClusterConfig, Plan};
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

pub const DEFAULT_PLAN_NAME: &str = "default";
pub const DEFAULT_PLAN_DESCRIPTION: &str = "Plan with default values";

#[async_trait::async_trait]
pub trait ChartRepository: Send + Sync {
    async fn load_charts(&self) -> Result<Vec<Chart>>;
}

/// Re-reads the directory on every call so chart changes show up without a restart.
pub struct DirChartRepository {
    dir: PathBuf,
    registry_server: Option<String>,
}

impl DirChartRepository {
    pub fn new(dir: impl Into<PathBuf>, registry_server: Option<String>) -> Self {
        Self { dir: dir.into(), registry_server }
    }
}

#[async_trait::async_trait]
impl ChartRepository for DirChartRepository {
    async fn load_charts(&self) -> Result<Vec<Chart>> {
        let dir = self.dir.clone();
        let server = self.registry_server.clone();
        tokio::task::spawn_blocking(move || load_from_dir(&dir, server.as_deref()))
            .await
            .context("chart loader task")?
    }
}

/// Fixed set of charts.
#[derive(Default)]
pub struct StaticChartRepository {
    charts: Vec<Chart>,
}

impl StaticChartRepository {
    pub fn new(charts: Vec<Chart>) -> Self {
        Self { charts }
    }
}

#[async_trait::async_trait]
impl ChartRepository for StaticChartRepository {
    async fn load_charts(&self) -> Result<Vec<Chart>> {
        Ok(self.charts.clone())
    }
}

#[derive(Deserialize)]
struct ChartMeta {
    name: String,
    #[serde(default)]
    description: String,
}

const PLAN_NAME_PATTERN: &str = r"^[0-9a-z.\-]+$";

/// Load every chart directory under `dir`, in name order. Entries that are
/// not valid charts are skipped.
pub fn load_from_dir(dir: &Path, registry_server: Option<&str>) -> Result<Vec<Chart>> {
    let meta = fs::metadata(dir).with_context(|| format!("reading chart dir {}", dir.display()))?;
    if !meta.is_dir() {
        bail!("the provided path {} is not a directory", dir.display());
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("listing chart dir {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    let mut charts = Vec::new();
    for path in entries {
        match load_chart(&path, registry_server) {
            Ok(c) => charts.push(c),
            Err(e) => debug!(path = %path.display(), error = %format!("{:#}", e), "skipping entry that failed to load as a chart"),
        }
    }
    info!(dir = %dir.display(), count = charts.len(), "charts loaded");
    Ok(charts)
}

pub fn load_chart(path: &Path, registry_server: Option<&str>) -> Result<Chart> {
    if !path.is_dir() {
        bail!("{} is not a chart directory", path.display());
    }
    let meta_raw = fs::read_to_string(path.join("Chart.yaml")).context("reading Chart.yaml")?;
    let meta: ChartMeta = serde_yaml::from_str(&meta_raw).context("parsing Chart.yaml")?;

    let raw_values = fs::read(path.join("values.yaml")).context("values.yaml is required")?;
    let values = match registry_server {
        Some(server) if !server.is_empty() => {
            let parsed: Value = serde_yaml::from_slice(&raw_values).context("parsing values.yaml")?;
            let rewritten = override_image_sources(parsed, server)?;
            serde_yaml::to_string(&rewritten).context("encoding values")?.into_bytes()
        }
        _ => raw_values,
    };

    let mut plans = load_plans(path)?;
    if plans.is_empty() {
        let plan = Plan::new(DEFAULT_PLAN_NAME, DEFAULT_PLAN_DESCRIPTION).with_defaults();
        plans.insert(plan.name.clone(), plan);
    }

    Ok(Chart { name: meta.name, description: meta.description, path: path.to_path_buf(), values, plans })
}

fn load_plans(chart_path: &Path) -> Result<BTreeMap<String, Plan>> {
    let Some(plans_file) = ["plans.yaml", "plans.yml"].iter().map(|f| chart_path.join(f)).find(|p| p.is_file()) else {
        debug!(path = %chart_path.display(), "no plans file, using default plan");
        return Ok(BTreeMap::new());
    };
    let raw = fs::read_to_string(&plans_file).with_context(|| format!("reading {}", plans_file.display()))?;
    let listed: Vec<Plan> = serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", plans_file.display()))?;

    let plans_dir = chart_path.join("plans");
    let name_re = Regex::new(PLAN_NAME_PATTERN)?;
    let mut plans = BTreeMap::new();
    for plan in listed {
        if !name_re.is_match(&plan.name) {
            bail!("plan name [{}] contains invalid characters", plan.name);
        }
        let mut plan = plan.with_defaults();
        plan.values = fs::read(plans_dir.join(&plan.file))
            .with_context(|| format!("reading values of plan {}", plan.name))?;
        if let Some(creds) = &plan.credentials_path {
            let raw = fs::read_to_string(plans_dir.join(creds))
                .with_context(|| format!("reading cluster credentials of plan {}", plan.name))?;
            plan.cluster_config = Some(ClusterConfig::from_yaml(&raw)?);
        }
        plans.insert(plan.name.clone(), plan);
    }
    Ok(plans)
}

fn rehost(image: &str, server: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    format!("{}/{}", server, last)
}

/// Point `image`, `images.*.image` and `global.imageRegistry` at a private registry.
pub fn override_image_sources(values: Value, server: &str) -> Result<Value> {
    let map = match values {
        Value::Mapping(m) => m,
        other => return Ok(other),
    };
    let mut out = Mapping::new();
    for (key, val) in map {
        let rewritten = match key.as_str() {
            Some("image") => {
                let image = val.as_str().ok_or_else(|| anyhow!("'image' value is not a string"))?;
                Value::String(rehost(image, server))
            }
            Some("images") => {
                let Value::Mapping(images) = val else {
                    bail!("'images' value is not a mapping");
                };
                let mut rehosted = Mapping::new();
                for (name, def) in images {
                    rehosted.insert(name, override_image_sources(def, server)?);
                }
                Value::Mapping(rehosted)
            }
            Some("global") => match val {
                Value::Mapping(mut global) => {
                    let reg_key = Value::String("imageRegistry".into());
                    if let Some(reg) = global.get(&reg_key) {
                        let reg = reg.as_str().ok_or_else(|| anyhow!("'imageRegistry' value is not a string"))?;
                        let rehosted = rehost(reg, server);
                        global.insert(reg_key, Value::String(rehosted));
                    }
                    Value::Mapping(global)
                }
                other => other,
            },
            _ => val,
        };
        out.insert(key, rewritten);
    }
    Ok(Value::Mapping(out))
}
