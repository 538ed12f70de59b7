//! Charts and plans as loaded from the chart source.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::cluster_config::ClusterConfig;
use crate::ids::{service_id, PlanRef};

/// A named installation variant of a chart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub bullets: Vec<String>,
    /// Values file, relative to the chart's `plans/` directory.
    #[serde(default)]
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindable: Option<bool>,
    /// Kubeconfig file for a dedicated cluster, relative to `plans/`.
    #[serde(default, rename = "credentials", skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,
    #[serde(skip)]
    pub values: Vec<u8>,
    #[serde(skip)]
    pub cluster_config: Option<ClusterConfig>,
}

impl Plan {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), ..Default::default() }
    }

    pub fn is_free(&self) -> bool {
        self.free.unwrap_or(true)
    }

    pub fn is_bindable(&self) -> bool {
        self.bindable.unwrap_or(true)
    }

    /// Fill absent flags with their defaults.
    pub fn with_defaults(mut self) -> Self {
        self.free.get_or_insert(true);
        self.bindable.get_or_insert(true);
        self
    }
}

/// A deployable chart and its plans. Plans iterate in name order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chart {
    pub name: String,
    pub description: String,
    /// Chart directory handed to the deployment engine.
    pub path: PathBuf,
    /// Raw `values.yaml`.
    pub values: Vec<u8>,
    pub plans: BTreeMap<String, Plan>,
}

impl Chart {
    pub fn service_id(&self) -> String {
        service_id(&self.name)
    }

    /// Plan by its own name (map keys are not trusted to match).
    pub fn plan(&self, name: &str) -> Option<&Plan> {
        self.plans.values().find(|p| p.name == name)
    }

    /// Plan addressed by a protocol plan id of this chart's service.
    pub fn plan_by_id(&self, plan_id: &str) -> Option<&Plan> {
        let r = PlanRef::parse(&self.service_id(), plan_id)?;
        self.plan(&r.plan_name)
    }
}
