//! Identifiers shared between the catalog, the orchestrator and the status resolver.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix of every instance namespace (and release) name.
pub const NAMESPACE_PREFIX: &str = "kibosh-";

/// Stable service id for a chart: UUID v5 over the chart name in the OID namespace.
pub fn service_id(chart_name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, chart_name.as_bytes()).to_string()
}

/// A plan addressed by its owning service and its name.
///
/// The protocol only ever sees the `<service_id>-<plan_name>` form; parsing
/// strips the exact service prefix so hyphens in plan names are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanRef {
    pub service_id: String,
    pub plan_name: String,
}

impl PlanRef {
    pub fn new(service_id: impl Into<String>, plan_name: impl Into<String>) -> Self {
        Self { service_id: service_id.into(), plan_name: plan_name.into() }
    }

    /// Split a protocol plan id issued for `service_id`.
    pub fn parse(service_id: &str, plan_id: &str) -> Option<Self> {
        let name = plan_id.strip_prefix(service_id)?.strip_prefix('-')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(service_id, name))
    }
}

impl fmt::Display for PlanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.service_id, self.plan_name)
    }
}

/// Caller-supplied instance GUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(guid: impl Into<String>) -> Self {
        Self(guid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace holding every object of the instance.
    pub fn namespace(&self) -> String {
        format!("{}{}", NAMESPACE_PREFIX, self.0)
    }

    /// Release name; always identical to [`InstanceId::namespace`].
    pub fn release_name(&self) -> String {
        self.namespace()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operation marker handed to the caller and echoed back on polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Provision,
    Update,
    Deprovision,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Provision => "provision",
            Operation::Update => "update",
            Operation::Deprovision => "deprovision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "provision" => Some(Operation::Provision),
            "update" => Some(Operation::Update),
            "deprovision" => Some(Operation::Deprovision),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
