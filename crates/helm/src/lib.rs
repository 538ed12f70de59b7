//! Kibosh helm: the deployment engine seam.
//!
//! [`HelmClient`] is what the broker drives: release install, upgrade,
//! delete and status, plus bootstrap of the in-cluster server component.
//! [`HelmCli`] implements it over the `helm` v2 binary.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use kibosh_core::{Chart, HelmTlsConfig};
use kibosh_kubehub::Cluster;
use serde::{Deserialize, Serialize};

pub mod chart;
pub mod cli;
pub mod fake;
pub mod installer;

pub use chart::{load_from_dir, ChartRepository, DirChartRepository, StaticChartRepository};
pub use cli::{HelmCli, HelmCliFactory};
pub use installer::{Installer, InstallerFactory, TillerInstaller, TillerInstallerFactory};

/// Release lifecycle states reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
    Unknown,
    Deployed,
    Deleted,
    Superseded,
    Failed,
    Deleting,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Engine wire codes 0..=8.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => ReleaseStatus::Deployed,
            2 => ReleaseStatus::Deleted,
            3 => ReleaseStatus::Superseded,
            4 => ReleaseStatus::Failed,
            5 => ReleaseStatus::Deleting,
            6 => ReleaseStatus::PendingInstall,
            7 => ReleaseStatus::PendingUpgrade,
            8 => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        }
    }

    /// Accepts `DEPLOYED`, `deployed`, `pending-install`, `PENDING_INSTALL`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "DEPLOYED" => ReleaseStatus::Deployed,
            "DELETED" | "UNINSTALLED" => ReleaseStatus::Deleted,
            "SUPERSEDED" => ReleaseStatus::Superseded,
            "FAILED" => ReleaseStatus::Failed,
            "DELETING" | "UNINSTALLING" => ReleaseStatus::Deleting,
            "PENDING_INSTALL" => ReleaseStatus::PendingInstall,
            "PENDING_UPGRADE" => ReleaseStatus::PendingUpgrade,
            "PENDING_ROLLBACK" => ReleaseStatus::PendingRollback,
            _ => ReleaseStatus::Unknown,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ReleaseStatus::PendingInstall | ReleaseStatus::PendingUpgrade | ReleaseStatus::PendingRollback)
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReleaseStatus::Unknown => "UNKNOWN",
            ReleaseStatus::Deployed => "DEPLOYED",
            ReleaseStatus::Deleted => "DELETED",
            ReleaseStatus::Superseded => "SUPERSEDED",
            ReleaseStatus::Failed => "FAILED",
            ReleaseStatus::Deleting => "DELETING",
            ReleaseStatus::PendingInstall => "PENDING_INSTALL",
            ReleaseStatus::PendingUpgrade => "PENDING_UPGRADE",
            ReleaseStatus::PendingRollback => "PENDING_ROLLBACK",
        };
        f.write_str(s)
    }
}

/// Status of one release plus the engine's free-text description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseStatusInfo {
    pub status: ReleaseStatus,
    pub description: String,
}

impl ReleaseStatusInfo {
    pub fn new(status: ReleaseStatus, description: impl Into<String>) -> Self {
        Self { status, description: description.into() }
    }
}

/// How the server component should be (re)installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub image: String,
    pub service_account: String,
    pub tls: Option<HelmTlsConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerInstall {
    Installed,
    AlreadyExists,
}

/// Deployment engine client bound to one cluster.
#[async_trait::async_trait]
pub trait HelmClient: Send + Sync {
    /// `overrides` is YAML layered over the plan values.
    async fn install_chart(&self, namespace: &str, release: &str, chart: &Chart, plan: &str, overrides: &[u8]) -> Result<()>;
    /// Without a plan the release keeps the values it was installed with and
    /// `overrides` is layered on top of those.
    async fn upgrade_chart(&self, release: &str, chart: &Chart, plan: Option<&str>, overrides: &[u8]) -> Result<()>;
    async fn delete_release(&self, release: &str) -> Result<()>;
    async fn release_status(&self, release: &str) -> Result<ReleaseStatusInfo>;
    async fn list_releases(&self) -> Result<Vec<String>>;

    async fn install(&self, opts: &ServerOptions) -> Result<ServerInstall>;
    async fn upgrade(&self, opts: &ServerOptions) -> Result<()>;
    async fn uninstall(&self) -> Result<()>;
    /// Whether the server's TLS material differs from the configured one.
    async fn has_different_tls_config(&self) -> Result<bool>;
}

pub trait HelmClientFactory: Send + Sync {
    fn client(&self, cluster: Arc<dyn Cluster>) -> Arc<dyn HelmClient>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(ReleaseStatus::from_code(1), ReleaseStatus::Deployed);
        assert_eq!(ReleaseStatus::from_code(2), ReleaseStatus::Deleted);
        assert_eq!(ReleaseStatus::from_code(6), ReleaseStatus::PendingInstall);
        assert_eq!(ReleaseStatus::from_code(42), ReleaseStatus::Unknown);
    }

    #[test]
    fn names_accept_both_spellings() {
        assert_eq!(ReleaseStatus::from_name("DEPLOYED"), ReleaseStatus::Deployed);
        assert_eq!(ReleaseStatus::from_name("pending-upgrade"), ReleaseStatus::PendingUpgrade);
        assert_eq!(ReleaseStatus::from_name("PENDING_ROLLBACK"), ReleaseStatus::PendingRollback);
        assert_eq!(ReleaseStatus::from_name("bogus"), ReleaseStatus::Unknown);
    }

    #[test]
    fn pending_covers_install_upgrade_rollback() {
        assert!(ReleaseStatus::PendingInstall.is_pending());
        assert!(ReleaseStatus::PendingRollback.is_pending());
        assert!(!ReleaseStatus::Deployed.is_pending());
    }
}
