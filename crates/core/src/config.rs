//! Broker-wide settings threaded through constructors.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_TILLER_NAMESPACE: &str = "kube-system";
pub const DEFAULT_TILLER_TAG: &str = "v2.9.0";

/// Private image registry used for pull secrets and the engine image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub server: String,
    pub user: String,
    pub pass: String,
    pub email: String,
}

/// TLS material for talking to the engine server component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelmTlsConfig {
    pub ca_cert_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// `None` means no registry: pull-secret handling is skipped entirely.
    pub registry: Option<RegistryConfig>,
    pub helm_tls: Option<HelmTlsConfig>,
    pub tiller_namespace: String,
    pub tiller_image_tag: String,
    pub installer_max_wait: Duration,
    pub helm_binary: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            registry: None,
            helm_tls: None,
            tiller_namespace: DEFAULT_TILLER_NAMESPACE.to_string(),
            tiller_image_tag: DEFAULT_TILLER_TAG.to_string(),
            installer_max_wait: Duration::from_secs(60),
            helm_binary: "helm".to_string(),
        }
    }
}
