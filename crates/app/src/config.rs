use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use kibosh_core::config::{DEFAULT_TILLER_NAMESPACE, DEFAULT_TILLER_TAG};
use kibosh_core::{BrokerConfig, HelmTlsConfig, RegistryConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "kibosh", version, about = "Open service broker for helm charts")]
pub struct Settings {
    /// HTTP port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Basic-auth user for /v2
    #[arg(long, env = "SECURITY_USER_NAME")]
    pub admin_user: String,

    /// Basic-auth password for /v2
    #[arg(long, env = "SECURITY_USER_PASSWORD", hide_env_values = true)]
    pub admin_password: String,

    /// Directory holding one sub-directory per chart
    #[arg(long, env = "HELM_CHART_DIR", default_value = "charts")]
    pub chart_dir: PathBuf,

    #[arg(long, env = "TILLER_NAMESPACE", default_value = DEFAULT_TILLER_NAMESPACE)]
    pub tiller_namespace: String,

    #[arg(long, env = "TILLER_TAG", default_value = DEFAULT_TILLER_TAG)]
    pub tiller_image_tag: String,

    /// Seconds to wait for tiller to answer after install
    #[arg(long, env = "TILLER_MAX_WAIT_SECS", default_value_t = 60)]
    pub tiller_max_wait_secs: u64,

    #[arg(long, env = "HELM_BINARY", default_value = "helm")]
    pub helm_binary: String,

    /// Private registry; ignored unless the server is set
    #[arg(long, env = "REG_SERVER")]
    pub registry_server: Option<String>,
    #[arg(long, env = "REG_USER")]
    pub registry_user: Option<String>,
    #[arg(long, env = "REG_PASS", hide_env_values = true)]
    pub registry_pass: Option<String>,
    #[arg(long, env = "REG_EMAIL")]
    pub registry_email: Option<String>,

    #[arg(long, env = "TLS_CA_CERT_FILE")]
    pub tls_ca_cert: Option<PathBuf>,
    #[arg(long, env = "TILLER_TLS_CERT_FILE")]
    pub tls_cert: Option<PathBuf>,
    #[arg(long, env = "TILLER_TLS_KEY_FILE")]
    pub tls_key: Option<PathBuf>,

    /// Do not install tiller on the default cluster at startup
    #[arg(long, env = "KIBOSH_SKIP_BOOTSTRAP", action = ArgAction::SetTrue)]
    pub skip_bootstrap: bool,
}

impl Settings {
    pub fn registry(&self) -> Option<RegistryConfig> {
        let server = self.registry_server.as_deref().filter(|s| !s.is_empty())?;
        Some(RegistryConfig {
            server: server.to_string(),
            user: self.registry_user.clone().unwrap_or_default(),
            pass: self.registry_pass.clone().unwrap_or_default(),
            email: self.registry_email.clone().unwrap_or_default(),
        })
    }

    /// TLS only when all three files are given.
    pub fn helm_tls(&self) -> Option<HelmTlsConfig> {
        match (&self.tls_ca_cert, &self.tls_cert, &self.tls_key) {
            (Some(ca), Some(cert), Some(key)) => Some(HelmTlsConfig {
                ca_cert_file: ca.clone(),
                cert_file: cert.clone(),
                key_file: key.clone(),
            }),
            _ => None,
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            registry: self.registry(),
            helm_tls: self.helm_tls(),
            tiller_namespace: self.tiller_namespace.clone(),
            tiller_image_tag: self.tiller_image_tag.clone(),
            installer_max_wait: Duration::from_secs(self.tiller_max_wait_secs),
            helm_binary: self.helm_binary.clone(),
        }
    }
}
