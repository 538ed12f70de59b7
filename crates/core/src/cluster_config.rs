//! Kubeconfig-shaped cluster configuration a plan can carry to target its own cluster.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Keys the broker does not interpret (`exec`, `auth-provider`, file paths, ...).
/// Carried through load and render untouched.
pub type Passthrough = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster config has no current-context")]
    NoCurrentContext,
    #[error("context {0} not found in cluster config")]
    MissingContext(String),
    #[error("cluster {cluster} (context {context}) not found in cluster config")]
    MissingCluster { context: String, cluster: String },
    #[error("user {user} (context {context}) not found in cluster config")]
    MissingUser { context: String, user: String },
    #[error("cluster config encoding: {0}")]
    Encoding(String),
}

/// Kubeconfig file. Only the fields needed to follow `current-context` are
/// typed; everything else lands in `extra` and is rendered back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(flatten)]
    pub extra: Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    #[serde(default)]
    pub cluster: ClusterEndpoint,
    #[serde(flatten)]
    pub extra: Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEndpoint {
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
    #[serde(flatten)]
    pub extra: Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    #[serde(default)]
    pub context: ContextRef,
    #[serde(flatten)]
    pub extra: Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextRef {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub extra: Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserCredentials,
    #[serde(flatten)]
    pub extra: Passthrough,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(flatten)]
    pub extra: Passthrough,
}

/// Result of following `current-context` to its cluster and user entries.
#[derive(Debug, Clone, Copy)]
pub struct SelectedCluster<'a> {
    pub context: &'a str,
    pub cluster: &'a ClusterEndpoint,
    pub user: &'a UserCredentials,
}

impl ClusterConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Encoding(e.to_string()))
    }

    /// Resolve the current context. Every reference must exist.
    pub fn select_current(&self) -> Result<SelectedCluster<'_>, ConfigError> {
        let ctx_name = self
            .current_context
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::NoCurrentContext)?;
        let ctx = self
            .contexts
            .iter()
            .find(|c| c.name == ctx_name)
            .ok_or_else(|| ConfigError::MissingContext(ctx_name.to_string()))?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster)
            .ok_or_else(|| ConfigError::MissingCluster {
                context: ctx_name.to_string(),
                cluster: ctx.context.cluster.clone(),
            })?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == ctx.context.user)
            .ok_or_else(|| ConfigError::MissingUser {
                context: ctx_name.to_string(),
                user: ctx.context.user.clone(),
            })?;
        Ok(SelectedCluster { context: ctx_name, cluster: &cluster.cluster, user: &user.user })
    }

    /// Render as a complete kubeconfig document (for kube-rs and the helm binary).
    pub fn to_kubeconfig_yaml(&self) -> Result<String, ConfigError> {
        let mut doc = serde_yaml::to_value(self).map_err(|e| ConfigError::Encoding(e.to_string()))?;
        if let Value::Mapping(map) = &mut doc {
            map.insert("apiVersion".into(), "v1".into());
            map.insert("kind".into(), "Config".into());
        }
        serde_yaml::to_string(&doc).map_err(|e| ConfigError::Encoding(e.to_string()))
    }
}
