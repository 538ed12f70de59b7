//! Image pull credentials for a private registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kibosh_core::RegistryConfig;
use kube::api::ObjectMeta;
use serde_json::json;
use tracing::info;

use crate::Cluster;

pub const REGISTRY_SECRET_NAME: &str = "registry-secret";
pub const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Writes the pull secret into a namespace and points a service account at it.
pub struct PrivateRegistrySetup {
    namespace: String,
    service_account: String,
    cluster: Arc<dyn Cluster>,
    registry: RegistryConfig,
}

impl PrivateRegistrySetup {
    pub fn new(
        namespace: impl Into<String>,
        service_account: impl Into<String>,
        cluster: Arc<dyn Cluster>,
        registry: RegistryConfig,
    ) -> Self {
        Self { namespace: namespace.into(), service_account: service_account.into(), cluster, registry }
    }

    pub async fn setup(&self) -> Result<()> {
        let secret = pull_secret(&self.namespace, &self.registry)?;
        self.cluster
            .create_or_update_secret(&self.namespace, &secret)
            .await
            .context("writing registry pull secret")?;
        let patch = json!({ "imagePullSecrets": [{ "name": REGISTRY_SECRET_NAME }] });
        self.cluster
            .patch_service_account(&self.namespace, &self.service_account, &patch)
            .await
            .context("attaching registry pull secret to service account")?;
        info!(namespace = %self.namespace, service_account = %self.service_account, server = %self.registry.server, "registry pull secret configured");
        Ok(())
    }
}

/// `.dockerconfigjson` payload for a single registry.
pub fn docker_config_json(registry: &RegistryConfig) -> Result<Vec<u8>> {
    let auth = base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", registry.user, registry.pass));
    let mut auths = serde_json::Map::new();
    auths.insert(
        registry.server.clone(),
        json!({
            "username": registry.user,
            "password": registry.pass,
            "email": registry.email,
            "auth": auth,
        }),
    );
    serde_json::to_vec(&json!({ "auths": auths })).context("encoding docker config json")
}

pub fn pull_secret(namespace: &str, registry: &RegistryConfig) -> Result<Secret> {
    let mut data = BTreeMap::new();
    data.insert(".dockerconfigjson".to_string(), ByteString(docker_config_json(registry)?));
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(REGISTRY_SECRET_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeCluster;

    fn registry() -> RegistryConfig {
        RegistryConfig {
            server: "registry.example.com".into(),
            user: "k8s".into(),
            pass: "monkey123".into(),
            email: "k8s@example.com".into(),
        }
    }

    #[test]
    fn docker_config_carries_basic_auth() {
        let raw = docker_config_json(&registry()).expect("encode");
        let v: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        let entry = &v["auths"]["registry.example.com"];
        assert_eq!(entry["username"], "k8s");
        assert_eq!(entry["email"], "k8s@example.com");
        assert_eq!(entry["auth"], "azhzOm1vbmtleTEyMw==");
    }

    #[tokio::test]
    async fn setup_writes_secret_and_patches_account() {
        let cluster = Arc::new(FakeCluster::default());
        let setup = PrivateRegistrySetup::new("kibosh-abc", "default", cluster.clone(), registry());
        setup.setup().await.expect("setup");

        let secret = cluster.secret("kibosh-abc", REGISTRY_SECRET_NAME).expect("secret stored");
        assert_eq!(secret.type_.as_deref(), Some(DOCKER_CONFIG_JSON_TYPE));
        let patches = cluster.service_account_patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].0, "kibosh-abc");
        assert_eq!(patches[0].1, "default");
        assert_eq!(patches[0].2["imagePullSecrets"][0]["name"], REGISTRY_SECRET_NAME);
    }

    #[tokio::test]
    async fn setup_updates_existing_secret() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.add_secret("kibosh-abc", pull_secret("kibosh-abc", &registry()).expect("secret"));
        let setup = PrivateRegistrySetup::new("kibosh-abc", "default", cluster.clone(), registry());
        setup.setup().await.expect("setup");
        assert_eq!(cluster.calls("update_secret"), 1);
        assert_eq!(cluster.calls("create_secret"), 0);
    }
}
