//! Binding credentials, read fresh from the instance namespace on every Bind.

use std::collections::BTreeMap;

use anyhow::Result;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceSpec, ServiceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kibosh_kubehub::Cluster;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const OPAQUE_SECRET_TYPE: &str = "Opaque";
/// Node label carrying the address advertised for NodePort services.
pub const NODE_IP_LABEL: &str = "spec.ip";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Credentials {
    pub secrets: Vec<SecretCredentials>,
    pub services: Vec<ServiceCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretCredentials {
    pub data: BTreeMap<String, String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceCredentials {
    pub name: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
    pub status: ServiceStatus,
}

fn is_opaque(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(OPAQUE_SECRET_TYPE)
}

fn flatten_secret(secret: Secret) -> SecretCredentials {
    let data = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    SecretCredentials { data, name: secret.metadata.name.unwrap_or_default() }
}

/// Collect opaque secrets and every service of `namespace`.
pub async fn assemble(cluster: &dyn Cluster, namespace: &str) -> Result<Credentials> {
    let (secrets, services) = futures::try_join!(cluster.list_secrets(namespace), cluster.list_services(namespace))?;

    let secrets: Vec<SecretCredentials> = secrets.into_iter().filter(is_opaque).map(flatten_secret).collect();

    let mut node_ips: Option<Vec<String>> = None;
    let mut out = Vec::with_capacity(services.len());
    for svc in services {
        let mut spec = svc.spec.unwrap_or_default();
        if spec.type_.as_deref() == Some("NodePort") {
            if node_ips.is_none() {
                node_ips = Some(external_node_ips(cluster).await?);
            }
            spec.external_ips = node_ips.clone();
        }
        out.push(ServiceCredentials {
            name: svc.metadata.name.clone().unwrap_or_default(),
            metadata: svc.metadata,
            spec,
            status: svc.status.unwrap_or_default(),
        });
    }

    debug!(namespace = %namespace, secrets = secrets.len(), services = out.len(), "credentials assembled");
    Ok(Credentials { secrets, services: out })
}

async fn external_node_ips(cluster: &dyn Cluster) -> Result<Vec<String>> {
    let nodes = cluster.list_nodes().await?;
    Ok(nodes
        .into_iter()
        .filter_map(|n| n.metadata.labels.and_then(|mut l| l.remove(NODE_IP_LABEL)))
        .collect())
}
