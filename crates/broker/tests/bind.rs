#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, Service, ServiceSpec, ServiceStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kibosh_broker::fakes::Harness;
use kibosh_broker::{BindDetails, BrokerError, ServiceBroker};
use kibosh_core::{service_id, Chart, Plan};

fn charts() -> Vec<Chart> {
    let mut plans = BTreeMap::new();
    plans.insert("small".to_string(), Plan::new("small", "small"));
    vec![Chart { name: "spacebears".into(), description: "bears".into(), plans, ..Default::default() }]
}

fn secret(name: &str, type_: &str, key: &str, value: &str) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
    Secret {
        metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
        type_: Some(type_.into()),
        data: Some(data),
        ..Default::default()
    }
}

fn bind_details() -> BindDetails {
    let sid = service_id("spacebears");
    BindDetails { plan_id: Some(format!("{}-small", sid)), service_id: Some(sid) }
}

#[tokio::test]
async fn bind_returns_opaque_secrets_and_services() {
    let h = Harness::new(charts());
    h.cluster.add_secret("kibosh-b1", secret("passwords", "Opaque", "db-password", "abc123"));
    h.cluster.add_secret("kibosh-b1", secret("default-token-abc", "kubernetes.io/service-account-token", "token", "t"));
    h.cluster.add_service(
        "kibosh-b1",
        Service {
            metadata: ObjectMeta { name: Some("kibosh-svc".into()), ..Default::default() },
            spec: Some(ServiceSpec { type_: Some("ClusterIP".into()), ..Default::default() }),
            status: Some(ServiceStatus::default()),
        },
    );

    let binding = h.broker.bind("b1", "binding-1", bind_details()).await.expect("bind");
    assert_eq!(h.cluster.calls("list_secrets"), 1);
    assert_eq!(binding.credentials.secrets.len(), 1);
    assert_eq!(binding.credentials.secrets[0].name, "passwords");
    assert_eq!(binding.credentials.secrets[0].data["db-password"], "abc123");
    assert_eq!(binding.credentials.services.len(), 1);
    assert_eq!(binding.credentials.services[0].name, "kibosh-svc");

    let json = serde_json::to_value(&binding).expect("ser");
    assert_eq!(json["credentials"]["secrets"][0]["name"], "passwords");
    assert_eq!(json["credentials"]["services"][0]["spec"]["type"], "ClusterIP");
}

#[tokio::test]
async fn bind_without_ids_uses_default_cluster() {
    let h = Harness::new(charts());
    let binding = h.broker.bind("b2", "binding-2", BindDetails::default()).await.expect("bind");
    assert!(binding.credentials.secrets.is_empty());
    assert_eq!(h.clusters.default_calls(), 1);
}

#[tokio::test]
async fn bind_listing_failure_is_transport() {
    let h = Harness::new(charts());
    h.cluster.fail_on("list_secrets");
    let err = h.broker.bind("b3", "binding-3", bind_details()).await.unwrap_err();
    match err {
        BrokerError::Transport(msg) => assert!(msg.contains("list_secrets failed")),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn bind_is_read_only() {
    let h = Harness::new(charts());
    h.cluster.add_secret("kibosh-b4", secret("passwords", "Opaque", "k", "v"));
    h.broker.bind("b4", "binding-4", bind_details()).await.expect("bind");
    h.broker.bind("b4", "binding-5", bind_details()).await.expect("bind again");
    assert_eq!(h.cluster.mutating_calls(), 0);
    assert_eq!(h.helm.total_calls(), 0);
}
