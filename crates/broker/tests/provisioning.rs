#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kibosh_broker::fakes::Harness;
use kibosh_broker::{
    BrokerError, DeprovisionDetails, PreviousValues, ProvisionDetails, ServiceBroker, UnbindDetails, UpdateDetails,
};
use kibosh_core::prelude::*;
use serde_json::json;

const PLAN_KUBECONFIG: &str = r#"
current-context: context2
clusters:
- name: cluster1
  cluster:
    server: https://127.0.0.1:8443
- name: cluster2
  cluster:
    server: https://127.0.0.2:8443
contexts:
- name: context1
  context:
    cluster: cluster1
    user: user1
- name: context2
  context:
    cluster: cluster2
    user: user2
users:
- name: user1
  user:
    token: my encoded token
- name: user2
  user:
    token: my encoded 2nd token
"#;

fn spacebears() -> Chart {
    let mut plans = BTreeMap::new();
    plans.insert("small".to_string(), Plan { file: "small.yaml".into(), ..Plan::new("small", "small bears") });
    plans.insert("medium".to_string(), Plan { file: "medium.yaml".into(), ..Plan::new("medium", "medium bears") });
    Chart { name: "spacebears".into(), description: "spacebears service".into(), plans, ..Default::default() }
}

fn mysql() -> Chart {
    let mut plans = BTreeMap::new();
    plans.insert("small".to_string(), Plan::new("tiny", "tiny data"));
    let cfg = ClusterConfig::from_yaml(PLAN_KUBECONFIG).expect("kubeconfig");
    plans.insert("remote".to_string(), Plan { cluster_config: Some(cfg), ..Plan::new("remote", "own cluster") });
    Chart { name: "mysql".into(), description: "mysql service".into(), plans, ..Default::default() }
}

fn provision_details(chart: &str, plan: &str) -> ProvisionDetails {
    let sid = service_id(chart);
    ProvisionDetails { plan_id: format!("{}-{}", sid, plan), service_id: sid, parameters: None }
}

#[tokio::test]
async fn catalog_lists_every_chart() {
    let h = Harness::new(vec![spacebears(), mysql()]);
    let services = h.broker.services().await.expect("catalog");
    assert_eq!(services.len(), 2);
    assert_eq!(services[0].id, "37b7acb6-6755-56fe-a17f-2307657023ef");
    let plan_ids: Vec<_> = services[0].plans.iter().map(|p| p.id.clone()).collect();
    assert_eq!(
        plan_ids,
        vec![
            "37b7acb6-6755-56fe-a17f-2307657023ef-medium".to_string(),
            "37b7acb6-6755-56fe-a17f-2307657023ef-small".to_string()
        ]
    );
    assert!(services[1].plans.iter().any(|p| p.id == format!("{}-tiny", service_id("mysql"))));
}

#[tokio::test]
async fn catalog_fails_whole_when_charts_unavailable() {
    let h = Harness::with_failing_charts();
    let err = h.broker.services().await.unwrap_err();
    assert!(matches!(err, BrokerError::Repository(_)));
}

#[tokio::test]
async fn provision_requires_async_and_touches_nothing() {
    let h = Harness::new(vec![spacebears()]);
    let err = h.broker.provision("my-instance", provision_details("spacebears", "small"), false).await.unwrap_err();
    assert_eq!(err, BrokerError::AsyncRequired);
    assert!(err.to_string().contains("async"));
    assert_eq!(h.external_calls(), 0);
}

#[tokio::test]
async fn provision_creates_namespace_and_installs_release() {
    let h = Harness::new(vec![spacebears()]);
    let spec = h.broker.provision("my-instance", provision_details("spacebears", "small"), true).await.expect("provision");
    assert!(spec.is_async);
    assert_eq!(spec.operation_data, "provision");

    assert!(h.cluster.has_namespace("kibosh-my-instance"));
    let installs = h.helm.installs();
    assert_eq!(installs.len(), 1);
    assert_eq!(installs[0].namespace.as_deref(), Some("kibosh-my-instance"));
    assert_eq!(installs[0].release, "kibosh-my-instance");
    assert_eq!(installs[0].chart, "spacebears");
    assert_eq!(installs[0].plan, "small");
    assert!(installs[0].overrides.is_empty());
    assert_eq!(h.service_accounts.installs(), 0);
    assert_eq!(h.installer.installs(), 0);
}

#[tokio::test]
async fn provision_passes_parameters_as_yaml() {
    let h = Harness::new(vec![spacebears()]);
    let mut details = provision_details("spacebears", "small");
    details.parameters = Some(json!({"foo": "bar"}));
    h.broker.provision("p1", details, true).await.expect("provision");
    assert_eq!(h.helm.installs()[0].overrides, b"foo: bar\n".to_vec());
}

#[tokio::test]
async fn malformed_parameters_fail_before_any_mutation() {
    let h = Harness::new(vec![spacebears()]);
    let mut details = provision_details("spacebears", "small");
    details.parameters = Some(json!(["not", "an", "object"]));
    let err = h.broker.provision("p1", details, true).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation(_)));
    assert_eq!(h.external_calls(), 0);
}

#[tokio::test]
async fn existing_namespace_is_reused() {
    let h = Harness::new(vec![spacebears()]);
    h.cluster.add_namespace("kibosh-again");
    h.broker.provision("again", provision_details("spacebears", "small"), true).await.expect("provision");
    assert_eq!(h.cluster.calls("create_namespace"), 0);
    assert_eq!(h.helm.installs().len(), 1);
}

#[tokio::test]
async fn unknown_service_or_plan_is_not_found() {
    let h = Harness::new(vec![spacebears()]);
    let mut details = provision_details("spacebears", "small");
    details.service_id = "nope".into();
    let err = h.broker.provision("x", details, true).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));

    let err = h.broker.provision("x", provision_details("spacebears", "huge"), true).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
    assert_eq!(h.helm.total_calls(), 0);
}

#[tokio::test]
async fn plan_id_follows_plan_name_not_map_key() {
    let h = Harness::new(vec![mysql()]);
    h.broker.provision("m1", provision_details("mysql", "tiny"), true).await.expect("provision");
    assert_eq!(h.helm.installs()[0].plan, "tiny");
    let err = h.broker.provision("m2", provision_details("mysql", "small"), true).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn plan_cluster_is_prepared_and_used() {
    let h = Harness::new(vec![mysql()]);
    h.broker.provision("r1", provision_details("mysql", "remote"), true).await.expect("provision");

    assert_eq!(h.clusters.default_calls(), 0);
    let configs = h.clusters.configs();
    assert_eq!(configs.len(), 1);
    let selected = configs[0].select_current().expect("select");
    assert_eq!(selected.context, "context2");
    assert_eq!(selected.user.token.as_deref(), Some("my encoded 2nd token"));

    assert_eq!(h.service_accounts.installs(), 1);
    assert_eq!(h.installer.installs(), 1);
    assert!(h.plan_cluster.has_namespace("kibosh-r1"));
    assert!(!h.cluster.has_namespace("kibosh-r1"));
    assert_eq!(h.cluster.mutating_calls(), 0);

    let bound = h.helm_factory.bound_configs();
    assert!(bound.iter().all(|c| c.is_some()));
}

#[tokio::test]
async fn failing_plan_cluster_bootstrap_stops_provision() {
    let h = Harness::with_failing_installer(vec![mysql()]);
    let err = h.broker.provision("r2", provision_details("mysql", "remote"), true).await.unwrap_err();
    match err {
        BrokerError::Transport(msg) => assert!(msg.contains("did not become healthy within max time")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!h.plan_cluster.has_namespace("kibosh-r2"));
    assert!(h.helm.installs().is_empty());
}

#[tokio::test]
async fn registry_config_sets_pull_secret_on_default_account() {
    let config = BrokerConfig {
        registry: Some(RegistryConfig {
            server: "127.0.0.1".into(),
            user: "k8s".into(),
            pass: "monkey123".into(),
            email: "k8s@example.com".into(),
        }),
        ..Default::default()
    };
    let h = Harness::with_config(config, vec![spacebears()]);
    h.broker.provision("reg", provision_details("spacebears", "small"), true).await.expect("provision");

    let secret = h.cluster.secret("kibosh-reg", "registry-secret").expect("pull secret");
    assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/dockerconfigjson"));
    let patches = h.cluster.service_account_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].0, "kibosh-reg");
    assert_eq!(patches[0].1, "default");
    assert_eq!(patches[0].2, json!({"imagePullSecrets": [{"name": "registry-secret"}]}));
}

#[tokio::test]
async fn no_registry_means_no_pull_secret() {
    let h = Harness::new(vec![spacebears()]);
    h.broker.provision("plain", provision_details("spacebears", "small"), true).await.expect("provision");
    assert_eq!(h.cluster.calls("create_secret"), 0);
    assert_eq!(h.cluster.calls("patch_service_account"), 0);
}

#[tokio::test]
async fn install_failure_is_transport_with_context() {
    let h = Harness::new(vec![spacebears()]);
    h.helm.fail_on("install_chart");
    let err = h.broker.provision("f1", provision_details("spacebears", "small"), true).await.unwrap_err();
    match err {
        BrokerError::Transport(msg) => {
            assert!(msg.contains("installing chart spacebears"));
            assert!(msg.contains("install_chart failed"));
        }
        other => panic!("unexpected {:?}", other),
    }
    // namespace is left behind
    assert!(h.cluster.has_namespace("kibosh-f1"));
}

#[tokio::test]
async fn update_upgrades_release() {
    let h = Harness::new(vec![spacebears()]);
    let sid = service_id("spacebears");
    let details = UpdateDetails {
        service_id: sid.clone(),
        plan_id: Some(format!("{}-medium", sid)),
        parameters: Some(json!({"replicas": 2})),
        ..Default::default()
    };
    let spec = h.broker.update("u1", details, true).await.expect("update");
    assert_eq!(spec.operation_data, "update");
    let upgrades = h.helm.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(upgrades[0].release, "kibosh-u1");
    assert_eq!(upgrades[0].plan, "medium");
    assert_eq!(upgrades[0].overrides, b"replicas: 2\n".to_vec());
    assert!(h.helm.installs().is_empty());
}

#[tokio::test]
async fn update_validates_like_provision() {
    let h = Harness::new(vec![spacebears()]);
    let sid = service_id("spacebears");
    let details = UpdateDetails { service_id: sid.clone(), plan_id: Some(format!("{}-small", sid)), ..Default::default() };
    assert_eq!(h.broker.update("u2", details.clone(), false).await.unwrap_err(), BrokerError::AsyncRequired);

    let unknown_plan = UpdateDetails { plan_id: Some(format!("{}-huge", sid)), ..details };
    let err = h.broker.update("u2", unknown_plan, true).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
    assert_eq!(h.helm.total_calls(), 0);
}

#[tokio::test]
async fn parameters_only_update_keeps_current_plan() {
    let h = Harness::new(vec![spacebears()]);
    let details = UpdateDetails {
        service_id: service_id("spacebears"),
        plan_id: None,
        parameters: Some(json!({"foo": "bar"})),
        ..Default::default()
    };
    let spec = h.broker.update("u3", details, true).await.expect("update");
    assert!(spec.is_async);
    assert_eq!(spec.operation_data, "update");

    let upgrades = h.helm.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(upgrades[0].release, "kibosh-u3");
    assert_eq!(upgrades[0].plan, "");
    assert_eq!(upgrades[0].overrides, b"foo: bar\n".to_vec());
    assert_eq!(h.clusters.configs().len(), 0);
}

#[tokio::test]
async fn update_falls_back_to_previous_plan() {
    let h = Harness::new(vec![mysql()]);
    let sid = service_id("mysql");
    let details = UpdateDetails {
        service_id: sid.clone(),
        previous_values: Some(PreviousValues { plan_id: Some(format!("{}-remote", sid)) }),
        ..Default::default()
    };
    h.broker.update("u4", details, true).await.expect("update");
    assert_eq!(h.helm.upgrades()[0].plan, "remote");
    assert_eq!(h.clusters.configs().len(), 1);
    assert_eq!(h.clusters.default_calls(), 0);
}

#[tokio::test]
async fn deprovision_deletes_release_and_namespace() {
    let h = Harness::new(vec![spacebears()]);
    h.cluster.add_namespace("kibosh-d1");
    let spec = h.broker.deprovision("d1", DeprovisionDetails::default(), true).await.expect("deprovision");
    assert!(spec.is_async);
    assert_eq!(spec.operation_data, "deprovision");
    assert_eq!(h.helm.deletes(), vec!["kibosh-d1".to_string()]);
    assert!(!h.cluster.has_namespace("kibosh-d1"));
}

#[tokio::test]
async fn deprovision_requires_async() {
    let h = Harness::new(vec![spacebears()]);
    let err = h.broker.deprovision("d2", DeprovisionDetails::default(), false).await.unwrap_err();
    assert_eq!(err, BrokerError::AsyncRequired);
    assert_eq!(h.external_calls(), 0);
}

#[tokio::test]
async fn deprovision_targets_plan_cluster_when_ids_resolve() {
    let h = Harness::new(vec![mysql()]);
    h.plan_cluster.add_namespace("kibosh-d3");
    let sid = service_id("mysql");
    let details = DeprovisionDetails { plan_id: Some(format!("{}-remote", sid)), service_id: Some(sid) };
    h.broker.deprovision("d3", details, true).await.expect("deprovision");
    assert_eq!(h.clusters.default_calls(), 0);
    assert!(!h.plan_cluster.has_namespace("kibosh-d3"));
}

#[tokio::test]
async fn deprovision_with_unknown_ids_falls_back_to_default() {
    let h = Harness::new(vec![mysql()]);
    h.cluster.add_namespace("kibosh-d4");
    let details = DeprovisionDetails { service_id: Some("unknown".into()), plan_id: Some("unknown-plan".into()) };
    h.broker.deprovision("d4", details, true).await.expect("deprovision");
    assert_eq!(h.clusters.default_calls(), 1);
    assert!(h.clusters.configs().is_empty());
}

#[tokio::test]
async fn unbind_is_a_synchronous_no_op() {
    let h = Harness::new(vec![spacebears()]);
    let spec = h.broker.unbind("i", "b", UnbindDetails::default()).await.expect("unbind");
    assert!(!spec.is_async);
    assert_eq!(h.external_calls(), 0);
}
