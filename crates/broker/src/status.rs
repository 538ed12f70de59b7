//! Derives the protocol state of an instance from its release and workloads.

use k8s_openapi::api::core::v1::{Pod, Service};
use kibosh_core::{InstanceId, Operation};
use kibosh_helm::{HelmClient, ReleaseStatus, ReleaseStatusInfo};
use kibosh_kubehub::Cluster;
use tracing::debug;

use crate::{BrokerError, BrokerResult, LastOperation};

pub const DEPLOY_IN_PROGRESS: &str = "service deployment in progress";
pub const DEPLOY_SUCCEEDED: &str = "service deployment succeeded";
pub const DEPLOY_UPDATED: &str = "service deployment updated";
pub const DELETE_IN_PROGRESS: &str = "service deletion in progress";
pub const INSTANCE_GONE: &str = "service instance is gone";
pub const LOAD_BALANCER_PENDING: &str = "service deployment load balancer in progress";

/// What the release status alone says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Done(LastOperation),
    /// Release is deployed; workloads decide.
    CheckReadiness,
}

/// Release status to state. An absent or unknown marker reads as provision.
pub fn verdict(op: Option<Operation>, info: &ReleaseStatusInfo) -> Verdict {
    match op.unwrap_or(Operation::Provision) {
        Operation::Deprovision => Verdict::Done(match info.status {
            ReleaseStatus::Deleted => LastOperation::succeeded(INSTANCE_GONE),
            ReleaseStatus::Failed => LastOperation::failed(format!("service deletion failed: {}", info.description)),
            _ => LastOperation::in_progress(DELETE_IN_PROGRESS),
        }),
        Operation::Provision | Operation::Update => match info.status {
            s if s.is_pending() => Verdict::Done(LastOperation::in_progress(DEPLOY_IN_PROGRESS)),
            ReleaseStatus::Deployed => Verdict::CheckReadiness,
            ReleaseStatus::Deleted => Verdict::Done(LastOperation::failed(INSTANCE_GONE)),
            ReleaseStatus::Failed => {
                Verdict::Done(LastOperation::failed(format!("service deployment failed: {}", info.description)))
            }
            other => Verdict::Done(LastOperation::in_progress(format!("{} ({})", DEPLOY_IN_PROGRESS, other))),
        },
    }
}

/// True when some load balancer has not been given an ingress point yet.
pub fn load_balancer_pending(services: &[Service]) -> bool {
    services.iter().any(|svc| {
        let is_lb = svc.spec.as_ref().and_then(|s| s.type_.as_deref()) == Some("LoadBalancer");
        let has_ingress = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map_or(false, |ingress| !ingress.is_empty());
        is_lb && !has_ingress
    })
}

/// Description of the first pod (in list order) that is neither running nor done.
pub fn first_unhealthy_pod(pods: &[Pod]) -> Option<String> {
    pods.iter().find_map(|pod| {
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown");
        if phase == "Running" || phase == "Succeeded" {
            return None;
        }
        let failing = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.status != "True"));
        Some(match failing {
            Some(c) => format!(
                "{}: {}",
                c.reason.as_deref().unwrap_or_default(),
                c.message.as_deref().unwrap_or_default()
            ),
            None => format!("pod {} is {}", pod.metadata.name.as_deref().unwrap_or_default(), phase),
        })
    })
}

async fn readiness(cluster: &dyn Cluster, namespace: &str, op: Option<Operation>) -> BrokerResult<LastOperation> {
    let services = cluster.list_services(namespace).await.map_err(BrokerError::status)?;
    if load_balancer_pending(&services) {
        return Ok(LastOperation::in_progress(LOAD_BALANCER_PENDING));
    }
    let pods = cluster.list_pods(namespace).await.map_err(BrokerError::status)?;
    if let Some(description) = first_unhealthy_pod(&pods) {
        return Ok(LastOperation::in_progress(description));
    }
    Ok(match op {
        Some(Operation::Update) => LastOperation::succeeded(DEPLOY_UPDATED),
        _ => LastOperation::succeeded(DEPLOY_SUCCEEDED),
    })
}

/// Full poll: release status first, workloads only for a deployed release.
pub async fn resolve(
    cluster: &dyn Cluster,
    helm: &dyn HelmClient,
    instance: &InstanceId,
    op: Option<Operation>,
) -> BrokerResult<LastOperation> {
    let release = instance.release_name();
    let info = helm.release_status(&release).await.map_err(BrokerError::transport)?;
    debug!(release = %release, status = %info.status, "release status");
    match verdict(op, &info) {
        Verdict::Done(last) => Ok(last),
        Verdict::CheckReadiness => readiness(cluster, &instance.namespace(), op).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LastOperationState;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, PodCondition, PodStatus, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn info(status: ReleaseStatus) -> ReleaseStatusInfo {
        ReleaseStatusInfo::new(status, "engine says hi")
    }

    fn done(v: Verdict) -> LastOperation {
        match v {
            Verdict::Done(l) => l,
            Verdict::CheckReadiness => panic!("expected a final verdict"),
        }
    }

    fn service(type_: &str, ingress: Option<Vec<LoadBalancerIngress>>) -> Service {
        Service {
            metadata: ObjectMeta { name: Some("svc".into()), ..Default::default() },
            spec: Some(ServiceSpec { type_: Some(type_.into()), ..Default::default() }),
            status: Some(ServiceStatus {
                load_balancer: Some(LoadBalancerStatus { ingress }),
                ..Default::default()
            }),
        }
    }

    fn pod(name: &str, phase: &str, conditions: Vec<PodCondition>) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            status: Some(PodStatus {
                phase: Some(phase.into()),
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pending_release_is_in_progress() {
        for s in [ReleaseStatus::PendingInstall, ReleaseStatus::PendingUpgrade, ReleaseStatus::PendingRollback] {
            let l = done(verdict(Some(Operation::Provision), &info(s)));
            assert_eq!(l, LastOperation::in_progress(DEPLOY_IN_PROGRESS));
        }
    }

    #[test]
    fn deployed_release_needs_readiness() {
        assert_eq!(verdict(Some(Operation::Update), &info(ReleaseStatus::Deployed)), Verdict::CheckReadiness);
    }

    #[test]
    fn deleted_release_depends_on_marker() {
        let l = done(verdict(Some(Operation::Deprovision), &info(ReleaseStatus::Deleted)));
        assert_eq!(l, LastOperation::succeeded(INSTANCE_GONE));
        let l = done(verdict(Some(Operation::Provision), &info(ReleaseStatus::Deleted)));
        assert_eq!(l, LastOperation::failed(INSTANCE_GONE));
    }

    #[test]
    fn failed_release_carries_engine_message() {
        let l = done(verdict(Some(Operation::Provision), &info(ReleaseStatus::Failed)));
        assert_eq!(l.state, LastOperationState::Failed);
        assert_eq!(l.description, "service deployment failed: engine says hi");
        let l = done(verdict(Some(Operation::Deprovision), &info(ReleaseStatus::Failed)));
        assert_eq!(l.description, "service deletion failed: engine says hi");
    }

    #[test]
    fn deprovision_of_live_release_is_in_progress() {
        for s in [ReleaseStatus::Deleting, ReleaseStatus::Deployed, ReleaseStatus::Unknown] {
            let l = done(verdict(Some(Operation::Deprovision), &info(s)));
            assert_eq!(l, LastOperation::in_progress(DELETE_IN_PROGRESS));
        }
    }

    #[test]
    fn unknown_marker_reads_as_provision() {
        let l = done(verdict(None, &info(ReleaseStatus::Superseded)));
        assert_eq!(l.state, LastOperationState::InProgress);
        assert_eq!(l.description, "service deployment in progress (SUPERSEDED)");
    }

    #[test]
    fn load_balancer_without_ingress_is_pending() {
        assert!(load_balancer_pending(&[service("LoadBalancer", None)]));
        assert!(load_balancer_pending(&[service("LoadBalancer", Some(vec![]))]));
        let ingress = vec![LoadBalancerIngress { ip: Some("10.0.0.1".into()), ..Default::default() }];
        assert!(!load_balancer_pending(&[service("LoadBalancer", Some(ingress))]));
        assert!(!load_balancer_pending(&[service("ClusterIP", None)]));
    }

    #[test]
    fn unschedulable_pod_reports_condition() {
        let cond = PodCondition {
            type_: "PodScheduled".into(),
            status: "False".into(),
            reason: Some("Unschedulable".into()),
            message: Some("0/1 nodes are available: 1 Insufficient memory.".into()),
            ..Default::default()
        };
        let pods = vec![pod("ok", "Running", vec![]), pod("stuck", "Pending", vec![cond])];
        let msg = first_unhealthy_pod(&pods).expect("unhealthy");
        assert_eq!(msg, "Unschedulable: 0/1 nodes are available: 1 Insufficient memory.");
    }

    #[test]
    fn finished_and_running_pods_are_healthy() {
        let pods = vec![pod("job", "Succeeded", vec![]), pod("web", "Running", vec![])];
        assert_eq!(first_unhealthy_pod(&pods), None);
    }

    #[test]
    fn pod_without_failing_condition_reports_phase() {
        let pods = vec![pod("web-0", "Pending", vec![])];
        assert_eq!(first_unhealthy_pod(&pods).as_deref(), Some("pod web-0 is Pending"));
    }
}
