//! Kibosh broker: the service-broker protocol mapped onto charts and clusters.
//!
//! This crate defines the protocol-facing types and the [`ServiceBroker`]
//! trait the HTTP surface depends on. [`Broker`] is the in-process
//! implementation; it owns no per-request state and can be shared freely.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod broker;
pub mod catalog;
pub mod credentials;
pub mod fakes;
pub mod resolver;
pub mod status;

pub use broker::Broker;
pub use catalog::build_catalog;
pub use credentials::{Credentials, SecretCredentials, ServiceCredentials};
pub use resolver::ClusterResolver;

/// A catalog entry: one chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    pub plan_updateable: bool,
    pub plans: Vec<ServicePlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub bindable: bool,
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanMetadata {
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub bullets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProvisionDetails {
    pub service_id: String,
    pub plan_id: String,
    /// Caller parameters as received; must be a JSON object when present.
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UpdateDetails {
    pub service_id: String,
    /// Absent on a parameters-only update.
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub previous_values: Option<PreviousValues>,
}

impl UpdateDetails {
    /// Requested plan, else the one the instance was on.
    pub fn effective_plan_id(&self) -> Option<&str> {
        fn non_empty(p: &Option<String>) -> Option<&str> {
            p.as_deref().filter(|s| !s.is_empty())
        }
        non_empty(&self.plan_id).or_else(|| self.previous_values.as_ref().and_then(|v| non_empty(&v.plan_id)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PreviousValues {
    #[serde(default)]
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeprovisionDetails {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BindDetails {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UnbindDetails {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

/// Query of a LastOperation poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PollDetails {
    #[serde(default, rename = "operation")]
    pub operation_data: Option<String>,
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
}

/// Accepted asynchronous operation. `operation_data` is echoed back on polls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationSpec {
    pub is_async: bool,
    pub operation_data: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LastOperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastOperation {
    pub state: LastOperationState,
    pub description: String,
}

impl LastOperation {
    pub fn in_progress(description: impl Into<String>) -> Self {
        Self { state: LastOperationState::InProgress, description: description.into() }
    }
    pub fn succeeded(description: impl Into<String>) -> Self {
        Self { state: LastOperationState::Succeeded, description: description.into() }
    }
    pub fn failed(description: impl Into<String>) -> Self {
        Self { state: LastOperationState::Failed, description: description.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UnbindSpec {
    pub is_async: bool,
}

/// Errors surfaced to protocol callers.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrokerError {
    #[error("This service plan requires client support for asynchronous service operations.")]
    AsyncRequired,
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("config: {0}")]
    Config(String),
    #[error("repository: {0}")]
    Repository(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("status: {0}")]
    Status(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl BrokerError {
    /// Short name used as the `error` field of protocol error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::AsyncRequired => "AsyncRequired",
            BrokerError::Validation(_) => "ValidationError",
            BrokerError::NotFound(_) => "NotFound",
            BrokerError::Config(_) => "ConfigError",
            BrokerError::Repository(_) => "RepositoryError",
            BrokerError::Transport(_) => "TransportError",
            BrokerError::Status(_) => "StatusError",
        }
    }

    pub(crate) fn transport(e: anyhow::Error) -> Self {
        BrokerError::Transport(format!("{:#}", e))
    }

    pub(crate) fn status(e: anyhow::Error) -> Self {
        BrokerError::Status(format!("{:#}", e))
    }

    pub(crate) fn repository(e: anyhow::Error) -> Self {
        BrokerError::Repository(format!("{:#}", e))
    }
}

/// The broker operations exposed over the protocol.
#[async_trait::async_trait]
pub trait ServiceBroker: Send + Sync {
    async fn services(&self) -> BrokerResult<Vec<Service>>;
    async fn provision(&self, instance_id: &str, details: ProvisionDetails, async_allowed: bool) -> BrokerResult<OperationSpec>;
    async fn update(&self, instance_id: &str, details: UpdateDetails, async_allowed: bool) -> BrokerResult<OperationSpec>;
    async fn deprovision(&self, instance_id: &str, details: DeprovisionDetails, async_allowed: bool) -> BrokerResult<OperationSpec>;
    async fn bind(&self, instance_id: &str, binding_id: &str, details: BindDetails) -> BrokerResult<Binding>;
    async fn unbind(&self, instance_id: &str, binding_id: &str, details: UnbindDetails) -> BrokerResult<UnbindSpec>;
    async fn last_operation(&self, instance_id: &str, details: PollDetails) -> BrokerResult<LastOperation>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_required_message_mentions_async() {
        let msg = BrokerError::AsyncRequired.to_string();
        assert!(msg.contains("async"));
        assert_eq!(BrokerError::AsyncRequired.kind(), "AsyncRequired");
    }

    #[test]
    fn transport_keeps_context_chain() {
        let e = anyhow::anyhow!("connection refused").context("installing chart");
        match BrokerError::transport(e) {
            BrokerError::Transport(msg) => {
                assert!(msg.contains("installing chart"));
                assert!(msg.contains("connection refused"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn last_operation_state_wire_form() {
        let v = serde_json::to_value(LastOperation::in_progress("x")).expect("ser");
        assert_eq!(v["state"], "in progress");
        let v = serde_json::to_value(LastOperation::succeeded("x")).expect("ser");
        assert_eq!(v["state"], "succeeded");
    }

    #[test]
    fn plan_metadata_uses_display_name() {
        let m = PlanMetadata { display_name: "small".into(), bullets: vec!["a".into()] };
        let v = serde_json::to_value(m).expect("ser");
        assert_eq!(v["displayName"], "small");
    }

    #[test]
    fn update_plan_falls_back_to_previous_values() {
        let details: UpdateDetails = serde_json::from_value(serde_json::json!({
            "service_id": "svc",
            "parameters": {"foo": "bar"},
            "previous_values": {"plan_id": "svc-small"}
        }))
        .expect("de");
        assert_eq!(details.effective_plan_id(), Some("svc-small"));

        let details = UpdateDetails { plan_id: Some("svc-large".into()), ..details };
        assert_eq!(details.effective_plan_id(), Some("svc-large"));

        let details = UpdateDetails { plan_id: Some(String::new()), previous_values: None, ..details };
        assert_eq!(details.effective_plan_id(), None);
    }
}
