//! Kibosh core types: charts, plans, identifiers and cluster configuration.
//!
//! Everything here is plain data. Crates that talk to a cluster or to helm
//! depend on these types, never the other way round.

#![forbid(unsafe_code)]

pub mod cluster_config;
pub mod config;
pub mod ids;
pub mod model;

pub use cluster_config::{ClusterConfig, ConfigError, SelectedCluster};
pub use config::{BrokerConfig, HelmTlsConfig, RegistryConfig};
pub use ids::{service_id, InstanceId, Operation, PlanRef};
pub use model::{Chart, Plan};

pub mod prelude {
    pub use super::{
        service_id, BrokerConfig, Chart, ClusterConfig, ConfigError, InstanceId, Operation, Plan,
        PlanRef, RegistryConfig,
    };
}
