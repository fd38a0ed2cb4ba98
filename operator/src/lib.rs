use async_trait::async_trait;
use kube::runtime::controller::Action;
use manager::Context;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("{0}")]
    CommonError(#[from] common::Error),

    #[error("IllegalMqttCluster: {0}")]
    IllegalMqttCluster(String),

    #[error("Error: {0}")]
    Other(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    #[must_use]
    pub fn metric_label(&self) -> String {
        match self {
            Error::SerializationError(_) => "serialization".to_string(),
            Error::KubeError(_) => "kube".to_string(),
            Error::CommonError(e) => e.metric_label().split('(').next().unwrap_or("common").to_string(),
            Error::IllegalMqttCluster(_) => "illegal_mqtt_cluster".to_string(),
            Error::Other(_) => "other".to_string(),
        }
    }

    /// Conflicting writes (stale resourceVersion, object already exists)
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => e.code == 409,
            Error::CommonError(common::Error::KubeError(kube::Error::Api(e))) => e.code == 409,
            _ => false,
        }
    }
}

#[async_trait]
pub trait Reconciler {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action>;
}

/// Process configuration
pub mod config;
/// Typed seam over the broker management API
pub mod broker;
pub mod events;

/// State machinery for kube, as exposeable to actix
pub mod manager;
pub use manager::Manager;

/// Reconciliation pipeline
pub mod bootstrap;
pub mod listeners;
pub mod mqttcluster;
pub mod nodestatus;
pub mod retirement;
pub mod serviceability;
pub mod statemachine;
pub mod workload;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

pub use common::mqttcluster::MqttCluster;
