use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("K8s error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Json decoding error: {0}")]
    JsonError(#[source] serde_json::Error),

    #[error("{0} query failed: {1}")]
    MethodFailed(String, u16, String),

    #[error("Semver error {0}")]
    Semver(#[from] semver::Error),

    #[error("Error: {0}")]
    Other(String),
}
impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }

    /// HTTP status code carried by a failed management API call, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::MethodFailed(_, code, _) => Some(*code),
            Error::ReqwestError(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod brokerapi;
pub mod context;
pub mod hasheshandlers;
pub mod httphandler;
pub mod k8sworkload;
pub mod mqttcluster;
mod semverhandler;
pub mod tools;
pub use context::get_client_name;
pub use semverhandler::Semver;

/// Label carrying the owning cluster name
pub static LABEL_INSTANCE: &str = "apps.kubernetes.io/instance";
/// Label flagging objects handled by this operator
pub static LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label carrying the broker role (core or replicant)
pub static LABEL_DB_ROLE: &str = "mqtt.solidite.fr/db-role";
/// Label carrying the generation hash of a pod template
pub static LABEL_POD_TEMPLATE_HASH: &str = "pod-template-hash";
/// Annotation storing the pod template a workload was rendered from
pub static ANNOTATION_LAST_APPLIED: &str = "mqtt.solidite.fr/last-applied-template";
/// Annotation storing the hash of the configuration the running brokers last accepted
pub static ANNOTATION_PUSHED_CONFIG: &str = "mqtt.solidite.fr/pushed-config";
/// Pod condition (and readiness gate) signaling the node may receive client traffic
pub static POD_ON_SERVING: &str = "mqtt.solidite.fr/on-serving";
/// Annotation hinting the replicaset controller which pod to remove first
pub static ANNOTATION_DELETION_COST: &str = "controller.kubernetes.io/pod-deletion-cost";
/// Management API port of the broker
pub static DASHBOARD_PORT: i32 = 18083;
