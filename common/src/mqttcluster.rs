use crate::{
    Error, LABEL_DB_ROLE, LABEL_INSTANCE, LABEL_MANAGED_BY, Result,
    context::{get_reporter, get_short_name},
};
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{EnvVar, ResourceRequirements, Toleration},
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::{
    Client, CustomResource, Resource, ResourceExt,
    api::{Api, Patch, PatchParams},
    runtime::events::{Event, Recorder},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

/// Broker role of a node
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Stateful node with an ordinal identity
    Core,
    /// Disposable node without durable state
    Replicant,
}
impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Core => "core",
            Role::Replicant => "replicant",
        }
    }
}
impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker edition, only the session-aware one supports evacuations
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum Edition {
    #[default]
    Community,
    SessionAware,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Running,
    Stopped,
}

/// Settings shared by every pod of a role
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplate {
    /// Number of nodes of this role
    pub replicas: i32,
    /// Extra labels for the pods
    pub labels: Option<BTreeMap<String, String>>,
    /// Extra annotations for the pods
    pub annotations: Option<BTreeMap<String, String>>,
    /// Extra environment variables for the broker container
    pub env: Option<Vec<EnvVar>>,
    /// Resources of the broker container
    pub resources: Option<ResourceRequirements>,
    pub node_selector: Option<BTreeMap<String, String>>,
    pub tolerations: Option<Vec<Toleration>>,
}

fn default_initial_delay() -> i64 {
    10
}
fn default_wait_takeover() -> i64 {
    10
}
fn default_evict_rate() -> i32 {
    1000
}

/// How sessions are moved away from a retiring node
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvacuationStrategy {
    /// Seconds to wait for session takeover once a node has no session left
    #[serde(default = "default_wait_takeover")]
    pub wait_takeover: i64,
    /// Connections evicted per second
    #[serde(default = "default_evict_rate")]
    pub conn_evict_rate: i32,
    /// Sessions evicted per second
    #[serde(default = "default_evict_rate")]
    pub sess_evict_rate: i32,
}
impl Default for EvacuationStrategy {
    fn default() -> Self {
        Self {
            wait_takeover: default_wait_takeover(),
            conn_evict_rate: default_evict_rate(),
            sess_evict_rate: default_evict_rate(),
        }
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    /// Seconds the cluster must stay Available before old nodes are retired
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: i64,
    #[serde(default)]
    pub evacuation_strategy: EvacuationStrategy,
}
impl Default for UpdateStrategy {
    fn default() -> Self {
        Self {
            initial_delay_seconds: default_initial_delay(),
            evacuation_strategy: EvacuationStrategy::default(),
        }
    }
}

/// Bootstrap configuration of the broker
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
pub struct BootstrapConfig {
    /// HOCON configuration text
    pub data: String,
}

#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTemplate {
    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Describe a MQTT broker cluster
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    kind = "MqttCluster",
    status = "MqttClusterStatus",
    shortname = "mqc",
    group = "mqtt.solidite.fr",
    version = "v1",
    namespaced
)]
#[kube(
    doc = "Custom resource representing a MQTT broker cluster",
    printcolumn = r#"
    {"name":"image",  "type":"string", "description":"Broker image", "jsonPath":".spec.image"},
    {"name":"core",   "type":"integer", "description":"Core nodes", "jsonPath":".spec.coreTemplate.replicas"},
    {"name":"ready",  "type":"integer", "description":"Ready core nodes", "jsonPath":".status.coreNodesStatus.readyReplicas"},
    {"name":"stage",  "type":"string", "description":"Stage", "jsonPath":".status.conditions[0].type"},
    {"name":"last_updated", "type":"date", "description":"Last update date", "format": "date-time", "jsonPath":".status.conditions[0].lastTransitionTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MqttClusterSpec {
    /// Broker image
    pub image: String,
    pub image_pull_policy: Option<String>,
    /// Kubernetes cluster domain (default: cluster.local)
    pub cluster_domain: Option<String>,
    /// Bootstrap configuration
    pub config: Option<BootstrapConfig>,
    /// Core nodes template
    pub core_template: RoleTemplate,
    /// Replicant nodes template, no replicant when unset
    pub replicant_template: Option<RoleTemplate>,
    /// Node retirement parameters
    pub update_strategy: Option<UpdateStrategy>,
    /// Listeners service settings
    pub listeners_service_template: Option<ServiceTemplate>,
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default, Hash)]
pub enum ConditionsType {
    #[default]
    Initialized,
    CoreNodesProgressing,
    CoreNodesReady,
    ReplicantNodesProgressing,
    ReplicantNodesReady,
    Available,
    Ready,
}
impl ConditionsType {
    /// Every type that follows Initialized in the lifecycle
    pub fn downstream() -> Vec<ConditionsType> {
        vec![
            ConditionsType::CoreNodesProgressing,
            ConditionsType::CoreNodesReady,
            ConditionsType::ReplicantNodesProgressing,
            ConditionsType::ReplicantNodesReady,
            ConditionsType::Available,
            ConditionsType::Ready,
        ]
    }

    pub fn is_replicant(&self) -> bool {
        matches!(
            self,
            ConditionsType::ReplicantNodesProgressing | ConditionsType::ReplicantNodesReady
        )
    }
}

#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Copy, Debug, JsonSchema, Default)]
pub enum ConditionsStatus {
    #[default]
    True,
    False,
}

/// ApplicationCondition is a named, timestamped fact about the cluster
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCondition {
    /// LastTransitionTime is the last time the status of this condition changed
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine readable reason of the last transition
    pub reason: String,
    /// Message contains human-readable message indicating details about condition
    pub message: String,
    /// Type is an application condition type
    #[serde(rename = "type")]
    pub condition_type: ConditionsType,
    /// Status ("True" or "False") describe if the condition is enabled
    pub status: ConditionsStatus,
}

impl ApplicationCondition {
    #[must_use]
    pub fn new(
        condition_type: ConditionsType,
        status: ConditionsStatus,
        reason: &str,
        message: &str,
    ) -> ApplicationCondition {
        ApplicationCondition {
            last_transition_time: Some(Utc::now()),
            reason: reason.to_string(),
            message: message.to_string(),
            condition_type,
            status,
        }
    }

    #[must_use]
    pub fn at(mut self, time: DateTime<Utc>) -> ApplicationCondition {
        self.last_transition_time = Some(time);
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionsStatus::True
    }
}

/// A broker node as reported by the management API
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Erlang node name (broker@host)
    pub node_id: String,
    pub status: NodeState,
    pub edition: Edition,
    pub version: String,
    pub session_count: i64,
    /// Uptime in milliseconds
    pub uptime: i64,
    pub role: Role,
}

/// Observed state of the nodes of one role
#[derive(Serialize, Deserialize, Eq, PartialEq, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodesStatus {
    /// Desired replicas
    pub replicas: i32,
    /// Ready replicas over every generation
    pub ready_replicas: i32,
    /// Oldest generation still holding replicas
    pub current_revision: Option<String>,
    pub current_replicas: i32,
    /// Generation receiving new capacity
    pub update_revision: Option<String>,
    pub update_replicas: i32,
    /// Bumped on generation naming collision
    pub collision_count: Option<i32>,
    #[serde(default)]
    pub nodes: Vec<NodeInfo>,
}
impl NodesStatus {
    pub fn is_converged(&self) -> bool {
        self.ready_replicas == self.replicas && self.update_revision == self.current_revision
    }
}

/// The status object of `MqttCluster`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MqttClusterStatus {
    /// Conditions, most recent transition first
    #[serde(default)]
    pub conditions: Vec<ApplicationCondition>,
    pub core_nodes_status: Option<NodesStatus>,
    pub replicant_nodes_status: Option<NodesStatus>,
    /// metadata.generation the conditions were computed for
    pub observed_generation: Option<i64>,
}

impl MqttClusterStatus {
    pub fn get_condition(&self, t: ConditionsType) -> Option<&ApplicationCondition> {
        self.conditions.iter().find(|c| c.condition_type == t)
    }

    pub fn is_condition_true(&self, t: ConditionsType) -> bool {
        self.get_condition(t).is_some_and(|c| c.is_true())
    }

    /// Latest condition that holds true
    pub fn current_state(&self) -> Option<ConditionsType> {
        self.conditions.iter().find(|c| c.is_true()).map(|c| c.condition_type)
    }

    /// Insert or refresh a condition.
    ///
    /// The transition time is only moved when the status value changes, then
    /// the list is kept sorted by transition time, most recent first.
    pub fn set_condition(&mut self, mut cond: ApplicationCondition) {
        if let Some(pos) = self
            .conditions
            .iter()
            .position(|c| c.condition_type == cond.condition_type)
        {
            let old = self.conditions.remove(pos);
            if old.status == cond.status {
                cond.last_transition_time = old.last_transition_time;
            }
        }
        self.conditions.insert(0, cond);
        self.conditions
            .sort_by(|a, b| b.last_transition_time.cmp(&a.last_transition_time));
    }

    pub fn remove_conditions(&mut self, types: &[ConditionsType]) {
        self.conditions.retain(|c| !types.contains(&c.condition_type));
    }

    pub fn nodes_status(&self, role: Role) -> Option<&NodesStatus> {
        match role {
            Role::Core => self.core_nodes_status.as_ref(),
            Role::Replicant => self.replicant_nodes_status.as_ref(),
        }
    }

    pub fn nodes_status_mut(&mut self, role: Role) -> &mut NodesStatus {
        match role {
            Role::Core => self.core_nodes_status.get_or_insert_with(NodesStatus::default),
            Role::Replicant => self.replicant_nodes_status.get_or_insert_with(NodesStatus::default),
        }
    }

    pub fn collision_count(&self, role: Role) -> i32 {
        self.nodes_status(role)
            .and_then(|s| s.collision_count)
            .unwrap_or(0)
    }
}

impl MqttCluster {
    pub fn has_replicant(&self) -> bool {
        self.spec
            .replicant_template
            .as_ref()
            .is_some_and(|t| t.replicas > 0)
    }

    pub fn role_template(&self, role: Role) -> Option<&RoleTemplate> {
        match role {
            Role::Core => Some(&self.spec.core_template),
            Role::Replicant => self.spec.replicant_template.as_ref().filter(|t| t.replicas > 0),
        }
    }

    /// Role the listeners service routes client traffic to
    pub fn traffic_role(&self) -> Role {
        if self.has_replicant() {
            Role::Replicant
        } else {
            Role::Core
        }
    }

    pub fn update_strategy(&self) -> UpdateStrategy {
        self.spec.update_strategy.clone().unwrap_or_default()
    }

    pub fn cluster_domain(&self) -> String {
        self.spec
            .cluster_domain
            .clone()
            .unwrap_or_else(|| "cluster.local".to_string())
    }

    pub fn headless_service_name(&self) -> String {
        format!("{}-headless", self.name_any())
    }

    pub fn dashboard_service_name(&self) -> String {
        format!("{}-dashboard", self.name_any())
    }

    pub fn listeners_service_name(&self) -> String {
        format!("{}-listeners", self.name_any())
    }

    pub fn bootstrap_config_name(&self) -> String {
        format!("{}-bootstrap-config", self.name_any())
    }

    pub fn bootstrap_secret_name(&self) -> String {
        format!("{}-bootstrap-api-key", self.name_any())
    }

    /// Labels shared by every object of this cluster
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED_BY.to_string(), "mqtt-operator".to_string()),
            (LABEL_INSTANCE.to_string(), self.name_any()),
        ])
    }

    pub fn role_labels(&self, role: Role) -> BTreeMap<String, String> {
        let mut labels = self.labels();
        labels.insert(LABEL_DB_ROLE.to_string(), role.to_string());
        labels
    }

    pub fn role_selector(&self, role: Role) -> String {
        self.role_labels(role)
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<String>>()
            .join(",")
    }

    pub fn owner_reference(&self) -> Result<OwnerReference> {
        self.controller_owner_ref(&())
            .ok_or_else(|| Error::Other(format!("MqttCluster {} has no uid yet", self.name_any())))
    }

    /// Persist the status, guarded by the resource version this object was read at
    pub async fn patch_status(&self, client: Client, status: &MqttClusterStatus) -> Result<Self> {
        let ns = self
            .namespace()
            .ok_or_else(|| Error::Other("MqttCluster is namespaced".to_string()))?;
        let api = Api::<Self>::namespaced(client, &ns);
        let mut patch = json!({
            "apiVersion": "mqtt.solidite.fr/v1",
            "kind": "MqttCluster",
            "status": status
        });
        if let Some(rv) = self.resource_version() {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        let ps = PatchParams::apply(get_short_name().as_str());
        api.patch_status(&self.name_any(), &ps, &Patch::Merge(patch))
            .await
            .map_err(Error::KubeError)
    }

    pub async fn send_event(&self, client: Client, ev: Event) -> Result<()> {
        let recorder = Recorder::new(client, get_reporter(), self.object_ref(&()));
        match recorder.publish(ev).await {
            Ok(_) => Ok(()),
            Err(e) => match e {
                kube::Error::Api(src) => {
                    tracing::warn!("Ignoring {:?} while sending an event", src);
                    Ok(())
                }
                _ => Err(Error::KubeError(e)),
            },
        }
    }
}
