use crate::{MqttCluster, broker::BrokerApi, events, workload::headless_domain};
use common::{
    LABEL_POD_TEMPLATE_HASH,
    mqttcluster::{NodeInfo, Role},
};
use k8s_openapi::api::core::v1::Pod;
use kube::{Client, ResourceExt};

fn pod_condition_true(pod: &Pod, condition: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.type_ == condition && c.status == "True"))
}

pub fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .filter(|ip| !ip.is_empty())
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none() && pod_condition_true(pod, "Ready")
}

pub fn is_containers_ready(pod: &Pod) -> bool {
    pod_condition_true(pod, "ContainersReady")
}

/// Broker node name of a pod, `None` while a replicant has no IP yet
pub fn node_name(cluster: &MqttCluster, role: Role, pod: &Pod) -> Option<String> {
    let prefix = crate::workload::NODE_NAME_PREFIX;
    match role {
        Role::Core => Some(format!("{prefix}@{}.{}", pod.name_any(), headless_domain(cluster))),
        Role::Replicant => pod_ip(pod).map(|ip| format!("{prefix}@{ip}")),
    }
}

/// Host of the core pod the management API is queried through.
///
/// Only ready pods qualify, pods of the current generation are preferred.
pub fn requester_host(core_pods: &[Pod], current_hash: Option<&str>) -> Option<String> {
    let ready: Vec<&Pod> = core_pods
        .iter()
        .filter(|p| is_pod_ready(p) && pod_ip(p).is_some())
        .collect();
    ready
        .iter()
        .find(|p| current_hash.is_some() && p.labels().get(LABEL_POD_TEMPLATE_HASH).map(String::as_str) == current_hash)
        .or_else(|| ready.first())
        .and_then(|p| pod_ip(p))
}

/// Split the roster per role, each list sorted by ascending uptime
pub fn partition_roster(nodes: Vec<NodeInfo>) -> (Vec<NodeInfo>, Vec<NodeInfo>) {
    let (mut core, mut replicant): (Vec<NodeInfo>, Vec<NodeInfo>) =
        nodes.into_iter().partition(|n| n.role == Role::Core);
    core.sort_by_key(|n| n.uptime);
    replicant.sort_by_key(|n| n.uptime);
    (core, replicant)
}

/// Core and replicant rosters
pub async fn fetch_roster(api: &dyn BrokerApi) -> common::Result<(Vec<NodeInfo>, Vec<NodeInfo>)> {
    Ok(partition_roster(api.nodes().await?))
}

/// Fetch the node roster.
///
/// A failure is reported as a warning event and yields `None`, the previous
/// roster is then kept by the caller.
pub async fn collect(
    cluster: &MqttCluster,
    client: Client,
    api: Option<&dyn BrokerApi>,
) -> Option<(Vec<NodeInfo>, Vec<NodeInfo>)> {
    let api = api?;
    match fetch_roster(api).await {
        Ok(roster) => Some(roster),
        Err(e) => {
            tracing::warn!("Getting the node roster of {} failed: {e}", cluster.name_any());
            if let Err(e) = cluster
                .send_event(client, events::node_status_failed(e.to_string()))
                .await
            {
                tracing::warn!("Sending the event failed: {e}");
            }
            None
        }
    }
}
