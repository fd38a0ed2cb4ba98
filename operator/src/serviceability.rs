use crate::{
    Error, MqttCluster, Result,
    broker::{BrokerApi, BrokerCredentials},
    nodestatus::{is_containers_ready, node_name, pod_ip},
};
use chrono::Utc;
use common::{
    POD_ON_SERVING, Semver,
    mqttcluster::{Edition, NodeInfo, Role},
};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client, ResourceExt,
    api::{Api, Patch, PatchParams},
};
use serde_json::json;

/// Value of the on-serving pod condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Serving {
    True,
    False,
    Unknown,
}

impl Serving {
    pub fn as_str(&self) -> &'static str {
        match self {
            Serving::True => "True",
            Serving::False => "False",
            Serving::Unknown => "Unknown",
        }
    }
}

/// Only session-aware brokers from 5.0.3 on answer the availability check
pub fn needs_availability_check(node: Option<&NodeInfo>) -> bool {
    node.is_some_and(|n| {
        n.edition == Edition::SessionAware
            && Semver::opt_parse(&n.version).is_some_and(|v| v.is_at_least(5, 0, 3))
    })
}

/// Current value of the gate on a pod
pub fn current(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == POD_ON_SERVING))
        .map(|c| c.status.as_str())
}

/// Gate value a pod should carry.
///
/// `api` has to reach the pod itself, it is only called for traffic-serving
/// pods of brokers supporting the availability check.
pub async fn evaluate(
    pod: &Pod,
    serves_traffic: bool,
    node: Option<&NodeInfo>,
    api: Option<&dyn BrokerApi>,
) -> Serving {
    if !is_containers_ready(pod) {
        return Serving::False;
    }
    if !serves_traffic || !needs_availability_check(node) {
        return Serving::True;
    }
    let Some(api) = api else {
        return Serving::Unknown;
    };
    match api.availability_check().await {
        Ok(true) => Serving::True,
        Ok(false) => Serving::False,
        Err(e) => {
            tracing::debug!("Availability check of {} failed: {e}", pod.name_any());
            Serving::Unknown
        }
    }
}

async fn patch_gate(client: Client, pod: &Pod, serving: Serving) -> Result<()> {
    let ns = pod.namespace().unwrap_or_default();
    let patch = json!({
        "status": {
            "conditions": [{
                "type": POD_ON_SERVING,
                "status": serving.as_str(),
                "lastProbeTime": null,
                "lastTransitionTime": Utc::now(),
            }]
        }
    });
    Api::<Pod>::namespaced(client, &ns)
        .patch_status(&pod.name_any(), &PatchParams::default(), &Patch::Strategic(patch))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

/// Refresh the gate of every pod of a role, return how many pods changed
pub async fn sync_role(
    cluster: &MqttCluster,
    role: Role,
    pods: &[Pod],
    roster: &[NodeInfo],
    credentials: &BrokerCredentials,
    client: Client,
) -> Result<usize> {
    let serves_traffic = cluster.traffic_role() == role;
    let mut changed = 0;
    for pod in pods.iter().filter(|p| p.metadata.deletion_timestamp.is_none()) {
        let name = node_name(cluster, role, pod);
        let node = name
            .as_deref()
            .and_then(|n| roster.iter().find(|r| r.node_id == n));
        let direct = pod_ip(pod).map(|ip| credentials.connect(&ip));
        let serving = evaluate(
            pod,
            serves_traffic,
            node,
            direct.as_ref().map(|c| c as &dyn BrokerApi),
        )
        .await;
        if current(pod) != Some(serving.as_str()) {
            tracing::info!("Setting {POD_ON_SERVING}={} on pod {}", serving.as_str(), pod.name_any());
            patch_gate(client.clone(), pod, serving).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker::MockBrokerApi, nodestatus::tests::{node, pod}};
    use k8s_openapi::api::core::v1::PodCondition;

    fn community(version: &str) -> NodeInfo {
        NodeInfo {
            edition: Edition::Community,
            version: version.to_string(),
            ..node("broker@10.0.0.1", Role::Replicant, 10, 0)
        }
    }

    #[test]
    fn test_availability_check_support() {
        let mut n = node("broker@10.0.0.1", Role::Replicant, 10, 0);
        assert!(needs_availability_check(Some(&n)));
        n.version = "5.0.2".to_string();
        assert!(!needs_availability_check(Some(&n)));
        n.version = "5.0.3-rc.1".to_string();
        assert!(needs_availability_check(Some(&n)));
        assert!(!needs_availability_check(Some(&community("5.6.0"))));
        assert!(!needs_availability_check(None));
    }

    #[tokio::test]
    async fn test_mirrors_containers_ready_without_check() {
        let api = MockBrokerApi::new();
        let ready = pod("mqtt-core-abc-0", "abc", Some("10.0.0.1"), true);
        let n = community("5.1.0");
        assert_eq!(evaluate(&ready, true, Some(&n), Some(&api)).await, Serving::True);
        let not_ready = pod("mqtt-core-abc-1", "abc", Some("10.0.0.2"), false);
        assert_eq!(evaluate(&not_ready, true, Some(&n), Some(&api)).await, Serving::False);
    }

    #[tokio::test]
    async fn test_non_traffic_pods_skip_check() {
        let api = MockBrokerApi::new();
        let p = pod("mqtt-core-abc-0", "abc", Some("10.0.0.1"), true);
        let n = node("broker@mqtt-core-abc-0", Role::Core, 10, 0);
        assert_eq!(evaluate(&p, false, Some(&n), Some(&api)).await, Serving::True);
    }

    #[tokio::test]
    async fn test_availability_check_answers() {
        let p = pod("mqtt-replicant-abc-x", "abc", Some("10.0.0.1"), true);
        let n = node("broker@10.0.0.1", Role::Replicant, 10, 0);

        let mut api = MockBrokerApi::new();
        api.expect_availability_check().times(1).returning(|| Ok(true));
        assert_eq!(evaluate(&p, true, Some(&n), Some(&api)).await, Serving::True);

        let mut api = MockBrokerApi::new();
        api.expect_availability_check().times(1).returning(|| Ok(false));
        assert_eq!(evaluate(&p, true, Some(&n), Some(&api)).await, Serving::False);

        let mut api = MockBrokerApi::new();
        api.expect_availability_check()
            .times(1)
            .returning(|| Err(common::Error::Other("connection refused".to_string())));
        assert_eq!(evaluate(&p, true, Some(&n), Some(&api)).await, Serving::Unknown);
    }

    #[test]
    fn test_current_gate() {
        let mut p = pod("mqtt-core-abc-0", "abc", Some("10.0.0.1"), true);
        assert_eq!(current(&p), None);
        if let Some(conditions) = p.status.as_mut().and_then(|s| s.conditions.as_mut()) {
            conditions.push(PodCondition {
                type_: POD_ON_SERVING.to_string(),
                status: "False".to_string(),
                ..Default::default()
            });
        }
        assert_eq!(current(&p), Some("False"));
    }
}
