use crate::{
    Error, MqttCluster, Result,
    broker::BrokerApi,
    nodestatus::{is_pod_ready, node_name},
    workload::{RoleGenerations, scale_generation},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    ANNOTATION_DELETION_COST,
    brokerapi::EvacuationRequest,
    k8sworkload::Generation,
    mqttcluster::{ConditionsType, Edition, EvacuationStrategy, MqttClusterStatus, NodeInfo, Role},
};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{
    Client, ResourceExt,
    api::{Api, ListParams, Patch, PatchParams},
};
use serde_json::json;

#[cfg(test)]
use mockall::automock;

/// Deletion cost set on a replicant pod right before its replica set shrinks
pub static RETIRING_POD_COST: &str = "-99999";

/// Workload writes and reads needed to retire a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadOps: Send + Sync {
    /// Time of the latest pod removal performed by the workload controller
    async fn last_scale_down(&self, role: Role, generation: &str) -> Result<Option<DateTime<Utc>>>;

    /// Make `pod` the first one the replica set controller removes
    async fn mark_for_deletion(&self, pod: &str) -> Result<()>;

    async fn scale(&self, role: Role, generation: &str, replicas: i32) -> Result<()>;
}

pub struct KubeWorkloads<'a> {
    pub cluster: &'a MqttCluster,
    pub client: Client,
}

fn event_time(ev: &Event) -> Option<DateTime<Utc>> {
    ev.last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| ev.event_time.as_ref().map(|t| t.0))
        .or_else(|| ev.first_timestamp.as_ref().map(|t| t.0))
}

#[async_trait]
impl WorkloadOps for KubeWorkloads<'_> {
    async fn last_scale_down(&self, role: Role, generation: &str) -> Result<Option<DateTime<Utc>>> {
        let ns = self.cluster.namespace().unwrap_or_default();
        let kind = match role {
            Role::Core => "StatefulSet",
            Role::Replicant => "ReplicaSet",
        };
        let lp = ListParams::default().fields(&format!(
            "involvedObject.kind={kind},involvedObject.name={generation},reason=SuccessfulDelete"
        ));
        let events = Api::<Event>::namespaced(self.client.clone(), &ns)
            .list(&lp)
            .await
            .map_err(Error::KubeError)?;
        Ok(events.items.iter().filter_map(event_time).max())
    }

    async fn mark_for_deletion(&self, pod: &str) -> Result<()> {
        let ns = self.cluster.namespace().unwrap_or_default();
        let patch = Patch::Merge(json!({
            "metadata": { "annotations": { ANNOTATION_DELETION_COST: RETIRING_POD_COST } }
        }));
        Api::<Pod>::namespaced(self.client.clone(), &ns)
            .patch(pod, &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    async fn scale(&self, role: Role, generation: &str, replicas: i32) -> Result<()> {
        scale_generation(self.cluster, role, generation, replicas, self.client.clone()).await
    }
}

/// What to do with the selected stale node this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Shrink the stale generation by one
    Remove,
    /// Start moving the sessions of the node away
    Evacuate(EvacuationRequest),
    /// An evacuation is running, the node still holds sessions
    AwaitEvacuation(i64),
    /// Sessions are gone, give clients time to take them over (seconds left)
    AwaitTakeover(i64),
    /// Sessions have to move but no ready node can take them
    AwaitTargets,
}

/// One retirement step taken on a role
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetirementStep {
    pub role: Role,
    pub generation: String,
    pub pod: String,
    pub node: String,
    /// Replica count of the generation once the step is done
    pub replicas: i32,
    pub decision: Decision,
}

/// Retirement starts once the cluster has stayed Available long enough.
/// Replicants wait for every stale core generation to be drained.
pub fn may_retire(
    status: &MqttClusterStatus,
    initial_delay: i64,
    role: Role,
    core_draining: bool,
    now: DateTime<Utc>,
) -> bool {
    if role == Role::Replicant && core_draining {
        return false;
    }
    status
        .get_condition(ConditionsType::Available)
        .filter(|c| c.is_true())
        .and_then(|c| c.last_transition_time)
        .is_some_and(|t| now - t >= Duration::seconds(initial_delay))
}

/// Pod to retire in a stale generation: the highest ordinal for core nodes,
/// the oldest pod for replicants
pub fn pick_pod<'a>(role: Role, generation: &Generation, pods: &'a [Pod]) -> Option<&'a Pod> {
    match role {
        Role::Core => {
            let name = format!("{}-{}", generation.name, generation.replicas - 1);
            pods.iter().find(|p| p.name_any() == name)
        }
        Role::Replicant => pods
            .iter()
            .filter(|p| generation.owns(p) && p.metadata.deletion_timestamp.is_none())
            .min_by(|a, b| {
                a.metadata
                    .creation_timestamp
                    .cmp(&b.metadata.creation_timestamp)
                    .then_with(|| a.name_any().cmp(&b.name_any()))
            }),
    }
}

/// Ready nodes of a generation, where sessions migrate to
pub fn migration_targets(cluster: &MqttCluster, role: Role, generation: Option<&Generation>, pods: &[Pod]) -> Vec<String> {
    let Some(generation) = generation else {
        return vec![];
    };
    pods.iter()
        .filter(|p| generation.owns(p) && is_pod_ready(p))
        .filter_map(|p| node_name(cluster, role, p))
        .collect()
}

/// The node holds sessions that have to be evacuated before removal
pub fn needs_evacuation(node: Option<&NodeInfo>) -> bool {
    node.is_some_and(|n| n.edition == Edition::SessionAware && n.session_count > 0)
}

pub fn decide(
    node: Option<&NodeInfo>,
    evacuating: bool,
    targets: Vec<String>,
    strategy: &EvacuationStrategy,
    last_scale_down: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Decision {
    let Some(node) = node else {
        return Decision::Remove;
    };
    if needs_evacuation(Some(node)) {
        if evacuating {
            return Decision::AwaitEvacuation(node.session_count);
        }
        if targets.is_empty() {
            return Decision::AwaitTargets;
        }
        return Decision::Evacuate(EvacuationRequest {
            conn_evict_rate: strategy.conn_evict_rate,
            sess_evict_rate: strategy.sess_evict_rate,
            migrate_to: targets,
            wait_takeover: Some(strategy.wait_takeover),
        });
    }
    match last_scale_down {
        Some(t) => {
            let elapsed = (now - t).num_seconds();
            if elapsed < strategy.wait_takeover {
                Decision::AwaitTakeover(strategy.wait_takeover - elapsed)
            } else {
                Decision::Remove
            }
        }
        None => Decision::Remove,
    }
}

/// Move the oldest stale generation of a role one step closer to zero.
///
/// At most one node is acted on per call.
#[allow(clippy::too_many_arguments)]
pub async fn retire(
    cluster: &MqttCluster,
    generations: &RoleGenerations,
    core_draining: bool,
    pods: &[Pod],
    targets: Vec<String>,
    status: &MqttClusterStatus,
    api: &dyn BrokerApi,
    ops: &dyn WorkloadOps,
    now: DateTime<Utc>,
) -> Result<Option<RetirementStep>> {
    let role = generations.role;
    let strategy = cluster.update_strategy();
    let Some(stale) = generations.stale().first().copied() else {
        return Ok(None);
    };
    if !may_retire(status, strategy.initial_delay_seconds, role, core_draining, now) {
        tracing::debug!("Not retiring {role} generation {} yet", stale.name);
        return Ok(None);
    }
    let Some(pod) = pick_pod(role, stale, pods) else {
        tracing::debug!("No pod to retire in {role} generation {}", stale.name);
        return Ok(None);
    };
    let Some(node) = node_name(cluster, role, pod) else {
        return Ok(None);
    };

    let info = api.node(&node).await?;
    let evacuating = if needs_evacuation(info.as_ref()) {
        api.evacuations().await?.contains(&node)
    } else {
        false
    };
    let last_scale_down = if info.is_some() && !needs_evacuation(info.as_ref()) {
        ops.last_scale_down(role, &stale.name).await?
    } else {
        None
    };
    let decision = decide(
        info.as_ref(),
        evacuating,
        targets,
        &strategy.evacuation_strategy,
        last_scale_down,
        now,
    );

    let mut replicas = stale.replicas;
    match &decision {
        Decision::Evacuate(req) => {
            tracing::info!("Evacuating {node} toward {:?}", req.migrate_to);
            api.start_evacuation(&node, req).await?;
        }
        Decision::Remove => {
            replicas -= 1;
            tracing::info!("Removing {node}, scaling {} to {replicas}", stale.name);
            if role == Role::Replicant {
                ops.mark_for_deletion(&pod.name_any()).await?;
            }
            ops.scale(role, &stale.name, replicas).await?;
        }
        Decision::AwaitEvacuation(sessions) => {
            tracing::debug!("{node} still holds {sessions} sessions");
        }
        Decision::AwaitTakeover(left) => {
            tracing::debug!("Waiting {left}s for session takeover before removing {node}");
        }
        Decision::AwaitTargets => {
            tracing::info!("No ready node to evacuate {node} to, retrying later");
        }
    }

    Ok(Some(RetirementStep {
        role,
        generation: stale.name.clone(),
        pod: pod.name_any(),
        node,
        replicas,
        decision,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerApi,
        nodestatus::tests::{cluster, node, pod},
    };
    use common::{
        k8sworkload::Generations,
        mqttcluster::{ApplicationCondition, ConditionsStatus, NodeState},
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn generation(role: Role, hash: &str, age: i64, replicas: i32) -> Generation {
        Generation {
            name: format!("mqtt-{role}-{hash}"),
            role,
            hash: Some(hash.to_string()),
            replicas,
            ready_replicas: replicas,
            created: Some(Utc::now() - Duration::seconds(age)),
            last_applied: None,
        }
    }

    fn rollout(role: Role) -> RoleGenerations {
        RoleGenerations {
            role,
            hash: Some("new".to_string()),
            desired: 3,
            generations: Generations::new(vec![
                generation(role, "old", 1000, 3),
                generation(role, "new", 100, 3),
            ]),
            collided: false,
        }
    }

    fn available_since(seconds: i64, now: DateTime<Utc>) -> MqttClusterStatus {
        let mut status = MqttClusterStatus::default();
        status.set_condition(
            ApplicationCondition::new(ConditionsType::Available, ConditionsStatus::True, "Test", "")
                .at(now - Duration::seconds(seconds)),
        );
        status
    }

    fn core_pods() -> Vec<Pod> {
        (0..3)
            .map(|i| pod(&format!("mqtt-core-old-{i}"), "old", Some(&format!("10.0.0.{i}")), true))
            .collect()
    }

    static OLD_CORE_2: &str = "broker@mqtt-core-old-2.mqtt-headless.default.svc.cluster.local";

    #[test]
    fn test_may_retire_waits_for_initial_delay() {
        let now = Utc::now();
        assert!(!may_retire(&available_since(5, now), 10, Role::Core, false, now));
        assert!(may_retire(&available_since(10, now), 10, Role::Core, false, now));
        assert!(!may_retire(&MqttClusterStatus::default(), 10, Role::Core, false, now));
        assert!(!may_retire(&available_since(60, now), 10, Role::Replicant, true, now));
    }

    #[test]
    fn test_pick_core_highest_ordinal() {
        let g = generation(Role::Core, "old", 1000, 3);
        let pods = core_pods();
        assert_eq!(pick_pod(Role::Core, &g, &pods).unwrap().name_any(), "mqtt-core-old-2");
    }

    #[test]
    fn test_pick_replicant_oldest_pod() {
        let g = generation(Role::Replicant, "old", 1000, 2);
        let mut young = pod("mqtt-replicant-old-aaaaa", "old", Some("10.0.1.1"), true);
        young.metadata.creation_timestamp = Some(Time(Utc::now() - Duration::seconds(10)));
        let mut old = pod("mqtt-replicant-old-zzzzz", "old", Some("10.0.1.2"), true);
        old.metadata.creation_timestamp = Some(Time(Utc::now() - Duration::seconds(500)));
        let other = pod("mqtt-replicant-new-bbbbb", "new", Some("10.0.1.3"), true);
        let pods = vec![young, other, old];
        assert_eq!(
            pick_pod(Role::Replicant, &g, &pods).unwrap().name_any(),
            "mqtt-replicant-old-zzzzz"
        );
    }

    #[test]
    fn test_decide_takeover_window() {
        let now = Utc::now();
        let strategy = EvacuationStrategy::default();
        let n = node("broker@x", Role::Core, 10, 0);
        assert_eq!(
            decide(Some(&n), false, vec![], &strategy, Some(now - Duration::seconds(4)), now),
            Decision::AwaitTakeover(6)
        );
        assert_eq!(
            decide(Some(&n), false, vec![], &strategy, Some(now - Duration::seconds(30)), now),
            Decision::Remove
        );
        assert_eq!(decide(Some(&n), false, vec![], &strategy, None, now), Decision::Remove);
    }

    #[test]
    fn test_community_node_is_never_evacuated() {
        let now = Utc::now();
        let n = NodeInfo {
            edition: Edition::Community,
            ..node("broker@x", Role::Core, 10, 500)
        };
        assert_eq!(
            decide(Some(&n), false, vec![], &EvacuationStrategy::default(), None, now),
            Decision::Remove
        );
    }

    #[tokio::test]
    async fn test_sessions_trigger_evacuation_not_removal() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node()
            .withf(|n| n == OLD_CORE_2)
            .times(1)
            .returning(|n| Ok(Some(node(n, Role::Core, 1000, 150))));
        api.expect_evacuations().times(1).returning(|| Ok(vec![]));
        api.expect_start_evacuation()
            .withf(|n, req| n == OLD_CORE_2 && req.migrate_to == vec!["broker@new-0".to_string()])
            .times(1)
            .returning(|_, _| Ok(()));
        let mut ops = MockWorkloadOps::new();
        ops.expect_scale().never();
        ops.expect_last_scale_down().never();

        let step = retire(
            &c,
            &rollout(Role::Core),
            true,
            &core_pods(),
            vec!["broker@new-0".to_string()],
            &available_since(60, now),
            &api,
            &ops,
            now,
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(step.decision, Decision::Evacuate(_)));
        assert_eq!(step.replicas, 3);
    }

    #[tokio::test]
    async fn test_evacuation_waits_for_ready_targets() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node()
            .returning(|n| Ok(Some(node(n, Role::Core, 1000, 150))));
        api.expect_evacuations().returning(|| Ok(vec![]));
        api.expect_start_evacuation().never();
        let mut ops = MockWorkloadOps::new();
        ops.expect_scale().never();

        let step = retire(&c, &rollout(Role::Core), true, &core_pods(), vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.decision, Decision::AwaitTargets);
        assert_eq!(step.replicas, 3);
    }

    #[tokio::test]
    async fn test_running_evacuation_is_not_restarted() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node()
            .returning(|n| Ok(Some(node(n, Role::Core, 1000, 20))));
        api.expect_evacuations()
            .returning(|| Ok(vec![OLD_CORE_2.to_string()]));
        api.expect_start_evacuation().never();
        let mut ops = MockWorkloadOps::new();
        ops.expect_scale().never();

        let step = retire(&c, &rollout(Role::Core), true, &core_pods(), vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.decision, Decision::AwaitEvacuation(20));
    }

    #[tokio::test]
    async fn test_drained_node_removed_after_takeover() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node()
            .returning(|n| Ok(Some(node(n, Role::Core, 1000, 0))));
        api.expect_evacuations().never();
        let mut ops = MockWorkloadOps::new();
        ops.expect_last_scale_down()
            .withf(|role, g| *role == Role::Core && g == "mqtt-core-old")
            .times(1)
            .returning(move |_, _| Ok(Some(Utc::now() - Duration::seconds(60))));
        ops.expect_scale()
            .withf(|role, g, r| *role == Role::Core && g == "mqtt-core-old" && *r == 2)
            .times(1)
            .returning(|_, _, _| Ok(()));
        ops.expect_mark_for_deletion().never();

        let step = retire(&c, &rollout(Role::Core), true, &core_pods(), vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.decision, Decision::Remove);
        assert_eq!(step.pod, "mqtt-core-old-2");
        assert_eq!(step.replicas, 2);
    }

    #[tokio::test]
    async fn test_recent_scale_down_waits_for_takeover() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node()
            .returning(|n| Ok(Some(node(n, Role::Core, 1000, 0))));
        let mut ops = MockWorkloadOps::new();
        ops.expect_last_scale_down()
            .returning(move |_, _| Ok(Some(now - Duration::seconds(3))));
        ops.expect_scale().never();

        let step = retire(&c, &rollout(Role::Core), true, &core_pods(), vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.decision, Decision::AwaitTakeover(7));
    }

    #[tokio::test]
    async fn test_unknown_replicant_node_removed_immediately() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node()
            .withf(|n| n == "broker@10.0.1.2")
            .times(1)
            .returning(|_| Ok(None));
        api.expect_evacuations().never();
        let mut ops = MockWorkloadOps::new();
        ops.expect_last_scale_down().never();
        ops.expect_mark_for_deletion()
            .withf(|p| p == "mqtt-replicant-old-zzzzz")
            .times(1)
            .returning(|_| Ok(()));
        ops.expect_scale()
            .withf(|role, g, r| *role == Role::Replicant && g == "mqtt-replicant-old" && *r == 2)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let pods = vec![pod("mqtt-replicant-old-zzzzz", "old", Some("10.0.1.2"), true)];
        let step = retire(&c, &rollout(Role::Replicant), false, &pods, vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.decision, Decision::Remove);
    }

    #[tokio::test]
    async fn test_replicant_waits_for_core_drain() {
        let now = Utc::now();
        let c = cluster();
        let mut api = MockBrokerApi::new();
        api.expect_node().never();
        let ops = MockWorkloadOps::new();
        let pods = vec![pod("mqtt-replicant-old-zzzzz", "old", Some("10.0.1.2"), true)];
        let step = retire(&c, &rollout(Role::Replicant), true, &pods, vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap();
        assert_eq!(step, None);
    }

    #[tokio::test]
    async fn test_nothing_to_retire_once_drained() {
        let now = Utc::now();
        let c = cluster();
        let api = MockBrokerApi::new();
        let ops = MockWorkloadOps::new();
        let mut gens = rollout(Role::Core);
        gens.generations.list[0].replicas = 0;
        assert!(!gens.is_draining());
        let step = retire(&c, &gens, false, &core_pods(), vec![], &available_since(60, now), &api, &ops, now)
            .await
            .unwrap();
        assert_eq!(step, None);
    }

    #[test]
    fn test_stopped_node_follows_takeover_rule() {
        let now = Utc::now();
        let n = NodeInfo {
            status: NodeState::Stopped,
            ..node("broker@x", Role::Replicant, 0, 0)
        };
        assert_eq!(
            decide(Some(&n), false, vec![], &EvacuationStrategy::default(), None, now),
            Decision::Remove
        );
    }
}
