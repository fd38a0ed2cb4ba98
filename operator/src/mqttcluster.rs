use crate::{
    Error, MqttCluster, Reconciler, Result, bootstrap,
    broker::BrokerApi,
    events, listeners,
    manager::Context,
    nodestatus, retirement,
    retirement::{Decision, KubeWorkloads, RetirementStep},
    serviceability, statemachine,
    statemachine::Observed,
    telemetry,
    workload::{self, RoleGenerations},
};
use async_trait::async_trait;
use chrono::Utc;
use common::mqttcluster::{ConditionsType, MqttClusterStatus, NodeInfo, NodesStatus, Role};
use kube::{ResourceExt, runtime::controller::Action};
use opentelemetry::trace::TraceId;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{Span, field, instrument};

/// Requeue delay while a rollout is in progress
static ROLLOUT_REQUEUE: Duration = Duration::from_secs(5);

fn key(cluster: &MqttCluster) -> String {
    format!("{}/{}", cluster.namespace().unwrap_or_default(), cluster.name_any())
}

/// Status of the nodes of a role, from its generations and the broker roster
pub fn fold_nodes(generations: &RoleGenerations, nodes: Vec<NodeInfo>, collision_count: i32) -> NodesStatus {
    let mut status = match &generations.hash {
        Some(hash) => generations
            .generations
            .fold_status(generations.desired, hash, collision_count),
        None => NodesStatus {
            ready_replicas: generations.generations.list.iter().map(|g| g.ready_replicas).sum(),
            current_revision: generations
                .generations
                .list
                .iter()
                .find(|g| g.replicas > 0)
                .and_then(|g| g.hash.clone()),
            ..Default::default()
        },
    };
    status.nodes = nodes;
    status
}

/// Status without the per-node counters that move on every pass
fn settled(status: &MqttClusterStatus) -> MqttClusterStatus {
    let mut s = status.clone();
    for nodes in [s.core_nodes_status.as_mut(), s.replicant_nodes_status.as_mut()]
        .into_iter()
        .flatten()
    {
        for n in nodes.nodes.iter_mut() {
            n.uptime = 0;
            n.session_count = 0;
        }
    }
    s
}

fn validate(cluster: &MqttCluster) -> Result<()> {
    if cluster.spec.core_template.replicas < 1 {
        return Err(Error::IllegalMqttCluster(format!(
            "{} needs at least one core node",
            cluster.name_any()
        )));
    }
    if cluster.spec.image.trim().is_empty() {
        return Err(Error::IllegalMqttCluster(format!("{} has no image", cluster.name_any())));
    }
    Ok(())
}

/// Metrics and events of a retirement step, `true` when a step was taken
async fn report_retirement(cluster: &MqttCluster, ctx: &Context, step: Option<RetirementStep>) -> Result<bool> {
    let Some(step) = step else {
        return Ok(false);
    };
    let role = step.role.as_str();
    match &step.decision {
        Decision::Evacuate(req) => {
            ctx.metrics.retirement.evacuation_started(cluster, role);
            cluster
                .send_event(
                    ctx.client.clone(),
                    events::evacuation_started(&step.node, &req.migrate_to),
                )
                .await?;
        }
        Decision::AwaitEvacuation(sessions) => {
            cluster
                .send_event(ctx.client.clone(), events::evacuation_pending(&step.node, *sessions))
                .await?;
        }
        Decision::Remove => {
            ctx.metrics.retirement.scaled_down(cluster, role);
            cluster
                .send_event(
                    ctx.client.clone(),
                    events::scale_down(step.role, &step.generation, &step.pod, step.replicas),
                )
                .await?;
        }
        Decision::AwaitTakeover(_) | Decision::AwaitTargets => {}
    }
    Ok(true)
}

#[async_trait]
impl Reconciler for MqttCluster {
    async fn reconcile(&self, ctx: Arc<Context>) -> Result<Action> {
        tracing::debug!("Reconcilling MqttCluster {}", key(self));
        validate(self)?;
        let client = ctx.client.clone();
        let now = Utc::now();
        let previous = self.status.clone().unwrap_or_default();
        let mut status = previous.clone();

        // Bootstrap resources
        let boot = bootstrap::ensure(self, client.clone(), &ctx.config).await?;

        // Workload synchronizer
        let core = workload::sync_role(self, Role::Core, client.clone(), &mut status).await?;
        let replicant = workload::sync_role(self, Role::Replicant, client.clone(), &mut status).await?;
        if core.collided || replicant.collided {
            self.patch_status(client, &status).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        let core_pods = workload::list_pods(self, Role::Core, client.clone()).await?;
        let replicant_pods = workload::list_pods(self, Role::Replicant, client.clone()).await?;

        // Node status collector
        let requester = nodestatus::requester_host(&core_pods, core.hash.as_deref())
            .map(|host| boot.credentials.connect(&host));
        let api = requester.as_ref().map(|r| r as &dyn BrokerApi);
        let (core_nodes, replicant_nodes) = match nodestatus::collect(self, client.clone(), api).await {
            Some(roster) => roster,
            None => (
                previous.core_nodes_status.clone().map(|s| s.nodes).unwrap_or_default(),
                previous
                    .replicant_nodes_status
                    .clone()
                    .map(|s| s.nodes)
                    .unwrap_or_default(),
            ),
        };
        status.core_nodes_status = Some(fold_nodes(&core, core_nodes, status.collision_count(Role::Core)));
        status.replicant_nodes_status = if replicant.hash.is_some() || !replicant.generations.list.is_empty() {
            Some(fold_nodes(
                &replicant,
                replicant_nodes,
                status.collision_count(Role::Replicant),
            ))
        } else {
            None
        };

        if let Some(api) = api {
            if boot.config_pending {
                tracing::info!("Pushing the updated configuration of {}", key(self));
                if let Err(e) = bootstrap::sync_runtime_config(self, client.clone(), api, &boot).await {
                    tracing::warn!("Updating the runtime configuration of {} failed: {e}", key(self));
                    self.send_event(client.clone(), events::api_failed("PutConfigs", e.to_string()))
                        .await?;
                }
            }
            listeners::sync(self, client.clone(), api).await?;
        }

        // Status state machine
        let observed = Observed {
            generation: self.metadata.generation,
            has_replicant: self.has_replicant(),
            core: status.core_nodes_status.clone().unwrap_or_default(),
            replicant: status.replicant_nodes_status.clone().unwrap_or_default(),
        };
        if let Some(transition) = statemachine::step(&mut status, &observed, now) {
            tracing::info!("MqttCluster {} is now {:?}", key(self), transition.to);
            self.send_event(
                client.clone(),
                events::transition(&format!("{:?}", transition.to), &transition.message),
            )
            .await?;
        }
        if settled(&status) != settled(&previous) {
            self.patch_status(client.clone(), &status).await?;
        }

        // Pod serviceability gate
        let roster: Vec<NodeInfo> = [
            status.core_nodes_status.as_ref().map(|s| s.nodes.clone()).unwrap_or_default(),
            status
                .replicant_nodes_status
                .as_ref()
                .map(|s| s.nodes.clone())
                .unwrap_or_default(),
        ]
        .concat();
        serviceability::sync_role(self, Role::Core, &core_pods, &roster, &boot.credentials, client.clone()).await?;
        serviceability::sync_role(
            self,
            Role::Replicant,
            &replicant_pods,
            &roster,
            &boot.credentials,
            client.clone(),
        )
        .await?;

        // Node retirement engine
        let mut retiring = false;
        if let Some(api) = api {
            let ops = KubeWorkloads {
                cluster: self,
                client: client.clone(),
            };
            let core_targets = retirement::migration_targets(self, Role::Core, core.current(), &core_pods);
            let step = retirement::retire(
                self,
                &core,
                core.is_draining(),
                &core_pods,
                core_targets.clone(),
                &status,
                api,
                &ops,
                now,
            )
            .await?;
            retiring |= report_retirement(self, &ctx, step).await?;

            let mut replicant_targets =
                retirement::migration_targets(self, Role::Replicant, replicant.current(), &replicant_pods);
            if replicant_targets.is_empty() {
                replicant_targets = core_targets;
            }
            let step = retirement::retire(
                self,
                &replicant,
                core.is_draining(),
                &replicant_pods,
                replicant_targets,
                &status,
                api,
                &ops,
                now,
            )
            .await?;
            retiring |= report_retirement(self, &ctx, step).await?;
        }

        if retiring || status.current_state() != Some(ConditionsType::Ready) {
            Ok(Action::requeue(ROLLOUT_REQUEUE))
        } else {
            Ok(Action::requeue(ctx.config.requeue))
        }
    }
}

#[instrument(skip(ctx, cluster), fields(trace_id))]
pub async fn reconcile(cluster: Arc<MqttCluster>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _mes = ctx.metrics.cluster.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    match cluster.reconcile(ctx.clone()).await {
        Ok(action) => {
            ctx.reset_backoff(&key(&cluster));
            Ok(action)
        }
        Err(e) if e.is_conflict() => {
            tracing::debug!("Conflicting write on MqttCluster {}, retrying: {e}", key(&cluster));
            Ok(Action::requeue(Duration::from_secs(1)))
        }
        Err(e) => Err(e),
    }
}

#[must_use]
pub fn error_policy(cluster: Arc<MqttCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    tracing::warn!("reconcile failed for MqttCluster '{}': {:?}", key(&cluster), error);
    ctx.metrics.cluster.reconcile_failure(&cluster, error);
    Action::requeue(ctx.backoff(&key(&cluster)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodestatus::tests::{cluster, node};
    use common::{
        k8sworkload::{Generation, Generations},
        mqttcluster::RoleTemplate,
    };

    fn generation(role: Role, hash: &str, age: i64, replicas: i32, ready: i32) -> Generation {
        Generation {
            name: format!("mqtt-{role}-{hash}"),
            role,
            hash: Some(hash.to_string()),
            replicas,
            ready_replicas: ready,
            created: Some(Utc::now() - chrono::Duration::seconds(age)),
            last_applied: None,
        }
    }

    #[test]
    fn test_fold_nodes_keeps_roster() {
        let gens = RoleGenerations {
            role: Role::Core,
            hash: Some("new".to_string()),
            desired: 3,
            generations: Generations::new(vec![generation(Role::Core, "new", 10, 3, 3)]),
            collided: false,
        };
        let status = fold_nodes(&gens, vec![node("broker@c0", Role::Core, 10, 0)], 0);
        assert_eq!(status.nodes.len(), 1);
        assert!(status.is_converged());
    }

    #[test]
    fn test_fold_nodes_of_removed_role() {
        let gens = RoleGenerations {
            role: Role::Replicant,
            hash: None,
            desired: 0,
            generations: Generations::new(vec![generation(Role::Replicant, "old", 10, 2, 2)]),
            collided: false,
        };
        let status = fold_nodes(&gens, vec![], 0);
        assert_eq!(status.replicas, 0);
        assert_eq!(status.ready_replicas, 2);
        assert_eq!(status.current_revision.as_deref(), Some("old"));
        assert_eq!(status.update_revision, None);
    }

    #[test]
    fn test_counters_alone_do_not_rewrite_status() {
        let mut a = MqttClusterStatus::default();
        a.core_nodes_status = Some(NodesStatus {
            nodes: vec![node("broker@c0", Role::Core, 10, 5)],
            ..Default::default()
        });
        let mut b = a.clone();
        if let Some(s) = b.core_nodes_status.as_mut() {
            s.nodes[0].uptime = 5000;
            s.nodes[0].session_count = 7;
        }
        assert_eq!(settled(&a), settled(&b));
        if let Some(s) = b.core_nodes_status.as_mut() {
            s.nodes[0].version = "5.2.0".to_string();
        }
        assert_ne!(settled(&a), settled(&b));
    }

    #[test]
    fn test_validate() {
        let mut c = cluster();
        assert!(validate(&c).is_ok());
        c.spec.core_template = RoleTemplate::default();
        assert!(matches!(validate(&c), Err(Error::IllegalMqttCluster(_))));
    }
}
