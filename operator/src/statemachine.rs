use chrono::{DateTime, Utc};
use common::mqttcluster::{
    ApplicationCondition, ConditionsStatus, ConditionsType, MqttClusterStatus, NodesStatus,
};

/// What the state machine looks at besides the conditions themselves
#[derive(Clone, Debug, Default)]
pub struct Observed {
    /// metadata.generation of the cluster object
    pub generation: Option<i64>,
    pub has_replicant: bool,
    pub core: NodesStatus,
    pub replicant: NodesStatus,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub to: ConditionsType,
    pub reason: String,
    pub message: String,
}

impl Transition {
    fn new(to: ConditionsType, reason: &str, message: String) -> Self {
        Self {
            to,
            reason: reason.to_string(),
            message,
        }
    }
}

fn progress(s: &NodesStatus) -> String {
    format!("{}/{} updated nodes ready", s.update_replicas, s.replicas)
}

/// The single transition allowed this pass, if any
pub fn next(status: &MqttClusterStatus, observed: &Observed) -> Option<Transition> {
    let Some(current) = status.current_state() else {
        return Some(Transition::new(
            ConditionsType::Initialized,
            "ClusterCreated",
            "Cluster initialized".to_string(),
        ));
    };
    if observed.generation.is_some() && status.observed_generation != observed.generation {
        return Some(Transition::new(
            ConditionsType::Initialized,
            "SpecChanged",
            format!(
                "Cluster spec changed to generation {}",
                observed.generation.unwrap_or_default()
            ),
        ));
    }
    if current.is_replicant() && !observed.has_replicant {
        return Some(Transition::new(
            ConditionsType::Initialized,
            "ReplicantRemoved",
            "Replicant nodes are no longer configured".to_string(),
        ));
    }
    match current {
        ConditionsType::Initialized => Some(Transition::new(
            ConditionsType::CoreNodesProgressing,
            "CoreNodesProgressing",
            progress(&observed.core),
        )),
        ConditionsType::CoreNodesProgressing => (observed.core.update_replicas == observed.core.replicas)
            .then(|| Transition::new(ConditionsType::CoreNodesReady, "CoreNodesReady", progress(&observed.core))),
        ConditionsType::CoreNodesReady => {
            if observed.has_replicant {
                Some(Transition::new(
                    ConditionsType::ReplicantNodesProgressing,
                    "ReplicantNodesProgressing",
                    progress(&observed.replicant),
                ))
            } else {
                Some(Transition::new(
                    ConditionsType::Available,
                    "ClusterAvailable",
                    "Core nodes are ready".to_string(),
                ))
            }
        }
        ConditionsType::ReplicantNodesProgressing => (observed.replicant.update_replicas
            == observed.replicant.replicas)
            .then(|| {
                Transition::new(
                    ConditionsType::ReplicantNodesReady,
                    "ReplicantNodesReady",
                    progress(&observed.replicant),
                )
            }),
        ConditionsType::ReplicantNodesReady => Some(Transition::new(
            ConditionsType::Available,
            "ClusterAvailable",
            "Core and replicant nodes are ready".to_string(),
        )),
        ConditionsType::Available => {
            let converged = observed.core.is_converged()
                && (!observed.has_replicant || observed.replicant.is_converged());
            converged.then(|| {
                Transition::new(
                    ConditionsType::Ready,
                    "ClusterReady",
                    "Every node runs the latest generation".to_string(),
                )
            })
        }
        ConditionsType::Ready => None,
    }
}

/// Record a transition in the condition list
pub fn apply(status: &mut MqttClusterStatus, transition: &Transition, now: DateTime<Utc>) {
    if transition.to == ConditionsType::Initialized {
        status.remove_conditions(&ConditionsType::downstream());
    }
    status.set_condition(
        ApplicationCondition::new(
            transition.to,
            ConditionsStatus::True,
            &transition.reason,
            &transition.message,
        )
        .at(now),
    );
}

/// Advance the cluster by at most one state
pub fn step(status: &mut MqttClusterStatus, observed: &Observed, now: DateTime<Utc>) -> Option<Transition> {
    let transition = next(status, observed)?;
    apply(status, &transition, now);
    if transition.to == ConditionsType::Initialized {
        status.observed_generation = observed.generation;
    }
    Some(transition)
}
