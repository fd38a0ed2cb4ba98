use crate::{
    ANNOTATION_LAST_APPLIED, LABEL_POD_TEMPLATE_HASH,
    mqttcluster::{NodesStatus, Role},
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    apps::v1::{ReplicaSet, StatefulSet},
    core::v1::Pod,
};
use kube::ResourceExt;

/// One pod-template revision of a role, backed by a StatefulSet (core) or a
/// ReplicaSet (replicant)
#[derive(Clone, Debug, PartialEq)]
pub struct Generation {
    pub name: String,
    pub role: Role,
    pub hash: Option<String>,
    /// Desired replicas (spec)
    pub replicas: i32,
    pub ready_replicas: i32,
    pub created: Option<DateTime<Utc>>,
    pub last_applied: Option<String>,
}

impl From<&StatefulSet> for Generation {
    fn from(sts: &StatefulSet) -> Self {
        Generation {
            name: sts.name_any(),
            role: Role::Core,
            hash: sts.labels().get(LABEL_POD_TEMPLATE_HASH).cloned(),
            replicas: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            ready_replicas: sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
            created: sts.metadata.creation_timestamp.as_ref().map(|t| t.0),
            last_applied: sts.annotations().get(ANNOTATION_LAST_APPLIED).cloned(),
        }
    }
}

impl From<&ReplicaSet> for Generation {
    fn from(rs: &ReplicaSet) -> Self {
        Generation {
            name: rs.name_any(),
            role: Role::Replicant,
            hash: rs.labels().get(LABEL_POD_TEMPLATE_HASH).cloned(),
            replicas: rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            ready_replicas: rs.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
            created: rs.metadata.creation_timestamp.as_ref().map(|t| t.0),
            last_applied: rs.annotations().get(ANNOTATION_LAST_APPLIED).cloned(),
        }
    }
}

impl Generation {
    pub fn owns(&self, pod: &Pod) -> bool {
        self.hash.is_some() && pod.labels().get(LABEL_POD_TEMPLATE_HASH) == self.hash.as_ref()
    }
}

/// Every generation of a role, oldest first
#[derive(Clone, Debug, Default)]
pub struct Generations {
    pub list: Vec<Generation>,
}

impl Generations {
    pub fn new(mut list: Vec<Generation>) -> Self {
        list.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
        Self { list }
    }

    pub fn find(&self, hash: &str) -> Option<&Generation> {
        self.list.iter().find(|g| g.hash.as_deref() == Some(hash))
    }

    /// Generations other than the update one still holding replicas, oldest first
    pub fn stale(&self, update_hash: &str) -> Vec<&Generation> {
        self.list
            .iter()
            .filter(|g| g.hash.as_deref() != Some(update_hash) && g.replicas > 0)
            .collect()
    }

    /// Oldest generation still holding replicas, falls back to the update one
    pub fn current_revision(&self, update_hash: &str) -> String {
        self.list
            .iter()
            .find(|g| g.replicas > 0)
            .and_then(|g| g.hash.clone())
            .unwrap_or_else(|| update_hash.to_string())
    }

    pub fn fold_status(&self, desired: i32, update_hash: &str, collision_count: i32) -> NodesStatus {
        let current = self.current_revision(update_hash);
        NodesStatus {
            replicas: desired,
            ready_replicas: self.list.iter().map(|g| g.ready_replicas).sum(),
            current_replicas: self.find(&current).map(|g| g.ready_replicas).unwrap_or(0),
            current_revision: Some(current),
            update_replicas: self.find(update_hash).map(|g| g.ready_replicas).unwrap_or(0),
            update_revision: Some(update_hash.to_string()),
            collision_count: if collision_count > 0 {
                Some(collision_count)
            } else {
                None
            },
            nodes: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn generation(hash: &str, age: i64, replicas: i32, ready: i32) -> Generation {
        Generation {
            name: format!("mqtt-core-{hash}"),
            role: Role::Core,
            hash: Some(hash.to_string()),
            replicas,
            ready_replicas: ready,
            created: Some(Utc::now() - Duration::seconds(age)),
            last_applied: None,
        }
    }

    #[test]
    fn test_generations_sorted_oldest_first() {
        let gens = Generations::new(vec![generation("new", 10, 3, 3), generation("old", 100, 3, 3)]);
        assert_eq!(gens.list[0].hash.as_deref(), Some("old"));
    }

    #[test]
    fn test_stale_skips_update_and_drained() {
        let gens = Generations::new(vec![
            generation("drained", 300, 0, 0),
            generation("old", 100, 2, 2),
            generation("new", 10, 3, 1),
        ]);
        let stale: Vec<&str> = gens.stale("new").iter().filter_map(|g| g.hash.as_deref()).collect();
        assert_eq!(stale, vec!["old"]);
    }

    #[test]
    fn test_fold_status_during_rollout() {
        let gens = Generations::new(vec![generation("old", 100, 3, 3), generation("new", 10, 3, 2)]);
        let status = gens.fold_status(3, "new", 0);
        assert_eq!(status.ready_replicas, 5);
        assert_eq!(status.update_replicas, 2);
        assert_eq!(status.current_replicas, 3);
        assert_eq!(status.current_revision.as_deref(), Some("old"));
        assert_eq!(status.update_revision.as_deref(), Some("new"));
        assert_eq!(status.collision_count, None);
        assert!(!status.is_converged());
    }

    #[test]
    fn test_fold_status_after_drain() {
        let gens = Generations::new(vec![generation("old", 100, 0, 0), generation("new", 10, 3, 3)]);
        let status = gens.fold_status(3, "new", 1);
        assert_eq!(status.current_revision.as_deref(), Some("new"));
        assert_eq!(status.collision_count, Some(1));
        assert!(status.is_converged());
    }
}
