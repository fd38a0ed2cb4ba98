use crate::{Error, MqttCluster, Result, events};
use common::{
    ANNOTATION_LAST_APPLIED, DASHBOARD_PORT, LABEL_POD_TEMPLATE_HASH, POD_ON_SERVING,
    context::get_short_name,
    hasheshandlers::{normalize_template, template_hash, template_json},
    k8sworkload::{Generation, Generations},
    mqttcluster::{MqttClusterStatus, Role, RoleTemplate},
};
use k8s_openapi::{
    api::{
        apps::v1::{ReplicaSet, ReplicaSetSpec, StatefulSet, StatefulSetSpec},
        core::v1::{
            ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
            HTTPGetAction, ObjectFieldSelector, Pod, PodReadinessGate, PodSpec, PodTemplateSpec, Probe,
            SecretVolumeSource, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use kube::{
    Client, ResourceExt,
    api::{Api, ListParams, Patch, PatchParams, PostParams},
};
use serde_json::json;
use std::collections::BTreeMap;

pub static CONTAINER_NAME: &str = "broker";
pub static NODE_NAME_PREFIX: &str = "broker";
pub static CONFIG_FILE: &str = "emqx.conf";
pub static API_KEY_FILE: &str = "bootstrap_api_key";
static API_KEY_DIR: &str = "/opt/mqtt-operator/bootstrap";

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn env_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn http_probe(path: &str, initial_delay: i32, period: i32, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::String("dashboard".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

/// Fully qualified domain of the headless service
pub fn headless_domain(cluster: &MqttCluster) -> String {
    format!(
        "{}.{}.svc.{}",
        cluster.headless_service_name(),
        cluster.namespace().unwrap_or_default(),
        cluster.cluster_domain()
    )
}

/// Pod template of a role, without the generation hash label
pub fn render_pod_template(cluster: &MqttCluster, role: Role, tpl: &RoleTemplate) -> PodTemplateSpec {
    let mut labels = tpl.labels.clone().unwrap_or_default();
    labels.extend(cluster.role_labels(role));
    let domain = headless_domain(cluster);

    let mut envs = vec![
        env_field("POD_NAME", "metadata.name"),
        env_field("POD_IP", "status.podIP"),
        env("EMQX_NAME", NODE_NAME_PREFIX),
        env(
            "EMQX_HOST",
            &match role {
                Role::Core => format!("$(POD_NAME).{domain}"),
                Role::Replicant => "$(POD_IP)".to_string(),
            },
        ),
        env("EMQX_NODE__DB_ROLE", role.as_str()),
        env("EMQX_CLUSTER__DISCOVERY_STRATEGY", "dns"),
        env("EMQX_CLUSTER__DNS__RECORD_TYPE", "srv"),
        env("EMQX_CLUSTER__DNS__NAME", &domain),
        env(
            "EMQX_API_KEY__BOOTSTRAP_FILE",
            &format!("{API_KEY_DIR}/{API_KEY_FILE}"),
        ),
    ];
    envs.extend(tpl.env.clone().unwrap_or_default());

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: tpl.annotations.clone(),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            readiness_gates: Some(vec![PodReadinessGate {
                condition_type: POD_ON_SERVING.to_string(),
            }]),
            node_selector: tpl.node_selector.clone(),
            tolerations: tpl.tolerations.clone(),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(cluster.spec.image.clone()),
                image_pull_policy: cluster.spec.image_pull_policy.clone(),
                env: Some(envs),
                resources: tpl.resources.clone(),
                ports: Some(vec![
                    ContainerPort {
                        name: Some("dashboard".to_string()),
                        container_port: DASHBOARD_PORT,
                        ..Default::default()
                    },
                    ContainerPort {
                        name: Some("mqtt".to_string()),
                        container_port: 1883,
                        ..Default::default()
                    },
                ]),
                readiness_probe: Some(http_probe("/status", 10, 5, 12)),
                liveness_probe: Some(http_probe("/status", 60, 30, 3)),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: "bootstrap-config".to_string(),
                        mount_path: format!("/opt/emqx/etc/{CONFIG_FILE}"),
                        sub_path: Some(CONFIG_FILE.to_string()),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "bootstrap-api-key".to_string(),
                        mount_path: API_KEY_DIR.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: "data".to_string(),
                        mount_path: "/opt/emqx/data".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                Volume {
                    name: "bootstrap-config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: cluster.bootstrap_config_name(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "bootstrap-api-key".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(cluster.bootstrap_secret_name()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Volume {
                    name: "data".to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
    }
}

fn with_hash(template: &PodTemplateSpec, hash: &str) -> PodTemplateSpec {
    let mut tpl = template.clone();
    tpl.metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_POD_TEMPLATE_HASH.to_string(), hash.to_string());
    tpl
}

fn generation_meta(
    cluster: &MqttCluster,
    role: Role,
    template: &PodTemplateSpec,
    hash: &str,
) -> Result<ObjectMeta> {
    let mut labels = cluster.role_labels(role);
    labels.insert(LABEL_POD_TEMPLATE_HASH.to_string(), hash.to_string());
    Ok(ObjectMeta {
        name: Some(generation_name(cluster, role, hash)),
        namespace: cluster.namespace(),
        labels: Some(labels),
        annotations: Some(BTreeMap::from([(
            ANNOTATION_LAST_APPLIED.to_string(),
            template_json(template)?,
        )])),
        owner_references: Some(vec![cluster.owner_reference()?]),
        ..Default::default()
    })
}

fn selector(cluster: &MqttCluster, role: Role, hash: &str) -> LabelSelector {
    let mut labels = cluster.role_labels(role);
    labels.insert(LABEL_POD_TEMPLATE_HASH.to_string(), hash.to_string());
    LabelSelector {
        match_labels: Some(labels),
        ..Default::default()
    }
}

pub fn generation_name(cluster: &MqttCluster, role: Role, hash: &str) -> String {
    format!("{}-{}-{}", cluster.name_any(), role, hash)
}

/// Ordinal-indexed workload of a core generation
pub fn render_core(
    cluster: &MqttCluster,
    template: &PodTemplateSpec,
    hash: &str,
    replicas: i32,
) -> Result<StatefulSet> {
    Ok(StatefulSet {
        metadata: generation_meta(cluster, Role::Core, template, hash)?,
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: cluster.headless_service_name(),
            pod_management_policy: Some("Parallel".to_string()),
            selector: selector(cluster, Role::Core, hash),
            template: with_hash(template, hash),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Ordinal-less workload of a replicant generation
pub fn render_replicant(
    cluster: &MqttCluster,
    template: &PodTemplateSpec,
    hash: &str,
    replicas: i32,
) -> Result<ReplicaSet> {
    Ok(ReplicaSet {
        metadata: generation_meta(cluster, Role::Replicant, template, hash)?,
        spec: Some(ReplicaSetSpec {
            replicas: Some(replicas),
            selector: selector(cluster, Role::Replicant, hash),
            template: Some(with_hash(template, hash)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// What the synchronizer has to do for the current generation of a role
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncPlan {
    /// No object carries the current hash yet
    Create,
    /// The current generation exists but holds another replica count
    Scale(String, i32),
    /// Nothing to write
    Noop(String),
    /// An object carries the current hash with a different template
    Collision(String),
}

/// Compare the current generation (if any) with the desired template
pub fn plan_sync(generations: &Generations, hash: &str, desired: &PodTemplateSpec, replicas: i32) -> Result<SyncPlan> {
    let Some(current) = generations.find(hash) else {
        return Ok(SyncPlan::Create);
    };
    let desired = serde_json::to_value(normalize_template(desired)).map_err(Error::SerializationError)?;
    let applied = current
        .last_applied
        .as_deref()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok());
    let drifted = match applied {
        Some(applied) => !json_patch::diff(&applied, &desired).0.is_empty(),
        None => true,
    };
    if drifted {
        Ok(SyncPlan::Collision(current.name.clone()))
    } else if current.replicas != replicas {
        Ok(SyncPlan::Scale(current.name.clone(), replicas))
    } else {
        Ok(SyncPlan::Noop(current.name.clone()))
    }
}

/// Generations of one role after the synchronizer ran
#[derive(Clone, Debug)]
pub struct RoleGenerations {
    pub role: Role,
    /// Hash of the current generation, `None` when the role is not configured
    pub hash: Option<String>,
    pub desired: i32,
    pub generations: Generations,
    /// The current generation could not be named this pass
    pub collided: bool,
}

impl RoleGenerations {
    pub fn current(&self) -> Option<&Generation> {
        self.hash.as_deref().and_then(|h| self.generations.find(h))
    }

    pub fn stale(&self) -> Vec<&Generation> {
        match &self.hash {
            Some(h) => self.generations.stale(h),
            None => self.generations.list.iter().filter(|g| g.replicas > 0).collect(),
        }
    }

    /// A stale generation still holds replicas
    pub fn is_draining(&self) -> bool {
        !self.stale().is_empty()
    }
}

pub async fn list_generations(cluster: &MqttCluster, role: Role, client: Client) -> Result<Generations> {
    let ns = cluster.namespace().unwrap_or_default();
    let lp = ListParams::default().labels(&cluster.role_selector(role));
    let list = match role {
        Role::Core => Api::<StatefulSet>::namespaced(client, &ns)
            .list(&lp)
            .await
            .map_err(Error::KubeError)?
            .items
            .iter()
            .map(Generation::from)
            .collect(),
        Role::Replicant => Api::<ReplicaSet>::namespaced(client, &ns)
            .list(&lp)
            .await
            .map_err(Error::KubeError)?
            .items
            .iter()
            .map(Generation::from)
            .collect(),
    };
    Ok(Generations::new(list))
}

pub async fn list_pods(cluster: &MqttCluster, role: Role, client: Client) -> Result<Vec<Pod>> {
    let ns = cluster.namespace().unwrap_or_default();
    let lp = ListParams::default().labels(&cluster.role_selector(role));
    Ok(Api::<Pod>::namespaced(client, &ns)
        .list(&lp)
        .await
        .map_err(Error::KubeError)?
        .items)
}

/// Set the replica count of a generation
pub async fn scale_generation(
    cluster: &MqttCluster,
    role: Role,
    name: &str,
    replicas: i32,
    client: Client,
) -> Result<()> {
    let ns = cluster.namespace().unwrap_or_default();
    let patch = Patch::Merge(json!({ "spec": { "replicas": replicas } }));
    let pp = PatchParams::apply(get_short_name().as_str());
    match role {
        Role::Core => {
            Api::<StatefulSet>::namespaced(client, &ns)
                .patch(name, &pp, &patch)
                .await
                .map_err(Error::KubeError)?;
        }
        Role::Replicant => {
            Api::<ReplicaSet>::namespaced(client, &ns)
                .patch(name, &pp, &patch)
                .await
                .map_err(Error::KubeError)?;
        }
    }
    Ok(())
}

async fn create_generation(
    cluster: &MqttCluster,
    role: Role,
    template: &PodTemplateSpec,
    hash: &str,
    replicas: i32,
    client: Client,
) -> Result<Generation> {
    let ns = cluster.namespace().unwrap_or_default();
    let pp = PostParams::default();
    match role {
        Role::Core => {
            let sts = render_core(cluster, template, hash, replicas)?;
            let created = Api::<StatefulSet>::namespaced(client, &ns)
                .create(&pp, &sts)
                .await
                .map_err(Error::KubeError)?;
            Ok(Generation::from(&created))
        }
        Role::Replicant => {
            let rs = render_replicant(cluster, template, hash, replicas)?;
            let created = Api::<ReplicaSet>::namespaced(client, &ns)
                .create(&pp, &rs)
                .await
                .map_err(Error::KubeError)?;
            Ok(Generation::from(&created))
        }
    }
}

/// Make sure the current generation of `role` exists with the desired replica
/// count. Stale generations are left untouched.
pub async fn sync_role(
    cluster: &MqttCluster,
    role: Role,
    client: Client,
    status: &mut MqttClusterStatus,
) -> Result<RoleGenerations> {
    let mut generations = list_generations(cluster, role, client.clone()).await?;
    let Some(tpl) = cluster.role_template(role) else {
        return Ok(RoleGenerations {
            role,
            hash: None,
            desired: 0,
            generations,
            collided: false,
        });
    };
    let template = render_pod_template(cluster, role, tpl);
    let collision_count = status.collision_count(role);
    let hash = template_hash(&template, collision_count)?;
    let mut collided = false;

    match plan_sync(&generations, &hash, &template, tpl.replicas)? {
        SyncPlan::Noop(_) => {}
        SyncPlan::Scale(name, replicas) => {
            tracing::info!("Scaling {role} generation {name} to {replicas}");
            scale_generation(cluster, role, &name, replicas, client.clone()).await?;
            if let Some(g) = generations.list.iter_mut().find(|g| g.name == name) {
                g.replicas = replicas;
            }
        }
        SyncPlan::Create => {
            match create_generation(cluster, role, &template, &hash, tpl.replicas, client.clone()).await {
                Ok(g) => {
                    tracing::info!("Created {role} generation {}", g.name);
                    cluster
                        .send_event(client.clone(), events::generation_created(role, &g.name))
                        .await?;
                    generations = Generations::new([generations.list, vec![g]].concat());
                }
                Err(Error::KubeError(kube::Error::Api(e))) if e.code == 409 => {
                    collided = true;
                }
                Err(e) => return Err(e),
            }
        }
        SyncPlan::Collision(_) => {
            collided = true;
        }
    }

    if collided {
        let name = generation_name(cluster, role, &hash);
        let count = collision_count + 1;
        tracing::warn!("{role} generation {name} collides with an existing object, retrying as #{count}");
        status.nodes_status_mut(role).collision_count = Some(count);
        cluster
            .send_event(client, events::generation_collision(role, &name, count))
            .await?;
    }

    Ok(RoleGenerations {
        role,
        hash: Some(hash),
        desired: tpl.replicas,
        generations,
        collided,
    })
}
