use crate::{
    Error, MqttCluster, Result,
    broker::{BrokerApi, BrokerCredentials},
    config::OperatorConfig,
    workload::{API_KEY_FILE, CONFIG_FILE},
};
use common::{
    ANNOTATION_PUSHED_CONFIG, DASHBOARD_PORT, context::get_short_name, hasheshandlers::config_hash,
    mqttcluster::Role, tools::random_string,
};
use k8s_openapi::{
    ByteString,
    api::core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kube::{
    Client, ResourceExt,
    api::{Api, Patch, PatchParams, PostParams},
};
use std::collections::BTreeMap;

/// API key name the operator authenticates with
pub static API_USERNAME: &str = "mqtt-operator";
pub static DEFAULT_CONFIG: &str = "dashboard.listeners.http.bind = 18083\n";

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn meta(cluster: &MqttCluster, name: String) -> Result<ObjectMeta> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(cluster.labels()),
        owner_references: Some(vec![cluster.owner_reference()?]),
        ..Default::default()
    })
}

/// Headless service resolving every core node, used for cluster discovery
pub fn headless_service(cluster: &MqttCluster) -> Result<Service> {
    Ok(Service {
        metadata: meta(cluster, cluster.headless_service_name())?,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(cluster.role_labels(Role::Core)),
            ports: Some(vec![
                port("ekka", 4370),
                port("gen-rpc", 5369),
                port("dashboard", DASHBOARD_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn dashboard_service(cluster: &MqttCluster) -> Result<Service> {
    Ok(Service {
        metadata: meta(cluster, cluster.dashboard_service_name())?,
        spec: Some(ServiceSpec {
            selector: Some(cluster.labels()),
            ports: Some(vec![port("dashboard", DASHBOARD_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub fn config_text(cluster: &MqttCluster) -> String {
    cluster
        .spec
        .config
        .as_ref()
        .map(|c| c.data.clone())
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string())
}

/// Bootstrap configuration, `pushed` is the hash of the text the running brokers accepted
pub fn bootstrap_config(cluster: &MqttCluster, pushed: &str) -> Result<ConfigMap> {
    let mut metadata = meta(cluster, cluster.bootstrap_config_name())?;
    metadata.annotations = Some(BTreeMap::from([(
        ANNOTATION_PUSHED_CONFIG.to_string(),
        pushed.to_string(),
    )]));
    Ok(ConfigMap {
        metadata,
        data: Some(BTreeMap::from([(CONFIG_FILE.to_string(), config_text(cluster))])),
        ..Default::default()
    })
}

/// Hash of the configuration the running brokers hold.
///
/// Pods of a fresh cluster load the file at start, so a missing ConfigMap
/// counts as pushed. One without the annotation is trusted for its own data.
pub fn pushed_config(previous: Option<&ConfigMap>, desired: &str) -> String {
    let Some(cm) = previous else {
        return desired.to_string();
    };
    if let Some(hash) = cm.annotations().get(ANNOTATION_PUSHED_CONFIG) {
        return hash.clone();
    }
    cm.data
        .as_ref()
        .and_then(|d| d.get(CONFIG_FILE))
        .map(|text| config_hash(text))
        .unwrap_or_else(|| desired.to_string())
}

/// Credentials stored in the bootstrap API key secret
pub fn parse_api_key(secret: &Secret) -> Option<(String, String)> {
    let raw = secret.data.as_ref()?.get(API_KEY_FILE)?;
    let text = String::from_utf8(raw.0.clone()).ok()?;
    let (user, pass) = text.trim().split_once(':')?;
    if user.is_empty() || pass.is_empty() {
        return None;
    }
    Some((user.to_string(), pass.to_string()))
}

pub fn api_key_secret(cluster: &MqttCluster, password: &str) -> Result<Secret> {
    Ok(Secret {
        metadata: meta(cluster, cluster.bootstrap_secret_name())?,
        data: Some(BTreeMap::from([(
            API_KEY_FILE.to_string(),
            ByteString(format!("{API_USERNAME}:{password}").into_bytes()),
        )])),
        ..Default::default()
    })
}

/// Outcome of the bootstrap stage
#[derive(Clone, Debug)]
pub struct Bootstrap {
    pub credentials: BrokerCredentials,
    /// The running brokers still hold another configuration
    pub config_pending: bool,
    pub config: String,
    pub config_hash: String,
}

impl Bootstrap {
    fn new(credentials: BrokerCredentials, config: String, pushed: &str) -> Self {
        let config_hash = config_hash(&config);
        Self {
            credentials,
            config_pending: config_hash != pushed,
            config,
            config_hash,
        }
    }
}

async fn apply<K>(api: &Api<K>, obj: &K) -> Result<K>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let params = PatchParams::apply(get_short_name().as_str()).force();
    api.patch(&obj.name_any(), &params, &Patch::Apply(obj))
        .await
        .map_err(Error::KubeError)
}

async fn ensure_secret(cluster: &MqttCluster, client: Client) -> Result<(String, String)> {
    let ns = cluster.namespace().unwrap_or_default();
    let api = Api::<Secret>::namespaced(client, &ns);
    let name = cluster.bootstrap_secret_name();
    if let Some(creds) = api
        .get_opt(&name)
        .await
        .map_err(Error::KubeError)?
        .as_ref()
        .and_then(parse_api_key)
    {
        return Ok(creds);
    }
    let secret = api_key_secret(cluster, &random_string(32))?;
    let stored = match api.create(&PostParams::default(), &secret).await {
        Ok(s) => s,
        // an unreadable secret is replaced
        Err(kube::Error::Api(e)) if e.code == 409 => apply(&api, &secret).await?,
        Err(e) => return Err(Error::KubeError(e)),
    };
    tracing::info!("Generated the bootstrap API key of {}", cluster.name_any());
    parse_api_key(&stored).ok_or_else(|| Error::Other(format!("secret {name} holds no API key")))
}

/// Services, bootstrap configuration and API key the broker pods depend on
pub async fn ensure(cluster: &MqttCluster, client: Client, config: &OperatorConfig) -> Result<Bootstrap> {
    let ns = cluster.namespace().unwrap_or_default();
    let services = Api::<Service>::namespaced(client.clone(), &ns);
    apply(&services, &headless_service(cluster)?).await?;
    apply(&services, &dashboard_service(cluster)?).await?;

    let configmaps = Api::<ConfigMap>::namespaced(client.clone(), &ns);
    let text = config_text(cluster);
    let previous = configmaps
        .get_opt(&cluster.bootstrap_config_name())
        .await
        .map_err(Error::KubeError)?;
    let pushed = pushed_config(previous.as_ref(), &config_hash(&text));
    apply(&configmaps, &bootstrap_config(cluster, &pushed)?).await?;

    let (username, password) = ensure_secret(cluster, client).await?;
    let credentials = BrokerCredentials {
        username,
        password,
        timeout: config.broker_timeout,
    };
    Ok(Bootstrap::new(credentials, text, &pushed))
}

/// Push the bootstrap configuration to the running brokers.
///
/// The pushed hash is only recorded once the brokers accepted the text, a
/// failed push is retried on the next pass.
pub async fn sync_runtime_config(
    cluster: &MqttCluster,
    client: Client,
    api: &dyn BrokerApi,
    boot: &Bootstrap,
) -> Result<()> {
    api.put_configs(&boot.config).await?;
    let ns = cluster.namespace().unwrap_or_default();
    let configmaps = Api::<ConfigMap>::namespaced(client, &ns);
    apply(&configmaps, &bootstrap_config(cluster, &boot.config_hash)?).await?;
    Ok(())
}
