use crate::{Error, MqttCluster, Result, broker::BrokerApi, events};
use common::{brokerapi::ListenerPort, context::get_short_name};
use k8s_openapi::{
    api::core::v1::{Service, ServicePort, ServiceSpec},
    apimachinery::pkg::{apis::meta::v1::ObjectMeta, util::intstr::IntOrString},
};
use kube::{
    Client, ResourceExt,
    api::{Api, Patch, PatchParams},
};

/// One service port per distinct (port, protocol), first name wins
pub fn service_ports(listeners: &[ListenerPort]) -> Vec<ServicePort> {
    let mut ports: Vec<ServicePort> = vec![];
    for l in listeners {
        if ports
            .iter()
            .any(|p| p.port == l.port && p.protocol.as_deref() == Some(l.protocol.as_str()))
        {
            continue;
        }
        let mut name = l.name.clone();
        if ports.iter().any(|p| p.name.as_deref() == Some(name.as_str())) {
            name = format!("{name}-{}", l.port);
        }
        ports.push(ServicePort {
            name: Some(name),
            port: l.port,
            target_port: Some(IntOrString::Int(l.port)),
            protocol: Some(l.protocol.clone()),
            ..Default::default()
        });
    }
    ports.sort_by_key(|p| p.port);
    ports
}

/// Service exposing client listeners of the traffic-serving role
pub fn listeners_service(cluster: &MqttCluster, listeners: &[ListenerPort]) -> Result<Service> {
    let template = cluster.spec.listeners_service_template.clone().unwrap_or_default();
    Ok(Service {
        metadata: ObjectMeta {
            name: Some(cluster.listeners_service_name()),
            namespace: cluster.namespace(),
            labels: Some(cluster.labels()),
            annotations: template.annotations,
            owner_references: Some(vec![cluster.owner_reference()?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: template.type_,
            selector: Some(cluster.role_labels(cluster.traffic_role())),
            ports: Some(service_ports(listeners)),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Expose every running listener, a failed listing leaves the service as is
pub async fn sync(cluster: &MqttCluster, client: Client, api: &dyn BrokerApi) -> Result<()> {
    let listeners = match api.listener_ports().await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("Listing listeners of {} failed: {e}", cluster.name_any());
            cluster
                .send_event(client, events::api_failed("ListListeners", e.to_string()))
                .await?;
            return Ok(());
        }
    };
    if listeners.is_empty() {
        return Ok(());
    }
    let svc = listeners_service(cluster, &listeners)?;
    let ns = cluster.namespace().unwrap_or_default();
    let params = PatchParams::apply(get_short_name().as_str()).force();
    Api::<Service>::namespaced(client, &ns)
        .patch(&svc.name_any(), &params, &Patch::Apply(&svc))
        .await
        .map_err(Error::KubeError)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodestatus::tests::cluster;
    use common::mqttcluster::RoleTemplate;

    fn listener(name: &str, port: i32, protocol: &str) -> ListenerPort {
        ListenerPort {
            name: name.to_string(),
            port,
            protocol: protocol.to_string(),
        }
    }

    #[test]
    fn test_ports_deduplicated_and_sorted() {
        let ports = service_ports(&[
            listener("ssl-default", 8883, "TCP"),
            listener("tcp-default", 1883, "TCP"),
            listener("tcp-internal", 1883, "TCP"),
            listener("quic-default", 14567, "UDP"),
            listener("ws-default", 8083, "TCP"),
        ]);
        let numbers: Vec<i32> = ports.iter().map(|p| p.port).collect();
        assert_eq!(numbers, vec![1883, 8083, 8883, 14567]);
        assert_eq!(ports[0].name.as_deref(), Some("tcp-default"));
        assert_eq!(ports[3].protocol.as_deref(), Some("UDP"));
    }

    #[test]
    fn test_same_name_gets_port_suffix() {
        let ports = service_ports(&[listener("default", 1883, "TCP"), listener("default", 5683, "UDP")]);
        assert_eq!(ports[1].name.as_deref(), Some("default-5683"));
    }

    #[test]
    fn test_service_routes_to_traffic_role() {
        let mut c = cluster();
        c.metadata.uid = Some("0000-1111".to_string());
        let svc = listeners_service(&c, &[listener("tcp-default", 1883, "TCP")]).unwrap();
        assert_eq!(svc.spec.unwrap().selector.unwrap()[common::LABEL_DB_ROLE], "core");
        c.spec.replicant_template = Some(RoleTemplate {
            replicas: 2,
            ..Default::default()
        });
        let svc = listeners_service(&c, &[listener("tcp-default", 1883, "TCP")]).unwrap();
        assert_eq!(svc.spec.unwrap().selector.unwrap()[common::LABEL_DB_ROLE], "replicant");
    }
}
