use async_trait::async_trait;
use common::{
    DASHBOARD_PORT, Result,
    brokerapi::{BrokerClient, EvacuationRequest, ListenerPort},
    mqttcluster::NodeInfo,
};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// Operations the reconciler needs from the broker management API.
///
/// Implemented by [`BrokerClient`] in production and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Full node roster
    async fn nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Single node, `None` when the broker reports it as unknown
    async fn node(&self, name: &str) -> Result<Option<NodeInfo>>;

    /// Nodes with an outstanding evacuation
    async fn evacuations(&self) -> Result<Vec<String>>;

    /// Idempotent evacuation start
    async fn start_evacuation(&self, node: &str, req: &EvacuationRequest) -> Result<()>;

    /// Availability check of the node answering this client
    async fn availability_check(&self) -> Result<bool>;

    /// Running listeners, gateway ones included
    async fn listener_ports(&self) -> Result<Vec<ListenerPort>>;

    /// Replace the runtime configuration
    async fn put_configs(&self, hocon: &str) -> Result<()>;
}

#[async_trait]
impl BrokerApi for BrokerClient {
    async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        BrokerClient::nodes(self).await
    }

    async fn node(&self, name: &str) -> Result<Option<NodeInfo>> {
        BrokerClient::node(self, name).await
    }

    async fn evacuations(&self) -> Result<Vec<String>> {
        BrokerClient::evacuations(self).await
    }

    async fn start_evacuation(&self, node: &str, req: &EvacuationRequest) -> Result<()> {
        BrokerClient::start_evacuation(self, node, req).await
    }

    async fn availability_check(&self) -> Result<bool> {
        BrokerClient::availability_check(self).await
    }

    async fn listener_ports(&self) -> Result<Vec<ListenerPort>> {
        let mut ports = self.listeners().await?;
        for gw in self.gateways().await? {
            match self.gateway_listeners(&gw).await {
                Ok(mut lst) => ports.append(&mut lst),
                Err(e) => tracing::warn!("Listing listeners of gateway {gw} failed: {e}"),
            }
        }
        Ok(ports)
    }

    async fn put_configs(&self, hocon: &str) -> Result<()> {
        BrokerClient::put_configs(self, hocon).await
    }
}

/// Credentials of the bootstrap API key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl BrokerCredentials {
    /// Management API client reaching the broker at `host` (a pod IP)
    pub fn connect(&self, host: &str) -> BrokerClient {
        BrokerClient::new(host, DASHBOARD_PORT, &self.username, &self.password, self.timeout)
    }
}
