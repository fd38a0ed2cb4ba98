use crate::{
    Error, Result,
    httphandler::RestClient,
    mqttcluster::{Edition, NodeInfo, NodeState, Role},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Node roster entry as returned by `GET /nodes`
#[derive(Deserialize, Clone, Debug)]
struct RosterEntry {
    node: String,
    #[serde(default)]
    node_status: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    edition: String,
    #[serde(default)]
    uptime: i64,
    #[serde(default)]
    session: i64,
}

impl From<RosterEntry> for NodeInfo {
    fn from(e: RosterEntry) -> Self {
        NodeInfo {
            node_id: e.node,
            status: if e.node_status.eq_ignore_ascii_case("running") {
                NodeState::Running
            } else {
                NodeState::Stopped
            },
            edition: parse_edition(&e.edition),
            version: e.version,
            session_count: e.session,
            uptime: e.uptime,
            role: if e.role.eq_ignore_ascii_case("replicant") {
                Role::Replicant
            } else {
                Role::Core
            },
        }
    }
}

pub fn parse_edition(edition: &str) -> Edition {
    if edition.eq_ignore_ascii_case("enterprise") {
        Edition::SessionAware
    } else {
        Edition::Community
    }
}

/// Body of `POST /load_rebalance/{node}/evacuation/start`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EvacuationRequest {
    pub conn_evict_rate: i32,
    pub sess_evict_rate: i32,
    pub migrate_to: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_takeover: Option<i64>,
}

/// A port the broker listens on for clients
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerPort {
    pub name: String,
    pub port: i32,
    /// TCP or UDP
    pub protocol: String,
}

fn bind_port(bind: &Value) -> Option<i32> {
    match bind {
        Value::Number(n) => n.as_i64().map(|p| p as i32),
        Value::String(s) => s.rsplit(':').next().and_then(|p| p.parse::<i32>().ok()),
        _ => None,
    }
}

fn protocol_of(listener_type: &str) -> &'static str {
    match listener_type {
        "udp" | "dtls" | "quic" => "UDP",
        _ => "TCP",
    }
}

fn listener_port(l: &Value, fallback_type: &str) -> Option<ListenerPort> {
    if l.get("running").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    if l.get("enable").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    let port = bind_port(l.get("bind")?)?;
    let ltype = l.get("type").and_then(Value::as_str).unwrap_or(fallback_type);
    let id = l.get("id").and_then(Value::as_str).unwrap_or(ltype);
    Some(ListenerPort {
        name: id.replace([':', '_', '.'], "-").to_lowercase(),
        port,
        protocol: protocol_of(ltype).to_string(),
    })
}

/// Flatten `GET /listeners` (grouped by type) or `GET /gateways/{name}/listeners`
pub fn parse_listeners(json: &Value) -> Vec<ListenerPort> {
    let mut ret = Vec::new();
    for item in json.as_array().into_iter().flatten() {
        match item.get("listeners").and_then(Value::as_array) {
            Some(listeners) => {
                let ltype = item.get("type").and_then(Value::as_str).unwrap_or("tcp");
                ret.extend(listeners.iter().filter_map(|l| listener_port(l, ltype)));
            }
            None => ret.extend(listener_port(item, "tcp")),
        }
    }
    ret
}

/// Names of loaded gateways from `GET /gateways`
pub fn parse_gateways(json: &Value) -> Vec<String> {
    json.as_array()
        .into_iter()
        .flatten()
        .filter(|g| g.get("status").and_then(Value::as_str) == Some("running"))
        .filter_map(|g| g.get("name").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Nodes with an outstanding evacuation from `GET /load_rebalance/global_status`
pub fn parse_evacuations(json: &Value) -> Vec<String> {
    json.get("evacuations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|e| e.get("node").and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// A 404 on a single node means the broker no longer knows it
fn node_answer(answer: Result<Value>) -> Result<Option<NodeInfo>> {
    match answer {
        Ok(json) => {
            let entry: RosterEntry = serde_json::from_value(json).map_err(Error::JsonError)?;
            Ok(Some(entry.into()))
        }
        Err(e) if e.http_status() == Some(404) => Ok(None),
        Err(e) => Err(e),
    }
}

fn evacuation_start_answer<T>(node: &str, answer: Result<T>) -> Result<()> {
    match answer {
        Ok(_) => Ok(()),
        Err(Error::MethodFailed(_, code, text))
            if (code == 400 || code == 409) && text.contains("already_started") =>
        {
            tracing::debug!("evacuation of {node} already started");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Any non-2xx status is a definite "no"
fn availability_answer(status: Result<u16>) -> Result<bool> {
    status.map(|code| (200..300).contains(&code))
}

/// Typed client for the broker management HTTP API
#[derive(Clone, Debug)]
pub struct BrokerClient {
    rest: RestClient,
}

impl BrokerClient {
    #[must_use]
    pub fn new(host: &str, port: i32, username: &str, password: &str, timeout: Duration) -> Self {
        let mut rest = RestClient::new(&format!("http://{host}:{port}/api/v5"));
        rest.set_timeout(timeout);
        rest.add_header_json();
        rest.add_header_basic(username, password);
        Self { rest }
    }

    pub async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let json = self.rest.json_get("nodes").await?;
        let entries: Vec<RosterEntry> = serde_json::from_value(json).map_err(Error::JsonError)?;
        Ok(entries.into_iter().map(NodeInfo::from).collect())
    }

    /// A single node, `None` when the broker does not know it
    pub async fn node(&self, name: &str) -> Result<Option<NodeInfo>> {
        node_answer(self.rest.json_get(&format!("nodes/{name}")).await)
    }

    pub async fn evacuations(&self) -> Result<Vec<String>> {
        let json = self.rest.json_get("load_rebalance/global_status").await?;
        Ok(parse_evacuations(&json))
    }

    /// Start an evacuation, an already started one counts as success
    pub async fn start_evacuation(&self, node: &str, req: &EvacuationRequest) -> Result<()> {
        let body = serde_json::to_value(req).map_err(Error::SerializationError)?;
        let answer = self
            .rest
            .json_post(&format!("load_rebalance/{node}/evacuation/start"), &body)
            .await;
        evacuation_start_answer(node, answer)
    }

    pub async fn stop_evacuation(&self, node: &str) -> Result<()> {
        self.rest
            .body_post(&format!("load_rebalance/{node}/evacuation/stop"), String::new())
            .await
            .map(|_| ())
    }

    /// Whether this very node accepts new connections (rebalance availability check).
    ///
    /// A non-2xx answer is a definite "no", a transport failure is an error.
    pub async fn availability_check(&self) -> Result<bool> {
        let status = self
            .rest
            .http_get("load_rebalance/availability_check")
            .await
            .map(|r| r.status().as_u16())
            .map_err(Error::ReqwestError);
        availability_answer(status)
    }

    pub async fn listeners(&self) -> Result<Vec<ListenerPort>> {
        let json = self.rest.json_get("listeners").await?;
        Ok(parse_listeners(&json))
    }

    pub async fn gateways(&self) -> Result<Vec<String>> {
        let json = self.rest.json_get("gateways").await?;
        Ok(parse_gateways(&json))
    }

    pub async fn gateway_listeners(&self, gateway: &str) -> Result<Vec<ListenerPort>> {
        let json = self.rest.json_get(&format!("gateways/{gateway}/listeners")).await?;
        Ok(parse_listeners(&json))
    }

    pub async fn get_configs(&self) -> Result<String> {
        self.rest.body_get("configs").await
    }

    pub async fn put_configs(&self, hocon: &str) -> Result<()> {
        self.rest
            .body_put("configs?mode=replace", hocon.to_string(), "text/plain")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roster_entry_conversion() {
        let json = json!([
            {"node": "broker@mqtt-core-abc-0.mqtt-headless.default.svc.cluster.local", "node_status": "running",
             "otp_release": "25.3.2-1/13.2", "version": "5.1.0", "role": "core", "edition": "Enterprise",
             "uptime": 120000, "session": 150},
            {"node": "broker@10.0.0.12", "node_status": "stopped", "version": "5.1.0",
             "role": "replicant", "edition": "Opensource", "uptime": 5000}
        ]);
        let entries: Vec<RosterEntry> = serde_json::from_value(json).unwrap();
        let nodes: Vec<NodeInfo> = entries.into_iter().map(NodeInfo::from).collect();
        assert_eq!(nodes[0].edition, Edition::SessionAware);
        assert_eq!(nodes[0].session_count, 150);
        assert_eq!(nodes[0].role, Role::Core);
        assert_eq!(nodes[1].status, NodeState::Stopped);
        assert_eq!(nodes[1].edition, Edition::Community);
        assert_eq!(nodes[1].role, Role::Replicant);
        assert_eq!(nodes[1].session_count, 0);
    }

    #[test]
    fn test_evacuation_request_omits_unset_wait_takeover() {
        let req = EvacuationRequest {
            conn_evict_rate: 10,
            sess_evict_rate: 20,
            migrate_to: vec!["broker@10.0.0.2".to_string()],
            wait_takeover: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert!(v.get("wait_takeover").is_none());
        assert_eq!(v["migrate_to"][0], "broker@10.0.0.2");
    }

    #[test]
    fn test_parse_grouped_listeners() {
        let json = json!([
            {"type": "tcp", "listeners": [
                {"id": "tcp:default", "bind": "0.0.0.0:1883", "running": true, "enable": true},
                {"id": "tcp:internal", "bind": "11883", "running": false}
            ]},
            {"type": "quic", "listeners": [
                {"id": "quic:default", "bind": 14567, "running": true}
            ]}
        ]);
        let ports = parse_listeners(&json);
        assert_eq!(ports, vec![
            ListenerPort {
                name: "tcp-default".to_string(),
                port: 1883,
                protocol: "TCP".to_string()
            },
            ListenerPort {
                name: "quic-default".to_string(),
                port: 14567,
                protocol: "UDP".to_string()
            },
        ]);
    }

    #[test]
    fn test_parse_gateway_listeners() {
        let json = json!([{"id": "coap:udp:default", "type": "udp", "bind": "5683", "running": true}]);
        let ports = parse_listeners(&json);
        assert_eq!(ports[0].name, "coap-udp-default");
        assert_eq!(ports[0].protocol, "UDP");
        assert_eq!(ports[0].port, 5683);
    }

    #[test]
    fn test_parse_gateways_only_running() {
        let json = json!([{"name": "coap", "status": "running"}, {"name": "stomp", "status": "unloaded"}]);
        assert_eq!(parse_gateways(&json), vec!["coap".to_string()]);
    }

    #[test]
    fn test_parse_evacuations() {
        let json = json!({"evacuations": [{"node": "broker@10.0.0.3", "state": "evicting_conns"}], "rebalances": []});
        assert_eq!(parse_evacuations(&json), vec!["broker@10.0.0.3".to_string()]);
        assert!(parse_evacuations(&json!({})).is_empty());
    }

    fn failed(method: &str, code: u16, text: &str) -> Error {
        Error::MethodFailed(method.to_string(), code, text.to_string())
    }

    #[test]
    fn test_unknown_node_is_none() {
        let answer = node_answer(Err(failed("Get", 404, "NOT_FOUND")));
        assert!(matches!(answer, Ok(None)));
        let answer = node_answer(Err(failed("Get", 500, "internal")));
        assert!(matches!(answer, Err(Error::MethodFailed(_, 500, _))));
        let answer = node_answer(Ok(json!({"node": "broker@10.0.0.1", "node_status": "running", "role": "replicant"})));
        let node = answer.unwrap().unwrap();
        assert_eq!(node.node_id, "broker@10.0.0.1");
        assert_eq!(node.role, Role::Replicant);
    }

    #[test]
    fn test_already_started_evacuation_is_success() {
        let body = r#"{"code":"BAD_REQUEST","message":"already_started"}"#;
        assert!(evacuation_start_answer::<Value>("n1", Err(failed("Post", 400, body))).is_ok());
        assert!(evacuation_start_answer::<Value>("n1", Err(failed("Post", 409, body))).is_ok());
        assert!(evacuation_start_answer::<Value>("n1", Err(failed("Post", 400, "bad_request"))).is_err());
        assert!(evacuation_start_answer::<Value>("n1", Err(failed("Post", 503, body))).is_err());
        assert!(evacuation_start_answer("n1", Ok(json!({}))).is_ok());
    }

    #[test]
    fn test_availability_check_status() {
        assert!(availability_answer(Ok(200)).unwrap());
        assert!(!availability_answer(Ok(503)).unwrap());
        assert!(!availability_answer(Ok(404)).unwrap());
        assert!(availability_answer(Err(Error::Other("connection refused".to_string()))).is_err());
    }
}
