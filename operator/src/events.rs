use common::mqttcluster::Role;
use kube::runtime::events::{Event, EventType};

/// Event notes are capped at 1KiB, cut on a char boundary
fn truncated(mut note: String) -> Option<String> {
    let mut end = 1023.min(note.len());
    while !note.is_char_boundary(end) {
        end -= 1;
    }
    note.truncate(end);
    Some(note)
}

#[must_use]
pub fn generation_created(role: Role, name: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "GenerationCreated".to_string(),
        note: Some(format!("Created {role} generation `{name}`")),
        action: "Create".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn generation_collision(role: Role, name: &str, collision_count: i32) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "GenerationCollision".to_string(),
        note: Some(format!(
            "{role} generation `{name}` already exists with another template, collision count is now {collision_count}"
        )),
        action: "Create".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn node_status_failed(error: String) -> Event {
    Event {
        type_: EventType::Warning,
        reason: "NodeStatusFailed".to_string(),
        note: truncated(format!("Failed to get the node roster: {error}")),
        action: "GetNodes".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn transition(state: &str, message: &str) -> Event {
    Event {
        type_: EventType::Normal,
        reason: state.to_string(),
        note: Some(message.to_string()),
        action: "Transition".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn evacuation_started(node: &str, targets: &[String]) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "EvacuationStarted".to_string(),
        note: truncated(format!(
            "Started session evacuation of `{node}` toward {}",
            targets.join(", ")
        )),
        action: "Evacuate".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn evacuation_pending(node: &str, sessions: i64) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "EvacuationInProgress".to_string(),
        note: Some(format!("Node `{node}` still holds {sessions} sessions")),
        action: "Evacuate".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn scale_down(role: Role, generation: &str, pod: &str, replicas: i32) -> Event {
    Event {
        type_: EventType::Normal,
        reason: "ScaleDown".to_string(),
        note: Some(format!(
            "Retiring pod `{pod}` of {role} generation `{generation}`, scaling to {replicas}"
        )),
        action: "ScaleDown".to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn api_failed(action: &str, error: String) -> Event {
    Event {
        type_: EventType::Warning,
        reason: format!("{action}Failed"),
        note: truncated(error),
        action: action.to_string(),
        secondary: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_notes_are_cut_on_char_boundary() {
        let ev = api_failed("PutConfigs", "x".repeat(1022) + "é trailing");
        let note = ev.note.unwrap_or_default();
        assert_eq!(note.len(), 1022);
        assert!(note.chars().all(|c| c == 'x'));
    }

    #[tokio::test]
    async fn test_unreachable_apiserver_fails_the_event() {
        let client = kube::Client::try_from(kube::Config::new("http://127.0.0.1:1".parse().unwrap())).unwrap();
        let cluster = crate::nodestatus::tests::cluster();
        let sent = cluster
            .send_event(client, generation_created(Role::Core, "mqtt-core-abc"))
            .await;
        assert!(matches!(sent, Err(common::Error::KubeError(_))));
    }

    #[test]
    fn test_short_notes_are_kept() {
        let ev = node_status_failed("connection refused".to_string());
        assert_eq!(
            ev.note.as_deref(),
            Some("Failed to get the node roster: connection refused")
        );
    }
}
