use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `message_id` value that addresses every message still generating.
pub const BROADCAST_ID: &str = "-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Who is currently acting, as shown by the "active speaker" highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Speaker {
    /// An assistant patch that carried no publisher.
    System,
    /// A named sub-agent.
    Agent(String),
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::System => write!(f, "system"),
            Speaker::Agent(name) => write!(f, "{name}"),
        }
    }
}

/// External tree document that may ride along with a patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

fn null_as_false<'de, D: serde::Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(d)?.unwrap_or(false))
}

/// One incremental instruction from the stream.
///
/// `thinking_delta` and `content_delta` append. Every other optional field
/// replaces the stored value when present; `None` (absent or JSON `null`)
/// leaves it alone, while `Some(String::new())` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_delta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_node_ids: Option<Vec<String>>,
    #[serde(default, deserialize_with = "null_as_false")]
    pub rollback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<EmbeddedSnapshot>,
}

impl Patch {
    pub fn new(message_id: impl Into<String>) -> Self {
        Patch {
            message_id: Some(message_id.into()),
            ..Default::default()
        }
    }

    pub fn broadcast() -> Self {
        Patch::new(BROADCAST_ID)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn is_broadcast(&self) -> bool {
        self.message_id.as_deref() == Some(BROADCAST_ID)
    }

    /// The embedded tree document, if one was sent and is not `null`.
    pub fn snapshot_data(&self) -> Option<&Value> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.data.as_ref())
            .filter(|v| !v.is_null())
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn publisher(mut self, publisher: impl Into<String>) -> Self {
        self.publisher = Some(publisher.into());
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn content(mut self, delta: impl Into<String>) -> Self {
        self.content_delta = Some(delta.into());
        self
    }

    pub fn thinking(mut self, delta: impl Into<String>) -> Self {
        self.thinking_delta = Some(delta.into());
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }

    pub fn rollback(mut self) -> Self {
        self.rollback = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_keys_deserialize() {
        let v = json!({
            "message_id": "m2",
            "role": "assistant",
            "publisher": "auto_research_agent",
            "finished": false,
            "title": "Plan",
            "thinking_delta": "hmm",
            "content_delta": "Hel",
            "action_title": "create_solution",
            "action_params": {"node": "p1"},
            "snapshot_id": "s7",
            "visible_node_ids": ["p1", "s1"],
            "rollback": false,
            "snapshot": {"id": "s7", "data": {"roots": []}}
        });
        let p = Patch::from_value(v).expect("deser");
        assert_eq!(p.message_id.as_deref(), Some("m2"));
        assert_eq!(p.role, Some(Role::Assistant));
        assert_eq!(p.content_delta.as_deref(), Some("Hel"));
        assert_eq!(p.visible_node_ids.as_ref().map(Vec::len), Some(2));
        assert_eq!(p.snapshot_data(), Some(&json!({"roots": []})));
    }

    #[test]
    fn test_null_and_missing_are_absent_but_empty_string_is_present() {
        let p = Patch::from_value(json!({"message_id": "m", "title": null})).expect("deser");
        assert!(p.title.is_none());
        assert!(p.action_title.is_none());

        let p = Patch::from_value(json!({"message_id": "m", "title": ""})).expect("deser");
        assert_eq!(p.title.as_deref(), Some(""));
    }

    #[test]
    fn test_null_flags_are_false() {
        let p = Patch::from_value(json!({"message_id": "m", "finished": null, "rollback": null}))
            .expect("deser");
        assert!(!p.finished);
        assert!(!p.rollback);
    }

    #[test]
    fn test_null_snapshot_data_is_ignored() {
        let p = Patch::from_value(json!({"message_id": "m", "snapshot": {"data": null}}))
            .expect("deser");
        assert!(p.snapshot_data().is_none());
        let p = Patch::from_value(json!({"message_id": "m", "snapshot": null})).expect("deser");
        assert!(p.snapshot_data().is_none());
    }

    #[test]
    fn test_broadcast_detection() {
        assert!(Patch::broadcast().is_broadcast());
        assert!(!Patch::new("m1").is_broadcast());
        assert!(!Patch::default().is_broadcast());
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        assert!(Patch::from_value(json!({"message_id": "m", "role": "robot"})).is_err());
    }

    #[test]
    fn test_speaker_display() {
        assert_eq!(Speaker::System.to_string(), "system");
        assert_eq!(Speaker::Agent("user_chat_agent".into()).to_string(), "user_chat_agent");
    }
}
