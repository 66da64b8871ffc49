//! REST request/response shapes and the history adapter.
//!
//! History arrives in two envelopes: the project full-data endpoint wraps it
//! as `{success, data: {...}}`, the agent history endpoint returns it bare.
//! Both are converted into [`Message`]s here and nowhere else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::message_log::{timestamp, Message, MessageStatus};
use crate::patch::Role;

/// Body of `POST /agents/messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub content: String,
    pub title: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_params: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StopResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RollbackResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub deleted_count: usize,
    #[serde(default)]
    pub target_snapshot_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A message as the backend stores it. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub action_title: Option<String>,
    #[serde(default)]
    pub action_params: Option<Value>,
    #[serde(default)]
    pub snapshot_id: Option<String>,
    #[serde(default)]
    pub visible_node_ids: Option<Vec<String>>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl HistoryMessage {
    pub fn into_message(self) -> Message {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_message_id);
        let mut message = Message::new(id, self.role.unwrap_or(Role::User));
        message.publisher = self.publisher;
        message.status = self.status.unwrap_or(MessageStatus::Completed);
        message.title = self.title.unwrap_or_default();
        message.thinking = self.thinking.unwrap_or_default();
        message.content = self.content.unwrap_or_default();
        message.action_title = self.action_title.unwrap_or_default();
        if let Some(params) = self.action_params.filter(|v| !v.is_null()) {
            message.action_params = params;
        }
        message.snapshot_id = self.snapshot_id.unwrap_or_default();
        message.visible_node_ids = self.visible_node_ids.unwrap_or_default();
        let now = timestamp();
        message.created_at = self.created_at.unwrap_or_else(|| now.clone());
        message.updated_at = self.updated_at.unwrap_or(now);
        message
    }
}

pub fn generate_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// Authoritative conversation state from the backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct History {
    #[serde(default)]
    pub messages: Vec<HistoryMessage>,
    #[serde(default)]
    pub incomplete_message_id: Option<String>,
    #[serde(default)]
    pub current_snapshot_id: Option<String>,
    #[serde(default)]
    pub project_info: Option<Value>,
}

impl History {
    /// Converted messages and the id of the message left incomplete, if any.
    pub fn into_parts(self) -> (Vec<Message>, Option<String>) {
        let messages = self
            .messages
            .into_iter()
            .map(HistoryMessage::into_message)
            .collect();
        let incomplete = self.incomplete_message_id.filter(|id| !id.is_empty());
        (messages, incomplete)
    }
}

#[derive(Debug, Deserialize)]
struct Wrapped {
    success: bool,
    #[serde(default)]
    data: Option<History>,
    #[serde(default)]
    message: Option<String>,
}

/// Parse either history envelope. `Err` carries the backend's failure message.
pub fn parse_history(body: &[u8]) -> Result<History, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid history body: {e}"))?;
    if value.get("success").is_none() {
        return serde_json::from_value(value).map_err(|e| format!("invalid history: {e}"));
    }
    let wrapped: Wrapped =
        serde_json::from_value(value).map_err(|e| format!("invalid history envelope: {e}"))?;
    if wrapped.success {
        Ok(wrapped.data.unwrap_or_default())
    } else {
        Err(wrapped
            .message
            .unwrap_or_else(|| "history request unsuccessful".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_request_omits_empty_params() {
        let req = SendRequest {
            content: "Problem id: p1".into(),
            title: "User message".into(),
            agent_name: "auto_research_agent".into(),
            other_params: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["agent_name"], "auto_research_agent");
        assert!(v.get("other_params").is_none());
    }

    #[test]
    fn test_wrapped_full_data_envelope() {
        let body = json!({
            "success": true,
            "data": {
                "messages": [
                    {"id": "m1", "role": "user", "status": "completed", "content": "Hi"},
                    {"id": "m2", "role": "assistant", "status": "generating",
                     "publisher": "auto_research_agent", "content": "Hel"}
                ],
                "incomplete_message_id": "m2",
                "project_info": {"project_name": "demo"},
                "current_snapshot_id": "s3"
            }
        });
        let history = parse_history(body.to_string().as_bytes()).unwrap();
        assert_eq!(history.current_snapshot_id.as_deref(), Some("s3"));
        let (messages, incomplete) = history.into_parts();
        assert_eq!(incomplete.as_deref(), Some("m2"));
        assert_eq!(messages[1].status, MessageStatus::Generating);
        assert_eq!(messages[1].publisher.as_deref(), Some("auto_research_agent"));
    }

    #[test]
    fn test_bare_history_envelope() {
        let body = json!({"messages": [{"id": "m1", "role": "user"}], "incomplete_message_id": null});
        let (messages, incomplete) = parse_history(body.to_string().as_bytes())
            .unwrap()
            .into_parts();
        assert_eq!(messages.len(), 1);
        assert!(incomplete.is_none());
    }

    #[test]
    fn test_unsuccessful_envelope_is_error() {
        let body = json!({"success": false, "message": "no project loaded"});
        assert_eq!(
            parse_history(body.to_string().as_bytes()).unwrap_err(),
            "no project loaded"
        );
    }

    #[test]
    fn test_history_message_defaults() {
        let m = HistoryMessage::default().into_message();
        assert!(m.id.starts_with("msg_"));
        assert_eq!(m.role, Role::User);
        assert_eq!(m.status, MessageStatus::Completed);
        assert_eq!(m.action_params, json!({}));
        assert!(m.visible_node_ids.is_empty());
    }

    #[test]
    fn test_history_timestamps_kept_verbatim() {
        let h: HistoryMessage = serde_json::from_value(json!({
            "id": "m1", "created_at": "2025-03-01T10:00:00", "updated_at": "2025-03-01T10:05:00"
        }))
        .unwrap();
        let m = h.into_message();
        assert_eq!(m.created_at, "2025-03-01T10:00:00");
        assert_eq!(m.updated_at, "2025-03-01T10:05:00");
    }

    #[test]
    fn test_empty_incomplete_id_is_none() {
        let history = History {
            incomplete_message_id: Some(String::new()),
            ..Default::default()
        };
        assert!(history.into_parts().1.is_none());
    }

    #[test]
    fn test_rollback_response_shape() {
        let r: RollbackResponse = serde_json::from_value(json!({
            "success": true, "message": "rolled back", "deleted_count": 3, "target_snapshot_id": "s2"
        }))
        .unwrap();
        assert_eq!(r.deleted_count, 3);
        assert_eq!(r.target_snapshot_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_malformed_wrapped_history_is_error_not_empty() {
        let body = json!({"success": true, "data": {"messages": [{"id": "m1", "role": "robot"}]}});
        assert!(parse_history(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(generate_message_id(), generate_message_id());
    }
}
