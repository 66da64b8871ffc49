//! The ordered message log and its mutation primitives.
//!
//! The log owns every message of one conversation and the id of the message
//! that is currently being generated. It is mutated only through the methods
//! below, each of which leaves these invariants intact:
//!
//! - message ids are unique;
//! - the relative order of messages a mutation does not remove never changes;
//! - `updated_at` is refreshed whenever a visible field changes.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::patch::{Patch, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Generating,
    Completed,
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Sub-agent that authored the message; `None` is system-level.
    pub publisher: Option<String>,
    pub status: MessageStatus,
    pub title: String,
    pub thinking: String,
    pub content: String,
    pub action_title: String,
    pub action_params: Value,
    pub snapshot_id: String,
    pub visible_node_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        let now = timestamp();
        Message {
            id: id.into(),
            role,
            publisher: None,
            status: MessageStatus::Completed,
            title: String::new(),
            thinking: String::new(),
            content: String::new(),
            action_title: String::new(),
            action_params: Value::Object(Default::default()),
            snapshot_id: String::new(),
            visible_node_ids: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.status == MessageStatus::Generating
    }

    /// Title, content and thinking joined for export, skipping empty parts.
    pub fn copy_text(&self) -> String {
        [
            ("Title", &self.title),
            ("Content", &self.content),
            ("Thinking", &self.thinking),
        ]
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(label, v)| format!("{label}: {v}"))
        .collect::<Vec<_>>()
        .join("\n\n")
    }

    fn apply(&mut self, patch: &Patch) {
        if let Some(delta) = &patch.thinking_delta {
            self.thinking.push_str(delta);
        }
        if let Some(delta) = &patch.content_delta {
            self.content.push_str(delta);
        }
        if let Some(title) = &patch.title {
            self.title.clone_from(title);
        }
        if let Some(publisher) = &patch.publisher {
            self.publisher = Some(publisher.clone());
        }
        if let Some(action_title) = &patch.action_title {
            self.action_title.clone_from(action_title);
        }
        if let Some(params) = &patch.action_params {
            self.action_params = params.clone();
        }
        if let Some(snapshot_id) = &patch.snapshot_id {
            self.snapshot_id.clone_from(snapshot_id);
        }
        if let Some(ids) = &patch.visible_node_ids {
            self.visible_node_ids.clone_from(ids);
        }
        if patch.finished {
            self.status = MessageStatus::Completed;
        }
        self.updated_at = timestamp();
    }
}

/// Current time as an RFC 3339 string with millisecond precision.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    generating_id: Option<String>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Id of the message currently being generated, if any.
    pub fn generating_id(&self) -> Option<&str> {
        self.generating_id.as_deref()
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(move |m| m.role == role)
    }

    pub fn generating(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_generating())
    }

    /// Push `message` at the end. Its status follows `finished`.
    pub fn append(&mut self, mut message: Message, finished: bool) -> Result<()> {
        if self.contains(&message.id) {
            return Err(SyncError::protocol(format!(
                "message {} already exists",
                message.id
            )));
        }
        if finished {
            message.status = MessageStatus::Completed;
        } else {
            message.status = MessageStatus::Generating;
            if let Some(current) = &self.generating_id {
                warn!(current = %current, new = %message.id, "new message while another is generating");
            }
            self.generating_id = Some(message.id.clone());
        }
        debug!(id = %message.id, role = %message.role, finished, "message appended");
        self.messages.push(message);
        self.check_invariants();
        Ok(())
    }

    /// Build a new message from the first patch that names its id.
    ///
    /// Delta fields become the initial `thinking`/`content`.
    pub fn create_from_patch(&mut self, patch: &Patch) -> Result<()> {
        let id = patch
            .message_id
            .as_deref()
            .ok_or_else(|| SyncError::protocol("create requires message_id"))?;
        let role = patch
            .role
            .ok_or_else(|| SyncError::protocol(format!("create of {id} requires role")))?;
        let mut message = Message::new(id, role);
        message.apply(patch);
        self.append(message, patch.finished)
    }

    /// Apply `patch` to the message with `id`. Returns `false` if there is none.
    pub fn apply_to_message(&mut self, id: &str, patch: &Patch) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            warn!(id, "patch for unknown message ignored");
            return false;
        };
        message.apply(patch);
        if patch.finished && self.generating_id.as_deref() == Some(id) {
            self.generating_id = None;
        }
        self.check_invariants();
        true
    }

    /// Apply `patch` to every message whose status is generating.
    ///
    /// Returns the ids that were touched, in log order.
    pub fn apply_to_all_generating(&mut self, patch: &Patch) -> Vec<String> {
        let mut touched = Vec::new();
        for message in self.messages.iter_mut().filter(|m| m.is_generating()) {
            message.apply(patch);
            touched.push(message.id.clone());
        }
        if patch.finished {
            if let Some(current) = &self.generating_id {
                if touched.contains(current) {
                    self.generating_id = None;
                }
            }
        }
        self.check_invariants();
        touched
    }

    /// Drop every message after `id` and reopen `id` for regeneration.
    ///
    /// Returns the number of messages removed, or `None` if `id` is not in the
    /// log, in which case nothing changes.
    pub fn truncate_after(&mut self, id: &str) -> Option<usize> {
        let Some(index) = self.position(id) else {
            warn!(id, "rollback target not found; log unchanged");
            return None;
        };
        let removed = self.messages.len() - index - 1;
        self.messages.truncate(index + 1);
        let target = &mut self.messages[index];
        target.content.clear();
        target.thinking.clear();
        target.status = MessageStatus::Generating;
        target.updated_at = timestamp();
        self.generating_id = Some(target.id.clone());
        debug!(id, removed, "log truncated");
        self.check_invariants();
        Some(removed)
    }

    /// Empty `content` and `thinking` of `id` ahead of a full replay.
    pub fn reset_text(&mut self, id: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.content.clear();
                message.thinking.clear();
                message.updated_at = timestamp();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.generating_id = None;
    }

    /// Mark every generating message completed and clear the generating
    /// pointer. Returns the ids that changed, in log order.
    ///
    /// Called when the stream feeding those messages has ended, so a later
    /// broadcast cannot reach them.
    pub fn settle_generating(&mut self) -> Vec<String> {
        let now = timestamp();
        let mut settled = Vec::new();
        for message in self.messages.iter_mut().filter(|m| m.is_generating()) {
            message.status = MessageStatus::Completed;
            message.updated_at.clone_from(&now);
            settled.push(message.id.clone());
        }
        if !settled.is_empty() {
            debug!(ids = ?settled, "generating messages settled");
        }
        self.generating_id = None;
        self.check_invariants();
        settled
    }

    /// Replace the whole log, e.g. with converted history.
    ///
    /// Later duplicates of an id are dropped. The generating pointer is set to
    /// the first message whose status is generating.
    pub fn replace_all(&mut self, messages: Vec<Message>) {
        let mut kept: Vec<Message> = Vec::with_capacity(messages.len());
        for message in messages {
            if kept.iter().any(|m| m.id == message.id) {
                warn!(id = %message.id, "duplicate id in history dropped");
                continue;
            }
            kept.push(message);
        }
        self.generating_id = kept
            .iter()
            .find(|m| m.is_generating())
            .map(|m| m.id.clone());
        self.messages = kept;
        self.check_invariants();
    }

    fn check_invariants(&self) {
        debug_assert!(
            {
                let mut ids: Vec<&str> = self.messages.iter().map(|m| m.id.as_str()).collect();
                ids.sort_unstable();
                ids.windows(2).all(|w| w[0] != w[1])
            },
            "message ids must be unique"
        );
        debug_assert!(
            self.generating_id
                .as_deref()
                .map_or(true, |id| self.contains(id)),
            "generating id must name a message in the log"
        );
    }
}
