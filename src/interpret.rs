//! Classification of patches into log actions.
//!
//! Nothing here mutates state: [`classify`] only reads the log to decide
//! whether a patch creates or updates a message. The session applies the
//! resulting [`Action`]s.

use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::message_log::MessageLog;
use crate::patch::{Patch, Role, Speaker};

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Forward a tree document to the snapshot store.
    UpdateExternalSnapshot(Value),
    SetActiveSpeaker(Speaker),
    ClearActiveSpeaker,
    /// Truncate after the id and reopen it.
    Rollback(String),
    /// Apply to every generating message.
    BroadcastUpdate(Patch),
    CreateMessage(Patch),
    UpdateMessage(String, Patch),
}

/// Result of classifying one patch.
///
/// Side effects are independent of the primary action and are reported even
/// when the primary action is rejected.
#[derive(Debug)]
pub struct Classified {
    pub side_effects: Vec<Action>,
    pub primary: Result<Action>,
}

pub fn classify(patch: Patch, log: &MessageLog) -> Classified {
    let mut side_effects = Vec::new();

    if let Some(data) = patch.snapshot_data() {
        side_effects.push(Action::UpdateExternalSnapshot(data.clone()));
    }

    match (patch.role, patch.publisher.as_deref()) {
        (Some(Role::Assistant), Some(publisher)) => {
            side_effects.push(Action::SetActiveSpeaker(Speaker::Agent(publisher.to_string())))
        }
        (Some(Role::Assistant), None) => side_effects.push(Action::SetActiveSpeaker(Speaker::System)),
        (Some(Role::User), _) => side_effects.push(Action::ClearActiveSpeaker),
        _ => {}
    }

    Classified {
        side_effects,
        primary: primary_action(patch, log),
    }
}

fn primary_action(patch: Patch, log: &MessageLog) -> Result<Action> {
    if patch.rollback {
        return match patch.message_id {
            Some(id) => Ok(Action::Rollback(id)),
            None => Err(SyncError::protocol("rollback patch without message_id")),
        };
    }
    if patch.is_broadcast() {
        return Ok(Action::BroadcastUpdate(patch));
    }
    let Some(id) = patch.message_id.clone() else {
        return Err(SyncError::protocol("patch without message_id"));
    };
    if log.contains(&id) {
        Ok(Action::UpdateMessage(id, patch))
    } else if patch.role.is_none() {
        Err(SyncError::protocol(format!(
            "first patch for {id} carries no role"
        )))
    } else {
        Ok(Action::CreateMessage(patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::EmbeddedSnapshot;
    use rstest::rstest;
    use serde_json::json;

    fn log_with(id: &str) -> MessageLog {
        let mut log = MessageLog::new();
        log.create_from_patch(&Patch::new(id).role(Role::User).finished())
            .unwrap();
        log
    }

    #[test]
    fn test_snapshot_side_effect_co_occurs_with_update() {
        let mut patch = Patch::new("m1").content("x");
        patch.snapshot = Some(EmbeddedSnapshot {
            id: Some("s1".into()),
            data: Some(json!({"roots": [1]})),
        });
        let c = classify(patch, &log_with("m1"));
        assert_eq!(
            c.side_effects,
            vec![Action::UpdateExternalSnapshot(json!({"roots": [1]}))]
        );
        assert!(matches!(c.primary, Ok(Action::UpdateMessage(ref id, _)) if id == "m1"));
    }

    #[rstest]
    #[case(Some(Role::Assistant), Some("auto_research_agent"), Some(Action::SetActiveSpeaker(Speaker::Agent("auto_research_agent".into()))))]
    #[case(Some(Role::Assistant), None, Some(Action::SetActiveSpeaker(Speaker::System)))]
    #[case(Some(Role::User), None, Some(Action::ClearActiveSpeaker))]
    #[case(Some(Role::System), None, None)]
    #[case(None, Some("auto_research_agent"), None)]
    fn test_speaker_side_channel(
        #[case] role: Option<Role>,
        #[case] publisher: Option<&str>,
        #[case] expected: Option<Action>,
    ) {
        let mut patch = Patch::new("new");
        patch.role = role;
        patch.publisher = publisher.map(str::to_string);
        let c = classify(patch, &MessageLog::new());
        assert_eq!(c.side_effects, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn test_rollback_wins_over_everything() {
        let patch = Patch::new("m1").role(Role::Assistant).rollback();
        let c = classify(patch, &MessageLog::new());
        assert_eq!(c.primary.unwrap(), Action::Rollback("m1".into()));
    }

    #[test]
    fn test_rollback_without_id_is_protocol_error() {
        let patch = Patch::default().rollback();
        let c = classify(patch, &MessageLog::new());
        assert!(matches!(c.primary, Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_broadcast_sentinel() {
        let c = classify(Patch::broadcast().content("x"), &MessageLog::new());
        assert!(matches!(c.primary, Ok(Action::BroadcastUpdate(_))));
    }

    #[test]
    fn test_unknown_id_with_role_creates() {
        let c = classify(Patch::new("m9").role(Role::Assistant), &log_with("m1"));
        assert!(matches!(c.primary, Ok(Action::CreateMessage(_))));
    }

    #[test]
    fn test_unknown_id_without_role_is_protocol_error() {
        let c = classify(Patch::new("m9").content("x"), &log_with("m1"));
        assert!(matches!(c.primary, Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_known_id_updates_even_with_role() {
        let c = classify(Patch::new("m1").role(Role::User), &log_with("m1"));
        assert!(matches!(c.primary, Ok(Action::UpdateMessage(_, _))));
        assert_eq!(c.side_effects, vec![Action::ClearActiveSpeaker]);
    }

    #[test]
    fn test_missing_id_is_protocol_error() {
        let c = classify(Patch::default().role(Role::User), &MessageLog::new());
        assert!(c.primary.is_err());
        assert_eq!(c.side_effects, vec![Action::ClearActiveSpeaker]);
    }
}
