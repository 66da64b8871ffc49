//! One conversation: its message log and the single streaming connection
//! that feeds it.
//!
//! ## State machine
//! `Idle → Hydrating → (Idle | Streaming) → Idle`
//!
//! - [`ConversationSession::hydrate`] replaces the log with the backend's
//!   history and, when a message was left incomplete, streams its
//!   continuation.
//! - [`ConversationSession::send_message`] and
//!   [`ConversationSession::continue_incomplete`] open a stream and drive it to
//!   the end. At most one stream is open at a time; asking for a second one
//!   fails with [`SyncError::StreamBusy`].
//! - When a stream ends for any reason every message still generating is
//!   marked completed, and the generating pointer and the active speaker are
//!   cleared before control returns to the caller.
//!
//! Stopping is out-of-band: a [`StopHandle`] shares the backend and can be
//! used from another task while the session is driving a stream.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, ByteStream};
use crate::error::{Result, SyncError};
use crate::frame::{EventKind, EventStream};
use crate::interpret::{classify, Action};
use crate::message_log::{Message, MessageLog};
use crate::patch::{Patch, Speaker};
use crate::snapshot::{SnapshotStore, TreeSnapshot};
use crate::wire::{RollbackResponse, SendRequest, StopResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    Send,
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Hydrating,
    Streaming(StreamOrigin),
}

/// Why a stream stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    /// `data: [DONE]`.
    Done,
    /// `event: finished` with its payload.
    Finished(Value),
    /// `event: error` with its payload.
    ServerError(Value),
    /// The body ended without a terminal event.
    Eof,
    Transport(String),
    /// Closed locally by [`ConversationSession::teardown`].
    TornDown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub origin: StreamOrigin,
    pub reason: EndReason,
    /// Patches applied to the log.
    pub applied: usize,
    /// Patches dropped as undecodable or protocol violations.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HydrateOutcome {
    /// Messages loaded from history.
    pub messages: usize,
    pub incomplete_id: Option<String>,
    pub continuation: Option<StreamOutcome>,
}

/// Notifications for observers of the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LogReset { len: usize },
    MessageCreated(String),
    MessageUpdated(String),
    RolledBack { target: String, removed: usize },
    SpeakerChanged(Option<Speaker>),
    SnapshotUpdated,
    StreamOpened(StreamOrigin),
    StreamEnded(EndReason),
}

/// Read-only view of the log. `Pending` until the session has been hydrated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogView<'a> {
    Pending,
    Ready(&'a [Message]),
}

/// Holds the hydrating flag up for as long as it lives, so a hydrate future
/// dropped mid-fetch leaves the session idle.
struct HydratingGuard<'a>(&'a mut bool);

impl<'a> HydratingGuard<'a> {
    fn raise(flag: &'a mut bool) -> Self {
        *flag = true;
        HydratingGuard(flag)
    }
}

impl Drop for HydratingGuard<'_> {
    fn drop(&mut self) {
        *self.0 = false;
    }
}

struct ActiveStream {
    events: EventStream,
    origin: StreamOrigin,
    applied: usize,
    dropped: usize,
}

pub struct StopHandle<B> {
    backend: Arc<B>,
}

impl<B> Clone for StopHandle<B> {
    fn clone(&self) -> Self {
        StopHandle {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> StopHandle<B> {
    /// Ask the backend to stop generating. The backend then ends the stream.
    pub async fn stop(&self) -> Result<StopResponse> {
        info!("requesting stop");
        self.backend.stop().await
    }
}

pub struct ConversationSession<B> {
    backend: Arc<B>,
    log: MessageLog,
    active: Option<ActiveStream>,
    hydrating: bool,
    hydrated: bool,
    speaker: Option<Speaker>,
    snapshots: Box<dyn SnapshotStore>,
    events_tx: Option<mpsc::UnboundedSender<SessionEvent>>,
    /// Continued message whose first inbound patch replays its full text.
    resync: Option<String>,
}

impl<B: Backend> ConversationSession<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        ConversationSession {
            backend,
            log: MessageLog::new(),
            active: None,
            hydrating: false,
            hydrated: false,
            speaker: None,
            snapshots: Box::new(TreeSnapshot::new()),
            events_tx: None,
            resync: None,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    pub fn with_snapshot_store(mut self, store: Box<dyn SnapshotStore>) -> Self {
        self.snapshots = store;
        self
    }

    // -- read side --------------------------------------------------------

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn view(&self) -> LogView<'_> {
        if self.hydrated {
            LogView::Ready(self.log.messages())
        } else {
            LogView::Pending
        }
    }

    pub fn state(&self) -> SessionState {
        match &self.active {
            Some(active) => SessionState::Streaming(active.origin),
            None if self.hydrating => SessionState::Hydrating,
            None => SessionState::Idle,
        }
    }

    /// True only while a stream is open and a message is in flight.
    pub fn is_generating(&self) -> bool {
        self.active.is_some() && self.log.generating_id().is_some()
    }

    pub fn active_speaker(&self) -> Option<&Speaker> {
        self.speaker.as_ref()
    }

    pub fn snapshot_store(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    pub fn stop_handle(&self) -> StopHandle<B> {
        StopHandle {
            backend: Arc::clone(&self.backend),
        }
    }

    // -- hydration --------------------------------------------------------

    /// Replace the log with the backend's history and continue any
    /// incomplete message. On failure the log is left untouched.
    pub async fn hydrate(&mut self) -> Result<HydrateOutcome> {
        self.ensure_idle("hydrate")?;
        info!("hydrating from backend history");
        let fetched = {
            let backend = Arc::clone(&self.backend);
            let _guard = HydratingGuard::raise(&mut self.hydrating);
            backend.fetch_history().await
        };
        let (messages, incomplete_id) = fetched?.into_parts();

        self.log.replace_all(messages);
        self.hydrated = true;
        let loaded = self.log.len();
        info!(messages = loaded, incomplete = ?incomplete_id, "history loaded");
        self.emit(SessionEvent::LogReset { len: loaded });

        let continuation = match &incomplete_id {
            Some(id) => Some(self.continue_incomplete(id).await?),
            None => None,
        };
        Ok(HydrateOutcome {
            messages: loaded,
            incomplete_id,
            continuation,
        })
    }

    /// Hydrate once. Returns `None` if the session was already hydrated.
    pub async fn ensure_hydrated(&mut self) -> Result<Option<HydrateOutcome>> {
        if self.hydrated {
            return Ok(None);
        }
        self.hydrate().await.map(Some)
    }

    // -- streams ----------------------------------------------------------

    pub async fn send_message(&mut self, request: SendRequest) -> Result<StreamOutcome> {
        self.start_send(request).await?;
        self.drive().await
    }

    pub async fn continue_incomplete(&mut self, message_id: &str) -> Result<StreamOutcome> {
        self.start_continuation(message_id).await?;
        self.drive().await
    }

    /// Open a send stream without draining it. See [`Self::step`].
    pub async fn start_send(&mut self, request: SendRequest) -> Result<()> {
        self.ensure_idle("send")?;
        info!(agent = %request.agent_name, "sending message");
        let stream = self.backend.start_conversation(&request).await?;
        self.open(stream, StreamOrigin::Send);
        Ok(())
    }

    /// Open a continuation stream without draining it.
    pub async fn start_continuation(&mut self, message_id: &str) -> Result<()> {
        self.ensure_idle("continue")?;
        info!(id = message_id, "continuing incomplete message");
        let stream = self.backend.continue_incomplete(message_id).await?;
        self.resync = self
            .log
            .contains(message_id)
            .then(|| message_id.to_string());
        self.open(stream, StreamOrigin::Continuation);
        Ok(())
    }

    /// Drive the open stream until it ends.
    pub async fn drive(&mut self) -> Result<StreamOutcome> {
        loop {
            if let Some(outcome) = self.step().await? {
                return Ok(outcome);
            }
        }
    }

    /// Process one event from the open stream.
    ///
    /// Returns `Some` when the stream has ended. A transport error ends the
    /// stream, resets generation state and is then returned.
    pub async fn step(&mut self) -> Result<Option<StreamOutcome>> {
        let next = match self.active.as_mut() {
            Some(active) => active.events.next_event().await,
            None => return Err(SyncError::NoStream),
        };
        let reason = match next {
            Some(Ok(event)) => match event.kind {
                EventKind::Patch => {
                    self.ingest(event.data);
                    return Ok(None);
                }
                EventKind::Finished => EndReason::Finished(event.data),
                EventKind::Error => {
                    error!(payload = %event.data, "server reported an error");
                    EndReason::ServerError(event.data)
                }
                EventKind::Done => EndReason::Done,
            },
            Some(Err(e)) => {
                error!(error = %e, "stream transport failed");
                self.close_active(EndReason::Transport(e.to_string()));
                return Err(e);
            }
            None => EndReason::Eof,
        };
        Ok(self.close_active(reason))
    }

    /// Forcibly close any open stream, e.g. when the view goes away.
    pub fn teardown(&mut self) {
        self.close_active(EndReason::TornDown);
    }

    pub async fn stop(&self) -> Result<StopResponse> {
        self.stop_handle().stop().await
    }

    /// Roll back on the backend, then locally. Nothing changes locally if the
    /// backend refuses.
    pub async fn rollback_to(&mut self, message_id: &str) -> Result<RollbackResponse> {
        self.ensure_idle("rollback")?;
        let response = self.backend.rollback_to(message_id).await?;
        info!(
            id = message_id,
            deleted = response.deleted_count,
            "backend rollback acknowledged"
        );
        self.apply(Action::Rollback(message_id.to_string()))?;
        Ok(response)
    }

    /// Close any stream and empty the log.
    pub fn clear(&mut self) {
        self.teardown();
        self.log.clear();
        self.emit(SessionEvent::LogReset { len: 0 });
    }

    // -- patch application ------------------------------------------------

    /// Classify and apply one patch.
    ///
    /// Side-channel actions are applied even when the primary action is
    /// rejected; the rejection is then returned.
    pub fn apply_patch(&mut self, patch: Patch) -> Result<()> {
        let classified = classify(patch, &self.log);
        for action in classified.side_effects {
            self.apply(action)?;
        }
        self.apply(classified.primary?)
    }

    pub fn apply(&mut self, action: Action) -> Result<()> {
        match action {
            Action::UpdateExternalSnapshot(data) => {
                self.snapshots.apply_snapshot(data);
                self.emit(SessionEvent::SnapshotUpdated);
            }
            Action::SetActiveSpeaker(speaker) => self.set_speaker(Some(speaker)),
            Action::ClearActiveSpeaker => self.set_speaker(None),
            Action::Rollback(id) => {
                if let Some(removed) = self.log.truncate_after(&id) {
                    info!(id = %id, removed, "rolled back");
                    self.emit(SessionEvent::RolledBack { target: id, removed });
                }
            }
            Action::BroadcastUpdate(patch) => {
                for id in self.log.apply_to_all_generating(&patch) {
                    self.emit(SessionEvent::MessageUpdated(id));
                }
            }
            Action::CreateMessage(patch) => {
                self.log.create_from_patch(&patch)?;
                if let Some(id) = patch.message_id {
                    self.emit(SessionEvent::MessageCreated(id));
                }
            }
            Action::UpdateMessage(id, patch) => {
                if self.resync.as_deref() == Some(id.as_str()) {
                    self.resync = None;
                    self.log.reset_text(&id);
                    debug!(id = %id, "continuation replays full text");
                }
                if self.log.apply_to_message(&id, &patch) {
                    self.emit(SessionEvent::MessageUpdated(id));
                }
            }
        }
        Ok(())
    }

    // -- internals --------------------------------------------------------

    fn ensure_idle(&self, what: &'static str) -> Result<()> {
        if self.active.is_some() || self.hydrating {
            warn!(operation = what, state = ?self.state(), "rejected while busy");
            return Err(SyncError::StreamBusy(what));
        }
        Ok(())
    }

    fn open(&mut self, stream: ByteStream, origin: StreamOrigin) {
        self.active = Some(ActiveStream {
            events: EventStream::new(stream),
            origin,
            applied: 0,
            dropped: 0,
        });
        self.emit(SessionEvent::StreamOpened(origin));
    }

    fn ingest(&mut self, data: Value) {
        let result = Patch::from_value(data)
            .map_err(|e| SyncError::protocol(format!("undecodable patch: {e}")))
            .and_then(|patch| self.apply_patch(patch));
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match result {
            Ok(()) => active.applied += 1,
            Err(e) if e.is_per_event() => {
                warn!(error = %e, "patch dropped");
                active.dropped += 1;
            }
            Err(e) => {
                error!(error = %e, "patch failed outside the event itself; dropped");
                active.dropped += 1;
            }
        }
    }

    fn close_active(&mut self, reason: EndReason) -> Option<StreamOutcome> {
        let mut active = self.active.take()?;
        active.events.close();
        for id in self.log.settle_generating() {
            self.emit(SessionEvent::MessageUpdated(id));
        }
        self.resync = None;
        self.set_speaker(None);
        info!(
            origin = ?active.origin,
            reason = ?reason,
            applied = active.applied,
            dropped = active.dropped,
            "stream ended"
        );
        self.emit(SessionEvent::StreamEnded(reason.clone()));
        Some(StreamOutcome {
            origin: active.origin,
            reason,
            applied: active.applied,
            dropped: active.dropped,
        })
    }

    fn set_speaker(&mut self, speaker: Option<Speaker>) {
        if self.speaker != speaker {
            self.speaker = speaker.clone();
            self.emit(SessionEvent::SpeakerChanged(speaker));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event);
        }
    }
}
