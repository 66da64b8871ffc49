//! Client-side synchronization for a streaming research-assistant
//! conversation.
//!
//! The backend pushes incremental patches over a Server-Sent Events response.
//! This crate frames that byte stream ([`frame`]), classifies each patch into
//! an action ([`interpret`]), applies it to an ordered, id-keyed message log
//! ([`message_log`]) and keeps the log consistent across hydration,
//! continuation of interrupted messages, stop and rollback ([`session`]).
//!
//! ```no_run
//! use resviz_sync::{Config, ConversationSession, HttpBackend, SendRequest};
//!
//! # async fn demo() -> resviz_sync::Result<()> {
//! let config = Config::load(None)?;
//! let mut session = ConversationSession::new(HttpBackend::new(&config)?);
//! session.ensure_hydrated().await?;
//! let outcome = session
//!     .send_message(SendRequest {
//!         content: "Summarise recent work on sparse attention".into(),
//!         title: config.default_title.clone(),
//!         agent_name: config.agent_name.clone(),
//!         other_params: None,
//!     })
//!     .await?;
//! println!("{:?}: {} messages", outcome.reason, session.log().len());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod interpret;
pub mod message_log;
pub mod patch;
pub mod render;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod wire;

pub use backend::{Backend, ByteStream, HttpBackend};
pub use config::Config;
pub use error::{Result, SyncError};
pub use message_log::{Message, MessageLog, MessageStatus};
pub use patch::{Patch, Role, Speaker, BROADCAST_ID};
pub use session::{
    ConversationSession, EndReason, HydrateOutcome, LogView, SessionEvent, SessionState,
    StopHandle, StreamOrigin, StreamOutcome,
};
pub use snapshot::{SnapshotStore, TreeSnapshot};
pub use wire::{RollbackResponse, SendRequest, StopResponse};
