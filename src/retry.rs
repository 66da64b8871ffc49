//! Exponential backoff for caller-side retries.
//!
//! The session never retries on its own. Callers that want to retry a failed
//! history fetch or stream open pair [`Backoff`] with
//! [`SyncError::is_retryable`](crate::error::SyncError::is_retryable).

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::backend::Backend;
use crate::error::Result;
use crate::session::{ConversationSession, HydrateOutcome, LogView};

pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delays of `base * 2^n` plus up to 25% random jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    jitter: bool,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(DEFAULT_BASE, DEFAULT_MAX_ATTEMPTS)
    }
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            max_attempts,
            jitter: true,
            attempt: 0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let mut delay = self.base.saturating_mul(factor);
        if self.jitter {
            let quarter = delay.as_millis() as u64 / 4;
            if quarter > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=quarter));
            }
        }
        self.attempt += 1;
        Some(delay)
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Hydrate `session` if it has not been, retrying failed history fetches
/// that are retryable.
///
/// Only the fetch is retried. Once history has been loaded, a failure of
/// the continuation stream is returned as is.
pub async fn hydrate_with_retry<B: Backend>(
    session: &mut ConversationSession<B>,
    backoff: &mut Backoff,
) -> Result<Option<HydrateOutcome>> {
    backoff.reset();
    loop {
        match session.ensure_hydrated().await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && session.view() == LogView::Pending => {
                match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %e, attempt = backoff.attempts(), ?delay, "history fetch failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}
