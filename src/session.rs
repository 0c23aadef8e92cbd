//! Session counter and cancellation scope for one scheduler.
//!
//! Every asynchronous continuation captures the session it was issued under
//! and compares it with [`SessionController::current`] before touching shared
//! state. A reset bumps the session first, so stale completions observe the
//! change before any state is cleared.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cancel::CancelToken;

/// Owns the session counter and the per-session cancel token.
///
/// This is the only place tokens are created or cancelled.
#[derive(Debug, Default)]
pub struct SessionController {
    session: AtomicU64,
    token: Mutex<Option<CancelToken>>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current session value.
    pub fn current(&self) -> u64 {
        self.session.load(Ordering::Acquire)
    }

    /// Whether work issued under `session` may still mutate state.
    pub fn is_current(&self, session: u64) -> bool {
        self.current() == session
    }

    /// Invalidate the session: bump the counter, then cancel and drop the token.
    ///
    /// Returns the new session value.
    pub fn reset(&self) -> u64 {
        let next = self.session.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        next
    }

    /// Token for the current session, created on first use.
    pub fn token(&self) -> CancelToken {
        let mut guard = self.token.lock();
        guard.get_or_insert_with(CancelToken::new).clone()
    }

    /// Whether a live token exists right now.
    #[cfg(test)]
    pub(crate) fn has_token(&self) -> bool {
        self.token.lock().is_some()
    }
}
