//! Request Registry: the one piece of shared mutable state within a session.
//!
//! Maps a message id in flight to a cancellation handle. Serialized behind a
//! plain `std::sync::Mutex` — critical sections are a handful of hashmap
//! operations, never an `.await`, so there is no reason to reach for
//! `tokio::sync::Mutex` here (same reasoning the teacher applies to `Db`'s
//! `RwLock`).

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Per-connection map `{message id -> cancellation handle}`.
///
/// Only the Dispatch loop and `ProcessRequest` insert; Abandon handling, the
/// close protocol, and `ProcessRequest`'s own completion remove. Firing a
/// handle more than once (Abandon racing the close protocol) is safe:
/// `CancellationToken::cancel` is idempotent.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    inflight: Mutex<HashMap<i32, CancellationToken>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Register `message_id` as in flight and return the token its handler
    /// should observe for cancellation.
    pub(crate) fn register(&self, message_id: i32) -> CancellationToken {
        let token = CancellationToken::new();
        self.inflight
            .lock()
            .unwrap()
            .insert(message_id, token.clone());
        token
    }

    /// Remove `message_id` from the registry once its handler has returned.
    pub(crate) fn deregister(&self, message_id: i32) {
        self.inflight.lock().unwrap().remove(&message_id);
    }

    /// Abandon the handler registered for `message_id`, if any.
    ///
    /// Returns `true` if a handler was found and cancelled. If an Abandon
    /// arrives before its target has registered, there is nothing to cancel
    /// and the signal is lost — this is the documented best-effort semantics
    /// of RFC 4511 §4.11.
    pub(crate) fn abandon(&self, message_id: i32) -> bool {
        match self.inflight.lock().unwrap().remove(&message_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every handler currently registered and clear the registry.
    /// Used by the close protocol (§4.2 step c).
    pub(crate) fn cancel_all(&self) {
        let mut inflight = self.inflight.lock().unwrap();
        for (_, token) in inflight.drain() {
            token.cancel();
        }
    }
}
