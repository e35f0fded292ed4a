//! A simple "wait until every registered unit of work has finished" counter.
//!
//! Used for the **Server**'s join counter (§3 Data model, invariant I4),
//! which must survive across many concurrent `serve()` calls and an
//! independent `shutdown()` caller holding its own clone of `Server` — unlike
//! the Session-level handler join counter (see `session.rs`), there is no
//! single owner who can drop a "master" channel sender to signal completion,
//! so a plain atomic counter plus a `Notify` is used instead.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub(crate) struct JoinCounter {
    count: AtomicU64,
    zero: Notify,
}

impl JoinCounter {
    pub(crate) fn new() -> Self {
        JoinCounter {
            count: AtomicU64::new(0),
            zero: Notify::new(),
        }
    }

    pub(crate) fn inc(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.zero.notify_waiters();
        }
    }

    /// Waits until the counter reaches zero. Safe to call concurrently with
    /// `inc`/`dec`, though callers of `Server::shutdown` only do so after
    /// guaranteeing no further `inc` will happen (listeners are closed and
    /// the shutdown signal is sent first).
    ///
    /// The `Notified` future is constructed before the count is checked, not
    /// after — `notify_waiters` only wakes `Notified` futures that already
    /// exist at the moment it's called, so checking first and subscribing
    /// second could miss the final `dec`'s notification and wait forever.
    pub(crate) async fn wait_zero(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_zero_returns_immediately_when_never_incremented() {
        let counter = JoinCounter::new();
        counter.wait_zero().await;
    }

    #[tokio::test]
    async fn wait_zero_blocks_until_every_inc_is_matched_by_dec() {
        let counter = Arc::new(JoinCounter::new());
        counter.inc();
        counter.inc();

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move {
                counter.wait_zero().await;
            })
        };

        tokio::task::yield_now().await;
        counter.dec();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        counter.dec();
        waiter.await.unwrap();
    }
}
