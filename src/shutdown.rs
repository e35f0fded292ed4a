//! Server-wide shutdown signal, and the per-session task that reacts to it.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::outbound::OutboundSender;
use crate::proto;

/// Listens for the server shutdown signal.
///
/// Shutdown is signalled using a broadcast `Receiver`. Only a single value is
/// ever sent. Once a value has been sent, every session should begin closing.
///
/// `Shutdown` tracks whether the signal has already been observed so a
/// caller that checks more than once (e.g. a loop re-entering `recv`) doesn't
/// block on a channel that will never produce another value.
#[derive(Debug)]
pub(crate) struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // Only one value is ever sent on this channel, so a lag error can
        // never occur here.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}

/// The Shutdown-Watch Task (§4.2).
///
/// Spawned once per session alongside the Dispatch loop and the Writer Task.
/// Races the server-wide shutdown signal against the session's own
/// closing-signal: whichever a session reaches its terminal state through
/// first, and it exits without doing anything further.
///
/// On the shutdown branch, it enqueues the unsolicited Notice of
/// Disconnection and forces the Frame Reader's blocked read to return, so a
/// session idling on a read that will never complete still notices the
/// server wants to stop.
///
/// `_handler_permit` is held for the task's whole lifetime purely so the
/// session's handler join counter (§3 invariant I1, the mpsc-close pattern
/// used by `Session::close`) accounts for this task the same way it accounts
/// for a spawned request handler — it has nothing to do with handling a
/// request.
pub(crate) async fn watch(
    mut shutdown: Shutdown,
    closing: CancellationToken,
    outbound: OutboundSender,
    read_wake: Arc<Notify>,
    _handler_permit: mpsc::Sender<()>,
) {
    tokio::select! {
        _ = shutdown.recv() => {
            let msg = proto::notice_of_disconnection();
            if outbound.send(msg).await.is_err() {
                debug!("shutdown-watch: outbound queue already closed, dropping notice of disconnection");
            }
            read_wake.notify_one();
        }
        _ = closing.cancelled() => {
            // The session is already closing through another path (Unbind,
            // EOF, a framing error) — nothing to do.
        }
    }
}
