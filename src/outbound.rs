//! Outbound Queue and Response Writer.
//!
//! The queue is the one channel every producer in a session (request
//! handlers, the StartTLS inline path, and the Shutdown-Watch Task) writes
//! onto; the Writer Task is its sole consumer. Closing it is how the close
//! protocol tells the Writer Task there will be no more work.

use tokio::sync::mpsc;

use crate::proto::LdapMsg;

/// Bound suggested by the teacher's own notes on backpressure; an unbounded
/// queue would also satisfy the spec, but a small bound keeps a runaway
/// handler from piling up unbounded memory against a slow reader.
const OUTBOUND_QUEUE_CAPACITY: usize = 20;

/// Sending half of the Outbound Queue, held by the Writer Task's `Session`.
pub(crate) fn channel() -> (OutboundSender, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    (OutboundSender(tx), OutboundReceiver(rx))
}

#[derive(Debug, Clone)]
pub(crate) struct OutboundSender(mpsc::Sender<LdapMsg>);

pub(crate) struct OutboundReceiver(mpsc::Receiver<LdapMsg>);

impl OutboundSender {
    /// Enqueue a fully addressed message. Returns `Err` if the queue has
    /// already been closed by the close protocol — callers that hit this
    /// after observing cancellation have a bug, but the error is recoverable
    /// rather than a panic since cancellation and close race by design.
    pub(crate) async fn send(&self, msg: LdapMsg) -> Result<(), SendAfterCloseError> {
        self.0.send(msg).await.map_err(|_| SendAfterCloseError)
    }
}

impl OutboundReceiver {
    pub(crate) async fn recv(&mut self) -> Option<LdapMsg> {
        self.0.recv().await
    }
}

#[derive(Debug)]
pub(crate) struct SendAfterCloseError;

/// Capability handed to a `Handler`: stamps a message id onto a protocol op
/// and enqueues it. Writing after the session has begun closing is swallowed
/// — correctly written handlers observe cancellation and return before that
/// can happen (see §7 "Protocol misuse by handler").
#[derive(Clone)]
pub struct ResponseWriter {
    message_id: i32,
    outbound: OutboundSender,
}

impl ResponseWriter {
    pub(crate) fn new(message_id: i32, outbound: OutboundSender) -> Self {
        ResponseWriter {
            message_id,
            outbound,
        }
    }

    /// The message id every response written through this handle is stamped
    /// with.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Wrap `op` as an LDAP message addressed to this writer's message id
    /// and enqueue it on the Outbound Queue.
    ///
    /// A handler may call this any number of times (e.g. one
    /// `SearchResultEntry` per matching entry, followed by one
    /// `SearchResultDone`).
    pub async fn write(&self, op: crate::proto::LdapOp) {
        let msg = LdapMsg::new(self.message_id, op);
        if self.outbound.send(msg).await.is_err() {
            tracing::debug!(
                message_id = self.message_id,
                "response dropped: outbound queue already closed"
            );
        }
    }
}

impl std::fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("message_id", &self.message_id)
            .finish()
    }
}
