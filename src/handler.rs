//! The embedder-facing capability surface: `Handler`, `Context`, `Message`.
//!
//! None of this is protocol logic — it is the seam the Dispatch loop calls
//! through. A real directory implementation plugs in by implementing
//! `Handler`; this crate never inspects what a handler does with a request
//! beyond watching its cancellation token and forwarding whatever it writes.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::outbound::ResponseWriter;
use crate::proto::LdapOp;

/// One decoded request, handed to `Handler::serve`.
#[derive(Debug, Clone)]
pub struct Message {
    msgid: i32,
    op: LdapOp,
}

impl Message {
    pub(crate) fn new(msgid: i32, op: LdapOp) -> Self {
        Message { msgid, op }
    }

    /// The message id the client chose for this request.
    pub fn id(&self) -> i32 {
        self.msgid
    }

    /// The decoded operation. Match on this to get a typed view for any LDAP
    /// op kind (Bind, Search, Add, Modify, Delete, Compare, Extended,
    /// Abandon, Unbind).
    pub fn op(&self) -> &LdapOp {
        &self.op
    }
}

/// Cancellation and identity handed to a `Handler` alongside its `Message`.
///
/// `Context` carries no back-reference to the owning `Session` — only the
/// cancellation signal and the connection ordinal, kept here as a
/// convenience for log correlation. A handler that wants to respond uses the
/// `ResponseWriter` passed alongside it, not anything reachable from
/// `Context`.
#[derive(Clone)]
pub struct Context {
    connection_id: u64,
    message_id: i32,
    cancel: CancellationToken,
}

impl Context {
    pub(crate) fn new(connection_id: u64, message_id: i32, cancel: CancellationToken) -> Self {
        Context {
            connection_id,
            message_id,
            cancel,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// `true` if this request has already been cancelled (Abandon or
    /// session close).
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this request is cancelled. A handler doing long-running
    /// or streaming work (e.g. a slow Search) should race this against its
    /// own work in a `tokio::select!` and return promptly once it resolves.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// The pluggable request router supplied by the embedder.
///
/// One `Handler` instance is produced per accepted connection by the
/// connection-construction callback configured on `Server`; `Session` calls
/// `serve` once per non-Abandon, non-Unbind request, concurrently for every
/// request still in flight.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handle one request. `response` may be written to any number of times
    /// before returning (e.g. many `SearchResultEntry` writes followed by a
    /// `SearchResultDone`). Returning does not itself send anything — a
    /// handler that wants the client to see a result must write it.
    ///
    /// Implementations must poll `ctx.cancelled()` for any work that can
    /// take a while; the core guarantees that signal fires on Abandon of
    /// this message id and on session close, but cannot force a handler that
    /// ignores it to stop — it will only delay `Server::shutdown`.
    async fn serve(&self, ctx: Context, response: ResponseWriter, message: Message);
}

/// Produces a `Handler` for a freshly accepted connection, or `None` to
/// decline the connection (in which case the core closes the socket
/// immediately without error).
pub trait HandlerFactory: Send + Sync + 'static {
    fn make_handler(&self, peer: std::net::SocketAddr) -> Option<std::sync::Arc<dyn Handler>>;
}

impl<F> HandlerFactory for F
where
    F: Fn(std::net::SocketAddr) -> Option<std::sync::Arc<dyn Handler>> + Send + Sync + 'static,
{
    fn make_handler(&self, peer: std::net::SocketAddr) -> Option<std::sync::Arc<dyn Handler>> {
        self(peer)
    }
}
