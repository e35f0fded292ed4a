//! The Dispatch loop, the Writer Task, and the per-session close protocol
//! (§4.2). This is where the Frame Reader, the Outbound Queue, the Request
//! Registry, the Shutdown-Watch Task and per-request handler tasks are all
//! wired together for one accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::connection::{self, ConnectionStream, DebugSink, MessageReader, MessageWriter};
use crate::error::Result;
use crate::handler::{Context, Handler, Message};
use crate::outbound::{self, OutboundReceiver, OutboundSender, ResponseWriter};
use crate::proto::{self, LdapMsg, LdapOp};
use crate::registry::Registry;
use crate::shutdown::{self, Shutdown};

/// One accepted connection, owning its Frame Reader and orchestrating the
/// Writer Task, the Shutdown-Watch Task, and one task per in-flight request.
pub(crate) struct Session<S: ConnectionStream> {
    id: u64,
    peer: SocketAddr,
    reader: MessageReader<tokio::io::ReadHalf<S>>,
    handler: Arc<dyn Handler>,
    registry: Arc<Registry>,
    outbound_tx: OutboundSender,
    read_wake: Arc<Notify>,
    closing: CancellationToken,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    debug_sink: Option<DebugSink>,
    notify_shutdown: broadcast::Receiver<()>,
    handler_done_tx: mpsc::Sender<()>,
    handler_done_rx: mpsc::Receiver<()>,

    // Kept only between `new` and `run`, where it's handed to the spawned
    // Writer Task.
    writer: Option<MessageWriter<tokio::io::WriteHalf<S>>>,
    outbound_rx: Option<OutboundReceiver>,
}

/// Slots used to signal completion between a session and its two permanent
/// background tasks.
const HANDLER_DONE_CHANNEL_CAPACITY: usize = 1;

impl<S: ConnectionStream> Session<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        peer: SocketAddr,
        stream: S,
        handler: Arc<dyn Handler>,
        notify_shutdown: broadcast::Receiver<()>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        debug_sink: Option<DebugSink>,
    ) -> Self {
        let (reader, writer) = connection::split(stream);
        let (outbound_tx, outbound_rx) = outbound::channel();
        let (handler_done_tx, handler_done_rx) = mpsc::channel(HANDLER_DONE_CHANNEL_CAPACITY);

        Session {
            id,
            peer,
            reader,
            handler,
            registry: Arc::new(Registry::new()),
            outbound_tx,
            read_wake: Arc::new(Notify::new()),
            closing: CancellationToken::new(),
            read_timeout,
            write_timeout,
            debug_sink,
            notify_shutdown,
            handler_done_tx,
            handler_done_rx,
            writer: Some(writer),
            outbound_rx: Some(outbound_rx),
        }
    }

    fn log(&self, line: String) {
        if let Some(sink) = &self.debug_sink {
            sink(line);
        }
    }

    /// Drive this session to completion: spawn its background tasks, run the
    /// Dispatch loop until the connection ends, then run the close protocol.
    #[instrument(skip_all, fields(connection_id = self.id, peer = %self.peer))]
    pub(crate) async fn run(mut self) {
        debug!("session started");
        self.log(format!("session {} started from {}", self.id, self.peer));

        let writer = self.writer.take().expect("writer present until run()");
        let outbound_rx = self
            .outbound_rx
            .take()
            .expect("outbound receiver present until run()");
        let (write_complete_tx, write_complete_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(writer_task(writer, outbound_rx, self.write_timeout, write_complete_tx));

        let watch_permit = self.handler_done_tx.clone();
        tokio::spawn(shutdown::watch(
            Shutdown::new(self.notify_shutdown.resubscribe()),
            self.closing.clone(),
            self.outbound_tx.clone(),
            self.read_wake.clone(),
            watch_permit,
        ));

        self.dispatch_loop().await;
        self.close(write_complete_rx).await;

        debug!("session closed");
        self.log(format!("session {} closed", self.id));
    }

    async fn dispatch_loop(&mut self) {
        loop {
            let outcome = self
                .reader
                .read_message(self.read_timeout, &self.read_wake)
                .await;

            let msg = match outcome {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    debug!("peer closed connection");
                    return;
                }
                Err(err) if err.is_self_induced_timeout() => {
                    debug!("read unblocked by shutdown or deadline, ending dispatch loop");
                    return;
                }
                Err(err) => {
                    warn!(%err, "framing error, ending session");
                    return;
                }
            };

            if !self.handle_message(msg).await {
                return;
            }
        }
    }

    /// Dispatch one decoded message. Returns `false` if the Dispatch loop
    /// should stop reading further messages (Unbind).
    async fn handle_message(&mut self, msg: LdapMsg) -> bool {
        let msgid = msg.msgid;

        match msg.op {
            LdapOp::UnbindRequest => {
                debug!("unbind received");
                false
            }
            LdapOp::AbandonRequest(target) => {
                if !self.registry.abandon(target) {
                    debug!(target, "abandon target not found (already completed or unknown)");
                }
                true
            }
            op if proto::is_start_tls(&op) => {
                // StartTLS must be processed inline: RFC 4511 §4.14.2
                // requires no further requests be read until its response has
                // been written, so it cannot race other concurrently
                // dispatched requests the way ordinary operations do.
                let permit = self.handler_done_tx.clone();
                process_request(
                    self.id,
                    self.registry.clone(),
                    self.handler.clone(),
                    self.outbound_tx.clone(),
                    msgid,
                    op,
                )
                .await;
                drop(permit);
                true
            }
            op => {
                let connection_id = self.id;
                let registry = self.registry.clone();
                let handler = self.handler.clone();
                let outbound = self.outbound_tx.clone();
                let permit = self.handler_done_tx.clone();

                let join = tokio::spawn(async move {
                    process_request(connection_id, registry, handler, outbound, msgid, op).await;
                    drop(permit);
                });
                // A handler panic unwinds only its own task; `permit`,
                // captured into that task's frame, is dropped along with
                // it during unwinding, so the join counter still accounts
                // for it correctly. This side task exists only to log the
                // panic.
                tokio::spawn(async move {
                    if let Err(err) = join.await {
                        if err.is_panic() {
                            error!(msgid, "request handler panicked");
                        }
                    }
                });
                true
            }
        }
    }

    /// The close protocol (§4.2 steps a-h).
    async fn close(mut self, write_complete_rx: tokio::sync::oneshot::Receiver<()>) {
        // (a) Emit the session-local closing signal.
        self.closing.cancel();
        // (b) Force the Frame Reader's blocked read to return, if any.
        self.read_wake.notify_one();
        // (c) Cancel and clear every handler still registered.
        self.registry.cancel_all();
        // (d) Wait for every handler task (and the Shutdown-Watch Task) to
        // finish. Dropping our own sender lets the channel close once every
        // clone handed out to a spawned task is also dropped.
        drop(self.handler_done_tx);
        let _ = self.handler_done_rx.recv().await;
        // (e) Close the Outbound Queue: by now every task that could still
        // hold a clone of `outbound_tx` has exited, so dropping this one
        // closes the channel and lets the Writer Task's loop end.
        drop(self.outbound_tx);
        // (f) Wait for the Writer Task to flush and signal completion.
        let _ = write_complete_rx.await;
        // (g) The socket closes once `self.reader` (this session's last
        // remaining half) drops at the end of this function — the Writer
        // Task already dropped its half on the way out of `writer_task`.
        // (h) The server's join counter entry for this connection is
        // released by the caller of `run`, once this function returns.
    }
}

async fn process_request(
    connection_id: u64,
    registry: Arc<Registry>,
    handler: Arc<dyn Handler>,
    outbound: OutboundSender,
    msgid: i32,
    op: LdapOp,
) {
    let response = ResponseWriter::new(msgid, outbound);
    let cancel = registry.register(msgid);
    let ctx = Context::new(connection_id, msgid, cancel);
    let message = Message::new(msgid, op);

    handler.serve(ctx, response, message).await;

    registry.deregister(msgid);
}

/// The Writer Task: the Outbound Queue's sole consumer. Exits once the queue
/// closes (the close protocol's step e) or a write fails outright.
async fn writer_task<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: MessageWriter<W>,
    mut outbound_rx: OutboundReceiver,
    write_timeout: Option<Duration>,
    complete_tx: tokio::sync::oneshot::Sender<()>,
) {
    while let Some(msg) = outbound_rx.recv().await {
        let result: Result<()> = match write_timeout {
            Some(d) => match tokio::time::timeout(d, writer.write_message(msg)).await {
                Ok(res) => res,
                Err(_) => {
                    error!("writer task: write deadline exceeded");
                    break;
                }
            },
            None => writer.write_message(msg).await,
        };

        if let Err(err) = result {
            error!(%err, "writer task: write failed, ending session writer");
            break;
        }
    }

    let _ = complete_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldap3_proto::LdapOp;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn peer() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4444))
    }

    fn new_session(stream: tokio_test::io::Mock) -> Session<tokio_test::io::Mock> {
        let (_notify_shutdown_tx, notify_shutdown_rx) = broadcast::channel(1);
        Session::new(
            1,
            peer(),
            stream,
            Arc::new(NoopHandler),
            notify_shutdown_rx,
            None,
            None,
            None,
        )
    }

    struct NoopHandler;

    #[async_trait::async_trait]
    impl Handler for NoopHandler {
        async fn serve(&self, _ctx: Context, _response: ResponseWriter, _message: Message) {}
    }

    #[tokio::test]
    async fn process_request_registers_then_deregisters() {
        let registry = Arc::new(Registry::new());
        let (outbound_tx, _outbound_rx) = outbound::channel();

        process_request(
            1,
            registry.clone(),
            Arc::new(NoopHandler),
            outbound_tx,
            7,
            LdapOp::UnbindRequest,
        )
        .await;

        // Nothing left registered for id 7: a second abandon finds nothing.
        assert!(!registry.abandon(7));
    }

    #[tokio::test]
    async fn unbind_ends_dispatch_loop() {
        let stream = tokio_test::io::Builder::new().build();
        let mut session = new_session(stream);
        let proceed = session.handle_message(LdapMsg::new(3, LdapOp::UnbindRequest)).await;
        assert!(!proceed);
    }

    #[tokio::test]
    async fn abandon_of_unknown_id_does_not_stop_dispatch_loop() {
        let stream = tokio_test::io::Builder::new().build();
        let mut session = new_session(stream);
        let proceed = session
            .handle_message(LdapMsg::new(9, LdapOp::AbandonRequest(404)))
            .await;
        assert!(proceed);
    }

    #[tokio::test]
    async fn close_cancels_every_registered_handler() {
        let stream = tokio_test::io::Builder::new().build();
        let session = new_session(stream);
        let token_a = session.registry.register(1);
        let token_b = session.registry.register(2);

        // Dropping the sender immediately makes step (f)'s await resolve
        // right away instead of hanging for a value nothing will send.
        let (complete_tx, complete_rx) = tokio::sync::oneshot::channel();
        drop(complete_tx);

        session.close(complete_rx).await;

        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }

    #[tokio::test]
    async fn handler_panic_does_not_leave_a_stale_join_counter_permit() {
        struct PanicHandler;

        #[async_trait::async_trait]
        impl Handler for PanicHandler {
            async fn serve(&self, _ctx: Context, _response: ResponseWriter, _message: Message) {
                panic!("handler bug, not a framework bug");
            }
        }

        let stream = tokio_test::io::Builder::new().build();
        let mut session = new_session(stream);
        session.handler = Arc::new(PanicHandler);

        // Any op other than Abandon/Unbind/StartTLS takes the spawned path.
        let generic_request = LdapOp::ExtendedRequest(ldap3_proto::LdapExtendedRequest {
            name: "1.2.3.4.5".to_string(),
            value: None,
        });
        let proceed = session
            .handle_message(LdapMsg::new(2, generic_request))
            .await;
        assert!(proceed);

        // Drop our own clone of the sender; the only other clone lives
        // inside the spawned task's frame and is dropped when that task
        // unwinds from the panic, so `recv` below resolves to `None`
        // instead of hanging forever.
        let handler_done_tx = std::mem::replace(&mut session.handler_done_tx, {
            let (tx, _rx) = mpsc::channel(1);
            tx
        });
        drop(handler_done_tx);
        assert_eq!(session.handler_done_rx.recv().await, None);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn handler_panic_is_logged() {
        struct PanicHandler;

        #[async_trait::async_trait]
        impl Handler for PanicHandler {
            async fn serve(&self, _ctx: Context, _response: ResponseWriter, _message: Message) {
                panic!("handler bug, not a framework bug");
            }
        }

        let stream = tokio_test::io::Builder::new().build();
        let mut session = new_session(stream);
        session.handler = Arc::new(PanicHandler);

        let generic_request = LdapOp::ExtendedRequest(ldap3_proto::LdapExtendedRequest {
            name: "1.2.3.4.5".to_string(),
            value: None,
        });
        session.handle_message(LdapMsg::new(6, generic_request)).await;

        // The logging task is spawned alongside the handler task and only
        // runs after the panicking task unwinds; give the scheduler a few
        // turns to get to it before asserting on its output.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(tracing_test::logs_contain("request handler panicked"));
    }
}
