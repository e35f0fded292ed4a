//! Split read/write halves of an accepted connection.
//!
//! Unlike the teacher's single `Connection<S>` (which only ever reads then
//! writes within one task), a `Session` here runs its Frame Reader and its
//! Writer Task as two concurrently-scheduled tasks, so the socket is split
//! into independent halves up front. `tokio::io::split` (rather than
//! `TcpStream::into_split`) is used so the split works over any
//! `AsyncRead + AsyncWrite` stream, including the mock streams used in
//! tests.

use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::error::{Error, FrameError, Result};
use crate::frame::{self, Scan};
use crate::proto::{self, LdapMsg};

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// A type usable as the byte stream backing a `Session`.
pub trait ConnectionStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ConnectionStream for T {}

/// Split `stream` into its Frame Reader half and its Writer Task half.
pub(crate) fn split<S: ConnectionStream>(
    stream: S,
) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
    let (r, w) = tokio::io::split(stream);
    (
        MessageReader {
            stream: r,
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
        },
        MessageWriter {
            stream: BufWriter::new(w),
        },
    )
}

/// Owned by the Dispatch loop's task. Exclusively reads the socket.
pub(crate) struct MessageReader<R> {
    stream: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Read a single LDAP message from the stream.
    ///
    /// Waits until a complete length-delimited message has been buffered, or
    /// until `wake` is notified (used by the Shutdown-Watch Task and the
    /// close protocol to force a blocked read to return), or until
    /// `timeout`, if set, elapses. Any of the latter two surface as
    /// `Error::Framing(FrameError::DeadlineExceeded)`.
    ///
    /// Returns `Ok(None)` on a clean EOF between messages.
    pub(crate) async fn read_message(
        &mut self,
        timeout: Option<Duration>,
        wake: &Notify,
    ) -> Result<Option<LdapMsg>> {
        loop {
            match frame::scan(&self.buffer)? {
                Scan::Complete(len) => {
                    let bytes = self.buffer.split_to(len).freeze();
                    let msg = proto::decode_message(bytes)?;
                    debug!(msgid = msg.msgid, "message received");
                    return Ok(Some(msg));
                }
                Scan::Incomplete => {}
            }

            let read = self.fill_buf(timeout, wake).await?;
            if read == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                } else {
                    error!("connection closed mid message");
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection closed mid message",
                    )));
                }
            }
        }
    }

    async fn fill_buf(&mut self, timeout: Option<Duration>, wake: &Notify) -> Result<usize> {
        let read_fut = self.stream.read_buf(&mut self.buffer);
        match timeout {
            Some(d) => {
                tokio::select! {
                    res = tokio::time::timeout(d, read_fut) => {
                        res.map_err(|_| Error::Framing(FrameError::DeadlineExceeded))?
                            .map_err(Error::from)
                    }
                    _ = wake.notified() => Err(Error::Framing(FrameError::DeadlineExceeded)),
                }
            }
            None => {
                tokio::select! {
                    res = read_fut => res.map_err(Error::from),
                    _ = wake.notified() => Err(Error::Framing(FrameError::DeadlineExceeded)),
                }
            }
        }
    }
}

/// Owned by the Writer Task. Exclusively writes the socket.
pub(crate) struct MessageWriter<W> {
    stream: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Encode and write one message, then flush.
    ///
    /// Per the open question in the design notes, an encoding failure is
    /// logged and the message dropped rather than tearing down the whole
    /// session — the client that issued that one request simply never gets
    /// a response.
    pub(crate) async fn write_message(&mut self, msg: LdapMsg) -> Result<()> {
        let msgid = msg.msgid;
        let bytes = match proto::encode_message(msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(msgid, %err, "dropping response: failed to encode");
                return Ok(());
            }
        };
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Wraps a debug-sink callback so it can be cloned into every task of a
/// session without forcing the embedder's closure to be `Clone`.
pub(crate) type DebugSink = Arc<dyn Fn(String) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_message_returns_none_on_clean_eof() {
        let stream = tokio_test::io::Builder::new().build();
        let (mut reader, _writer) = split(stream);
        let wake = Notify::new();

        let result = reader.read_message(None, &wake).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_message_errors_on_eof_mid_message() {
        // A SEQUENCE claiming a 5-byte body, but the stream ends after 1.
        let stream = tokio_test::io::Builder::new().read(&[0x30, 0x05, 0x01]).build();
        let (mut reader, _writer) = split(stream);
        let wake = Notify::new();

        let result = reader.read_message(None, &wake).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn notify_unblocks_a_read_with_no_data_pending() {
        // The mock stream never produces data and never reaches EOF, so the
        // only way `read_message` can return is via the `wake` signal.
        let stream = tokio_test::io::Builder::new().wait(Duration::from_secs(3600)).build();
        let (mut reader, _writer) = split(stream);
        let wake = Arc::new(Notify::new());

        let wake_for_task = wake.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            wake_for_task.notify_one();
        });

        let result = reader.read_message(None, &wake).await;
        assert!(matches!(result, Err(Error::Framing(FrameError::DeadlineExceeded))));
    }
}
