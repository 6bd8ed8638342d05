//! Byte streams with independent read/write cancellation.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::error::Error;
use crate::signal::AbortSignal;

/// Object-safe alias for the transports a stream can wrap.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxIo = Box<dyn Io>;

/// A bidirectional byte channel supporting independent cancellation of
/// pending reads and writes, and per-direction inactivity timeouts.
///
/// Reads and writes go through split halves so a connection can write
/// a pipelined request while an earlier response is still being read.
/// Cancelling a direction is sticky: the blocked task observes
/// [`Error::Aborted`], and so does every later operation.
pub struct Stream {
    read: Mutex<Option<ReadHalf<BoxIo>>>,
    write: Mutex<Option<WriteHalf<BoxIo>>>,
    read_abort: AbortSignal,
    write_abort: AbortSignal,
    receive_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
}

impl Stream {
    /// Wrap a transport with no timeouts.
    pub fn new(io: BoxIo) -> Self {
        Self::with_timeouts(io, None, None)
    }

    /// Wrap a transport, bounding individual reads and writes.
    pub fn with_timeouts(
        io: BoxIo,
        receive_timeout: Option<Duration>,
        send_timeout: Option<Duration>,
    ) -> Self {
        let (read, write) = tokio::io::split(io);
        Self {
            read: Mutex::new(Some(read)),
            write: Mutex::new(Some(write)),
            read_abort: AbortSignal::new(),
            write_abort: AbortSignal::new(),
            receive_timeout,
            send_timeout,
        }
    }

    /// Cancel any pending or future read.
    pub fn cancel_read(&self) {
        self.read_abort.abort();
    }

    /// Cancel any pending or future write.
    pub fn cancel_write(&self) {
        self.write_abort.abort();
    }

    /// Read more bytes into `buf`. Returns the number of bytes read;
    /// zero means the peer closed the stream.
    pub async fn read_buf(&self, buf: &mut BytesMut) -> Result<usize, Error> {
        if self.read_abort.is_aborted() {
            return Err(Error::Aborted);
        }
        let mut guard = self.read.lock().await;
        let half = guard.as_mut().ok_or_else(Error::closed)?;
        tokio::select! {
            _ = self.read_abort.aborted() => Err(Error::Aborted),
            res = timed(self.receive_timeout, half.read_buf(buf)) => res,
        }
    }

    /// Write `data` in full and flush.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), Error> {
        if self.write_abort.is_aborted() {
            return Err(Error::Aborted);
        }
        let mut guard = self.write.lock().await;
        let half = guard.as_mut().ok_or_else(Error::closed)?;
        tokio::select! {
            _ = self.write_abort.aborted() => Err(Error::Aborted),
            res = timed(self.send_timeout, async {
                half.write_all(data).await?;
                half.flush().await
            }) => res,
        }
    }

    /// Reunite the halves and return the raw transport, e.g. for a TLS
    /// layer to wrap. Fails if the transport has already been taken.
    pub(crate) fn into_io(self) -> Result<BoxIo, Error> {
        let read = self.read.into_inner().ok_or_else(Error::closed)?;
        let write = self.write.into_inner().ok_or_else(Error::closed)?;
        Ok(read.unsplit(write))
    }

    /// Take the transport out from a shared handle, leaving the stream
    /// unusable. Used when a CONNECT exchange upgrades to a tunnel.
    pub(crate) fn take_io(&self) -> Result<BoxIo, Error> {
        let mut read_guard = self.read.try_lock().map_err(|_| Error::closed())?;
        let mut write_guard = self.write.try_lock().map_err(|_| Error::closed())?;
        match (read_guard.take(), write_guard.take()) {
            (Some(read), Some(write)) => Ok(read.unsplit(write)),
            (read, write) => {
                *read_guard = read;
                *write_guard = write;
                Err(Error::closed())
            }
        }
    }

    pub(crate) fn timeouts(&self) -> (Option<Duration>, Option<Duration>) {
        (self.receive_timeout, self.send_timeout)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("cancelled_read", &self.read_abort.is_aborted())
            .field("cancelled_write", &self.write_abort.is_aborted())
            .field("receive_timeout", &self.receive_timeout)
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

async fn timed<T, F>(limit: Option<Duration>, op: F) -> Result<T, Error>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, op).await {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(Error::timed_out()),
        },
        None => op.await.map_err(Error::from),
    }
}

/// Replays a prefix of already-buffered bytes ahead of the inner
/// transport, so a connection take-over does not lose read-ahead.
pub(crate) struct Rewind<R> {
    inner: R,
    prefix: Option<Bytes>,
}

impl<R> Rewind<R> {
    pub(crate) fn new(inner: R, prefix: Bytes) -> Self {
        Self {
            inner,
            prefix: Some(prefix),
        }
    }
}

impl<R> AsyncRead for Rewind<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            if !prefix.is_empty() {
                let n = std::cmp::min(prefix.len(), buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);
                if !prefix.is_empty() {
                    self.prefix = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<R> AsyncWrite for Rewind<R>
where
    R: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn duplex_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Stream::new(Box::new(a));
        let right = Stream::new(Box::new(b));

        left.write_all(b"hello").await.unwrap();
        let mut buf = BytesMut::new();
        while buf.len() < 5 {
            assert!(right.read_buf(&mut buf).await.unwrap() > 0);
        }
        assert_eq!(&buf[..], b"hello");
    }

    #[tokio::test]
    async fn cancel_read_wakes_blocked_reader() {
        let (a, _b) = tokio::io::duplex(1024);
        let stream = std::sync::Arc::new(Stream::new(Box::new(a)));

        let reader = {
            let stream = stream.clone();
            tokio::spawn(async move {
                let mut buf = BytesMut::new();
                stream.read_buf(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        stream.cancel_read();
        assert!(matches!(reader.await.unwrap(), Err(Error::Aborted)));

        // sticky: later reads abort too
        let mut buf = BytesMut::new();
        assert!(matches!(
            stream.read_buf(&mut buf).await,
            Err(Error::Aborted)
        ));
    }

    #[tokio::test]
    async fn cancelled_write_does_not_affect_read() {
        let (a, b) = tokio::io::duplex(1024);
        let stream = Stream::new(Box::new(a));
        let peer = Stream::new(Box::new(b));

        peer.write_all(b"x").await.unwrap();
        stream.cancel_write();
        assert!(matches!(stream.write_all(b"y").await, Err(Error::Aborted)));

        let mut buf = BytesMut::new();
        assert_eq!(stream.read_buf(&mut buf).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_timeout_is_a_socket_error() {
        let (a, _b) = tokio::io::duplex(1024);
        let stream = Stream::with_timeouts(Box::new(a), Some(Duration::from_millis(50)), None);

        let mut buf = BytesMut::new();
        match stream.read_buf(&mut buf).await {
            Err(Error::Socket(err)) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rewind_replays_prefix() {
        let (a, b) = tokio::io::duplex(64);
        let mut rewound = Rewind::new(a, Bytes::from_static(b"head "));
        drop(b);

        let mut out = Vec::new();
        rewound.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"head ");

        let (a, mut b) = tokio::io::duplex(64);
        let mut rewound = Rewind::new(a, Bytes::from_static(b"head "));
        b.write_all(b"tail").await.unwrap();
        drop(b);
        let mut out = Vec::new();
        rewound.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"head tail");
    }
}
