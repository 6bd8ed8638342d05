//! Framed HTTP/1.x client connections.
//!
//! A [`ClientConnection`] serializes a pipeline of exchanges over one
//! [`Stream`]: request heads are written in submission order, and
//! responses are read back strictly in that order. Brokers treat the
//! connection as opaque; they only consult
//! [`outstanding_requests`][ClientConnection::outstanding_requests]
//! and [`new_requests_allowed`][ClientConnection::new_requests_allowed]
//! for pooling decisions.

mod codec;
mod server;

pub use codec::{RequestHead, ResponseHead};
pub use server::{Dispatch, ServerConnection};

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tracing::trace;

use crate::error::Error;
use crate::stream::{BoxIo, Rewind, Stream};

use codec::BodyLength;

/// A framed HTTP client bound to a stream.
pub struct ClientConnection {
    stream: Stream,
    write_order: Arc<AsyncMutex<()>>,
    read_buf: AsyncMutex<BytesMut>,
    state: Mutex<State>,
    turn: Notify,
}

#[derive(Debug)]
struct State {
    next_seq: u64,
    read_seq: u64,
    outstanding: usize,
    open: bool,
    // sequence number of the earliest failed exchange; everything
    // after it never reached the wire intact
    broken_at: Option<u64>,
}

impl ClientConnection {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            write_order: Arc::new(AsyncMutex::new(())),
            read_buf: AsyncMutex::new(BytesMut::with_capacity(8 * 1024)),
            state: Mutex::new(State {
                next_seq: 0,
                read_seq: 0,
                outstanding: 0,
                open: true,
                broken_at: None,
            }),
            turn: Notify::new(),
        }
    }

    /// Dispatch a request head, returning a handle to the exchange.
    ///
    /// May be called again before earlier responses have been read;
    /// the requests are pipelined in submission order.
    pub async fn request(self: Arc<Self>, head: &RequestHead) -> Result<ClientRequest, Error> {
        let write_guard = self.write_order.clone().lock_owned().await;
        let seq = {
            let mut state = self.state.lock();
            if state.broken_at.is_some() {
                return Err(Error::PriorRequestFailed);
            }
            if !state.open {
                return Err(Error::closed());
            }
            state.outstanding += 1;
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let mut buf = BytesMut::with_capacity(256);
        codec::encode_request_head(head, &mut buf);
        if let Err(err) = self.stream.write_all(&buf).await {
            self.fail(seq);
            return Err(err);
        }
        trace!(seq, method = %head.method, "request dispatched");

        let body_remaining = if head.has_body() {
            codec::content_length(&head.headers).unwrap_or(0)
        } else {
            0
        };
        // a declared body keeps the write pipeline until it is sent
        let write_guard = (body_remaining > 0).then_some(write_guard);

        Ok(ClientRequest {
            conn: self,
            seq,
            method: head.method.clone(),
            has_body: head.has_body(),
            body_remaining,
            write_guard,
            response: None,
            done: false,
        })
    }

    /// Requests dispatched whose responses have not been fully read.
    pub fn outstanding_requests(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Whether this connection will accept another request.
    pub fn new_requests_allowed(&self) -> bool {
        let state = self.state.lock();
        state.open && state.broken_at.is_none()
    }

    /// The underlying stream, exposed for cancellation.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Refuse further requests. In-flight exchanges are unaffected.
    pub fn close(&self) {
        self.state.lock().open = false;
    }

    fn fail(&self, seq: u64) {
        let mut state = self.state.lock();
        state.open = false;
        if state.broken_at.map_or(true, |broken| seq < broken) {
            state.broken_at = Some(seq);
        }
        drop(state);
        self.turn.notify_waiters();
    }

    fn finish_read(&self, close: bool) {
        let mut state = self.state.lock();
        state.read_seq += 1;
        state.outstanding -= 1;
        if close {
            state.open = false;
        }
        drop(state);
        self.turn.notify_waiters();
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClientConnection")
            .field("outstanding", &state.outstanding)
            .field("open", &state.open)
            .field("broken_at", &state.broken_at)
            .finish()
    }
}

/// Handle to one in-flight exchange on a [`ClientConnection`].
pub struct ClientRequest {
    conn: Arc<ClientConnection>,
    seq: u64,
    method: Method,
    has_body: bool,
    body_remaining: u64,
    write_guard: Option<OwnedMutexGuard<()>>,
    response: Option<(ResponseHead, Bytes)>,
    done: bool,
}

impl ClientRequest {
    /// Whether the dispatched head declared a request body.
    pub fn has_request_body(&self) -> bool {
        self.has_body
    }

    /// Write request body bytes. The connection's write pipeline is
    /// held until the declared Content-Length has been written.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 > self.body_remaining {
            return Err(Error::Protocol(
                "body exceeds declared content-length".into(),
            ));
        }
        match self.conn.stream.write_all(data).await {
            Ok(()) => {
                self.body_remaining -= data.len() as u64;
                if self.body_remaining == 0 {
                    self.write_guard = None;
                }
                Ok(())
            }
            Err(err) => {
                self.write_guard = None;
                self.conn.fail(self.seq);
                Err(err)
            }
        }
    }

    /// Wait for and return this exchange's response head. The body is
    /// buffered and available via [`body`][ClientRequest::body].
    pub async fn response(&mut self) -> Result<&ResponseHead, Error> {
        if self.response.is_none() {
            let read = self.read_response().await?;
            self.response = Some(read);
        }
        Ok(&self.response.as_ref().expect("response just stored").0)
    }

    /// The buffered response body; `None` until
    /// [`response`][ClientRequest::response] has resolved.
    pub fn body(&self) -> Option<&Bytes> {
        self.response.as_ref().map(|(_, body)| body)
    }

    /// Drive the exchange to completion, draining the response.
    pub async fn finish(mut self) -> Result<(), Error> {
        self.response().await?;
        Ok(())
    }

    /// After a successful `CONNECT`, take over the raw byte stream.
    /// Buffered read-ahead is replayed in front of the transport.
    pub async fn upgrade(mut self) -> Result<Stream, Error> {
        self.response().await?;
        let conn = self.conn.clone();
        conn.close();
        let leftover = conn.read_buf.lock().await.split().freeze();
        let (receive_timeout, send_timeout) = conn.stream.timeouts();
        let io = conn.stream.take_io()?;
        let io: BoxIo = if leftover.is_empty() {
            io
        } else {
            Box::new(Rewind::new(io, leftover))
        };
        Ok(Stream::with_timeouts(io, receive_timeout, send_timeout))
    }

    async fn read_response(&mut self) -> Result<(ResponseHead, Bytes), Error> {
        // an unsent body would wedge the pipeline behind us
        self.write_guard = None;

        // wait for our turn in the response order
        loop {
            let mut notified = std::pin::pin!(self.conn.turn.notified());
            {
                let state = self.conn.state.lock();
                if let Some(broken) = state.broken_at {
                    if self.seq >= broken {
                        return Err(Error::PriorRequestFailed);
                    }
                }
                if state.read_seq == self.seq {
                    break;
                }
                notified.as_mut().enable();
            }
            notified.await;
        }

        let mut buf = self.conn.read_buf.lock().await;
        let head = loop {
            match codec::parse_response_head(&mut buf) {
                Ok(Some(head)) => break head,
                Ok(None) => {}
                Err(err) => {
                    self.conn.fail(self.seq);
                    return Err(err);
                }
            }
            match self.conn.stream.read_buf(&mut buf).await {
                Ok(0) => {
                    self.conn.fail(self.seq);
                    return Err(Error::Socket(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before response",
                    )));
                }
                Ok(_) => {}
                Err(err) => {
                    self.conn.fail(self.seq);
                    return Err(err);
                }
            }
        };

        let body = match head.body_length(&self.method) {
            BodyLength::None => Bytes::new(),
            BodyLength::Known(len) => {
                while (buf.len() as u64) < len {
                    match self.conn.stream.read_buf(&mut buf).await {
                        Ok(0) => {
                            self.conn.fail(self.seq);
                            return Err(Error::Socket(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed mid body",
                            )));
                        }
                        Ok(_) => {}
                        Err(err) => {
                            self.conn.fail(self.seq);
                            return Err(err);
                        }
                    }
                }
                buf.split_to(len as usize).freeze()
            }
            BodyLength::UntilClose => {
                loop {
                    match self.conn.stream.read_buf(&mut buf).await {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) => {
                            self.conn.fail(self.seq);
                            return Err(err);
                        }
                    }
                }
                buf.split().freeze()
            }
        };

        let close = codec::wants_close(&head.headers, head.version)
            || head.body_length(&self.method) == BodyLength::UntilClose;
        drop(buf);

        trace!(seq = self.seq, status = %head.status, close, "response read");
        self.done = true;
        self.conn.finish_read(close);
        Ok((head, body))
    }
}

impl fmt::Debug for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRequest")
            .field("seq", &self.seq)
            .field("method", &self.method)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for ClientRequest {
    fn drop(&mut self) {
        // an abandoned exchange leaves the response framing unknown
        if !self.done {
            self.conn.fail(self.seq);
        }
    }
}
