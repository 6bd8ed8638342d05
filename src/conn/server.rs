//! Server half of a framed connection, used by the mock broker and the
//! test suite.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{HeaderValue, CONTENT_LENGTH};
use tracing::trace;

use crate::error::Error;
use crate::stream::Stream;

use super::codec::{self, RequestHead, ResponseHead};

/// Answers one received request: head and buffered body in, response
/// head and body out.
pub type Dispatch = dyn Fn(&RequestHead, &Bytes) -> (ResponseHead, Bytes) + Send + Sync;

/// Reads requests off a stream sequentially and answers each through a
/// dispatch function.
pub struct ServerConnection {
    stream: Stream,
    dispatch: Arc<Dispatch>,
}

impl ServerConnection {
    pub fn new(stream: Stream, dispatch: Arc<Dispatch>) -> Self {
        Self { stream, dispatch }
    }

    /// The underlying stream, exposed for cancellation.
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Serve requests until EOF, an error, or a close-marked exchange.
    pub async fn process_requests(self) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        loop {
            let head = loop {
                if let Some(head) = codec::parse_request_head(&mut buf)? {
                    break head;
                }
                let n = self.stream.read_buf(&mut buf).await?;
                if n == 0 {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    return Err(Error::Protocol("eof inside a request head".into()));
                }
            };

            let body_len = codec::content_length(&head.headers).unwrap_or(0);
            while (buf.len() as u64) < body_len {
                let n = self.stream.read_buf(&mut buf).await?;
                if n == 0 {
                    return Err(Error::Protocol("eof inside a request body".into()));
                }
            }
            let body = buf.split_to(body_len as usize).freeze();
            let close = codec::wants_close(&head.headers, head.version);

            trace!(method = %head.method, uri = %head.uri, "dispatching request");
            let (mut response, response_body) = (self.dispatch)(&head, &body);
            if !response.headers.contains_key(CONTENT_LENGTH) {
                response
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(response_body.len()));
            }

            let mut out = BytesMut::with_capacity(256 + response_body.len());
            codec::encode_response_head(&response, &mut out);
            out.extend_from_slice(&response_body);
            self.stream.write_all(&out).await?;

            if close || codec::wants_close(&response.headers, response.version) {
                return Ok(());
            }
        }
    }
}
