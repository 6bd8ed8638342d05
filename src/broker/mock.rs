//! In-memory connection broker for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Uri;
use parking_lot::Mutex;
use tracing::trace;

use super::ConnectionBroker;
use crate::conn::{ClientConnection, RequestHead, ResponseHead, ServerConnection};
use crate::error::Error;
use crate::stream::Stream;

/// Answers requests received by mock servers: the URI the connection
/// was brokered for, then the request head and buffered body.
pub type MockDispatch =
    dyn Fn(&Uri, &RequestHead, &Bytes) -> (ResponseHead, Bytes) + Send + Sync;

/// Hands out connections backed by in-memory pipes, one per URI, each
/// served by a spawned request loop bound to a dispatch function.
///
/// Entries whose client no longer accepts requests are dropped on
/// lookup, so a close-marked exchange makes the next call mint a fresh
/// pipe.
pub struct MockConnectionBroker {
    dispatch: Arc<MockDispatch>,
    conns: Mutex<HashMap<Uri, Arc<ClientConnection>>>,
}

impl MockConnectionBroker {
    pub fn new(dispatch: Arc<MockDispatch>) -> Self {
        Self {
            dispatch,
            conns: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConnectionBroker for MockConnectionBroker {
    async fn get_connection(
        &self,
        uri: &Uri,
        _force_new: bool,
    ) -> Result<(Arc<ClientConnection>, bool), Error> {
        let mut conns = self.conns.lock();
        if let Some(conn) = conns.get(uri) {
            if conn.new_requests_allowed() {
                return Ok((conn.clone(), false));
            }
            conns.remove(uri);
        }

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = Arc::new(ClientConnection::new(Stream::new(Box::new(client_io))));

        let dispatch = self.dispatch.clone();
        let key = uri.clone();
        let server = ServerConnection::new(
            Stream::new(Box::new(server_io)),
            Arc::new(move |head: &RequestHead, body: &Bytes| dispatch(&key, head, body)),
        );
        tokio::spawn(async move {
            if let Err(err) = server.process_requests().await {
                trace!(error = %err, "mock server loop ended");
            }
        });

        trace!(%uri, "minted mock connection");
        conns.insert(uri.clone(), client.clone());
        Ok((client, false))
    }

    fn close_connections(&self) {
        let mut conns = self.conns.lock();
        for conn in conns.values() {
            conn.stream().cancel_read();
            conn.stream().cancel_write();
        }
        conns.clear();
    }
}
