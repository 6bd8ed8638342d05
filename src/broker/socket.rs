//! Socket-level stream establishment.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use http::Uri;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::StreamBroker;
use crate::dns;
use crate::error::Error;
use crate::signal::AbortSignal;
use crate::stream::Stream;
use crate::uri;

/// Timeouts applied to sockets this broker creates. `None` means no
/// limit.
#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub connect_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub receive_timeout: Option<Duration>,
}

/// Resolves a URI's authority and connects a TCP stream to it, trying
/// resolved addresses in order.
///
/// [`cancel_pending`][StreamBroker::cancel_pending] aborts every
/// in-flight connect and latches the broker: later calls fail with
/// [`Error::Aborted`].
pub struct SocketStreamBroker {
    options: SocketOptions,
    pending: Mutex<PendingDials>,
}

#[derive(Default)]
struct PendingDials {
    cancelled: bool,
    next_id: u64,
    attempts: HashMap<u64, AbortSignal>,
}

impl SocketStreamBroker {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            options,
            pending: Mutex::new(PendingDials::default()),
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, Error> {
        let abort = AbortSignal::new();
        let id = {
            let mut pending = self.pending.lock();
            if pending.cancelled {
                return Err(Error::Aborted);
            }
            let id = pending.next_id;
            pending.next_id += 1;
            pending.attempts.insert(id, abort.clone());
            id
        };
        let result = tokio::select! {
            _ = abort.aborted() => Err(Error::Aborted),
            connected = connect_timed(self.options.connect_timeout, addr) => connected,
        };
        self.pending.lock().attempts.remove(&id);
        result
    }
}

async fn connect_timed(limit: Option<Duration>, addr: SocketAddr) -> Result<TcpStream, Error> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
            Ok(connected) => connected.map_err(Error::from),
            Err(_) => Err(Error::timed_out()),
        },
        None => TcpStream::connect(addr).await.map_err(Error::from),
    }
}

#[async_trait]
impl StreamBroker for SocketStreamBroker {
    async fn get_stream(&self, uri: &Uri) -> Result<Stream, Error> {
        if self.pending.lock().cancelled {
            return Err(Error::Aborted);
        }
        let (host, port) = uri::host_and_port(uri)?;
        let addrs = dns::resolve(host, port).await.map_err(Error::Socket)?;
        debug!(host, port, addresses = addrs.len(), "resolved");

        let mut last_error = Error::Socket(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {host}"),
        ));
        for addr in addrs {
            match self.connect(addr).await {
                Ok(socket) => {
                    trace!(%addr, "connected");
                    let _ = socket.set_nodelay(true);
                    return Ok(Stream::with_timeouts(
                        Box::new(socket),
                        self.options.receive_timeout,
                        self.options.send_timeout,
                    ));
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(err) => {
                    trace!(%addr, error = %err, "connect failed");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn cancel_pending(&self) {
        let mut pending = self.pending.lock();
        pending.cancelled = true;
        for abort in pending.attempts.values() {
            abort.abort();
        }
    }
}
