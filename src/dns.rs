//! Name resolution.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// An ordered collection of resolved addresses, tried in order.
#[derive(Debug, Clone, Default)]
pub(crate) struct SocketAddrs(VecDeque<SocketAddr>);

impl SocketAddrs {
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::collections::vec_deque::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Resolve `host:port` on the blocking pool, preserving resolver order.
pub(crate) async fn resolve(host: &str, port: u16) -> io::Result<SocketAddrs> {
    let host = host.to_owned();
    tokio::task::spawn_blocking(move || {
        (host.as_str(), port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect())
    })
    .await
    .map_err(|err| io::Error::new(io::ErrorKind::Interrupted, err))?
}
