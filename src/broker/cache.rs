//! The origin-keyed connection cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use http::Uri;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::{ConnectionBroker, StreamBroker};
use crate::conn::ClientConnection;
use crate::error::Error;
use crate::uri::OriginKey;

/// Pool sizing for [`ConnectionCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Bound on concurrent connections (ready or being established)
    /// per origin.
    ///
    /// The pool grows to this bound before reusing anything; that is a
    /// deliberate throughput policy, and it means `1` degenerates to
    /// one-exchange-at-a-time unless requests pipeline.
    pub connections_per_host: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            connections_per_host: 1,
        }
    }
}

/// One unit of capacity in an origin's pool.
enum Slot {
    /// A dial is in progress and holds this slot.
    Pending,
    /// A live connection, ready for selection.
    Ready(Arc<ClientConnection>),
}

impl Slot {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }
}

struct Entry {
    slots: Vec<Slot>,
    /// Signalled whenever slots transition: a dial publishes or fails,
    /// or the pool shuts down.
    cond: Arc<Notify>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            cond: Arc::new(Notify::new()),
        }
    }
}

impl Entry {
    /// The ready connection with the fewest outstanding requests, or
    /// `None` when the least-loaded slot is still pending. Pending
    /// slots compare greater than any ready slot; ties go to list
    /// order.
    fn least_loaded(&self) -> Option<Arc<ClientConnection>> {
        let slot = self.slots.iter().min_by_key(|slot| match slot {
            Slot::Ready(conn) => conn.outstanding_requests(),
            Slot::Pending => usize::MAX,
        })?;
        match slot {
            Slot::Ready(conn) => Some(conn.clone()),
            Slot::Pending => None,
        }
    }
}

/// Pools [`ClientConnection`]s per origin, bounding fan-out and
/// reusing idle or pipelinable connections.
///
/// All pool mutations happen under one mutex. The only suspensions on
/// the cache path are waiting on an entry's condition (registered
/// before the lock is released) and the stream broker dial, which runs
/// with the lock released against a reserved pending slot.
pub struct ConnectionCache {
    stream_broker: Arc<dyn StreamBroker>,
    options: CacheOptions,
    conns: Mutex<HashMap<OriginKey, Entry>>,
}

impl ConnectionCache {
    pub fn new(stream_broker: Arc<dyn StreamBroker>, options: CacheOptions) -> Self {
        Self {
            stream_broker,
            options: CacheOptions {
                connections_per_host: options.connections_per_host.max(1),
            },
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Drop connections that no longer accept requests, and origins
    /// with no slots left. Runs on every cache entry; there is no
    /// background sweeper.
    fn sweep(conns: &mut HashMap<OriginKey, Entry>) {
        conns.retain(|key, entry| {
            entry.slots.retain(|slot| match slot {
                Slot::Pending => true,
                Slot::Ready(conn) => conn.new_requests_allowed(),
            });
            if entry.slots.is_empty() {
                trace!(%key, "dropping empty origin entry");
                false
            } else {
                true
            }
        });
    }

    async fn dial(
        &self,
        key: &OriginKey,
        cond: &Arc<Notify>,
    ) -> Result<Arc<ClientConnection>, Error> {
        debug!(%key, "establishing new connection");
        match self.stream_broker.get_stream(&key.to_uri()).await {
            Ok(stream) => {
                let conn = Arc::new(ClientConnection::new(stream));
                let mut conns = self.conns.lock();
                // fill the first pending slot of our generation; its
                // position may have shifted under concurrent erases
                if let Some(entry) = conns
                    .get_mut(key)
                    .filter(|entry| Arc::ptr_eq(&entry.cond, cond))
                {
                    if let Some(slot) = entry.slots.iter_mut().find(|slot| slot.is_pending()) {
                        *slot = Slot::Ready(conn.clone());
                    }
                    entry.cond.notify_waiters();
                } else {
                    // the pool was torn down mid-dial; the caller still
                    // gets the connection, unpooled
                    trace!(%key, "origin entry vanished during dial");
                }
                Ok(conn)
            }
            Err(err) => {
                let mut conns = self.conns.lock();
                if let Some(entry) = conns
                    .get_mut(key)
                    .filter(|entry| Arc::ptr_eq(&entry.cond, cond))
                {
                    if let Some(idx) = entry.slots.iter().position(Slot::is_pending) {
                        entry.slots.remove(idx);
                    }
                    entry.cond.notify_waiters();
                    if entry.slots.is_empty() {
                        conns.remove(key);
                    }
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ConnectionBroker for ConnectionCache {
    async fn get_connection(
        &self,
        uri: &Uri,
        force_new: bool,
    ) -> Result<(Arc<ClientConnection>, bool), Error> {
        let key = OriginKey::try_from(uri)?;
        loop {
            let cond;
            {
                let mut conns = self.conns.lock();
                Self::sweep(&mut conns);

                if !force_new {
                    if let Some(entry) = conns.get(&key) {
                        if entry.slots.len() >= self.options.connections_per_host {
                            if let Some(conn) = entry.least_loaded() {
                                trace!(
                                    %key,
                                    outstanding = conn.outstanding_requests(),
                                    "reusing pooled connection"
                                );
                                return Ok((conn, false));
                            }
                            // every candidate is a dial in progress:
                            // wait for a transition, then reselect
                            cond = entry.cond.clone();
                            let mut notified = std::pin::pin!(cond.notified());
                            notified.as_mut().enable();
                            drop(conns);
                            trace!(%key, "waiting on pending connection");
                            notified.await;
                            continue;
                        }
                    }
                }

                // below the bound (or forcing): reserve a pending slot
                // and dial with the lock released
                let entry = conns.entry(key.clone()).or_default();
                entry.slots.push(Slot::Pending);
                cond = entry.cond.clone();
            }
            return self.dial(&key, &cond).await.map(|conn| (conn, false));
        }
    }

    /// Cancel pending dials, cancel I/O on every pooled connection,
    /// and clear the pool. Waiters wake, reselect against an emptied
    /// map, and propagate `Aborted` out of the now-cancelled dial
    /// path.
    fn close_connections(&self) {
        self.stream_broker.cancel_pending();
        let mut conns = self.conns.lock();
        for (key, entry) in conns.iter() {
            trace!(%key, slots = entry.slots.len(), "closing origin entry");
            entry.cond.notify_waiters();
            for slot in &entry.slots {
                if let Slot::Ready(conn) = slot {
                    conn.stream().cancel_read();
                    conn.stream().cancel_write();
                }
            }
        }
        conns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::stream::Stream;

    fn ready_conn() -> Arc<ClientConnection> {
        let (io, _peer) = tokio::io::duplex(64);
        Arc::new(ClientConnection::new(Stream::new(Box::new(io))))
    }

    #[test]
    fn least_loaded_prefers_ready_over_pending() {
        let mut entry = Entry::default();
        entry.slots.push(Slot::Pending);
        assert!(entry.least_loaded().is_none());

        let conn = ready_conn();
        entry.slots.push(Slot::Ready(conn.clone()));
        let chosen = entry.least_loaded().unwrap();
        assert!(Arc::ptr_eq(&chosen, &conn));
    }

    #[test]
    fn least_loaded_ties_go_to_list_order() {
        let mut entry = Entry::default();
        let first = ready_conn();
        let second = ready_conn();
        entry.slots.push(Slot::Ready(first.clone()));
        entry.slots.push(Slot::Ready(second));
        let chosen = entry.least_loaded().unwrap();
        assert!(Arc::ptr_eq(&chosen, &first));
    }

    #[test]
    fn sweep_drops_dead_connections_and_empty_origins() {
        let mut conns = HashMap::new();
        let key = OriginKey::try_from(&Uri::from_static("http://x.example/")).unwrap();
        let dead = ready_conn();
        dead.close();
        let mut entry = Entry::default();
        entry.slots.push(Slot::Ready(dead));
        conns.insert(key.clone(), entry);

        ConnectionCache::sweep(&mut conns);
        assert!(conns.is_empty());

        // pending slots survive a sweep
        let mut entry = Entry::default();
        entry.slots.push(Slot::Pending);
        conns.insert(key.clone(), entry);
        ConnectionCache::sweep(&mut conns);
        assert_eq!(conns.get(&key).unwrap().slots.len(), 1);
    }
}
