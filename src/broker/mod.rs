//! Broker interfaces and the canonical pipeline.
//!
//! Brokers come in three altitudes. A [`StreamBroker`] turns a URI
//! into a connected byte stream; a [`ConnectionBroker`] turns a URI
//! into a framed [`ClientConnection`]; a [`RequestBroker`] turns a
//! request head into an in-flight [`ClientRequest`]. Each altitude has
//! filter variants that delegate to a parent of the same kind, adding
//! behavior: TLS upgrade, proxy interposition, redirect following.
//!
//! [`default_request_broker`] assembles the canonical chain. The
//! construction is two-phase: the proxy stream broker needs a request
//! broker to issue `CONNECT`, and that request broker's own chain ends
//! at the TLS filter, which must in turn reach *through* the proxy
//! layer. The inner chain is built first, the TLS filter is then
//! reparented onto the proxy stream broker, and the upward edge from
//! the proxy back into the request chain is a weak reference anchored
//! by the returned [`Brokers`] handle.

mod base;
mod cache;
mod mock;
mod proxy;
mod redirect;
mod socket;
mod tls;

pub use base::BaseRequestBroker;
pub use cache::{CacheOptions, ConnectionCache};
pub use mock::{MockConnectionBroker, MockDispatch};
pub use proxy::{ProxyConnectionBroker, ProxySelector, ProxyStreamBroker};
pub use redirect::RedirectRequestBroker;
pub use socket::{SocketOptions, SocketStreamBroker};
pub use tls::{TlsOptions, TlsStreamBroker};

use std::sync::Arc;

use async_trait::async_trait;
use http::Uri;

use crate::conn::{ClientConnection, ClientRequest, RequestHead};
use crate::error::Error;
use crate::stream::Stream;

/// Produces byte streams connected to the origin (or proxy) of a URI.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Establish a stream to the target of `uri`.
    async fn get_stream(&self, uri: &Uri) -> Result<Stream, Error>;

    /// Abort in-flight establishment and refuse new attempts.
    fn cancel_pending(&self);
}

/// A stream broker that layers behavior over a parent broker.
pub trait StreamBrokerFilter: StreamBroker {
    fn parent(&self) -> Arc<dyn StreamBroker>;

    /// Swap the parent; used to resolve construction cycles.
    fn reparent(&self, parent: Arc<dyn StreamBroker>);
}

/// Produces framed client connections for a URI.
#[async_trait]
pub trait ConnectionBroker: Send + Sync {
    /// Return a live connection for `uri`, and whether it reaches the
    /// origin via a proxy. `force_new` bypasses reuse.
    async fn get_connection(
        &self,
        uri: &Uri,
        force_new: bool,
    ) -> Result<(Arc<ClientConnection>, bool), Error>;

    /// Tear down pooled state and cancel in-flight establishment.
    fn close_connections(&self);
}

/// Dispatches request heads, yielding in-flight exchanges.
#[async_trait]
pub trait RequestBroker: Send + Sync {
    /// Dispatch `head`, returning a handle to the live exchange.
    async fn request(&self, head: &mut RequestHead, force_new: bool)
        -> Result<ClientRequest, Error>;

    /// Filter hook: inspect a response, optionally rewriting `head`.
    /// Returns `true` when the filter consumed the response and the
    /// caller should redispatch.
    async fn check_response(
        &self,
        _request: &mut ClientRequest,
        _head: &mut RequestHead,
    ) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Configuration for [`default_request_broker`].
#[derive(Clone)]
pub struct BrokerOptions {
    pub socket: SocketOptions,
    pub tls: TlsOptions,
    pub cache: CacheOptions,
    /// Chooses proxies per target URI; returning no proxies means
    /// direct.
    pub proxy: ProxySelector,
    /// Call [`Brokers::close_connections`] when the handle drops.
    pub close_on_shutdown: bool,
    /// Retry cap for the base brokers; `None` retries without bound.
    pub retry_limit: Option<usize>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            socket: SocketOptions::default(),
            tls: TlsOptions::default(),
            cache: CacheOptions::default(),
            proxy: Arc::new(|_| Vec::new()),
            close_on_shutdown: true,
            retry_limit: None,
        }
    }
}

/// Handles to the canonical broker pipeline.
///
/// Owns both request chains so the construction cycle stays alive: the
/// proxy stream broker's upward edge into the inner request broker is
/// weak, anchored here.
pub struct Brokers {
    request: Arc<dyn RequestBroker>,
    cache: Arc<ConnectionCache>,
    close_on_shutdown: bool,
    _tunnel: Arc<dyn RequestBroker>,
}

impl Brokers {
    /// The outward-facing request broker.
    pub fn request_broker(&self) -> Arc<dyn RequestBroker> {
        self.request.clone()
    }

    /// The connection cache, exposed for shutdown.
    pub fn connection_broker(&self) -> Arc<ConnectionCache> {
        self.cache.clone()
    }

    /// Wrap the outward broker in a redirect follower.
    pub fn with_redirects(mut self) -> Self {
        self.request = Arc::new(RedirectRequestBroker::new(self.request.clone()));
        self
    }

    /// Tear down the pipeline: cancel dials, close pooled connections.
    pub fn close_connections(&self) {
        self.cache.close_connections();
    }
}

impl Drop for Brokers {
    fn drop(&mut self) {
        if self.close_on_shutdown {
            self.cache.close_connections();
        }
    }
}

/// Construct the canonical pipeline.
///
/// The inner chain `socket → tls → cache → base` dispatches `CONNECT`
/// requests for tunneling; the outer chain `socket → proxy stream →
/// tls (reparented) → proxy connection (cache) → base` is what callers
/// dispatch ordinary requests through.
pub fn default_request_broker(options: BrokerOptions) -> Brokers {
    let socket: Arc<SocketStreamBroker> = Arc::new(SocketStreamBroker::new(options.socket));
    let tls = Arc::new(TlsStreamBroker::new(socket.clone(), options.tls));
    let cache = Arc::new(ConnectionCache::new(tls.clone(), options.cache));
    let inner: Arc<dyn RequestBroker> = Arc::new(
        BaseRequestBroker::new(cache.clone()).with_retry_limit(options.retry_limit),
    );

    let proxy_stream = Arc::new(ProxyStreamBroker::new(
        socket,
        Arc::downgrade(&inner),
        options.proxy.clone(),
    ));
    tls.reparent(proxy_stream);

    let proxy_conn = Arc::new(ProxyConnectionBroker::new(cache.clone(), options.proxy));
    let outer: Arc<dyn RequestBroker> =
        Arc::new(BaseRequestBroker::new(proxy_conn).with_retry_limit(options.retry_limit));

    Brokers {
        request: outer,
        cache,
        close_on_shutdown: options.close_on_shutdown,
        _tunnel: inner,
    }
}
