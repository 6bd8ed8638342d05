//! Proxy interposition.
//!
//! Two layers cooperate. [`ProxyConnectionBroker`] sits above the
//! cache and routes plain-http requests to an http proxy's origin,
//! reporting `via_proxy` so the request broker keeps absolute-form.
//! [`ProxyStreamBroker`] sits below the TLS filter and obtains
//! tunneled streams for `https` targets by issuing `CONNECT` back up
//! through a request broker; the TLS session then runs inside the
//! tunnel.

use std::io;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use http::header::{HeaderValue, HOST};
use http::uri::Scheme;
use http::{Method, Uri};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{ConnectionBroker, RequestBroker, StreamBroker, StreamBrokerFilter};
use crate::conn::{ClientConnection, RequestHead};
use crate::error::Error;
use crate::stream::Stream;
use crate::uri;

/// Chooses the proxies to try for a target URI, in order; an empty
/// list means connect direct.
pub type ProxySelector = Arc<dyn Fn(&Uri) -> Vec<Uri> + Send + Sync>;

/// Routes plain-http requests through an http proxy's origin.
pub struct ProxyConnectionBroker {
    parent: Arc<dyn ConnectionBroker>,
    selector: ProxySelector,
}

impl ProxyConnectionBroker {
    pub fn new(parent: Arc<dyn ConnectionBroker>, selector: ProxySelector) -> Self {
        Self { parent, selector }
    }
}

#[async_trait]
impl ConnectionBroker for ProxyConnectionBroker {
    async fn get_connection(
        &self,
        uri: &Uri,
        force_new: bool,
    ) -> Result<(Arc<ClientConnection>, bool), Error> {
        // https tunneling happens below the cache, in the stream chain
        if uri.scheme() == Some(&Scheme::HTTP) {
            for proxy in (self.selector)(uri) {
                if proxy.scheme() != Some(&Scheme::HTTP) {
                    continue;
                }
                match self.parent.get_connection(&proxy, force_new).await {
                    Ok((conn, _)) => {
                        trace!(%proxy, target = %uri, "connection via proxy");
                        return Ok((conn, true));
                    }
                    Err(Error::Aborted) => return Err(Error::Aborted),
                    Err(err) => {
                        debug!(%proxy, error = %err, "proxy unreachable, trying next route")
                    }
                }
            }
        }
        self.parent.get_connection(uri, force_new).await
    }

    fn close_connections(&self) {
        self.parent.close_connections();
    }
}

/// Obtains tunneled streams for `https` targets behind a proxy.
///
/// The upward edge to the request broker is weak: the broker chain it
/// belongs to owns this filter through the TLS layer, and the cycle is
/// anchored by whoever built the chain.
pub struct ProxyStreamBroker {
    parent: Mutex<Arc<dyn StreamBroker>>,
    request_broker: Weak<dyn RequestBroker>,
    selector: ProxySelector,
}

impl ProxyStreamBroker {
    pub fn new(
        parent: Arc<dyn StreamBroker>,
        request_broker: Weak<dyn RequestBroker>,
        selector: ProxySelector,
    ) -> Self {
        Self {
            parent: Mutex::new(parent),
            request_broker,
            selector,
        }
    }

    async fn tunnel(&self, proxy: &Uri, target: &Uri) -> Result<Stream, Error> {
        let broker = self.request_broker.upgrade().ok_or(Error::Aborted)?;

        let (host, port) = uri::host_and_port(target)?;
        let destination: Uri = format!("{host}:{port}")
            .parse()
            .map_err(|_| Error::InvalidUri(format!("bad tunnel destination {host}:{port}")))?;
        let proxy_authority = proxy
            .authority()
            .ok_or_else(|| Error::InvalidUri(format!("proxy uri has no authority: {proxy}")))?;

        let mut head = RequestHead::new(Method::CONNECT, destination);
        head.headers.insert(
            HOST,
            HeaderValue::from_str(proxy_authority.as_str())
                .map_err(|err| Error::InvalidUri(err.to_string()))?,
        );

        debug!(%proxy, target = %target, "establishing tunnel");
        let mut request = broker.request(&mut head, true).await?;
        let status = request.response().await?.status;
        if !status.is_success() {
            return Err(Error::Socket(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("proxy refused tunnel: {status}"),
            )));
        }
        request.upgrade().await
    }
}

#[async_trait]
impl StreamBroker for ProxyStreamBroker {
    async fn get_stream(&self, uri: &Uri) -> Result<Stream, Error> {
        if uri.scheme() == Some(&Scheme::HTTPS) {
            for proxy in (self.selector)(uri) {
                if proxy.scheme() != Some(&Scheme::HTTP) {
                    continue;
                }
                match self.tunnel(&proxy, uri).await {
                    Ok(stream) => return Ok(stream),
                    Err(Error::Aborted) => return Err(Error::Aborted),
                    Err(err) => debug!(%proxy, error = %err, "tunnel failed, trying next route"),
                }
            }
        }
        let parent = self.parent.lock().clone();
        parent.get_stream(uri).await
    }

    fn cancel_pending(&self) {
        self.parent.lock().cancel_pending();
    }
}

impl StreamBrokerFilter for ProxyStreamBroker {
    fn parent(&self) -> Arc<dyn StreamBroker> {
        self.parent.lock().clone()
    }

    fn reparent(&self, parent: Arc<dyn StreamBroker>) {
        *self.parent.lock() = parent;
    }
}
