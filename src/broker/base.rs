//! Request dispatch over brokered connections.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderValue, HOST};
use http::uri::Parts;
use http::{Method, Uri};
use tracing::debug;

use super::{ConnectionBroker, RequestBroker};
use crate::conn::{ClientRequest, RequestHead};
use crate::error::Error;

/// Dispatches request heads over connections from a
/// [`ConnectionBroker`], retrying connection-level failures that occur
/// before the request reaches the wire.
///
/// Retries cover [`Error::Socket`] and [`Error::PriorRequestFailed`]
/// only; with no [`retry_limit`][BaseRequestBroker::with_retry_limit]
/// they continue until a dispatch sticks or some other error surfaces.
pub struct BaseRequestBroker {
    connection_broker: Arc<dyn ConnectionBroker>,
    retry_limit: Option<usize>,
}

impl BaseRequestBroker {
    pub fn new(connection_broker: Arc<dyn ConnectionBroker>) -> Self {
        Self {
            connection_broker,
            retry_limit: None,
        }
    }

    /// Cap connection-level retries. `None` means unbounded.
    pub fn with_retry_limit(mut self, retry_limit: Option<usize>) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    async fn dispatch(
        &self,
        head: &mut RequestHead,
        original: &Uri,
        connect: bool,
        force_new: bool,
    ) -> Result<ClientRequest, Error> {
        let mut retries = 0usize;
        loop {
            let target = if connect { original } else { &head.uri };
            let (conn, via_proxy) = self
                .connection_broker
                .get_connection(target, force_new)
                .await?;

            // the request line carries absolute-form through a proxy
            // and origin-form when direct
            if !connect {
                if via_proxy && head.uri.authority().is_none() {
                    head.uri = absolute_form(&head.uri, original)?;
                } else if !via_proxy && head.uri.authority().is_some() {
                    head.uri = origin_form(&head.uri)?;
                }
            }

            match conn.request(head).await {
                Ok(request) => return Ok(request),
                Err(err) if err.is_retryable() => {
                    if let Some(limit) = self.retry_limit {
                        if retries >= limit {
                            return Err(err);
                        }
                    }
                    retries += 1;
                    debug!(error = %err, retries, "connection failed before dispatch, retrying");
                    // reselect with the caller's absolute uri
                    if !connect {
                        head.uri = original.clone();
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn origin_form(uri: &Uri) -> Result<Uri, Error> {
    let mut parts = Parts::default();
    parts.path_and_query = Some(match uri.path_and_query() {
        Some(pq) if !pq.as_str().is_empty() => pq.clone(),
        _ => "/".parse().expect("slash is a valid path"),
    });
    Uri::from_parts(parts).map_err(|err| Error::InvalidUri(err.to_string()))
}

fn absolute_form(uri: &Uri, original: &Uri) -> Result<Uri, Error> {
    let mut parts = uri.clone().into_parts();
    parts.scheme = original.scheme().cloned();
    parts.authority = original.authority().cloned();
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse().expect("slash is a valid path"));
    }
    Uri::from_parts(parts).map_err(|err| Error::InvalidUri(err.to_string()))
}

#[async_trait]
impl RequestBroker for BaseRequestBroker {
    async fn request(
        &self,
        head: &mut RequestHead,
        force_new: bool,
    ) -> Result<ClientRequest, Error> {
        let connect = head.method == Method::CONNECT;
        let original = if connect {
            // CONNECT carries the tunnel destination in the request
            // line; the Host header names where to connect
            let host = head
                .headers
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| Error::InvalidUri("CONNECT requires a Host header".into()))?;
            format!("http://{host}")
                .parse::<Uri>()
                .map_err(|err| Error::InvalidUri(err.to_string()))?
        } else {
            let authority = head.uri.authority().cloned().ok_or_else(|| {
                Error::InvalidUri(format!("request uri has no authority: {}", head.uri))
            })?;
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(|err| Error::InvalidUri(err.to_string()))?;
            head.headers.insert(HOST, host);
            head.uri.clone()
        };

        let result = self.dispatch(head, &original, connect, force_new).await;
        // the caller's request line reflects the uri it asked for, on
        // every exit path
        if !connect {
            head.uri = original;
        }
        result
    }
}
