//! Redirect following.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::LOCATION;
use http::StatusCode;
use tracing::debug;

use super::RequestBroker;
use crate::conn::{ClientRequest, RequestHead};
use crate::error::Error;
use crate::uri::transform;

/// Follows `301`, `302`, and `307` responses from an inner broker,
/// failing with [`Error::CircularRedirect`] when a chain revisits a
/// URI.
///
/// Requests carrying a body are handed back unredirected: their bodies
/// may be one-shot streams this layer cannot replay, so the caller
/// decides.
pub struct RedirectRequestBroker {
    parent: Arc<dyn RequestBroker>,
}

impl RedirectRequestBroker {
    pub fn new(parent: Arc<dyn RequestBroker>) -> Self {
        Self { parent }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND | StatusCode::TEMPORARY_REDIRECT
    )
}

#[async_trait]
impl RequestBroker for RedirectRequestBroker {
    async fn request(
        &self,
        head: &mut RequestHead,
        force_new: bool,
    ) -> Result<ClientRequest, Error> {
        let mut original = head.uri.clone();
        let mut visited = vec![head.uri.clone()];

        let result = loop {
            let mut request = match self.parent.request(head, force_new).await {
                Ok(request) => request,
                Err(err) => break Err(err),
            };
            if request.has_request_body() {
                break Ok(request);
            }

            let (status, location) = {
                let response = match request.response().await {
                    Ok(response) => response,
                    Err(err) => break Err(err),
                };
                if !is_redirect(response.status) {
                    break Ok(request);
                }
                let location = response
                    .headers
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned);
                (response.status, location)
            };
            let Some(location) = location else {
                break Err(Error::Protocol(format!(
                    "{status} response without a Location header"
                )));
            };

            let next = match transform(&head.uri, &location) {
                Ok(next) => next,
                Err(err) => break Err(err),
            };
            if visited.contains(&next) {
                break Err(Error::CircularRedirect(original.clone()));
            }
            debug!(%status, from = %head.uri, to = %next, "following redirect");
            visited.push(next.clone());
            if status == StatusCode::MOVED_PERMANENTLY {
                // further hops, and the caller's view, anchor at the
                // permanent target
                original = next.clone();
            }
            head.uri = next;
            if let Err(err) = request.finish().await {
                break Err(err);
            }
        };

        head.uri = original;
        result
    }

    async fn check_response(
        &self,
        request: &mut ClientRequest,
        head: &mut RequestHead,
    ) -> Result<bool, Error> {
        let (status, location) = {
            let response = request.response().await?;
            if !is_redirect(response.status) {
                return self.parent.check_response(request, head).await;
            }
            let location = response
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            (response.status, location)
        };
        let location = location.ok_or_else(|| {
            Error::Protocol(format!("{status} response without a Location header"))
        })?;
        head.uri = transform(&head.uri, &location)?;
        Ok(true)
    }
}
