//! HTTP/1.x head framing.

use bytes::{Buf, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri, Version};

use crate::error::Error;

const MAX_HEADERS: usize = 64;
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Request line plus headers, the unit a request broker dispatches.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// A bare GET request for `uri`.
    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Whether the head declares a request body.
    pub fn has_body(&self) -> bool {
        content_length(&self.headers).is_some_and(|len| len > 0)
            || self.headers.contains_key(TRANSFER_ENCODING)
    }
}

/// Status line plus headers of a received response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// How the response body is delimited, given the method that
    /// elicited it.
    pub(crate) fn body_length(&self, request_method: &Method) -> BodyLength {
        if *request_method == Method::HEAD
            || (*request_method == Method::CONNECT && self.status.is_success())
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            BodyLength::None
        } else if let Some(len) = content_length(&self.headers) {
            BodyLength::Known(len)
        } else {
            BodyLength::UntilClose
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    None,
    Known(u64),
    UntilClose,
}

pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Whether the peer intends to close the connection after this
/// exchange.
pub(crate) fn wants_close(headers: &HeaderMap, version: Version) -> bool {
    match headers.get(CONNECTION).and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        _ => version == Version::HTTP_10,
    }
}

fn version_str(version: Version) -> &'static [u8] {
    if version == Version::HTTP_10 {
        b"HTTP/1.0"
    } else {
        b"HTTP/1.1"
    }
}

// origin-form for direct requests, absolute-form when an authority is
// present (proxied), bare authority for CONNECT
fn request_target(head: &RequestHead) -> String {
    if head.method == Method::CONNECT {
        head.uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| head.uri.to_string())
    } else if head.uri.authority().is_some() {
        head.uri.to_string()
    } else {
        match head.uri.path_and_query() {
            Some(pq) if !pq.as_str().is_empty() => pq.to_string(),
            _ => "/".to_owned(),
        }
    }
}

pub(crate) fn encode_request_head(head: &RequestHead, buf: &mut BytesMut) {
    buf.extend_from_slice(head.method.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(request_target(head).as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(version_str(head.version));
    buf.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, buf);
}

pub(crate) fn encode_response_head(head: &ResponseHead, buf: &mut BytesMut) {
    buf.extend_from_slice(version_str(head.version));
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(head.status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(head.status.canonical_reason().unwrap_or("").as_bytes());
    buf.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, buf);
}

fn encode_headers(headers: &HeaderMap, buf: &mut BytesMut) {
    for (name, value) in headers {
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Try to parse a response head off the front of `buf`. `Ok(None)`
/// means more bytes are needed.
pub(crate) fn parse_response_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>, Error> {
    let (head, consumed) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf[..]) {
            Ok(httparse::Status::Complete(consumed)) => {
                let status = response
                    .code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or_else(|| Error::Protocol("invalid status code".into()))?;
                let version = parsed_version(response.version);
                let headers = collect_headers(response.headers)?;
                (
                    ResponseHead {
                        status,
                        version,
                        headers,
                    },
                    consumed,
                )
            }
            Ok(httparse::Status::Partial) => {
                return if buf.len() > MAX_HEAD_BYTES {
                    Err(Error::Protocol("response head too large".into()))
                } else {
                    Ok(None)
                }
            }
            Err(err) => return Err(Error::Protocol(format!("malformed response head: {err}"))),
        }
    };
    buf.advance(consumed);
    Ok(Some(head))
}

/// Try to parse a request head off the front of `buf`. `Ok(None)`
/// means more bytes are needed.
pub(crate) fn parse_request_head(buf: &mut BytesMut) -> Result<Option<RequestHead>, Error> {
    let (head, consumed) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf[..]) {
            Ok(httparse::Status::Complete(consumed)) => {
                let method = request
                    .method
                    .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                    .ok_or_else(|| Error::Protocol("invalid method".into()))?;
                let uri = request
                    .path
                    .and_then(|p| p.parse::<Uri>().ok())
                    .ok_or_else(|| Error::Protocol("invalid request target".into()))?;
                let version = parsed_version(request.version);
                let headers = collect_headers(request.headers)?;
                (
                    RequestHead {
                        method,
                        uri,
                        version,
                        headers,
                    },
                    consumed,
                )
            }
            Ok(httparse::Status::Partial) => {
                return if buf.len() > MAX_HEAD_BYTES {
                    Err(Error::Protocol("request head too large".into()))
                } else {
                    Ok(None)
                }
            }
            Err(err) => return Err(Error::Protocol(format!("malformed request head: {err}"))),
        }
    };
    buf.advance(consumed);
    Ok(Some(head))
}

fn parsed_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|err| Error::Protocol(format!("invalid header name: {err}")))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|err| Error::Protocol(format!("invalid header value: {err}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}
