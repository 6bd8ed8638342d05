//! Origin keys and reference resolution.

use std::fmt;

use http::uri::{Authority, Parts, PathAndQuery, Scheme, Uri};

use crate::error::Error;

/// A URI reduced to scheme and authority; the pool's primary key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct OriginKey(Scheme, Authority);

impl OriginKey {
    /// The origin's scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.0
    }

    /// The origin's authority.
    pub fn authority(&self) -> &Authority {
        &self.1
    }

    /// The origin as a URI, suitable for handing to a stream broker.
    pub fn to_uri(&self) -> Uri {
        Uri::builder()
            .scheme(self.0.clone())
            .authority(self.1.clone())
            .path_and_query("/")
            .build()
            .expect("scheme and authority form a valid uri")
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.0, self.1)
    }
}

impl TryFrom<&Uri> for OriginKey {
    type Error = Error;

    fn try_from(uri: &Uri) -> Result<Self, Error> {
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme in {uri}")))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| Error::InvalidUri(format!("missing authority in {uri}")))?;
        Ok(OriginKey(scheme, authority))
    }
}

pub(crate) fn default_port(scheme: &Scheme) -> Option<u16> {
    if *scheme == Scheme::HTTP {
        Some(80)
    } else if *scheme == Scheme::HTTPS {
        Some(443)
    } else {
        None
    }
}

/// Host and port for dialing `uri`; the port falls back to the
/// scheme's default.
pub(crate) fn host_and_port(uri: &Uri) -> Result<(&str, u16), Error> {
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidUri(format!("missing host in {uri}")))?;
    let port = uri
        .port_u16()
        .or_else(|| uri.scheme().and_then(default_port))
        .ok_or_else(|| Error::InvalidUri(format!("no port and no default for {uri}")))?;
    Ok((host, port))
}

/// Resolve `reference` (typically a `Location` header) against `base`,
/// per RFC 3986 §5.
pub fn transform(base: &Uri, reference: &str) -> Result<Uri, Error> {
    if reference.is_empty() {
        return Ok(base.clone());
    }
    if has_scheme(reference) {
        return reference
            .parse()
            .map_err(|_| Error::InvalidUri(format!("unparseable reference: {reference}")));
    }

    let mut parts = Parts::default();
    parts.scheme = base.scheme().cloned();

    if let Some(rest) = reference.strip_prefix("//") {
        // network-path reference: authority (and optional path) from the reference
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        parts.authority = Some(parse_authority(authority)?);
        parts.path_and_query = Some(parse_path(path)?);
    } else {
        parts.authority = base.authority().cloned();
        parts.path_and_query = Some(if reference.starts_with('/') {
            parse_path(reference)?
        } else if reference.starts_with('?') {
            parse_path(&format!("{}{}", base.path(), reference))?
        } else {
            // relative path: merge onto the base path's directory
            let base_path = base.path();
            let dir = match base_path.rfind('/') {
                Some(idx) => &base_path[..=idx],
                None => "/",
            };
            parse_path(&remove_dot_segments(&format!("{dir}{reference}")))?
        });
    }

    Uri::from_parts(parts).map_err(|err| Error::InvalidUri(err.to_string()))
}

// RFC 3986: scheme = ALPHA *( ALPHA / DIGIT / "+" / "-" / "." ) ":"
fn has_scheme(reference: &str) -> bool {
    match reference.split_once(':') {
        Some((scheme, _)) if !scheme.is_empty() => {
            scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}

fn parse_authority(authority: &str) -> Result<Authority, Error> {
    authority
        .parse()
        .map_err(|_| Error::InvalidUri(format!("invalid authority: {authority}")))
}

fn parse_path(path: &str) -> Result<PathAndQuery, Error> {
    path.parse()
        .map_err(|_| Error::InvalidUri(format!("invalid path: {path}")))
}

fn remove_dot_segments(path: &str) -> String {
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let mut resolved = out.join("/");
    if !resolved.starts_with('/') {
        resolved.insert(0, '/');
    }
    if path.ends_with("/.") || path.ends_with("/..") {
        resolved.push('/');
    }
    match query {
        Some(query) => format!("{resolved}?{query}"),
        None => resolved,
    }
}
