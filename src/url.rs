//! Canonical request URLs.
//!
//! The core only needs the parts of a URL that influence peer selection and
//! cache keying: scheme, host, port and the raw path. Canonicalisation
//! lowercases the scheme and host and fills in the scheme default port; the
//! path is preserved byte-exactly because cache keys must not collapse
//! distinct resources.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Default port for a (lowercased) scheme.
fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" => 443,
        "gopher" => 70,
        "wais" => 210,
        "ftp" => 21,
        _ => 80,
    }
}

/// A canonicalised request URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUrl {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl RequestUrl {
    /// Builds a canonical URL from parts. `port == None` selects the scheme
    /// default.
    pub fn new(scheme: &str, host: &str, port: Option<u16>, path: &str) -> Self {
        let scheme = scheme.to_ascii_lowercase();
        let port = port.unwrap_or_else(|| default_port(&scheme));
        RequestUrl {
            host: host.to_ascii_lowercase(),
            port,
            path: path.to_string(),
            scheme,
        }
    }

    /// Parses an absolute URL of the form `scheme://host[:port]/path`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (scheme, rest) = raw.split_once("://")?;
        if scheme.is_empty() {
            return None;
        }
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
                (h, Some(p.parse().ok()?))
            }
            _ => (authority, None),
        };
        if host.is_empty() {
            return None;
        }
        Some(RequestUrl::new(scheme, host, port, path))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the port is the scheme default (elided when printing).
    fn default_ported(&self) -> bool {
        self.port == default_port(&self.scheme)
    }
}

impl fmt::Display for RequestUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default_ported() {
            write!(f, "{}://{}{}", self.scheme, self.host, self.path)
        } else {
            write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }
}
