//! The request context a selector works from.
//!
//! The core treats the HTTP transaction as opaque except for the handful of
//! facts that drive selection: the canonical URL, the method token, a small
//! set of flags, the client addresses, and an optional pinned-connection
//! handle. The access-log handle is carried through untouched so the host
//! can correlate destinations with its own log records.

use std::net::{IpAddr, SocketAddr};

use crate::fingerprint::Fingerprint;
use crate::peers::PeerId;

/// Request flags that influence routing decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    /// The request may traverse the cache hierarchy (GETs, mostly).
    pub hierarchical: bool,
    /// The response may be stored and shared.
    pub cacheable: bool,
    /// A forwarding loop was detected; going direct is the only way out.
    pub loop_detected: bool,
    /// Acceleration mode; going direct is not an option.
    pub no_direct: bool,
    /// The connection was intercepted rather than explicitly proxied.
    pub intercepted: bool,
    /// A redirector rewrote the URL.
    pub redirected: bool,
    /// The Host header was verified against the intercepted destination.
    pub host_verified: bool,
    /// Outgoing connections must spoof the client address (TPROXY).
    pub spoof_client_ip: bool,
}

/// A client connection already bound to one upstream. Requests carrying this
/// must reuse that upstream (the forwarder knows which socket that is).
#[derive(Debug, Clone, Copy)]
pub struct PinnedConnection {
    /// The peer the connection is pinned to, if it is a configured peer.
    pub peer: Option<PeerId>,
}

/// Opaque host-side access log correlation token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessLogHandle(pub u64);

/// Everything the core reads from one client request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: String,
    pub url: crate::url::RequestUrl,
    pub flags: RequestFlags,
    pub pinned: Option<PinnedConnection>,
    /// Client source address; needed for TPROXY family checks and sourcehash.
    pub client_addr: Option<IpAddr>,
    /// Original destination of an intercepted connection.
    pub client_original_dst: Option<SocketAddr>,
    /// Authenticated user, when known; drives userhash selection.
    pub username: Option<String>,
    pub log: AccessLogHandle,
}

impl RequestContext {
    pub fn new(method: &str, url: crate::url::RequestUrl) -> Self {
        RequestContext {
            method: method.to_string(),
            url,
            flags: RequestFlags::default(),
            pinned: None,
            client_addr: None,
            client_original_dst: None,
            username: None,
            log: AccessLogHandle::default(),
        }
    }
}

/// Where a cache entry stands with respect to peer probing. Written by the
/// selector, read by the cache layer so concurrent hits on the same object
/// do not start a second ping round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    None,
    Waiting,
    Done,
}

/// The slice of a cache entry the selector coordinates with.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: Fingerprint,
    pub ping_status: PingStatus,
}

impl CacheEntry {
    pub fn new(key: Fingerprint) -> Self {
        CacheEntry {
            key,
            ping_status: PingStatus::None,
        }
    }
}
