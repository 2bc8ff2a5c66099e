//! HTCP support.
//!
//! HTCP datagrams are opaque to the core: the host plugs in an [`HtcpCodec`]
//! that turns a URL into a TST query and a reply datagram back into the
//! little the selector cares about: did the peer have it, and how far does
//! it think the origin is.

use std::net::SocketAddr;

/// The decoded form of an HTCP reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HtcpReply {
    /// Whether the peer holds a usable copy.
    pub hit: bool,
    /// Peer-measured RTT to the origin, milliseconds.
    pub rtt_ms: Option<f64>,
    /// Peer-measured hop count to the origin.
    pub hops: Option<f64>,
}

/// Host-provided wire codec for HTCP peers.
pub trait HtcpCodec {
    /// Encodes a TST query for `url`, tagged with `reqnum` so the reply can
    /// be matched back.
    fn encode_query(&self, reqnum: u32, url: &str) -> Vec<u8>;

    /// Decodes a reply datagram into its transaction tag and verdict.
    /// `None` means the datagram was malformed or not a reply.
    fn decode_reply(&self, from: SocketAddr, datagram: &[u8]) -> Option<(u32, HtcpReply)>;
}

/// Codec for deployments without HTCP peers: encodes nothing, decodes
/// nothing.
#[derive(Debug, Default)]
pub struct NoHtcp;

impl HtcpCodec for NoHtcp {
    fn encode_query(&self, _reqnum: u32, _url: &str) -> Vec<u8> {
        Vec::new()
    }

    fn decode_reply(&self, _from: SocketAddr, _datagram: &[u8]) -> Option<(u32, HtcpReply)> {
        None
    }
}
