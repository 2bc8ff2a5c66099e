//! ICP v2 wire codec.
//!
//! The header is a fixed 20-byte layout, network byte order throughout:
//!
//! ```text
//! opcode:u8 version:u8 length:u16 reqnum:u32 flags:u32 pad:u32 shostid:u32
//! ```
//!
//! Queries carry a 4-byte requester-host field between the header and the
//! NUL-terminated URL; replies go straight to the URL. `reqnum` is echoed by
//! peers bit-exactly and is the only thing that ties a reply to a query.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed header size on the wire.
pub const HEADER_LEN: usize = 20;

/// The protocol version this cache speaks.
pub const ICP_VERSION: u8 = 2;

/// Reply carries the whole object (never sent by us, recognised on decode).
pub const FLAG_HIT_OBJ: u32 = 0x8000_0000;

/// Query asks for, and a reply carries, an RTT measurement in `pad`.
pub const FLAG_SRC_RTT: u32 = 0x4000_0000;

/// The message kinds this cache sends or understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Invalid = 0,
    Query = 1,
    Hit = 2,
    Miss = 3,
    Err = 4,
    /// Source-echo: a probe bounced off an origin's UDP echo port.
    Secho = 9,
    /// Dumb-cache echo: a peer that cannot answer queries echoes them.
    Decho = 10,
    MissNofetch = 21,
    Denied = 22,
}

impl Opcode {
    /// Maps a wire byte to an opcode; anything unrecognised is `Invalid`.
    pub fn from_wire(byte: u8) -> Opcode {
        match byte {
            1 => Opcode::Query,
            2 => Opcode::Hit,
            3 => Opcode::Miss,
            4 => Opcode::Err,
            9 => Opcode::Secho,
            10 => Opcode::Decho,
            21 => Opcode::MissNofetch,
            22 => Opcode::Denied,
            _ => Opcode::Invalid,
        }
    }
}

/// Decode failures. The peer is not billed a reply for any of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than the ICP header")]
    Truncated(usize),

    #[error("length field {length} exceeds the {received} bytes received")]
    LengthOverrun { length: u16, received: usize },

    #[error("URL is not NUL-terminated")]
    UnterminatedUrl,
}

/// A decoded ICP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcpHeader {
    pub opcode: Opcode,
    pub version: u8,
    pub length: u16,
    pub reqnum: u32,
    pub flags: u32,
    pub pad: u32,
    pub shostid: u32,
}

impl IcpHeader {
    /// The RTT measurement a peer packed into `pad`, when it offered one:
    /// low half RTT in milliseconds, high half hop count.
    pub fn rtt_hint(&self) -> Option<(u16, u16)> {
        if self.flags & FLAG_SRC_RTT == 0 {
            return None;
        }
        let rtt = (self.pad & 0xFFFF) as u16;
        let hops = (self.pad >> 16) as u16;
        if rtt == 0 || rtt == u16::MAX {
            return None;
        }
        Some((rtt, hops))
    }
}

fn encode(opcode: Opcode, reqnum: u32, flags: u32, pad: u32, url: &str) -> Bytes {
    let query = opcode == Opcode::Query;
    let mut len = HEADER_LEN + url.len() + 1;
    if query {
        len += 4;
    }

    let mut buf = BytesMut::with_capacity(len);
    buf.put_u8(opcode as u8);
    buf.put_u8(ICP_VERSION);
    buf.put_u16(len as u16);
    buf.put_u32(reqnum);
    buf.put_u32(flags);
    buf.put_u32(pad);
    buf.put_u32(0); // shostid, unused
    if query {
        buf.put_u32(0); // requester host, unused by every known peer
    }
    buf.put_slice(url.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Builds a QUERY datagram.
pub fn build_query(reqnum: u32, flags: u32, url: &str) -> Bytes {
    encode(Opcode::Query, reqnum, flags, 0, url)
}

/// Builds a reply datagram (server side of the protocol).
pub fn build_reply(opcode: Opcode, reqnum: u32, flags: u32, pad: u32, url: &str) -> Bytes {
    encode(opcode, reqnum, flags, pad, url)
}

/// Splits a datagram into its header and payload. The payload still carries
/// the requester-host field for queries.
pub fn decode(datagram: &[u8]) -> Result<(IcpHeader, Bytes), WireError> {
    if datagram.len() < HEADER_LEN {
        return Err(WireError::Truncated(datagram.len()));
    }

    let mut buf = datagram;
    let header = IcpHeader {
        opcode: Opcode::from_wire(buf.get_u8()),
        version: buf.get_u8(),
        length: buf.get_u16(),
        reqnum: buf.get_u32(),
        flags: buf.get_u32(),
        pad: buf.get_u32(),
        shostid: buf.get_u32(),
    };

    if header.length as usize > datagram.len() {
        return Err(WireError::LengthOverrun {
            length: header.length,
            received: datagram.len(),
        });
    }
    // a length field that cannot even cover the header is equally bogus
    if (header.length as usize) < HEADER_LEN {
        return Err(WireError::Truncated(header.length as usize));
    }

    let payload = Bytes::copy_from_slice(&datagram[HEADER_LEN..header.length as usize]);
    Ok((header, payload))
}

/// Extracts the NUL-terminated URL from a reply payload.
pub fn payload_url(payload: &[u8]) -> Result<&str, WireError> {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::UnterminatedUrl)?;
    std::str::from_utf8(&payload[..end]).map_err(|_| WireError::UnterminatedUrl)
}

/// Picks the reply opcode for a query against the local store (server side).
/// `have_fresh` is whether a fresh object exists; `have_stale` whether a
/// stale one does; `reachable` is the origin reachability estimate, when the
/// distance database has one.
pub fn reply_opcode(
    have_fresh: bool,
    have_stale: bool,
    hit_stale_ok: bool,
    test_reachability: bool,
    reachable: Option<bool>,
) -> Opcode {
    if have_fresh || (have_stale && hit_stale_ok) {
        return Opcode::Hit;
    }
    if test_reachability && reachable == Some(false) {
        return Opcode::MissNofetch;
    }
    Opcode::Miss
}
