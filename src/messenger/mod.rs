//! Query bookkeeping for the shared ICP/HTCP sockets.
//!
//! All selectors share two process-wide UDP sockets. The messenger owns the
//! pieces that make that sharing safe: the monotonically increasing query
//! number, the reqnum-to-selector index replies are matched through, and the
//! per-socket back-pressure queue for datagrams the socket would not take.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::selector::SelectorId;

pub mod htcp;
pub mod icp;

/// Which shared socket a datagram belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Icp,
    Htcp,
}

impl Proto {
    fn index(self) -> usize {
        match self {
            Proto::Icp => 0,
            Proto::Htcp => 1,
        }
    }
}

/// One datagram bound for a peer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub proto: Proto,
    pub to: SocketAddr,
    pub payload: Bytes,
}

/// A reply funneled back to a selector, whichever protocol carried it.
#[derive(Debug, Clone)]
pub enum PingReply {
    Icp(icp::IcpHeader),
    Htcp(htcp::HtcpReply),
}

#[derive(Debug, Clone, Copy)]
struct ReqEntry {
    selector: SelectorId,
    issued: Instant,
}

/// Shared-socket state: reqnum allocation and matching, send queues.
#[derive(Debug)]
pub struct Messenger {
    next_reqnum: u32,
    ttl: Duration,
    index: HashMap<u32, ReqEntry>,
    pending: [VecDeque<Datagram>; 2],
}

impl Messenger {
    pub fn new(reqnum_ttl: Duration) -> Self {
        Messenger {
            next_reqnum: 0,
            ttl: reqnum_ttl,
            index: HashMap::new(),
            pending: [VecDeque::new(), VecDeque::new()],
        }
    }

    /// Allocates the query number for a ping round and indexes it to the
    /// selector. The counter wraps; matching is equality-only and entries
    /// expire, so a wrapped number cannot resurrect an old round.
    pub fn alloc_reqnum(&mut self, selector: SelectorId, now: Instant) -> u32 {
        self.sweep(now);
        self.next_reqnum = self.next_reqnum.wrapping_add(1);
        if self.next_reqnum == 0 {
            self.next_reqnum = 1;
        }
        let reqnum = self.next_reqnum;
        self.index.insert(reqnum, ReqEntry { selector, issued: now });
        reqnum
    }

    /// The selector a reply with this query number belongs to, if the
    /// number is known and still fresh.
    pub fn resolve(&self, reqnum: u32, now: Instant) -> Option<SelectorId> {
        let entry = self.index.get(&reqnum)?;
        if now.saturating_duration_since(entry.issued) > self.ttl {
            return None;
        }
        Some(entry.selector)
    }

    /// Drops every index entry owned by a finished selector.
    pub fn forget_selector(&mut self, selector: SelectorId) {
        self.index.retain(|_, entry| entry.selector != selector);
    }

    fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.index
            .retain(|_, entry| now.saturating_duration_since(entry.issued) <= ttl);
    }

    /// Hands a datagram to the socket layer. Returns it for an immediate
    /// send attempt when nothing is queued ahead of it; otherwise it joins
    /// the queue so ordering is preserved.
    pub fn send(&mut self, datagram: Datagram) -> Option<Datagram> {
        let queue = &mut self.pending[datagram.proto.index()];
        if queue.is_empty() {
            return Some(datagram);
        }
        queue.push_back(datagram);
        None
    }

    /// The socket refused the datagram (transient). It goes back to the
    /// front of the queue and is retried when the socket turns writable.
    pub fn note_send_blocked(&mut self, datagram: Datagram) {
        tracing::debug!(proto = ?datagram.proto, to = %datagram.to, "send blocked, queueing");
        self.pending[datagram.proto.index()].push_front(datagram);
    }

    /// Next queued datagram to retry on a writable socket.
    pub fn next_pending(&mut self, proto: Proto) -> Option<Datagram> {
        self.pending[proto.index()].pop_front()
    }

    pub fn has_pending(&self, proto: Proto) -> bool {
        !self.pending[proto.index()].is_empty()
    }
}
