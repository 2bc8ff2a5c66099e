//! The peer registry: every upstream cache we may consult, with its scoping
//! rules and health.
//!
//! Peers live in a slab for the lifetime of a registry generation and are
//! addressed by [`PeerId`]. Selectors never hold peer references, only ids,
//! so a registry swapped out underneath a long-running selection simply makes
//! stale ids resolve to `None`.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::{Config, PeerConfig, PeerFlagsConfig, PeerKind};
use crate::request::RequestContext;
use crate::url::RequestUrl;

pub mod selection;

/// Index of a peer in the registry slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) u32);

/// One domain scoping rule: a host suffix, allowed or denied.
#[derive(Debug, Clone)]
struct DomainRule {
    suffix: String,
    allow: bool,
}

impl DomainRule {
    fn parse(raw: &str) -> Self {
        let (allow, suffix) = match raw.strip_prefix('!') {
            Some(rest) => (false, rest),
            None => (true, raw),
        };
        DomainRule {
            suffix: suffix.trim_start_matches('.').to_ascii_lowercase(),
            allow,
        }
    }

    fn matches(&self, host: &str) -> bool {
        host == self.suffix
            || (host.len() > self.suffix.len()
                && host.ends_with(&self.suffix)
                && host.as_bytes()[host.len() - self.suffix.len() - 1] == b'.')
    }
}

/// Liveness bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct PeerHealth {
    alive: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// Smoothed reply RTT, fed into ping round timeouts.
    rtt_avg_ms: Option<u32>,
}

impl Default for PeerHealth {
    fn default() -> Self {
        PeerHealth {
            alive: true,
            consecutive_failures: 0,
            last_failure: None,
            rtt_avg_ms: None,
        }
    }
}

impl PeerHealth {
    pub fn alive(&self) -> bool {
        self.alive
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn rtt_avg_ms(&self) -> Option<u32> {
        self.rtt_avg_ms
    }
}

/// A configured upstream peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub host: String,
    pub addr: IpAddr,
    pub kind: PeerKind,
    pub http_port: u16,
    pub udp_port: u16,
    pub weight: u32,
    pub base_rtt_ms: u32,
    pub flags: PeerFlagsConfig,
    domains: Vec<DomainRule>,
    type_rules: Vec<(DomainRule, PeerKind)>,
    health: PeerHealth,
    /// Round-robin pick counter, shared by the plain and weighted selectors.
    pub(crate) rr_count: u64,
}

impl Peer {
    fn from_config(cfg: &PeerConfig) -> Self {
        Peer {
            host: cfg.host.to_ascii_lowercase(),
            addr: cfg.addr,
            kind: cfg.kind,
            http_port: cfg.http_port,
            udp_port: cfg.udp_port,
            weight: cfg.weight.max(1),
            base_rtt_ms: cfg.base_rtt_ms,
            flags: cfg.flags,
            domains: cfg.domains.iter().map(|d| DomainRule::parse(d)).collect(),
            type_rules: cfg
                .neighbor_type_domains
                .iter()
                .map(|r| (DomainRule::parse(&r.domain), r.kind))
                .collect(),
            health: PeerHealth::default(),
            rr_count: 0,
        }
    }

    /// Whether the peer's domain rules admit the host. First match wins; an
    /// empty rule list admits everything; with no match the verdict is the
    /// negation of the last rule (a deny-list admits unlisted hosts, an
    /// allow-list rejects them).
    pub fn domain_allows(&self, host: &str) -> bool {
        let mut fallthrough = true;
        for rule in &self.domains {
            if rule.matches(host) {
                return rule.allow;
            }
            fallthrough = !rule.allow;
        }
        fallthrough
    }

    /// Effective peer kind for this URL, honouring per-domain overrides.
    pub fn neighbor_type(&self, url: &RequestUrl) -> PeerKind {
        for (rule, kind) in &self.type_rules {
            if rule.matches(url.host()) {
                return *kind;
            }
        }
        self.kind
    }

    pub fn health(&self) -> &PeerHealth {
        &self.health
    }
}

/// All configured peers plus the health policy knobs they share.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    fail_limit: u32,
    cooldown: Duration,
}

impl PeerRegistry {
    pub fn from_config(config: &Config) -> Self {
        PeerRegistry {
            peers: config.peers.iter().map(Peer::from_config).collect(),
            fail_limit: config.peer_fail_limit.max(1),
            cooldown: Duration::from_secs(config.peer_cooldown_secs),
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.0 as usize)
    }

    pub(crate) fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id.0 as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &Peer)> {
        self.peers
            .iter()
            .enumerate()
            .map(|(i, p)| (PeerId(i as u32), p))
    }

    /// Looks a peer up by the source address of one of its replies.
    pub fn peer_by_addr(&self, addr: IpAddr) -> Option<PeerId> {
        self.iter().find(|(_, p)| p.addr == addr).map(|(id, _)| id)
    }

    /// Whether the peer is usable at all right now: alive, or silent long
    /// enough that a revival probe is due.
    pub fn usable(&self, peer: &Peer, now: Instant) -> bool {
        if peer.health.alive {
            return true;
        }
        match peer.health.last_failure {
            Some(when) => now.saturating_duration_since(when) >= self.cooldown,
            None => true,
        }
    }

    /// Whether this peer would be sent an ICP/HTCP query for the request.
    pub fn eligible_for_ping(&self, peer: &Peer, request: &RequestContext, now: Instant) -> bool {
        if peer.flags.no_query || peer.udp_port == 0 {
            return false;
        }
        if !peer.domain_allows(request.url.host()) {
            return false;
        }
        // a sibling can only ever satisfy a cache hit
        if peer.neighbor_type(&request.url) == PeerKind::Sibling
            && !(request.flags.hierarchical && request.flags.cacheable)
        {
            return false;
        }
        self.usable(peer, now)
    }

    /// Whether HTTP requests may be forwarded to this peer at all.
    pub fn eligible_for_http(&self, peer: &Peer, request: &RequestContext, now: Instant) -> bool {
        if !peer.domain_allows(request.url.host()) {
            return false;
        }
        if peer.neighbor_type(&request.url) == PeerKind::Sibling && !request.flags.hierarchical {
            return false;
        }
        self.usable(peer, now)
    }

    /// Number of peers a ping round for this request would query.
    pub fn neighbors_count(&self, request: &RequestContext, now: Instant) -> usize {
        self.iter()
            .filter(|(_, p)| self.eligible_for_ping(p, request, now))
            .count()
    }

    /// A reply arrived from the peer: it is alive, and its RTT estimate
    /// absorbs the new sample.
    pub fn note_reply(&mut self, id: PeerId, rtt_ms: Option<u32>) {
        let Some(peer) = self.get_mut(id) else { return };
        if !peer.health.alive {
            tracing::info!(peer = %peer.host, "peer is back alive");
        }
        peer.health.alive = true;
        peer.health.consecutive_failures = 0;
        if let Some(sample) = rtt_ms {
            peer.health.rtt_avg_ms = Some(match peer.health.rtt_avg_ms {
                // exponential smoothing, 1/8 step
                Some(avg) => avg - avg / 8 + sample / 8,
                None => sample,
            });
        }
    }

    /// The peer was queried and stayed silent for a whole round (or a send
    /// to it failed fatally). Enough of these in a row put it in cooldown.
    pub fn note_failure(&mut self, id: PeerId, now: Instant) {
        let fail_limit = self.fail_limit;
        let Some(peer) = self.get_mut(id) else { return };
        peer.health.consecutive_failures = peer.health.consecutive_failures.saturating_add(1);
        peer.health.last_failure = Some(now);
        if peer.health.alive && peer.health.consecutive_failures >= fail_limit {
            peer.health.alive = false;
            tracing::warn!(
                peer = %peer.host,
                failures = peer.health.consecutive_failures,
                "peer detected dead, entering cooldown"
            );
        }
    }
}
