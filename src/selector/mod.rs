//! The peer selector: one state machine per request.
//!
//! A selector classifies the request's direct policy (parking on the ACL
//! gate when needed), runs at most one ICP/HTCP ping round, walks the
//! configured parent-selection chain, and resolves the resulting
//! [`fwd::FwdServer`] chain into concrete destinations, streaming each one
//! to its initiator. It self-destructs after the terminal
//! `note_destinations_end`, or silently when the initiator loses interest.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::acl::{Answer, DirectPolicy};
use crate::config::{Config, PeerKind};
use crate::core::{Action, Deps, DigestGuess, Flow};
use crate::messenger::{icp, Datagram, PingReply, Proto};
use crate::peers::{selection, PeerId};
use crate::request::{CacheEntry, PingStatus, RequestContext};

pub mod fwd;

pub use fwd::{FwdChain, FwdServer, HierCode};

/// Generation-tagged selector handle. Stale handles (the selector finished
/// or was replaced) simply stop resolving; that is the cancellation signal
/// for every queued callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SelectorId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for SelectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "selector{}.{}", self.slot, self.generation)
    }
}

/// Failures reported through `note_destinations_end`, and only when a
/// selection produced zero destinations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("DNS failure for {host}: {detail}")]
    DnsFail { host: String, detail: String },

    /// Policy admitted no route at all: direct is forbidden or unusable and
    /// no parent qualifies.
    #[error("no forwarding destinations found")]
    NoForward,
}

/// A resolved destination handed to the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub addr: SocketAddr,
    /// The selected peer; `None` for origin servers.
    pub peer: Option<PeerId>,
    pub code: HierCode,
    /// Configured outgoing address to bind before connecting.
    pub outgoing: Option<IpAddr>,
}

/// Whoever asked for destinations. `note_destination` is called once per
/// destination found (in order), then `note_destinations_end` exactly once.
/// A `None` destination means "use the pinned connection". The error is
/// `Some` exactly when no destination was delivered. Once `subscribed`
/// turns false, no further calls are made, ever.
pub trait PeerSelectionInitiator: Send {
    fn subscribed(&self) -> bool {
        true
    }

    fn note_destination(&mut self, destination: Option<Destination>);

    fn note_destinations_end(&mut self, error: Option<SelectionError>);
}

/// The direct-policy verdict axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectState {
    Unknown,
    No,
    Maybe,
    Yes,
}

impl DirectState {
    fn as_str(self) -> &'static str {
        match self {
            DirectState::Unknown => "DIRECT_UNKNOWN",
            DirectState::No => "DIRECT_NO",
            DirectState::Maybe => "DIRECT_MAYBE",
            DirectState::Yes => "DIRECT_YES",
        }
    }
}

/// Accounting for one ping round.
#[derive(Debug)]
pub(crate) struct PingRound {
    start: Option<Instant>,
    stop: Option<Instant>,
    timeout: Duration,
    reqnum: u32,
    n_sent: u32,
    n_recv: u32,
    n_replies_expected: u32,
    timed_out: bool,
    /// Peers queried this round; silent ones are billed a failure at close.
    queried: Vec<PeerId>,
    replied: Vec<PeerId>,
    /// Best weighted first-miss witness.
    first_parent_miss: Option<IpAddr>,
    w_rtt: u32,
    /// Best RTT-hinted miss witness.
    closest_parent_miss: Option<IpAddr>,
    p_rtt: u32,
    /// Wheel registration deadline; `None` when not registered.
    monitor_registration: Option<Instant>,
}

impl PingRound {
    fn new() -> Self {
        PingRound {
            start: None,
            stop: None,
            timeout: Duration::from_millis(1),
            reqnum: 0,
            n_sent: 0,
            n_recv: 0,
            n_replies_expected: 0,
            timed_out: false,
            queried: Vec::new(),
            replied: Vec::new(),
            first_parent_miss: None,
            w_rtt: 0,
            closest_parent_miss: None,
            p_rtt: 0,
            monitor_registration: None,
        }
    }
}

/// Finds peer (and origin) addresses for forwarding a single request and
/// hands each found destination to the initiator, in selection order.
pub(crate) struct PeerSelector {
    id: SelectorId,
    request: RequestContext,
    entry: Option<CacheEntry>,
    initiator: Box<dyn PeerSelectionInitiator>,
    direct: DirectState,
    always_direct: Option<Answer>,
    never_direct: Option<Answer>,
    pending_acl: Option<DirectPolicy>,
    ping: PingRound,
    hit: Option<(PeerId, PeerKind)>,
    chain: FwdChain,
    found_paths: u64,
    last_error: Option<SelectionError>,
    resolving_host: Option<String>,
}

impl PeerSelector {
    pub(crate) fn new(
        id: SelectorId,
        request: RequestContext,
        entry: Option<CacheEntry>,
        initiator: Box<dyn PeerSelectionInitiator>,
    ) -> Self {
        PeerSelector {
            id,
            request,
            entry,
            initiator,
            direct: DirectState::Unknown,
            always_direct: None,
            never_direct: None,
            pending_acl: None,
            ping: PingRound::new(),
            hit: None,
            chain: FwdChain::new(),
            found_paths: 0,
            last_error: None,
            resolving_host: None,
        }
    }

    pub(crate) fn ping_waiting(&self) -> bool {
        self.entry
            .as_ref()
            .is_some_and(|e| e.ping_status == PingStatus::Waiting)
    }

    fn url_host(&self) -> &str {
        self.request.url.host()
    }

    /// Whether the initiator is gone or has lost interest.
    fn aborted(&self) -> bool {
        !self.initiator.subscribed()
    }

    /// Releases every external registration. Run on every terminal path.
    fn cleanup(&mut self, deps: &mut Deps<'_>) {
        if let Some(deadline) = self.ping.monitor_registration.take() {
            if let Some(cmd) = deps.wheel.forget(self.id, deadline) {
                deps.actions.push_back(Action::Timer(cmd));
            }
        }
        deps.messenger.forget_selector(self.id);
        if let Some(entry) = &mut self.entry {
            entry.ping_status = PingStatus::Done;
        }
    }

    fn abort(&mut self, deps: &mut Deps<'_>) -> Flow {
        tracing::debug!(id = %self.id, "aborting peer selection: initiator gone or lost interest");
        self.cleanup(deps);
        Flow::Done
    }

    fn wants_more(&self, cfg: &Config) -> bool {
        cfg.forward_max_tries < 0 || self.found_paths < cfg.forward_max_tries as u64
    }

    fn emit(&mut self, destination: Option<Destination>) {
        self.found_paths += 1;
        match &destination {
            Some(dest) => tracing::debug!(
                id = %self.id,
                addr = %dest.addr,
                code = %dest.code,
                destination = self.found_paths,
                "found destination"
            ),
            None => tracing::debug!(
                id = %self.id,
                destination = self.found_paths,
                "found pinned destination"
            ),
        }
        self.initiator.note_destination(destination);
    }

    fn add_selection(&mut self, peer: Option<PeerId>, code: HierCode) {
        if self.chain.push(peer, code) {
            tracing::debug!(id = %self.id, %code, ?peer, "adding destination candidate");
        }
    }

    /* entry points; each re-checks the initiator before doing anything */

    pub(crate) fn start(&mut self, deps: &mut Deps<'_>) -> Flow {
        if self.aborted() {
            return self.abort(deps);
        }
        tracing::debug!(
            id = %self.id,
            method = %self.request.method,
            url = %self.request.url,
            "starting peer selection"
        );
        self.select_more(deps)
    }

    pub(crate) fn handle_acl_verdict(
        &mut self,
        deps: &mut Deps<'_>,
        policy: DirectPolicy,
        answer: Answer,
    ) -> Flow {
        if self.aborted() {
            return self.abort(deps);
        }
        if self.pending_acl != Some(policy) {
            tracing::debug!(id = %self.id, ?policy, "ignoring stale policy verdict");
            return Flow::Park;
        }
        self.pending_acl = None;

        let stored = match answer {
            Answer::AuthRequired => {
                tracing::warn!(
                    id = %self.id,
                    ?policy,
                    "policy check demanded authentication; username rules are not reliable here"
                );
                Answer::Dunno
            }
            other => other,
        };
        match policy {
            DirectPolicy::AlwaysDirect => self.always_direct = Some(stored),
            DirectPolicy::NeverDirect => self.never_direct = Some(stored),
        }
        self.select_more(deps)
    }

    pub(crate) fn handle_reply(
        &mut self,
        deps: &mut Deps<'_>,
        peer: PeerId,
        reply: PingReply,
    ) -> Flow {
        if self.aborted() {
            return self.abort(deps);
        }
        if !self.ping_waiting() {
            tracing::debug!(id = %self.id, "discarding reply after the ping round closed");
            return Flow::Park;
        }

        self.ping.n_recv += 1;
        if !self.ping.replied.contains(&peer) {
            self.ping.replied.push(peer);
        }
        // the peer answered; refresh its latency estimate with this round's
        // elapsed time
        if let Some(start) = self.ping.start {
            let elapsed = deps.now.saturating_duration_since(start).as_millis() as u32;
            deps.peers.note_reply(peer, Some(elapsed.max(1)));
        }

        let kind = match deps.peers.get(peer) {
            Some(p) => p.neighbor_type(&self.request.url),
            None => {
                tracing::debug!(id = %self.id, "reply from a peer that no longer exists");
                return Flow::Park;
            }
        };

        match reply {
            PingReply::Icp(header) => {
                tracing::debug!(id = %self.id, opcode = ?header.opcode, url = %self.request.url, "ping reply");
                match header.opcode {
                    icp::Opcode::Hit => {
                        self.hit = Some((peer, kind));
                        return self.select_more(deps);
                    }
                    icp::Opcode::Miss | icp::Opcode::Decho => {
                        if kind == PeerKind::Parent {
                            self.note_parent_miss(deps, peer, header.rtt_hint());
                        }
                    }
                    _ => {} // counted, nothing more to learn
                }
            }
            PingReply::Htcp(reply) => {
                tracing::debug!(id = %self.id, hit = reply.hit, url = %self.request.url, "htcp reply");
                if reply.hit {
                    self.hit = Some((peer, kind));
                    return self.select_more(deps);
                }
                if kind == PeerKind::Parent {
                    let hint = reply
                        .rtt_ms
                        .filter(|rtt| *rtt > 0.0)
                        .map(|rtt| (rtt as u32, reply.hops.unwrap_or(0.0) as u32));
                    self.note_parent_miss_ms(deps, peer, hint);
                }
            }
        }

        if self.ping.n_recv < self.ping.n_replies_expected {
            return Flow::Park;
        }
        self.select_more(deps)
    }

    pub(crate) fn handle_ping_timeout(&mut self, deps: &mut Deps<'_>) -> Flow {
        // do nothing if the round closed while the wake-up was queued
        if !self.ping_waiting() {
            tracing::debug!(id = %self.id, "ignoring stale ping wake-up");
            return Flow::Park;
        }
        self.ping.monitor_registration = None;

        if self.aborted() {
            return self.abort(deps);
        }

        tracing::debug!(id = %self.id, url = %self.request.url, "ping round timed out");
        self.ping.timed_out = true;
        self.select_more(deps)
    }

    pub(crate) fn handle_dns_result(
        &mut self,
        deps: &mut Deps<'_>,
        host: &str,
        result: Result<Vec<IpAddr>, String>,
    ) -> Flow {
        if self.aborted() {
            return self.abort(deps);
        }
        if self.resolving_host.as_deref() != Some(host) {
            tracing::debug!(id = %self.id, host, "ignoring a lookup nobody is waiting for");
            return Flow::Park;
        }
        self.resolving_host = None;

        let Some(head) = self.chain.head().copied() else {
            return self.resolve_selected(deps);
        };

        match result {
            Ok(ips) => {
                deps.ipcache.store(host, &ips, deps.now);
                self.stream_ips(deps, &head, &ips);
            }
            Err(detail) => {
                tracing::debug!(id = %self.id, host, detail, "unknown host");
                // an older error is superseded either way; only a failed
                // origin lookup is worth reporting
                self.last_error = None;
                if head.code == HierCode::HierDirect {
                    self.last_error = Some(SelectionError::DnsFail {
                        host: host.to_string(),
                        detail,
                    });
                }
            }
        }

        self.chain.pop();
        self.resolve_selected(deps)
    }

    /* direct-policy classification */

    fn check_policy(&mut self, deps: &mut Deps<'_>, policy: DirectPolicy) -> Flow {
        tracing::debug!(
            id = %self.id,
            direct = self.direct.as_str(),
            ?policy,
            "parking on the policy gate"
        );
        self.pending_acl = Some(policy);
        deps.actions.push_back(Action::CheckAcl {
            selector: self.id,
            policy,
            request: self.request.clone(),
        });
        Flow::Park
    }

    /// Distance-database shortcut: close-enough origins are fetched direct,
    /// as are origins we are closer to than the best-miss parent.
    fn check_netdb_direct(&self, deps: &Deps<'_>) -> bool {
        if self.direct == DirectState::No {
            return false;
        }

        let my_rtt = deps.netdb.host_rtt(self.url_host());
        if let Some(rtt) = my_rtt {
            if rtt > 0 && rtt <= deps.cfg.minimum_direct_rtt {
                return true;
            }
        }

        if let Some(hops) = deps.netdb.host_hops(self.url_host()) {
            if hops > 0 && hops <= deps.cfg.minimum_direct_hops {
                return true;
            }
        }

        if self.ping.closest_parent_miss.is_some() && self.ping.p_rtt > 0 {
            if let Some(rtt) = my_rtt {
                if rtt > 0 && rtt <= self.ping.p_rtt {
                    return true;
                }
            }
        }

        false
    }

    /* the selection loop */

    fn select_more(&mut self, deps: &mut Deps<'_>) -> Flow {
        if self.aborted() {
            return self.abort(deps);
        }

        if self.direct == DirectState::Unknown {
            match self.always_direct {
                None => return self.check_policy(deps, DirectPolicy::AlwaysDirect),
                Some(Answer::Allowed) => self.direct = DirectState::Yes,
                Some(_) => {}
            }
        }
        if self.direct == DirectState::Unknown {
            match self.never_direct {
                None => return self.check_policy(deps, DirectPolicy::NeverDirect),
                Some(Answer::Allowed) => self.direct = DirectState::No,
                Some(_) => {}
            }
        }
        if self.direct == DirectState::Unknown {
            self.direct = if self.request.flags.no_direct {
                DirectState::No
            } else if self.request.flags.loop_detected {
                DirectState::Yes
            } else if self.check_netdb_direct(deps) {
                DirectState::Yes
            } else {
                DirectState::Maybe
            };
            tracing::debug!(id = %self.id, direct = self.direct.as_str(), "direct policy classified");
        }

        if self
            .entry
            .as_ref()
            .map_or(true, |e| e.ping_status == PingStatus::None)
        {
            self.select_pinned(deps);
        }

        match self.entry.as_ref().map(|e| e.ping_status) {
            None => {} // no cache entry, nothing to probe for
            Some(PingStatus::None) => {
                self.select_some_neighbor(deps);
                if self.ping_waiting() {
                    return Flow::Park;
                }
            }
            Some(PingStatus::Waiting) => {
                self.select_some_neighbor_replies(deps);
                self.close_ping_round(deps);
            }
            Some(PingStatus::Done) => {}
        }

        match self.direct {
            DirectState::Yes => self.select_some_direct(deps),
            DirectState::No => {
                self.select_some_parent(deps);
                self.select_all_parents(deps);
            }
            DirectState::Maybe | DirectState::Unknown => {
                if deps.cfg.prefer_direct {
                    self.select_some_direct(deps);
                }
                if self.request.flags.hierarchical || !deps.cfg.nonhierarchical_direct {
                    self.select_some_parent(deps);
                    self.select_all_parents(deps);
                }
                if !deps.cfg.prefer_direct {
                    self.select_some_direct(deps);
                }
            }
        }

        self.resolve_selected(deps)
    }

    /// Selects the pinned connection if the request carries one.
    fn select_pinned(&mut self, deps: &mut Deps<'_>) {
        let Some(pinned) = self.request.pinned else { return };

        let allowed = match pinned.peer.and_then(|p| deps.peers.get(p)) {
            Some(peer) => deps.peers.eligible_for_http(peer, &self.request, deps.now),
            None => self.direct != DirectState::No,
        };
        if !allowed {
            tracing::debug!(id = %self.id, "pinned upstream is prohibited for this request");
        }

        self.add_selection(pinned.peer, HierCode::Pinned);
        if let Some(entry) = &mut self.entry {
            entry.ping_status = PingStatus::Done; // skip probing
        }
    }

    /// Picks a neighbor by digest guess, distance database, or a ping
    /// round, in that order of cheapness.
    fn select_some_neighbor(&mut self, deps: &mut Deps<'_>) {
        if self.direct == DirectState::Yes {
            if let Some(entry) = &mut self.entry {
                entry.ping_status = PingStatus::Done;
            }
            return;
        }

        if let Some((peer, kind)) = self.digest_select(deps) {
            let code = match kind {
                PeerKind::Parent => HierCode::CdParentHit,
                PeerKind::Sibling => HierCode::CdSiblingHit,
            };
            self.add_selection(Some(peer), code);
        } else if let Some(peer) = self.netdb_closest_parent(deps) {
            self.add_selection(Some(peer), HierCode::ClosestParent);
        } else if self.should_ping(deps) {
            self.start_ping_round(deps);
            if self.ping.n_replies_expected > 0 {
                let deadline = deps.now + self.ping.timeout;
                if let Some(cmd) = deps.wheel.monitor(self.id, deadline) {
                    deps.actions.push_back(Action::Timer(cmd));
                }
                self.ping.monitor_registration = Some(deadline);
                if let Some(entry) = &mut self.entry {
                    entry.ping_status = PingStatus::Waiting;
                }
                return;
            }
        }

        if let Some(entry) = &mut self.entry {
            entry.ping_status = PingStatus::Done;
        }
    }

    /// Turns the collected replies (or their absence) into a selection.
    fn select_some_neighbor_replies(&mut self, deps: &mut Deps<'_>) {
        if self.check_netdb_direct(deps) {
            self.add_selection(None, HierCode::ClosestDirect);
            return;
        }

        if let Some((peer, kind)) = self.hit {
            let code = match kind {
                PeerKind::Parent => HierCode::ParentHit,
                PeerKind::Sibling => HierCode::SiblingHit,
            };
            self.add_selection(Some(peer), code);
            return;
        }

        if let Some(addr) = self.ping.closest_parent_miss {
            if let Some(peer) = deps.peers.peer_by_addr(addr) {
                self.add_selection(Some(peer), HierCode::ClosestParentMiss);
                return;
            }
        }
        if let Some(addr) = self.ping.first_parent_miss {
            if let Some(peer) = deps.peers.peer_by_addr(addr) {
                self.add_selection(Some(peer), HierCode::FirstParentMiss);
            }
        }
    }

    /// Whether this request warrants a ping round at all.
    fn should_ping(&self, deps: &Deps<'_>) -> bool {
        if !self.request.flags.hierarchical && self.direct != DirectState::No {
            return false;
        }
        if let Some(entry) = &self.entry {
            if !entry.key.is_public()
                && !deps.cfg.query_private_keys
                && self.direct != DirectState::No
            {
                return false;
            }
        }
        let count = deps.peers.neighbors_count(&self.request, deps.now);
        tracing::debug!(id = %self.id, neighbors = count, "counted ping candidates");
        count > 0
    }

    /// Sends a query to every eligible peer and sizes the reply window.
    fn start_ping_round(&mut self, deps: &mut Deps<'_>) {
        let reqnum = deps.messenger.alloc_reqnum(self.id, deps.now);
        self.ping.reqnum = reqnum;
        self.ping.start = Some(deps.now);

        let url_text = self.request.url.to_string();
        let flags = if deps.cfg.query_icmp { icp::FLAG_SRC_RTT } else { 0 };

        struct Target {
            peer: PeerId,
            to: SocketAddr,
            htcp: bool,
            rtt_avg: Option<u32>,
        }
        let targets: Vec<Target> = deps
            .peers
            .iter()
            .filter(|(_, p)| deps.peers.eligible_for_ping(p, &self.request, deps.now))
            .map(|(id, p)| Target {
                peer: id,
                to: SocketAddr::new(p.addr, p.udp_port),
                htcp: p.flags.htcp,
                rtt_avg: p.health().rtt_avg_ms(),
            })
            .collect();

        let mut rtt_sum: u64 = 0;
        let mut rtt_samples: u64 = 0;
        for target in targets {
            let payload = if target.htcp {
                let encoded = deps.htcp.encode_query(reqnum, &url_text);
                if encoded.is_empty() {
                    tracing::debug!(id = %self.id, "no HTCP codec; skipping HTCP peer");
                    continue;
                }
                bytes::Bytes::from(encoded)
            } else {
                icp::build_query(reqnum, flags, &url_text)
            };
            let datagram = Datagram {
                proto: if target.htcp { Proto::Htcp } else { Proto::Icp },
                to: target.to,
                payload,
            };
            if let Some(ready) = deps.messenger.send(datagram) {
                deps.actions.push_back(Action::Send(ready));
            }
            self.ping.n_sent += 1;
            self.ping.n_replies_expected += 1;
            self.ping.queried.push(target.peer);
            if let Some(rtt) = target.rtt_avg {
                rtt_sum += u64::from(rtt);
                rtt_samples += 1;
            }
        }

        let timeout_ms = match deps.cfg.icp_query_timeout_ms {
            Some(fixed) => fixed,
            // twice the mean measured peer latency, or the configured base
            None if rtt_samples > 0 => (rtt_sum / rtt_samples) * 2,
            None => deps.cfg.ping_timeout_base_ms,
        };
        self.ping.timeout = Duration::from_millis(timeout_ms.max(1));

        tracing::debug!(
            id = %self.id,
            reqnum = self.ping.reqnum,
            sent = self.ping.n_sent,
            expected = self.ping.n_replies_expected,
            timeout_ms = self.ping.timeout.as_millis() as u64,
            "ping round started"
        );
    }

    /// Unregisters from the wheel, bills silent peers, marks the round done.
    fn close_ping_round(&mut self, deps: &mut Deps<'_>) {
        if let Some(deadline) = self.ping.monitor_registration.take() {
            if let Some(cmd) = deps.wheel.forget(self.id, deadline) {
                deps.actions.push_back(Action::Timer(cmd));
            }
        }
        self.ping.stop = Some(deps.now);
        if let Some(entry) = &mut self.entry {
            entry.ping_status = PingStatus::Done;
        }

        let silent: Vec<PeerId> = self
            .ping
            .queried
            .iter()
            .copied()
            .filter(|p| !self.ping.replied.contains(p))
            .collect();
        for peer in silent {
            deps.peers.note_failure(peer, deps.now);
        }
    }

    /// Parent-miss bookkeeping for an ICP reply (RTT hint in wire units).
    fn note_parent_miss(&mut self, deps: &mut Deps<'_>, peer: PeerId, hint: Option<(u16, u16)>) {
        self.note_parent_miss_ms(deps, peer, hint.map(|(rtt, hops)| (u32::from(rtt), u32::from(hops))));
    }

    fn note_parent_miss_ms(
        &mut self,
        deps: &mut Deps<'_>,
        peer: PeerId,
        hint: Option<(u32, u32)>,
    ) {
        let Some(info) = deps.peers.get(peer) else { return };
        let (peer_addr, peer_host, closest_only, base_rtt, weight) = (
            info.addr,
            info.host.clone(),
            info.flags.closest_only,
            info.base_rtt_ms,
            info.weight,
        );

        if deps.cfg.query_icmp {
            if let Some((rtt, hops)) = hint {
                deps.netdb.update_peer(self.request.url.host(), &peer_host, rtt, hops);
                if rtt > 0 && (self.ping.p_rtt == 0 || rtt < self.ping.p_rtt) {
                    self.ping.closest_parent_miss = Some(peer_addr);
                    self.ping.p_rtt = rtt;
                }
            }
        }

        // closest-only peers opt out of the first-miss fallback
        if closest_only {
            return;
        }
        // a closest-miss witness beats any first-miss witness
        if self.ping.closest_parent_miss.is_some() {
            return;
        }

        let elapsed = self
            .ping
            .start
            .map(|start| deps.now.saturating_duration_since(start).as_millis() as u32)
            .unwrap_or(0);
        let rtt = (elapsed.saturating_sub(base_rtt) / weight.max(1)).max(1);
        if self.ping.first_parent_miss.is_none() || rtt < self.ping.w_rtt {
            self.ping.first_parent_miss = Some(peer_addr);
            self.ping.w_rtt = rtt;
        }
    }

    /* cheap pre-ping selections */

    fn digest_select(&self, deps: &Deps<'_>) -> Option<(PeerId, PeerKind)> {
        let key = self.entry.as_ref()?.key;
        for (id, peer) in deps.peers.iter() {
            if !deps.peers.eligible_for_http(peer, &self.request, deps.now) {
                continue;
            }
            if deps.digests.lookup(peer, &key) == DigestGuess::Hit {
                return Some((id, peer.neighbor_type(&self.request.url)));
            }
        }
        None
    }

    fn netdb_closest_parent(&self, deps: &Deps<'_>) -> Option<PeerId> {
        let (peer_host, best_rtt) = deps.netdb.best_peer(self.url_host())?;
        // if we are closer ourselves, the direct path will win instead
        if let Some(my_rtt) = deps.netdb.host_rtt(self.url_host()) {
            if my_rtt > 0 && my_rtt <= best_rtt {
                return None;
            }
        }
        deps.peers
            .iter()
            .find(|(_, p)| {
                p.host == peer_host
                    && p.neighbor_type(&self.request.url) == PeerKind::Parent
                    && deps.peers.eligible_for_http(p, &self.request, deps.now)
            })
            .map(|(id, _)| id)
    }

    /* the policy chain */

    fn select_some_direct(&mut self, _deps: &mut Deps<'_>) {
        if self.direct == DirectState::No {
            return;
        }
        // WAIS has no native client; a parent must translate
        if self.request.url.scheme() == "wais" {
            return;
        }
        self.add_selection(None, HierCode::HierDirect);
    }

    fn select_some_parent(&mut self, deps: &mut Deps<'_>) {
        if self.direct == DirectState::Yes {
            return;
        }
        let now = deps.now;

        let picked = if let Some(p) = selection::sourcehash_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::SourcehashParent))
        } else if let Some(p) = selection::userhash_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::UserhashParent))
        } else if let Some(p) = selection::carp_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::Carp))
        } else if let Some(p) = selection::round_robin_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::RoundrobinParent))
        } else if let Some(p) = selection::weighted_rr_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::RoundrobinParent))
        } else if let Some(p) = selection::first_up_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::FirstupParent))
        } else if let Some(p) = selection::default_parent(deps.peers, &self.request, now) {
            Some((p, HierCode::DefaultParent))
        } else {
            None
        };

        if let Some((peer, code)) = picked {
            self.add_selection(Some(peer), code);
        }
    }

    /// Appends every alive parent, then the default parent as the very last
    /// resort. This is what keeps never-direct requests alive.
    fn select_all_parents(&mut self, deps: &mut Deps<'_>) {
        let parents: Vec<PeerId> = deps
            .peers
            .iter()
            .filter(|(_, p)| {
                p.neighbor_type(&self.request.url) == PeerKind::Parent
                    && deps.peers.eligible_for_http(p, &self.request, deps.now)
            })
            .map(|(id, _)| id)
            .collect();
        for peer in parents {
            self.add_selection(Some(peer), HierCode::AnyOldParent);
        }

        if let Some(peer) = selection::default_parent(deps.peers, &self.request, deps.now) {
            self.add_selection(Some(peer), HierCode::DefaultParent);
        }
    }

    /* resolution: FwdServer chain -> destinations */

    fn resolve_selected(&mut self, deps: &mut Deps<'_>) -> Flow {
        loop {
            if self.aborted() {
                return self.abort(deps);
            }
            let Some(head) = self.chain.head().copied() else { break };

            // Intercepted traffic that failed Host verification (or runs
            // with passthru) must only ever go to the address the client
            // actually dialed, or browser same-origin protections break.
            let flags = &self.request.flags;
            let is_intercepted = flags.intercepted && !flags.redirected;
            let use_original_dst = deps.cfg.client_dst_passthru || !flags.host_verified;
            if is_intercepted && use_original_dst && head.code == HierCode::HierDirect {
                if let Some(original) = self.request.client_original_dst {
                    if self.wants_more(deps.cfg) {
                        let outgoing = deps.cfg.outgoing_addr;
                        self.emit(Some(Destination {
                            addr: original,
                            peer: None,
                            code: HierCode::OriginalDst,
                            outgoing,
                        }));
                    }
                }
                self.chain.pop();
                continue;
            }

            if head.code == HierCode::Pinned {
                // nil path: the initiator reuses the pinned socket
                if self.wants_more(deps.cfg) {
                    self.emit(None);
                }
                self.chain.pop();
                continue;
            }

            if !self.wants_more(deps.cfg) {
                // discard the surplus candidates
                self.chain.clear();
                break;
            }

            // a peer can vanish between rounds; fall back to the origin host
            let host = head
                .peer
                .and_then(|p| deps.peers.get(p))
                .map(|p| p.host.clone())
                .unwrap_or_else(|| self.url_host().to_string());

            if let Some(cached) = deps.ipcache.fresh(&host, deps.now) {
                let ips: Vec<IpAddr> = cached.good().collect();
                tracing::debug!(id = %self.id, host, addresses = ips.len(), "resolved from cache");
                self.stream_ips(deps, &head, &ips);
                self.chain.pop();
                continue;
            }

            tracing::debug!(id = %self.id, host, url = %self.request.url, "looking up destination addresses");
            self.resolving_host = Some(host.clone());
            deps.actions.push_back(Action::Resolve {
                selector: self.id,
                host,
            });
            return Flow::Park;
        }

        self.finish(deps)
    }

    /// One `note_destination` per usable address, in arrival order.
    fn stream_ips(&mut self, deps: &mut Deps<'_>, fs: &FwdServer, ips: &[IpAddr]) {
        let peer = fs.peer.and_then(|p| deps.peers.get(p));
        let (port, no_tproxy) = match peer {
            Some(p) => (p.http_port, p.flags.no_tproxy),
            None => (self.request.url.port(), false),
        };
        let outgoing = deps.cfg.outgoing_addr;

        for &ip in ips {
            if !self.wants_more(deps.cfg) {
                break;
            }
            // an address family we cannot spoof the client on is unusable
            if self.request.flags.spoof_client_ip && !no_tproxy {
                if let Some(client) = self.request.client_addr {
                    if client.is_ipv4() != ip.is_ipv4() {
                        tracing::debug!(id = %self.id, %ip, "skipping address: cannot spoof client on this family");
                        continue;
                    }
                }
            }
            self.emit(Some(Destination {
                addr: SocketAddr::new(ip, port),
                peer: fs.peer,
                code: fs.code,
                outgoing,
            }));
        }
    }

    /// The terminal transition: report the end, release registrations.
    fn finish(&mut self, deps: &mut Deps<'_>) -> Flow {
        self.chain.clear();
        if self.ping.stop.is_none() {
            self.ping.stop = Some(deps.now);
        }

        if self.found_paths > 0 {
            // nobody cares about errors if destinations were found anyway
            self.last_error = None;
        } else if self.last_error.is_none() {
            // zero destinations always carry a reason
            self.last_error = Some(SelectionError::NoForward);
        }

        let ping_ms = match (self.ping.start, self.ping.stop) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start).as_millis() as u64,
            _ => 0,
        };
        tracing::debug!(
            id = %self.id,
            found = self.found_paths,
            timedout = self.ping.timed_out,
            ping_ms,
            url = %self.request.url,
            "destination selection finished"
        );

        let error = self.last_error.take();
        self.initiator.note_destinations_end(error);
        self.cleanup(deps);
        Flow::Done
    }
}
