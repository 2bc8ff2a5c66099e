//! The core context: every process-wide piece of the coordination core in
//! one object, driven by explicit events.
//!
//! [`CoreContext`] owns the peer registry, the ping wheel, the messenger
//! state, the IP cache, the distance database and the live selectors. It
//! performs no I/O itself: hosts call the `handle_*` entry points when
//! something happens outside and drain the [`Action`] queue afterwards to
//! learn what the core wants done. Within one entry point execution is
//! straight-line; anything that could re-enter a selector is queued instead.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::acl::{Answer, DirectPolicy};
use crate::config::Config;
use crate::dns::IpCache;
use crate::fingerprint::Fingerprint;
use crate::messenger::htcp::{HtcpCodec, NoHtcp};
use crate::messenger::{icp, Datagram, Messenger, PingReply, Proto};
use crate::netdb::{MemNetDb, NetDb};
use crate::peers::{Peer, PeerRegistry};
use crate::ping::{PingWheel, TimerCmd};
use crate::request::{CacheEntry, RequestContext};
use crate::selector::{PeerSelectionInitiator, PeerSelector, SelectorId};
use crate::url::RequestUrl;

/// What a cache digest thinks a peer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestGuess {
    Hit,
    Miss,
    Unknown,
}

/// Cache-digest oracle. Digest construction and exchange happen elsewhere;
/// the core only asks for a guess.
pub trait DigestLookup {
    fn lookup(&self, peer: &Peer, key: &Fingerprint) -> DigestGuess;
}

/// The digest oracle for deployments without digests: never guesses.
#[derive(Debug, Default)]
pub struct NoDigests;

impl DigestLookup for NoDigests {
    fn lookup(&self, _peer: &Peer, _key: &Fingerprint) -> DigestGuess {
        DigestGuess::Unknown
    }
}

/// A side effect the host must perform for the core.
#[derive(Debug)]
pub enum Action {
    /// Send this datagram on the named shared socket.
    Send(Datagram),
    /// Arm or cancel the single ping timer.
    Timer(TimerCmd),
    /// Run the policy gate and feed the verdict to
    /// [`CoreContext::handle_acl_verdict`]. Carries the request so the gate
    /// can evaluate without reaching back into the core.
    CheckAcl {
        selector: SelectorId,
        policy: DirectPolicy,
        request: RequestContext,
    },
    /// Resolve the host and feed the outcome to
    /// [`CoreContext::handle_dns_result`].
    Resolve { selector: SelectorId, host: String },
}

/// Whether a selector survives the event it just handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Parked again, waiting for the next event.
    Park,
    /// Finished (or aborted); the slot is free.
    Done,
}

/// Borrowed view of the core's subsystems, handed to a selector while it
/// runs. The selector itself is taken out of the slab for the duration, so
/// nothing can alias it.
pub(crate) struct Deps<'a> {
    pub cfg: &'a Config,
    pub peers: &'a mut PeerRegistry,
    pub wheel: &'a mut PingWheel,
    pub messenger: &'a mut Messenger,
    pub netdb: &'a mut dyn NetDb,
    pub digests: &'a dyn DigestLookup,
    pub htcp: &'a dyn HtcpCodec,
    pub ipcache: &'a mut IpCache,
    pub actions: &'a mut VecDeque<Action>,
    pub now: Instant,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    selector: Option<PeerSelector>,
}

/// Generation-tagged storage for live selectors.
#[derive(Default)]
struct SelectorSlab {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl SelectorSlab {
    fn allocate(&mut self) -> SelectorId {
        if let Some(slot) = self.free.pop() {
            SelectorId {
                slot,
                generation: self.slots[slot as usize].generation,
            }
        } else {
            self.slots.push(Slot::default());
            SelectorId {
                slot: (self.slots.len() - 1) as u32,
                generation: 0,
            }
        }
    }

    fn install(&mut self, id: SelectorId, selector: PeerSelector) {
        self.slots[id.slot as usize].selector = Some(selector);
    }

    /// Takes the selector out for the duration of one event. Stale ids
    /// resolve to `None`; that is the cancellation signal.
    fn take(&mut self, id: SelectorId) -> Option<PeerSelector> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.selector.take()
    }

    fn put_back(&mut self, id: SelectorId, selector: PeerSelector) {
        self.slots[id.slot as usize].selector = Some(selector);
    }

    /// Retires the slot: the generation advances so every outstanding
    /// handle to this selector goes stale.
    fn retire(&mut self, id: SelectorId) {
        let slot = &mut self.slots[id.slot as usize];
        slot.selector = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
    }

    fn live(&self, id: SelectorId) -> bool {
        self.slots
            .get(id.slot as usize)
            .is_some_and(|s| s.generation == id.generation && s.selector.is_some())
    }
}

/// The cache coordination core.
pub struct CoreContext {
    cfg: Arc<Config>,
    peers: PeerRegistry,
    wheel: PingWheel,
    messenger: Messenger,
    netdb: Box<dyn NetDb + Send>,
    digests: Box<dyn DigestLookup + Send>,
    htcp: Box<dyn HtcpCodec + Send>,
    ipcache: IpCache,
    selectors: SelectorSlab,
    actions: VecDeque<Action>,
    key_serial: u64,
}

impl CoreContext {
    pub fn new(cfg: Arc<Config>) -> Self {
        CoreContext {
            peers: PeerRegistry::from_config(&cfg),
            wheel: PingWheel::new(),
            messenger: Messenger::new(Duration::from_secs(cfg.reqnum_ttl_secs)),
            netdb: Box::new(MemNetDb::new()),
            digests: Box::new(NoDigests),
            htcp: Box::new(NoHtcp),
            ipcache: IpCache::new(Duration::from_secs(cfg.ipcache_ttl_secs)),
            selectors: SelectorSlab::default(),
            actions: VecDeque::new(),
            key_serial: 0,
            cfg,
        }
    }

    /// Swaps in a different distance database (an ICMP-fed one, say).
    pub fn with_netdb(mut self, netdb: Box<dyn NetDb + Send>) -> Self {
        self.netdb = netdb;
        self
    }

    /// Swaps in a cache-digest oracle.
    pub fn with_digests(mut self, digests: Box<dyn DigestLookup + Send>) -> Self {
        self.digests = digests;
        self
    }

    /// Swaps in an HTCP codec, enabling HTCP peers.
    pub fn with_htcp(mut self, htcp: Box<dyn HtcpCodec + Send>) -> Self {
        self.htcp = htcp;
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn netdb_mut(&mut self) -> &mut dyn NetDb {
        self.netdb.as_mut()
    }

    /// Replaces the peer roster (a configuration reload). Live selectors
    /// keep their ids; stale peer ids simply stop resolving.
    pub fn reload_peers(&mut self, cfg: &Config) {
        tracing::info!(peers = cfg.peers.len(), "reloading peer registry");
        self.peers = PeerRegistry::from_config(cfg);
    }

    /// Mints a public cache key for a request.
    pub fn public_key(&self, method: &str, url: &RequestUrl) -> Fingerprint {
        Fingerprint::public(method, url)
    }

    /// Mints a private cache key; it will never match another selector's.
    pub fn private_key(&mut self, method: &str, url: &RequestUrl) -> Fingerprint {
        self.key_serial += 1;
        Fingerprint::private(method, url, self.key_serial)
    }

    /// Next queued side effect, if any. Hosts drain this after every call.
    pub fn next_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Whether a selector handle still refers to a live selector.
    pub fn selector_live(&self, id: SelectorId) -> bool {
        self.selectors.live(id)
    }

    /// The deadline the ping timer should currently be armed for.
    pub fn armed_deadline(&self) -> Option<Instant> {
        self.wheel.armed()
    }

    fn deps<'a>(
        cfg: &'a Config,
        peers: &'a mut PeerRegistry,
        wheel: &'a mut PingWheel,
        messenger: &'a mut Messenger,
        netdb: &'a mut (dyn NetDb + Send),
        digests: &'a (dyn DigestLookup + Send),
        htcp: &'a (dyn HtcpCodec + Send),
        ipcache: &'a mut IpCache,
        actions: &'a mut VecDeque<Action>,
        now: Instant,
    ) -> Deps<'a> {
        Deps {
            cfg,
            peers,
            wheel,
            messenger,
            netdb,
            digests,
            htcp,
            ipcache,
            actions,
            now,
        }
    }

    /// Runs one selector event with the selector temporarily removed from
    /// the slab, then parks or retires it according to the outcome.
    fn with_selector<F>(&mut self, id: SelectorId, now: Instant, event: F)
    where
        F: FnOnce(&mut PeerSelector, &mut Deps<'_>) -> Flow,
    {
        let Some(mut selector) = self.selectors.take(id) else {
            tracing::trace!(%id, "event for a finished selector, dropped");
            return;
        };
        let flow = {
            let mut deps = Self::deps(
                &self.cfg,
                &mut self.peers,
                &mut self.wheel,
                &mut self.messenger,
                self.netdb.as_mut(),
                self.digests.as_ref(),
                self.htcp.as_ref(),
                &mut self.ipcache,
                &mut self.actions,
                now,
            );
            event(&mut selector, &mut deps)
        };
        match flow {
            Flow::Park => self.selectors.put_back(id, selector),
            Flow::Done => self.selectors.retire(id),
        }
    }

    /// Starts selecting destinations for a request. The initiator receives
    /// zero or more `note_destination` calls followed by exactly one
    /// `note_destinations_end`, unless it unsubscribes first.
    pub fn start_selection(
        &mut self,
        request: RequestContext,
        entry: Option<CacheEntry>,
        initiator: Box<dyn PeerSelectionInitiator>,
    ) -> SelectorId {
        let id = self.selectors.allocate();
        let selector = PeerSelector::new(id, request, entry, initiator);
        self.selectors.install(id, selector);
        self.with_selector(id, Instant::now(), |sel, deps| sel.start(deps));
        id
    }

    /// The host's ping timer fired. Wakes every selector whose window is
    /// over; notifications go through the queue, never inline from the
    /// wheel.
    pub fn handle_timer(&mut self, now: Instant) {
        let (due, cmd) = self.wheel.service(now);
        if let Some(cmd) = cmd {
            self.actions.push_back(Action::Timer(cmd));
        }
        for id in due {
            self.with_selector(id, now, |sel, deps| sel.handle_ping_timeout(deps));
        }
    }

    /// A datagram arrived on one of the shared sockets.
    pub fn handle_datagram(&mut self, proto: Proto, from: SocketAddr, payload: &[u8]) {
        let now = Instant::now();
        let (reqnum, reply) = match proto {
            Proto::Icp => {
                let (header, _payload) = match icp::decode(payload) {
                    Ok(decoded) => decoded,
                    Err(err) => {
                        // recovered locally; the sender is not billed a reply
                        tracing::warn!(%from, %err, "malformed peer message");
                        return;
                    }
                };
                match header.opcode {
                    icp::Opcode::Query => {
                        // inbound queries are the server side's business
                        tracing::trace!(%from, "ignoring inbound query on the reply path");
                        return;
                    }
                    icp::Opcode::Invalid => {
                        tracing::warn!(%from, "malformed peer message: unknown opcode");
                        return;
                    }
                    _ => {}
                }
                (header.reqnum, PingReply::Icp(header))
            }
            Proto::Htcp => match self.htcp.decode_reply(from, payload) {
                Some((msg_id, reply)) => (msg_id, PingReply::Htcp(reply)),
                None => {
                    tracing::warn!(%from, "malformed peer message (htcp)");
                    return;
                }
            },
        };

        let peer = self.peers.peer_by_addr(from.ip());

        // whoever it was meant for, a reply proves the peer is alive
        if let Some(id) = peer {
            self.peers.note_reply(id, None);
        }

        let Some(peer) = peer else {
            tracing::debug!(%from, "reply from an address that is not a configured peer");
            return;
        };
        let Some(selector) = self.messenger.resolve(reqnum, now) else {
            tracing::debug!(%from, reqnum, "reply does not match a live query");
            return;
        };

        self.with_selector(selector, now, |sel, deps| sel.handle_reply(deps, peer, reply));
    }

    /// The policy gate finished a check started by [`Action::CheckAcl`].
    pub fn handle_acl_verdict(&mut self, id: SelectorId, policy: DirectPolicy, answer: Answer) {
        self.with_selector(id, Instant::now(), |sel, deps| {
            sel.handle_acl_verdict(deps, policy, answer)
        });
    }

    /// The resolver finished a lookup started by [`Action::Resolve`].
    pub fn handle_dns_result(
        &mut self,
        id: SelectorId,
        host: &str,
        result: Result<Vec<std::net::IpAddr>, String>,
    ) {
        self.with_selector(id, Instant::now(), |sel, deps| {
            sel.handle_dns_result(deps, host, result)
        });
    }

    /// The socket refused a datagram with a transient error; it is queued
    /// and must be retried via [`CoreContext::next_pending_send`] when the
    /// socket turns writable.
    pub fn note_send_blocked(&mut self, datagram: Datagram) {
        self.messenger.note_send_blocked(datagram);
    }

    /// A send failed for good. The peer's silence will be billed when its
    /// round closes; the reply expectation is deliberately not shrunk, the
    /// timeout closes the round.
    pub fn note_send_fatal(&mut self, datagram: &Datagram, error: &str) {
        tracing::warn!(to = %datagram.to, error, "dropping datagram after fatal send error");
    }

    /// Next datagram to retry on a writable socket.
    pub fn next_pending_send(&mut self, proto: Proto) -> Option<Datagram> {
        self.messenger.next_pending(proto)
    }

    pub fn has_pending_sends(&self, proto: Proto) -> bool {
        self.messenger.has_pending(proto)
    }

    /// Marks a destination address bad after a failed connect, steering the
    /// good-address cursor for later lookups of the same name.
    pub fn mark_destination_bad(&mut self, host: &str, ip: std::net::IpAddr) {
        self.ipcache.mark_bad(host, ip);
    }

    /// Undoes [`CoreContext::mark_destination_bad`].
    pub fn forget_destination_marking(&mut self, host: &str, ip: std::net::IpAddr) {
        self.ipcache.forget_marking(host, ip);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::config::{PeerConfig, PeerFlagsConfig, PeerKind};
    use crate::request::PingStatus;
    use crate::selector::{Destination, HierCode, SelectionError};
    use crate::url::RequestUrl;

    use super::*;

    /// Records every callback the core makes, in order.
    #[derive(Default)]
    struct Record {
        calls: Vec<Call>,
    }

    #[derive(Debug)]
    enum Call {
        Destination(Option<Destination>),
        End(Option<SelectionError>),
    }

    #[derive(Clone, Default)]
    struct TestInitiator {
        record: Arc<Mutex<Record>>,
        unsubscribed: Arc<AtomicBool>,
    }

    impl TestInitiator {
        fn new() -> Self {
            TestInitiator::default()
        }

        fn unsubscribe(&self) {
            self.unsubscribed.store(true, Ordering::SeqCst);
        }

        fn destinations(&self) -> Vec<Option<Destination>> {
            self.record
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter_map(|c| match c {
                    Call::Destination(d) => Some(d.clone()),
                    Call::End(_) => None,
                })
                .collect()
        }

        fn ends(&self) -> Vec<Option<SelectionError>> {
            self.record
                .lock()
                .unwrap()
                .calls
                .iter()
                .filter_map(|c| match c {
                    Call::End(e) => Some(e.clone()),
                    Call::Destination(_) => None,
                })
                .collect()
        }

        /// The terminal call came last, and exactly once.
        fn assert_terminal_once(&self) {
            let record = self.record.lock().unwrap();
            let ends = record
                .calls
                .iter()
                .enumerate()
                .filter(|(_, c)| matches!(c, Call::End(_)))
                .map(|(i, _)| i)
                .collect::<Vec<_>>();
            assert_eq!(ends.len(), 1, "note_destinations_end must fire exactly once");
            assert_eq!(ends[0], record.calls.len() - 1, "nothing may follow the end call");
        }
    }

    impl PeerSelectionInitiator for TestInitiator {
        fn subscribed(&self) -> bool {
            !self.unsubscribed.load(Ordering::SeqCst)
        }

        fn note_destination(&mut self, destination: Option<Destination>) {
            self.record
                .lock()
                .unwrap()
                .calls
                .push(Call::Destination(destination));
        }

        fn note_destinations_end(&mut self, error: Option<SelectionError>) {
            self.record.lock().unwrap().calls.push(Call::End(error));
        }
    }

    /// Scripted host: answers gate checks and lookups, records sends.
    struct Script {
        always_direct: Answer,
        never_direct: Answer,
        dns: HashMap<String, Result<Vec<IpAddr>, String>>,
        sent: Vec<Datagram>,
    }

    impl Default for Script {
        fn default() -> Self {
            Script {
                always_direct: Answer::Denied,
                never_direct: Answer::Denied,
                dns: HashMap::new(),
                sent: Vec::new(),
            }
        }
    }

    impl Script {
        fn dns(mut self, host: &str, ips: &[&str]) -> Self {
            self.dns.insert(
                host.to_string(),
                Ok(ips.iter().map(|s| s.parse().unwrap()).collect()),
            );
            self
        }

        /// Feeds queued actions back into the core until it goes quiet.
        /// Datagram sends are recorded for the test to answer by hand.
        fn pump(&mut self, core: &mut CoreContext) {
            while let Some(action) = core.next_action() {
                match action {
                    Action::Send(datagram) => self.sent.push(datagram),
                    Action::Timer(_) => {}
                    Action::CheckAcl {
                        selector, policy, ..
                    } => {
                        let answer = match policy {
                            DirectPolicy::AlwaysDirect => self.always_direct,
                            DirectPolicy::NeverDirect => self.never_direct,
                        };
                        core.handle_acl_verdict(selector, policy, answer);
                    }
                    Action::Resolve { selector, host } => {
                        let result = self
                            .dns
                            .get(&host)
                            .cloned()
                            .unwrap_or_else(|| Err(format!("unknown host {host}")));
                        core.handle_dns_result(selector, &host, result);
                    }
                }
            }
        }
    }

    fn parent(host: &str, addr: &str) -> PeerConfig {
        PeerConfig {
            host: host.to_string(),
            addr: addr.parse().unwrap(),
            kind: PeerKind::Parent,
            http_port: 3128,
            udp_port: 3130,
            weight: 1,
            base_rtt_ms: 0,
            flags: PeerFlagsConfig::default(),
            domains: vec![],
            neighbor_type_domains: vec![],
        }
    }

    fn core_with(config: Config) -> CoreContext {
        CoreContext::new(Arc::new(config))
    }

    fn request(url: &str) -> RequestContext {
        let mut req = RequestContext::new("GET", RequestUrl::parse(url).unwrap());
        req.flags.hierarchical = true;
        req.flags.cacheable = true;
        req
    }

    fn public_entry(req: &RequestContext) -> CacheEntry {
        CacheEntry::new(Fingerprint::public(&req.method, &req.url))
    }

    fn reply_from(core: &mut CoreContext, script: &Script, peer_addr: &str, opcode: icp::Opcode, flags: u32, pad: u32) {
        let (header, _) = icp::decode(&script.sent[0].payload).unwrap();
        let url = "http://ex.com/a"; // the echo payload is not used for matching
        let reply = icp::build_reply(opcode, header.reqnum, flags, pad, url);
        let from: SocketAddr = format!("{peer_addr}:3130").parse().unwrap();
        core.handle_datagram(Proto::Icp, from, &reply);
    }

    #[test]
    fn s1_plain_direct_streams_every_origin_address() {
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script {
            always_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("ex.com", &["10.0.0.1", "10.0.0.2"]);

        let initiator = TestInitiator::new();
        core.start_selection(request("http://ex.com/a"), None, Box::new(initiator.clone()));
        script.pump(&mut core);

        let destinations = initiator.destinations();
        assert_eq!(destinations.len(), 2);
        let first = destinations[0].as_ref().unwrap();
        let second = destinations[1].as_ref().unwrap();
        assert_eq!(first.addr, "10.0.0.1:80".parse().unwrap());
        assert_eq!(first.code, HierCode::HierDirect);
        assert_eq!(first.peer, None);
        assert_eq!(second.addr, "10.0.0.2:80".parse().unwrap());
        assert_eq!(initiator.ends(), vec![None]);
        initiator.assert_terminal_once();
        // no peer was queried
        assert!(script.sent.is_empty());
    }

    #[test]
    fn s2_icp_hit_selects_the_hitting_parent() {
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script {
            never_direct: Answer::Allowed, // parents only
            ..Script::default()
        }
        .dns("p1.example.net", &["1.2.3.4"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        let id = core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);

        // exactly one query went out, to the parent's UDP port
        assert_eq!(script.sent.len(), 1);
        assert_eq!(script.sent[0].to, "192.0.2.10:3130".parse().unwrap());
        assert!(core.selector_live(id));
        assert!(core.armed_deadline().is_some());

        reply_from(&mut core, &script, "192.0.2.10", icp::Opcode::Hit, 0, 0);
        script.pump(&mut core);

        let destinations = initiator.destinations();
        assert_eq!(destinations.len(), 1);
        let dest = destinations[0].as_ref().unwrap();
        assert_eq!(dest.addr, "1.2.3.4:3128".parse().unwrap());
        assert_eq!(dest.code, HierCode::ParentHit);
        assert_eq!(initiator.ends(), vec![None]);
        initiator.assert_terminal_once();
        // the round is over: the shared timer is disarmed
        assert_eq!(core.armed_deadline(), None);
        assert!(!core.selector_live(id));
    }

    #[test]
    fn s3_all_miss_prefers_the_closest_parent() {
        let mut core = core_with(Config {
            query_icmp: true,
            peers: vec![
                parent("near.example.net", "192.0.2.10"),
                parent("far.example.net", "192.0.2.11"),
            ],
            ..Config::default()
        });
        let mut script = Script {
            never_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("near.example.net", &["1.2.3.4"])
        .dns("far.example.net", &["5.6.7.8"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);
        assert_eq!(script.sent.len(), 2);

        // both parents miss, with RTT hints 50ms and 80ms
        reply_from(&mut core, &script, "192.0.2.10", icp::Opcode::Miss, icp::FLAG_SRC_RTT, (3 << 16) | 50);
        reply_from(&mut core, &script, "192.0.2.11", icp::Opcode::Miss, icp::FLAG_SRC_RTT, (5 << 16) | 80);
        script.pump(&mut core);

        let destinations = initiator.destinations();
        assert!(!destinations.is_empty());
        let first = destinations[0].as_ref().unwrap();
        assert_eq!(first.code, HierCode::ClosestParentMiss);
        assert_eq!(first.addr, "1.2.3.4:3128".parse().unwrap());
        assert_eq!(initiator.ends(), vec![None]);
        initiator.assert_terminal_once();

        // the hints also landed in the distance database
        assert_eq!(
            core.netdb_mut().best_peer("ex.com"),
            Some(("near.example.net".to_string(), 50))
        );
    }

    #[test]
    fn s4_ping_timeout_falls_back_to_parent_then_direct() {
        let mut core = core_with(Config {
            icp_query_timeout_ms: Some(100),
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script::default()
            .dns("p1.example.net", &["1.2.3.4"])
            .dns("ex.com", &["10.9.8.7"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);
        assert_eq!(script.sent.len(), 1);

        let deadline = core.armed_deadline().expect("a ping window must be armed");
        core.handle_timer(deadline + std::time::Duration::from_millis(1));
        script.pump(&mut core);

        let destinations = initiator.destinations();
        assert_eq!(destinations.len(), 2);
        let first = destinations[0].as_ref().unwrap();
        let second = destinations[1].as_ref().unwrap();
        // prefer_direct is off: the parent leads, the origin follows
        assert_eq!(first.addr, "1.2.3.4:3128".parse().unwrap());
        assert_eq!(first.code, HierCode::FirstupParent);
        assert_eq!(second.addr, "10.9.8.7:80".parse().unwrap());
        assert_eq!(second.code, HierCode::HierDirect);
        assert_eq!(initiator.ends(), vec![None]);
        initiator.assert_terminal_once();
    }

    #[test]
    fn s5_intercepted_direct_is_rewritten_to_the_original_destination() {
        let mut core = core_with(Config::default());
        let mut script = Script {
            always_direct: Answer::Allowed,
            ..Script::default()
        };

        let initiator = TestInitiator::new();
        let mut req = request("https://ex.com/");
        req.flags.intercepted = true;
        req.flags.host_verified = false;
        req.client_original_dst = Some("203.0.113.7:443".parse().unwrap());
        core.start_selection(req, None, Box::new(initiator.clone()));
        script.pump(&mut core);

        let destinations = initiator.destinations();
        assert_eq!(destinations.len(), 1);
        let dest = destinations[0].as_ref().unwrap();
        assert_eq!(dest.code, HierCode::OriginalDst);
        assert_eq!(dest.addr, "203.0.113.7:443".parse().unwrap());
        assert_eq!(dest.peer, None);
        assert_eq!(initiator.ends(), vec![None]);
        initiator.assert_terminal_once();
    }

    #[test]
    fn s6_initiator_gone_late_hit_updates_health_and_stays_silent() {
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script {
            never_direct: Answer::Allowed,
            ..Script::default()
        };

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        let id = core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);
        assert_eq!(script.sent.len(), 1);

        // the requester loses interest mid-flight
        initiator.unsubscribe();

        reply_from(&mut core, &script, "192.0.2.10", icp::Opcode::Hit, 0, 0);
        script.pump(&mut core);

        // the peer's liveness was still refreshed
        let peer = core.peers().get(crate::peers::PeerId(0)).unwrap();
        assert!(peer.health().alive());
        assert_eq!(peer.health().consecutive_failures(), 0);

        // the selector destroyed itself without a single callback
        assert!(!core.selector_live(id));
        assert!(initiator.record.lock().unwrap().calls.is_empty());
        // and its wheel registration is gone
        assert_eq!(core.armed_deadline(), None);
    }

    #[test]
    fn pinned_requests_emit_exactly_one_pinned_destination() {
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script::default().dns("p1.example.net", &["1.2.3.4"]);

        let initiator = TestInitiator::new();
        let mut req = request("http://ex.com/a");
        req.pinned = Some(crate::request::PinnedConnection {
            peer: Some(crate::peers::PeerId(0)),
        });
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);

        // probing was skipped entirely
        assert!(script.sent.is_empty());
        let destinations = initiator.destinations();
        let pinned: Vec<_> = destinations.iter().filter(|d| d.is_none()).collect();
        assert_eq!(pinned.len(), 1, "at most one PINNED destination");
        assert_eq!(destinations[0], None, "the pinned destination leads");
        initiator.assert_terminal_once();
    }

    #[test]
    fn forward_max_tries_caps_destinations() {
        let mut core = core_with(Config {
            forward_max_tries: 1,
            ..Config::default()
        });
        let mut script = Script {
            always_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("ex.com", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let initiator = TestInitiator::new();
        core.start_selection(request("http://ex.com/a"), None, Box::new(initiator.clone()));
        script.pump(&mut core);

        assert_eq!(initiator.destinations().len(), 1);
        assert_eq!(initiator.ends(), vec![None]);
    }

    #[test]
    fn negative_forward_max_tries_means_unlimited() {
        let mut core = core_with(Config {
            forward_max_tries: -1,
            ..Config::default()
        });
        let mut script = Script {
            always_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("ex.com", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let initiator = TestInitiator::new();
        core.start_selection(request("http://ex.com/a"), None, Box::new(initiator.clone()));
        script.pump(&mut core);

        assert_eq!(initiator.destinations().len(), 3);
    }

    #[test]
    fn dns_failure_with_zero_destinations_surfaces_the_error() {
        let mut core = core_with(Config::default());
        let mut script = Script {
            always_direct: Answer::Allowed,
            ..Script::default()
        }; // no DNS answers at all

        let initiator = TestInitiator::new();
        core.start_selection(request("http://nxdomain.test/a"), None, Box::new(initiator.clone()));
        script.pump(&mut core);

        assert!(initiator.destinations().is_empty());
        let ends = initiator.ends();
        assert_eq!(ends.len(), 1);
        match &ends[0] {
            Some(SelectionError::DnsFail { host, .. }) => assert_eq!(host, "nxdomain.test"),
            other => panic!("expected a DNS failure, got {other:?}"),
        }
    }

    #[test]
    fn dns_failure_is_forgotten_once_any_destination_is_found() {
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        // origin resolution fails, but the parent resolves
        let mut script = Script::default().dns("p1.example.net", &["1.2.3.4"]);

        let initiator = TestInitiator::new();
        let mut req = request("http://nxdomain.test/a");
        req.flags.hierarchical = true;
        core.start_selection(req, None, Box::new(initiator.clone()));
        script.pump(&mut core);

        assert!(!initiator.destinations().is_empty());
        assert_eq!(initiator.ends(), vec![None]);
    }

    #[test]
    fn a_silent_peer_is_billed_exactly_one_failure_per_round() {
        let mut core = core_with(Config {
            icp_query_timeout_ms: Some(50),
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script::default().dns("ex.com", &["10.0.0.1"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);
        assert_eq!(script.sent.len(), 1);

        let deadline = core.armed_deadline().unwrap();
        core.handle_timer(deadline + std::time::Duration::from_millis(1));
        script.pump(&mut core);

        let peer = core.peers().get(crate::peers::PeerId(0)).unwrap();
        assert_eq!(peer.health().consecutive_failures(), 1);
    }

    #[test]
    fn private_keys_suppress_probing_when_configured() {
        let mut core = core_with(Config {
            query_private_keys: false,
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script::default()
            .dns("p1.example.net", &["1.2.3.4"])
            .dns("ex.com", &["10.0.0.1"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let key = core.private_key(&req.method, &req.url);
        core.start_selection(req, Some(CacheEntry::new(key)), Box::new(initiator.clone()));
        script.pump(&mut core);

        // no queries, yet the selection still completes
        assert!(script.sent.is_empty());
        assert!(!initiator.destinations().is_empty());
        assert_eq!(initiator.ends(), vec![None]);
    }

    #[test]
    fn late_replies_after_the_round_are_discarded() {
        let mut core = core_with(Config {
            icp_query_timeout_ms: Some(50),
            peers: vec![
                parent("p1.example.net", "192.0.2.10"),
                parent("p2.example.net", "192.0.2.11"),
            ],
            ..Config::default()
        });
        let mut script = Script {
            never_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("p1.example.net", &["1.2.3.4"])
        .dns("p2.example.net", &["5.6.7.8"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);
        assert_eq!(script.sent.len(), 2);

        let deadline = core.armed_deadline().unwrap();
        core.handle_timer(deadline + std::time::Duration::from_millis(1));
        script.pump(&mut core);
        let settled = initiator.destinations().len();
        assert!(settled > 0);

        // a HIT that arrives after the selector finished changes nothing
        reply_from(&mut core, &script, "192.0.2.10", icp::Opcode::Hit, 0, 0);
        script.pump(&mut core);
        assert_eq!(initiator.destinations().len(), settled);
        initiator.assert_terminal_once();

        // but the late reply revived the peer's health record
        let peer = core.peers().get(crate::peers::PeerId(0)).unwrap();
        assert_eq!(peer.health().consecutive_failures(), 0);
    }

    #[test]
    fn never_direct_requests_reach_every_alive_parent() {
        let mut core = core_with(Config {
            peers: vec![
                parent("p1.example.net", "192.0.2.10"),
                parent("p2.example.net", "192.0.2.11"),
            ],
            ..Config::default()
        });
        let mut script = Script {
            never_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("p1.example.net", &["1.2.3.4"])
        .dns("p2.example.net", &["5.6.7.8"]);

        let initiator = TestInitiator::new();
        let mut req = request("http://ex.com/a");
        req.flags.hierarchical = false; // not worth probing
        req.flags.cacheable = false;
        core.start_selection(req, None, Box::new(initiator.clone()));
        script.pump(&mut core);

        let destinations = initiator.destinations();
        let addrs: Vec<_> = destinations
            .iter()
            .map(|d| d.as_ref().unwrap().addr)
            .collect();
        assert!(addrs.contains(&"1.2.3.4:3128".parse().unwrap()));
        assert!(addrs.contains(&"5.6.7.8:3128".parse().unwrap()));
        // never-direct: the origin is not among the destinations
        assert!(destinations
            .iter()
            .all(|d| d.as_ref().unwrap().code != HierCode::HierDirect));
        assert_eq!(initiator.ends(), vec![None]);
    }

    #[test]
    fn tproxy_spoofing_skips_mismatched_address_families() {
        let mut core = core_with(Config::default());
        let mut script = Script {
            always_direct: Answer::Allowed,
            ..Script::default()
        }
        .dns("ex.com", &["10.0.0.1", "2001:db8::1", "10.0.0.2"]);

        let initiator = TestInitiator::new();
        let mut req = request("http://ex.com/a");
        req.flags.spoof_client_ip = true;
        req.client_addr = Some("198.51.100.7".parse().unwrap());
        core.start_selection(req, None, Box::new(initiator.clone()));
        script.pump(&mut core);

        let addrs: Vec<_> = initiator
            .destinations()
            .iter()
            .map(|d| d.as_ref().unwrap().addr)
            .collect();
        assert_eq!(
            addrs,
            vec![
                "10.0.0.1:80".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse().unwrap()
            ]
        );
    }

    #[test]
    fn wais_urls_never_go_direct() {
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        });
        let mut script = Script::default().dns("p1.example.net", &["1.2.3.4"]);

        let initiator = TestInitiator::new();
        let mut req = request("wais://ex.com/doc");
        req.flags.hierarchical = false;
        req.flags.cacheable = false;
        core.start_selection(req, None, Box::new(initiator.clone()));
        script.pump(&mut core);

        assert!(initiator
            .destinations()
            .iter()
            .all(|d| d.as_ref().unwrap().code != HierCode::HierDirect));
    }

    #[test]
    fn a_close_origin_short_circuits_to_direct() {
        let mut db = crate::netdb::MemNetDb::new();
        db.note_host("ex.com", 50, 2); // well under minimum_direct_rtt
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        })
        .with_netdb(Box::new(db));
        let mut script = Script::default().dns("ex.com", &["10.0.0.1"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);

        // nearby origin: no probing, straight to the origin server
        assert!(script.sent.is_empty());
        let destinations = initiator.destinations();
        assert_eq!(destinations.len(), 1);
        assert_eq!(
            destinations[0].as_ref().unwrap().code,
            HierCode::HierDirect
        );
    }

    #[test]
    fn a_measurably_closer_parent_wins_without_probing() {
        let mut db = crate::netdb::MemNetDb::new();
        db.note_host("ex.com", 500, 12); // too far for the direct shortcut
        db.update_peer("ex.com", "p1.example.net", 30, 2);
        let mut core = core_with(Config {
            peers: vec![parent("p1.example.net", "192.0.2.10")],
            ..Config::default()
        })
        .with_netdb(Box::new(db));
        let mut script = Script::default()
            .dns("p1.example.net", &["1.2.3.4"])
            .dns("ex.com", &["10.0.0.1"]);

        let initiator = TestInitiator::new();
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        core.start_selection(req, Some(entry), Box::new(initiator.clone()));
        script.pump(&mut core);

        assert!(script.sent.is_empty());
        let destinations = initiator.destinations();
        let first = destinations[0].as_ref().unwrap();
        assert_eq!(first.code, HierCode::ClosestParent);
        assert_eq!(first.addr, "1.2.3.4:3128".parse().unwrap());
    }

    #[test]
    fn no_usable_route_reports_no_forward() {
        // never-direct with an empty peer roster: nothing can carry this
        let mut core = core_with(Config::default());
        let mut script = Script {
            never_direct: Answer::Allowed,
            ..Script::default()
        };

        let initiator = TestInitiator::new();
        core.start_selection(request("http://ex.com/a"), None, Box::new(initiator.clone()));
        script.pump(&mut core);

        assert!(initiator.destinations().is_empty());
        assert_eq!(initiator.ends(), vec![Some(SelectionError::NoForward)]);
    }

    #[test]
    fn ping_status_done_after_selection_and_cache_key_roundtrip() {
        let mut core = core_with(Config::default());
        let req = request("http://ex.com/a");
        let entry = public_entry(&req);
        assert_eq!(entry.ping_status, PingStatus::None);

        let public = core.public_key("GET", &req.url);
        assert!(public.is_public());
        let private = core.private_key("GET", &req.url);
        let private2 = core.private_key("GET", &req.url);
        assert!(!private.is_public());
        assert_ne!(private, private2);
        assert_ne!(private, public);
    }
}
