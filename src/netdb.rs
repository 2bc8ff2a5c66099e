//! Net-distance database adapter.
//!
//! An external measurement service (ICMP pinger, typically) keeps track of
//! how far origin hosts are from us and from our peers. The core only reads
//! distances and forwards the RTT hints peers volunteer in their replies.

use std::collections::HashMap;

/// Read/write surface of the distance database.
pub trait NetDb {
    /// Our own measured RTT to the host, milliseconds.
    fn host_rtt(&self, host: &str) -> Option<u32>;

    /// Our own measured hop count to the host.
    fn host_hops(&self, host: &str) -> Option<u32>;

    /// Records a peer-reported measurement from host to peer.
    fn update_peer(&mut self, host: &str, peer_host: &str, rtt_ms: u32, hops: u32);

    /// The peer with the lowest reported RTT to the host.
    fn best_peer(&self, host: &str) -> Option<(String, u32)>;
}

/// Distance database for deployments without an ICMP measurer: knows
/// nothing, remembers what peers report.
#[derive(Debug, Default)]
pub struct MemNetDb {
    hosts: HashMap<String, HostEntry>,
}

#[derive(Debug, Default)]
struct HostEntry {
    rtt_ms: Option<u32>,
    hops: Option<u32>,
    peers: HashMap<String, (u32, u32)>,
}

impl MemNetDb {
    pub fn new() -> Self {
        MemNetDb::default()
    }

    /// Feeds an own-measurement in; the hosting pinger calls this.
    pub fn note_host(&mut self, host: &str, rtt_ms: u32, hops: u32) {
        let entry = self.hosts.entry(host.to_ascii_lowercase()).or_default();
        entry.rtt_ms = Some(rtt_ms);
        entry.hops = Some(hops);
    }
}

impl NetDb for MemNetDb {
    fn host_rtt(&self, host: &str) -> Option<u32> {
        self.hosts.get(host)?.rtt_ms
    }

    fn host_hops(&self, host: &str) -> Option<u32> {
        self.hosts.get(host)?.hops
    }

    fn update_peer(&mut self, host: &str, peer_host: &str, rtt_ms: u32, hops: u32) {
        tracing::trace!(host, peer = peer_host, rtt_ms, hops, "distance update");
        let entry = self.hosts.entry(host.to_ascii_lowercase()).or_default();
        entry
            .peers
            .insert(peer_host.to_ascii_lowercase(), (rtt_ms, hops));
    }

    fn best_peer(&self, host: &str) -> Option<(String, u32)> {
        let entry = self.hosts.get(host)?;
        entry
            .peers
            .iter()
            .filter(|(_, (rtt, _))| *rtt > 0)
            .min_by_key(|(peer, (rtt, _))| (*rtt, (*peer).clone()))
            .map(|(peer, (rtt, _))| (peer.clone(), *rtt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_own_and_peer_measurements() {
        let mut db = MemNetDb::new();
        db.note_host("ex.com", 120, 9);
        db.update_peer("ex.com", "p1.example.net", 50, 3);
        db.update_peer("ex.com", "p2.example.net", 30, 2);

        assert_eq!(db.host_rtt("ex.com"), Some(120));
        assert_eq!(db.host_hops("ex.com"), Some(9));
        assert_eq!(db.best_peer("ex.com"), Some(("p2.example.net".into(), 30)));
        assert_eq!(db.host_rtt("unknown.com"), None);
        assert_eq!(db.best_peer("unknown.com"), None);
    }

    #[test]
    fn newer_peer_measurements_replace_older() {
        let mut db = MemNetDb::new();
        db.update_peer("ex.com", "p1.example.net", 50, 3);
        db.update_peer("ex.com", "p1.example.net", 80, 3);
        assert_eq!(db.best_peer("ex.com"), Some(("p1.example.net".into(), 80)));
    }
}
