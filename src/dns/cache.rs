//! Cached resolver answers with good/bad address tracking.
//!
//! The addresses a forwarder should not connect to are "bad"; the rest are
//! "good". [`CachedIps`] keeps a cursor on the current good address. Marking
//! an address bad may move the cursor, but never past the last good address:
//! marking the last good one erases all markings instead, on the theory that
//! stale badness is better than no address at all.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct CachedIp {
    ip: IpAddr,
    bad: bool,
}

/// A small set of resolved addresses with a "current good address" cursor.
#[derive(Debug, Clone, Default)]
pub struct CachedIps {
    ips: Vec<CachedIp>,
    good_position: usize,
    bad_count: usize,
}

impl CachedIps {
    pub fn new() -> Self {
        CachedIps::default()
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn bad_count(&self) -> usize {
        self.bad_count
    }

    /// Position of the address, if we have it.
    fn have(&self, ip: IpAddr) -> Option<usize> {
        self.ips.iter().position(|c| c.ip == ip)
    }

    /// Appends an address unless it is already present.
    pub fn push_unique(&mut self, ip: IpAddr) {
        if self.have(ip).is_none() {
            self.ips.push(CachedIp { ip, bad: false });
        }
    }

    /// The address the cursor points at. Calling [`CachedIps::mark_bad`] may
    /// change the answer; nothing else rotates it.
    pub fn current(&self) -> Option<IpAddr> {
        self.ips.get(self.good_position).map(|c| c.ip)
    }

    /// Good addresses, starting at the cursor and wrapping around.
    pub fn good(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let len = self.ips.len();
        (0..len)
            .map(move |i| &self.ips[(self.good_position + i) % len])
            .filter(|c| !c.bad)
            .map(|c| c.ip)
    }

    /// Every cached address, good and bad, in insertion order.
    pub fn good_and_bad(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ips.iter().map(|c| c.ip)
    }

    /// Moves the cursor to the next good address after `from`, wrapping.
    /// Fails when no good address remains.
    fn seek_new_good(&mut self, from: usize) -> bool {
        let len = self.ips.len();
        for step in 1..=len {
            let candidate = (from + step) % len;
            if !self.ips[candidate].bad {
                self.good_position = candidate;
                return true;
            }
        }
        false
    }

    fn restore_goodness(&mut self, name: &str) {
        for cached in &mut self.ips {
            cached.bad = false;
        }
        self.bad_count = 0;
        tracing::debug!(name, "all addresses were bad; cleared every marking");
    }

    /// Marks an address bad, adjusting the cursor if it pointed there. No
    /// effect if the address is unknown or already bad. Marking the last
    /// good address clears every marking instead.
    pub fn mark_bad(&mut self, name: &str, ip: IpAddr) {
        let Some(position) = self.have(ip) else { return };
        if self.ips[position].bad {
            return;
        }

        self.ips[position].bad = true;
        self.bad_count += 1;

        if self.bad_count == self.ips.len() {
            // that was the last good address
            self.restore_goodness(name);
            return;
        }

        if position == self.good_position {
            let found = self.seek_new_good(position);
            debug_assert!(found);
            tracing::debug!(name, %ip, current = ?self.current(), "marked address bad");
        }
    }

    /// Undoes [`CachedIps::mark_bad`] for one address.
    pub fn forget_marking(&mut self, name: &str, ip: IpAddr) {
        let Some(position) = self.have(ip) else { return };
        if !self.ips[position].bad {
            return;
        }
        self.ips[position].bad = false;
        self.bad_count -= 1;
        tracing::debug!(name, %ip, "cleared bad marking");
    }
}

#[derive(Debug)]
struct IpCacheEntry {
    ips: CachedIps,
    expires: Instant,
}

/// Name-to-addresses cache in front of the resolver.
#[derive(Debug)]
pub struct IpCache {
    entries: HashMap<String, IpCacheEntry>,
    ttl: Duration,
}

impl IpCache {
    pub fn new(ttl: Duration) -> Self {
        IpCache {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// The cached address set for a name, if it has not expired.
    pub fn fresh(&self, name: &str, now: Instant) -> Option<&CachedIps> {
        let entry = self.entries.get(name)?;
        if now >= entry.expires {
            return None;
        }
        Some(&entry.ips)
    }

    /// Stores a resolver answer, replacing any stale one. Bad markings on
    /// the old entry are deliberately not carried over; a new answer is a
    /// fresh start.
    pub fn store(&mut self, name: &str, addresses: &[IpAddr], now: Instant) {
        let mut ips = CachedIps::new();
        for &ip in addresses {
            ips.push_unique(ip);
        }
        self.entries.insert(
            name.to_string(),
            IpCacheEntry {
                ips,
                expires: now + self.ttl,
            },
        );
    }

    pub fn mark_bad(&mut self, name: &str, ip: IpAddr) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.ips.mark_bad(name, ip);
        }
    }

    pub fn forget_marking(&mut self, name: &str, ip: IpAddr) {
        if let Some(entry) = self.entries.get_mut(name) {
            entry.ips.forget_marking(name, ip);
        }
    }
}
