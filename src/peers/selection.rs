//! Parent selector predicates.
//!
//! Each predicate picks at most one parent for a request and is
//! deterministic given identical registry state and request. The hashing
//! family (CARP, userhash, sourcehash) shares one rotate-combine hash so a
//! key always lands on the same peer while the peer set is stable.

use std::time::Instant;

use crate::config::PeerKind;
use crate::request::RequestContext;

use super::{Peer, PeerId, PeerRegistry};

/// Rotate-combine string hash used by the CARP family.
fn rotl_hash(bytes: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &c in bytes {
        hash = hash.wrapping_add(hash.rotate_left(19)).wrapping_add(u32::from(c));
    }
    hash
}

/// Mixes a peer hash with a key hash into a well-spread score base.
fn combine(peer_hash: u32, key_hash: u32) -> u32 {
    let mut combined = peer_hash ^ key_hash;
    combined = combined.wrapping_add(combined.wrapping_mul(0x6253_1965));
    combined.rotate_left(21)
}

/// Whether the peer is a parent for this URL and may take the request.
fn usable_parent(
    registry: &PeerRegistry,
    peer: &Peer,
    request: &RequestContext,
    now: Instant,
) -> bool {
    peer.neighbor_type(&request.url) == PeerKind::Parent
        && registry.eligible_for_http(peer, request, now)
}

/// Picks the highest-scoring peer among the flagged parents for `key`.
/// Weights scale scores so heavier peers attract proportionally more keys.
fn hash_select(
    registry: &PeerRegistry,
    request: &RequestContext,
    now: Instant,
    key: &[u8],
    flagged: impl Fn(&Peer) -> bool,
) -> Option<PeerId> {
    let key_hash = rotl_hash(key);
    let total_weight: u64 = registry
        .iter()
        .filter(|(_, p)| flagged(p) && usable_parent(registry, p, request, now))
        .map(|(_, p)| u64::from(p.weight))
        .sum();
    if total_weight == 0 {
        return None;
    }

    let mut best: Option<(PeerId, f64)> = None;
    for (id, peer) in registry.iter() {
        if !flagged(peer) || !usable_parent(registry, peer, request, now) {
            continue;
        }
        let load_factor = f64::from(peer.weight) / total_weight as f64;
        let score = f64::from(combine(rotl_hash(peer.host.as_bytes()), key_hash)) * load_factor;
        // strictly-greater keeps ties on the lowest id, which keeps the
        // mapping stable across runs
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((id, score));
        }
    }
    best.map(|(id, _)| id)
}

/// CARP: consistent-hash the URL across the carp parents.
pub fn carp_parent(
    registry: &PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    let url = request.url.to_string();
    hash_select(registry, request, now, url.as_bytes(), |p| p.flags.carp)
}

/// Userhash: pin each authenticated user to one parent.
pub fn userhash_parent(
    registry: &PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    let user = request.username.as_deref()?;
    hash_select(registry, request, now, user.as_bytes(), |p| p.flags.userhash)
}

/// Sourcehash: pin each client address to one parent.
pub fn sourcehash_parent(
    registry: &PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    let addr = request.client_addr?.to_string();
    hash_select(registry, request, now, addr.as_bytes(), |p| p.flags.sourcehash)
}

/// Plain round robin over the flagged parents: least-used wins, and the
/// winner's counter advances.
pub fn round_robin_parent(
    registry: &mut PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    let winner = registry
        .iter()
        .filter(|(_, p)| p.flags.round_robin && usable_parent(registry, p, request, now))
        .min_by_key(|(id, p)| (p.rr_count, *id))
        .map(|(id, _)| id)?;
    if let Some(peer) = registry.get_mut(winner) {
        peer.rr_count += 1;
    }
    Some(winner)
}

/// Weight-normalised round robin: the peer with the lowest uses-per-weight
/// ratio wins, so a weight-2 parent takes twice the requests.
pub fn weighted_rr_parent(
    registry: &mut PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    let mut best: Option<(PeerId, f64)> = None;
    for (id, peer) in registry.iter() {
        if !peer.flags.weighted_round_robin || !usable_parent(registry, peer, request, now) {
            continue;
        }
        let ratio = peer.rr_count as f64 / f64::from(peer.weight);
        if best.map_or(true, |(_, b)| ratio < b) {
            best = Some((id, ratio));
        }
    }
    let winner = best.map(|(id, _)| id)?;
    if let Some(peer) = registry.get_mut(winner) {
        peer.rr_count += 1;
    }
    Some(winner)
}

/// The first usable parent in configuration order.
pub fn first_up_parent(
    registry: &PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    registry
        .iter()
        .find(|(_, p)| usable_parent(registry, p, request, now))
        .map(|(id, _)| id)
}

/// The first usable parent flagged as the configured default.
pub fn default_parent(
    registry: &PeerRegistry,
    request: &RequestContext,
    now: Instant,
) -> Option<PeerId> {
    registry
        .iter()
        .find(|(_, p)| p.flags.default && usable_parent(registry, p, request, now))
        .map(|(id, _)| id)
}
