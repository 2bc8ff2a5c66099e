//! Selected-but-unresolved destinations.
//!
//! Selection produces an ordered chain of [`FwdServer`] records: a peer (or
//! nothing, for the origin) plus the code naming why it was chosen. The
//! chain is consumed head-first by the resolution loop, each record fanning
//! out into the addresses DNS finds for it.

use std::collections::VecDeque;
use std::fmt;

use crate::peers::PeerId;

/// Why a destination was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierCode {
    /// Origin server, the plain hierarchical way.
    HierDirect,
    /// A sibling answered HIT.
    SiblingHit,
    /// A parent answered HIT.
    ParentHit,
    /// A cache digest predicted a parent hit.
    CdParentHit,
    /// A cache digest predicted a sibling hit.
    CdSiblingHit,
    /// The distance database says this parent is closest to the origin.
    ClosestParent,
    /// Among the MISS replies, this parent reported the best origin RTT.
    ClosestParentMiss,
    /// The first MISS reply, weighted by peer weight and base RTT.
    FirstParentMiss,
    /// The origin is closer than every parent; go direct.
    ClosestDirect,
    /// First alive parent in configuration order.
    FirstupParent,
    /// Round-robin (plain or weighted) pick.
    RoundrobinParent,
    Carp,
    UserhashParent,
    SourcehashParent,
    DefaultParent,
    /// Any alive parent; the never-direct last resort.
    AnyOldParent,
    /// Reuse the client's pinned upstream connection.
    Pinned,
    /// Intercepted traffic forced to the client's original destination.
    OriginalDst,
}

impl HierCode {
    pub fn as_str(self) -> &'static str {
        match self {
            HierCode::HierDirect => "HIER_DIRECT",
            HierCode::SiblingHit => "SIBLING_HIT",
            HierCode::ParentHit => "PARENT_HIT",
            HierCode::CdParentHit => "CD_PARENT_HIT",
            HierCode::CdSiblingHit => "CD_SIBLING_HIT",
            HierCode::ClosestParent => "CLOSEST_PARENT",
            HierCode::ClosestParentMiss => "CLOSEST_PARENT_MISS",
            HierCode::FirstParentMiss => "FIRST_PARENT_MISS",
            HierCode::ClosestDirect => "CLOSEST_DIRECT",
            HierCode::FirstupParent => "FIRSTUP_PARENT",
            HierCode::RoundrobinParent => "ROUNDROBIN_PARENT",
            HierCode::Carp => "CARP",
            HierCode::UserhashParent => "USERHASH_PARENT",
            HierCode::SourcehashParent => "SOURCEHASH_PARENT",
            HierCode::DefaultParent => "DEFAULT_PARENT",
            HierCode::AnyOldParent => "ANY_OLD_PARENT",
            HierCode::Pinned => "PINNED",
            HierCode::OriginalDst => "ORIGINAL_DST",
        }
    }
}

impl fmt::Display for HierCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One selected destination awaiting resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwdServer {
    /// `None` means the origin server (or the pinned connection).
    pub peer: Option<PeerId>,
    pub code: HierCode,
}

/// The ordered chain of selected destinations, with duplicate suppression.
#[derive(Debug, Default)]
pub struct FwdChain {
    nodes: VecDeque<FwdServer>,
}

impl FwdChain {
    pub fn new() -> Self {
        FwdChain::default()
    }

    /// Appends a selection unless it duplicates an earlier one. There can
    /// be at most one PINNED entry; non-PINNED entries are unique by peer
    /// (two DIRECT entries collide on `peer == None` as well).
    pub fn push(&mut self, peer: Option<PeerId>, code: HierCode) -> bool {
        let duplicate = self.nodes.iter().any(|existing| {
            if existing.code == HierCode::Pinned || code == HierCode::Pinned {
                existing.code == HierCode::Pinned && code == HierCode::Pinned
            } else {
                existing.peer == peer
            }
        });
        if duplicate {
            tracing::debug!(%code, ?peer, "skipping duplicate destination");
            return false;
        }
        self.nodes.push_back(FwdServer { peer, code });
        true
    }

    pub fn head(&self) -> Option<&FwdServer> {
        self.nodes.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut FwdServer> {
        self.nodes.front_mut()
    }

    pub fn pop(&mut self) -> Option<FwdServer> {
        self.nodes.pop_front()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FwdServer> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u32) -> PeerId {
        PeerId(n)
    }

    #[test]
    fn keeps_insertion_order() {
        let mut chain = FwdChain::new();
        chain.push(Some(pid(1)), HierCode::ParentHit);
        chain.push(None, HierCode::HierDirect);

        assert_eq!(chain.pop().unwrap().code, HierCode::ParentHit);
        assert_eq!(chain.pop().unwrap().code, HierCode::HierDirect);
        assert!(chain.pop().is_none());
    }

    #[test]
    fn suppresses_duplicate_peers_regardless_of_code() {
        let mut chain = FwdChain::new();
        assert!(chain.push(Some(pid(1)), HierCode::Carp));
        assert!(!chain.push(Some(pid(1)), HierCode::AnyOldParent));
        assert!(chain.push(Some(pid(2)), HierCode::AnyOldParent));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn direct_entries_collide_with_each_other() {
        let mut chain = FwdChain::new();
        assert!(chain.push(None, HierCode::ClosestDirect));
        assert!(!chain.push(None, HierCode::HierDirect));
    }

    #[test]
    fn at_most_one_pinned_entry() {
        let mut chain = FwdChain::new();
        assert!(chain.push(None, HierCode::Pinned));
        assert!(!chain.push(None, HierCode::Pinned));
        // pinned does not collide with a direct origin entry
        assert!(chain.push(None, HierCode::HierDirect));
    }
}
