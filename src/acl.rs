//! The access-control gate for direct-policy checks.
//!
//! Before a selector can classify a request it asks the gate whether the
//! `always_direct` and `never_direct` policies apply. Evaluation may finish
//! inline or much later (a pending auth lookup, say); the selector parks
//! until the verdict arrives either way.

use async_trait::async_trait;

use crate::request::RequestContext;

/// Which policy list is being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectPolicy {
    AlwaysDirect,
    NeverDirect,
}

/// Outcome of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Allowed,
    Denied,
    /// No rule matched either way.
    Dunno,
    /// The check needs credentials that are not available on this path.
    /// Treated as [`Answer::Dunno`] after a logged warning.
    AuthRequired,
}

/// Host-side policy evaluator.
#[async_trait]
pub trait AclGate: Send + Sync {
    async fn check(&self, policy: DirectPolicy, request: &RequestContext) -> Answer;
}

/// A gate with fixed verdicts; the default for hosts without direct-policy
/// rules, and the workhorse of tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticGate {
    pub always_direct: Answer,
    pub never_direct: Answer,
}

impl Default for StaticGate {
    fn default() -> Self {
        // no rules configured: neither policy ever matches
        StaticGate {
            always_direct: Answer::Denied,
            never_direct: Answer::Denied,
        }
    }
}

#[async_trait]
impl AclGate for StaticGate {
    async fn check(&self, policy: DirectPolicy, _request: &RequestContext) -> Answer {
        match policy {
            DirectPolicy::AlwaysDirect => self.always_direct,
            DirectPolicy::NeverDirect => self.never_direct,
        }
    }
}
