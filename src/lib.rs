//! Cache peer coordination core for a forwarding HTTP proxy.
//!
//! For every client request the core decides whether a cached object may be
//! used, which upstream peers to consult, how to probe those peers with a
//! bounded ICP/HTCP ping round, and how to turn the chosen peers into an
//! ordered stream of concrete transport destinations handed to a forwarder.
//!
//! The core itself performs no I/O. [`core::CoreContext`] is a deterministic,
//! single-threaded state machine: outside happenings (datagrams, timer fires,
//! ACL verdicts, DNS results) enter through explicit handler calls, and every
//! side effect leaves as a queued [`core::Action`] for the host to perform.
//! [`driver::CoreDriver`] is the batteries-included tokio host: it owns the
//! UDP sockets, arms the ping timer and runs the resolver and ACL adapters.

pub mod acl;
pub mod config;
pub mod core;
pub mod dns;
pub mod driver;
pub mod fingerprint;
pub mod messenger;
pub mod netdb;
pub mod peers;
pub mod ping;
pub mod request;
pub mod selector;
pub mod url;

pub use crate::config::Config;
pub use crate::core::{Action, CoreContext};
pub use crate::driver::{CoreDriver, CoreHandle};
pub use crate::request::{AccessLogHandle, RequestContext, RequestFlags};
pub use crate::selector::{
    Destination, HierCode, PeerSelectionInitiator, SelectionError, SelectorId,
};
