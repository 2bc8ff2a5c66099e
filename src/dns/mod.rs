//! Non-blocking name resolution for destination building.
//!
//! The core never blocks on DNS. A lookup is requested through an action;
//! the host runs its [`Resolver`] and feeds the outcome back in. The
//! selector then sees the streaming shape it expects: one `note_ip` per
//! address found, followed by exactly one `note_ips` that finalises the
//! lookup. Every streamed address strictly precedes the finalisation.
//!
//! Fresh answers are served from [`cache::IpCache`] without leaving the
//! core.

use std::io;
use std::net::IpAddr;

use async_trait::async_trait;

pub mod cache;

pub use cache::{CachedIps, IpCache};

/// What a finished lookup looked like, for the access log.
#[derive(Debug, Clone, Default)]
pub struct LookupDetails {
    /// Resolver error text, when the lookup failed.
    pub error: Option<String>,
    /// How long the lookup took, milliseconds. `None` for cache answers.
    pub wait_ms: Option<u64>,
}

/// Host-side resolver backend.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolver over the system stack via tokio.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // lookup_host wants a port; it is stripped right back off
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        let ips: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        if ips.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(ips)
    }
}

/// A scripted resolver: fixed answers per name, errors for the rest.
#[derive(Debug, Default)]
pub struct StaticResolver {
    answers: std::collections::HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        StaticResolver::default()
    }

    pub fn answer(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.answers.insert(host.to_ascii_lowercase(), ips.to_vec());
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        match self.answers.get(&host.to_ascii_lowercase()) {
            Some(ips) => Ok(ips.clone()),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown host {host}"),
            )),
        }
    }
}
