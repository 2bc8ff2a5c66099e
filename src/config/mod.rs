use std::net::IpAddr;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment, Provider,
};
use serde::{Deserialize, Deserializer, Serialize};

mod validate;

/// Default fn for boolean values
fn bool_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

fn default_http_port() -> u16 {
    3128
}

fn default_udp_port() -> u16 {
    3130
}

fn default_forward_max_tries() -> i32 {
    25
}

fn default_minimum_direct_rtt() -> u32 {
    400
}

fn default_minimum_direct_hops() -> u32 {
    4
}

fn default_ping_timeout_base_ms() -> u64 {
    2_000
}

fn default_peer_fail_limit() -> u32 {
    10
}

fn default_peer_cooldown_secs() -> u64 {
    300
}

fn default_ipcache_ttl_secs() -> u64 {
    60
}

fn default_reqnum_ttl_secs() -> u64 {
    60
}

/// Role a configured peer plays in the hierarchy.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// May fetch misses on our behalf.
    Parent,
    /// Only serves us hits; never fetches.
    Sibling,
}

/// Per-peer feature flags, all defaulting to off.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
pub struct PeerFlagsConfig {
    /// Never consider this peer for the first-miss fallback.
    #[serde(default)]
    pub closest_only: bool,

    /// Outgoing connections to this peer never spoof the client address.
    #[serde(default)]
    pub no_tproxy: bool,

    /// Never send this peer ICP/HTCP queries.
    #[serde(default)]
    pub no_query: bool,

    /// Query with HTCP instead of ICP.
    #[serde(default)]
    pub htcp: bool,

    #[serde(default)]
    pub carp: bool,

    #[serde(default)]
    pub userhash: bool,

    #[serde(default)]
    pub sourcehash: bool,

    #[serde(default)]
    pub round_robin: bool,

    #[serde(default)]
    pub weighted_round_robin: bool,

    /// Last-resort parent when nothing else matched.
    #[serde(default)]
    pub default: bool,
}

/// A per-domain neighbour type override
/// (ex: a sibling that acts as a parent for the domains it owns).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NeighborTypeDomain {
    pub domain: String,

    #[serde(deserialize_with = "peer_kind_deser")]
    pub kind: PeerKind,
}

/// One upstream cache peer.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerConfig {
    /// Hostname used for DNS resolution and hashing.
    pub host: String,

    /// Address replies are matched against (the peer's UDP source address).
    pub addr: IpAddr,

    #[serde(deserialize_with = "peer_kind_deser")]
    pub kind: PeerKind,

    /// The port HTTP requests are forwarded to.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// The port ICP/HTCP queries are sent to. Zero disables queries.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Weight for the hashing and weighted round-robin selectors.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Base RTT offset (ms) subtracted before first-miss weighting.
    #[serde(default)]
    pub base_rtt_ms: u32,

    #[serde(default)]
    pub flags: PeerFlagsConfig,

    /// Domain scoping: suffixes this peer is consulted for. A leading `!`
    /// denies the suffix. An empty list admits every host.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Per-domain overrides of `kind`.
    #[serde(default)]
    pub neighbor_type_domains: Vec<NeighborTypeDomain>,
}

/// The core configuration struct.
/// A configuration file (YAML or through ENV) will be parsed into this
/// struct. Example:
///
/// ```yaml
/// prefer_direct: false
/// forward_max_tries: 25
/// query_icmp: true
/// peers:
///   - host: "parent1.example.net"
///     addr: "192.0.2.10"
///     kind: "parent"
///     http_port: 3128
///     udp_port: 3130
///     weight: 2
///     domains: ["example.net", "!private.example.net"]
/// ```
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Try origin servers before parents when both are permitted.
    #[serde(default)]
    pub prefer_direct: bool,

    /// Allow non-hierarchical requests to go direct instead of via parents.
    #[serde(default = "bool_true")]
    pub nonhierarchical_direct: bool,

    /// For intercepted traffic, always connect to the client's original
    /// destination address when going direct.
    #[serde(default)]
    pub client_dst_passthru: bool,

    /// Cap on destinations reported per request. Negative means unlimited.
    #[serde(default = "default_forward_max_tries")]
    pub forward_max_tries: i32,

    /// Origins at most this many ms away are fetched directly.
    #[serde(default = "default_minimum_direct_rtt")]
    pub minimum_direct_rtt: u32,

    /// Origins at most this many hops away are fetched directly.
    #[serde(default = "default_minimum_direct_hops")]
    pub minimum_direct_hops: u32,

    /// Request RTT hints in queries and feed them to the distance database.
    #[serde(default)]
    pub query_icmp: bool,

    /// Answer peer queries with HIT even for stale objects.
    #[serde(default)]
    pub icp_hit_stale: bool,

    /// Answer MISS_NOFETCH instead of MISS for origins we cannot reach.
    #[serde(default)]
    pub test_reachability: bool,

    /// Probe peers even for requests with private cache keys.
    #[serde(default = "bool_true")]
    pub query_private_keys: bool,

    /// Fixed ping round timeout (ms). Unset derives it from peer RTTs.
    #[serde(default)]
    pub icp_query_timeout_ms: Option<u64>,

    /// Fallback ping round timeout (ms) when no RTT history exists.
    #[serde(default = "default_ping_timeout_base_ms")]
    pub ping_timeout_base_ms: u64,

    /// Consecutive silent rounds before a peer is placed in cooldown.
    #[serde(default = "default_peer_fail_limit")]
    pub peer_fail_limit: u32,

    /// How long a peer stays in cooldown before a revival probe.
    #[serde(default = "default_peer_cooldown_secs")]
    pub peer_cooldown_secs: u64,

    /// Positive DNS answers are reused for this long.
    #[serde(default = "default_ipcache_ttl_secs")]
    pub ipcache_ttl_secs: u64,

    /// Query numbers older than this no longer match replies.
    #[serde(default = "default_reqnum_ttl_secs")]
    pub reqnum_ttl_secs: u64,

    /// Outgoing address hint attached to every destination.
    #[serde(default)]
    pub outgoing_addr: Option<IpAddr>,

    /// The upstream peers queries and requests may be routed to.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            prefer_direct: false,
            nonhierarchical_direct: true,
            client_dst_passthru: false,
            forward_max_tries: default_forward_max_tries(),
            minimum_direct_rtt: default_minimum_direct_rtt(),
            minimum_direct_hops: default_minimum_direct_hops(),
            query_icmp: false,
            icp_hit_stale: false,
            test_reachability: false,
            query_private_keys: true,
            icp_query_timeout_ms: None,
            ping_timeout_base_ms: default_ping_timeout_base_ms(),
            peer_fail_limit: default_peer_fail_limit(),
            peer_cooldown_secs: default_peer_cooldown_secs(),
            ipcache_ttl_secs: default_ipcache_ttl_secs(),
            reqnum_ttl_secs: default_reqnum_ttl_secs(),
            outgoing_addr: None,
            peers: vec![],
        }
    }
}

/// Implement the `Provider` trait for the `Config` struct.
/// This allows the `Config` struct to be used as a configuration provider
/// with *defaults*.
impl Provider for Config {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("naapuri")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(Config::default()).data()
    }
}

/// Load the configuration from a YAML file as a `Config` struct.
///
/// Nested keys can be separated by double underscores (__) in the
/// environment variables. E.g. `NAAPURI_PEER_FAIL_LIMIT=3` sets
/// `peer_fail_limit`.
pub fn load(path: &str) -> Result<Config, figment::Error> {
    let config: Config = Figment::new()
        .merge(Config::default())
        .merge(Yaml::file(path))
        .merge(Env::prefixed("NAAPURI_").split("__"))
        .extract()?;

    // validate configuration and throw error upwards
    validate::check_config(&config).map_err(|err| figment::Error::from(err.to_string()))?;

    Ok(config)
}

/// Deserialize function to convert a string to a `PeerKind` Enum
fn peer_kind_deser<'de, D>(deserializer: D) -> Result<PeerKind, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    match s.to_lowercase().as_str() {
        "parent" => Ok(PeerKind::Parent),
        "sibling" => Ok(PeerKind::Sibling),
        _ => Err(serde::de::Error::custom("expected one of: parent, sibling")),
    }
}
