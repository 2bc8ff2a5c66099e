use thiserror::Error;

use super::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("peers[{0}].host cannot be empty")]
    EmptyHost(usize),

    #[error("peers[{0}].weight must be greater than 0")]
    ZeroWeight(usize),

    #[error("peers[{0}].http_port must be greater than 0")]
    ZeroHttpPort(usize),

    #[error("peers[{0}] and peers[{1}] share the address {2}")]
    DuplicateAddr(usize, usize, std::net::IpAddr),

    #[error("peers[{0}].neighbor_type_domains[{1}].domain cannot be empty")]
    EmptyTypeDomain(usize, usize),

    #[error("ping_timeout_base_ms must be greater than 0")]
    ZeroPingTimeout,

    #[error("peer_fail_limit must be greater than 0")]
    ZeroFailLimit,
}

/// given a Config struct, validate the values to ensure
/// that the core won't panic when we try to use them
pub fn check_config(config: &Config) -> Result<(), ConfigError> {
    if config.ping_timeout_base_ms == 0 {
        return Err(ConfigError::ZeroPingTimeout);
    }

    if config.peer_fail_limit == 0 {
        return Err(ConfigError::ZeroFailLimit);
    }

    for (index, peer) in config.peers.iter().enumerate() {
        if peer.host.is_empty() {
            return Err(ConfigError::EmptyHost(index));
        }

        if peer.weight == 0 {
            return Err(ConfigError::ZeroWeight(index));
        }

        if peer.http_port == 0 {
            return Err(ConfigError::ZeroHttpPort(index));
        }

        for (rule_index, rule) in peer.neighbor_type_domains.iter().enumerate() {
            if rule.domain.is_empty() {
                return Err(ConfigError::EmptyTypeDomain(index, rule_index));
            }
        }

        // Reply matching is keyed by source address; two peers on one
        // address would shadow each other.
        for (other_index, other) in config.peers.iter().enumerate().skip(index + 1) {
            if peer.addr == other.addr {
                return Err(ConfigError::DuplicateAddr(index, other_index, peer.addr));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{PeerConfig, PeerFlagsConfig, PeerKind};
    use super::*;

    fn peer(host: &str, addr: &str) -> PeerConfig {
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

    #[test]
    fn accepts_a_sane_config() {
        let mut config = Config::default();
        config.peers.push(peer("p1.example.net", "192.0.2.1"));
        config.peers.push(peer("p2.example.net", "192.0.2.2"));
        assert!(check_config(&config).is_ok());
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let mut config = Config::default();
        config.peers.push(peer("p1.example.net", "192.0.2.1"));
        config.peers.push(peer("p2.example.net", "192.0.2.1"));
        assert!(matches!(
            check_config(&config),
            Err(ConfigError::DuplicateAddr(0, 1, _))
        ));
    }

    #[test]
    fn rejects_zero_ping_timeout() {
        let config = Config {
            ping_timeout_base_ms: 0,
            ..Config::default()
        };
        assert!(matches!(
            check_config(&config),
            Err(ConfigError::ZeroPingTimeout)
        ));
    }
}
