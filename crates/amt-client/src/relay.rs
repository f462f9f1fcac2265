//! Relay selection
//!
//! A relay is named either by a literal address or by the well-known
//! default relay name, which stands for a pool of known-good relays. Every
//! session build resolves the identity afresh, so the default name may land
//! on a different pool member each time.

use rand::seq::IndexedRandom;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Symbolic name of the default relay
pub const DEFAULT_RELAY_NAME: &str = "amt-relay.m2icast.net";

/// Known-good relays behind [`DEFAULT_RELAY_NAME`]
pub const DEFAULT_RELAY_POOL: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(162, 250, 138, 201)),
    IpAddr::V4(Ipv4Addr::new(162, 250, 137, 254)),
];

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Default relay pool is empty")]
    EmptyPool,

    #[error("Failed to resolve relay '{host}': {source}")]
    Resolution {
        host: String,
        source: std::io::Error,
    },

    #[error("No addresses found for relay '{0}'")]
    NoAddresses(String),
}

/// How a relay is named
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayIdentity {
    /// The symbolic default relay, resolved through the pool
    Default,
    /// An IP literal or hostname, used as given
    Literal(String),
}

impl RelayIdentity {
    pub fn is_default(&self) -> bool {
        matches!(self, RelayIdentity::Default)
    }
}

impl FromStr for RelayIdentity {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(DEFAULT_RELAY_NAME) {
            Ok(RelayIdentity::Default)
        } else {
            Ok(RelayIdentity::Literal(s.to_string()))
        }
    }
}

impl From<String> for RelayIdentity {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(identity) => identity,
            Err(never) => match never {},
        }
    }
}

impl From<RelayIdentity> for String {
    fn from(identity: RelayIdentity) -> Self {
        identity.to_string()
    }
}

impl fmt::Display for RelayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayIdentity::Default => f.write_str(DEFAULT_RELAY_NAME),
            RelayIdentity::Literal(host) => f.write_str(host),
        }
    }
}

/// Resolves relay identities to concrete addresses
#[derive(Debug, Clone)]
pub struct RelaySelector {
    pool: Vec<IpAddr>,
}

impl RelaySelector {
    pub fn new(pool: Vec<IpAddr>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &[IpAddr] {
        &self.pool
    }

    /// Map an identity to a host: a uniformly chosen pool member for the
    /// default relay, the literal unchanged otherwise
    pub fn resolve(&self, identity: &RelayIdentity) -> Result<String, RelayError> {
        match identity {
            RelayIdentity::Default => self
                .pool
                .choose(&mut rand::rng())
                .map(|addr| addr.to_string())
                .ok_or(RelayError::EmptyPool),
            RelayIdentity::Literal(host) => Ok(host.clone()),
        }
    }

    /// Resolve an identity all the way to the relay's socket address
    ///
    /// IP literals are used directly; hostnames go through DNS, preferring
    /// IPv4 answers since the tunnel carries IGMP.
    pub async fn resolve_addr(
        &self,
        identity: &RelayIdentity,
        port: u16,
    ) -> Result<SocketAddr, RelayError> {
        let host = self.resolve(identity)?;

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|source| RelayError::Resolution {
                host: host.clone(),
                source,
            })?
            .collect();

        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or(RelayError::NoAddresses(host))
    }
}

impl Default for RelaySelector {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_POOL.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parse_identity() {
        assert_eq!(
            "amt-relay.m2icast.net".parse::<RelayIdentity>().unwrap(),
            RelayIdentity::Default
        );
        assert_eq!(
            "162.250.138.201".parse::<RelayIdentity>().unwrap(),
            RelayIdentity::Literal("162.250.138.201".to_string())
        );
        assert_eq!(RelayIdentity::Default.to_string(), DEFAULT_RELAY_NAME);
    }

    #[test]
    fn test_literal_returned_unchanged() {
        let selector = RelaySelector::default();
        let identity = RelayIdentity::Literal("relay.example.net".to_string());
        assert_eq!(selector.resolve(&identity).unwrap(), "relay.example.net");
    }

    #[test]
    fn test_default_picks_pool_members() {
        let pool: Vec<IpAddr> = vec![
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
        ];
        let selector = RelaySelector::new(pool.clone());

        let picked: HashSet<String> = (0..200)
            .map(|_| selector.resolve(&RelayIdentity::Default).unwrap())
            .collect();

        assert!(picked.iter().all(|p| pool.iter().any(|a| a.to_string() == *p)));
        // 200 uniform draws over 3 members miss one with negligible probability
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_empty_pool() {
        let selector = RelaySelector::new(Vec::new());
        assert!(matches!(
            selector.resolve(&RelayIdentity::Default),
            Err(RelayError::EmptyPool)
        ));
    }

    #[tokio::test]
    async fn test_resolve_addr_for_ip_literal() {
        let selector = RelaySelector::default();
        let addr = selector
            .resolve_addr(&RelayIdentity::Literal("127.0.0.1".to_string()), 2268)
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:2268".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_addr_for_default_uses_pool() {
        let selector = RelaySelector::new(vec!["127.0.0.9".parse().unwrap()]);
        let addr = selector
            .resolve_addr(&RelayIdentity::Default, 4000)
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.9:4000".parse().unwrap());
    }
}
