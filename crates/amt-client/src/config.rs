//! Gateway configuration

use crate::relay::{RelayIdentity, DEFAULT_RELAY_POOL};
use amt_proto::AMT_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// When heartbeats are sent while the tunnel is idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatPolicy {
    /// At most one heartbeat per `heartbeat_after` period while idle
    RateLimited,
    /// One heartbeat on every loop iteration once idle past the threshold
    EveryPoll,
}

/// Host resource watchdog settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// CPU or memory utilisation (percent) counted as high
    pub high_water_percent: f32,
    /// Consecutive high samples that force a session restart
    pub max_consecutive_high: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            high_water_percent: 90.0,
            max_consecutive_high: 5,
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    #[serde(with = "relay_identity")]
    pub relay: RelayIdentity,
    /// Relays behind the default relay name
    pub relay_pool: Vec<IpAddr>,
    pub relay_port: u16,
    pub source: Ipv4Addr,
    pub group: Ipv4Addr,
    /// Local port the tunnel socket binds (0 lets the OS pick)
    pub local_port: u16,
    pub output_host: IpAddr,
    pub output_port: u16,
    /// Bound on each handshake receive
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// Bound on each forwarding-loop receive
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Idle time after which the session is rebuilt
    #[serde(with = "duration_secs")]
    pub idle_reconnect_after: Duration,
    /// Rebuilds against the current relay before falling back to the pool
    pub max_reconnect_attempts: u32,
    /// Idle time after which heartbeats start
    #[serde(with = "duration_secs")]
    pub heartbeat_after: Duration,
    pub heartbeat_policy: HeartbeatPolicy,
    pub health: HealthConfig,
    /// Recent payloads retained for diagnostics
    pub buffer_capacity: usize,
    /// Throughput is logged every this many packets
    pub log_every_packets: u64,
}

/// Helper module for serializing Duration as (fractional) seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod relay_identity {
    use crate::relay::RelayIdentity;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(identity: &RelayIdentity, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(identity)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<RelayIdentity, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(RelayIdentity::from(String::deserialize(deserializer)?))
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            relay: RelayIdentity::Default,
            relay_pool: DEFAULT_RELAY_POOL.to_vec(),
            relay_port: AMT_PORT,
            source: Ipv4Addr::UNSPECIFIED,
            group: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            output_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            output_port: 0,
            handshake_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            idle_reconnect_after: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            heartbeat_after: Duration::from_secs(30),
            heartbeat_policy: HeartbeatPolicy::RateLimited,
            health: HealthConfig::default(),
            buffer_capacity: 100,
            log_every_packets: 1000,
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), String> {
        if !self.group.is_multicast() {
            return Err(format!("group {} is not a multicast address", self.group));
        }
        if self.source.is_unspecified() || self.source.is_multicast() {
            return Err(format!("source {} is not a unicast address", self.source));
        }
        if self.output_port == 0 {
            return Err("output port is required".to_string());
        }
        if self.relay_port == 0 {
            return Err("relay port must be non-zero".to_string());
        }
        if self.relay.is_default() && self.relay_pool.is_empty() {
            return Err("default relay requires a non-empty relay pool".to_string());
        }
        if let RelayIdentity::Literal(host) = &self.relay {
            if host.is_empty() {
                return Err("relay address is empty".to_string());
            }
        }
        if self.handshake_timeout.is_zero() || self.poll_interval.is_zero() {
            return Err("timeouts must be non-zero".to_string());
        }
        if self.buffer_capacity == 0 {
            return Err("buffer capacity must be at least 1".to_string());
        }
        if self.log_every_packets == 0 {
            return Err("log interval must be at least 1 packet".to_string());
        }
        if self.health.interval.is_zero() {
            return Err("health interval must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Builder for GatewayConfig
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn relay(mut self, relay: RelayIdentity) -> Self {
        self.config.relay = relay;
        self
    }

    pub fn relay_pool(mut self, pool: Vec<IpAddr>) -> Self {
        self.config.relay_pool = pool;
        self
    }

    pub fn relay_port(mut self, port: u16) -> Self {
        self.config.relay_port = port;
        self
    }

    pub fn source(mut self, source: Ipv4Addr) -> Self {
        self.config.source = source;
        self
    }

    pub fn group(mut self, group: Ipv4Addr) -> Self {
        self.config.group = group;
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.config.local_port = port;
        self
    }

    pub fn output_port(mut self, port: u16) -> Self {
        self.config.output_port = port;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn idle_reconnect_after(mut self, idle: Duration) -> Self {
        self.config.idle_reconnect_after = idle;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    pub fn heartbeat_after(mut self, idle: Duration) -> Self {
        self.config.heartbeat_after = idle;
        self
    }

    pub fn heartbeat_policy(mut self, policy: HeartbeatPolicy) -> Self {
        self.config.heartbeat_policy = policy;
        self
    }

    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<GatewayConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
