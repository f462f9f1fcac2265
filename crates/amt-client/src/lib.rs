//! AMT gateway client
//!
//! Tunnels a source-specific multicast stream from an AMT relay (RFC 7450)
//! to a local UDP consumer on a host without native multicast.
//!
//! ```no_run
//! use amt_client::{AmtGateway, GatewayConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::builder()
//!     .source("198.38.23.145".parse()?)
//!     .group("232.198.38.1".parse()?)
//!     .local_port(7000)
//!     .output_port(5000)
//!     .build()?;
//!
//! let handle = AmtGateway::start(config).await?;
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod health;
pub mod heartbeat;
pub mod relay;
pub mod session;

pub use buffer::PacketBuffer;
pub use config::{GatewayConfig, GatewayConfigBuilder, HealthConfig, HeartbeatPolicy};
pub use error::{GatewayError, RebuildReason};
pub use forwarder::{ReconnectAction, ReconnectPolicy};
pub use gateway::{AmtGateway, GatewayHandle, GatewayState, GatewayStatus};
pub use health::{HealthMonitor, HealthVerdict, ResourceSample, ResourceSampler, SystemSampler};
pub use heartbeat::Heartbeat;
pub use relay::{RelayError, RelayIdentity, RelaySelector, DEFAULT_RELAY_NAME, DEFAULT_RELAY_POOL};
pub use session::{HandshakeState, Session, SessionError};

pub use amt_proto;
