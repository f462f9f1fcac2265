//! Gateway lifecycle: start, stop and liveness

use crate::buffer::{self, PacketBuffer};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::forwarder::ForwardingLoop;
use crate::health::{ResourceSampler, SystemSampler};
use crate::relay::RelaySelector;
use crate::session::{HandshakeState, Session};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info};

/// Gateway lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    /// A session is live and data is being forwarded
    Active,
    /// The session is being rebuilt
    Reconnecting { attempt: u32 },
    /// Stopped on request
    Stopped,
    /// Terminated by a failed forced rebuild
    Failed { error: String },
}

/// Snapshot of gateway liveness
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub state: GatewayState,
    /// Relay of the live session, if any
    pub relay: Option<SocketAddr>,
    pub packets_forwarded: u64,
    pub last_packet_at: Option<Instant>,
    pub reconnect_attempts: u32,
}

impl GatewayStatus {
    fn active(relay: SocketAddr) -> Self {
        Self {
            state: GatewayState::Active,
            relay: Some(relay),
            packets_forwarded: 0,
            last_packet_at: None,
            reconnect_attempts: 0,
        }
    }
}

/// Entry point for running a gateway
pub struct AmtGateway;

impl AmtGateway {
    /// Handshake with the configured relay and start forwarding
    ///
    /// A failed initial handshake is returned rather than retried.
    pub async fn start(config: GatewayConfig) -> Result<GatewayHandle, GatewayError> {
        Self::start_with_sampler(config, Box::new(SystemSampler::new())).await
    }

    /// Like [`AmtGateway::start`], with a custom resource sampler
    pub async fn start_with_sampler(
        config: GatewayConfig,
        sampler: Box<dyn ResourceSampler>,
    ) -> Result<GatewayHandle, GatewayError> {
        config.validate().map_err(GatewayError::InvalidConfig)?;

        info!(
            relay = %config.relay,
            group = %config.group,
            source = %config.source,
            local_port = config.local_port,
            output_port = config.output_port,
            "Starting AMT gateway"
        );

        let selector = RelaySelector::new(config.relay_pool.clone());
        let session = Session::establish(&config, &selector, &config.relay)
            .await
            .map_err(|e| {
                error!(
                    state = %HandshakeState::Failed,
                    failed_during = %e.state(),
                    error = %e,
                    "Initial handshake failed"
                );
                GatewayError::InitialHandshake(e)
            })?;

        let bind_addr = match config.output_host {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let output = UdpSocket::bind(bind_addr)
            .await
            .map_err(GatewayError::ForwardSocket)?;

        let status = Arc::new(watch::channel(GatewayStatus::active(session.relay_addr())).0);
        let status_rx = status.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let buffer = Arc::new(Mutex::new(PacketBuffer::new(config.buffer_capacity)));

        let forwarding_loop = ForwardingLoop::new(
            config,
            selector,
            session,
            output,
            sampler,
            buffer.clone(),
            status.clone(),
            shutdown_rx,
        );

        let task = tokio::spawn(async move {
            let result = forwarding_loop.run().await;
            match &result {
                Ok(()) => status.send_modify(|s| {
                    s.state = GatewayState::Stopped;
                    s.relay = None;
                }),
                Err(e) => {
                    error!(error = %e, "AMT gateway terminated");
                    let error = e.to_string();
                    status.send_modify(|s| {
                        s.state = GatewayState::Failed { error };
                        s.relay = None;
                    });
                }
            }
            result
        });

        Ok(GatewayHandle {
            task: Some(task),
            shutdown: shutdown_tx,
            status: status_rx,
            buffer,
        })
    }
}

/// Handle to a running gateway
///
/// Dropping the handle aborts the forwarding task, closing its sockets.
pub struct GatewayHandle {
    task: Option<JoinHandle<Result<(), GatewayError>>>,
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<GatewayStatus>,
    buffer: Arc<Mutex<PacketBuffer>>,
}

impl GatewayHandle {
    /// Request shutdown and wait for the loop to release its sockets
    pub async fn stop(mut self) -> Result<(), GatewayError> {
        info!("Stopping AMT gateway");
        let _ = self.shutdown.send(true);
        self.wait().await
    }

    /// Wait for the forwarding loop to end
    pub async fn wait(&mut self) -> Result<(), GatewayError> {
        match self.task.as_mut() {
            Some(task) => {
                let result = task.await;
                self.task = None;
                result.map_err(|e| GatewayError::Task(e.to_string()))?
            }
            None => Ok(()),
        }
    }

    pub fn status(&self) -> GatewayStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GatewayStatus> {
        self.status.clone()
    }

    pub fn is_alive(&self) -> bool {
        let running = self.task.as_ref().is_some_and(|task| !task.is_finished());
        running
            && matches!(
                self.status.borrow().state,
                GatewayState::Active | GatewayState::Reconnecting { .. }
            )
    }

    /// Most recently forwarded payloads, oldest first
    pub fn recent_packets(&self) -> Vec<Bytes> {
        buffer::lock(&self.buffer).snapshot()
    }
}

impl Drop for GatewayHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
