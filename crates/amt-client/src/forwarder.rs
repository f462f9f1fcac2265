//! Steady-state receive, decapsulate and forward loop
//!
//! The loop owns the live [`Session`] and the forwarding socket. Every
//! receive is bounded by the poll interval so idle detection, heartbeats and
//! health sampling keep their schedule even when the relay goes quiet.

use crate::buffer::{self, PacketBuffer};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, RebuildReason};
use crate::gateway::{GatewayState, GatewayStatus};
use crate::health::{HealthMonitor, HealthVerdict, ResourceSampler};
use crate::heartbeat::Heartbeat;
use crate::relay::{RelayIdentity, RelaySelector};
use crate::session::{HandshakeState, Session, SessionError};
use amt_proto::{AmtMessage, DEFAULT_MTU};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Idle-rebuild bookkeeping
#[derive(Debug)]
pub struct ReconnectPolicy {
    attempts: u32,
    max_attempts: u32,
}

/// What to do about an idle tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Rebuild against the current relay identity
    Rebuild { attempt: u32 },
    /// Ceiling exceeded: switch to the default relay and force a rebuild
    FallBackToDefault,
}

impl ReconnectPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn on_idle_timeout(&mut self) -> ReconnectAction {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.max_attempts {
            self.attempts = 0;
            ReconnectAction::FallBackToDefault
        } else {
            ReconnectAction::Rebuild {
                attempt: self.attempts,
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

enum Event {
    Shutdown,
    Received(std::io::Result<(usize, SocketAddr)>),
    Timeout,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct ForwardingLoop {
    config: GatewayConfig,
    selector: RelaySelector,
    identity: RelayIdentity,
    session: Option<Session>,
    output: UdpSocket,
    output_addr: SocketAddr,
    reconnect: ReconnectPolicy,
    heartbeat: Heartbeat,
    monitor: HealthMonitor,
    sampler: Box<dyn ResourceSampler>,
    buffer: Arc<Mutex<PacketBuffer>>,
    status: Arc<watch::Sender<GatewayStatus>>,
    shutdown: watch::Receiver<bool>,
    last_packet: Instant,
    packets_forwarded: u64,
}

impl ForwardingLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: GatewayConfig,
        selector: RelaySelector,
        session: Session,
        output: UdpSocket,
        sampler: Box<dyn ResourceSampler>,
        buffer: Arc<Mutex<PacketBuffer>>,
        status: Arc<watch::Sender<GatewayStatus>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let output_addr = SocketAddr::new(config.output_host, config.output_port);
        Self {
            identity: config.relay.clone(),
            reconnect: ReconnectPolicy::new(config.max_reconnect_attempts),
            heartbeat: Heartbeat::new(config.heartbeat_policy, config.heartbeat_after),
            monitor: HealthMonitor::new(config.health.clone()),
            config,
            selector,
            session: Some(session),
            output,
            output_addr,
            sampler,
            buffer,
            status,
            shutdown,
            last_packet: Instant::now(),
            packets_forwarded: 0,
        }
    }

    /// Run until stopped or a forced rebuild fails
    ///
    /// Both sockets are released when this returns.
    pub(crate) async fn run(mut self) -> Result<(), GatewayError> {
        let mut buf = vec![0u8; DEFAULT_MTU];

        info!(
            output = %self.output_addr,
            relay = ?self.session.as_ref().map(Session::relay_addr),
            "Forwarding loop started"
        );

        loop {
            if *self.shutdown.borrow() {
                self.leave().await;
                return Ok(());
            }

            match self.next_event(&mut buf).await {
                Event::Shutdown => {
                    self.leave().await;
                    info!(packets = self.packets_forwarded, "Forwarding loop stopped");
                    return Ok(());
                }
                Event::Received(Ok((len, from))) => {
                    if self.is_from_relay(from) {
                        self.handle_datagram(Bytes::copy_from_slice(&buf[..len]))
                            .await;
                    } else {
                        debug!(from = %from, len, "Dropping datagram from unknown sender");
                    }
                }
                Event::Received(Err(e)) => {
                    warn!(error = %e, "Receive error on tunnel socket");
                }
                Event::Timeout => {
                    if let Flow::Stop = self.on_timeout().await? {
                        return Ok(());
                    }
                }
            }

            let now = Instant::now();
            self.maybe_heartbeat(now).await;
            if let Flow::Stop = self.maybe_check_health(now).await? {
                return Ok(());
            }

            tokio::task::yield_now().await;
        }
    }

    async fn next_event(&mut self, buf: &mut [u8]) -> Event {
        let poll = self.config.poll_interval;
        let shutdown = &mut self.shutdown;

        match &self.session {
            Some(session) => tokio::select! {
                _ = shutdown.changed() => Event::Shutdown,
                received = tokio::time::timeout(poll, session.recv(buf)) => match received {
                    Ok(result) => Event::Received(result),
                    Err(_) => Event::Timeout,
                },
            },
            // Between a failed rebuild and the next attempt
            None => tokio::select! {
                _ = shutdown.changed() => Event::Shutdown,
                _ = tokio::time::sleep(poll) => Event::Timeout,
            },
        }
    }

    fn is_from_relay(&self, from: SocketAddr) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.relay_addr() == from)
    }

    async fn handle_datagram(&mut self, datagram: Bytes) {
        let data = match AmtMessage::decode(datagram) {
            Ok(AmtMessage::MulticastData(data)) => data,
            Ok(AmtMessage::MembershipQuery(query)) => {
                debug!(response_mac = %query.response_mac, "Ignoring membership query");
                return;
            }
            Ok(other) => {
                debug!(message_type = ?other.message_type(), "Ignoring unexpected AMT message");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed tunnel packet");
                return;
            }
        };

        let payload = match data.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable multicast data");
                return;
            }
        };

        buffer::lock(&self.buffer).push(payload.clone());

        if let Err(e) = self.output.send_to(&payload, self.output_addr).await {
            warn!(output = %self.output_addr, error = %e, "Failed to forward payload");
            return;
        }

        let now = Instant::now();
        self.last_packet = now;
        self.packets_forwarded += 1;
        self.reconnect.reset();
        self.heartbeat.reset();

        let packets = self.packets_forwarded;
        self.status.send_if_modified(|status| {
            status.packets_forwarded = packets;
            status.last_packet_at = Some(now);
            status.reconnect_attempts = 0;
            false
        });

        if packets % self.config.log_every_packets == 0 {
            info!(packets, bytes = payload.len(), "Forwarded multicast packets");
        }
    }

    async fn on_timeout(&mut self) -> Result<Flow, GatewayError> {
        let idle = self.last_packet.elapsed();
        if idle <= self.config.idle_reconnect_after {
            return Ok(Flow::Continue);
        }

        match self.reconnect.on_idle_timeout() {
            ReconnectAction::Rebuild { attempt } => {
                warn!(
                    attempt,
                    max_attempts = self.config.max_reconnect_attempts,
                    idle_secs = idle.as_secs_f64(),
                    relay = %self.identity,
                    "No data from relay, rebuilding session"
                );
                self.set_state(GatewayState::Reconnecting { attempt });

                match self.rebuild().await {
                    None => Ok(Flow::Stop),
                    Some(Ok(())) => Ok(Flow::Continue),
                    Some(Err(e)) => {
                        warn!(
                            attempt,
                            state = %HandshakeState::Failed,
                            failed_during = %e.state(),
                            error = %e,
                            "Session rebuild failed"
                        );
                        Ok(Flow::Continue)
                    }
                }
            }
            ReconnectAction::FallBackToDefault => {
                warn!(
                    max_attempts = self.config.max_reconnect_attempts,
                    "Reconnect attempts exhausted, falling back to the default relay"
                );
                self.forced_rebuild(RebuildReason::ReconnectCeiling).await
            }
        }
    }

    async fn maybe_heartbeat(&mut self, now: Instant) {
        let Some(session) = &self.session else {
            return;
        };
        if !self.heartbeat.is_due(now, self.last_packet) {
            return;
        }

        match session.send_membership_update().await {
            Ok(()) => info!(
                relay = %session.relay_addr(),
                idle_secs = now.duration_since(self.last_packet).as_secs_f64(),
                "Heartbeat sent"
            ),
            Err(e) => warn!(relay = %session.relay_addr(), error = %e, "Heartbeat failed"),
        }
        self.heartbeat.mark_sent(now);
    }

    async fn maybe_check_health(&mut self, now: Instant) -> Result<Flow, GatewayError> {
        if !self.monitor.is_due(now) {
            return Ok(Flow::Continue);
        }

        match self.monitor.check(self.sampler.as_mut(), now) {
            HealthVerdict::RestartRequired => {
                let flow = self.forced_rebuild(RebuildReason::ResourcePressure).await?;
                self.monitor.reset();
                Ok(flow)
            }
            HealthVerdict::Normal | HealthVerdict::High { .. } => Ok(Flow::Continue),
        }
    }

    /// Switch to the default relay and rebuild; failure ends the loop
    async fn forced_rebuild(&mut self, reason: RebuildReason) -> Result<Flow, GatewayError> {
        self.identity = RelayIdentity::Default;
        self.reconnect.reset();
        self.set_state(GatewayState::Reconnecting {
            attempt: self.config.max_reconnect_attempts.saturating_add(1),
        });

        match self.rebuild().await {
            None => Ok(Flow::Stop),
            Some(Ok(())) => {
                info!(reason = %reason, "Forced rebuild succeeded");
                Ok(Flow::Continue)
            }
            Some(Err(source)) => {
                error!(reason = %reason, error = %source, "Forced rebuild failed");
                Err(GatewayError::ForcedRebuild { reason, source })
            }
        }
    }

    /// Replace the session wholesale; `None` when a stop request interrupts
    async fn rebuild(&mut self) -> Option<Result<(), SessionError>> {
        // Stop the relay replicating to the old subscription, then free the
        // local port before the new handshake binds it
        self.leave().await;
        self.session = None;

        let shutdown = &mut self.shutdown;
        let result = tokio::select! {
            _ = shutdown.changed() => return None,
            result = Session::establish(&self.config, &self.selector, &self.identity) => result,
        };

        match result {
            Ok(session) => {
                let relay = session.relay_addr();
                self.session = Some(session);
                self.last_packet = Instant::now();
                self.reconnect.reset();
                self.heartbeat.reset();
                self.status.send_modify(|status| {
                    status.state = GatewayState::Active;
                    status.relay = Some(relay);
                    status.reconnect_attempts = 0;
                });
                Some(Ok(()))
            }
            Err(e) => {
                let attempts = self.reconnect.attempts();
                self.status.send_modify(|status| {
                    status.relay = None;
                    status.reconnect_attempts = attempts;
                });
                Some(Err(e))
            }
        }
    }

    async fn leave(&mut self) {
        if let Some(session) = &self.session {
            if let Err(e) = session.send_leave().await {
                warn!(relay = %session.relay_addr(), error = %e, "Failed to send leave");
            }
        }
    }

    fn set_state(&self, state: GatewayState) {
        let attempts = self.reconnect.attempts();
        self.status.send_modify(|status| {
            status.state = state;
            status.reconnect_attempts = attempts;
        });
    }
}
