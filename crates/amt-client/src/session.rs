//! Tunnel session handshake
//!
//! A session is built by walking the gateway side of the RFC 7450 exchange:
//!
//! ```text
//! Idle -> Discovering -> Requesting -> QueryReceived -> Active
//! ```
//!
//! Any receive error or timeout along the way ends in `Failed`. The
//! partially built socket is dropped with the error, so a caller only ever
//! holds a fully established [`Session`].

use crate::config::GatewayConfig;
use crate::relay::{RelayError, RelayIdentity, RelaySelector};
use amt_proto::{
    CodecError, MembershipQuery, MembershipReport, MembershipUpdate, MessageType, Nonce,
    RelayAdvertisement, RelayDiscovery, RelayRequest, ResponseMac, DEFAULT_MTU,
};
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Discovering,
    Requesting,
    QueryReceived,
    Active,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Idle => "idle",
            HandshakeState::Discovering => "discovering",
            HandshakeState::Requesting => "requesting",
            HandshakeState::QueryReceived => "query-received",
            HandshakeState::Active => "active",
            HandshakeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Errors that end a handshake
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Relay selection failed: {0}")]
    Relay(#[from] RelayError),

    #[error("Failed to open tunnel socket on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("Timed out after {timeout:?} while {state}")]
    Timeout {
        state: HandshakeState,
        timeout: Duration,
    },

    #[error("I/O error while {state}: {source}")]
    Io {
        state: HandshakeState,
        source: io::Error,
    },

    #[error("Invalid relay response while {state}: {source}")]
    Codec {
        state: HandshakeState,
        source: CodecError,
    },
}

impl SessionError {
    /// The handshake state that was in progress when the error occurred
    pub fn state(&self) -> HandshakeState {
        match self {
            SessionError::Relay(_) | SessionError::Bind { .. } => HandshakeState::Idle,
            SessionError::Timeout { state, .. }
            | SessionError::Io { state, .. }
            | SessionError::Codec { state, .. } => *state,
        }
    }
}

/// An established tunnel to a relay
#[derive(Debug)]
pub struct Session {
    socket: UdpSocket,
    relay_addr: SocketAddr,
    nonce: Nonce,
    response_mac: ResponseMac,
    group: Ipv4Addr,
    source: Ipv4Addr,
}

impl Session {
    /// Run the full handshake against the relay named by `identity`
    pub async fn establish(
        config: &GatewayConfig,
        selector: &RelaySelector,
        identity: &RelayIdentity,
    ) -> Result<Self, SessionError> {
        let relay_addr = selector.resolve_addr(identity, config.relay_port).await?;
        let socket = bind_tunnel_socket(config.local_port, relay_addr.is_ipv6()).map_err(
            |source| SessionError::Bind {
                port: config.local_port,
                source,
            },
        )?;

        let nonce = Nonce::random();
        let timeout = config.handshake_timeout;
        let mut buf = vec![0u8; DEFAULT_MTU];

        // Idle -> Discovering
        let mut state = HandshakeState::Discovering;
        info!(
            state = %state,
            relay = %relay_addr,
            identity = %identity,
            nonce = %nonce,
            "Sending relay discovery"
        );
        send(&socket, &RelayDiscovery { nonce }.encode(), relay_addr, state).await?;

        let response = recv_expected(
            &socket,
            &mut buf,
            relay_addr,
            MessageType::RelayAdvertisement,
            timeout,
            state,
        )
        .await?;
        match RelayAdvertisement::decode(response) {
            Ok(advertisement) => debug!(
                advertised = %advertisement.relay_address,
                nonce = %advertisement.nonce,
                "Relay advertisement received"
            ),
            Err(e) => debug!(error = %e, "Unrecognised discovery response"),
        }

        // Discovering -> Requesting
        state = HandshakeState::Requesting;
        info!(state = %state, relay = %relay_addr, nonce = %nonce, "Sending relay request");
        let request = RelayRequest { nonce, ipv6: false };
        send(&socket, &request.encode(), relay_addr, state).await?;

        let response = recv_expected(
            &socket,
            &mut buf,
            relay_addr,
            MessageType::MembershipQuery,
            timeout,
            state,
        )
        .await?;
        let query = MembershipQuery::decode(response)
            .map_err(|source| SessionError::Codec { state, source })?;

        // Requesting -> QueryReceived
        state = HandshakeState::QueryReceived;
        if query.nonce.is_some_and(|echoed| echoed != nonce) {
            warn!(
                expected = %nonce,
                received = ?query.nonce,
                "Membership query nonce does not match request"
            );
        }
        info!(
            state = %state,
            relay = %relay_addr,
            response_mac = %query.response_mac,
            "Membership query received"
        );

        let session = Session {
            socket,
            relay_addr,
            nonce,
            response_mac: query.response_mac,
            group: config.group,
            source: config.source,
        };

        session.join_multicast();
        session
            .send_membership_update()
            .await
            .map_err(|source| SessionError::Io { state, source })?;

        // QueryReceived -> Active
        info!(
            state = %HandshakeState::Active,
            relay = %relay_addr,
            group = %session.group,
            source = %session.source,
            nonce = %nonce,
            response_mac = %session.response_mac,
            "Tunnel session established"
        );

        Ok(session)
    }

    /// OS-level join on the tunnel socket; data still arrives encapsulated,
    /// so a host without a multicast route only gets a warning
    fn join_multicast(&self) {
        match self
            .socket
            .join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED)
        {
            Ok(()) => debug!(group = %self.group, "Joined multicast group on tunnel socket"),
            Err(e) => warn!(
                group = %self.group,
                error = %e,
                "OS multicast join failed, continuing with tunnelled delivery"
            ),
        }
    }

    /// Send a source-specific join carrying this session's nonce and MAC
    pub async fn send_membership_update(&self) -> io::Result<()> {
        let report = MembershipReport::source_specific_join(self.group, self.source);
        self.send_report(&report).await?;
        debug!(
            relay = %self.relay_addr,
            group = %self.group,
            source = %self.source,
            "Membership update sent"
        );
        Ok(())
    }

    /// Send a source-specific leave
    pub async fn send_leave(&self) -> io::Result<()> {
        let report = MembershipReport::source_specific_leave(self.group, self.source);
        self.send_report(&report).await?;
        info!(relay = %self.relay_addr, group = %self.group, "Membership leave sent");
        Ok(())
    }

    async fn send_report(&self, report: &MembershipReport) -> io::Result<()> {
        let update = MembershipUpdate::new(self.response_mac, self.nonce, report);
        self.socket.send_to(&update.encode(), self.relay_addr).await?;
        Ok(())
    }

    /// Receive one tunnelled datagram and its sender
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn response_mac(&self) -> ResponseMac {
        self.response_mac
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Open the tunnel socket with address and port reuse on the fixed local port
fn bind_tunnel_socket(port: u16, ipv6: bool) -> io::Result<UdpSocket> {
    let (domain, addr) = if ipv6 {
        (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
    } else {
        (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

async fn send(
    socket: &UdpSocket,
    message: &[u8],
    relay: SocketAddr,
    state: HandshakeState,
) -> Result<(), SessionError> {
    socket
        .send_to(message, relay)
        .await
        .map(|_| ())
        .map_err(|source| SessionError::Io { state, source })
}

/// Wait for a message of type `expected` from the relay
///
/// The fixed local port may still receive Multicast Data replicated for an
/// earlier session, and anyone can send to it, so other senders and other
/// message types are skipped until the step's deadline.
async fn recv_expected(
    socket: &UdpSocket,
    buf: &mut [u8],
    relay: SocketAddr,
    expected: MessageType,
    timeout: Duration,
    state: HandshakeState,
) -> Result<Bytes, SessionError> {
    let deadline = Instant::now() + timeout;

    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(source)) => return Err(SessionError::Io { state, source }),
            Err(_) => return Err(SessionError::Timeout { state, timeout }),
        };

        let message_type = MessageType::peek(&buf[..len]);
        if from != relay || message_type != Some(expected) {
            debug!(
                state = %state,
                from = %from,
                message_type = ?message_type,
                "Skipping datagram while waiting for relay response"
            );
            continue;
        }

        debug!(state = %state, from = %from, len, "Relay response received");
        return Ok(Bytes::copy_from_slice(&buf[..len]));
    }
}
