//! AMT message types (RFC 7450 section 5)

use crate::datagram::udp_payload;
use crate::igmp::MembershipReport;
use crate::{CodecError, AMT_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// AMT message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RelayDiscovery = 1,
    RelayAdvertisement = 2,
    RelayRequest = 3,
    MembershipQuery = 4,
    MembershipUpdate = 5,
    MulticastData = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::RelayDiscovery),
            2 => Ok(MessageType::RelayAdvertisement),
            3 => Ok(MessageType::RelayRequest),
            4 => Ok(MessageType::MembershipQuery),
            5 => Ok(MessageType::MembershipUpdate),
            6 => Ok(MessageType::MulticastData),
            _ => Err(CodecError::UnknownMessageType(value)),
        }
    }
}

impl MessageType {
    /// Type tag of a raw message, if it carries a known one
    pub fn peek(buf: &[u8]) -> Option<Self> {
        buf.first()
            .and_then(|first| MessageType::try_from(first & 0x0f).ok())
    }
}

/// Per-handshake correlation value sent in Discovery and Request
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub [u8; 4]);

impl Nonce {
    pub const LEN: usize = 4;

    /// Fresh random nonce
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// Relay-issued response token, echoed back in every Membership Update
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseMac(pub [u8; 6]);

impl ResponseMac {
    pub const LEN: usize = 6;
}

impl fmt::Debug for ResponseMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseMac({})", self)
    }
}

impl fmt::Display for ResponseMac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Validate the version/type byte and the minimum length of a message
fn check_header(buf: &[u8], expected: MessageType, min_len: usize) -> Result<(), CodecError> {
    let first = *buf.first().ok_or(CodecError::Empty)?;
    let version = first >> 4;
    if version != AMT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let actual = first & 0x0f;
    if actual != expected as u8 {
        return Err(CodecError::UnexpectedMessageType {
            expected: expected as u8,
            actual,
        });
    }
    if buf.len() < min_len {
        return Err(CodecError::Truncated {
            message: message_name(expected),
            needed: min_len,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn message_name(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::RelayDiscovery => "relay discovery",
        MessageType::RelayAdvertisement => "relay advertisement",
        MessageType::RelayRequest => "relay request",
        MessageType::MembershipQuery => "membership query",
        MessageType::MembershipUpdate => "membership update",
        MessageType::MulticastData => "multicast data",
    }
}

fn get_nonce(buf: &mut Bytes) -> Nonce {
    let mut nonce = [0u8; Nonce::LEN];
    buf.copy_to_slice(&mut nonce);
    Nonce(nonce)
}

fn get_mac(buf: &mut Bytes) -> ResponseMac {
    let mut mac = [0u8; ResponseMac::LEN];
    buf.copy_to_slice(&mut mac);
    ResponseMac(mac)
}

/// Relay Discovery (type 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDiscovery {
    pub nonce: Nonce,
}

impl RelayDiscovery {
    /// type (1) + reserved (3) + nonce (4)
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(MessageType::RelayDiscovery as u8);
        buf.put_bytes(0, 3);
        buf.put_slice(&self.nonce.0);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        check_header(&buf, MessageType::RelayDiscovery, Self::SIZE)?;
        buf.advance(4);
        Ok(Self {
            nonce: get_nonce(&mut buf),
        })
    }
}

/// Relay Advertisement (type 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAdvertisement {
    pub nonce: Nonce,
    pub relay_address: IpAddr,
}

impl RelayAdvertisement {
    /// Header plus an IPv4 relay address
    pub const MIN_SIZE: usize = 12;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(MessageType::RelayAdvertisement as u8);
        buf.put_bytes(0, 3);
        buf.put_slice(&self.nonce.0);
        match self.relay_address {
            IpAddr::V4(addr) => buf.put_slice(&addr.octets()),
            IpAddr::V6(addr) => buf.put_slice(&addr.octets()),
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        check_header(&buf, MessageType::RelayAdvertisement, Self::MIN_SIZE)?;
        buf.advance(4);
        let nonce = get_nonce(&mut buf);
        let relay_address = if buf.remaining() >= 16 {
            IpAddr::V6(Ipv6Addr::from(buf.get_u128()))
        } else {
            IpAddr::V4(Ipv4Addr::from(buf.get_u32()))
        };
        Ok(Self {
            nonce,
            relay_address,
        })
    }
}

/// Relay Request (type 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayRequest {
    pub nonce: Nonce,
    /// `P` flag: the gateway wants IPv6 (MLD) rather than IPv4 (IGMP) queries
    pub ipv6: bool,
}

impl RelayRequest {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(MessageType::RelayRequest as u8);
        buf.put_u8(u8::from(self.ipv6));
        buf.put_u16(0);
        buf.put_slice(&self.nonce.0);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        check_header(&buf, MessageType::RelayRequest, Self::SIZE)?;
        buf.advance(1);
        let ipv6 = buf.get_u8() & 0x01 != 0;
        buf.advance(2);
        Ok(Self {
            nonce: get_nonce(&mut buf),
            ipv6,
        })
    }
}

/// Membership Query (type 4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipQuery {
    /// `L` flag: relay limits gateway query response rate
    pub limited: bool,
    /// `G` flag: gateway address fields follow the encapsulated query
    pub has_gateway_address: bool,
    pub response_mac: ResponseMac,
    /// Absent only when a relay truncates the message after the MAC
    pub nonce: Option<Nonce>,
    /// Encapsulated general query plus any trailing gateway address fields
    pub encapsulated_query: Bytes,
}

impl MembershipQuery {
    const FLAG_L: u8 = 0x02;
    const FLAG_G: u8 = 0x01;

    /// type (1) + flags (1) + response MAC (6)
    pub const MAC_END: usize = 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.encapsulated_query.len());
        buf.put_u8(MessageType::MembershipQuery as u8);
        let mut flags = 0;
        if self.limited {
            flags |= Self::FLAG_L;
        }
        if self.has_gateway_address {
            flags |= Self::FLAG_G;
        }
        buf.put_u8(flags);
        buf.put_slice(&self.response_mac.0);
        if let Some(nonce) = self.nonce {
            buf.put_slice(&nonce.0);
        }
        buf.put_slice(&self.encapsulated_query);
        buf.freeze()
    }

    /// Decode a query; fails with [`CodecError::MissingResponseMac`] when the
    /// message cannot hold the response MAC
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        check_header(&buf, MessageType::MembershipQuery, 1)?;
        if buf.len() < Self::MAC_END {
            return Err(CodecError::MissingResponseMac(buf.len()));
        }
        buf.advance(1);
        let flags = buf.get_u8();
        let response_mac = get_mac(&mut buf);
        let nonce = (buf.remaining() >= Nonce::LEN).then(|| get_nonce(&mut buf));

        Ok(Self {
            limited: flags & Self::FLAG_L != 0,
            has_gateway_address: flags & Self::FLAG_G != 0,
            response_mac,
            nonce,
            encapsulated_query: buf,
        })
    }
}

/// Membership Update (type 5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub response_mac: ResponseMac,
    pub nonce: Nonce,
    /// IP-encapsulated IGMP report
    pub encapsulated_report: Bytes,
}

impl MembershipUpdate {
    pub const HEADER_SIZE: usize = 12;

    pub fn new(response_mac: ResponseMac, nonce: Nonce, report: &MembershipReport) -> Self {
        Self {
            response_mac,
            nonce,
            encapsulated_report: report.encapsulate(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.encapsulated_report.len());
        buf.put_u8(MessageType::MembershipUpdate as u8);
        buf.put_u8(0);
        buf.put_slice(&self.response_mac.0);
        buf.put_slice(&self.nonce.0);
        buf.put_slice(&self.encapsulated_report);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        check_header(&buf, MessageType::MembershipUpdate, Self::HEADER_SIZE)?;
        buf.advance(2);
        let response_mac = get_mac(&mut buf);
        let nonce = get_nonce(&mut buf);
        Ok(Self {
            response_mac,
            nonce,
            encapsulated_report: buf,
        })
    }

    /// Parse the encapsulated IGMP report
    pub fn report(&self) -> Result<MembershipReport, CodecError> {
        MembershipReport::decode_encapsulated(&self.encapsulated_report)
    }
}

/// Multicast Data (type 6)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastData {
    /// The replicated IP datagram exactly as the source sent it
    pub packet: Bytes,
}

impl MulticastData {
    /// type (1) + reserved (1)
    pub const HEADER_SIZE: usize = 2;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.packet.len());
        buf.put_u8(MessageType::MulticastData as u8);
        buf.put_u8(0);
        buf.put_slice(&self.packet);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        check_header(&buf, MessageType::MulticastData, Self::HEADER_SIZE + 1)?;
        buf.advance(Self::HEADER_SIZE);
        Ok(Self { packet: buf })
    }

    /// Application payload of the inner UDP datagram
    pub fn payload(&self) -> Result<Bytes, CodecError> {
        udp_payload(&self.packet)
    }
}

/// Any AMT message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmtMessage {
    RelayDiscovery(RelayDiscovery),
    RelayAdvertisement(RelayAdvertisement),
    RelayRequest(RelayRequest),
    MembershipQuery(MembershipQuery),
    MembershipUpdate(MembershipUpdate),
    MulticastData(MulticastData),
}

impl AmtMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            AmtMessage::RelayDiscovery(_) => MessageType::RelayDiscovery,
            AmtMessage::RelayAdvertisement(_) => MessageType::RelayAdvertisement,
            AmtMessage::RelayRequest(_) => MessageType::RelayRequest,
            AmtMessage::MembershipQuery(_) => MessageType::MembershipQuery,
            AmtMessage::MembershipUpdate(_) => MessageType::MembershipUpdate,
            AmtMessage::MulticastData(_) => MessageType::MulticastData,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            AmtMessage::RelayDiscovery(m) => m.encode(),
            AmtMessage::RelayAdvertisement(m) => m.encode(),
            AmtMessage::RelayRequest(m) => m.encode(),
            AmtMessage::MembershipQuery(m) => m.encode(),
            AmtMessage::MembershipUpdate(m) => m.encode(),
            AmtMessage::MulticastData(m) => m.encode(),
        }
    }

    /// Decode a message by its type tag
    pub fn decode(buf: Bytes) -> Result<Self, CodecError> {
        let first = *buf.first().ok_or(CodecError::Empty)?;
        match MessageType::try_from(first & 0x0f)? {
            MessageType::RelayDiscovery => RelayDiscovery::decode(buf).map(Self::RelayDiscovery),
            MessageType::RelayAdvertisement => {
                RelayAdvertisement::decode(buf).map(Self::RelayAdvertisement)
            }
            MessageType::RelayRequest => RelayRequest::decode(buf).map(Self::RelayRequest),
            MessageType::MembershipQuery => {
                MembershipQuery::decode(buf).map(Self::MembershipQuery)
            }
            MessageType::MembershipUpdate => {
                MembershipUpdate::decode(buf).map(Self::MembershipUpdate)
            }
            MessageType::MulticastData => MulticastData::decode(buf).map(Self::MulticastData),
        }
    }
}
