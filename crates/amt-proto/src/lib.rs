//! AMT Protocol Definitions
//!
//! This crate defines the wire format for Automatic Multicast Tunneling
//! (RFC 7450) as spoken by a gateway, plus the IGMPv3 membership report that
//! rides inside a Membership Update and the inner IP/UDP parsing needed to
//! unwrap Multicast Data.

pub mod datagram;
pub mod igmp;
pub mod messages;

pub use datagram::{build_ipv4_udp, udp_payload};
pub use igmp::{GroupRecord, GroupRecordType, MembershipReport};
pub use messages::*;

use thiserror::Error;

/// UDP port relays listen on for gateway messages
pub const AMT_PORT: u16 = 2268;

/// AMT protocol version carried in the high nibble of every message
pub const AMT_VERSION: u8 = 0;

/// Receive bound for a single tunnelled datagram
pub const DEFAULT_MTU: usize = 1500;

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Empty message")]
    Empty,

    #[error("Truncated {message}: need {needed} bytes, got {actual}")]
    Truncated {
        message: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("Membership query too short for response MAC: {0} bytes")]
    MissingResponseMac(usize),

    #[error("Unsupported AMT version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown AMT message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unexpected AMT message type: expected {expected}, got {actual}")]
    UnexpectedMessageType { expected: u8, actual: u8 },

    #[error("Unsupported inner IP version: {0}")]
    UnsupportedIpVersion(u8),

    #[error("Inner packet is not UDP (protocol {0})")]
    NotUdp(u8),

    #[error("Invalid inner packet: {0}")]
    InvalidPacket(&'static str),

    #[error("Invalid IGMP message: {0}")]
    InvalidIgmp(&'static str),
}

/// Internet checksum (RFC 1071) over `data`
pub(crate) fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_verifies_to_zero() {
        // IPv4 header from RFC 1071 style worked examples
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let checksum = internet_checksum(&header);
        assert_eq!(checksum, 0xb861);

        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(internet_checksum(&header), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(internet_checksum(&[0xff]), !0xff00);
    }
}
