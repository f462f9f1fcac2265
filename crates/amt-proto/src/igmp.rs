//! IGMPv3 membership reports (RFC 3376) and their IPv4 encapsulation
//!
//! A Membership Update carries a complete IP packet as if the gateway had
//! sent the report on a native multicast link: an IPv4 header with the
//! Router Alert option, addressed from the unspecified address to the
//! IGMPv3 report group, wrapping the IGMP message itself.

use crate::{internet_checksum, CodecError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

/// IGMPv3 Membership Report message type
pub const IGMP_V3_REPORT: u8 = 0x22;

/// IP protocol number for IGMP
pub const IPPROTO_IGMP: u8 = 2;

/// Source address of an encapsulated report
pub const MCAST_ANYCAST: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Destination of IGMPv3 reports (all IGMPv3-capable hosts and routers)
pub const MCAST_ALLHOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

/// IPv4 Router Alert option, padded to a 4-byte boundary
const ROUTER_ALERT: [u8; 4] = [0x94, 0x04, 0x00, 0x00];

/// IPv4 header length including the Router Alert option
const IP_HEADER_LEN: usize = 24;

/// Fixed part of the IGMPv3 report header
const REPORT_HEADER_LEN: usize = 8;

/// Fixed part of a group record
const RECORD_HEADER_LEN: usize = 8;

/// Group record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupRecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToInclude = 3,
    ChangeToExclude = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl TryFrom<u8> for GroupRecordType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(GroupRecordType::ModeIsInclude),
            2 => Ok(GroupRecordType::ModeIsExclude),
            3 => Ok(GroupRecordType::ChangeToInclude),
            4 => Ok(GroupRecordType::ChangeToExclude),
            5 => Ok(GroupRecordType::AllowNewSources),
            6 => Ok(GroupRecordType::BlockOldSources),
            _ => Err(CodecError::InvalidIgmp("unknown group record type")),
        }
    }
}

/// A single group record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub record_type: GroupRecordType,
    pub group: Ipv4Addr,
    pub sources: Vec<Ipv4Addr>,
}

impl GroupRecord {
    fn encoded_len(&self) -> usize {
        RECORD_HEADER_LEN + 4 * self.sources.len()
    }
}

/// IGMPv3 Membership Report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipReport {
    pub records: Vec<GroupRecord>,
}

impl MembershipReport {
    /// Source-specific join: start receiving `group` from `source` only
    pub fn source_specific_join(group: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self::single(GroupRecordType::AllowNewSources, group, source)
    }

    /// Source-specific leave: stop receiving `group` from `source`
    pub fn source_specific_leave(group: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self::single(GroupRecordType::BlockOldSources, group, source)
    }

    fn single(record_type: GroupRecordType, group: Ipv4Addr, source: Ipv4Addr) -> Self {
        Self {
            records: vec![GroupRecord {
                record_type,
                group,
                sources: vec![source],
            }],
        }
    }

    /// Encode the bare IGMP message (checksum filled in)
    pub fn encode_igmp(&self) -> Bytes {
        let len = REPORT_HEADER_LEN
            + self
                .records
                .iter()
                .map(GroupRecord::encoded_len)
                .sum::<usize>();
        let mut buf = BytesMut::with_capacity(len);

        buf.put_u8(IGMP_V3_REPORT);
        buf.put_u8(0);
        buf.put_u16(0); // checksum placeholder
        buf.put_u16(0);
        buf.put_u16(self.records.len() as u16);

        for record in &self.records {
            buf.put_u8(record.record_type as u8);
            buf.put_u8(0); // aux data len
            buf.put_u16(record.sources.len() as u16);
            buf.put_slice(&record.group.octets());
            for source in &record.sources {
                buf.put_slice(&source.octets());
            }
        }

        let checksum = internet_checksum(&buf);
        buf[2..4].copy_from_slice(&checksum.to_be_bytes());
        buf.freeze()
    }

    /// Encode the report wrapped in its IPv4 header
    pub fn encapsulate(&self) -> Bytes {
        let igmp = self.encode_igmp();
        let total_len = IP_HEADER_LEN + igmp.len();
        let mut buf = BytesMut::with_capacity(total_len);

        buf.put_u8(0x40 | (IP_HEADER_LEN / 4) as u8);
        buf.put_u8(0xc0); // DSCP CS6, as routers send IGMP
        buf.put_u16(total_len as u16);
        buf.put_u16(0); // identification
        buf.put_u16(0); // flags / fragment offset
        buf.put_u8(1); // TTL
        buf.put_u8(IPPROTO_IGMP);
        buf.put_u16(0); // checksum placeholder
        buf.put_slice(&MCAST_ANYCAST.octets());
        buf.put_slice(&MCAST_ALLHOSTS.octets());
        buf.put_slice(&ROUTER_ALERT);

        let checksum = internet_checksum(&buf[..IP_HEADER_LEN]);
        buf[10..12].copy_from_slice(&checksum.to_be_bytes());

        buf.put(igmp);
        buf.freeze()
    }

    /// Decode an IP-encapsulated report, as a relay would on receipt
    pub fn decode_encapsulated(packet: &[u8]) -> Result<Self, CodecError> {
        if packet.is_empty() {
            return Err(CodecError::Empty);
        }
        let version = packet[0] >> 4;
        if version != 4 {
            return Err(CodecError::UnsupportedIpVersion(version));
        }
        let header_len = usize::from(packet[0] & 0x0f) * 4;
        if header_len < 20 || packet.len() < header_len {
            return Err(CodecError::InvalidPacket("bad IPv4 header length"));
        }
        if packet[9] != IPPROTO_IGMP {
            return Err(CodecError::InvalidIgmp("inner packet is not IGMP"));
        }
        Self::decode_igmp(&packet[header_len..])
    }

    /// Decode a bare IGMPv3 report
    pub fn decode_igmp(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < REPORT_HEADER_LEN {
            return Err(CodecError::Truncated {
                message: "IGMPv3 report",
                needed: REPORT_HEADER_LEN,
                actual: data.len(),
            });
        }
        if data[0] != IGMP_V3_REPORT {
            return Err(CodecError::InvalidIgmp("not a version 3 membership report"));
        }
        if internet_checksum(data) != 0 {
            return Err(CodecError::InvalidIgmp("bad checksum"));
        }

        let mut buf = data;
        buf.advance(6);
        let record_count = buf.get_u16();
        let mut records = Vec::with_capacity(usize::from(record_count));

        for _ in 0..record_count {
            if buf.remaining() < RECORD_HEADER_LEN {
                return Err(CodecError::InvalidIgmp("truncated group record"));
            }
            let record_type = GroupRecordType::try_from(buf.get_u8())?;
            let aux_words = usize::from(buf.get_u8());
            let source_count = usize::from(buf.get_u16());
            let group = Ipv4Addr::from(buf.get_u32());

            if buf.remaining() < source_count * 4 + aux_words * 4 {
                return Err(CodecError::InvalidIgmp("truncated source list"));
            }
            let sources = (0..source_count)
                .map(|_| Ipv4Addr::from(buf.get_u32()))
                .collect();
            buf.advance(aux_words * 4);

            records.push(GroupRecord {
                record_type,
                group,
                sources,
            });
        }

        Ok(Self { records })
    }
}
