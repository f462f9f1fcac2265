//! Inner IP/UDP handling for replicated multicast datagrams

use crate::{internet_checksum, CodecError};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddrV4;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const UDP_HEADER: usize = 8;

/// Strip the IP and UDP headers from a replicated datagram
///
/// Accepts IPv4 (with or without options) and IPv6 without extension
/// headers. The returned slice is bounded by the UDP length field, so
/// link-layer padding past the datagram is never forwarded.
pub fn udp_payload(packet: &Bytes) -> Result<Bytes, CodecError> {
    let first = *packet.first().ok_or(CodecError::Empty)?;

    let (header_len, ip_end) = match first >> 4 {
        4 => {
            if packet.len() < IPV4_MIN_HEADER {
                return Err(CodecError::Truncated {
                    message: "IPv4 header",
                    needed: IPV4_MIN_HEADER,
                    actual: packet.len(),
                });
            }
            let header_len = usize::from(first & 0x0f) * 4;
            if header_len < IPV4_MIN_HEADER || header_len > packet.len() {
                return Err(CodecError::InvalidPacket("bad IPv4 header length"));
            }
            if packet[9] != IPPROTO_UDP {
                return Err(CodecError::NotUdp(packet[9]));
            }
            let total_len = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
            if total_len < header_len || total_len > packet.len() {
                return Err(CodecError::InvalidPacket("bad IPv4 total length"));
            }
            (header_len, total_len)
        }
        6 => {
            if packet.len() < IPV6_HEADER {
                return Err(CodecError::Truncated {
                    message: "IPv6 header",
                    needed: IPV6_HEADER,
                    actual: packet.len(),
                });
            }
            if packet[6] != IPPROTO_UDP {
                return Err(CodecError::NotUdp(packet[6]));
            }
            let payload_len = usize::from(u16::from_be_bytes([packet[4], packet[5]]));
            if IPV6_HEADER + payload_len > packet.len() {
                return Err(CodecError::InvalidPacket("bad IPv6 payload length"));
            }
            (IPV6_HEADER, IPV6_HEADER + payload_len)
        }
        other => return Err(CodecError::UnsupportedIpVersion(other)),
    };

    if ip_end - header_len < UDP_HEADER {
        return Err(CodecError::Truncated {
            message: "UDP header",
            needed: header_len + UDP_HEADER,
            actual: ip_end,
        });
    }

    let udp = header_len;
    let udp_len = usize::from(u16::from_be_bytes([packet[udp + 4], packet[udp + 5]]));
    if udp_len < UDP_HEADER || udp + udp_len > ip_end {
        return Err(CodecError::InvalidPacket("bad UDP length"));
    }

    Ok(packet.slice(udp + UDP_HEADER..udp + udp_len))
}

/// Build an IPv4/UDP datagram as a multicast source would emit it
///
/// The UDP checksum is left at zero (permitted for IPv4); the IP header
/// checksum is filled in.
pub fn build_ipv4_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Bytes {
    let udp_len = UDP_HEADER + payload.len();
    let total_len = IPV4_MIN_HEADER + udp_len;
    let mut buf = BytesMut::with_capacity(total_len);

    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total_len as u16);
    buf.put_u16(0);
    buf.put_u16(0x4000); // don't fragment
    buf.put_u8(64);
    buf.put_u8(IPPROTO_UDP);
    buf.put_u16(0);
    buf.put_slice(&src.ip().octets());
    buf.put_slice(&dst.ip().octets());

    let checksum = internet_checksum(&buf[..IPV4_MIN_HEADER]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_u16(udp_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);

    buf.freeze()
}
