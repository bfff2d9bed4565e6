// Wire format primitives for the packet backend: scatter-gather payloads
// carried in single UDP/IPv4/Ethernet datagrams.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::api::{Sga, MAX_SGA_SEGMENTS};

/// Ethernet header length.
pub const ETHER_HDR_LEN: usize = 14;

/// IPv4 header length (no options).
pub const IPV4_HDR_LEN: usize = 20;

/// UDP header length.
pub const UDP_HDR_LEN: usize = 8;

/// Per-segment length cell width inside the datagram payload.
pub const SEG_CELL: usize = 4;

const ETHERTYPE_IPV4: u16 = 0x0800;
const IP_VHL: u8 = 0x45;
const IP_TTL: u8 = 64;
const IPPROTO_UDP: u8 = 17;

/// Packet-codec error. Raised only on the transmit path; receive-side
/// problems are silent drops (see [`DropReason`]).
#[derive(Debug, Error)]
pub enum PacketError {
    /// The encoded frame would not fit in one datagram.
    #[error("frame of {len} bytes exceeds the {mtu}-byte MTU")]
    FrameTooLarge { len: usize, mtu: usize },

    /// A MAC address string did not parse.
    #[error("invalid mac address '{0}'")]
    BadMac(String),
}

/// 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// The Ethernet broadcast address.
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// True for the broadcast address.
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(PacketError::BadMac(s.to_string()));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| PacketError::BadMac(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(PacketError::BadMac(s.to_string()));
        }
        Ok(MacAddr(bytes))
    }
}

/// Why a received frame was silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Destination MAC is not the local NIC.
    WrongMac,
    /// Ethertype is not IPv4.
    WrongEtherType,
    /// IP destination does not match the bound address.
    WrongIp,
    /// IP protocol is not UDP.
    NotUdp,
    /// UDP destination port does not match the bound port.
    WrongPort,
    /// Truncated or inconsistent frame contents.
    Malformed,
}

impl DropReason {
    /// Stable label used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::WrongMac => "wrong_mac",
            DropReason::WrongEtherType => "wrong_ethertype",
            DropReason::WrongIp => "wrong_ip",
            DropReason::NotUdp => "not_udp",
            DropReason::WrongPort => "wrong_port",
            DropReason::Malformed => "malformed",
        }
    }
}

/// Folded one's-complement sum over the IPv4 header.
pub fn ip_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = header.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Encodes one datagram frame.
///
/// Layer-2/3/4 header fields are network byte order; the segment count and
/// length cells inside the payload are host order, matching the stream
/// framing. The UDP checksum is left zero; the IPv4 checksum is computed
/// over the finished header.
pub fn build_frame(
    sga: &Sga,
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: SocketAddrV4,
    dst: SocketAddrV4,
    mtu: usize,
) -> Result<Bytes, PacketError> {
    let payload_len: usize = SEG_CELL
        + sga
            .segments
            .iter()
            .map(|seg| SEG_CELL + seg.len())
            .sum::<usize>();
    let ip_len = IPV4_HDR_LEN + UDP_HDR_LEN + payload_len;
    if ip_len > mtu {
        return Err(PacketError::FrameTooLarge { len: ip_len, mtu });
    }

    let mut out = BytesMut::with_capacity(ETHER_HDR_LEN + ip_len);

    // Ethernet
    out.put_slice(&dst_mac.0);
    out.put_slice(&src_mac.0);
    out.put_u16(ETHERTYPE_IPV4);

    // IPv4
    let ip_start = out.len();
    out.put_u8(IP_VHL);
    out.put_u8(0); // DSCP/ECN
    out.put_u16(ip_len as u16);
    out.put_u32(0); // identification, flags, fragment offset
    out.put_u8(IP_TTL);
    out.put_u8(IPPROTO_UDP);
    out.put_u16(0); // checksum placeholder
    out.put_slice(&src.ip().octets());
    out.put_slice(&dst.ip().octets());
    let checksum = ip_checksum(&out[ip_start..ip_start + IPV4_HDR_LEN]);
    out[ip_start + 10..ip_start + 12].copy_from_slice(&checksum.to_be_bytes());

    // UDP, checksum omitted
    out.put_u16(src.port());
    out.put_u16(dst.port());
    out.put_u16((UDP_HDR_LEN + payload_len) as u16);
    out.put_u16(0);

    // scatter-gather payload
    out.put_slice(&(sga.num_segments() as u32).to_ne_bytes());
    for seg in &sga.segments {
        out.put_slice(&(seg.len() as u32).to_ne_bytes());
        out.put_slice(seg);
    }

    Ok(out.freeze())
}

/// Validates and decodes one received frame.
///
/// `Err(reason)` means the frame is not for this queue and must be dropped
/// without completing any token. Decoded segments are copied into fresh
/// allocations so the device buffer can be recycled immediately; the
/// returned address is the sender's.
pub fn parse_frame(
    frame: &[u8],
    local_mac: MacAddr,
    bound: Option<SocketAddrV4>,
) -> Result<(Sga, SocketAddrV4), DropReason> {
    if frame.len() < ETHER_HDR_LEN + IPV4_HDR_LEN + UDP_HDR_LEN + SEG_CELL {
        return Err(DropReason::Malformed);
    }

    let dst_mac = MacAddr(frame[0..6].try_into().expect("6-byte slice"));
    if dst_mac != local_mac {
        return Err(DropReason::WrongMac);
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return Err(DropReason::WrongEtherType);
    }

    let ip = &frame[ETHER_HDR_LEN..];
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);
    let dst_ip = Ipv4Addr::new(ip[16], ip[17], ip[18], ip[19]);
    if let Some(addr) = bound {
        if dst_ip != *addr.ip() {
            return Err(DropReason::WrongIp);
        }
    }
    if ip[9] != IPPROTO_UDP {
        return Err(DropReason::NotUdp);
    }

    let udp = &ip[IPV4_HDR_LEN..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    if let Some(addr) = bound {
        if dst_port != addr.port() {
            return Err(DropReason::WrongPort);
        }
    }

    let payload = &udp[UDP_HDR_LEN..];
    let seg_count = u32::from_ne_bytes(payload[0..SEG_CELL].try_into().expect("4-byte slice"));
    if seg_count == 0 || seg_count as usize > MAX_SGA_SEGMENTS {
        return Err(DropReason::Malformed);
    }

    let mut segments = Vec::with_capacity(seg_count as usize);
    let mut offset = SEG_CELL;
    for _ in 0..seg_count {
        let cell_end = offset
            .checked_add(SEG_CELL)
            .filter(|end| *end <= payload.len())
            .ok_or(DropReason::Malformed)?;
        let len = u32::from_ne_bytes(payload[offset..cell_end].try_into().expect("4-byte slice"))
            as usize;
        let body_end = cell_end
            .checked_add(len)
            .filter(|end| *end <= payload.len())
            .ok_or(DropReason::Malformed)?;
        segments.push(Bytes::copy_from_slice(&payload[cell_end..body_end]));
        offset = body_end;
    }

    let peer = SocketAddrV4::new(src_ip, src_port);
    Ok((Sga::new(segments).with_addr(peer), peer))
}
