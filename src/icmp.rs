use std::net::IpAddr;
use zerocopy::byteorder::network_endian;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpType {
    V4,
    V6,
}

impl IcmpType {
    pub fn for_addr(addr: IpAddr) -> IcmpType {
        match addr {
            IpAddr::V4(_) => IcmpType::V4,
            IpAddr::V6(_) => IcmpType::V6,
        }
    }

    pub fn echo_request(self) -> u8 {
        match self {
            IcmpType::V4 => 8,
            IcmpType::V6 => 128,
        }
    }

    pub fn echo_reply(self) -> u8 {
        match self {
            IcmpType::V4 => 0,
            IcmpType::V6 => 129,
        }
    }
}

#[repr(C)]
#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Debug, Clone)]
pub struct IcmpEchoHeader {
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub checksum: network_endian::U16,
    pub identifier: network_endian::U16,
    pub sequence_number: network_endian::U16,
}

impl IcmpEchoHeader {
    pub fn request(icmp_type: IcmpType, identifier: u16, sequence: u16) -> IcmpEchoHeader {
        IcmpEchoHeader {
            icmp_type: icmp_type.echo_request(),
            icmp_code: 0,
            checksum: 0.into(),
            identifier: identifier.into(),
            sequence_number: sequence.into(),
        }
    }
}

#[derive(FromBytes, KnownLayout, Immutable, Debug)]
#[repr(C)]
pub struct Ipv4Header {
    pub ver_ihl: u8,
    pub tos: u8,
    pub total_len: network_endian::U16,
    pub identification: network_endian::U16,
    pub flags_frag_offset: network_endian::U16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: network_endian::U16,
    pub source_address: network_endian::U32,
    pub destination_address: network_endian::U32,
}

impl Ipv4Header {
    pub fn header_len(&self) -> usize {
        usize::from(self.ver_ihl & 0x0f) * 4
    }
}

/// Internet checksum (RFC 1071) over `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug)]
pub struct EchoReply<'a> {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: &'a [u8],
    /// ICMP message length, header included.
    pub len: usize,
}

/// Splits a raw IPv4 datagram into its header and ICMP message.
pub fn strip_ipv4_header(buf: &[u8]) -> Option<(&Ipv4Header, &[u8])> {
    let (header, _) = Ipv4Header::ref_from_prefix(buf).ok()?;
    let header_len = header.header_len();
    if header_len < 20 || buf.len() < header_len {
        return None;
    }
    Some((header, &buf[header_len..]))
}

/// Decodes an echo reply; anything else (unreachable, our own requests
/// looped back on raw sockets, truncated data) yields `None`.
pub fn parse_echo_reply(message: &[u8], icmp_type: IcmpType) -> Option<EchoReply<'_>> {
    let (header, payload) = IcmpEchoHeader::ref_from_prefix(message).ok()?;
    if header.icmp_type != icmp_type.echo_reply() || header.icmp_code != 0 {
        return None;
    }
    Some(EchoReply {
        identifier: header.identifier.get(),
        sequence: header.sequence_number.get(),
        payload,
        len: message.len(),
    })
}
