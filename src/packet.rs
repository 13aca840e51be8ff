use crate::icmp::{checksum, IcmpEchoHeader, IcmpType};
use rand::{thread_rng, Rng};
use zerocopy::IntoBytes;

pub const TRACKER_LEN: usize = 8;

/// Echo request template. The payload starts with a per-run tracker so
/// replies can be matched even when the kernel rewrites the identifier
/// (unprivileged datagram sockets).
#[derive(Debug)]
pub struct Packet {
    pub header: IcmpEchoHeader,
    icmp_type: IcmpType,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(icmp_type: IcmpType, identifier: u16, tracker: u64, payload_len: usize) -> Packet {
        let mut rng = thread_rng();
        let mut payload = tracker.to_be_bytes().to_vec();
        payload.extend((TRACKER_LEN..payload_len.max(TRACKER_LEN)).map(|_| rng.gen::<u8>()));
        let header = IcmpEchoHeader::request(icmp_type, identifier, 0);
        let mut packet = Packet {
            header,
            icmp_type,
            payload,
        };
        packet.calculate_checksum();
        packet
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence_number.get()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = self.header.as_bytes().to_vec();
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    // ICMPv6 checksums cover a pseudo-header only the kernel knows; it
    // fills them in for us.
    fn calculate_checksum(&mut self) {
        self.header.checksum = 0.into();
        if self.icmp_type == IcmpType::V4 {
            self.header.checksum = checksum(&self.to_bytes()).into();
        }
    }

    pub fn increment_sequence(&mut self) {
        let next = self.sequence().wrapping_add(1);
        self.header.sequence_number = next.into();
        self.calculate_checksum();
    }
}

/// Reads the tracker back out of a reply payload.
pub fn tracker_of(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; TRACKER_LEN] = payload.get(..TRACKER_LEN)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_request_checksums_to_zero() {
        let packet = Packet::new(IcmpType::V4, 0xbeef, 42, 64);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 8 + 64);
        assert_eq!(bytes[0], 8);
        assert_eq!(checksum(&bytes), 0);
    }

    #[test]
    fn v6_request_leaves_checksum_to_kernel() {
        let packet = Packet::new(IcmpType::V6, 1, 42, 16);
        let bytes = packet.to_bytes();
        assert_eq!(bytes[0], 128);
        assert_eq!(&bytes[2..4], &[0, 0]);
    }

    #[test]
    fn sequence_increments_and_wraps() {
        let mut packet = Packet::new(IcmpType::V4, 1, 7, 8);
        packet.increment_sequence();
        assert_eq!(packet.sequence(), 1);
        assert_eq!(checksum(&packet.to_bytes()), 0);
        packet.header.sequence_number = u16::MAX.into();
        packet.increment_sequence();
        assert_eq!(packet.sequence(), 0);
    }

    #[test]
    fn tracker_survives_the_payload() {
        let packet = Packet::new(IcmpType::V4, 1, 0x0102_0304_0506_0708, 32);
        let bytes = packet.to_bytes();
        assert_eq!(tracker_of(&bytes[8..]), Some(0x0102_0304_0506_0708));
        assert_eq!(tracker_of(&[1, 2, 3]), None);
    }

    #[test]
    fn payload_never_shorter_than_tracker() {
        let packet = Packet::new(IcmpType::V4, 1, 9, 0);
        assert_eq!(packet.to_bytes().len(), 8 + TRACKER_LEN);
    }
}
