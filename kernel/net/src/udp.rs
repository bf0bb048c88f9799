//! UDP transport layer.
//!
//! Header build/parse and the pseudo-header checksum.  DNS is the only
//! datagram protocol the stack speaks, so inbound datagrams continue into
//! [`crate::dns`] after the header is peeled.

use crate::buffer::Packet;
use crate::device::{Interface, InterfaceFeatures};
use crate::dns;
use crate::ipv4::{self, Ipv4Addr, Ipv4Proto};
use crate::stack::NetStack;

/// UDP header length.
pub const UDP_HEADER_LEN: usize = 8;

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Header + payload length.
    pub length: u16,
    /// Checksum over the pseudo header and segment (0 = not computed).
    pub checksum: u16,
}

/// Parse the header at the start of `data`.
pub fn parse_udp_header(data: &[u8]) -> Option<UdpHeader> {
    if data.len() < UDP_HEADER_LEN {
        return None;
    }
    let header = UdpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
        checksum: u16::from_be_bytes([data[6], data[7]]),
    };
    if (header.length as usize) < UDP_HEADER_LEN || (header.length as usize) > data.len() {
        return None;
    }
    Some(header)
}

/// Write an 8-byte header at the start of `buf`, checksum left zero.
pub fn write_header(buf: &mut [u8], src_port: u16, dst_port: u16, length: u16) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&length.to_be_bytes());
    buf[6..8].copy_from_slice(&0u16.to_be_bytes());
}

/// Pseudo-header checksum over a complete segment (header + payload).
///
/// A computed value of zero is transmitted as `0xffff` (RFC 768).
pub fn checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = Ipv4Proto::Udp.to_raw();
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = ipv4::sum_words(ipv4::sum_words(0, &pseudo), segment);
    match !ipv4::fold(sum) {
        0 => 0xffff,
        value => value,
    }
}

/// Compute and store the checksum for the segment at the start of `buf`.
pub fn finalize_checksum(buf: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr) {
    buf[6] = 0;
    buf[7] = 0;
    let cks = checksum(src, dst, buf);
    buf[6..8].copy_from_slice(&cks.to_be_bytes());
}

/// Verify a received segment's checksum (checksum 0 means "not computed").
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    let stored = u16::from_be_bytes([segment[6], segment[7]]);
    if stored == 0 {
        return true;
    }
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = Ipv4Proto::Udp.to_raw();
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    ipv4::fold(ipv4::sum_words(ipv4::sum_words(0, &pseudo), segment)) == 0xffff
}

/// Peel the transport header off an inbound datagram.
///
/// Records tag 2 at the UDP header so the dispatcher can match destination
/// ports, then hands the payload to the DNS layer.
pub(crate) fn decode(stack: &NetStack, iface: &Interface, packet: &mut Packet) {
    let offset = packet.index();
    let Some(header) = parse_udp_header(&packet.payload()[offset..]) else {
        klog!(Warn, "net: interface {} dropped a malformed UDP header", iface.name);
        return;
    };

    if !iface.features.contains(InterfaceFeatures::CHECKSUM_RX) {
        let ip_off = packet.tag(1);
        let payload = packet.payload();
        let src = Ipv4Addr([payload[ip_off + 12], payload[ip_off + 13], payload[ip_off + 14], payload[ip_off + 15]]);
        let dst = Ipv4Addr([payload[ip_off + 16], payload[ip_off + 17], payload[ip_off + 18], payload[ip_off + 19]]);
        let segment = &payload[offset..offset + header.length as usize];
        if !verify_checksum(src, dst, segment) {
            klog!(Warn, "net: interface {} dropped a UDP datagram with a bad checksum", iface.name);
            return;
        }
    }

    klog!(Trace, "net: UDP datagram {} -> {} on {}", header.src_port, header.dst_port, iface.name);

    packet.set_tag(2, offset);
    packet.advance(UDP_HEADER_LEN);

    dns::decode(stack, iface, packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = [0u8; UDP_HEADER_LEN];
        write_header(&mut buf, 1234, 53, 20);
        let header = parse_udp_header(&buf).unwrap();
        assert_eq!(header.src_port, 1234);
        assert_eq!(header.dst_port, 53);
        assert_eq!(header.length, 20);
        assert_eq!(header.checksum, 0);
    }

    #[test]
    fn parse_rejects_truncated_segment() {
        assert!(parse_udp_header(&[0x00, 0x50, 0x00, 0x51]).is_none());

        let mut buf = [0u8; UDP_HEADER_LEN];
        write_header(&mut buf, 1, 2, 64); // length field beyond the data
        assert!(parse_udp_header(&buf).is_none());
    }

    #[test]
    fn checksum_round_trip() {
        let src = Ipv4Addr::new(10, 0, 2, 15);
        let dst = Ipv4Addr::new(10, 0, 2, 2);
        let mut segment = [0u8; 16];
        write_header(&mut segment, 1234, 53, 16);
        segment[8..16].copy_from_slice(b"hi there");
        finalize_checksum(&mut segment, src, dst);
        assert!(verify_checksum(src, dst, &segment));

        segment[9] ^= 0xff;
        assert!(!verify_checksum(src, dst, &segment));
    }
}
