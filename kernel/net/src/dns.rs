//! DNS query codec.
//!
//! DGRAM sockets send standard queries through
//! [`prepare_packet_query`]/[`finalize_packet`]; the codec writes the full
//! Ethernet + IPv4 + UDP + DNS header chain and the caller appends the
//! question section at the returned index.  Sending responses is not
//! implemented.  Inbound datagrams are tagged and propagated; parsing the
//! message body is the receiver's business.

use crate::buffer::{Packet, PreparedPacket, MAX_LAYERS};
use crate::device::Interface;
use crate::ethernet::{self, ETHERTYPE_IPV4, ETH_BROADCAST, ETH_HEADER_LEN};
use crate::ipv4::{self, Ipv4Addr, Ipv4Proto, IPV4_HEADER_LEN};
use crate::socket::{SocketError, SocketProtocol};
use crate::stack::NetStack;
use crate::udp::{self, UDP_HEADER_LEN};

/// DNS message header length.
pub const DNS_HEADER_LEN: usize = 12;

/// Well-known DNS server port.
pub const DNS_PORT: u16 = 53;

/// Header flags for a standard query with recursion desired.
const DNS_FLAGS_QUERY_RD: u16 = 0x0100;

/// What the caller wants in an outbound DNS message.
#[derive(Debug, Clone, Copy)]
pub struct DnsDescriptor {
    /// Server address.
    pub target_ip: Ipv4Addr,
    /// Source port override for RAW sockets (DGRAM sockets use their bound
    /// port).
    pub source_port: u16,
    /// Transaction identifier echoed by the server.
    pub identification: u16,
    /// Bytes of question section the caller will write.
    pub payload_size: usize,
    /// `true` for a query; responses are not implemented.
    pub query: bool,
}

/// Write Ethernet + IPv4 + UDP + DNS headers for a standard query.
///
/// The caller writes the question section at the returned index.
pub fn prepare_packet_query(
    buf: &mut [u8],
    iface: &Interface,
    target_ip: Ipv4Addr,
    source_port: u16,
    identification: u16,
    payload_size: usize,
) -> Result<PreparedPacket, SocketError> {
    let total = ETH_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + DNS_HEADER_LEN + payload_size;
    if buf.len() < total {
        return Err(SocketError::BufferTooSmall);
    }

    let dst_mac = if target_ip.is_loopback() {
        iface.mac_bytes()
    } else {
        ETH_BROADCAST
    };
    ethernet::write_header(buf, dst_mac, iface.mac_bytes(), ETHERTYPE_IPV4);

    ipv4::write_header(
        &mut buf[ETH_HEADER_LEN..],
        (IPV4_HEADER_LEN + UDP_HEADER_LEN + DNS_HEADER_LEN + payload_size) as u16,
        Ipv4Proto::Udp,
        iface.ip_address,
        target_ip,
    );

    let udp_off = ETH_HEADER_LEN + IPV4_HEADER_LEN;
    udp::write_header(
        &mut buf[udp_off..],
        source_port,
        DNS_PORT,
        (UDP_HEADER_LEN + DNS_HEADER_LEN + payload_size) as u16,
    );

    let dns_off = udp_off + UDP_HEADER_LEN;
    buf[dns_off..dns_off + 2].copy_from_slice(&identification.to_be_bytes());
    buf[dns_off + 2..dns_off + 4].copy_from_slice(&DNS_FLAGS_QUERY_RD.to_be_bytes());
    buf[dns_off + 4..dns_off + 6].copy_from_slice(&1u16.to_be_bytes()); // one question
    for byte in &mut buf[dns_off + 6..dns_off + DNS_HEADER_LEN] {
        *byte = 0;
    }

    let mut tags = [0u16; MAX_LAYERS];
    tags[1] = ETH_HEADER_LEN as u16;
    tags[2] = udp_off as u16;
    tags[3] = dns_off as u16;

    Ok(PreparedPacket {
        iface: iface.id,
        index: dns_off + DNS_HEADER_LEN,
        tags,
        size: total,
    })
}

/// Finalize checksums over the caller's buffer and enqueue the frame for
/// transmit.
pub fn finalize_packet(
    iface: &Interface,
    prepared: &PreparedPacket,
    buf: &mut [u8],
) -> Result<(), SocketError> {
    if buf.len() < prepared.size {
        return Err(SocketError::BufferTooSmall);
    }
    let ip_off = prepared.tags[1] as usize;
    let udp_off = prepared.tags[2] as usize;

    let src = Ipv4Addr([buf[ip_off + 12], buf[ip_off + 13], buf[ip_off + 14], buf[ip_off + 15]]);
    let dst = Ipv4Addr([buf[ip_off + 16], buf[ip_off + 17], buf[ip_off + 18], buf[ip_off + 19]]);
    let size = prepared.size;
    udp::finalize_checksum(&mut buf[udp_off..size], src, dst);

    ipv4::finalize_checksum(&mut buf[ip_off..]);

    let mut packet = Packet::from_frame(&buf[..size], prepared.iface);
    packet.apply_layout(prepared);
    iface.send(packet);
    Ok(())
}

/// Tag an inbound DNS message and propagate it to listening sockets.
///
/// The cursor stays at the DNS header: the message, header included, is the
/// application payload.
pub(crate) fn decode(stack: &NetStack, iface: &Interface, packet: &mut Packet) {
    let offset = packet.index();
    if packet.payload().len() >= offset + DNS_HEADER_LEN {
        packet.set_tag(3, offset);
        let id = u16::from_be_bytes([packet.payload()[offset], packet.payload()[offset + 1]]);
        klog!(Trace, "net: DNS message {:#06x} on {}", id, iface.name);
    }

    stack.propagate_packet(packet, SocketProtocol::Dns);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn prepare_lays_out_query() {
        let mut iface = Interface::new(0, "loopback".to_string(), 0);
        crate::loopback::init_driver(&mut iface);

        let mut buf = [0u8; 128];
        let prepared =
            prepare_packet_query(&mut buf, &iface, Ipv4Addr::LOCALHOST, 1234, 0xbeef, 10).unwrap();

        assert_eq!(prepared.index, 54);
        assert_eq!(prepared.size, 64);
        assert_eq!(prepared.tags[2], 34);
        assert_eq!(prepared.tags[3], 42);

        // UDP source port and well-known destination.
        assert_eq!(u16::from_be_bytes([buf[34], buf[35]]), 1234);
        assert_eq!(u16::from_be_bytes([buf[36], buf[37]]), DNS_PORT);
        // Transaction id, query flags, one question.
        assert_eq!(u16::from_be_bytes([buf[42], buf[43]]), 0xbeef);
        assert_eq!(u16::from_be_bytes([buf[44], buf[45]]), 0x0100);
        assert_eq!(u16::from_be_bytes([buf[46], buf[47]]), 1);
    }

    #[test]
    fn finalize_produces_a_verifiable_segment() {
        let mut iface = Interface::new(0, "loopback".to_string(), 0);
        crate::loopback::init_driver(&mut iface);

        let mut buf = [0u8; 128];
        let prepared =
            prepare_packet_query(&mut buf, &iface, Ipv4Addr::LOCALHOST, 1234, 1, 4).unwrap();
        buf[prepared.index..prepared.size].copy_from_slice(b"quiz");
        finalize_packet(&iface, &prepared, &mut buf).unwrap();

        assert!(ipv4::verify_checksum(&buf[14..34]));
        assert!(udp::verify_checksum(
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            &buf[34..prepared.size]
        ));
        assert_eq!(iface.tx_queue_len(), 1);
    }
}
