//! ICMP codec.
//!
//! Outbound: RAW sockets build echo requests (or any type/code) through
//! [`prepare_packet`]/[`finalize_packet`].  Inbound: echo requests are
//! answered on the receiving interface before the datagram is propagated to
//! listening RAW sockets.

use alloc::vec::Vec;

use crate::buffer::{Packet, PreparedPacket, MAX_LAYERS};
use crate::device::{Interface, InterfaceFeatures};
use crate::ethernet::{self, ETHERTYPE_IPV4, ETH_BROADCAST, ETH_HEADER_LEN};
use crate::ipv4::{self, Ipv4Addr, Ipv4Proto, IPV4_HEADER_LEN};
use crate::socket::{SocketError, SocketProtocol};
use crate::stack::NetStack;

/// ICMP header length (type, code, checksum, rest-of-header).
pub const ICMP_HEADER_LEN: usize = 8;

/// Echo reply message type.
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;

/// Echo request message type.
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// What the caller wants in an outbound ICMP message.
#[derive(Debug, Clone, Copy)]
pub struct IcmpDescriptor {
    /// Destination address.
    pub target_ip: Ipv4Addr,
    /// Bytes the caller will write after the ICMP header.
    pub payload_size: usize,
    /// Message type.
    pub icmp_type: u8,
    /// Message code.
    pub code: u8,
}

/// Write Ethernet + IPv4 + ICMP headers into `buf`.
///
/// Checksums stay zero until [`finalize_packet`]; the rest-of-header word is
/// left for the caller (identifier/sequence for echo messages).
pub fn prepare_packet(
    buf: &mut [u8],
    iface: &Interface,
    desc: &IcmpDescriptor,
) -> Result<PreparedPacket, SocketError> {
    let total = ETH_HEADER_LEN + IPV4_HEADER_LEN + ICMP_HEADER_LEN + desc.payload_size;
    if buf.len() < total {
        return Err(SocketError::BufferTooSmall);
    }

    // No ARP: loopback frames are addressed to ourselves, anything else goes
    // out broadcast.
    let dst_mac = if desc.target_ip.is_loopback() {
        iface.mac_bytes()
    } else {
        ETH_BROADCAST
    };
    ethernet::write_header(buf, dst_mac, iface.mac_bytes(), ETHERTYPE_IPV4);

    ipv4::write_header(
        &mut buf[ETH_HEADER_LEN..],
        (IPV4_HEADER_LEN + ICMP_HEADER_LEN + desc.payload_size) as u16,
        Ipv4Proto::Icmp,
        iface.ip_address,
        desc.target_ip,
    );

    let icmp_off = ETH_HEADER_LEN + IPV4_HEADER_LEN;
    buf[icmp_off] = desc.icmp_type;
    buf[icmp_off + 1] = desc.code;
    for byte in &mut buf[icmp_off + 2..icmp_off + ICMP_HEADER_LEN] {
        *byte = 0;
    }

    let mut tags = [0u16; MAX_LAYERS];
    tags[1] = ETH_HEADER_LEN as u16;
    tags[2] = icmp_off as u16;

    Ok(PreparedPacket {
        iface: iface.id,
        index: icmp_off + ICMP_HEADER_LEN,
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
    let icmp_off = prepared.tags[2] as usize;

    buf[icmp_off + 2] = 0;
    buf[icmp_off + 3] = 0;
    let cks = ipv4::checksum(&buf[icmp_off..prepared.size]);
    buf[icmp_off + 2..icmp_off + 4].copy_from_slice(&cks.to_be_bytes());

    ipv4::finalize_checksum(&mut buf[ip_off..]);

    let mut packet = Packet::from_frame(&buf[..prepared.size], prepared.iface);
    packet.apply_layout(prepared);
    iface.send(packet);
    Ok(())
}

/// Decode an inbound ICMP message: answer echo requests, then propagate to
/// listening RAW sockets.
pub(crate) fn decode(stack: &NetStack, iface: &Interface, packet: &mut Packet) {
    let offset = packet.index();
    if packet.payload().len() < offset + ICMP_HEADER_LEN {
        klog!(Warn, "net: interface {} dropped a truncated ICMP message", iface.name);
        return;
    }

    if !iface.features.contains(InterfaceFeatures::CHECKSUM_RX)
        && ipv4::fold(ipv4::sum_words(0, &packet.payload()[offset..])) != 0xffff
    {
        klog!(Warn, "net: interface {} dropped an ICMP message with a bad checksum", iface.name);
        return;
    }

    let icmp_type = packet.payload()[offset];
    packet.set_tag(2, offset);
    packet.advance(ICMP_HEADER_LEN);

    if icmp_type == ICMP_TYPE_ECHO_REQUEST {
        send_echo_reply(iface, packet);
    }

    stack.propagate_packet(packet, SocketProtocol::Icmp);
}

/// Build an echo reply from a decoded request and enqueue it.
fn send_echo_reply(iface: &Interface, request: &Packet) {
    let mut frame: Vec<u8> = request.payload().into();
    let ip_off = request.tag(1);
    let icmp_off = request.tag(2);

    // Return to sender: their MAC becomes the destination, ours the source.
    let mut peer_mac = [0u8; 6];
    peer_mac.copy_from_slice(&frame[6..12]);
    ethernet::write_header(&mut frame, peer_mac, iface.mac_bytes(), ETHERTYPE_IPV4);

    let mut peer_ip = [0u8; 4];
    peer_ip.copy_from_slice(&frame[ip_off + 12..ip_off + 16]);
    let our_ip = iface.ip_address;
    frame[ip_off + 12..ip_off + 16].copy_from_slice(&our_ip.0);
    frame[ip_off + 16..ip_off + 20].copy_from_slice(&peer_ip);

    frame[icmp_off] = ICMP_TYPE_ECHO_REPLY;
    frame[icmp_off + 2] = 0;
    frame[icmp_off + 3] = 0;
    let cks = ipv4::checksum(&frame[icmp_off..]);
    frame[icmp_off + 2..icmp_off + 4].copy_from_slice(&cks.to_be_bytes());

    ipv4::finalize_checksum(&mut frame[ip_off..]);

    let mut reply = Packet::new(frame.into_boxed_slice(), iface.id);
    reply.set_tag(0, 0);
    reply.set_tag(1, ip_off);
    reply.set_tag(2, icmp_off);
    reply.set_index(icmp_off + ICMP_HEADER_LEN);

    klog!(Trace, "net: echo reply queued on {}", iface.name);
    iface.send(reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn loopback_iface() -> Interface {
        let mut iface = Interface::new(0, "loopback".to_string(), 0);
        crate::loopback::init_driver(&mut iface);
        iface.enabled = true;
        iface
    }

    #[test]
    fn prepare_lays_out_echo_request() {
        let iface = loopback_iface();
        let desc = IcmpDescriptor {
            target_ip: Ipv4Addr::LOCALHOST,
            payload_size: 4,
            icmp_type: ICMP_TYPE_ECHO_REQUEST,
            code: 0,
        };
        let mut buf = [0u8; 128];
        let prepared = prepare_packet(&mut buf, &iface, &desc).unwrap();

        assert_eq!(prepared.size, 46);
        assert_eq!(prepared.index, 42);
        assert_eq!(prepared.tags[1], 14);
        assert_eq!(prepared.tags[2], 34);
        // Loopback frames are addressed to our own MAC.
        assert_eq!(&buf[0..6], &iface.mac_bytes());
        assert_eq!(buf[34], ICMP_TYPE_ECHO_REQUEST);
        assert_eq!(u16::from_be_bytes([buf[12], buf[13]]), ETHERTYPE_IPV4);
    }

    #[test]
    fn prepare_rejects_short_buffers() {
        let iface = loopback_iface();
        let desc = IcmpDescriptor {
            target_ip: Ipv4Addr::LOCALHOST,
            payload_size: 64,
            icmp_type: ICMP_TYPE_ECHO_REQUEST,
            code: 0,
        };
        let mut buf = [0u8; 32];
        assert!(matches!(
            prepare_packet(&mut buf, &iface, &desc),
            Err(SocketError::BufferTooSmall)
        ));
    }

    #[test]
    fn finalize_computes_valid_checksums() {
        let iface = loopback_iface();
        let desc = IcmpDescriptor {
            target_ip: Ipv4Addr::LOCALHOST,
            payload_size: 4,
            icmp_type: ICMP_TYPE_ECHO_REQUEST,
            code: 0,
        };
        let mut buf = [0u8; 128];
        let prepared = prepare_packet(&mut buf, &iface, &desc).unwrap();
        buf[prepared.index..prepared.size].copy_from_slice(b"abcd");
        finalize_packet(&iface, &prepared, &mut buf).unwrap();

        assert!(ipv4::verify_checksum(&buf[14..34]));
        assert_eq!(ipv4::fold(ipv4::sum_words(0, &buf[34..prepared.size])), 0xffff);
        // The frame is now queued on the interface's TX ring.
        assert_eq!(iface.tx_queue_len(), 1);
    }
}
