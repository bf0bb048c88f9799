//! IPv4 network layer.
//!
//! Header build/parse plus the ones-complement checksum shared by the
//! transport codecs.  Decoding validates the header, records the layer-1 tag
//! and dispatches on the carried protocol.

use core::fmt;

use crate::buffer::Packet;
use crate::device::{Interface, InterfaceFeatures};
use crate::stack::NetStack;
use crate::{icmp, tcp, udp};

/// IPv4 header length without options (IHL == 5).
pub const IPV4_HEADER_LEN: usize = 20;

/// Default time-to-live for outbound datagrams.
pub const DEFAULT_TTL: u8 = 64;

// ============================================================================
// Protocol Numbers
// ============================================================================

/// IPv4 protocol numbers understood by the stack.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv4Proto {
    /// Internet Control Message Protocol.
    Icmp = 1,
    /// Transmission Control Protocol.
    Tcp = 6,
    /// User Datagram Protocol.
    Udp = 17,
}

impl Ipv4Proto {
    /// Try to convert from a raw protocol number.
    pub fn from_raw(value: u8) -> Option<Self> {
        match value {
            1 => Some(Ipv4Proto::Icmp),
            6 => Some(Ipv4Proto::Tcp),
            17 => Some(Ipv4Proto::Udp),
            _ => None,
        }
    }

    /// Raw protocol number.
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Address
// ============================================================================

/// IPv4 address (network byte order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// Create from 4 octets.
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Ipv4Addr([a, b, c, d])
    }

    /// All zeros (0.0.0.0).
    pub const UNSPECIFIED: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 0);

    /// Loopback (127.0.0.1).
    pub const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

    /// Limited broadcast (255.255.255.255).
    pub const BROADCAST: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);

    /// `true` for 127.0.0.0/8.
    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }

    /// `true` for 255.255.255.255.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [255, 255, 255, 255]
    }

    /// `true` for 0.0.0.0.
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0, 0, 0, 0]
    }

    /// Pack into a host-order integer (for atomic storage).
    #[inline]
    pub fn to_bits(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Unpack from [`to_bits`](Self::to_bits) form.
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Ipv4Addr(bits.to_be_bytes())
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// Sum 16-bit big-endian words into a running ones-complement accumulator.
pub(crate) fn sum_words(start: u32, data: &[u8]) -> u32 {
    let mut sum = start;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u16::from_be_bytes([*last, 0]) as u32);
    }
    sum
}

/// Fold a running sum to 16 bits.
pub(crate) fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Ones-complement checksum over `data` (RFC 1071).
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data))
}

// ============================================================================
// Header
// ============================================================================

/// Parsed IPv4 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4).
    pub header_len: usize,
    /// Total datagram length (header + payload).
    pub total_len: u16,
    /// Time to live.
    pub ttl: u8,
    /// Carried protocol number.
    pub protocol: u8,
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
}

/// Parse and minimally validate an IPv4 header at the start of `data`.
pub fn parse_ipv4(data: &[u8]) -> Option<Ipv4Header> {
    if data.len() < IPV4_HEADER_LEN {
        return None;
    }
    let version = data[0] >> 4;
    let header_len = ((data[0] & 0x0f) as usize) * 4;
    if version != 4 || header_len < IPV4_HEADER_LEN || header_len > data.len() {
        return None;
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]);
    if (total_len as usize) < header_len || (total_len as usize) > data.len() {
        return None;
    }
    Some(Ipv4Header {
        header_len,
        total_len,
        ttl: data[8],
        protocol: data[9],
        src: Ipv4Addr([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Addr([data[16], data[17], data[18], data[19]]),
    })
}

/// Write a 20-byte IPv4 header at the start of `buf`.
///
/// The checksum field is left zero; call [`finalize_checksum`] once the
/// datagram is complete.
pub fn write_header(buf: &mut [u8], total_len: u16, protocol: Ipv4Proto, src: Ipv4Addr, dst: Ipv4Addr) {
    buf[0] = 0x45; // version 4, IHL 5
    buf[1] = 0; // DSCP/ECN
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[4..6].copy_from_slice(&0u16.to_be_bytes()); // identification
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    buf[8] = DEFAULT_TTL;
    buf[9] = protocol.to_raw();
    buf[10..12].copy_from_slice(&0u16.to_be_bytes()); // checksum, fixed up later
    buf[12..16].copy_from_slice(&src.0);
    buf[16..20].copy_from_slice(&dst.0);
}

/// Compute and store the header checksum over the 20-byte header at the
/// start of `buf`.
pub fn finalize_checksum(buf: &mut [u8]) {
    buf[10] = 0;
    buf[11] = 0;
    let cks = checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&cks.to_be_bytes());
}

/// Verify the header checksum of a received header.
pub fn verify_checksum(header: &[u8]) -> bool {
    fold(sum_words(0, header)) == 0xffff
}

// ============================================================================
// Decode
// ============================================================================

/// Peel the network layer off an inbound frame and dispatch on protocol.
pub(crate) fn decode(stack: &NetStack, iface: &Interface, packet: &mut Packet) {
    let offset = packet.index();
    let Some(header) = parse_ipv4(&packet.payload()[offset..]) else {
        klog!(Warn, "net: interface {} dropped a malformed IPv4 header", iface.name);
        return;
    };

    if !iface.features.contains(InterfaceFeatures::CHECKSUM_RX)
        && !verify_checksum(&packet.payload()[offset..offset + header.header_len])
    {
        klog!(Warn, "net: interface {} dropped an IPv4 datagram with a bad checksum", iface.name);
        return;
    }

    // Only datagrams addressed to this interface (or broadcast) go up.
    if header.dst != iface.ip_address && !header.dst.is_broadcast() {
        klog!(Trace, "net: IPv4 datagram for {} ignored on {}", header.dst, iface.name);
        return;
    }

    packet.set_tag(1, offset);
    packet.advance(header.header_len);

    match Ipv4Proto::from_raw(header.protocol) {
        Some(Ipv4Proto::Icmp) => icmp::decode(stack, iface, packet),
        Some(Ipv4Proto::Udp) => udp::decode(stack, iface, packet),
        Some(Ipv4Proto::Tcp) => tcp::decode(stack, iface, packet),
        None => {
            klog!(Trace, "net: unsupported IPv4 protocol {} on {}", header.protocol, iface.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_known_vector() {
        // Example from RFC 1071 discussions: the checksum of a header
        // containing its own checksum folds to 0xffff.
        let mut header = [0u8; IPV4_HEADER_LEN];
        write_header(
            &mut header,
            40,
            Ipv4Proto::Tcp,
            Ipv4Addr::new(10, 0, 2, 15),
            Ipv4Addr::new(10, 0, 2, 2),
        );
        finalize_checksum(&mut header);
        assert!(verify_checksum(&header));
    }

    #[test]
    fn parse_round_trips_written_header() {
        let mut buf = [0u8; 64];
        write_header(
            &mut buf,
            48,
            Ipv4Proto::Udp,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::new(10, 0, 2, 2),
        );
        finalize_checksum(&mut buf);
        let header = parse_ipv4(&buf).unwrap();
        assert_eq!(header.header_len, IPV4_HEADER_LEN);
        assert_eq!(header.total_len, 48);
        assert_eq!(header.protocol, Ipv4Proto::Udp.to_raw());
        assert_eq!(header.src, Ipv4Addr::LOCALHOST);
        assert_eq!(header.dst, Ipv4Addr::new(10, 0, 2, 2));
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut buf = [0u8; IPV4_HEADER_LEN];
        write_header(&mut buf, 20, Ipv4Proto::Icmp, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        buf[0] = 0x65; // version 6
        assert!(parse_ipv4(&buf).is_none());
    }

    #[test]
    fn parse_rejects_truncated_total_len() {
        let mut buf = [0u8; IPV4_HEADER_LEN];
        write_header(&mut buf, 200, Ipv4Proto::Icmp, Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        assert!(parse_ipv4(&buf).is_none());
    }

    #[test]
    fn address_bits_round_trip() {
        let addr = Ipv4Addr::new(192, 168, 7, 1);
        assert_eq!(Ipv4Addr::from_bits(addr.to_bits()), addr);
        assert!(Ipv4Addr::LOCALHOST.is_loopback());
        assert!(Ipv4Addr::BROADCAST.is_broadcast());
        assert!(Ipv4Addr::UNSPECIFIED.is_unspecified());
    }
}
