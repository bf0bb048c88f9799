//! TCP driver for stream sockets.
//!
//! Stream sockets go through the transport's own primitives: [`connect`]
//! performs a synchronous three-way handshake, [`disconnect`] a FIN/ACK
//! exchange, and [`prepare_packet`]/[`finalize_packet`] build data segments
//! from the socket's sequence state.  Retransmission, flow control and
//! congestion control are out of scope; a lost handshake segment surfaces as
//! a transport timeout.
//!
//! Inbound segments never reach the socket dispatcher — [`decode`] consumes
//! them into the pending-exchange table that the blocking primitives wait on.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::buffer::{Packet, PreparedPacket, MAX_LAYERS};
use crate::device::{Interface, InterfaceFeatures};
use crate::ethernet::{self, ETHERTYPE_IPV4, ETH_BROADCAST, ETH_HEADER_LEN};
use crate::ipv4::{self, Ipv4Addr, Ipv4Proto, IPV4_HEADER_LEN};
use crate::socket::{Socket, SocketError};
use crate::stack::NetStack;
use crate::wait::{ms_to_ns, WaitQueue};

/// TCP header length without options.
pub const TCP_HEADER_LEN: usize = 20;

/// Connection termination.
pub const TCP_FLAG_FIN: u8 = 0x01;
/// Connection initiation.
pub const TCP_FLAG_SYN: u8 = 0x02;
/// Hard reset.
pub const TCP_FLAG_RST: u8 = 0x04;
/// Push buffered data to the receiver.
pub const TCP_FLAG_PSH: u8 = 0x08;
/// Acknowledgement field is valid.
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Advertised receive window.
const DEFAULT_WINDOW: u16 = 0x2000;

/// How long the blocking primitives wait for the peer's answer.
const EXCHANGE_TIMEOUT_MS: u64 = 5_000;

/// First initial sequence number handed out after boot.
pub(crate) const INITIAL_SEQUENCE: u32 = 0x0001_0000;

/// Spacing between initial sequence numbers of successive connections.
const SEQUENCE_STEP: u32 = 0x0002_0000;

/// What the caller wants in an outbound data segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpDescriptor {
    /// Bytes the caller will write after the TCP header.
    pub payload_size: usize,
}

// ============================================================================
// Segment codec
// ============================================================================

/// Parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgement number.
    pub ack: u32,
    /// Header length in bytes (data offset * 4).
    pub header_len: usize,
    /// Control flags.
    pub flags: u8,
    /// Advertised window.
    pub window: u16,
}

/// Parse the header at the start of `data`.
pub fn parse_tcp_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let header_len = ((data[12] >> 4) as usize) * 4;
    if header_len < TCP_HEADER_LEN || header_len > data.len() {
        return None;
    }
    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        header_len,
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
    })
}

/// Write a 20-byte header at the start of `buf`, checksum left zero.
pub fn write_header(buf: &mut [u8], src_port: u16, dst_port: u16, seq: u32, ack: u32, flags: u8) {
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&seq.to_be_bytes());
    buf[8..12].copy_from_slice(&ack.to_be_bytes());
    buf[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    buf[13] = flags;
    buf[14..16].copy_from_slice(&DEFAULT_WINDOW.to_be_bytes());
    buf[16..18].copy_from_slice(&0u16.to_be_bytes()); // checksum, fixed up later
    buf[18..20].copy_from_slice(&0u16.to_be_bytes()); // urgent pointer
}

/// Pseudo-header checksum over a complete segment (header + payload).
pub fn checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = Ipv4Proto::Tcp.to_raw();
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    !ipv4::fold(ipv4::sum_words(ipv4::sum_words(0, &pseudo), segment))
}

/// Compute and store the checksum for the segment at the start of `buf`.
pub fn finalize_checksum(buf: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr) {
    buf[16] = 0;
    buf[17] = 0;
    let cks = checksum(src, dst, buf);
    buf[16..18].copy_from_slice(&cks.to_be_bytes());
}

/// Verify a received segment's checksum.
pub fn verify_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.0);
    pseudo[4..8].copy_from_slice(&dst.0);
    pseudo[9] = Ipv4Proto::Tcp.to_raw();
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    ipv4::fold(ipv4::sum_words(ipv4::sum_words(0, &pseudo), segment)) == 0xffff
}

// ============================================================================
// Pending exchanges
// ============================================================================

/// Which answer an exchange is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeKind {
    /// SYN sent, waiting for SYN|ACK.
    Connect,
    /// FIN sent, waiting for the peer's ACK.
    Close,
}

/// One blocked connect/disconnect waiting for the peer.
struct PendingExchange {
    kind: ExchangeKind,
    local_port: u16,
    remote_port: u16,
    remote_ip: Ipv4Addr,
    /// Acknowledgement number that completes the exchange.
    expected_ack: u32,
    peer_seq: AtomicU32,
    peer_fin: AtomicBool,
    refused: AtomicBool,
    completed: AtomicBool,
    queue: WaitQueue,
}

impl PendingExchange {
    fn new(kind: ExchangeKind, local_port: u16, remote_port: u16, remote_ip: Ipv4Addr, expected_ack: u32) -> Self {
        PendingExchange {
            kind,
            local_port,
            remote_port,
            remote_ip,
            expected_ack,
            peer_seq: AtomicU32::new(0),
            peer_fin: AtomicBool::new(false),
            refused: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            queue: WaitQueue::new(),
        }
    }
}

/// Per-stack TCP state: the pending-exchange table and the initial sequence
/// counter.
pub(crate) struct TcpEndpoints {
    pending: Mutex<Vec<Arc<PendingExchange>>>,
    next_sequence: AtomicU32,
}

impl TcpEndpoints {
    pub(crate) fn new() -> Self {
        TcpEndpoints {
            pending: Mutex::new(Vec::new()),
            next_sequence: AtomicU32::new(INITIAL_SEQUENCE),
        }
    }

    fn initial_sequence(&self) -> u32 {
        self.next_sequence.fetch_add(SEQUENCE_STEP, Ordering::Relaxed)
    }

    fn register(&self, exchange: Arc<PendingExchange>) {
        self.pending.lock().push(exchange);
    }

    fn unregister(&self, exchange: &Arc<PendingExchange>) {
        self.pending
            .lock()
            .retain(|entry| !Arc::ptr_eq(entry, exchange));
    }

    fn find(&self, local_port: u16, remote_port: u16) -> Option<Arc<PendingExchange>> {
        self.pending
            .lock()
            .iter()
            .find(|entry| entry.local_port == local_port && entry.remote_port == remote_port)
            .cloned()
    }
}

// ============================================================================
// Blocking primitives
// ============================================================================

/// Three-way handshake with the socket's server.
///
/// Blocks until the peer's SYN|ACK arrives or the transport timeout expires.
/// On success the socket's sequence state points past the handshake.
pub(crate) fn connect(stack: &NetStack, socket: &Socket, iface: &Interface) -> Result<(), SocketError> {
    let iss = stack.tcp().initial_sequence();
    let exchange = Arc::new(PendingExchange::new(
        ExchangeKind::Connect,
        socket.local_port(),
        socket.server_port(),
        socket.server_address(),
        iss.wrapping_add(1),
    ));
    stack.tcp().register(exchange.clone());

    send_control_segment(iface, &exchange, iss, 0, TCP_FLAG_SYN);

    exchange
        .queue
        .wait_with_timeout(Some(ms_to_ns(EXCHANGE_TIMEOUT_MS)));
    stack.tcp().unregister(&exchange);

    if exchange.refused.load(Ordering::Acquire) {
        klog!(Warn, "net: connection to {}:{} refused", exchange.remote_ip, exchange.remote_port);
        return Err(SocketError::ConnectionRefused);
    }
    if !exchange.completed.load(Ordering::Acquire) {
        klog!(Warn, "net: connection to {}:{} timed out", exchange.remote_ip, exchange.remote_port);
        return Err(SocketError::Timeout);
    }

    let peer_seq = exchange.peer_seq.load(Ordering::Acquire);
    socket.set_seq_number(iss.wrapping_add(1));
    socket.set_ack_number(peer_seq.wrapping_add(1));

    send_control_segment(
        iface,
        &exchange,
        iss.wrapping_add(1),
        peer_seq.wrapping_add(1),
        TCP_FLAG_ACK,
    );

    klog!(Trace, "net: handshake with {}:{} complete", exchange.remote_ip, exchange.remote_port);
    Ok(())
}

/// FIN/ACK exchange tearing the connection down.
pub(crate) fn disconnect(stack: &NetStack, socket: &Socket, iface: &Interface) -> Result<(), SocketError> {
    let fin_seq = socket.seq_number();
    let exchange = Arc::new(PendingExchange::new(
        ExchangeKind::Close,
        socket.local_port(),
        socket.server_port(),
        socket.server_address(),
        fin_seq.wrapping_add(1),
    ));
    stack.tcp().register(exchange.clone());

    send_control_segment(iface, &exchange, fin_seq, socket.ack_number(), TCP_FLAG_FIN | TCP_FLAG_ACK);

    exchange
        .queue
        .wait_with_timeout(Some(ms_to_ns(EXCHANGE_TIMEOUT_MS)));
    stack.tcp().unregister(&exchange);

    if !exchange.completed.load(Ordering::Acquire) {
        klog!(Warn, "net: disconnect from {}:{} timed out", exchange.remote_ip, exchange.remote_port);
        return Err(SocketError::Timeout);
    }

    socket.set_seq_number(fin_seq.wrapping_add(1));

    // The peer may fold its own FIN into the acknowledgement.
    if exchange.peer_fin.load(Ordering::Acquire) {
        let peer_seq = exchange.peer_seq.load(Ordering::Acquire);
        socket.set_ack_number(peer_seq.wrapping_add(1));
        send_control_segment(
            iface,
            &exchange,
            fin_seq.wrapping_add(1),
            peer_seq.wrapping_add(1),
            TCP_FLAG_ACK,
        );
    }

    klog!(Trace, "net: connection to {}:{} closed", exchange.remote_ip, exchange.remote_port);
    Ok(())
}

/// Build and enqueue a payload-less control segment.
fn send_control_segment(iface: &Interface, exchange: &PendingExchange, seq: u32, ack: u32, flags: u8) {
    let total = ETH_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN;
    let mut frame: Vec<u8> = Vec::new();
    frame.resize(total, 0);

    let dst_mac = if exchange.remote_ip.is_loopback() {
        iface.mac_bytes()
    } else {
        ETH_BROADCAST
    };
    ethernet::write_header(&mut frame, dst_mac, iface.mac_bytes(), ETHERTYPE_IPV4);
    ipv4::write_header(
        &mut frame[ETH_HEADER_LEN..],
        (IPV4_HEADER_LEN + TCP_HEADER_LEN) as u16,
        Ipv4Proto::Tcp,
        iface.ip_address,
        exchange.remote_ip,
    );
    let tcp_off = ETH_HEADER_LEN + IPV4_HEADER_LEN;
    write_header(
        &mut frame[tcp_off..],
        exchange.local_port,
        exchange.remote_port,
        seq,
        ack,
        flags,
    );
    finalize_checksum(&mut frame[tcp_off..], iface.ip_address, exchange.remote_ip);
    ipv4::finalize_checksum(&mut frame[ETH_HEADER_LEN..]);

    let mut packet = Packet::new(frame.into_boxed_slice(), iface.id);
    packet.set_tag(0, 0);
    packet.set_tag(1, ETH_HEADER_LEN);
    packet.set_tag(2, tcp_off);
    packet.set_index(total);
    iface.send(packet);
}

// ============================================================================
// Data segments
// ============================================================================

/// Write Ethernet + IPv4 + TCP headers for a data segment carrying
/// `payload_size` bytes, using the socket's current sequence state.
pub fn prepare_packet(
    buf: &mut [u8],
    iface: &Interface,
    socket: &Socket,
    payload_size: usize,
) -> Result<PreparedPacket, SocketError> {
    let total = ETH_HEADER_LEN + IPV4_HEADER_LEN + TCP_HEADER_LEN + payload_size;
    if buf.len() < total {
        return Err(SocketError::BufferTooSmall);
    }

    let server = socket.server_address();
    let dst_mac = if server.is_loopback() {
        iface.mac_bytes()
    } else {
        ETH_BROADCAST
    };
    ethernet::write_header(buf, dst_mac, iface.mac_bytes(), ETHERTYPE_IPV4);
    ipv4::write_header(
        &mut buf[ETH_HEADER_LEN..],
        (IPV4_HEADER_LEN + TCP_HEADER_LEN + payload_size) as u16,
        Ipv4Proto::Tcp,
        iface.ip_address,
        server,
    );

    let tcp_off = ETH_HEADER_LEN + IPV4_HEADER_LEN;
    write_header(
        &mut buf[tcp_off..],
        socket.local_port(),
        socket.server_port(),
        socket.seq_number(),
        socket.ack_number(),
        TCP_FLAG_PSH | TCP_FLAG_ACK,
    );

    let mut tags = [0u16; MAX_LAYERS];
    tags[1] = ETH_HEADER_LEN as u16;
    tags[2] = tcp_off as u16;

    Ok(PreparedPacket {
        iface: iface.id,
        index: tcp_off + TCP_HEADER_LEN,
        tags,
        size: total,
    })
}

/// Finalize checksums, enqueue the segment, and advance the socket's send
/// sequence past the payload.
pub fn finalize_packet(
    iface: &Interface,
    socket: &Socket,
    prepared: &PreparedPacket,
    buf: &mut [u8],
) -> Result<(), SocketError> {
    if buf.len() < prepared.size {
        return Err(SocketError::BufferTooSmall);
    }
    let ip_off = prepared.tags[1] as usize;
    let tcp_off = prepared.tags[2] as usize;
    let size = prepared.size;

    let src = Ipv4Addr([buf[ip_off + 12], buf[ip_off + 13], buf[ip_off + 14], buf[ip_off + 15]]);
    let dst = Ipv4Addr([buf[ip_off + 16], buf[ip_off + 17], buf[ip_off + 18], buf[ip_off + 19]]);
    finalize_checksum(&mut buf[tcp_off..size], src, dst);
    ipv4::finalize_checksum(&mut buf[ip_off..]);

    let mut packet = Packet::from_frame(&buf[..size], prepared.iface);
    packet.apply_layout(prepared);
    iface.send(packet);

    socket.advance_seq((size - prepared.index) as u32);
    Ok(())
}

// ============================================================================
// Decode
// ============================================================================

/// Consume an inbound segment into the pending-exchange table.
///
/// Stream payload delivery is the transport's own bookkeeping; segments never
/// reach the socket dispatcher.
pub(crate) fn decode(stack: &NetStack, iface: &Interface, packet: &mut Packet) {
    let offset = packet.index();
    let Some(header) = parse_tcp_header(&packet.payload()[offset..]) else {
        klog!(Warn, "net: interface {} dropped a malformed TCP header", iface.name);
        return;
    };

    if !iface.features.contains(InterfaceFeatures::CHECKSUM_RX) {
        let ip_off = packet.tag(1);
        let payload = packet.payload();
        let src = Ipv4Addr([payload[ip_off + 12], payload[ip_off + 13], payload[ip_off + 14], payload[ip_off + 15]]);
        let dst = Ipv4Addr([payload[ip_off + 16], payload[ip_off + 17], payload[ip_off + 18], payload[ip_off + 19]]);
        if !verify_checksum(src, dst, &payload[offset..]) {
            klog!(Warn, "net: interface {} dropped a TCP segment with a bad checksum", iface.name);
            return;
        }
    }

    packet.set_tag(2, offset);
    packet.advance(header.header_len);

    let Some(exchange) = stack.tcp().find(header.dst_port, header.src_port) else {
        klog!(Trace, "net: TCP segment for port {} with no endpoint on {}", header.dst_port, iface.name);
        return;
    };

    match exchange.kind {
        ExchangeKind::Connect => {
            let syn_ack = TCP_FLAG_SYN | TCP_FLAG_ACK;
            if header.flags & TCP_FLAG_RST != 0 {
                exchange.refused.store(true, Ordering::Release);
                exchange.queue.wake_all();
            } else if header.flags & syn_ack == syn_ack && header.ack == exchange.expected_ack {
                exchange.peer_seq.store(header.seq, Ordering::Release);
                exchange.completed.store(true, Ordering::Release);
                exchange.queue.wake_all();
            }
        }
        ExchangeKind::Close => {
            if header.flags & TCP_FLAG_ACK != 0 && header.ack == exchange.expected_ack {
                if header.flags & TCP_FLAG_FIN != 0 {
                    exchange.peer_fin.store(true, Ordering::Release);
                    exchange.peer_seq.store(header.seq, Ordering::Release);
                }
                exchange.completed.store(true, Ordering::Release);
                exchange.queue.wake_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = [0u8; TCP_HEADER_LEN];
        write_header(&mut buf, 1234, 80, 0x11223344, 0x55667788, TCP_FLAG_SYN | TCP_FLAG_ACK);
        let header = parse_tcp_header(&buf).unwrap();
        assert_eq!(header.src_port, 1234);
        assert_eq!(header.dst_port, 80);
        assert_eq!(header.seq, 0x11223344);
        assert_eq!(header.ack, 0x55667788);
        assert_eq!(header.header_len, TCP_HEADER_LEN);
        assert_eq!(header.flags, TCP_FLAG_SYN | TCP_FLAG_ACK);
        assert_eq!(header.window, DEFAULT_WINDOW);
    }

    #[test]
    fn parse_rejects_bad_data_offset() {
        let mut buf = [0u8; TCP_HEADER_LEN];
        write_header(&mut buf, 1, 2, 0, 0, TCP_FLAG_SYN);
        buf[12] = 0x30; // data offset 3 words < minimum
        assert!(parse_tcp_header(&buf).is_none());
    }

    #[test]
    fn checksum_round_trip() {
        let src = Ipv4Addr::new(127, 0, 0, 1);
        let dst = Ipv4Addr::new(127, 0, 0, 1);
        let mut segment = [0u8; TCP_HEADER_LEN + 5];
        write_header(&mut segment, 1234, 80, 7, 9, TCP_FLAG_PSH | TCP_FLAG_ACK);
        segment[TCP_HEADER_LEN..].copy_from_slice(b"hello");
        finalize_checksum(&mut segment, src, dst);
        assert!(verify_checksum(src, dst, &segment));

        segment[4] ^= 0x01;
        assert!(!verify_checksum(src, dst, &segment));
    }
}
