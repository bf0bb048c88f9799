//! Socket state and the per-process socket table.
//!
//! A [`Socket`] is owned by the process that opened it and lives in the
//! [`SocketTable`] under a never-reused fd.  Everything a socket carries is
//! either atomic or behind its own lock, so the table hands out `Arc`s and
//! callers operate without holding the table lock — a waiter blocked in
//! `wait_for_packet` must not stall unrelated opens and closes.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::buffer::{Packet, PreparedPacket};
use crate::ipv4::Ipv4Addr;
use crate::queue::BoundedRing;
use crate::sched::Pid;
use crate::wait::{WaitOutcome, WaitQueue};

/// Capacity of a socket's inbound packet queue.
pub const LISTEN_RING_CAP: usize = 32;

// ============================================================================
// Error taxonomy
// ============================================================================

/// Errors surfaced by the socket API.
///
/// The set is flat and stable; codec-specific failures are relayed through
/// the same enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// Unsupported address domain.
    InvalidDomain,
    /// Unsupported socket type.
    InvalidType,
    /// Unsupported protocol.
    InvalidProtocol,
    /// Protocol not valid for the socket type.
    InvalidTypeProtocol,
    /// No socket registered under this fd.
    InvalidFd,
    /// No pending packet registered under this packet fd.
    InvalidPacketFd,
    /// No interface available to carry the packet.
    NoInterface,
    /// Stream socket is not connected.
    NotConnected,
    /// Socket is not listening.
    NotListening,
    /// Timed out waiting for a packet or a peer.
    Timeout,
    /// Descriptor does not match the socket's protocol, or is malformed.
    InvalidPacketDescriptor,
    /// The requested operation is not implemented.
    Unimplemented,
    /// Caller-provided buffer cannot hold the frame.
    BufferTooSmall,
    /// Peer answered the handshake with a reset.
    ConnectionRefused,
}

// ============================================================================
// Domains, types, protocols
// ============================================================================

/// Socket address domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketDomain {
    /// IPv4 internet domain (AF_INET).
    Inet,
}

impl SocketDomain {
    /// AF_INET wire value.
    pub const AF_INET: u32 = 2;

    /// Parse from the raw syscall constant.
    pub fn from_raw(domain: u32) -> Option<Self> {
        match domain {
            Self::AF_INET => Some(SocketDomain::Inet),
            _ => None,
        }
    }
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    /// Raw socket: matched on protocol alone.
    Raw,
    /// Datagram socket: matched on protocol and local port.
    Dgram,
    /// Stream socket: delivery handled by the transport.
    Stream,
}

impl SocketType {
    /// SOCK_STREAM wire value.
    pub const SOCK_STREAM: u32 = 1;
    /// SOCK_DGRAM wire value.
    pub const SOCK_DGRAM: u32 = 2;
    /// SOCK_RAW wire value.
    pub const SOCK_RAW: u32 = 3;

    /// Parse from the raw syscall constant.
    pub fn from_raw(ty: u32) -> Option<Self> {
        match ty {
            Self::SOCK_STREAM => Some(SocketType::Stream),
            Self::SOCK_DGRAM => Some(SocketType::Dgram),
            Self::SOCK_RAW => Some(SocketType::Raw),
            _ => None,
        }
    }
}

/// Application protocol spoken on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    /// ICMP (raw sockets).
    Icmp,
    /// DNS over UDP (datagram or raw sockets).
    Dns,
    /// TCP (stream sockets).
    Tcp,
}

impl SocketProtocol {
    /// ICMP wire value.
    pub const PROTO_ICMP: u32 = 1;
    /// DNS wire value.
    pub const PROTO_DNS: u32 = 2;
    /// TCP wire value.
    pub const PROTO_TCP: u32 = 3;

    /// Parse from the raw syscall constant.
    pub fn from_raw(protocol: u32) -> Option<Self> {
        match protocol {
            Self::PROTO_ICMP => Some(SocketProtocol::Icmp),
            Self::PROTO_DNS => Some(SocketProtocol::Dns),
            Self::PROTO_TCP => Some(SocketProtocol::Tcp),
            _ => None,
        }
    }
}

// ============================================================================
// Socket
// ============================================================================

/// Pending outbound packets, keyed by packet fd.
struct PendingTable {
    next_fd: usize,
    entries: BTreeMap<usize, PreparedPacket>,
}

/// One open socket.
pub struct Socket {
    /// File descriptor this socket is registered under.
    pub id: usize,
    /// Owning process.
    pub owner: Pid,
    /// Address domain.
    pub domain: SocketDomain,
    /// Socket type.
    pub sock_type: SocketType,
    /// Application protocol.
    pub protocol: SocketProtocol,

    listen: AtomicBool,
    connected: AtomicBool,
    local_port: AtomicU16,
    server_port: AtomicU16,
    server_address: AtomicU32,
    seq_number: AtomicU32,
    ack_number: AtomicU32,

    pending: Mutex<PendingTable>,
    listen_packets: Mutex<BoundedRing<Packet, LISTEN_RING_CAP>>,
    listen_queue: WaitQueue,
}

impl Socket {
    fn new(id: usize, owner: Pid, domain: SocketDomain, sock_type: SocketType, protocol: SocketProtocol) -> Self {
        Socket {
            id,
            owner,
            domain,
            sock_type,
            protocol,
            listen: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            local_port: AtomicU16::new(0),
            server_port: AtomicU16::new(0),
            server_address: AtomicU32::new(0),
            seq_number: AtomicU32::new(0),
            ack_number: AtomicU32::new(0),
            pending: Mutex::new(PendingTable {
                next_fd: 1,
                entries: BTreeMap::new(),
            }),
            listen_packets: Mutex::new(BoundedRing::new()),
            listen_queue: WaitQueue::new(),
        }
    }

    /// Whether inbound dispatch may target this socket.
    pub fn is_listening(&self) -> bool {
        self.listen.load(Ordering::Acquire)
    }

    /// Flip the listen flag.
    pub fn set_listening(&self, listen: bool) {
        self.listen.store(listen, Ordering::Release);
    }

    /// Whether a stream socket has a live connection.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Record connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Bound local port (0 = unbound).
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    /// Record the bound local port.
    pub fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Release);
    }

    /// Server port recorded by `connect`.
    pub fn server_port(&self) -> u16 {
        self.server_port.load(Ordering::Acquire)
    }

    /// Record the server port.
    pub fn set_server_port(&self, port: u16) {
        self.server_port.store(port, Ordering::Release);
    }

    /// Server address recorded by `connect`.
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from_bits(self.server_address.load(Ordering::Acquire))
    }

    /// Record the server address.
    pub fn set_server_address(&self, address: Ipv4Addr) {
        self.server_address.store(address.to_bits(), Ordering::Release);
    }

    /// Next sequence number to send.
    pub fn seq_number(&self) -> u32 {
        self.seq_number.load(Ordering::Acquire)
    }

    /// Reset the send sequence.
    pub fn set_seq_number(&self, seq: u32) {
        self.seq_number.store(seq, Ordering::Release);
    }

    /// Advance the send sequence past transmitted payload.
    pub fn advance_seq(&self, bytes: u32) {
        self.seq_number.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Next sequence number expected from the peer.
    pub fn ack_number(&self) -> u32 {
        self.ack_number.load(Ordering::Acquire)
    }

    /// Record the peer's sequence state.
    pub fn set_ack_number(&self, ack: u32) {
        self.ack_number.store(ack, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Pending outbound packets
    // ------------------------------------------------------------------

    /// Register a prepared packet; returns its packet fd.
    pub fn register_packet(&self, prepared: PreparedPacket) -> usize {
        let mut pending = self.pending.lock();
        let fd = pending.next_fd;
        pending.next_fd += 1;
        pending.entries.insert(fd, prepared);
        fd
    }

    /// Whether a pending packet is registered under `packet_fd`.
    pub fn has_packet(&self, packet_fd: usize) -> bool {
        self.pending.lock().entries.contains_key(&packet_fd)
    }

    /// Look up a pending packet.
    pub fn get_packet(&self, packet_fd: usize) -> Option<PreparedPacket> {
        self.pending.lock().entries.get(&packet_fd).copied()
    }

    /// Drop a pending packet entry.
    pub fn erase_packet(&self, packet_fd: usize) {
        self.pending.lock().entries.remove(&packet_fd);
    }

    /// Number of packets between prepare and finalize.
    pub fn pending_packets(&self) -> usize {
        self.pending.lock().entries.len()
    }

    // ------------------------------------------------------------------
    // Inbound delivery
    // ------------------------------------------------------------------

    /// Queue an inbound packet copy and wake one waiter.
    ///
    /// Returns `false` (dropping the copy) when the queue is full.
    pub fn deliver(&self, packet: Packet) -> bool {
        let pushed = self.listen_packets.lock().push(packet).is_ok();
        if pushed {
            self.listen_queue.wake_one();
        } else {
            klog!(Warn, "net: listen queue full on socket {}, packet dropped", self.id);
        }
        pushed
    }

    /// Dequeue one delivered packet.
    pub fn take_delivered(&self) -> Option<Packet> {
        self.listen_packets.lock().pop()
    }

    /// Block until a delivery is signaled.
    pub fn wait_delivered(&self, timeout_ns: Option<u64>) -> WaitOutcome {
        self.listen_queue.wait_with_timeout(timeout_ns)
    }

    /// Tear down wait state when the socket is released.
    fn close(&self) {
        self.listen_queue.close();
    }
}

// ============================================================================
// Socket table
// ============================================================================

/// All open sockets, keyed by fd.
///
/// Fds are allocated from a monotonically increasing counter and never
/// reused, so a stale fd always resolves to "no socket" rather than to a
/// stranger's.
pub struct SocketTable {
    sockets: RwLock<BTreeMap<usize, Arc<Socket>>>,
    next_fd: AtomicUsize,
}

impl SocketTable {
    /// Create an empty table; the first fd handed out is 1.
    pub fn new() -> Self {
        SocketTable {
            sockets: RwLock::new(BTreeMap::new()),
            next_fd: AtomicUsize::new(1),
        }
    }

    /// Register a new socket for `owner`; returns its fd.
    pub fn register(
        &self,
        domain: SocketDomain,
        sock_type: SocketType,
        protocol: SocketProtocol,
        owner: Pid,
    ) -> usize {
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::new(Socket::new(fd, owner, domain, sock_type, protocol));
        self.sockets.write().insert(fd, socket);
        fd
    }

    /// Whether a socket is registered under `fd`.
    pub fn has(&self, fd: usize) -> bool {
        self.sockets.read().contains_key(&fd)
    }

    /// Look up a socket.
    pub fn get(&self, fd: usize) -> Option<Arc<Socket>> {
        self.sockets.read().get(&fd).cloned()
    }

    /// Release a socket; `true` if one was registered under `fd`.
    pub fn release(&self, fd: usize) -> bool {
        match self.sockets.write().remove(&fd) {
            Some(socket) => {
                socket.close();
                true
            }
            None => false,
        }
    }

    /// Release every socket owned by `pid` (process termination).
    ///
    /// Returns the number of sockets released.
    pub fn release_for_process(&self, pid: Pid) -> usize {
        let mut table = self.sockets.write();
        let doomed: Vec<usize> = table
            .iter()
            .filter(|(_, socket)| socket.owner == pid)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in &doomed {
            if let Some(socket) = table.remove(fd) {
                socket.close();
            }
        }
        doomed.len()
    }

    /// Snapshot of all live sockets, for inbound dispatch.
    pub fn snapshot(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().values().cloned().collect()
    }

    /// Number of open sockets.
    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    /// `true` when no sockets are open.
    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MAX_LAYERS;

    fn table() -> SocketTable {
        SocketTable::new()
    }

    fn prepared(size: usize) -> PreparedPacket {
        PreparedPacket {
            iface: 0,
            index: 42,
            tags: [0u16; MAX_LAYERS],
            size,
        }
    }

    #[test]
    fn fds_are_never_reused() {
        let table = table();
        let a = table.register(SocketDomain::Inet, SocketType::Raw, SocketProtocol::Icmp, 1);
        assert!(table.release(a));
        let b = table.register(SocketDomain::Inet, SocketType::Raw, SocketProtocol::Icmp, 1);
        assert_ne!(a, b);
        assert!(!table.has(a));
        assert!(table.has(b));
    }

    #[test]
    fn release_is_idempotent() {
        let table = table();
        let fd = table.register(SocketDomain::Inet, SocketType::Dgram, SocketProtocol::Dns, 1);
        assert!(table.release(fd));
        assert!(!table.release(fd));
        assert!(!table.release(99_999));
    }

    #[test]
    fn pending_packets_round_trip() {
        let table = table();
        let fd = table.register(SocketDomain::Inet, SocketType::Raw, SocketProtocol::Icmp, 1);
        let socket = table.get(fd).unwrap();

        let first = socket.register_packet(prepared(46));
        let second = socket.register_packet(prepared(64));
        assert_ne!(first, second);
        assert!(socket.has_packet(first));
        assert_eq!(socket.get_packet(second).unwrap().size, 64);
        assert_eq!(socket.pending_packets(), 2);

        socket.erase_packet(first);
        assert!(!socket.has_packet(first));
        assert!(socket.get_packet(first).is_none());
        assert_eq!(socket.pending_packets(), 1);
    }

    #[test]
    fn delivery_queue_is_fifo_and_bounded() {
        let table = table();
        let fd = table.register(SocketDomain::Inet, SocketType::Raw, SocketProtocol::Icmp, 1);
        let socket = table.get(fd).unwrap();

        for i in 0..LISTEN_RING_CAP {
            assert!(socket.deliver(Packet::from_frame(&[i as u8], 0)));
        }
        assert!(!socket.deliver(Packet::from_frame(&[0xff], 0)));

        let first = socket.take_delivered().unwrap();
        assert_eq!(first.payload(), &[0]);
    }

    #[test]
    fn release_for_process_only_touches_the_owner() {
        let table = table();
        let ours = table.register(SocketDomain::Inet, SocketType::Raw, SocketProtocol::Icmp, 7);
        let theirs = table.register(SocketDomain::Inet, SocketType::Raw, SocketProtocol::Icmp, 8);
        assert_eq!(table.release_for_process(7), 1);
        assert!(!table.has(ours));
        assert!(table.has(theirs));
    }

    #[test]
    fn raw_constants_parse() {
        assert_eq!(SocketDomain::from_raw(2), Some(SocketDomain::Inet));
        assert_eq!(SocketDomain::from_raw(1), None);
        assert_eq!(SocketType::from_raw(1), Some(SocketType::Stream));
        assert_eq!(SocketType::from_raw(3), Some(SocketType::Raw));
        assert_eq!(SocketType::from_raw(9), None);
        assert_eq!(SocketProtocol::from_raw(2), Some(SocketProtocol::Dns));
        assert_eq!(SocketProtocol::from_raw(9), None);
    }
}
