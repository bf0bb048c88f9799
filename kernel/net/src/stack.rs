//! The network stack: interface registry, socket API, inbound dispatch and
//! the per-interface worker loops.
//!
//! # Structure
//!
//! One [`NetStack`] owns everything the subsystem needs: the append-only
//! interface registry built at [`init`](NetStack::init), the socket table,
//! the process-wide local port allocator, and the TCP endpoint state.  The
//! kernel holds a single instance behind [`crate::init`]; tests construct
//! their own.
//!
//! # Data flow
//!
//! - Outbound: `prepare_packet` writes headers into the caller's buffer →
//!   the caller fills payload → `finalize_packet` checksums, copies into a
//!   kernel-owned [`Packet`] and enqueues it → the TX worker hands it to the
//!   driver and drops it.
//! - Inbound: the driver pushes a frame into the RX ring → the RX worker
//!   decodes it through the codec chain → [`propagate_packet`]
//!   (NetStack::propagate_packet) clones it into every matching listening
//!   socket → `wait_for_packet` copies it out.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::buffer::Packet;
use crate::device::{Interface, NicDriver, PciClass, PciDevice};
use crate::dns::DnsDescriptor;
use crate::icmp::IcmpDescriptor;
use crate::ipv4::Ipv4Addr;
use crate::sched::{self, Pid};
use crate::socket::{SocketDomain, SocketError, SocketProtocol, SocketTable, SocketType};
use crate::tcp::{self, TcpDescriptor, TcpEndpoints};
use crate::wait::{self, WaitOutcome};
use crate::{ethernet, dns, icmp, loopback, sysfs};

/// First port handed out by the local port allocator.
const FIRST_LOCAL_PORT: u16 = 1234;

/// Subsystem configuration decided by the boot path.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    /// Address assigned to enabled physical interfaces.
    pub ip: Ipv4Addr,
    /// Default gateway for those interfaces.
    pub gateway: Ipv4Addr,
}

impl Default for NetConfig {
    /// QEMU user-mode networking defaults.
    fn default() -> Self {
        NetConfig {
            ip: Ipv4Addr::new(10, 0, 2, 15),
            gateway: Ipv4Addr::new(10, 0, 2, 2),
        }
    }
}

/// Protocol-specific description of an outbound packet.
#[derive(Debug, Clone, Copy)]
pub enum PacketDescriptor {
    /// ICMP message (RAW sockets).
    Icmp(IcmpDescriptor),
    /// TCP data segment (STREAM sockets).
    Tcp(TcpDescriptor),
    /// DNS query (DGRAM or RAW sockets).
    Dns(DnsDescriptor),
}

/// The network subsystem.
pub struct NetStack {
    /// Interface registry; append-only after construction, so reads need no
    /// lock.
    interfaces: Vec<Interface>,
    sockets: SocketTable,
    local_port: AtomicU16,
    tcp: TcpEndpoints,
}

impl NetStack {
    /// An empty stack with no interfaces.
    pub fn new() -> Self {
        NetStack {
            interfaces: Vec::new(),
            sockets: SocketTable::new(),
            local_port: AtomicU16::new(FIRST_LOCAL_PORT),
            tcp: TcpEndpoints::new(),
        }
    }

    /// Build the interface registry from PCI enumeration and install the
    /// loopback pseudo-device.
    ///
    /// Physical NICs come first in probe order; loopback is appended last and
    /// is always enabled.  Each interface is published to sysfs as it is
    /// registered, and every attached driver gets its `finalize_driver` call
    /// before this returns.
    pub fn init(config: NetConfig, pci_devices: &[PciDevice], drivers: &[&dyn NicDriver]) -> Self {
        let mut stack = Self::new();
        let mut index = 0;

        for pci in pci_devices {
            if pci.class != PciClass::Network {
                continue;
            }

            let id = stack.interfaces.len();
            let mut iface = Interface::new(id, format!("net{index}"), pci.index);

            if let Some(driver) = drivers.iter().find(|d| d.matches(pci)) {
                match driver.init_driver(&mut iface, pci) {
                    Ok(()) => {
                        iface.driver = String::from(driver.name());
                        iface.enabled = true;
                    }
                    Err(err) => {
                        klog!(Error, "net: driver {} failed on {}: {:?}", driver.name(), iface.name, err);
                    }
                }
            }

            if iface.enabled {
                iface.ip_address = config.ip;
                iface.gateway = config.gateway;
                klog!(Info, "net: {} up, driver {}, ip {}", iface.name, iface.driver, iface.ip_address);
            } else {
                klog!(Info, "net: {} present but disabled (no driver)", iface.name);
            }

            sysfs::publish_interface(&iface);
            stack.interfaces.push(iface);
            index += 1;
        }

        // The loopback pseudo-device is always installed, last and enabled.
        let id = stack.interfaces.len();
        let mut lo = Interface::new(id, String::from("loopback"), 0);
        loopback::init_driver(&mut lo);
        lo.enabled = true;
        sysfs::publish_interface(&lo);
        stack.interfaces.push(lo);

        for iface in &stack.interfaces {
            if !iface.enabled {
                continue;
            }
            if iface.is_loopback() {
                loopback::finalize_driver(iface);
            } else if let Some(driver) = drivers.iter().find(|d| d.name() == iface.driver) {
                driver.finalize_driver(iface);
            }
        }

        stack
    }

    // ========================================================================
    // Interface registry
    // ========================================================================

    /// Number of registered interfaces.
    pub fn number_of_interfaces(&self) -> usize {
        self.interfaces.len()
    }

    /// The interface registered under `index`.
    pub fn interface(&self, index: usize) -> &Interface {
        &self.interfaces[index]
    }

    /// Pick the interface carrying traffic to `address`: loopback traffic
    /// goes to the first enabled loopback device, everything else to the
    /// first enabled interface.
    pub fn select_interface(&self, address: Ipv4Addr) -> Option<&Interface> {
        if address == Ipv4Addr::LOCALHOST {
            if let Some(iface) = self
                .interfaces
                .iter()
                .find(|iface| iface.enabled && iface.is_loopback())
            {
                return Some(iface);
            }
        }

        self.interfaces.iter().find(|iface| iface.enabled)
    }

    /// Access the TCP endpoint table.
    pub(crate) fn tcp(&self) -> &TcpEndpoints {
        &self.tcp
    }

    // ========================================================================
    // Worker threads
    // ========================================================================

    /// Spawn the RX and TX workers for every enabled interface.
    ///
    /// Called once the scheduler is running.  Workers are kernel tasks named
    /// `net_rx_<iface>`/`net_tx_<iface>`; they run until shutdown and are
    /// never cancelled.
    pub fn start_workers(&'static self) {
        let Some(hooks) = sched::sched_hooks() else {
            klog!(Error, "net: cannot start workers before the scheduler is up");
            return;
        };

        for iface in self.interfaces.iter().filter(|iface| iface.enabled) {
            let index = iface.id;

            let rx_name = format!("net_rx_{}", iface.name);
            let rx_pid = hooks.spawn_kernel_task(&rx_name, Box::new(move || self.rx_loop(index)));
            hooks.queue_system_process(rx_pid);

            let tx_name = format!("net_tx_{}", iface.name);
            let tx_pid = hooks.spawn_kernel_task(&tx_name, Box::new(move || self.tx_loop(index)));
            hooks.queue_system_process(tx_pid);

            iface.set_worker_pids(rx_pid, tx_pid);
            klog!(Info, "net: workers for {} started (rx {}, tx {})", iface.name, rx_pid, tx_pid);
        }
    }

    /// RX worker: decode every frame the driver queued.
    ///
    /// The packet is consumed here; the decode chain clones out whatever it
    /// delivers before this loop drops the original.
    fn rx_loop(&self, index: usize) {
        let iface = &self.interfaces[index];
        klog!(Trace, "net: RX worker for {} running", iface.name);

        loop {
            iface.wait_rx();
            if let Some(mut packet) = iface.pop_rx() {
                ethernet::decode(self, iface, &mut packet);
            }
        }
    }

    /// TX worker: hand every queued frame to the driver.
    ///
    /// Only kernel-owned packets exist in the TX ring, so dropping them after
    /// `hw_send` is always safe.
    fn tx_loop(&self, index: usize) {
        let iface = &self.interfaces[index];
        klog!(Trace, "net: TX worker for {} running", iface.name);

        loop {
            iface.wait_tx();
            if let Some(packet) = iface.pop_tx() {
                match iface.hw_send {
                    Some(hw_send) => {
                        hw_send(iface, &packet);
                        iface.record_tx();
                    }
                    None => {
                        klog!(Error, "net: no transmit entry point on {}", iface.name);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Socket API
    // ========================================================================

    /// Open a socket.
    ///
    /// Datagram sockets speak DNS, stream sockets speak TCP; raw sockets
    /// accept any protocol.
    pub fn open(
        &self,
        domain: SocketDomain,
        sock_type: SocketType,
        protocol: SocketProtocol,
    ) -> Result<usize, SocketError> {
        match (sock_type, protocol) {
            (SocketType::Dgram, p) if p != SocketProtocol::Dns => {
                return Err(SocketError::InvalidTypeProtocol)
            }
            (SocketType::Stream, p) if p != SocketProtocol::Tcp => {
                return Err(SocketError::InvalidTypeProtocol)
            }
            _ => {}
        }

        let owner = sched::current_pid();
        let fd = self.sockets.register(domain, sock_type, protocol, owner);
        klog!(Trace, "net: process {} opened socket {}", owner, fd);
        Ok(fd)
    }

    /// Syscall-boundary variant of [`open`](Self::open): validates the raw
    /// domain/type/protocol constants before delegating.
    pub fn open_raw(&self, domain: u32, sock_type: u32, protocol: u32) -> Result<usize, SocketError> {
        let domain = SocketDomain::from_raw(domain).ok_or(SocketError::InvalidDomain)?;
        let sock_type = SocketType::from_raw(sock_type).ok_or(SocketError::InvalidType)?;
        let protocol = SocketProtocol::from_raw(protocol).ok_or(SocketError::InvalidProtocol)?;
        self.open(domain, sock_type, protocol)
    }

    /// Close a socket.  Unknown fds are ignored.
    pub fn close(&self, socket_fd: usize) {
        if self.sockets.release(socket_fd) {
            klog!(Trace, "net: socket {} closed", socket_fd);
        }
    }

    /// Release every socket owned by a terminating process.
    pub fn release_process_sockets(&self, pid: Pid) -> usize {
        let released = self.sockets.release_for_process(pid);
        if released > 0 {
            klog!(Trace, "net: released {} sockets of process {}", released, pid);
        }
        released
    }

    /// Toggle inbound dispatch into this socket's queue.
    pub fn listen(&self, socket_fd: usize, listen: bool) -> Result<(), SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;
        socket.set_listening(listen);
        Ok(())
    }

    /// Bind a datagram socket to a fresh local port.
    pub fn client_bind(&self, socket_fd: usize) -> Result<u16, SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;
        if socket.sock_type != SocketType::Dgram {
            return Err(SocketError::InvalidType);
        }

        let port = self.allocate_port();
        socket.set_local_port(port);
        klog!(Trace, "net: process {} datagram socket {} was assigned port {}", sched::current_pid(), socket_fd, port);
        Ok(port)
    }

    /// Connect a stream socket to `server:port`.
    ///
    /// Binds a fresh local port, then drives the transport's handshake; the
    /// call blocks until the connection is established or the transport gives
    /// up.  Returns the bound local port.
    pub fn connect(&self, socket_fd: usize, server: Ipv4Addr, port: u16) -> Result<u16, SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;
        if socket.sock_type != SocketType::Stream {
            return Err(SocketError::InvalidType);
        }

        let local_port = self.allocate_port();
        socket.set_local_port(local_port);
        socket.set_server_port(port);
        socket.set_server_address(server);
        klog!(Trace, "net: process {} stream socket {} was assigned port {}", sched::current_pid(), socket_fd, local_port);

        match socket.protocol {
            SocketProtocol::Tcp => {
                let iface = self.select_interface(server).ok_or(SocketError::NoInterface)?;
                tcp::connect(self, &socket, iface)?;
                socket.set_connected(true);
            }
            _ => return Err(SocketError::InvalidTypeProtocol),
        }

        Ok(local_port)
    }

    /// Disconnect a connected stream socket.
    pub fn disconnect(&self, socket_fd: usize) -> Result<(), SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;
        if socket.sock_type != SocketType::Stream {
            return Err(SocketError::InvalidType);
        }
        if !socket.is_connected() {
            return Err(SocketError::NotConnected);
        }

        klog!(Trace, "net: process {} disconnecting stream socket {}", sched::current_pid(), socket_fd);

        match socket.protocol {
            SocketProtocol::Tcp => {
                let iface = self
                    .select_interface(socket.server_address())
                    .ok_or(SocketError::NoInterface)?;
                tcp::disconnect(self, &socket, iface)?;
                socket.set_connected(false);
            }
            _ => return Err(SocketError::InvalidTypeProtocol),
        }

        Ok(())
    }

    /// Build an outbound packet's headers into `buf`.
    ///
    /// On success returns the packet fd for [`finalize_packet`]
    /// (Self::finalize_packet) and the offset at which the caller writes
    /// application bytes.  No state changes on error.
    pub fn prepare_packet(
        &self,
        socket_fd: usize,
        desc: &PacketDescriptor,
        buf: &mut [u8],
    ) -> Result<(usize, usize), SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;

        if self.number_of_interfaces() == 0 {
            return Err(SocketError::NoInterface);
        }

        if socket.sock_type == SocketType::Stream && !socket.is_connected() {
            return Err(SocketError::NotConnected);
        }

        let prepared = match (socket.protocol, desc) {
            (SocketProtocol::Icmp, PacketDescriptor::Icmp(desc)) => {
                let iface = self
                    .select_interface(desc.target_ip)
                    .ok_or(SocketError::NoInterface)?;
                icmp::prepare_packet(buf, iface, desc)?
            }
            (SocketProtocol::Tcp, PacketDescriptor::Tcp(desc)) => {
                let iface = self
                    .select_interface(socket.server_address())
                    .ok_or(SocketError::NoInterface)?;
                tcp::prepare_packet(buf, iface, &socket, desc.payload_size)?
            }
            (SocketProtocol::Dns, PacketDescriptor::Dns(desc)) => {
                if !desc.query {
                    // Only queries can be built; answering is a server's job.
                    return Err(SocketError::Unimplemented);
                }
                let iface = self
                    .select_interface(desc.target_ip)
                    .ok_or(SocketError::NoInterface)?;
                let source_port = if socket.sock_type == SocketType::Dgram {
                    socket.local_port()
                } else {
                    desc.source_port
                };
                dns::prepare_packet_query(
                    buf,
                    iface,
                    desc.target_ip,
                    source_port,
                    desc.identification,
                    desc.payload_size,
                )?
            }
            _ => return Err(SocketError::InvalidPacketDescriptor),
        };

        let index = prepared.index;
        let packet_fd = socket.register_packet(prepared);
        Ok((packet_fd, index))
    }

    /// Finalize a prepared packet and hand it to the selected interface.
    ///
    /// `buf` is the same buffer passed to [`prepare_packet`]
    /// (Self::prepare_packet), now with the payload filled in.  On codec
    /// failure the pending entry is kept so the caller may retry.
    pub fn finalize_packet(
        &self,
        socket_fd: usize,
        packet_fd: usize,
        buf: &mut [u8],
    ) -> Result<(), SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;
        let prepared = socket
            .get_packet(packet_fd)
            .ok_or(SocketError::InvalidPacketFd)?;

        if socket.sock_type == SocketType::Stream && !socket.is_connected() {
            return Err(SocketError::NotConnected);
        }

        let iface = self.interface(prepared.iface);
        match socket.protocol {
            SocketProtocol::Icmp => icmp::finalize_packet(iface, &prepared, buf)?,
            SocketProtocol::Tcp => tcp::finalize_packet(iface, &socket, &prepared, buf)?,
            SocketProtocol::Dns => dns::finalize_packet(iface, &prepared, buf)?,
        }

        socket.erase_packet(packet_fd);
        Ok(())
    }

    /// Wait for an inbound packet, indefinitely.
    ///
    /// Copies the packet's bytes into `buf` and returns its payload index.
    pub fn wait_for_packet(&self, buf: &mut [u8], socket_fd: usize) -> Result<usize, SocketError> {
        self.wait_impl(buf, socket_fd, None)
    }

    /// Wait for an inbound packet for at most `ms` milliseconds.
    ///
    /// `ms == 0` polls: it returns [`SocketError::Timeout`] immediately when
    /// nothing is queued.
    pub fn wait_for_packet_timeout(
        &self,
        buf: &mut [u8],
        socket_fd: usize,
        ms: u64,
    ) -> Result<usize, SocketError> {
        self.wait_impl(buf, socket_fd, Some(ms))
    }

    fn wait_impl(
        &self,
        buf: &mut [u8],
        socket_fd: usize,
        timeout_ms: Option<u64>,
    ) -> Result<usize, SocketError> {
        let socket = self.sockets.get(socket_fd).ok_or(SocketError::InvalidFd)?;
        if !socket.is_listening() {
            return Err(SocketError::NotListening);
        }

        let deadline = timeout_ms.map(|ms| wait::ticks() + ms);

        loop {
            if let Some(packet) = socket.take_delivered() {
                let count = packet.len().min(buf.len());
                buf[..count].copy_from_slice(&packet.payload()[..count]);
                klog!(Trace, "net: socket {} received a packet ({} bytes)", socket_fd, count);
                // The packet copy is dropped here, after copy-out.
                return Ok(packet.index());
            }

            let timeout_ns = match deadline {
                Some(deadline) => {
                    let now = wait::ticks();
                    if timeout_ms == Some(0) || now >= deadline {
                        return Err(SocketError::Timeout);
                    }
                    Some(wait::ms_to_ns(deadline - now))
                }
                None => None,
            };

            match socket.wait_delivered(timeout_ns) {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => {
                    if timeout_ms.is_some() {
                        return Err(SocketError::Timeout);
                    }
                    // No hooks registered yet; keep polling.
                    core::hint::spin_loop();
                }
                WaitOutcome::Closed => return Err(SocketError::InvalidFd),
                WaitOutcome::NoProcess => return Err(SocketError::Timeout),
            }
        }
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    /// Deliver a decoded inbound packet to every matching listening socket.
    ///
    /// A socket matches when its owner is live, it is listening, its protocol
    /// equals `protocol`, and it is RAW — or DGRAM with the UDP destination
    /// port (tag 2) equal to its bound local port.  Each delivery is a deep
    /// clone; the original stays with the RX worker.  Stream sockets never
    /// match, their delivery is the transport's bookkeeping.
    pub fn propagate_packet(&self, packet: &Packet, protocol: SocketProtocol) {
        for socket in self.sockets.snapshot() {
            if !sched::process_is_live(socket.owner) {
                continue;
            }
            if !socket.is_listening() || socket.protocol != protocol {
                continue;
            }

            let matched = match socket.sock_type {
                SocketType::Raw => true,
                SocketType::Dgram => {
                    let udp_off = packet.tag(2);
                    let payload = packet.payload();
                    payload.len() >= udp_off + 4
                        && u16::from_be_bytes([payload[udp_off + 2], payload[udp_off + 3]])
                            == socket.local_port()
                }
                SocketType::Stream => false,
            };

            if matched {
                klog!(Trace, "net: packet propagated to socket {}", socket.id);
                socket.deliver(packet.duplicate());
            }
        }
    }

    fn allocate_port(&self) -> u16 {
        self.local_port.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for NetStack {
    fn default() -> Self {
        Self::new()
    }
}
