//! Interface descriptors and the driver contract.
//!
//! An [`Interface`] is one network device plus its RX/TX plumbing: two
//! bounded rings of [`Packet`]s, the counting semaphores that pair with them,
//! and the driver's transmit entry point.  Descriptors are created during
//! subsystem init and never removed; everything mutable after init sits
//! behind a lock or an atomic, so the registry itself needs none.
//!
//! # Queue ownership
//!
//! - `tx_queue`: producers are user threads serialized by the ring's mutex;
//!   the single consumer is the TX worker.
//! - `rx_queue`: the single producer is the driver
//!   ([`receive_frame`](Interface::receive_frame), interrupt or DPC context);
//!   the single consumer is the RX worker.
//!
//! A packet moved into a ring is owned by that ring's consumer.  The rings
//! are sized for burst tolerance; a full ring drops the frame and counts it.

use alloc::boxed::Box;
use alloc::string::String;
use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::buffer::Packet;
use crate::ipv4::Ipv4Addr;
use crate::queue::{BoundedRing, Semaphore};
use crate::sched::Pid;

/// Capacity of each per-interface RX/TX ring.
pub const IFACE_QUEUE_CAP: usize = 32;

/// Errors from the driver contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Operation is not supported by this device.
    NotSupported,
    /// Device is not in a valid state for this operation.
    InvalidState,
    /// Device encountered an I/O or bus error.
    IoError,
}

bitflags! {
    /// Capability flags advertised by an interface's driver.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InterfaceFeatures: u32 {
        /// Outbound checksums are produced by the device (or not needed).
        const CHECKSUM_TX = 1 << 0;
        /// Inbound checksums were already verified; skip software checks.
        const CHECKSUM_RX = 1 << 1;
    }
}

impl Default for InterfaceFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

// ============================================================================
// PCI probe records
// ============================================================================

/// Device class as reported by PCI enumeration (the subset the network
/// subsystem distinguishes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciClass {
    /// Network controller.
    Network,
    /// Anything else.
    Other,
}

/// One enumerated PCI function, as handed over by the PCI subsystem.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    /// Index in the PCI subsystem's device table.
    pub index: usize,
    /// Vendor identifier.
    pub vendor_id: u16,
    /// Device identifier.
    pub device_id: u16,
    /// Coarse device class.
    pub class: PciClass,
}

// ============================================================================
// Driver contract
// ============================================================================

/// Transmit entry point installed by a driver.
///
/// Called by the TX worker with the dequeued frame; the worker drops the
/// packet afterwards, so drivers must copy whatever outlives the call.
pub type HwSend = fn(&Interface, &Packet);

/// Contract implemented by NIC drivers.
///
/// Drivers never hold a reference back into the interface table — they
/// receive the interface per call and stash private state through
/// [`Interface::set_driver_data`].
pub trait NicDriver: Sync {
    /// Driver tag, recorded on the interface and published to sysfs.
    fn name(&self) -> &'static str;

    /// Whether this driver handles the given PCI function.
    fn matches(&self, pci: &PciDevice) -> bool;

    /// Probe the hardware and install `hw_send`, features, and MAC address.
    fn init_driver(&self, iface: &mut Interface, pci: &PciDevice) -> Result<(), NetError>;

    /// Start the hardware once the rest of the subsystem is up.
    fn finalize_driver(&self, iface: &Interface);
}

// ============================================================================
// Statistics
// ============================================================================

/// Monotonic per-interface counters.
#[derive(Default)]
pub struct InterfaceStats {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_dropped: AtomicU64,
    tx_dropped: AtomicU64,
}

/// Read-only snapshot of [`InterfaceStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStatsSnapshot {
    /// Frames accepted into the RX ring.
    pub rx_packets: u64,
    /// Frames handed to the driver for transmit.
    pub tx_packets: u64,
    /// Frames dropped because the RX ring was full.
    pub rx_dropped: u64,
    /// Frames dropped because the TX ring was full.
    pub tx_dropped: u64,
}

// ============================================================================
// Interface
// ============================================================================

/// One network device plus its RX/TX plumbing.
pub struct Interface {
    /// Stable id: position in the interface registry.
    pub id: usize,
    /// Human name (`net0`, `loopback`, ...).
    pub name: String,
    /// Driver tag; empty until a driver attaches.
    pub driver: String,
    /// `true` once a driver attached successfully.
    pub enabled: bool,
    /// Index of the backing PCI function (0 for pseudo-devices).
    pub pci_device: usize,
    /// MAC address packed into the low 48 bits.
    pub mac_address: u64,
    /// Interface IPv4 address.
    pub ip_address: Ipv4Addr,
    /// Default gateway (unused on loopback).
    pub gateway: Ipv4Addr,
    /// Driver capability flags.
    pub features: InterfaceFeatures,
    /// Driver transmit entry point.
    pub hw_send: Option<HwSend>,

    driver_data: Option<Box<dyn Any + Send + Sync>>,

    tx_queue: Mutex<BoundedRing<Packet, IFACE_QUEUE_CAP>>,
    rx_queue: Mutex<BoundedRing<Packet, IFACE_QUEUE_CAP>>,
    tx_sem: Semaphore,
    rx_sem: Semaphore,

    rx_thread_pid: AtomicU64,
    tx_thread_pid: AtomicU64,

    stats: InterfaceStats,
}

impl Interface {
    /// Create a disabled interface with empty queues.
    pub fn new(id: usize, name: String, pci_device: usize) -> Self {
        Interface {
            id,
            name,
            driver: String::new(),
            enabled: false,
            pci_device,
            mac_address: 0,
            ip_address: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            features: InterfaceFeatures::empty(),
            hw_send: None,
            driver_data: None,
            tx_queue: Mutex::new(BoundedRing::new()),
            rx_queue: Mutex::new(BoundedRing::new()),
            tx_sem: Semaphore::new(0),
            rx_sem: Semaphore::new(0),
            rx_thread_pid: AtomicU64::new(0),
            tx_thread_pid: AtomicU64::new(0),
            stats: InterfaceStats::default(),
        }
    }

    /// The loopback pseudo-device is identified by its driver tag.
    #[inline]
    pub fn is_loopback(&self) -> bool {
        self.driver == crate::loopback::DRIVER_NAME
    }

    /// MAC address as wire bytes.
    pub fn mac_bytes(&self) -> [u8; 6] {
        let bytes = self.mac_address.to_be_bytes();
        [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
    }

    /// Enqueue an outbound frame for the TX worker.
    ///
    /// Producers are serialized by the ring's mutex; the paired semaphore
    /// signals the worker.  Returns `false` (and drops the frame) when the
    /// ring is full.
    pub fn send(&self, packet: Packet) -> bool {
        let pushed = self.tx_queue.lock().push(packet).is_ok();
        if pushed {
            self.tx_sem.release();
        } else {
            self.stats.tx_dropped.fetch_add(1, Ordering::Relaxed);
            klog!(Warn, "net: TX ring full on {}, frame dropped", self.name);
        }
        pushed
    }

    /// Driver-side entry: push an arriving frame into the RX ring and signal
    /// the RX worker.
    ///
    /// Returns `false` (and drops the frame) when the ring is full.
    pub fn receive_frame(&self, packet: Packet) -> bool {
        let pushed = self.rx_queue.lock().push(packet).is_ok();
        if pushed {
            self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.rx_sem.release();
        } else {
            self.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            klog!(Warn, "net: RX ring full on {}, frame dropped", self.name);
        }
        pushed
    }

    /// Block until the TX ring is non-empty (TX worker only).
    pub(crate) fn wait_tx(&self) {
        self.tx_sem.acquire();
    }

    /// Block until the RX ring is non-empty (RX worker only).
    pub(crate) fn wait_rx(&self) {
        self.rx_sem.acquire();
    }

    /// Dequeue one outbound frame (TX worker only).
    pub(crate) fn pop_tx(&self) -> Option<Packet> {
        self.tx_queue.lock().pop()
    }

    /// Dequeue one inbound frame (RX worker only).
    pub(crate) fn pop_rx(&self) -> Option<Packet> {
        self.rx_queue.lock().pop()
    }

    /// Current TX ring depth.
    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue.lock().len()
    }

    /// Current RX ring depth.
    pub fn rx_queue_len(&self) -> usize {
        self.rx_queue.lock().len()
    }

    /// Stash driver-private state on the interface.
    pub fn set_driver_data(&mut self, data: Box<dyn Any + Send + Sync>) {
        self.driver_data = Some(data);
    }

    /// Borrow driver-private state previously stashed by the driver.
    pub fn driver_data<T: 'static>(&self) -> Option<&T> {
        self.driver_data.as_deref().and_then(|d| d.downcast_ref())
    }

    /// Record the worker pids once spawned.
    pub(crate) fn set_worker_pids(&self, rx: Pid, tx: Pid) {
        self.rx_thread_pid.store(rx, Ordering::Release);
        self.tx_thread_pid.store(tx, Ordering::Release);
    }

    /// Pid of the RX worker (0 before `finalize`).
    pub fn rx_thread_pid(&self) -> Pid {
        self.rx_thread_pid.load(Ordering::Acquire)
    }

    /// Pid of the TX worker (0 before `finalize`).
    pub fn tx_thread_pid(&self) -> Pid {
        self.tx_thread_pid.load(Ordering::Acquire)
    }

    /// Count a frame handed to the driver.
    pub(crate) fn record_tx(&self) {
        self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Read-only snapshot of the counters.
    pub fn stats(&self) -> InterfaceStatsSnapshot {
        InterfaceStatsSnapshot {
            rx_packets: self.stats.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.stats.tx_packets.load(Ordering::Relaxed),
            rx_dropped: self.stats.rx_dropped.load(Ordering::Relaxed),
            tx_dropped: self.stats.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn iface() -> Interface {
        Interface::new(0, "net0".to_string(), 0)
    }

    #[test]
    fn tx_ring_is_bounded() {
        let iface = iface();
        for _ in 0..IFACE_QUEUE_CAP {
            assert!(iface.send(Packet::from_frame(&[0u8; 16], 0)));
        }
        assert_eq!(iface.tx_queue_len(), IFACE_QUEUE_CAP);
        assert!(!iface.send(Packet::from_frame(&[0u8; 16], 0)));
        assert_eq!(iface.tx_queue_len(), IFACE_QUEUE_CAP);
        assert_eq!(iface.stats().tx_dropped, 1);
    }

    #[test]
    fn rx_ring_is_bounded() {
        let iface = iface();
        for _ in 0..IFACE_QUEUE_CAP {
            assert!(iface.receive_frame(Packet::from_frame(&[0u8; 16], 0)));
        }
        assert!(!iface.receive_frame(Packet::from_frame(&[0u8; 16], 0)));
        let stats = iface.stats();
        assert_eq!(stats.rx_packets, IFACE_QUEUE_CAP as u64);
        assert_eq!(stats.rx_dropped, 1);
    }

    #[test]
    fn mac_bytes_take_the_low_48_bits() {
        let mut iface = iface();
        iface.mac_address = 0x0011_2233_4455;
        assert_eq!(iface.mac_bytes(), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn driver_data_round_trips() {
        let mut iface = iface();
        iface.set_driver_data(Box::new(42u32));
        assert_eq!(iface.driver_data::<u32>(), Some(&42));
        assert_eq!(iface.driver_data::<u64>(), None);
    }
}
