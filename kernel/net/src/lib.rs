//! Vesper-OS network subsystem.
//!
//! This crate is the concurrent boundary between drivers, the protocol
//! codecs, and user processes:
//!
//! - a registry of network interfaces (physical NICs plus loopback), each
//!   with a pair of bounded RX/TX rings and the semaphores that pace them,
//! - one RX and one TX kernel task per enabled interface, moving frames
//!   between the driver and the codec chain,
//! - a socket API through which processes build outbound packets and receive
//!   inbound ones,
//! - the dispatcher that fans a decoded inbound packet out to every matching
//!   listening socket.
//!
//! # Ownership
//!
//! A [`Packet`] owns its bytes; queue transfers are moves, never aliases.
//! The TX worker drops each frame after the driver call, the RX worker drops
//! each frame after decode, and socket delivery works on explicit deep
//! clones.  What the original C-style design policed with a `user` flag and
//! an assert is structural here: only kernel-owned packets exist in the
//! rings.
//!
//! # Boot integration
//!
//! The kernel calls [`init`] early (interface probing, loopback, sysfs) and
//! [`finalize`] once the scheduler runs, after registering
//! [`wait::register_wait_hooks`] and [`sched::register_sched_hooks`].
//! Everything else reaches the subsystem through [`net_stack`].

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
extern crate klog;

pub mod buffer;
pub mod device;
pub mod dns;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod loopback;
pub mod queue;
pub mod sched;
pub mod socket;
pub mod stack;
pub mod sysfs;
pub mod tcp;
pub mod udp;
pub mod wait;

#[cfg(test)]
mod test_support;

pub use buffer::{Packet, PreparedPacket, MAX_LAYERS};
pub use device::{
    Interface, InterfaceFeatures, InterfaceStatsSnapshot, NetError, NicDriver, PciClass,
    PciDevice, IFACE_QUEUE_CAP,
};
pub use dns::DnsDescriptor;
pub use icmp::IcmpDescriptor;
pub use ipv4::Ipv4Addr;
pub use sched::{register_sched_hooks, Pid, ProcessState, SchedHooks};
pub use socket::{
    Socket, SocketDomain, SocketError, SocketProtocol, SocketTable, SocketType, LISTEN_RING_CAP,
};
pub use stack::{NetConfig, NetStack, PacketDescriptor};
pub use sysfs::{register_sysfs_publisher, SysfsPublisher};
pub use tcp::TcpDescriptor;
pub use wait::{register_wait_hooks, WaitHooks, WaitOutcome, WaitQueue};

/// The kernel's stack instance.
static STACK: spin::Once<NetStack> = spin::Once::new();

/// Initialize the subsystem: probe `pci_devices` against `drivers`, install
/// the loopback pseudo-device, publish everything to sysfs.
///
/// Called early in boot; only the first call constructs the stack.
pub fn init(
    config: NetConfig,
    pci_devices: &[PciDevice],
    drivers: &[&dyn NicDriver],
) -> &'static NetStack {
    STACK.call_once(|| NetStack::init(config, pci_devices, drivers))
}

/// Spawn the per-interface RX/TX workers.
///
/// Called after the scheduler is initialized and the wait/sched hooks are
/// registered.
pub fn finalize() {
    match STACK.get() {
        Some(stack) => stack.start_workers(),
        None => klog!(Error, "net: finalize called before init"),
    }
}

/// The kernel's stack, once [`init`] has run.
pub fn net_stack() -> Option<&'static NetStack> {
    STACK.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_init_installs_loopback_and_starts_workers() {
        test_support::install();
        let stack = init(NetConfig::default(), &[], &[]);
        finalize();

        assert!(net_stack().is_some());
        let last = stack.interface(stack.number_of_interfaces() - 1);
        assert!(last.is_loopback());
        assert!(last.enabled);
        // Workers got pids from the scheduler hooks.
        assert_ne!(last.rx_thread_pid(), 0);
        assert_ne!(last.tx_thread_pid(), 0);
    }
}
