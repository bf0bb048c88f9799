//! Loopback pseudo-device.
//!
//! Frames transmitted on loopback are immediately received on the same
//! interface: `hw_send` deep-copies the frame into the RX ring, because the
//! TX worker drops its packet right after the driver call.  No wire, no ARP;
//! checksums still hold since the codecs finalize them before enqueue.

use alloc::string::String;

use crate::buffer::Packet;
use crate::device::{Interface, InterfaceFeatures};
use crate::ipv4::Ipv4Addr;

/// Driver tag; [`Interface::is_loopback`] keys off it.
pub const DRIVER_NAME: &str = "loopback";

/// Attach the loopback driver to an interface.
pub fn init_driver(iface: &mut Interface) {
    iface.driver = String::from(DRIVER_NAME);
    iface.mac_address = 0;
    iface.ip_address = Ipv4Addr::LOCALHOST;
    // In-memory delivery never corrupts bytes; skip software checksum checks.
    iface.features = InterfaceFeatures::CHECKSUM_TX | InterfaceFeatures::CHECKSUM_RX;
    iface.hw_send = Some(hw_send);
}

/// Nothing to start; the device is always up.
pub fn finalize_driver(iface: &Interface) {
    klog!(Info, "net: loopback ready as interface {}", iface.id);
}

fn hw_send(iface: &Interface, packet: &Packet) {
    let echo = packet.duplicate();
    if !iface.receive_frame(echo) {
        klog!(Warn, "net: loopback RX ring full, frame lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn hw_send_reflects_frames_into_rx() {
        let mut iface = Interface::new(0, "loopback".to_string(), 0);
        init_driver(&mut iface);
        assert!(iface.is_loopback());
        assert_eq!(iface.ip_address, Ipv4Addr::LOCALHOST);

        let packet = Packet::from_frame(b"ping", 0);
        (iface.hw_send.unwrap())(&iface, &packet);
        assert_eq!(iface.rx_queue_len(), 1);
        // The original is untouched; the reflected frame is a copy.
        assert_eq!(packet.payload(), b"ping");
    }
}
