//! Sysfs publication of interface attributes.
//!
//! The filesystem lives elsewhere in the kernel; the network subsystem only
//! pushes key/value pairs through a publisher registered at boot.  Entries
//! land under `/sys/net/<interface>/`.

use alloc::format;

use crate::device::Interface;

/// Consumer of the published entries (the sysfs filesystem).
pub trait SysfsPublisher: Send + Sync {
    /// Publish one constant value at `path`.
    fn set_constant_value(&self, path: &str, value: &str);
}

/// One-time registered publisher.
static PUBLISHER: spin::Once<&'static dyn SysfsPublisher> = spin::Once::new();

/// Register the sysfs publisher.
///
/// Only the first registration takes effect; without one, publication is a
/// no-op.
pub fn register_sysfs_publisher(publisher: &'static dyn SysfsPublisher) {
    PUBLISHER.call_once(|| publisher);
}

/// Publish an interface's attributes.
pub(crate) fn publish_interface(iface: &Interface) {
    let Some(publisher) = PUBLISHER.get() else {
        return;
    };

    let base = format!("/sys/net/{}", iface.name);
    publisher.set_constant_value(&format!("{base}/name"), &iface.name);
    publisher.set_constant_value(&format!("{base}/driver"), &iface.driver);
    publisher.set_constant_value(
        &format!("{base}/enabled"),
        if iface.enabled { "true" } else { "false" },
    );
    publisher.set_constant_value(&format!("{base}/pci_device"), &format!("{}", iface.pci_device));
    publisher.set_constant_value(&format!("{base}/mac"), &format!("{}", iface.mac_address));

    if iface.enabled {
        publisher.set_constant_value(&format!("{base}/ip"), &format!("{}", iface.ip_address));

        if !iface.is_loopback() {
            publisher.set_constant_value(&format!("{base}/gateway"), &format!("{}", iface.gateway));
        }
    }
}
