//! Production device monitor backed by `nusb` enumeration.
//!
//! Hotplug is detected by diffing snapshots: every refresh re-enumerates the
//! bus and compares against the previous listing, keyed by the device's
//! topological position. This avoids any OS-specific notification plumbing
//! at the cost of one enumeration per refresh, which is cheap at the rate a
//! poll loop runs.
//!
//! Raw I/O on an opened device goes through the platform HID/serial
//! transport, which lives outside this crate; [`UsbIo::open`] says so
//! instead of pretending.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nusb::MaybeFuture;

use super::{Device, DeviceChange, DeviceEvent, DeviceHandle, DeviceId, DeviceIo, DeviceMonitor};
use crate::error::{Error, Result};

/// How long `wait` parks between enumeration passes.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Identity of one interface-level device within a snapshot. Devices that
/// keep the same key across refreshes are considered unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SnapshotKey {
    bus: String,
    ports: Vec<u8>,
    address: u8,
    vid: u16,
    pid: u16,
    interface: u8,
}

/// One interface-level device seen during an enumeration pass.
pub(crate) struct SeenDevice {
    key: SnapshotKey,
    location: String,
    release: u16,
    serial_number: String,
}

/// `nusb`-backed monitor.
pub struct UsbMonitor {
    known: HashMap<SnapshotKey, Arc<Device>>,
    next_id: u64,
}

impl UsbMonitor {
    pub fn new() -> Self {
        Self {
            known: HashMap::new(),
            next_id: 1,
        }
    }

    fn snapshot() -> Result<Vec<SeenDevice>> {
        let devices = nusb::list_devices()
            .wait()
            .map_err(|e| Error::Io(format!("USB enumeration failed: {e}")))?;

        let mut seen = Vec::new();
        for info in devices {
            let bus = info.bus_id().to_string();
            let ports: Vec<u8> = info.port_chain().to_vec();
            let location = format_location(&bus, &ports);
            let serial = info.serial_number().unwrap_or("").to_string();

            let mut interfaces: Vec<u8> = info
                .interfaces()
                .map(|i| i.interface_number())
                .collect();
            if interfaces.is_empty() {
                interfaces.push(0);
            }

            for interface in interfaces {
                seen.push(SeenDevice {
                    key: SnapshotKey {
                        bus: bus.clone(),
                        ports: ports.clone(),
                        address: info.device_address(),
                        vid: info.vendor_id(),
                        pid: info.product_id(),
                        interface,
                    },
                    location: location.clone(),
                    release: info.device_version(),
                    serial_number: serial.clone(),
                });
            }
        }
        Ok(seen)
    }

    fn changes_from(&mut self, seen: Vec<SeenDevice>) -> Vec<DeviceChange> {
        let mut changes = Vec::new();
        let mut current: HashMap<SnapshotKey, SeenDevice> =
            seen.into_iter().map(|d| (d.key.clone(), d)).collect();

        let gone: Vec<SnapshotKey> = self
            .known
            .keys()
            .filter(|key| !current.contains_key(*key))
            .cloned()
            .collect();
        for key in gone {
            let device = self.known.remove(&key).unwrap();
            changes.push(DeviceChange {
                event: DeviceEvent::Removed,
                device,
            });
        }

        let fresh: Vec<SnapshotKey> = current
            .keys()
            .filter(|key| !self.known.contains_key(*key))
            .cloned()
            .collect();
        for key in fresh {
            let seen = current.remove(&key).unwrap();
            let device = self.make_device(seen);
            self.known.insert(key, device.clone());
            changes.push(DeviceChange {
                event: DeviceEvent::Added,
                device,
            });
        }

        changes
    }

    fn make_device(&mut self, seen: SeenDevice) -> Arc<Device> {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        Device::new(
            id,
            seen.location.clone(),
            format!("usb:{}:{}", seen.location, seen.key.interface),
            seen.key.vid,
            seen.key.pid,
            seen.release,
            seen.serial_number,
            seen.key.interface,
            Arc::new(UsbIo),
        )
    }
}

impl Default for UsbMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMonitor for UsbMonitor {
    fn enumerate(&mut self) -> Result<Vec<Arc<Device>>> {
        let changes = self.drain()?;
        Ok(changes
            .into_iter()
            .filter(|c| c.event == DeviceEvent::Added)
            .map(|c| c.device)
            .collect())
    }

    fn drain(&mut self) -> Result<Vec<DeviceChange>> {
        let seen = Self::snapshot()?;
        Ok(self.changes_from(seen))
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        std::thread::sleep(timeout.min(POLL_INTERVAL));
        true
    }
}

/// Topological location string, `"<bus>-<port>.<port>…"` like the Linux
/// sysfs naming. Root devices with an empty port chain are `"<bus>-0"`.
fn format_location(bus: &str, ports: &[u8]) -> String {
    if ports.is_empty() {
        return format!("{bus}-0");
    }
    let chain: Vec<String> = ports.iter().map(u8::to_string).collect();
    format!("{}-{}", bus, chain.join("."))
}

/// Placeholder I/O factory for enumerated devices. Raw HID/serial transport
/// is provided by the platform layer, not this crate.
struct UsbIo;

impl DeviceIo for UsbIo {
    fn open(&self) -> Result<Box<dyn DeviceHandle>> {
        Err(Error::Unsupported(
            "Raw device I/O requires the platform HID/serial backend, which is not compiled into this build.".into(),
        ))
    }
}
