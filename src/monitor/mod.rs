//! Device monitoring seam.
//!
//! A [`DeviceMonitor`] produces the stream of USB attach/detach events the
//! board manager consumes. Two implementations ship: [`usb::UsbMonitor`]
//! enumerates real devices through `nusb`, and [`sim::SimMonitor`] replays
//! scripted events for the test suite. The raw I/O behind an opened device
//! (HID reports, serial bytes) stays behind [`DeviceHandle`]; the
//! platform-specific transport is an external collaborator.

pub mod sim;
pub mod usb;

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Stable key identifying one USB interface-level device for the lifetime
/// of its attachment. The monitor guarantees the `Removed` event for a
/// device carries the same id as its `Added` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

/// What happened to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Added,
    Removed,
}

/// One attach/detach notification.
#[derive(Clone)]
pub struct DeviceChange {
    pub event: DeviceEvent,
    pub device: Arc<Device>,
}

/// Raw I/O on an opened device.
///
/// The semantics are transport-specific: for a HID bootloader `write` sends
/// one report, for a CDC serial interface it sends bytes on the wire and
/// `set_attributes` changes the line coding.
pub trait DeviceHandle: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn set_attributes(&mut self, rate: u32) -> Result<()>;
}

/// Factory for [`DeviceHandle`]s, attached to each [`Device`] by its monitor.
pub trait DeviceIo: Send + Sync {
    fn open(&self) -> Result<Box<dyn DeviceHandle>>;
}

/// One USB interface-level device as reported by a monitor.
pub struct Device {
    id: DeviceId,
    location: String,
    path: String,
    vid: u16,
    pid: u16,
    /// USB `bcdDevice` release number; Teensy bootloaders encode the model
    /// here.
    release: u16,
    serial_number: String,
    interface_number: u8,
    io: Arc<dyn DeviceIo>,
}

impl Device {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: DeviceId,
        location: impl Into<String>,
        path: impl Into<String>,
        vid: u16,
        pid: u16,
        release: u16,
        serial_number: impl Into<String>,
        interface_number: u8,
        io: Arc<dyn DeviceIo>,
    ) -> Arc<Device> {
        Arc::new(Device {
            id,
            location: location.into(),
            path: path.into(),
            vid,
            pid,
            release,
            serial_number: serial_number.into(),
            interface_number,
            io,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// USB topological path. Stable across the bootloader/application
    /// transitions of one physical board.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// OS device node or identifier, for display only.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn release(&self) -> u16 {
        self.release
    }

    /// USB serial number string; empty when the descriptor is unreadable.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn interface_number(&self) -> u8 {
        self.interface_number
    }

    /// Open the device for raw I/O.
    pub fn open(&self) -> Result<Box<dyn DeviceHandle>> {
        self.io.open()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("vid", &format_args!("{:04x}", self.vid))
            .field("pid", &format_args!("{:04x}", self.pid))
            .field("serial", &self.serial_number)
            .field("iface", &self.interface_number)
            .finish()
    }
}

/// Source of device attach/detach events.
///
/// The board manager is the single consumer: it calls
/// [`enumerate`](Self::enumerate) once for the initial listing, then
/// [`drain`](Self::drain) on every refresh, and parks in
/// [`wait`](Self::wait) between refreshes.
pub trait DeviceMonitor: Send {
    /// One-shot listing of the devices currently attached.
    fn enumerate(&mut self) -> Result<Vec<Arc<Device>>>;

    /// Pending change events since the last drain, in arrival order.
    fn drain(&mut self) -> Result<Vec<DeviceChange>>;

    /// Block until events are probably pending or `timeout` elapses.
    /// Returns `true` when a drain is worth attempting.
    fn wait(&mut self, timeout: Duration) -> bool;
}
