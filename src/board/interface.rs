//! Interface adapter — one opened USB interface of a board, with the
//! capability operations it exposes and the vendor-driver seam that
//! recognizes devices during hotplug.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::models::Model;
use crate::monitor::Device;

/// An operation a board can perform through some interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Upload = 0,
    Reset = 1,
    Reboot = 2,
    Serial = 3,
}

impl Capability {
    pub const COUNT: usize = 4;

    pub const ALL: [Capability; Capability::COUNT] = [
        Capability::Upload,
        Capability::Reset,
        Capability::Reboot,
        Capability::Serial,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::Upload => "upload",
            Capability::Reset => "reset",
            Capability::Reboot => "reboot",
            Capability::Serial => "serial",
        }
    }

    fn mask(self) -> u32 {
        1 << self as u32
    }
}

/// Small fixed set of [`Capability`] bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub fn new(caps: &[Capability]) -> Self {
        let mut set = CapabilitySet::EMPTY;
        for cap in caps {
            set.insert(*cap);
        }
        set
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.mask();
    }

    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.mask() != 0
    }

    pub fn union(self, other: CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }

    pub(crate) fn from_bits(bits: u32) -> CapabilitySet {
        CapabilitySet(bits)
    }
}

impl std::fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for cap in self.iter() {
            if !first {
                f.write_str("+")?;
            }
            f.write_str(cap.name())?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Progress callback for long transfers: `(bytes_done, bytes_total)`.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64, u64);

/// The operations an interface can carry out. One implementation exists per
/// vendor driver and interface mode; operations for capabilities the
/// interface does not advertise return `mode` errors and are unreachable
/// through the board façades.
pub trait InterfaceOps: Send + Sync {
    fn upload(&self, firmware: &Firmware, progress: ProgressFn) -> Result<()>;
    fn reset(&self) -> Result<()>;
    fn reboot(&self) -> Result<()>;
    fn serial_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;
    fn serial_write(&self, buf: &[u8]) -> Result<usize>;
    fn serial_set_attributes(&self, rate: u32) -> Result<()>;
}

/// What a vendor driver hands back when it claims a device.
pub struct ClaimedInterface {
    pub desc: String,
    pub model: Option<&'static Model>,
    pub capabilities: CapabilitySet,
    pub ops: Box<dyn InterfaceOps>,
}

/// Recognizes devices of one vendor family and opens them.
///
/// `open` answers `Ok(Some(_))` when the device belongs to this driver,
/// `Ok(None)` when it is someone else's (the next driver gets a look), and
/// `Err` only for a real failure on a device the driver does claim.
pub trait VendorDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn open(&self, device: &Arc<Device>) -> Result<Option<ClaimedInterface>>;
}

/// One opened USB interface of a board.
pub struct BoardInterface {
    device: Arc<Device>,
    desc: String,
    model: Option<&'static Model>,
    serial: u64,
    capabilities: CapabilitySet,
    ops: Box<dyn InterfaceOps>,
}

impl BoardInterface {
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn model(&self) -> Option<&'static Model> {
        self.model
    }

    /// Decimal USB serial number; 0 when the descriptor was unreadable.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    pub fn ops(&self) -> &dyn InterfaceOps {
        self.ops.as_ref()
    }
}

impl std::fmt::Debug for BoardInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardInterface")
            .field("desc", &self.desc)
            .field("device", &self.device)
            .field("capabilities", &format_args!("{}", self.capabilities))
            .finish()
    }
}

/// Try every registered driver against a device.
///
/// `Ok(None)` means no driver recognized it — not an error, the device is
/// simply not a board we manage.
pub fn open_interface(
    device: &Arc<Device>,
    drivers: &[Box<dyn VendorDriver>],
) -> Result<Option<Arc<BoardInterface>>> {
    for driver in drivers {
        if let Some(claimed) = driver.open(device)? {
            let serial = parse_serial(device.serial_number());
            return Ok(Some(Arc::new(BoardInterface {
                device: device.clone(),
                desc: claimed.desc,
                model: claimed.model,
                serial,
                capabilities: claimed.capabilities,
                ops: claimed.ops,
            })));
        }
    }
    Ok(None)
}

/// Decimal parse of the USB serial string, 0 when absent or non-numeric.
fn parse_serial(serial: &str) -> u64 {
    serial.trim().parse().unwrap_or(0)
}
