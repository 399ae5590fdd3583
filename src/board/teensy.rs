//! Teensy vendor driver.
//!
//! Claims PJRC devices (VID `16C0`). A board shows up in one of two shapes:
//! the HalfKay bootloader (PID `0478`), which accepts firmware blocks and a
//! boot command over HID reports, or a runtime USB-serial mode, which
//! carries application serial traffic and can be kicked back into the
//! bootloader with the 134-baud line-coding trick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::interface::{
    Capability, CapabilitySet, ClaimedInterface, InterfaceOps, ProgressFn, VendorDriver,
};
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::models::{find_model, Model};
use crate::monitor::{Device, DeviceHandle};

const TEENSY_VID: u16 = 0x16C0;
const HALFKAY_PID: u16 = 0x0478;

/// Runtime-mode PIDs that expose a serial interface.
const SERIAL_PIDS: &[u16] = &[0x0476, 0x0482, 0x0483, 0x0484, 0x0487, 0x0488];

/// Setting this baud rate on a runtime Teensy reboots it into HalfKay.
const REBOOT_BAUD: u32 = 134;

/// `bcdDevice` values the HalfKay bootloader reports, mapped to models.
const BOOTLOADER_RELEASES: &[(u16, &str)] = &[
    (0x0101, "teensy++10"),
    (0x0102, "teensy20"),
    (0x0103, "teensy++20"),
    (0x0130, "teensy30"),
    (0x0131, "teensy31"),
];

fn model_from_release(release: u16) -> Option<&'static Model> {
    BOOTLOADER_RELEASES
        .iter()
        .find(|(r, _)| *r == release)
        .and_then(|(_, name)| find_model(name))
}

/// The driver itself. Stateless; everything lives in the per-interface ops.
pub struct TeensyDriver;

impl VendorDriver for TeensyDriver {
    fn name(&self) -> &'static str {
        "teensy"
    }

    fn open(&self, device: &Arc<Device>) -> Result<Option<ClaimedInterface>> {
        if device.vid() != TEENSY_VID {
            return Ok(None);
        }

        if device.pid() == HALFKAY_PID {
            let handle = device.open()?;
            let model = model_from_release(device.release());
            return Ok(Some(ClaimedInterface {
                desc: "HalfKay Bootloader".into(),
                model,
                capabilities: CapabilitySet::new(&[Capability::Upload, Capability::Reset]),
                ops: Box::new(BootloaderOps {
                    handle: Mutex::new(handle),
                    model,
                }),
            }));
        }

        if SERIAL_PIDS.contains(&device.pid()) {
            let handle = device.open()?;
            return Ok(Some(ClaimedInterface {
                desc: "USB Serial".into(),
                model: None,
                capabilities: CapabilitySet::new(&[Capability::Serial, Capability::Reboot]),
                ops: Box::new(SerialOps {
                    handle: Mutex::new(handle),
                }),
            }));
        }

        // 16C0 is a shared VID; unknown PIDs belong to other projects.
        Ok(None)
    }
}

// ── HalfKay bootloader mode ─────────────────────────────────────

struct BootloaderOps {
    handle: Mutex<Box<dyn DeviceHandle>>,
    model: Option<&'static Model>,
}

impl BootloaderOps {
    fn model(&self) -> Result<&'static Model> {
        self.model
            .ok_or_else(|| Error::Mode("Cannot upload to an unidentified bootloader".into()))
    }
}

impl InterfaceOps for BootloaderOps {
    fn upload(&self, firmware: &Firmware, progress: ProgressFn) -> Result<()> {
        let model = self.model()?;
        let image = firmware.image();
        let total = image.len() as u64;
        let mut handle = self.handle.lock();

        let mut addr = 0usize;
        while addr < image.len() {
            let end = (addr + model.block_size).min(image.len());
            let report = flash_report(model, addr, &image[addr..end]);
            handle.write(&report)?;
            progress(end as u64, total);
            addr = end;
        }

        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let model = self.model()?;
        let mut handle = self.handle.lock();
        handle.write(&boot_report(model))?;
        Ok(())
    }

    fn reboot(&self) -> Result<()> {
        Err(Error::Mode("Already in bootloader mode".into()))
    }

    fn serial_read(&self, _buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize> {
        Err(Error::Mode("No serial interface in bootloader mode".into()))
    }

    fn serial_write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::Mode("No serial interface in bootloader mode".into()))
    }

    fn serial_set_attributes(&self, _rate: u32) -> Result<()> {
        Err(Error::Mode("No serial interface in bootloader mode".into()))
    }
}

/// Address prefix of a HalfKay report: 2 bytes on AVR parts, a 64-byte
/// header on ARM parts.
fn report_header(model: &Model, addr: usize) -> Vec<u8> {
    if model.block_size <= 256 {
        vec![(addr & 0xFF) as u8, ((addr >> 8) & 0xFF) as u8]
    } else {
        let mut header = vec![0u8; 64];
        header[0] = (addr & 0xFF) as u8;
        header[1] = ((addr >> 8) & 0xFF) as u8;
        header[2] = ((addr >> 16) & 0xFF) as u8;
        header
    }
}

/// One firmware block, padded to the model's block size with erased flash.
fn flash_report(model: &Model, addr: usize, data: &[u8]) -> Vec<u8> {
    let mut report = report_header(model, addr);
    report.extend_from_slice(data);
    report.resize(report_len(model), 0xFF);
    report
}

/// The magic all-ones address tells HalfKay to run the uploaded program.
fn boot_report(model: &Model) -> Vec<u8> {
    let mut report = report_header(model, 0xFF_FFFF);
    report.resize(report_len(model), 0);
    report
}

fn report_len(model: &Model) -> usize {
    if model.block_size <= 256 {
        model.block_size + 2
    } else {
        model.block_size + 64
    }
}

// ── Runtime serial mode ─────────────────────────────────────────

struct SerialOps {
    handle: Mutex<Box<dyn DeviceHandle>>,
}

impl InterfaceOps for SerialOps {
    fn upload(&self, _firmware: &Firmware, _progress: ProgressFn) -> Result<()> {
        Err(Error::Mode("Firmware upload is not available in this mode".into()))
    }

    fn reset(&self) -> Result<()> {
        Err(Error::Mode("Cannot reset in this mode".into()))
    }

    fn reboot(&self) -> Result<()> {
        // The board drops off the bus in response; the monitor will deliver
        // the removal and the bootloader's arrival.
        let mut handle = self.handle.lock();
        handle.set_attributes(REBOOT_BAUD)
    }

    fn serial_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        self.handle.lock().read(buf, timeout)
    }

    fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        self.handle.lock().write(buf)
    }

    fn serial_set_attributes(&self, rate: u32) -> Result<()> {
        self.handle.lock().set_attributes(rate)
    }
}
