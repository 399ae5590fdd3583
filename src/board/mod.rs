//! Board aggregate — one logical microcontroller, assembled from the USB
//! interfaces that share its topological location.
//!
//! Capability façades resolve the routed interface under the board lock,
//! then invoke the operation with the lock released; the `Arc`'d interface
//! is the handoff token that keeps the handle open even if the board is
//! concurrently mutated by a hotplug event.

pub mod interface;
pub mod manager;
pub mod teensy;

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::models::{test_firmware, Model};
use interface::{BoardInterface, Capability, CapabilitySet, ProgressFn};
use manager::{BoardManager, ManagerRef, RefreshSignal};

/// Lifecycle state of a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardState {
    /// At least one interface is attached.
    Online,
    /// All interfaces are gone; the board lingers until the drop delay
    /// expires, bridging bootloader transitions.
    Missing,
    /// Removed from the manager. Terminal.
    Dropped,
}

impl BoardState {
    fn from_u8(v: u8) -> BoardState {
        match v {
            0 => BoardState::Online,
            1 => BoardState::Missing,
            _ => BoardState::Dropped,
        }
    }
}

pub(crate) struct BoardShared {
    pub(crate) state: BoardState,
    pub(crate) model: Option<&'static Model>,
    pub(crate) serial: u64,
    pub(crate) vid: u16,
    pub(crate) pid: u16,
    pub(crate) missing_since: Option<Instant>,
    pub(crate) interfaces: Vec<Arc<BoardInterface>>,
    pub(crate) cap2iface: [Option<Arc<BoardInterface>>; Capability::COUNT],
    pub(crate) capabilities: CapabilitySet,
}

/// A logical board.
pub struct Board {
    location: String,
    identity: String,
    shared: Mutex<BoardShared>,
    /// Mirrors of `shared` for lock-free reads.
    state_mirror: AtomicU8,
    caps_mirror: AtomicU32,
    refresh: Arc<RefreshSignal>,
    manager: Mutex<Option<ManagerRef>>,
    udata: Mutex<Option<Box<dyn std::any::Any + Send>>>,
}

impl Board {
    pub(crate) fn new(
        location: &str,
        serial: u64,
        model: Option<&'static Model>,
        vid: u16,
        pid: u16,
        refresh: Arc<RefreshSignal>,
        manager: ManagerRef,
    ) -> Arc<Board> {
        Arc::new(Board {
            location: location.to_string(),
            identity: format_identity(location, serial),
            shared: Mutex::new(BoardShared {
                state: BoardState::Online,
                model,
                serial,
                vid,
                pid,
                missing_since: None,
                interfaces: Vec::new(),
                cap2iface: Default::default(),
                capabilities: CapabilitySet::EMPTY,
            }),
            state_mirror: AtomicU8::new(BoardState::Online as u8),
            caps_mirror: AtomicU32::new(0),
            refresh,
            manager: Mutex::new(Some(manager)),
            udata: Mutex::new(None),
        })
    }

    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, BoardShared> {
        self.shared.lock()
    }

    /// Push the lock-free mirrors after mutating `shared`. Must be called
    /// with the guard still held so readers never see a torn pair.
    pub(crate) fn sync_mirrors(&self, shared: &BoardShared) {
        self.caps_mirror
            .store(shared.capabilities.bits(), Ordering::Release);
        self.state_mirror.store(shared.state as u8, Ordering::Release);
    }

    pub(crate) fn clear_manager(&self) {
        *self.manager.lock() = None;
    }

    fn manager(&self) -> Option<BoardManager> {
        self.manager.lock().as_ref().and_then(ManagerRef::upgrade)
    }

    // ── Accessors ──────────────────────────────────────────────

    /// USB topological location. Fixed at creation.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// `"<location>#<serial>"`, the `#` part omitted for serial 0.
    /// Fixed at creation, even if the serial is learned later.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> BoardState {
        BoardState::from_u8(self.state_mirror.load(Ordering::Acquire))
    }

    pub fn model(&self) -> Option<&'static Model> {
        self.shared.lock().model
    }

    pub fn serial(&self) -> u64 {
        self.shared.lock().serial
    }

    pub fn vid(&self) -> u16 {
        self.shared.lock().vid
    }

    pub fn pid(&self) -> u16 {
        self.shared.lock().pid
    }

    /// Union of the capabilities of all attached interfaces. Lock-free.
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::from_bits(self.caps_mirror.load(Ordering::Acquire))
    }

    /// Lock-free capability test.
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities().contains(cap)
    }

    /// The interface currently routed for a capability.
    pub fn interface(&self, cap: Capability) -> Option<Arc<BoardInterface>> {
        self.shared.lock().cap2iface[cap as usize].clone()
    }

    /// Snapshot of the attached interfaces.
    pub fn interfaces(&self) -> Vec<Arc<BoardInterface>> {
        self.shared.lock().interfaces.clone()
    }

    /// Visit interfaces under the board lock; the first `Some` stops the
    /// iteration and is returned.
    pub fn list_interfaces<T>(
        &self,
        mut visitor: impl FnMut(&Arc<BoardInterface>) -> Option<T>,
    ) -> Option<T> {
        let shared = self.shared.lock();
        for iface in &shared.interfaces {
            if let Some(v) = visitor(iface) {
                return Some(v);
            }
        }
        None
    }

    /// Opaque per-board slot for embedders (a GUI row handle, etc.).
    pub fn set_udata(&self, value: Option<Box<dyn std::any::Any + Send>>) {
        *self.udata.lock() = value;
    }

    pub fn with_udata<T: 'static, R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let guard = self.udata.lock();
        f(guard.as_ref().and_then(|v| v.downcast_ref::<T>()))
    }

    /// Match against an identity spec `[location][#serial]`.
    ///
    /// An empty spec matches every board; a present location must match
    /// exactly; a nonzero serial must match numerically.
    pub fn matches_identity(&self, spec: &str) -> Result<bool> {
        if spec.is_empty() {
            return Ok(true);
        }
        let (location, serial) = parse_identity(spec)?;
        if let Some(location) = location {
            if location != self.location {
                return Ok(false);
            }
        }
        if serial != 0 && serial != self.serial() {
            return Ok(false);
        }
        Ok(true)
    }

    // ── Capability façades ─────────────────────────────────────

    fn routed_interface(&self, cap: Capability, msg: &str) -> Result<Arc<BoardInterface>> {
        self.interface(cap).ok_or_else(|| Error::Mode(msg.into()))
    }

    pub fn serial_set_attributes(&self, rate: u32) -> Result<()> {
        let iface = self.routed_interface(
            Capability::Serial,
            "Serial transfer is not available in this mode",
        )?;
        iface.ops().serial_set_attributes(rate)
    }

    pub fn serial_read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let iface = self.routed_interface(
            Capability::Serial,
            "Serial transfer is not available in this mode",
        )?;
        iface.ops().serial_read(buf, timeout)
    }

    pub fn serial_write(&self, buf: &[u8]) -> Result<usize> {
        let iface = self.routed_interface(
            Capability::Serial,
            "Serial transfer is not available in this mode",
        )?;
        iface.ops().serial_write(buf)
    }

    pub fn reset(&self) -> Result<()> {
        let iface = self.routed_interface(Capability::Reset, "Cannot reset in this mode")?;
        iface.ops().reset()
    }

    pub fn reboot(&self) -> Result<()> {
        let iface = self.routed_interface(Capability::Reboot, "Cannot reboot in this mode")?;
        iface.ops().reboot()
    }

    /// Upload a firmware image through the routed interface.
    ///
    /// With `check` set, the image must carry the signature of the board's
    /// model; without it, only the size limit is enforced.
    pub fn upload(&self, firmware: &Firmware, check: bool, progress: ProgressFn) -> Result<()> {
        let iface = self.routed_interface(
            Capability::Upload,
            "Firmware upload is not available in this mode",
        )?;

        let model = self
            .model()
            .filter(|m| m.is_usable())
            .ok_or_else(|| Error::Mode("Cannot upload to unknown board model".into()))?;

        if firmware.size() > model.code_size {
            return Err(Error::Range(format!(
                "Firmware is too big for {} ({} > {} bytes)",
                model.desc,
                firmware.size(),
                model.code_size
            )));
        }

        if check {
            match test_firmware(firmware.image()) {
                None => {
                    return Err(Error::Firmware(
                        "This firmware was not compiled for a known device".into(),
                    ));
                }
                Some(guess) if guess != model => {
                    return Err(Error::Firmware(format!(
                        "This firmware was compiled for {}",
                        guess.desc
                    )));
                }
                Some(_) => {}
            }
        }

        iface.ops().upload(firmware, progress)
    }

    /// Wait until the board exposes `cap`.
    ///
    /// With `parallel` unset the calling thread drives the manager's
    /// refresh loop itself; set, it parks on the refresh signal and relies
    /// on another thread refreshing — the shape a pool worker uses while
    /// the main thread pumps events. Returns `Ok(false)` on timeout and
    /// `not_found` once the board is dropped.
    pub fn wait_for(
        &self,
        cap: Capability,
        parallel: bool,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        if parallel {
            let deadline = timeout.map(|t| Instant::now() + t);
            let mut guard = self.refresh.mutex.lock();
            loop {
                if self.state() == BoardState::Dropped {
                    return Err(Error::NotFound("Board has disappeared".into()));
                }
                if self.has_capability(cap) {
                    return Ok(true);
                }
                match deadline {
                    Some(d) => {
                        let remaining = d.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Ok(false);
                        }
                        let _ = self.refresh.cond.wait_for(&mut guard, remaining);
                    }
                    None => self.refresh.cond.wait(&mut guard),
                }
            }
        } else {
            let manager = self
                .manager()
                .ok_or_else(|| Error::NotFound("Board has disappeared".into()))?;
            manager.wait_until(timeout, || {
                if self.state() == BoardState::Dropped {
                    return Err(Error::NotFound("Board has disappeared".into()));
                }
                Ok(self.has_capability(cap))
            })
        }
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("capabilities", &format_args!("{}", self.capabilities()))
            .finish()
    }
}

/// Canonical identity string: `"<location>#<serial>"`, bare location when
/// the serial is 0.
pub fn format_identity(location: &str, serial: u64) -> String {
    if serial == 0 {
        location.to_string()
    } else {
        format!("{location}#{serial}")
    }
}

/// Parse an identity spec into its optional location and serial parts.
/// Either side of the `#` may be empty; a malformed serial is a `param`
/// error.
pub fn parse_identity(spec: &str) -> Result<(Option<String>, u64)> {
    match spec.split_once('#') {
        None => Ok((non_empty(spec), 0)),
        Some((location, serial)) => {
            let serial = serial
                .parse::<u64>()
                .map_err(|_| Error::Param("#<serial> must be a number".into()))?;
            Ok((non_empty(location), serial))
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
