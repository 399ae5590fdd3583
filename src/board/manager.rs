//! Board manager — turns the monitor's device events into board lifecycle
//! events.
//!
//! The manager aggregates interfaces into boards by location, keeps boards
//! alive through the disconnect window of a bootloader transition, and fans
//! every change out to registered callbacks. Event processing is
//! single-threaded: whoever calls [`BoardManager::refresh`] drives the
//! machine, and worker threads observe the results through the refresh
//! signal and the boards' lock-free mirrors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::interface::{open_interface, BoardInterface, CapabilitySet, VendorDriver};
use super::{Board, BoardShared, BoardState};
use crate::error::Result;
use crate::monitor::{Device, DeviceEvent, DeviceId, DeviceMonitor};

/// Default grace period before a missing board is dropped.
pub const DROP_DELAY: Duration = Duration::from_millis(5_000);

/// What happened to a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    /// A new board appeared.
    Added,
    /// An existing board gained or lost an interface, or came back.
    Changed,
    /// The last interface went away; the board is now missing.
    Disappeared,
    /// The missing grace period expired; the board is gone for good.
    Dropped,
}

/// A callback's verdict about its own registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Keep,
    /// Remove this callback after the current delivery.
    Unsubscribe,
}

type CallbackFn = Box<dyn FnMut(&Arc<Board>, BoardEvent) -> Result<CallbackAction> + Send>;

struct CallbackEntry {
    id: u64,
    f: CallbackFn,
}

/// Mutex/condvar pair broadcast at the end of every refresh so `parallel`
/// waiters re-check their predicates.
pub(crate) struct RefreshSignal {
    pub(crate) mutex: Mutex<()>,
    pub(crate) cond: Condvar,
}

impl RefreshSignal {
    pub(crate) fn new() -> Arc<RefreshSignal> {
        Arc::new(RefreshSignal {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    fn broadcast(&self) {
        let _guard = self.mutex.lock();
        self.cond.notify_all();
    }
}

/// Weak handle stored inside boards, so a board can reach its manager
/// without keeping it alive.
pub(crate) struct ManagerRef {
    pub(crate) inner: Weak<Mutex<ManagerInner>>,
    pub(crate) refresh: Arc<RefreshSignal>,
}

impl ManagerRef {
    pub(crate) fn upgrade(&self) -> Option<BoardManager> {
        self.inner.upgrade().map(|inner| BoardManager {
            inner,
            refresh: self.refresh.clone(),
        })
    }
}

/// Expired-deadline timer driving the missing-board drop flow.
struct DropTimer {
    deadline: Option<Instant>,
}

impl DropTimer {
    fn new() -> Self {
        Self { deadline: None }
    }

    fn set(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// True once after the deadline has passed.
    fn rearm(&mut self) -> bool {
        match self.deadline {
            Some(d) if d <= Instant::now() => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

struct InterfaceEntry {
    iface: Arc<BoardInterface>,
    board: Arc<Board>,
}

pub(crate) struct ManagerInner {
    monitor: Box<dyn DeviceMonitor>,
    drivers: Vec<Box<dyn VendorDriver>>,
    drop_delay: Duration,
    timer: DropTimer,
    enumerated: bool,
    boards: Vec<Arc<Board>>,
    /// Missing boards in the order they went missing; the head owns the
    /// drop timer.
    missing: VecDeque<Arc<Board>>,
    /// Device key → attached interface, for O(1) removal lookup.
    interfaces: HashMap<DeviceId, InterfaceEntry>,
    callbacks: Vec<CallbackEntry>,
    next_callback_id: u64,
}

/// Cloneable handle to the hotplug state machine.
#[derive(Clone)]
pub struct BoardManager {
    inner: Arc<Mutex<ManagerInner>>,
    refresh: Arc<RefreshSignal>,
}

impl BoardManager {
    pub fn new(
        monitor: Box<dyn DeviceMonitor>,
        drivers: Vec<Box<dyn VendorDriver>>,
        drop_delay: Duration,
    ) -> BoardManager {
        BoardManager {
            inner: Arc::new(Mutex::new(ManagerInner {
                monitor,
                drivers,
                drop_delay,
                timer: DropTimer::new(),
                enumerated: false,
                boards: Vec::new(),
                missing: VecDeque::new(),
                interfaces: HashMap::new(),
                callbacks: Vec::new(),
                next_callback_id: 0,
            })),
            refresh: RefreshSignal::new(),
        }
    }

    fn manager_ref(&self) -> ManagerRef {
        ManagerRef {
            inner: Arc::downgrade(&self.inner),
            refresh: self.refresh.clone(),
        }
    }

    /// Register a board-event callback; delivery order is registration
    /// order. Callbacks run on the thread driving `refresh` and must not
    /// call back into the manager.
    pub fn register_callback(
        &self,
        f: impl FnMut(&Arc<Board>, BoardEvent) -> Result<CallbackAction> + Send + 'static,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_callback_id;
        inner.next_callback_id += 1;
        inner.callbacks.push(CallbackEntry { id, f: Box::new(f) });
        id
    }

    /// Remove a callback by the id `register_callback` returned.
    pub fn deregister_callback(&self, id: u64) {
        self.inner.lock().callbacks.retain(|c| c.id != id);
    }

    /// Online boards, in discovery order.
    pub fn boards(&self) -> Vec<Arc<Board>> {
        self.inner
            .lock()
            .boards
            .iter()
            .filter(|b| b.state() == BoardState::Online)
            .cloned()
            .collect()
    }

    /// Online boards matching an identity spec.
    pub fn matching_boards(&self, spec: &str) -> Result<Vec<Arc<Board>>> {
        let mut matched = Vec::new();
        for board in self.boards() {
            if board.matches_identity(spec)? {
                matched.push(board);
            }
        }
        Ok(matched)
    }

    /// Run one refresh cycle: drop expired missing boards, enumerate on
    /// the first call, drain monitor events, then wake `parallel` waiters.
    /// With nothing pending this is a no-op and fires no callbacks.
    pub fn refresh(&self) -> Result<()> {
        let result = {
            let mut inner = self.inner.lock();
            self.refresh_locked(&mut inner)
        };
        // Waiters re-check even after a failed cycle; a dropped board must
        // not leave them parked.
        self.refresh.broadcast();
        result
    }

    fn refresh_locked(&self, inner: &mut ManagerInner) -> Result<()> {
        if inner.timer.rearm() {
            while let Some(head) = inner.missing.front().cloned() {
                let since = head
                    .lock_shared()
                    .missing_since
                    .unwrap_or_else(Instant::now);
                let deadline = since + inner.drop_delay;
                if deadline > Instant::now() {
                    inner.timer.set(deadline);
                    break;
                }
                drop_board(inner, &head)?;
            }
        }

        if !inner.enumerated {
            inner.enumerated = true;
            let devices = inner.monitor.enumerate()?;
            for device in devices {
                self.add_interface(inner, &device)?;
            }
        }

        let changes = inner.monitor.drain()?;
        for change in changes {
            match change.event {
                DeviceEvent::Added => self.add_interface(inner, &change.device)?,
                DeviceEvent::Removed => remove_interface(inner, &change.device)?,
            }
        }

        Ok(())
    }

    /// Refresh until `predicate` is satisfied or `timeout` elapses.
    ///
    /// The monitor's own wait bounds each idle stretch so timer-driven
    /// drops still happen on time.
    pub fn wait_until(
        &self,
        timeout: Option<Duration>,
        mut predicate: impl FnMut() -> Result<bool>,
    ) -> Result<bool> {
        const MAX_SLICE: Duration = Duration::from_millis(500);

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            self.refresh()?;
            if predicate()? {
                return Ok(true);
            }
            let slice = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(false);
                    }
                    remaining.min(MAX_SLICE)
                }
                None => MAX_SLICE,
            };
            self.inner.lock().monitor.wait(slice);
        }
    }

    // ── Added-device flow ──────────────────────────────────────

    fn add_interface(&self, inner: &mut ManagerInner, device: &Arc<Device>) -> Result<()> {
        let iface = match open_interface(device, &inner.drivers)? {
            Some(iface) => iface,
            // Not a board we manage.
            None => return Ok(()),
        };

        let mut board = inner
            .boards
            .iter()
            .find(|b| b.location() == device.location())
            .cloned();

        /* Device notifications may arrive out of order, or a removal may
           have been lost entirely, so an existing board at this location is
           checked against the new interface before reuse. */
        if let Some(existing) = board.clone() {
            let (replaced, mode_changed, occupied) = {
                let shared = existing.lock_shared();
                let iface_model = iface.model().filter(|m| m.is_usable());
                let board_model = shared.model.filter(|m| m.is_usable());
                let model_conflict = matches!((iface_model, board_model),
                    (Some(a), Some(b)) if a != b);
                let serial_conflict =
                    iface.serial() != 0 && shared.serial != 0 && iface.serial() != shared.serial;
                let mode_changed =
                    shared.vid != device.vid() || shared.pid != device.pid();
                (
                    model_conflict || serial_conflict,
                    mode_changed,
                    !shared.interfaces.is_empty(),
                )
            };

            if replaced {
                debug!(location = %existing.location(), "board replaced at location");
                drop_board(inner, &existing)?;
                board = None;
            } else if mode_changed {
                // A still-linked interface means the removal notification
                // was lost; release everything before re-attaching. A board
                // that is already missing just records its new mode.
                if occupied {
                    close_board(inner, &existing)?;
                }
                let mut shared = existing.lock_shared();
                shared.vid = device.vid();
                shared.pid = device.pid();
            }
        }

        let (board, event) = match board {
            Some(board) => {
                let mut shared = board.lock_shared();
                if let Some(model) = iface.model().filter(|m| m.is_usable()) {
                    shared.model = Some(model);
                }
                if iface.serial() != 0 {
                    shared.serial = iface.serial();
                }
                drop(shared);
                (board, BoardEvent::Changed)
            }
            None => {
                let board = Board::new(
                    device.location(),
                    iface.serial(),
                    iface.model(),
                    device.vid(),
                    device.pid(),
                    self.refresh.clone(),
                    self.manager_ref(),
                );
                inner.boards.push(board.clone());
                (board, BoardEvent::Added)
            }
        };

        {
            let mut shared = board.lock_shared();
            shared.interfaces.push(iface.clone());
            for cap in iface.capabilities().iter() {
                shared.cap2iface[cap as usize] = Some(iface.clone());
            }
            shared.capabilities = shared.capabilities.union(iface.capabilities());
            shared.state = BoardState::Online;
            shared.missing_since = None;
            board.sync_mirrors(&shared);
        }

        inner.missing.retain(|m| !Arc::ptr_eq(m, &board));
        inner.interfaces.insert(
            device.id(),
            InterfaceEntry {
                iface,
                board: board.clone(),
            },
        );

        debug!(board = %board.identity(), ?event, "board event");
        trigger_callbacks(inner, &board, event)
    }
}

// ── Removed-device flow ─────────────────────────────────────────

fn remove_interface(inner: &mut ManagerInner, device: &Arc<Device>) -> Result<()> {
    let entry = match inner.interfaces.remove(&device.id()) {
        Some(entry) => entry,
        // Not one of ours.
        None => return Ok(()),
    };
    let board = entry.board;

    let now_empty = {
        let mut shared = board.lock_shared();
        shared
            .interfaces
            .retain(|i| !Arc::ptr_eq(i, &entry.iface));
        rebuild_routing(&mut shared);
        board.sync_mirrors(&shared);
        shared.interfaces.is_empty()
    };

    if now_empty {
        {
            let mut shared = board.lock_shared();
            shared.state = BoardState::Missing;
            shared.missing_since = Some(Instant::now());
            board.sync_mirrors(&shared);
        }
        trigger_callbacks(inner, &board, BoardEvent::Disappeared)?;

        inner.missing.push_back(board.clone());
        // Other boards may already be in line; the timer always tracks the
        // head of the queue.
        if let Some(head) = inner.missing.front() {
            let since = head
                .lock_shared()
                .missing_since
                .unwrap_or_else(Instant::now);
            inner.timer.set(since + inner.drop_delay);
        }
        Ok(())
    } else {
        trigger_callbacks(inner, &board, BoardEvent::Changed)
    }
}

/// Recompute `cap2iface` and the capability union from the remaining
/// interfaces. Later interfaces win routing ties, matching attach order.
fn rebuild_routing(shared: &mut BoardShared) {
    shared.cap2iface = Default::default();
    shared.capabilities = CapabilitySet::EMPTY;
    let interfaces = shared.interfaces.clone();
    for iface in &interfaces {
        for cap in iface.capabilities().iter() {
            shared.cap2iface[cap as usize] = Some(iface.clone());
        }
        shared.capabilities = shared.capabilities.union(iface.capabilities());
    }
}

/// Release all interfaces but keep the board and its identity; used when
/// the same location reappears with a different VID/PID.
fn close_board(inner: &mut ManagerInner, board: &Arc<Board>) -> Result<()> {
    {
        let mut shared = board.lock_shared();
        shared.state = BoardState::Missing;
        for iface in shared.interfaces.drain(..) {
            inner.interfaces.remove(&iface.device().id());
        }
        shared.cap2iface = Default::default();
        shared.capabilities = CapabilitySet::EMPTY;
        board.sync_mirrors(&shared);
    }
    trigger_callbacks(inner, board, BoardEvent::Disappeared)
}

/// Terminal removal: unlink the board from the manager entirely.
fn drop_board(inner: &mut ManagerInner, board: &Arc<Board>) -> Result<()> {
    {
        let mut shared = board.lock_shared();
        shared.state = BoardState::Dropped;
        for iface in shared.interfaces.drain(..) {
            inner.interfaces.remove(&iface.device().id());
        }
        shared.cap2iface = Default::default();
        shared.capabilities = CapabilitySet::EMPTY;
        board.sync_mirrors(&shared);
    }
    inner.missing.retain(|m| !Arc::ptr_eq(m, board));

    let result = trigger_callbacks(inner, board, BoardEvent::Dropped);

    inner.boards.retain(|b| !Arc::ptr_eq(b, board));
    board.clear_manager();
    result
}

/// Deliver an event to every callback in registration order. A callback
/// returning [`CallbackAction::Unsubscribe`] is removed after delivery; an
/// error short-circuits the remaining callbacks and propagates.
fn trigger_callbacks(inner: &mut ManagerInner, board: &Arc<Board>, event: BoardEvent) -> Result<()> {
    let mut callbacks = std::mem::take(&mut inner.callbacks);
    let mut removed: Vec<u64> = Vec::new();
    let mut result = Ok(());

    for entry in &mut callbacks {
        match (entry.f)(board, event) {
            Ok(CallbackAction::Keep) => {}
            Ok(CallbackAction::Unsubscribe) => removed.push(entry.id),
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }

    callbacks.retain(|c| !removed.contains(&c.id));
    inner.callbacks = callbacks;
    result
}
