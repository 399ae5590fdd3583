//! Scripted device monitor for tests.
//!
//! Tests build [`Device`]s around in-memory [`MockIo`] handles, inject
//! attach/detach events through a cloneable [`SimMonitor`], and drive the
//! board manager's refresh cycle by hand.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Device, DeviceChange, DeviceEvent, DeviceHandle, DeviceId, DeviceIo, DeviceMonitor};
use crate::error::Result;

struct SimShared {
    queue: Mutex<VecDeque<DeviceChange>>,
    cond: Condvar,
}

/// Event source whose clones are used to inject events from the test body
/// while the board manager owns the original.
#[derive(Clone)]
pub struct SimMonitor {
    shared: Arc<SimShared>,
    initial: Arc<Mutex<Vec<Arc<Device>>>>,
}

impl SimMonitor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SimShared {
                queue: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
            }),
            initial: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Devices reported by the initial enumeration.
    pub fn seed(&self, device: Arc<Device>) {
        self.initial.lock().push(device);
    }

    pub fn push_added(&self, device: Arc<Device>) {
        self.push(DeviceEvent::Added, device);
    }

    pub fn push_removed(&self, device: Arc<Device>) {
        self.push(DeviceEvent::Removed, device);
    }

    fn push(&self, event: DeviceEvent, device: Arc<Device>) {
        let mut queue = self.shared.queue.lock();
        queue.push_back(DeviceChange { event, device });
        self.shared.cond.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

impl Default for SimMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMonitor for SimMonitor {
    fn enumerate(&mut self) -> Result<Vec<Arc<Device>>> {
        Ok(self.initial.lock().clone())
    }

    fn drain(&mut self) -> Result<Vec<DeviceChange>> {
        Ok(self.shared.queue.lock().drain(..).collect())
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue.lock();
        while queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self
                .shared
                .cond
                .wait_for(&mut queue, remaining)
                .timed_out()
            {
                return !queue.is_empty();
            }
        }
        true
    }
}

// ── Mock device I/O ─────────────────────────────────────────────

/// Everything a mock handle did, for assertions.
#[derive(Default)]
pub struct MockIoState {
    /// Every buffer passed to `write`, in order.
    pub writes: Vec<Vec<u8>>,
    /// Scripted responses for `read`, consumed front to back.
    pub reads: VecDeque<Vec<u8>>,
    /// Rates passed to `set_attributes`, in order.
    pub rates: Vec<u32>,
    /// Number of times the device was opened.
    pub opens: usize,
}

/// In-memory [`DeviceIo`] whose state is shared with the test body.
#[derive(Clone, Default)]
pub struct MockIo {
    state: Arc<Mutex<MockIoState>>,
}

impl MockIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &Arc<Mutex<MockIoState>> {
        &self.state
    }

    /// Queue a buffer to be returned by the next `read`.
    pub fn script_read(&self, data: Vec<u8>) {
        self.state.lock().reads.push_back(data);
    }
}

impl DeviceIo for MockIo {
    fn open(&self) -> Result<Box<dyn DeviceHandle>> {
        self.state.lock().opens += 1;
        Ok(Box::new(MockHandle {
            state: self.state.clone(),
        }))
    }
}

struct MockHandle {
    state: Arc<Mutex<MockIoState>>,
}

impl DeviceHandle for MockHandle {
    fn read(&mut self, buf: &mut [u8], _timeout: Option<Duration>) -> Result<usize> {
        let mut state = self.state.lock();
        match state.reads.pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.state.lock().writes.push(buf.to_vec());
        Ok(buf.len())
    }

    fn set_attributes(&mut self, rate: u32) -> Result<()> {
        self.state.lock().rates.push(rate);
        Ok(())
    }
}

/// Shorthand for building a simulated device.
#[allow(clippy::too_many_arguments)]
pub fn sim_device(
    id: u64,
    location: &str,
    vid: u16,
    pid: u16,
    release: u16,
    serial: &str,
    interface_number: u8,
    io: MockIo,
) -> Arc<Device> {
    Device::new(
        DeviceId(id),
        location,
        format!("sim:{id}"),
        vid,
        pid,
        release,
        serial,
        interface_number,
        Arc::new(io),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_events_in_order_then_empties() {
        let mut monitor = SimMonitor::new();
        let io = MockIo::new();
        let dev = sim_device(1, "1-1", 0x16C0, 0x0483, 0, "42", 0, io);

        monitor.push_added(dev.clone());
        monitor.push_removed(dev);

        let changes = monitor.drain().unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].event, DeviceEvent::Added);
        assert_eq!(changes[1].event, DeviceEvent::Removed);
        assert!(monitor.drain().unwrap().is_empty());
    }

    #[test]
    fn wait_returns_immediately_when_events_pending() {
        let mut monitor = SimMonitor::new();
        let dev = sim_device(1, "1-1", 0x16C0, 0x0483, 0, "42", 0, MockIo::new());
        monitor.push_added(dev);
        assert!(monitor.wait(Duration::from_secs(5)));
    }

    #[test]
    fn wait_times_out_when_idle() {
        let mut monitor = SimMonitor::new();
        let start = Instant::now();
        assert!(!monitor.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_wakes_on_injection_from_another_thread() {
        let mut monitor = SimMonitor::new();
        let injector = monitor.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            let dev = sim_device(1, "1-1", 0x16C0, 0x0483, 0, "42", 0, MockIo::new());
            injector.push_added(dev);
        });
        assert!(monitor.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn enumerate_returns_seeded_devices() {
        let mut monitor = SimMonitor::new();
        let dev = sim_device(1, "1-1", 0x16C0, 0x0483, 0, "42", 0, MockIo::new());
        monitor.seed(dev);
        assert_eq!(monitor.enumerate().unwrap().len(), 1);
    }

    #[test]
    fn mock_io_records_writes_and_rates() {
        let io = MockIo::new();
        let mut handle = io.open().unwrap();
        handle.write(&[1, 2, 3]).unwrap();
        handle.set_attributes(134).unwrap();

        let state = io.state().lock();
        assert_eq!(state.writes, vec![vec![1, 2, 3]]);
        assert_eq!(state.rates, vec![134]);
        assert_eq!(state.opens, 1);
    }

    #[test]
    fn mock_io_scripted_reads_are_consumed_in_order() {
        let io = MockIo::new();
        io.script_read(vec![0xAB]);
        io.script_read(vec![0xCD, 0xEF]);

        let mut handle = io.open().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf, None).unwrap(), 1);
        assert_eq!(buf[0], 0xAB);
        assert_eq!(handle.read(&mut buf, None).unwrap(), 2);
        assert_eq!(handle.read(&mut buf, None).unwrap(), 0);
    }
}
