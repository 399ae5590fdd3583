//! End-to-end hotplug and upload scenarios, driven through the scripted
//! monitor: a runtime board reboots into its bootloader mid-upload, the
//! manager bridges the disconnect, and the upload task finishes against
//! the new interface.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use boardclaw::message::{self, Message};
use boardclaw::monitor::sim::{sim_device, MockIo, SimMonitor};
use boardclaw::{
    find_model, upload_task, BoardEvent, BoardManager, BoardState, CallbackAction, Capability,
    CapabilitySet, ClaimedInterface, Device, Firmware, InterfaceOps, Pool, ProgressFn, TaskStatus,
    UploadOptions, VendorDriver, MODELS,
};

const FLEET_VID: u16 = 0x1209;
const PID_RUNTIME: u16 = 0x0001;
const PID_BOOTLOADER: u16 = 0x0002;

/// Serializes the tests that assert on bus log lines; the bus is
/// process-wide and harness threads would interleave them otherwise.
fn log_capture_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Default)]
struct DriverLog {
    reboots: usize,
    resets: usize,
    uploads: Vec<Vec<u8>>,
}

struct FleetDriver {
    log: Arc<Mutex<DriverLog>>,
}

struct RuntimeOps {
    log: Arc<Mutex<DriverLog>>,
}

impl InterfaceOps for RuntimeOps {
    fn upload(&self, _: &Firmware, _: ProgressFn) -> boardclaw::Result<()> {
        Err(boardclaw::Error::Mode("not in bootloader mode".into()))
    }
    fn reset(&self) -> boardclaw::Result<()> {
        Err(boardclaw::Error::Mode("not in bootloader mode".into()))
    }
    fn reboot(&self) -> boardclaw::Result<()> {
        self.log.lock().unwrap().reboots += 1;
        Ok(())
    }
    fn serial_read(&self, _: &mut [u8], _: Option<Duration>) -> boardclaw::Result<usize> {
        Ok(0)
    }
    fn serial_write(&self, buf: &[u8]) -> boardclaw::Result<usize> {
        Ok(buf.len())
    }
    fn serial_set_attributes(&self, _: u32) -> boardclaw::Result<()> {
        Ok(())
    }
}

struct BootloaderOps {
    log: Arc<Mutex<DriverLog>>,
}

impl InterfaceOps for BootloaderOps {
    fn upload(&self, firmware: &Firmware, progress: ProgressFn) -> boardclaw::Result<()> {
        let half = firmware.size() as u64 / 2;
        progress(half, firmware.size() as u64);
        self.log.lock().unwrap().uploads.push(firmware.image().to_vec());
        progress(firmware.size() as u64, firmware.size() as u64);
        Ok(())
    }
    fn reset(&self) -> boardclaw::Result<()> {
        self.log.lock().unwrap().resets += 1;
        Ok(())
    }
    fn reboot(&self) -> boardclaw::Result<()> {
        Err(boardclaw::Error::Mode("already in bootloader mode".into()))
    }
    fn serial_read(&self, _: &mut [u8], _: Option<Duration>) -> boardclaw::Result<usize> {
        Err(boardclaw::Error::Mode("no serial in bootloader mode".into()))
    }
    fn serial_write(&self, _: &[u8]) -> boardclaw::Result<usize> {
        Err(boardclaw::Error::Mode("no serial in bootloader mode".into()))
    }
    fn serial_set_attributes(&self, _: u32) -> boardclaw::Result<()> {
        Err(boardclaw::Error::Mode("no serial in bootloader mode".into()))
    }
}

impl VendorDriver for FleetDriver {
    fn name(&self) -> &'static str {
        "fleet-sim"
    }

    fn open(&self, device: &Arc<Device>) -> boardclaw::Result<Option<ClaimedInterface>> {
        if device.vid() != FLEET_VID {
            return Ok(None);
        }
        match device.pid() {
            PID_RUNTIME => Ok(Some(ClaimedInterface {
                desc: "Sim Serial".into(),
                model: None,
                capabilities: CapabilitySet::new(&[Capability::Serial, Capability::Reboot]),
                ops: Box::new(RuntimeOps {
                    log: self.log.clone(),
                }),
            })),
            PID_BOOTLOADER => Ok(Some(ClaimedInterface {
                desc: "Sim Bootloader".into(),
                model: match device.release() {
                    0 => None,
                    r => MODELS.get(r as usize - 1),
                },
                capabilities: CapabilitySet::new(&[Capability::Upload, Capability::Reset]),
                ops: Box::new(BootloaderOps {
                    log: self.log.clone(),
                }),
            })),
            _ => Ok(None),
        }
    }
}

struct Fleet {
    manager: BoardManager,
    monitor: SimMonitor,
    log: Arc<Mutex<DriverLog>>,
    events: Arc<Mutex<Vec<BoardEvent>>>,
}

fn fleet(drop_delay: Duration) -> Fleet {
    let monitor = SimMonitor::new();
    let log = Arc::new(Mutex::new(DriverLog::default()));
    let driver: Box<dyn VendorDriver> = Box::new(FleetDriver { log: log.clone() });
    let manager = BoardManager::new(Box::new(monitor.clone()), vec![driver], drop_delay);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.register_callback(move |_, event| {
        sink.lock().unwrap().push(event);
        Ok(CallbackAction::Keep)
    });

    Fleet {
        manager,
        monitor,
        log,
        events,
    }
}

fn runtime_device(id: u64, serial: &str) -> Arc<Device> {
    sim_device(id, "1-4.2", FLEET_VID, PID_RUNTIME, 0, serial, 0, MockIo::new())
}

fn bootloader_device(id: u64, serial: &str, model_index: u16) -> Arc<Device> {
    sim_device(
        id,
        "1-4.2",
        FLEET_VID,
        PID_BOOTLOADER,
        model_index,
        serial,
        0,
        MockIo::new(),
    )
}

fn model_index(name: &str) -> u16 {
    let model = find_model(name).unwrap();
    (MODELS.iter().position(|m| m == model).unwrap() + 1) as u16
}

fn firmware_file(dir: &tempfile::TempDir, name: &str, image: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, image).unwrap();
    path
}

fn signed_image(model_name: &str, size: usize, offset: usize) -> Vec<u8> {
    let mut image = vec![0u8; size];
    let sig = find_model(model_name).unwrap().signature;
    image[offset..offset + 8].copy_from_slice(&sig);
    image
}

/// Pump the manager's refresh loop until the task finishes, injecting the
/// bootloader transition once the driver has seen the reboot request.
fn pump_upload(
    fleet: &Fleet,
    task: &Arc<boardclaw::Task>,
    transition: Option<(Arc<Device>, Arc<Device>)>,
) -> boardclaw::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut transition = transition;
    loop {
        if task
            .wait(TaskStatus::Finished, Some(Duration::from_millis(10)))
            .unwrap()
        {
            break;
        }
        assert!(Instant::now() < deadline, "upload did not finish in time");

        if let Some((old, new)) = transition.take() {
            if fleet.log.lock().unwrap().reboots > 0 {
                fleet.monitor.push_removed(old);
                fleet.monitor.push_added(new);
            } else {
                transition = Some((old, new));
            }
        }
        fleet.manager.refresh().unwrap();
    }
    task.join()
}

// ── Scenario: hotplug cycle ─────────────────────────────────────

#[test]
fn hotplug_cycle_added_disappeared_dropped() {
    let fleet = fleet(Duration::from_millis(60));
    let dev = runtime_device(1, "42");

    fleet.monitor.push_added(dev.clone());
    fleet.manager.refresh().unwrap();
    fleet.monitor.push_removed(dev);
    fleet.manager.refresh().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while fleet.events.lock().unwrap().len() < 3 {
        assert!(Instant::now() < deadline, "board was never dropped");
        fleet.manager.refresh().unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(
        *fleet.events.lock().unwrap(),
        vec![BoardEvent::Added, BoardEvent::Disappeared, BoardEvent::Dropped]
    );
}

// ── Scenario: bootloader transition during upload ───────────────

#[test]
fn upload_survives_the_bootloader_transition() {
    let _guard = log_capture_lock().lock().unwrap();

    let fleet = fleet(Duration::from_secs(5));
    let runtime = runtime_device(1, "42");
    fleet.monitor.push_added(runtime.clone());
    fleet.manager.refresh().unwrap();

    let board = fleet.manager.boards()[0].clone();
    assert!(board.has_capability(Capability::Reboot));
    assert!(!board.has_capability(Capability::Upload));

    let dir = tempfile::tempdir().unwrap();
    let image = signed_image("teensy20", 4096, 12);
    let path = firmware_file(&dir, "blink.bin", &image);

    // Capture the progress and log traffic for this upload.
    let progress = Arc::new(Mutex::new(Vec::new()));
    let logs = Arc::new(Mutex::new(Vec::new()));
    let progress_sink = progress.clone();
    let log_sink = logs.clone();
    let sub = message::bus().subscribe(move |msg| match msg {
        Message::Progress { value, max, .. } => {
            progress_sink.lock().unwrap().push((*value, *max));
        }
        Message::Log { text, .. } => log_sink.lock().unwrap().push(text.clone()),
        Message::Status { .. } => {}
    });

    let pool = Pool::new(2, Duration::from_millis(200));
    let options = UploadOptions {
        parallel: true,
        ..UploadOptions::default()
    };
    let task = upload_task(board.clone(), path, options);
    task.start(Some(&pool)).unwrap();

    let boot = bootloader_device(2, "42", model_index("teensy20"));
    pump_upload(&fleet, &task, Some((runtime, boot))).unwrap();

    // The board kept its identity across the transition.
    assert_eq!(board.identity(), "1-4.2#42");
    assert_eq!(board.state(), BoardState::Online);
    assert_eq!(board.model().unwrap().name, "teensy20");
    assert_eq!(
        *fleet.events.lock().unwrap(),
        vec![BoardEvent::Added, BoardEvent::Disappeared, BoardEvent::Changed]
    );

    // The image went through the bootloader interface, then a reset.
    {
        let log = fleet.log.lock().unwrap();
        assert_eq!(log.reboots, 1);
        assert_eq!(log.uploads.len(), 1);
        assert_eq!(log.uploads[0], image);
        assert_eq!(log.resets, 1);
    }

    assert_eq!(*progress.lock().unwrap(), vec![(2048, 4096), (4096, 4096)]);

    let logs = logs.lock().unwrap();
    let expect_in_order = [
        "Triggering board reboot",
        "Model: Teensy 2.0",
        "Uploading firmware...",
        "Sending reset command",
    ];
    let mut last = 0;
    for needle in expect_in_order {
        let pos = logs[last..]
            .iter()
            .position(|l| l.contains(needle))
            .unwrap_or_else(|| panic!("missing log line '{needle}'"));
        last += pos + 1;
    }
    assert!(logs.iter().any(|l| l.contains("Usage: 12.7%")));

    message::bus().unsubscribe(sub);
    pool.shutdown();
}

#[test]
fn upload_with_wait_skips_the_reboot_request() {
    let _guard = log_capture_lock().lock().unwrap();

    let fleet = fleet(Duration::from_secs(5));
    let runtime = runtime_device(1, "42");
    fleet.monitor.push_added(runtime.clone());
    fleet.manager.refresh().unwrap();
    let board = fleet.manager.boards()[0].clone();

    let dir = tempfile::tempdir().unwrap();
    let path = firmware_file(&dir, "blink.bin", &signed_image("teensy20", 1024, 12));

    let pool = Pool::new(2, Duration::from_millis(200));
    let options = UploadOptions {
        parallel: true,
        wait: true,
        ..UploadOptions::default()
    };
    let task = upload_task(board, path, options);
    task.start(Some(&pool)).unwrap();

    // No reboot request may be issued; inject the button press ourselves.
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(fleet.log.lock().unwrap().reboots, 0);
    fleet.monitor.push_removed(runtime);
    fleet
        .monitor
        .push_added(bootloader_device(2, "42", model_index("teensy20")));

    pump_upload(&fleet, &task, None).unwrap();
    assert_eq!(fleet.log.lock().unwrap().reboots, 0);
    assert_eq!(fleet.log.lock().unwrap().uploads.len(), 1);
    pool.shutdown();
}

#[test]
fn upload_retries_as_wait_when_the_reboot_stalls() {
    let _guard = log_capture_lock().lock().unwrap();

    let fleet = fleet(Duration::from_secs(5));
    let runtime = runtime_device(1, "42");
    fleet.monitor.push_added(runtime.clone());
    fleet.manager.refresh().unwrap();
    let board = fleet.manager.boards()[0].clone();

    let dir = tempfile::tempdir().unwrap();
    let path = firmware_file(&dir, "blink.bin", &signed_image("teensy20", 1024, 12));

    let logs = Arc::new(Mutex::new(Vec::new()));
    let log_sink = logs.clone();
    let sub = message::bus().subscribe(move |msg| {
        if let Message::Log { text, .. } = msg {
            log_sink.lock().unwrap().push(text.clone());
        }
    });

    let pool = Pool::new(2, Duration::from_millis(200));
    let options = UploadOptions {
        parallel: true,
        reboot_delay: Duration::from_millis(40),
        ..UploadOptions::default()
    };
    let task = upload_task(board, path, options);
    task.start(Some(&pool)).unwrap();

    // Let the bounded reboot wait expire before "pressing the button".
    std::thread::sleep(Duration::from_millis(120));
    fleet.monitor.push_removed(runtime);
    fleet
        .monitor
        .push_added(bootloader_device(2, "42", model_index("teensy20")));

    pump_upload(&fleet, &task, None).unwrap();

    assert!(logs
        .lock()
        .unwrap()
        .iter()
        .any(|l| l.contains("Reboot didn't work, press button manually")));
    assert_eq!(fleet.log.lock().unwrap().uploads.len(), 1);

    message::bus().unsubscribe(sub);
    pool.shutdown();
}

// ── Scenario: firmware/model reconciliation ─────────────────────

#[test]
fn firmware_signature_detection_finds_the_model() {
    let image = signed_image("teensy20", 4096, 12);
    assert_eq!(boardclaw::test_firmware(&image).unwrap().name, "teensy20");
}

#[test]
fn upload_refuses_firmware_built_for_another_board() {
    let _guard = log_capture_lock().lock().unwrap();

    let fleet = fleet(Duration::from_secs(5));
    fleet
        .monitor
        .push_added(bootloader_device(1, "42", model_index("teensy31")));
    fleet.manager.refresh().unwrap();
    let board = fleet.manager.boards()[0].clone();

    let dir = tempfile::tempdir().unwrap();
    let path = firmware_file(&dir, "blink.bin", &signed_image("teensy20", 4096, 12));

    let task = upload_task(board, path, UploadOptions::default());
    task.start(Some(&Pool::new(0, Duration::from_millis(100)))).unwrap();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), "firmware");
    assert!(fleet.log.lock().unwrap().uploads.is_empty());
}

#[test]
fn upload_refuses_an_oversized_image_without_transferring() {
    let _guard = log_capture_lock().lock().unwrap();

    let fleet = fleet(Duration::from_secs(5));
    fleet
        .monitor
        .push_added(bootloader_device(1, "42", model_index("teensy20")));
    fleet.manager.refresh().unwrap();
    let board = fleet.manager.boards()[0].clone();

    let code_size = find_model("teensy20").unwrap().code_size;
    let dir = tempfile::tempdir().unwrap();
    let image = signed_image("teensy20", code_size + 1, 12);
    let path = firmware_file(&dir, "blink.bin", &image);

    let task = upload_task(board, path, UploadOptions::default());
    task.start(Some(&Pool::new(0, Duration::from_millis(100)))).unwrap();
    let err = task.join().unwrap_err();
    assert_eq!(err.kind(), "range");
    assert!(fleet.log.lock().unwrap().uploads.is_empty());
}

#[test]
fn upload_against_a_dropped_board_fails_with_not_found() {
    let _guard = log_capture_lock().lock().unwrap();

    let fleet = fleet(Duration::from_millis(40));
    let runtime = runtime_device(1, "42");
    fleet.monitor.push_added(runtime.clone());
    fleet.manager.refresh().unwrap();
    let board = fleet.manager.boards()[0].clone();

    let dir = tempfile::tempdir().unwrap();
    let path = firmware_file(&dir, "blink.bin", &signed_image("teensy20", 1024, 12));

    let pool = Pool::new(2, Duration::from_millis(200));
    let options = UploadOptions {
        parallel: true,
        wait: true,
        ..UploadOptions::default()
    };
    let task = upload_task(board, path, options);
    task.start(Some(&pool)).unwrap();

    // The board vanishes and stays gone past the drop delay.
    fleet.monitor.push_removed(runtime);
    fleet.manager.refresh().unwrap();
    std::thread::sleep(Duration::from_millis(80));

    let err = pump_upload(&fleet, &task, None).unwrap_err();
    assert_eq!(err.kind(), "not_found");
    pool.shutdown();
}
