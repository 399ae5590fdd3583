//! Firmware upload orchestration.
//!
//! Builds the task that takes a board from wherever it is to "running the
//! new firmware": load the image, get the board into its bootloader
//! (rebooting it or waiting for the user's button press), re-check the
//! image and model, push the blocks, and reset. User-facing lines go
//! through the message bus; the CLI prints them, a GUI would route them to
//! its console pane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::board::interface::Capability;
use crate::board::Board;
use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::message::{self, LogLevel};
use crate::task::Task;

/// Upload behavior knobs, defaulting to the reboot-then-bounded-wait flow.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Firmware format name; autodetected from the extension when `None`.
    pub format: Option<String>,
    /// Wait for the bootloader instead of requesting a reboot.
    pub wait: bool,
    /// Reset the board into the new firmware after uploading.
    pub reset_after: bool,
    /// Verify the image signature against the board model.
    pub check: bool,
    /// How long to give a requested reboot before falling back to waiting
    /// for a manual button press.
    pub reboot_delay: Duration,
    /// Use the parallel wait path: the task parks on the refresh signal
    /// while another thread drives the manager. Leave unset when the task
    /// is joined inline from the thread that pumps events.
    pub parallel: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            format: None,
            wait: false,
            reset_after: true,
            check: true,
            reboot_delay: Duration::from_millis(4_000),
            parallel: false,
        }
    }
}

impl UploadOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            check: config.check_firmware,
            reboot_delay: Duration::from_millis(config.reboot_delay_ms),
            ..Self::default()
        }
    }
}

/// Build the upload task for `board`. The caller starts and joins it.
pub fn upload_task(board: Arc<Board>, filename: PathBuf, options: UploadOptions) -> Arc<Task> {
    Task::new("upload", move || run_upload(&board, &filename, &options))
}

fn run_upload(board: &Arc<Board>, filename: &Path, options: &UploadOptions) -> Result<()> {
    // Load before touching the board; a broken file should fail fast.
    let (mut firmware, mtime) = load_with_mtime(filename, options.format.as_deref())?;

    if !board.has_capability(Capability::Upload) {
        if options.wait {
            message::log(
                LogLevel::Info,
                "Waiting for device...\n  (hint: press button to reboot)",
            );
        } else {
            message::log(LogLevel::Info, "Triggering board reboot");
            board.reboot()?;
        }
    }

    let mut wait_forever = options.wait;
    loop {
        let timeout = if wait_forever {
            None
        } else {
            Some(options.reboot_delay)
        };
        if board.wait_for(Capability::Upload, options.parallel, timeout)? {
            break;
        }
        message::log(LogLevel::Info, "Reboot didn't work, press button manually");
        wait_forever = true;
    }

    // The file may have been rebuilt while we waited for the bootloader.
    if let Some((fresh, _)) = reload_if_changed(filename, options.format.as_deref(), mtime)? {
        message::log(LogLevel::Info, "Firmware file has changed, reloading it");
        firmware = fresh;
    }

    let model = board
        .model()
        .filter(|m| m.is_usable())
        .ok_or_else(|| Error::Mode("Unknown board model".into()))?;

    message::log(LogLevel::Info, format!("Model: {}", model.desc));
    message::log(LogLevel::Info, format!("Firmware: {}", firmware.name()));
    message::log(
        LogLevel::Info,
        format!(
            "Usage: {:.1}% ({} bytes)",
            firmware.size() as f64 / model.code_size as f64 * 100.0,
            firmware.size()
        ),
    );

    message::log(LogLevel::Info, "Uploading firmware...");
    let task = Task::current();
    board.upload(&firmware, options.check, &mut |done, total| {
        if let Some(task) = &task {
            message::progress(task, "Uploading", done, total);
        }
    })?;

    if options.reset_after {
        message::log(LogLevel::Info, "Sending reset command");
        board.reset()?;
    } else {
        message::log(LogLevel::Info, "Firmware uploaded, reset the board to use it");
    }

    if let Some(task) = &task {
        task.set_result(Box::new(firmware));
    }
    Ok(())
}

fn load_with_mtime(path: &Path, format: Option<&str>) -> Result<(Firmware, SystemTime)> {
    let mtime = stat_mtime(path)?;
    let firmware = Firmware::load(path, format)?;
    Ok((firmware, mtime))
}

/// Reload the file when its mtime moved since `previous`.
fn reload_if_changed(
    path: &Path,
    format: Option<&str>,
    previous: SystemTime,
) -> Result<Option<(Firmware, SystemTime)>> {
    let mtime = stat_mtime(path)?;
    if mtime == previous {
        return Ok(None);
    }
    let firmware = Firmware::load(path, format)?;
    Ok(Some((firmware, mtime)))
}

fn stat_mtime(path: &Path) -> Result<SystemTime> {
    Ok(std::fs::metadata(path)?.modified()?)
}
