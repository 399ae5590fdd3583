//! Boardclaw — fleet management for Teensy-family USB development boards.
//!
//! The crate discovers boards as they plug and unplug, aggregates the USB
//! interfaces of one physical board into a [`Board`], tracks which
//! operations (upload, reset, reboot, serial) are reachable in its current
//! mode, and runs long operations like [`upload::upload_task`] on a worker
//! pool that reports progress through the [`message`] bus.

#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod board;
pub mod config;
pub mod error;
pub mod firmware;
pub mod message;
pub mod models;
pub mod monitor;
pub mod task;
pub mod upload;

pub use board::interface::{
    open_interface, BoardInterface, Capability, CapabilitySet, ClaimedInterface, InterfaceOps,
    ProgressFn, VendorDriver,
};
pub use board::manager::{BoardEvent, BoardManager, CallbackAction, DROP_DELAY};
pub use board::teensy::TeensyDriver;
pub use board::{format_identity, parse_identity, Board, BoardState};
pub use config::Config;
pub use error::{Error, Result};
pub use firmware::Firmware;
pub use message::{LogLevel, Message, MessageBus};
pub use models::{find_model, test_firmware, Model, MODELS};
pub use monitor::sim::SimMonitor;
pub use monitor::usb::UsbMonitor;
pub use monitor::{Device, DeviceEvent, DeviceMonitor};
pub use task::{Pool, PoolStats, Task, TaskStatus};
pub use upload::{upload_task, UploadOptions};
