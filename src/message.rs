//! Message bus — process-wide fan-out of log, status, and progress messages.
//!
//! Emission is synchronous on the emitter's thread; subscribers are expected
//! to be fast and to marshal onto their own thread if they need to (the CLI
//! prints directly, a GUI would queue onto its UI loop). When nobody is
//! subscribed, log messages fall through to `tracing` so nothing is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::task::{Task, TaskStatus};

/// Severity of a [`Message::Log`] entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A message emitted by the core subsystems.
#[derive(Clone)]
pub enum Message {
    /// Human-readable diagnostic line.
    Log { level: LogLevel, text: String },
    /// A task changed status.
    Status { task: Arc<Task>, status: TaskStatus },
    /// Progress of a long-running operation, `value` out of `max`.
    Progress {
        task: Arc<Task>,
        action: String,
        value: u64,
        max: u64,
    },
}

type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Fan-out bus. One process-wide instance lives behind [`bus()`].
pub struct MessageBus {
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_id: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to every message. Returns a handle for [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, listener: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener by its handle. Unknown handles are ignored.
    pub fn unsubscribe(&self, id: u64) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver a message to every listener, in subscription order.
    pub fn emit(&self, message: &Message) {
        let listeners = self.listeners.read();
        if listeners.is_empty() {
            if let Message::Log { level, text } = message {
                match level {
                    LogLevel::Debug => tracing::debug!("{text}"),
                    LogLevel::Info => tracing::info!("{text}"),
                    LogLevel::Warning => tracing::warn!("{text}"),
                    LogLevel::Error => tracing::error!("{text}"),
                }
            }
            return;
        }
        for (_, listener) in listeners.iter() {
            listener(message);
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

static BUS: OnceLock<MessageBus> = OnceLock::new();

/// The process-wide message bus.
pub fn bus() -> &'static MessageBus {
    BUS.get_or_init(MessageBus::new)
}

/// Emit a log line through the bus.
pub fn log(level: LogLevel, text: impl Into<String>) {
    bus().emit(&Message::Log {
        level,
        text: text.into(),
    });
}

/// Emit a progress update for `task`.
pub fn progress(task: &Arc<Task>, action: &str, value: u64, max: u64) {
    bus().emit(&Message::Progress {
        task: task.clone(),
        action: action.to_string(),
        value,
        max,
    });
}

pub(crate) fn status(task: &Arc<Task>, status: TaskStatus) {
    bus().emit(&Message::Status {
        task: task.clone(),
        status,
    });
}
