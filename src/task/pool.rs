//! Elastic worker pool.
//!
//! Workers are spawned on demand up to `max_threads`, pick tasks off a
//! FIFO, and exit after `idle_timeout` without work. Lowering
//! `max_threads` shrinks the pool: surplus workers notice on their next
//! pass and leave. One process-wide default pool is created lazily; its
//! idle workers wind down on their own, so process exit never waits on it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::{change_status, run_task, Task, TaskStatus};
use crate::config::PoolConfig;
use crate::error::{Error, Result};

struct PoolState {
    max_threads: usize,
    idle_timeout: Duration,
    /// Workers alive, including ones on their way to the queue.
    started: usize,
    /// Workers executing a task (or spawned and not yet at the queue).
    busy: usize,
    pending: VecDeque<Arc<Task>>,
    threads: HashMap<ThreadId, std::thread::JoinHandle<()>>,
    /// Cleared on shutdown; workers then leave their join handles for the
    /// shutter-downer instead of detaching themselves.
    init: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

/// Cheap-to-clone handle to one worker pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

/// Point-in-time accounting, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub started: usize,
    pub busy: usize,
    pub pending: usize,
}

impl Pool {
    pub fn new(max_threads: usize, idle_timeout: Duration) -> Pool {
        Pool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    max_threads,
                    idle_timeout,
                    started: 0,
                    busy: 0,
                    pending: VecDeque::new(),
                    threads: HashMap::new(),
                    init: true,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn with_config(config: &PoolConfig) -> Pool {
        Pool::new(
            config.max_threads,
            Duration::from_millis(config.idle_timeout_ms),
        )
    }

    /// The lazily created process-wide pool.
    pub fn default_pool() -> &'static Pool {
        static DEFAULT: OnceLock<Pool> = OnceLock::new();
        DEFAULT.get_or_init(|| Pool::with_config(&PoolConfig::default()))
    }

    pub fn max_threads(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    /// Resize the pool. Growing spawns workers for already-queued tasks;
    /// shrinking wakes everyone so surplus workers can leave.
    pub fn set_max_threads(&self, max: usize) -> Result<()> {
        let mut state = self.shared.state.lock();
        if max > state.max_threads {
            for _ in 0..state.pending.len() {
                if state.started >= max {
                    break;
                }
                if let Err(err) = spawn_worker(&mut state, &self.shared) {
                    if state.started > 0 {
                        warn!("worker spawn failed, continuing with {} workers: {err}", state.started);
                        break;
                    }
                    return Err(err);
                }
            }
        } else {
            self.shared.cond.notify_all();
        }
        state.max_threads = max;
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        self.shared.state.lock().idle_timeout
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        let mut state = self.shared.state.lock();
        state.idle_timeout = timeout;
        self.shared.cond.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            started: state.started,
            busy: state.busy,
            pending: state.pending.len(),
        }
    }

    /// Queue a task, spawning a worker when everyone alive is busy and the
    /// thread budget allows it. A failed spawn is recoverable while other
    /// workers exist — they will get to the task eventually.
    pub(crate) fn enqueue(&self, task: Arc<Task>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.init {
            return Err(Error::Busy("Pool is shut down".into()));
        }

        if state.busy == state.started && state.started < state.max_threads {
            if let Err(err) = spawn_worker(&mut state, &self.shared) {
                if state.started == 0 {
                    return Err(err);
                }
                warn!("worker spawn failed, queueing on existing workers: {err}");
            }
        }

        state.pending.push_back(task.clone());
        self.shared.cond.notify_one();
        change_status(&task, TaskStatus::Pending);
        Ok(())
    }

    /// Fast-path helper: pull a still-queued task back off the pool.
    ///
    /// Everything happens under the pool lock; if a worker already popped
    /// the task it is left alone (its status never returns to `Ready`) and
    /// the caller falls back to waiting.
    pub(crate) fn cancel_pending(&self, task: &Arc<Task>) {
        let mut state = self.shared.state.lock();
        let mut task_state = task.state.lock();
        if task_state.status != TaskStatus::Pending {
            return;
        }
        let before = state.pending.len();
        state.pending.retain(|t| !Arc::ptr_eq(t, task));
        if state.pending.len() < before {
            task_state.status = TaskStatus::Ready;
        }
    }

    /// Drain the queue, dismiss all workers, and join them.
    pub fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.pending.clear();
            state.max_threads = 0;
            state.init = false;
            self.shared.cond.notify_all();
            state.threads.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Spawn one worker. Called with the pool lock held; the worker starts
/// with `busy` already counting it so the caller's "everyone is busy"
/// check stays accurate until it reaches the queue.
fn spawn_worker(state: &mut PoolState, shared: &Arc<PoolShared>) -> Result<()> {
    let shared = shared.clone();
    let handle = std::thread::Builder::new()
        .name("boardclaw-worker".into())
        .spawn(move || worker_loop(&shared))
        .map_err(|e| Error::Io(format!("Failed to spawn worker thread: {e}")))?;
    state.threads.insert(handle.thread().id(), handle);
    state.started += 1;
    state.busy += 1;
    Ok(())
}

fn worker_loop(shared: &Arc<PoolShared>) {
    loop {
        let mut state = shared.state.lock();
        state.busy -= 1;

        let mut can_wait = true;
        let deadline = Instant::now() + state.idle_timeout;
        let task = loop {
            if state.started > state.max_threads {
                // Pool is shrinking; leave regardless of pending work.
                break None;
            }
            if let Some(task) = state.pending.pop_front() {
                break Some(task);
            }
            if !can_wait {
                break None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // One more queue check after the timeout, then leave.
                can_wait = false;
                continue;
            }
            can_wait = !shared.cond.wait_for(&mut state, remaining).timed_out();
        };

        match task {
            Some(task) => {
                state.busy += 1;
                drop(state);
                run_task(&task);
            }
            None => {
                state.started -= 1;
                if state.init {
                    // Detach: drop our own join handle.
                    state.threads.remove(&std::thread::current().id());
                }
                return;
            }
        }
    }
}
