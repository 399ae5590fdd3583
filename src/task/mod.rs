//! Task runtime — shareable task objects with a monotonic status lifecycle,
//! executed on a worker pool or inline in the waiting thread.
//!
//! A task moves `Ready → Pending → Running → Finished`, never backwards.
//! Waiters block on the task's condvar until the status they asked for is
//! reached; every transition is also published on the message bus so UIs
//! can follow along. The thread running a task is recorded in a
//! thread-local so log output can be attributed to it.

pub mod pool;

use std::any::Any;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::message;
pub use pool::{Pool, PoolStats};

/// Lifecycle stage of a task. Ordered; transitions only ever go up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus {
    /// Created, not yet handed to a pool.
    Ready,
    /// Queued on a pool, waiting for a worker.
    Pending,
    /// Executing.
    Running,
    /// Done; the return value is available.
    Finished,
}

type RunFn = Box<dyn FnOnce() -> Result<()> + Send>;
type FinalizeFn = Box<dyn FnOnce() + Send>;

struct TaskState {
    status: TaskStatus,
    run: Option<RunFn>,
    finalize: Option<FinalizeFn>,
    result: Option<Box<dyn Any + Send>>,
    ret: Option<Result<()>>,
    pool: Option<Pool>,
}

/// A unit of work. Cheap to share; waiters and workers all hold `Arc`s.
pub struct Task {
    name: String,
    state: Mutex<TaskState>,
    cond: Condvar,
}

thread_local! {
    /// Stack of tasks running on this thread, innermost last.
    static CURRENT_TASK: RefCell<Vec<Arc<Task>>> = const { RefCell::new(Vec::new()) };
}

impl Task {
    pub fn new(name: impl Into<String>, run: impl FnOnce() -> Result<()> + Send + 'static) -> Arc<Task> {
        Arc::new(Task {
            name: name.into(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Ready,
                run: Some(Box::new(run)),
                finalize: None,
                result: None,
                ret: None,
                pool: None,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// Attach a hook that runs exactly once when the task ends, whichever
    /// path it takes — normal completion or being dropped unrun.
    pub fn set_finalize(&self, f: impl FnOnce() + Send + 'static) {
        self.state.lock().finalize = Some(Box::new(f));
    }

    /// Store an opaque result for the waiter to pick up.
    pub fn set_result(&self, value: Box<dyn Any + Send>) {
        self.state.lock().result = Some(value);
    }

    /// Take the stored result, if any.
    pub fn take_result(&self) -> Option<Box<dyn Any + Send>> {
        self.state.lock().result.take()
    }

    /// The task currently running on this thread, if any.
    pub fn current() -> Option<Arc<Task>> {
        CURRENT_TASK.with(|stack| stack.borrow().last().cloned())
    }

    /// Queue the task for execution. Without an explicit pool the lazily
    /// created process-wide pool is used.
    pub fn start(self: &Arc<Self>, pool: Option<&Pool>) -> Result<()> {
        let pool = {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Ready {
                return Err(Error::Busy(format!("Task '{}' was already started", self.name)));
            }
            if state.pool.is_none() {
                state.pool = Some(pool.cloned().unwrap_or_else(|| Pool::default_pool().clone()));
            }
            state.pool.clone().unwrap()
        };
        pool.enqueue(self.clone())
    }

    /// Wait until the task reaches `target` or `timeout` elapses.
    ///
    /// Waiting for `Finished` without a timeout takes the in-caller fast
    /// path: if the task is still queued it is pulled back off the pool
    /// (re-checking under the pool lock — a worker may have grabbed it in
    /// the meantime) and run inline on this thread, saving a wakeup for
    /// the common submit-then-join pattern. Waiting for a later status on
    /// a task that was never started starts it first.
    pub fn wait(self: &Arc<Self>, target: TaskStatus, timeout: Option<Duration>) -> Result<bool> {
        if target == TaskStatus::Ready {
            return Err(Error::Param("Cannot wait for the ready status".into()));
        }

        if target == TaskStatus::Finished && timeout.is_none() {
            let pool = self.state.lock().pool.clone();
            if self.status() == TaskStatus::Pending {
                if let Some(pool) = pool {
                    pool.cancel_pending(self);
                }
            }
            if self.status() == TaskStatus::Ready {
                run_task(self);
                return Ok(true);
            }
        } else if self.status() == TaskStatus::Ready {
            self.start(None)?;
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.status < target {
            match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    if self.cond.wait_for(&mut state, remaining).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
        Ok(state.status >= target)
    }

    /// Wait for completion and return the task's outcome.
    pub fn join(self: &Arc<Self>) -> Result<()> {
        self.wait(TaskStatus::Finished, None)?;
        self.state.lock().ret.clone().unwrap_or(Ok(()))
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // A task dropped without running still owes its finalize hook.
        let finalize = self.state.get_mut().finalize.take();
        if let Some(f) = finalize {
            f();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Publish a status transition: condvar first so waiters wake, then the
/// message bus.
pub(crate) fn change_status(task: &Arc<Task>, status: TaskStatus) {
    {
        let mut state = task.state.lock();
        state.status = status;
        task.cond.notify_all();
    }
    message::status(task, status);
}

/// Execute a task on the current thread. Callers guarantee the task is
/// `Ready` or was exclusively claimed from a pool queue.
pub(crate) fn run_task(task: &Arc<Task>) {
    debug_assert!(task.status() <= TaskStatus::Pending);

    CURRENT_TASK.with(|stack| stack.borrow_mut().push(task.clone()));
    change_status(task, TaskStatus::Running);

    let run = task.state.lock().run.take();
    let ret = run.map_or(Ok(()), |f| f());
    task.state.lock().ret = Some(ret);

    // Cleared before the finished broadcast so it cannot run twice.
    let finalize = task.state.lock().finalize.take();
    if let Some(f) = finalize {
        f();
    }

    change_status(task, TaskStatus::Finished);
    CURRENT_TASK.with(|stack| {
        stack.borrow_mut().pop();
    });
}
