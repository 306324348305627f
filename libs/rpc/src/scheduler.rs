//! Scheduler and IO Thread Pool
//!
//! The IO thread pool is a small multi-threaded tokio runtime shared by every
//! delayed task that does not need to run on a reactor. [`Scheduler`] arms
//! one-shot timers on it and makes each of them cancellable by id.
//!
//! Every armed task reaches exactly one outcome: its callback receives `Ok(())`
//! when the delay elapses, or an `Aborted` error when it is cancelled or the
//! scheduler shuts down first.

use crate::{Result, RpcError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace};

/// Identifier of a cancellable delayed task
pub type ScheduledTaskId = u64;

/// Callback of a delayed task; `Err` means the task was aborted
pub type TaskCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

const POOL_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Threads backing the scheduler
pub struct IoThreadPool {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
}

impl IoThreadPool {
    pub fn new(name: &str, num_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_threads.max(1))
            .thread_name(format!("{}_iotp", name))
            .enable_all()
            .build()?;

        debug!(pool = name, threads = num_threads, "IO thread pool started");
        Ok(Self {
            name: name.to_string(),
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Stop the pool and wait for its threads.
    ///
    /// From inside any tokio context the threads are released without waiting,
    /// since blocking there is not allowed.
    pub fn join(&self) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(POOL_JOIN_TIMEOUT);
        }
        debug!(pool = %self.name, "IO thread pool joined");
    }
}

impl Drop for IoThreadPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

struct PendingTimer {
    callback: TaskCallback,
    timer: Option<AbortHandle>,
}

struct SchedulerInner {
    name: String,
    handle: Handle,
    next_id: AtomicU64,
    closing: AtomicBool,
    tasks: Mutex<HashMap<ScheduledTaskId, PendingTimer>>,
}

impl SchedulerInner {
    /// Whoever removes the entry owns the callback
    fn take(&self, id: ScheduledTaskId) -> Option<PendingTimer> {
        self.tasks.lock().remove(&id)
    }

    fn fire(&self, id: ScheduledTaskId) {
        if let Some(task) = self.take(id) {
            trace!(scheduler = %self.name, task_id = id, "Delayed task fired");
            (task.callback)(Ok(()));
        }
    }
}

/// One-shot timer facility on the IO thread pool
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                name: name.into(),
                handle,
                next_id: AtomicU64::new(1),
                closing: AtomicBool::new(false),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run `callback` after `delay`.
    ///
    /// After shutdown the callback is aborted immediately on the calling thread.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> ScheduledTaskId
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut tasks = self.inner.tasks.lock();
            if !self.inner.closing.load(Ordering::Acquire) {
                tasks.insert(
                    id,
                    PendingTimer {
                        callback: Box::new(callback),
                        timer: None,
                    },
                );
            } else {
                drop(tasks);
                callback(Err(RpcError::aborted("Scheduler is shut down")));
                return id;
            }
        }

        let inner = Arc::clone(&self.inner);
        let timer = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(id);
        });

        if let Some(task) = self.inner.tasks.lock().get_mut(&id) {
            task.timer = Some(timer.abort_handle());
        }

        trace!(
            scheduler = %self.inner.name,
            task_id = id,
            delay_ms = delay.as_millis() as u64,
            "Delayed task scheduled"
        );
        id
    }

    /// Cancel a pending task; returns false if it already fired or is unknown
    pub fn abort(&self, id: ScheduledTaskId) -> bool {
        let Some(task) = self.inner.take(id) else {
            return false;
        };
        if let Some(timer) = task.timer {
            timer.abort();
        }
        (task.callback)(Err(RpcError::aborted(format!("Task {} aborted", id))));
        true
    }

    /// Stop accepting timers and abort every pending one
    pub fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let pending: Vec<_> = self.inner.tasks.lock().drain().collect();
        info!(
            scheduler = %self.inner.name,
            pending = pending.len(),
            "Scheduler shutting down"
        );

        for (_, task) in pending {
            if let Some(timer) = task.timer {
                timer.abort();
            }
            (task.callback)(Err(RpcError::aborted("Scheduler is shutting down")));
        }
    }

    pub fn num_pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }
}
