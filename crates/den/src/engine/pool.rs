//! Worker thread pool partitioned by task category.
//!
//! Each [`TaskKind`] owns a fixed set of threads fed by one channel. Posting
//! returns a [`TaskHandle`]; callers that need a result block on
//! [`TaskHandle::wait`]. A panic inside a task is caught and reported through
//! the handle instead of killing the worker.

use crate::config::PoolConfig;
use crate::error::{DenError, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Task category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Query fan-out and other short computations.
    General,
    /// Drains, flushes and compaction.
    DiskIo,
}

impl TaskKind {
    fn label(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::DiskIo => "disk-io",
        }
    }
}

/// Handle to the result of a posted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes.
    ///
    /// # Errors
    ///
    /// Returns `DenError::TaskPanicked` if the task panicked, or
    /// `DenError::PoolStopped` if it was discarded unrun.
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DenError::TaskPanicked),
            Err(_) => Err(DenError::PoolStopped),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Pending {
    fn start(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

struct Lane {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Lane {
    fn spawn(kind: TaskKind, threads: usize) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("den-{}-{}", kind.label(), i))
                .spawn(move || loop {
                    let job = rx.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    fn stop(&self) {
        self.sender.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("Worker thread exited by panic");
            }
        }
    }
}

/// Fixed-size pool with one lane per [`TaskKind`].
pub struct WorkerPool {
    general: Lane,
    disk_io: Lane,
    pending: Arc<Pending>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active_works", &self.active_works())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Starts the worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        let pool = Self {
            general: Lane::spawn(TaskKind::General, config.general_threads)?,
            disk_io: Lane::spawn(TaskKind::DiskIo, config.disk_io_threads)?,
            pending: Arc::new(Pending::default()),
        };
        debug!(
            "Started worker pool ({} general, {} disk-io threads)",
            config.general_threads, config.disk_io_threads
        );
        Ok(pool)
    }

    fn lane(&self, kind: TaskKind) -> &Lane {
        match kind {
            TaskKind::General => &self.general,
            TaskKind::DiskIo => &self.disk_io,
        }
    }

    /// Queues `f` on a thread of category `kind`.
    ///
    /// # Errors
    ///
    /// Returns `DenError::PoolStopped` after [`stop`](Self::stop).
    pub fn post<T, F>(&self, kind: TaskKind, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let pending = Arc::clone(&self.pending);
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(f));
            if result.is_err() {
                error!("Task panicked");
            }
            let _ = tx.send(result);
            pending.finish();
        });

        self.pending.start();
        let sent = match self.lane(kind).sender.lock().as_ref() {
            Some(sender) => sender.send(job).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.finish();
            return Err(DenError::PoolStopped);
        }
        Ok(TaskHandle { rx })
    }

    /// Number of queued or running tasks.
    pub fn active_works(&self) -> usize {
        *self.pending.count.lock()
    }

    /// Blocks until no task is queued or running.
    ///
    /// Must not be called from a pool thread.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock();
        while *count > 0 {
            self.pending.idle.wait(&mut count);
        }
    }

    /// Lets queued tasks finish, then joins every worker.
    pub fn stop(&self) {
        self.general.stop();
        self.disk_io.stop();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
