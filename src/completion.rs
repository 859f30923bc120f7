//! Completion dispatch.
//!
//! A `CompletionPort` is a pool of worker threads that runs I/O completions
//! and event notifications off the caller's thread. Streams do not register
//! a global callback; each binds itself to a port and submits a plain
//! completion routine together with an owned per-operation context.
//!
//! A completion may block on the device for as long as its timeout allows,
//! so the pool never lets queued work wait behind busy workers: when every
//! worker is occupied a new one is started, and workers above the configured
//! minimum retire after sitting idle.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default number of resident worker threads.
pub const DEFAULT_WORKERS: usize = 2;

/// How long a worker above the resident count waits for work before exiting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PortInner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
    name: String,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Resident workers; the pool never shrinks below this.
    min_workers: usize,
    /// Live workers. Changed only while holding `queue`.
    live: AtomicUsize,
    /// Workers running a job.
    busy: AtomicUsize,
    next_id: AtomicUsize,
    idle_timeout: Duration,
}

/// Worker pool delivering completions.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct CompletionPort {
    inner: Arc<PortInner>,
}

impl CompletionPort {
    /// Start a pool with `workers` resident threads (at least one).
    pub fn new(workers: usize) -> std::io::Result<Self> {
        Self::named("serial-completion", workers)
    }

    /// Start a pool whose threads are named `<prefix>-<n>`.
    pub fn named(prefix: &str, workers: usize) -> std::io::Result<Self> {
        Self::start(prefix, workers, IDLE_TIMEOUT)
    }

    fn start(prefix: &str, workers: usize, idle_timeout: Duration) -> std::io::Result<Self> {
        let count = workers.max(1);
        let inner = Arc::new(PortInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            name: prefix.to_string(),
            workers: Mutex::new(Vec::with_capacity(count)),
            min_workers: count,
            live: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            idle_timeout,
        });

        {
            let _queue = inner.queue.lock();
            for _ in 0..count {
                if let Err(err) = spawn_worker(&inner) {
                    inner.shutdown.store(true, Ordering::Release);
                    inner.available.notify_all();
                    return Err(err);
                }
            }
        }

        debug!(pool = %prefix, workers = count, "completion port started");
        Ok(Self { inner })
    }

    /// Queue a job. Fails (returning the job) once the port is shut down.
    ///
    /// Starts another worker when every live worker is busy.
    pub fn execute<F>(&self, job: F) -> Result<(), F>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.inner.queue.lock();
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(job);
        }
        queue.push_back(Box::new(job));

        let live = self.inner.live.load(Ordering::Acquire);
        let idle = live.saturating_sub(self.inner.busy.load(Ordering::Acquire));
        if queue.len() > idle {
            if let Err(err) = spawn_worker(&self.inner) {
                warn!(pool = %self.inner.name, error = %err, "could not grow completion port");
            }
        }
        drop(queue);
        self.inner.available.notify_one();
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Number of queued jobs not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Stop accepting jobs and let the workers drain the queue and exit.
    ///
    /// Returns without joining when called from one of the port's own workers.
    pub fn shutdown(&self) {
        {
            let _queue = self.inner.queue.lock();
            if self.inner.shutdown.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.inner.available.notify_all();

        let handles = std::mem::take(&mut *self.inner.workers.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.inner.name, "completion worker panicked");
            }
        }
        debug!(pool = %self.inner.name, "completion port stopped");
    }

    /// Bind a stream to this port.
    pub fn bind(&self) -> IoBinding {
        IoBinding {
            port: self.clone(),
            active: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Start one worker. Must be called with `inner.queue` held.
fn spawn_worker(inner: &Arc<PortInner>) -> std::io::Result<()> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let worker = Arc::clone(inner);
    let handle = thread::Builder::new()
        .name(format!("{}-{id}", inner.name))
        .spawn(move || worker_loop(&worker))?;
    inner.live.fetch_add(1, Ordering::AcqRel);

    let mut workers = inner.workers.lock();
    workers.retain(|handle| !handle.is_finished());
    workers.push(handle);
    trace!(pool = %inner.name, worker = id, "completion worker started");
    Ok(())
}

fn worker_loop(inner: &PortInner) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    inner.busy.fetch_add(1, Ordering::AcqRel);
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    inner.live.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                if inner.live.load(Ordering::Acquire) > inner.min_workers {
                    let timed_out = inner
                        .available
                        .wait_for(&mut queue, inner.idle_timeout)
                        .timed_out();
                    if timed_out
                        && queue.is_empty()
                        && inner.live.load(Ordering::Acquire) > inner.min_workers
                    {
                        inner.live.fetch_sub(1, Ordering::AcqRel);
                        trace!(pool = %inner.name, "idle completion worker retired");
                        return;
                    }
                } else {
                    inner.available.wait(&mut queue);
                }
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(pool = %inner.name, "completion job panicked");
        }
        inner.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPort")
            .field("name", &self.inner.name)
            .field("workers", &self.workers())
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// A stream's registration with a completion port.
///
/// Completions are delivered by calling a stateless routine with the context
/// handed over at submission. Whoever holds the context owns it: the routine
/// once the submission is accepted, the submitter if it is rejected.
#[derive(Clone)]
pub struct IoBinding {
    port: CompletionPort,
    active: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl IoBinding {
    /// Schedule `routine(context)` on the port.
    ///
    /// On rejection the context is handed back so the caller can complete
    /// the operation itself.
    pub fn submit<C>(&self, context: C, routine: fn(C)) -> Result<(), C>
    where
        C: Send + 'static,
    {
        if !self.active.load(Ordering::Acquire) {
            return Err(context);
        }

        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::AcqRel);
        let slot = Arc::new(Mutex::new(Some(context)));
        let job_slot = Arc::clone(&slot);
        let accepted = self.port.execute(move || {
            if let Some(context) = job_slot.lock().take() {
                routine(context);
            }
            in_flight.fetch_sub(1, Ordering::AcqRel);
        });

        match accepted {
            Ok(()) => Ok(()),
            Err(_job) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                match slot.lock().take() {
                    Some(context) => Err(context),
                    None => Ok(()),
                }
            }
        }
    }

    /// Queue a notification job on the port.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.active.load(Ordering::Acquire) && self.port.execute(job).is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Completions submitted but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stop accepting new submissions. Already queued completions still run.
    pub fn release(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn port(&self) -> &CompletionPort {
        &self.port
    }
}

impl fmt::Debug for IoBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBinding")
            .field("active", &self.is_active())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
