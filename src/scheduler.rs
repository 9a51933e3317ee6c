//! Parallel job scheduler.
//!
//! Every [`Context`] submits engines to one process-wide pool of worker
//! threads. Jobs leave the shared queue in submission order across all
//! contexts; results come back to their own context in completion order.
//!
//! The pool grows to the largest worker count any live context asked for
//! and is torn down when the last context goes away. A pool with zero
//! workers runs every job on the submitting thread inside
//! [`Context::submit`].
//!
//! # Example
//!
//! ```no_run
//! use fingersum::{Actions, Context, Engine, MemorySource};
//!
//! # fn main() -> fingersum::Result<()> {
//! let context = Context::new(4)?;
//! for (index, samples) in [vec![0i16; 1176], vec![1i16; 1176]].into_iter().enumerate() {
//!     let engine = Engine::new(MemorySource::new(samples, 2))?;
//!     context.submit(engine, index, Actions::CHECKSUM)?;
//! }
//! while let Ok(job) = context.retrieve() {
//!     let sums = job.engine().finalize_checksums(0, None, None)?;
//!     println!("track {}: {:08x}", job.tag(), sums.v1);
//! }
//! context.destroy();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use crate::{
    engine::Engine,
    error::{Error, Result},
    types::Actions,
};

/// Shared pool, alive while any context holds it
static POOL: Mutex<Weak<Pool>> = Mutex::new(Weak::new());

/// Source of context identifiers
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

fn poisoned<G>(_: PoisonError<G>) -> Error {
    Error::Poisoned
}

/// Queued work tagged with the context that submitted it.
struct Pending {
    owner: u64,
    task: Box<dyn FnOnce() + Send>,
}

struct PoolState {
    queue: VecDeque<Pending>,
    shutdown: bool,
    workers: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(poisoned)
    }

    /// Lock with poison recovery, for workers and teardown.
    #[inline]
    fn lock_or_recover(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Pool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Get the shared pool, creating it or growing it to `workers` threads.
    fn acquire(workers: usize) -> Result<Arc<Pool>> {
        let mut registry = POOL.lock().map_err(poisoned)?;
        let pool = match registry.upgrade() {
            Some(pool) => pool,
            None => {
                let pool = Arc::new(Pool {
                    shared: Arc::new(Shared {
                        state: Mutex::new(PoolState {
                            queue: VecDeque::new(),
                            shutdown: false,
                            workers: 0,
                        }),
                        available: Condvar::new(),
                    }),
                    threads: Mutex::new(Vec::new()),
                });
                *registry = Arc::downgrade(&pool);
                debug!("created worker pool");
                pool
            }
        };
        pool.grow(workers)?;
        Ok(pool)
    }

    fn grow(&self, workers: usize) -> Result<()> {
        let mut threads = self.threads.lock().map_err(poisoned)?;
        while threads.len() < workers {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("fingersum-worker-{}", threads.len()))
                .spawn(move || worker_loop(&shared))?;
            threads.push(handle);
            self.shared.lock()?.workers = threads.len();
        }
        trace!(workers = threads.len(), "pool size");
        Ok(())
    }

    fn workers(&self) -> Result<usize> {
        Ok(self.shared.lock()?.workers)
    }

    fn push(&self, pending: Pending) -> Result<()> {
        self.shared.lock()?.queue.push_back(pending);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Remove every queued job of one context and return how many there were.
    fn cancel(&self, owner: u64) -> usize {
        let removed: VecDeque<Pending> = {
            let mut state = self.shared.lock_or_recover();
            let (removed, kept) = std::mem::take(&mut state.queue)
                .into_iter()
                .partition(|p| p.owner == owner);
            state.queue = kept;
            removed
        };
        // Engines are dropped outside the lock
        removed.len()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.lock_or_recover().shutdown = true;
        self.shared.available.notify_all();

        let threads = std::mem::take(
            self.threads
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        debug!("worker pool shut down");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let pending = {
            let mut state = shared.lock_or_recover();
            loop {
                if state.shutdown {
                    return;
                }
                // Another context may have drained the queue since the wakeup
                if let Some(pending) = state.queue.pop_front() {
                    break pending;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        trace!(context = pending.owner, "running job");
        (pending.task)();
    }
}

/// An engine travelling through the scheduler.
pub struct Job<T> {
    engine: Engine,
    tag: T,
    actions: Actions,
    status: Actions,
}

impl<T: fmt::Debug> fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("tag", &self.tag)
            .field("actions", &self.actions)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<T> Job<T> {
    fn new(engine: Engine, tag: T, actions: Actions) -> Self {
        Self {
            engine,
            tag,
            actions,
            status: Actions::empty(),
        }
    }

    /// Run the requested actions, checksum first.
    fn run(&mut self) {
        if self.actions.contains(Actions::CHECKSUM) {
            match self.engine.process() {
                Ok(()) => self.status |= Actions::CHECKSUM,
                Err(e) => warn!(error = %e, "checksum failed"),
            }
        }
        if self.actions.contains(Actions::FINGERPRINT) {
            match self.engine.fingerprint() {
                Ok(_) => self.status |= Actions::FINGERPRINT,
                Err(e) => warn!(error = %e, "fingerprint failed"),
            }
        }
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    #[inline]
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Give up the job and keep its engine.
    pub fn into_engine(self) -> Engine {
        self.engine
    }

    /// Give up the job and keep its engine and tag.
    pub fn into_parts(self) -> (Engine, T) {
        (self.engine, self.tag)
    }

    /// Caller data passed to `submit`.
    #[inline]
    pub fn tag(&self) -> &T {
        &self.tag
    }

    /// Actions requested at submission.
    #[inline]
    pub fn actions(&self) -> Actions {
        self.actions
    }

    /// Actions that succeeded.
    #[inline]
    pub fn status(&self) -> Actions {
        self.status
    }

    /// Check if every requested action succeeded.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.contains(self.actions)
    }
}

struct ContextState<T> {
    results: VecDeque<Job<T>>,
    in_flight: usize,
    active: bool,
}

struct ContextInner<T> {
    id: u64,
    state: Mutex<ContextState<T>>,
    ready: Condvar,
}

impl<T> ContextInner<T> {
    fn lock(&self) -> Result<MutexGuard<'_, ContextState<T>>> {
        self.state.lock().map_err(poisoned)
    }

    #[inline]
    fn lock_or_recover(&self) -> MutexGuard<'_, ContextState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand back a finished job, or account for one lost to a panic.
    fn complete(&self, job: Option<Job<T>>) {
        let mut state = self.lock_or_recover();
        match job {
            Some(job) => state.results.push_back(job),
            None => state.in_flight -= 1,
        }
        drop(state);
        self.ready.notify_all();
    }
}

/// Run a job, catching a panic from the engine or its source.
fn run_guarded<T>(mut job: Job<T>, context: u64) -> Option<Job<T>> {
    match catch_unwind(AssertUnwindSafe(move || {
        job.run();
        job
    })) {
        Ok(job) => Some(job),
        Err(_) => {
            error!(context, "job panicked, result dropped");
            None
        }
    }
}

/// Submission context sharing the process-wide worker pool.
///
/// Dropping a context has the same effect as [`destroy`](Self::destroy).
pub struct Context<T: Send + 'static> {
    pool: Arc<Pool>,
    inner: Arc<ContextInner<T>>,
    destroyed: bool,
}

impl<T: Send + 'static> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Context<T> {
    /// Create a context, growing the shared pool to at least `workers`
    /// threads. The pool never shrinks while it is alive.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a worker thread cannot be spawned, or
    /// `Poisoned`.
    pub fn new(workers: usize) -> Result<Self> {
        let pool = Pool::acquire(workers)?;
        let id = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, workers, "created context");
        Ok(Self {
            pool,
            inner: Arc::new(ContextInner {
                id,
                state: Mutex::new(ContextState {
                    results: VecDeque::new(),
                    in_flight: 0,
                    active: true,
                }),
                ready: Condvar::new(),
            }),
            destroyed: false,
        })
    }

    /// Worker threads in the shared pool.
    ///
    /// # Errors
    ///
    /// Returns `Poisoned` if the pool lock was poisoned.
    pub fn workers(&self) -> Result<usize> {
        self.pool.workers()
    }

    /// Queue an engine for the given actions.
    ///
    /// With a zero-worker pool the job runs before this returns.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the context is shutting down, or `Poisoned`.
    pub fn submit(&self, engine: Engine, tag: T, actions: Actions) -> Result<()> {
        {
            let mut state = self.inner.lock()?;
            if !state.active {
                return Err(Error::Cancelled);
            }
            state.in_flight += 1;
        }

        let id = self.inner.id;
        let inner = Arc::clone(&self.inner);
        let job = Job::new(engine, tag, actions);
        let task = move || inner.complete(run_guarded(job, id));

        let workers = match self.pool.workers() {
            Ok(workers) => workers,
            Err(e) => {
                self.inner.lock_or_recover().in_flight -= 1;
                return Err(e);
            }
        };
        if workers == 0 {
            task();
            return Ok(());
        }
        if let Err(e) = self.pool.push(Pending {
            owner: id,
            task: Box::new(task),
        }) {
            self.inner.lock_or_recover().in_flight -= 1;
            return Err(e);
        }
        trace!(context = id, "queued job");
        Ok(())
    }

    /// Wait for the next finished job of this context.
    ///
    /// # Errors
    ///
    /// Returns `NoMoreResults` as soon as nothing is in flight, or
    /// `Poisoned`.
    pub fn retrieve(&self) -> Result<Job<T>> {
        let mut state = self.inner.lock()?;
        loop {
            if let Some(job) = state.results.pop_front() {
                state.in_flight -= 1;
                return Ok(job);
            }
            if state.in_flight == 0 {
                return Err(Error::NoMoreResults);
            }
            state = self.inner.ready.wait(state).map_err(poisoned)?;
        }
    }

    /// Cancel queued jobs, wait for running ones and release the context.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        let id = self.inner.id;
        self.inner.lock_or_recover().active = false;

        let cancelled = self.pool.cancel(id);
        let mut state = self.inner.lock_or_recover();
        state.in_flight -= cancelled;
        let mut drained = 0usize;
        loop {
            if state.results.pop_front().is_some() {
                state.in_flight -= 1;
                drained += 1;
                continue;
            }
            if state.in_flight == 0 {
                break;
            }
            state = self
                .inner
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(state);
        debug!(context = id, cancelled, drained, "destroyed context");
    }
}

impl<T: Send + 'static> Drop for Context<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, SampleSource};
    use serial_test::serial;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// Source that logs its name on the first read and can be held there.
    struct Probe {
        inner: MemorySource,
        name: usize,
        log: Arc<Mutex<Vec<usize>>>,
        gate: Option<mpsc::Receiver<()>>,
        started: bool,
    }

    impl Probe {
        fn engine(name: usize, log: &Arc<Mutex<Vec<usize>>>) -> Engine {
            Self::gated(name, log, None)
        }

        fn gated(
            name: usize,
            log: &Arc<Mutex<Vec<usize>>>,
            gate: Option<mpsc::Receiver<()>>,
        ) -> Engine {
            let probe = Probe {
                inner: MemorySource::new(vec![name as i16; 2000], 2),
                name,
                log: Arc::clone(log),
                gate,
                started: false,
            };
            Engine::new(probe).unwrap()
        }
    }

    impl SampleSource for Probe {
        fn channels(&self) -> u16 {
            self.inner.channels()
        }

        fn total_frames(&self) -> u64 {
            self.inner.total_frames()
        }

        fn next_block(&mut self) -> Result<Option<&[i16]>> {
            if !self.started {
                self.started = true;
                self.log.lock().unwrap().push(self.name);
                if let Some(gate) = &self.gate {
                    let _ = gate.recv();
                }
            }
            self.inner.next_block()
        }

        fn rewind(&mut self) -> Result<()> {
            self.inner.rewind()
        }
    }

    /// Source whose first read panics.
    struct Exploding;

    impl SampleSource for Exploding {
        fn channels(&self) -> u16 {
            2
        }

        fn total_frames(&self) -> u64 {
            588
        }

        fn next_block(&mut self) -> Result<Option<&[i16]>> {
            panic!("decoder blew up");
        }

        fn rewind(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn wait_for(log: &Arc<Mutex<Vec<usize>>>, name: usize) {
        while !log.lock().unwrap().contains(&name) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    #[serial]
    fn test_inline_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let context = Context::new(0).unwrap();
        assert_eq!(context.workers().unwrap(), 0);

        context.submit(Probe::engine(1, &log), "one", Actions::CHECKSUM).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1]);

        let job = context.retrieve().unwrap();
        assert_eq!(*job.tag(), "one");
        assert_eq!(job.status(), Actions::CHECKSUM);
        assert!(job.is_success());
        assert!(job.engine().is_complete());
        assert!(matches!(context.retrieve(), Err(Error::NoMoreResults)));
    }

    #[test]
    #[serial]
    fn test_fifo_dispatch_across_contexts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = mpsc::channel();
        let a = Context::new(1).unwrap();
        let b = Context::new(1).unwrap();
        assert_eq!(a.workers().unwrap(), 1);

        a.submit(Probe::gated(0, &log, Some(gate)), 0, Actions::CHECKSUM).unwrap();
        wait_for(&log, 0);
        for name in 1..=6 {
            let context = if name % 2 == 1 { &a } else { &b };
            context.submit(Probe::engine(name, &log), name, Actions::CHECKSUM).unwrap();
        }
        release.send(()).unwrap();

        let mut from_a = Vec::new();
        while let Ok(job) = a.retrieve() {
            from_a.push(*job.tag());
        }
        let mut from_b = Vec::new();
        while let Ok(job) = b.retrieve() {
            from_b.push(*job.tag());
        }

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(from_a, vec![0, 1, 3, 5]);
        assert_eq!(from_b, vec![2, 4, 6]);
    }

    #[test]
    #[serial]
    fn test_destroy_cancels_queued_jobs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = mpsc::channel();
        let holder = Context::new(1).unwrap();
        holder
            .submit(Probe::gated(100, &log, Some(gate)), 100, Actions::CHECKSUM)
            .unwrap();
        wait_for(&log, 100);

        let context = Context::new(1).unwrap();
        for name in 0..10 {
            context.submit(Probe::engine(name, &log), name, Actions::CHECKSUM).unwrap();
        }
        context.destroy();
        assert_eq!(*log.lock().unwrap(), vec![100]);

        release.send(()).unwrap();
        let job = holder.retrieve().unwrap();
        assert_eq!(*job.tag(), 100);
        assert!(matches!(holder.retrieve(), Err(Error::NoMoreResults)));
        assert_eq!(*log.lock().unwrap(), vec![100]);
    }

    #[test]
    #[serial]
    fn test_destroy_waits_for_running_job() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = mpsc::channel();
        let context = Context::new(1).unwrap();
        context
            .submit(Probe::gated(7, &log, Some(gate)), 7, Actions::CHECKSUM)
            .unwrap();
        wait_for(&log, 7);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            release.send(()).unwrap();
        });
        let started = Instant::now();
        context.destroy();
        assert!(started.elapsed() >= Duration::from_millis(150));
        releaser.join().unwrap();
    }

    #[test]
    #[serial]
    fn test_panicking_job_releases_context() {
        for workers in [0, 1] {
            let context = Context::new(workers).unwrap();
            let engine = Engine::new(Exploding).unwrap();
            context.submit(engine, workers, Actions::CHECKSUM).unwrap();
            assert!(matches!(context.retrieve(), Err(Error::NoMoreResults)));
            context.destroy();
        }
    }

    #[test]
    #[serial]
    fn test_parallel_results() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let context = Context::new(4).unwrap();
        for name in 0..8 {
            context.submit(Probe::engine(name, &log), name, Actions::CHECKSUM).unwrap();
        }
        let mut tags = Vec::new();
        while let Ok(job) = context.retrieve() {
            assert!(job.engine().is_complete());
            tags.push(*job.tag());
        }
        tags.sort_unstable();
        assert_eq!(tags, (0..8).collect::<Vec<_>>());
        assert!(matches!(context.retrieve(), Err(Error::NoMoreResults)));
    }

    #[test]
    #[serial]
    fn test_failed_action_clears_status_bit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let context = Context::new(1).unwrap();
        // No fingerprinter attached
        context
            .submit(Probe::engine(1, &log), (), Actions::CHECKSUM | Actions::FINGERPRINT)
            .unwrap();
        let job = context.retrieve().unwrap();
        assert_eq!(job.actions(), Actions::CHECKSUM | Actions::FINGERPRINT);
        assert_eq!(job.status(), Actions::CHECKSUM);
        assert!(!job.is_success());
        let (engine, ()) = job.into_parts();
        assert!(engine.is_complete());
    }

    #[test]
    #[serial]
    fn test_submit_to_inactive_context() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let context = Context::new(0).unwrap();
        context.inner.lock().unwrap().active = false;
        assert!(matches!(
            context.submit(Probe::engine(1, &log), (), Actions::CHECKSUM),
            Err(Error::Cancelled)
        ));
        assert_eq!(context.inner.lock().unwrap().in_flight, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_pool_shared_grown_and_released() {
        let a = Context::<()>::new(2).unwrap();
        let b = Context::<()>::new(3).unwrap();
        assert!(Arc::ptr_eq(&a.pool, &b.pool));
        assert_eq!(a.workers().unwrap(), 3);

        let c = Context::<()>::new(1).unwrap();
        assert_eq!(c.workers().unwrap(), 3);

        drop(a);
        b.destroy();
        assert!(POOL.lock().unwrap().upgrade().is_some());
        drop(c);
        assert!(POOL.lock().unwrap().upgrade().is_none());
    }
}
