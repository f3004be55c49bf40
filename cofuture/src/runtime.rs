//! The event loop that drives next-tick jobs, async I/O and coroutines.
//!
//! The loop itself is synchronous: it drains the next-tick queue, running each
//! job to completion (which may start or resume coroutines), and only parks on
//! the embedded current-thread tokio runtime when the queue is empty but async
//! operations are still in flight. Timers and other async I/O therefore only
//! make progress while the loop is idle, and never concurrently with a
//! coroutine.

use crate::coro::{self, Canceller, Coroutine, CoroutineId};
use crate::leak::LeakRegistry;
use crate::{Config, Error, Future, Result};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

/// A unit of work run by the event loop
pub(crate) type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

thread_local! {
    static CONTEXT: RefCell<Option<Handle>> = const { RefCell::new(None) };
}

/// Owns the event loop
pub struct Runtime {
    handle: Handle,
    driver: tokio::runtime::Runtime,
}

/// A cloneable handle to a [Runtime], usable from any thread
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    inflight: AtomicUsize,
    wake: Notify,
    registry: Mutex<LeakRegistry>,
    coroutines: Mutex<HashMap<CoroutineId, Canceller>>,
    config: Config,
    driver: tokio::runtime::Handle,
}

/// Keeps the event loop alive while an operation is outstanding
pub(crate) struct Hold {
    shared: Arc<Shared>,
}

/// Tears down a coroutine's bookkeeping when its body returns or unwinds
struct Teardown<'a> {
    handle: &'a Handle,
}

/// Restores the previous runtime context when dropped
pub struct EnterGuard {
    prev: Option<Handle>,
}

impl Runtime {
    /// Create a new runtime with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let driver = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = Handle {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                inflight: AtomicUsize::new(0),
                wake: Notify::new(),
                registry: Mutex::new(LeakRegistry::default()),
                coroutines: Mutex::new(HashMap::new()),
                config,
                driver: driver.handle().clone(),
            }),
        };
        Ok(Self { handle, driver })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `body` as a task in a fresh coroutine, and drive the event loop
    /// until it is idle.
    pub fn block_on<T, F>(&self, body: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let main = {
            let _ctx = self.handle.enter();
            self.handle.task(body)
        };
        self.run()?;
        if !main.is_resolved() {
            return Err(Error::Stalled);
        }
        main.get()
    }

    /// Drive the event loop until no job, async operation or resolver is
    /// outstanding.
    ///
    /// An error raised outside the normal call chain (a failing settle
    /// callback, or a detached future that failed) aborts the loop and is
    /// returned here. Jobs still queued can be run by calling `run` again.
    pub fn run(&self) -> Result<()> {
        let _ctx = self.handle.enter();
        loop {
            while let Some(job) = self.handle.pop() {
                if let Err(e) = job() {
                    error!("Uncaught error in event loop - {}", e);
                    return Err(e);
                }
            }
            if self.handle.shared.inflight.load(Ordering::SeqCst) == 0 {
                debug!("event loop idle");
                return Ok(());
            }
            self.driver.block_on(self.handle.shared.wake.notified());
        }
    }
}

impl Handle {
    /// Handle to runtime of current context.
    ///
    /// # Panics
    ///
    /// Panics if called outside of the event loop thread or a runtime
    /// coroutine.
    pub fn current() -> Handle {
        match Handle::try_current() {
            Some(handle) => handle,
            None => panic!("must be called from the context of a cofuture runtime"),
        }
    }

    pub fn try_current() -> Option<Handle> {
        CONTEXT.with(|c| c.borrow().clone())
    }

    /// Make this runtime the current context until the guard is dropped
    pub fn enter(&self) -> EnterGuard {
        let prev = CONTEXT.with(|c| c.borrow_mut().replace(self.clone()));
        EnterGuard { prev }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Schedule a job to run on the next tick of the event loop.
    /// Safe to call from any thread.
    pub fn next_tick<F>(&self, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.queue().push_back(Box::new(job));
        self.shared.wake.notify_one();
    }

    /// Drive an async operation on the runtime's tokio driver, and settle the
    /// returned future with its outcome
    #[track_caller]
    pub fn spawn<T, F>(&self, op: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let future = Future::new();
        let resolver = future.resolver_on(self.clone());
        self.shared.driver.spawn(async move {
            resolver.resolve(op.await);
        });
        future
    }

    /// Create a coroutine bound to this runtime. Leak bookkeeping for the
    /// coroutine is torn down once its body completes, panics or is unwound.
    ///
    /// Coroutines still suspended when the [Runtime] is dropped are unwound.
    pub fn spawn_coroutine<F>(&self, body: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let config = self.config();
        let mut builder = coro::Builder::new().name(config.thread_name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        let handle = self.clone();
        let co = builder.create(move || {
            let _ctx = handle.enter();
            let _teardown = Teardown { handle: &handle };
            body();
        });
        self.coroutines().insert(co.id(), co.canceller());
        co
    }

    /// Raise error outside of normal call chain, on the next tick
    pub(crate) fn raise(&self, err: Error) {
        self.next_tick(move || Err(err));
    }

    pub(crate) fn hold(&self) -> Hold {
        self.shared.inflight.fetch_add(1, Ordering::SeqCst);
        Hold {
            shared: Arc::clone(&self.shared),
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, LeakRegistry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self, id: CoroutineId) {
        self.coroutines().remove(&id);
        let leftover = self.registry().teardown(id);
        if let Some(report) = leftover {
            warn!("{} finished with {}", id, report);
        }
    }

    fn coroutines(&self) -> MutexGuard<'_, HashMap<CoroutineId, Canceller>> {
        self.shared
            .coroutines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Job> {
        self.queue().pop_front()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Re-raise an error that has no caller to return to. Outside of a runtime
/// the error can only be logged.
pub(crate) fn report_uncaught(err: Error) {
    match Handle::try_current() {
        Some(handle) => handle.raise(err),
        None => error!("Uncaught error outside of runtime - {}", err),
    }
}

impl Drop for Hold {
    fn drop(&mut self) {
        self.shared.inflight.fetch_sub(1, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if let Some(id) = coro::current_id() {
            self.handle.teardown(id);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let suspended: Vec<Canceller> = self.handle.coroutines().drain().map(|(_, c)| c).collect();
        if !suspended.is_empty() {
            debug!("unwinding {} unfinished coroutines", suspended.len());
        }
        for co in suspended {
            co.cancel();
        }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CONTEXT.with(|c| *c.borrow_mut() = prev);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("queued", &self.queue().len())
            .field("inflight", &self.shared.inflight.load(Ordering::SeqCst))
            .finish()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle)
            .finish()
    }
}
