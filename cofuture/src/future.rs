//! Single-assignment result container.
//!
//! A [Future] is created empty by its producer, settled exactly once with a
//! value ([Future::return_value]) or an error ([Future::throw]), and read by
//! any number of consumers. Code running inside a coroutine can block on it
//! with [Future::wait], which suspends only the calling coroutine.

use crate::coro::{Coroutine, CoroutineId};
use crate::runtime::{self, Handle};
use crate::{Error, Result, Waitable};
use serde::Serialize;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a future
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FutureId(u64);

/// Callback invoked with the outcome of a future
pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T>) -> Result<()> + Send + 'static>;

/// Deferred body of a task
pub(crate) type Body<T> = Box<dyn FnOnce() -> Result<T> + Send + 'static>;

/// Handle to a single-assignment result. Clones refer to the same cell.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    id: FutureId,
    state: Mutex<State<T>>,
    /// Deferred call, for futures created by [crate::task]
    deferred: Option<Mutex<Option<Body<T>>>>,
    tracking: Mutex<Option<Tracking>>,
}

struct State<T> {
    outcome: Option<Result<T>>,
    callbacks: Vec<Callback<T>>,
}

/// Where this future is registered for leak detection
struct Tracking {
    handle: Handle,
    coroutine: CoroutineId,
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Create a new pending future
    #[track_caller]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a future already returned with given value
    #[track_caller]
    pub fn from_result(value: T) -> Self {
        let future = Self::build(None);
        future.inner.state().outcome = Some(Ok(value));
        future
    }

    /// Create a future bound to a deferred call
    #[track_caller]
    pub(crate) fn deferred(body: Body<T>) -> Self {
        Self::build(Some(Mutex::new(Some(body))))
    }

    #[track_caller]
    fn build(deferred: Option<Mutex<Option<Body<T>>>>) -> Self {
        let future = Future {
            inner: Arc::new(Inner {
                id: FutureId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                state: Mutex::new(State {
                    outcome: None,
                    callbacks: vec![],
                }),
                deferred,
                tracking: Mutex::new(None),
            }),
        };
        future.track(Location::caller());
        future
    }

    pub fn id(&self) -> FutureId {
        self.inner.id
    }

    /// Returns whether or not this future has resolved yet
    pub fn is_resolved(&self) -> bool {
        self.inner.state().outcome.is_some()
    }

    /// Mark this future as returned. All pending callbacks are invoked
    /// immediately, in the order they were registered.
    pub fn return_value(&self, value: T) -> Result<()> {
        self.complete(Ok(value))
    }

    /// Mark this future as failed. All pending callbacks are invoked
    /// immediately, in the order they were registered.
    pub fn throw(&self, error: impl Into<Error>) -> Result<()> {
        if self.is_resolved() {
            return Err(Error::AlreadyResolved);
        }
        let error = error.into();
        if matches!(&error, Error::Failed(f) if f.is_empty()) {
            return Err(Error::InvalidError);
        }
        self.complete(Err(error))
    }

    /// Settle with either outcome
    pub(crate) fn settle_with(&self, outcome: Result<T>) -> Result<()> {
        match outcome {
            Ok(v) => self.return_value(v),
            Err(e) => self.throw(e),
        }
    }

    fn complete(&self, outcome: Result<T>) -> Result<()> {
        let callbacks = {
            let mut state = self.inner.state();
            if state.outcome.is_some() {
                return Err(Error::AlreadyResolved);
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };

        // A failing callback must not starve its siblings or fail the resolver
        for callback in callbacks {
            if let Err(e) = callback(outcome.clone()) {
                runtime::report_uncaught(e);
            }
        }
        Ok(())
    }

    /// Invoke callback with outcome of this future once it settles, or
    /// immediately if it already has.
    pub fn resolve<F>(&self, on_settle: F) -> Result<()>
    where
        F: FnOnce(Result<T>) -> Result<()> + Send + 'static,
    {
        self.deactivate();
        self.on_settle(Box::new(on_settle))
    }

    /// Two-sided form of [Future::resolve]. Errors are thrown into `sink`,
    /// values are passed to `on_value`.
    pub fn resolve_or_throw<U, F>(&self, sink: &Future<U>, on_value: F) -> Result<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<()> + Send + 'static,
    {
        let sink = sink.clone();
        self.resolve(move |outcome| match outcome {
            Ok(v) => on_value(v),
            Err(e) => sink.throw(e),
        })
    }

    /// Resolve only in the case of success
    pub fn resolve_success<F>(&self, on_value: F) -> Result<()>
    where
        F: FnOnce(T) -> Result<()> + Send + 'static,
    {
        self.resolve(move |outcome| match outcome {
            Ok(v) => on_value(v),
            Err(_) => Ok(()),
        })
    }

    /// Propagate outcome to another future
    pub fn proxy(&self, other: &Future<T>) -> Result<()> {
        let other = other.clone();
        self.resolve(move |outcome| other.settle_with(outcome))
    }

    /// Propagate only errors to other futures
    pub fn proxy_errors<U>(&self, others: &[Future<U>]) -> Result<()>
    where
        U: Clone + Send + 'static,
    {
        let others = others.to_vec();
        self.resolve(move |outcome| match outcome {
            Ok(_) => Ok(()),
            Err(e) => others.iter().try_for_each(|f| f.throw(e.clone())),
        })
    }

    /// Return the value of this future, or the error it failed with.
    ///
    /// The caller's location is appended to a failure's [crate::Fault::sites]
    /// so the path the error travelled stays visible.
    #[track_caller]
    pub fn get(&self) -> Result<T> {
        self.deactivate();
        let outcome = self.inner.state().outcome.clone();
        match outcome {
            None => Err(Error::NotResolved),
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => {
                if let Error::Failed(f) = &e {
                    f.record_site(Location::caller());
                }
                Err(e)
            }
        }
    }

    /// Block the current coroutine until this future settles, then return
    /// its value or error
    #[track_caller]
    pub fn wait(&self) -> Result<T> {
        if !self.is_resolved() {
            crate::settle(&[Waitable::from(self)])?;
        }
        self.get()
    }

    /// Re-raise failure of this future on the event loop, instead of letting
    /// it go unnoticed
    pub fn detach(&self) -> Result<()> {
        self.resolve(|outcome| outcome.map(|_| ()))
    }

    /// Type-erased handle to this future
    pub fn erase(&self) -> AnyFuture {
        AnyFuture {
            inner: Arc::new(self.clone()),
        }
    }

    /// Register callback without consuming the future
    pub(crate) fn on_settle(&self, callback: Callback<T>) -> Result<()> {
        let outcome = {
            let mut state = self.inner.state();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.callbacks.push(callback);
                    return Ok(());
                }
            }
        };
        callback(outcome)
    }

    /// Take the deferred call of a task that has not started yet, bound to
    /// settling this future. Only ever succeeds once.
    pub(crate) fn claim(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        let body = self
            .inner
            .deferred
            .as_ref()?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let future = self.clone();
        Some(Box::new(move || {
            if let Err(e) = future.settle_with(body()) {
                runtime::report_uncaught(e);
            }
        }))
    }

    /// Whether this is a task whose deferred call has not been claimed
    pub(crate) fn is_pending_task(&self) -> bool {
        self.inner.deferred.as_ref().is_some_and(|d| {
            d.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
        })
    }

    fn error(&self) -> Option<Error> {
        match &self.inner.state().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    fn track(&self, location: &'static Location<'static>) {
        let (Some(co), Some(handle)) = (Coroutine::current(), Handle::try_current()) else {
            return;
        };
        let capture = handle.config().capture_backtraces;
        handle.registry().track(co.id(), self.id(), location, capture);
        *self.inner.tracking() = Some(Tracking {
            handle,
            coroutine: co.id(),
        });
    }

    /// Stop tracking this future for leaks
    pub(crate) fn deactivate(&self) {
        let tracking = self.inner.tracking().take();
        if let Some(t) = tracking {
            t.handle.registry().untrack(t.coroutine, self.id());
        }
    }
}

impl<T> Inner<T> {
    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracking(&self) -> MutexGuard<'_, Option<Tracking>> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Future<T>
where
    T: Clone + Send + 'static,
{
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("Future")
            .field("id", &self.inner.id)
            .field("outcome", &state.outcome)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "future#{}", self.0)
    }
}

/// Operations the wait coordinator needs from a future of any value type
pub(crate) trait Settle: Send + Sync {
    fn id(&self) -> FutureId;
    fn is_resolved(&self) -> bool;
    fn error(&self) -> Option<Error>;
    fn on_settle(&self, callback: Box<dyn FnOnce() -> Result<()> + Send + 'static>)
        -> Result<()>;
    fn is_pending_task(&self) -> bool;
    fn claim(&self) -> Option<Box<dyn FnOnce() + Send + 'static>>;
    fn deactivate(&self);
}

impl<T> Settle for Future<T>
where
    T: Clone + Send + 'static,
{
    fn id(&self) -> FutureId {
        Future::id(self)
    }

    fn is_resolved(&self) -> bool {
        Future::is_resolved(self)
    }

    fn error(&self) -> Option<Error> {
        Future::error(self)
    }

    fn on_settle(
        &self,
        callback: Box<dyn FnOnce() -> Result<()> + Send + 'static>,
    ) -> Result<()> {
        Future::on_settle(self, Box::new(move |_: Result<T>| callback()))
    }

    fn is_pending_task(&self) -> bool {
        Future::is_pending_task(self)
    }

    fn claim(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        Future::claim(self)
    }

    fn deactivate(&self) {
        Future::deactivate(self)
    }
}

/// A future with its value type erased, e.g. to wait on futures of
/// different types at once
#[derive(Clone)]
pub struct AnyFuture {
    pub(crate) inner: Arc<dyn Settle>,
}

impl AnyFuture {
    pub fn id(&self) -> FutureId {
        self.inner.id()
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.is_resolved()
    }

    /// The error this future failed with, if it has failed
    pub fn error(&self) -> Option<Error> {
        self.inner.error()
    }
}

impl fmt::Debug for AnyFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyFuture")
            .field("id", &self.id())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
