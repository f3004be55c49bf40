//! Coroutines that can be driven by a caller through create / run / yield.
//!
//! Every coroutine is backed by a dedicated OS thread, so it owns a real stack
//! and may suspend from arbitrarily deep call frames. Control is passed back
//! and forth with a baton: [Coroutine::run] hands the baton to the coroutine
//! and blocks until it comes back through [yield_now] or completion. Only one
//! side of a run / yield pair executes at any instant.
//!
//! A suspended coroutine that can no longer be resumed, because its last
//! [Coroutine] handle was dropped, is unwound from its suspension point so its
//! destructors run and its thread exits.

use crate::{Error, Result};
use serde::Serialize;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Identity of a coroutine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CoroutineId(u64);

/// Result of driving a coroutine with [Coroutine::run]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Coroutine yielded, and can be resumed
    Suspended,
    /// Coroutine ran to completion
    Done,
}

/// The state of coroutine
#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Coroutine was created, and can be started.
    New,
    /// Coroutine is currently running
    Running,
    /// Coroutine is paused, and can be resumed
    Suspended,
    /// Coroutine has completed execution, and cannot be resumed
    Done,
}

/// Which side of a run / yield pair holds the baton
#[derive(Debug, Clone, Copy, PartialEq)]
enum Turn {
    Caller,
    Coroutine,
}

type Body = Box<dyn FnOnce() + Send + 'static>;

/// Unwind payload of a cancelled coroutine
struct Cancelled;

struct Baton {
    state: State,
    turn: Turn,
    cancelled: bool,
    body: Option<Body>,
    panic: Option<Box<dyn Any + Send + 'static>>,
}

/// State shared between handles and the backing thread
struct Core {
    id: CoroutineId,
    name: Option<String>,
    stack_size: Option<usize>,
    baton: Mutex<Baton>,
    cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cancels the coroutine once the last handle is gone. The backing thread only
/// holds a weak reference to this.
struct Owner {
    core: Arc<Core>,
}

/// What the backing thread knows about the coroutine it runs
struct Current {
    core: Arc<Core>,
    owner: Weak<Owner>,
}

/// A handle to a cooperatively scheduled unit of execution with its own stack
#[derive(Clone)]
pub struct Coroutine {
    owner: Arc<Owner>,
}

/// Cancels a coroutine without keeping it alive
#[derive(Clone)]
pub(crate) struct Canceller {
    core: Weak<Core>,
}

/// Options for creating a [Coroutine]
#[derive(Debug, Clone, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: Option<usize>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix of the backing thread's name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Create a coroutine in a not-started state
    pub fn create<F>(self, body: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let core = Core {
            id: CoroutineId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            stack_size: self.stack_size,
            baton: Mutex::new(Baton {
                state: State::New,
                turn: Turn::Caller,
                cancelled: false,
                body: Some(Box::new(body)),
                panic: None,
            }),
            cv: Condvar::new(),
            thread: Mutex::new(None),
        };
        Coroutine {
            owner: Arc::new(Owner {
                core: Arc::new(core),
            }),
        }
    }
}

impl Coroutine {
    /// Create a coroutine with default options
    pub fn create<F>(body: F) -> Coroutine
    where
        F: FnOnce() + Send + 'static,
    {
        Builder::new().create(body)
    }

    /// The coroutine executing on the current thread, if any
    pub fn current() -> Option<Coroutine> {
        CURRENT.with(|c| {
            let owner = c.borrow().as_ref()?.owner.upgrade()?;
            Some(Coroutine { owner })
        })
    }

    pub fn id(&self) -> CoroutineId {
        self.core().id
    }

    /// Whether or not coroutine is done running
    pub fn is_done(&self) -> bool {
        self.core().baton().state == State::Done
    }

    /// Start the coroutine, or resume it from its last suspension point.
    ///
    /// Blocks the caller until the coroutine yields or completes. A panic
    /// inside the coroutine is propagated to the caller of `run`.
    pub fn run(&self) -> Result<Status> {
        let core = self.core();
        let mut baton = core.baton();
        match baton.state {
            State::Running => {
                return Err(Error::UnexpectedResume(format!(
                    "{} is already running",
                    self.id()
                )))
            }
            State::Done => {
                return Err(Error::UnexpectedResume(format!(
                    "{} has completed",
                    self.id()
                )))
            }
            State::New => {
                let body = baton.body.take().ok_or_else(|| {
                    Error::UnexpectedResume(format!("{} has no body to start", self.id()))
                })?;
                self.launch(body)?;
            }
            State::Suspended => (),
        }

        baton.state = State::Running;
        baton.turn = Turn::Coroutine;
        core.cv.notify_all();
        let mut baton = core.await_caller_turn(baton);

        if let Some(payload) = baton.panic.take() {
            drop(baton);
            panic::resume_unwind(payload);
        }

        Ok(match baton.state {
            State::Done => Status::Done,
            _ => Status::Suspended,
        })
    }

    pub(crate) fn canceller(&self) -> Canceller {
        Canceller {
            core: Arc::downgrade(self.core()),
        }
    }

    /// Spawn the backing thread. It parks until the baton is handed over.
    fn launch(&self, body: Body) -> Result<()> {
        let core = Arc::clone(self.core());
        let prefix = core.name.as_deref().unwrap_or("coroutine");
        let mut builder = thread::Builder::new().name(format!("{}-{}", prefix, core.id.0));
        if let Some(size) = core.stack_size {
            builder = builder.stack_size(size);
        }

        let owner = Arc::downgrade(&self.owner);
        let thread = builder.spawn(move || {
            CURRENT.with(|c| {
                *c.borrow_mut() = Some(Current {
                    core: Arc::clone(&core),
                    owner,
                })
            });
            drop(core.await_turn());
            debug!("{} started", core.id);

            let outcome = panic::catch_unwind(AssertUnwindSafe(body));

            CURRENT.with(|c| c.borrow_mut().take());
            let mut baton = core.baton();
            baton.state = State::Done;
            match outcome {
                Err(payload) if payload.is::<Cancelled>() => debug!("{} unwound", core.id),
                Err(payload) => baton.panic = Some(payload),
                Ok(()) => (),
            }
            baton.turn = Turn::Caller;
            core.cv.notify_all();
            debug!("{} done", core.id);
        })?;
        *self.core().thread() = Some(thread);
        Ok(())
    }

    fn core(&self) -> &Arc<Core> {
        &self.owner.core
    }
}

impl Core {
    /// Hand baton back to whoever called `run`, and park until resumed.
    /// Unwinds the coroutine's stack instead of returning once cancelled.
    fn suspend(&self) {
        let mut baton = self.baton();
        if !baton.cancelled {
            baton.state = State::Suspended;
            baton.turn = Turn::Caller;
            self.cv.notify_all();
            drop(baton);
            baton = self.await_turn();
        }
        let cancelled = baton.cancelled;
        drop(baton);
        if cancelled {
            panic::resume_unwind(Box::new(Cancelled));
        }
    }

    /// Unwind a suspended coroutine and wait for its thread to exit. A
    /// coroutine that never started just drops its body.
    fn cancel(&self) {
        let mut baton = self.baton();
        baton.cancelled = true;
        match baton.state {
            State::Suspended => (),
            State::New => {
                baton.state = State::Done;
                let body = baton.body.take();
                drop(baton);
                drop(body);
                return;
            }
            State::Running | State::Done => return,
        }

        debug!("{} cancelled while suspended", self.id);
        baton.state = State::Running;
        baton.turn = Turn::Coroutine;
        self.cv.notify_all();
        drop(self.await_caller_turn(baton));

        let thread = self.thread().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("{} exited abnormally", self.id);
            }
        }
    }

    fn await_turn(&self) -> MutexGuard<'_, Baton> {
        self.cv
            .wait_while(self.baton(), |b| b.turn == Turn::Caller)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn await_caller_turn<'a>(&'a self, baton: MutexGuard<'a, Baton>) -> MutexGuard<'a, Baton> {
        self.cv
            .wait_while(baton, |b| b.turn == Turn::Coroutine)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn baton(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn thread(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.thread.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.core.cancel();
    }
}

impl Canceller {
    pub(crate) fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            core.cancel();
        }
    }
}

/// Suspend the currently running coroutine, returning control to the caller
/// of [Coroutine::run]
pub fn yield_now() -> Result<()> {
    let core = CURRENT
        .with(|c| c.borrow().as_ref().map(|cur| Arc::clone(&cur.core)))
        .ok_or(Error::NoCoroutineContext)?;
    core.suspend();
    Ok(())
}

/// Id of the coroutine executing on the current thread, even while it unwinds
pub(crate) fn current_id() -> Option<CoroutineId> {
    CURRENT.with(|c| c.borrow().as_ref().map(|cur| cur.core.id))
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("state", &self.core().baton().state)
            .finish()
    }
}

impl fmt::Display for CoroutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coroutine#{}", self.0)
    }
}

impl CoroutineId {
    pub fn inner(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn done_with_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = Coroutine::create(move || tx.send(42).unwrap());

        assert!(!co.is_done());
        assert_eq!(co.run().unwrap(), Status::Done);
        assert!(co.is_done());
        assert_eq!(rx.recv().unwrap(), 42);

        assert_matches!(
            co.run(),
            Err(Error::UnexpectedResume(_)),
            "Should not be able to resume after completion"
        );
    }

    #[test]
    fn yield_once() {
        let log = Arc::new(Mutex::new(vec![]));
        let co = {
            let log = Arc::clone(&log);
            Coroutine::create(move || {
                log.lock().unwrap().push("before");
                yield_now().unwrap();
                log.lock().unwrap().push("after");
            })
        };

        assert_eq!(co.run().unwrap(), Status::Suspended);
        assert_eq!(*log.lock().unwrap(), vec!["before"]);

        assert_eq!(co.run().unwrap(), Status::Done);
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn yield_many() {
        let count = Arc::new(Mutex::new(0));
        let co = {
            let count = Arc::clone(&count);
            Coroutine::create(move || loop {
                *count.lock().unwrap() += 1;
                yield_now().unwrap();
            })
        };

        for expected in 1..=5 {
            assert_eq!(co.run().unwrap(), Status::Suspended);
            assert_eq!(*count.lock().unwrap(), expected);
        }
        assert!(!co.is_done(), "infinitely yielding coroutine is not done");
    }

    #[test]
    fn yield_outside_coroutine() {
        assert_matches!(yield_now(), Err(Error::NoCoroutineContext));
        assert!(Coroutine::current().is_none());
    }

    #[test]
    fn current_inside_coroutine() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = Coroutine::create(move || {
            tx.send(Coroutine::current().map(|c| c.id())).unwrap();
        });
        co.run().unwrap();
        assert_eq!(rx.recv().unwrap(), Some(co.id()));
    }

    #[test]
    fn run_while_running() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = Coroutine::create(move || {
            let me = Coroutine::current().unwrap();
            tx.send(me.run().is_err()).unwrap();
        });
        co.run().unwrap();
        assert!(rx.recv().unwrap(), "running coroutine cannot be resumed");
    }

    #[test]
    fn nested_run() {
        let log = Arc::new(Mutex::new(vec![]));
        let inner = {
            let log = Arc::clone(&log);
            Coroutine::create(move || {
                log.lock().unwrap().push("inner");
                yield_now().unwrap();
                log.lock().unwrap().push("inner resumed");
            })
        };
        let outer = {
            let log = Arc::clone(&log);
            let inner = inner.clone();
            Coroutine::create(move || {
                log.lock().unwrap().push("outer");
                assert_eq!(inner.run().unwrap(), Status::Suspended);
                log.lock().unwrap().push("outer after inner");
            })
        };

        assert_eq!(outer.run().unwrap(), Status::Done);
        assert_eq!(inner.run().unwrap(), Status::Done);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer", "inner", "outer after inner", "inner resumed"]
        );
    }

    #[test]
    fn panic_propagates_to_caller() {
        let co = Coroutine::create(|| panic!("boom"));
        let res = panic::catch_unwind(AssertUnwindSafe(|| co.run()));
        assert!(res.is_err());
        assert!(co.is_done());
    }

    #[test]
    fn ids_are_unique() {
        let a = Coroutine::create(|| ());
        let b = Coroutine::create(|| ());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn builder_names_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = Builder::new().name("worker").stack_size(256 * 1024).create(move || {
            tx.send(thread::current().name().map(String::from)).unwrap();
        });
        co.run().unwrap();
        assert_eq!(
            rx.recv().unwrap(),
            Some(format!("worker-{}", co.id().inner()))
        );
    }

    /// Reports on a channel when dropped
    struct Unwound(std::sync::mpsc::Sender<&'static str>);

    impl Drop for Unwound {
        fn drop(&mut self) {
            self.0.send("unwound").unwrap();
        }
    }

    #[test]
    fn dropping_suspended_coroutine_unwinds_it() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = Coroutine::create(move || {
            let _guard = Unwound(tx);
            yield_now().unwrap();
            unreachable!("coroutine is never resumed");
        });
        assert_eq!(co.run().unwrap(), Status::Suspended);

        let other = co.clone();
        drop(co);
        assert!(rx.try_recv().is_err(), "a handle is still alive");

        drop(other);
        assert_eq!(rx.try_recv(), Ok("unwound"));
    }

    #[test]
    fn dropping_unstarted_coroutine_drops_body() {
        let (tx, rx) = std::sync::mpsc::channel();
        let guard = Unwound(tx);
        let co = Coroutine::create(move || drop(guard));
        drop(co);
        assert_eq!(rx.try_recv(), Ok("unwound"));
    }

    #[test]
    fn cancelled_coroutine_is_done() {
        let co = Coroutine::create(|| loop {
            yield_now().unwrap();
        });
        co.run().unwrap();
        let canceller = co.canceller();
        canceller.cancel();
        assert!(co.is_done());
        assert_matches!(co.run(), Err(Error::UnexpectedResume(_)));
    }

    #[test]
    fn current_does_not_keep_coroutine_alive() {
        let (tx, rx) = std::sync::mpsc::channel();
        let co = Coroutine::create(move || {
            let _guard = Unwound(tx);
            let me = Coroutine::current().map(|c| c.id());
            assert!(me.is_some());
            yield_now().unwrap();
        });
        co.run().unwrap();
        drop(co);
        assert_eq!(rx.try_recv(), Ok("unwound"));
    }
}
