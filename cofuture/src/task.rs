//! Deferred calls that run inside a coroutine and settle a [Future].

use crate::runtime::{self, Handle};
use crate::{Error, Future, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Run `body` in a coroutine of the current runtime, returning a future to
/// its outcome.
///
/// The call starts on the next tick in a fresh coroutine, unless a
/// coroutine waiting on the returned future claims it first and runs it
/// inline. Either way it runs exactly once.
///
/// # Panics
///
/// Panics if called outside of a runtime context, see [Handle::current].
#[track_caller]
pub fn task<T, F>(body: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    Handle::current().task(body)
}

/// Like [task], but any failure is re-raised on the event loop
#[track_caller]
pub fn detached<T, F>(body: F) -> Future<T>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let future = task(body);
    if let Err(e) = future.detach() {
        runtime::report_uncaught(e);
    }
    future
}

/// Run each body as a [task], and collect all values in order. Fails with
/// the last error seen if any body fails.
#[track_caller]
pub fn task_all<T, F, I>(bodies: I) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    I: IntoIterator<Item = F>,
{
    let handle = Handle::current();
    let tasks: Vec<Future<T>> = bodies.into_iter().map(|b| handle.task(b)).collect();
    let all = Future::new();
    if tasks.is_empty() {
        if let Err(e) = all.return_value(vec![]) {
            runtime::report_uncaught(e);
        }
        return all;
    }

    let gather = Arc::new(Mutex::new(Gather {
        pending: tasks.len(),
        values: (0..tasks.len()).map(|_| None).collect(),
        error: None,
    }));
    for (i, t) in tasks.iter().enumerate() {
        let gather = Arc::clone(&gather);
        let all = all.clone();
        let res = t.resolve(move |outcome| {
            let finished = gather
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(i, outcome);
            match finished {
                Some(Ok(values)) => all.return_value(values),
                Some(Err(e)) => all.throw(e),
                None => Ok(()),
            }
        });
        if let Err(e) = res {
            runtime::report_uncaught(e);
        }
    }
    all
}

struct Gather<T> {
    pending: usize,
    values: Vec<Option<T>>,
    error: Option<Error>,
}

impl<T> Gather<T> {
    /// Record one outcome, returning the combined outcome once all are in
    fn record(&mut self, i: usize, outcome: Result<T>) -> Option<Result<Vec<T>>> {
        match outcome {
            Ok(v) => self.values[i] = Some(v),
            Err(e) => self.error = Some(e),
        }
        self.pending -= 1;
        if self.pending > 0 {
            return None;
        }
        Some(match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self.values.drain(..).flatten().collect()),
        })
    }
}

impl Handle {
    /// Run `body` as a task on this runtime, see [task]
    #[track_caller]
    pub fn task<T, F>(&self, body: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let future = Future::deferred(Box::new(body));
        let pending = future.clone();
        let handle = self.clone();
        self.next_tick(move || {
            let Some(call) = pending.claim() else {
                debug!("{} already ran inline", pending.id());
                return Ok(());
            };
            let co = handle.spawn_coroutine(call);
            debug!("{} running in {}", pending.id(), co.id());
            co.run()?;
            Ok(())
        });
        future
    }
}
