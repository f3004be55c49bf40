//! Suspend a coroutine until a set of futures has settled.
//!
//! When one of the awaited futures is a task whose deferred call has not
//! started yet, the coordinator runs that call inline on the waiting
//! coroutine's own stack rather than letting the scheduler spin up a fresh
//! coroutine for it.

use crate::coro::{self, Coroutine};
use crate::future::AnyFuture;
use crate::{AggregateError, Error, Future, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Argument to [wait] and [settle]: a single future, or one level of
/// ordered futures
#[derive(Debug, Clone)]
pub enum Waitable {
    One(AnyFuture),
    Many(Vec<Waitable>),
}

/// Wait on a set of futures, then report every failure among them.
///
/// No failures returns `Ok(())`, a single failure returns that exact error,
/// and several failures return [Error::Aggregated] listing them in order.
pub fn wait(items: &[Waitable]) -> Result<()> {
    settle(items)?;

    let mut errors = vec![];
    for future in flatten(items, false)? {
        future.inner.deactivate();
        if let Some(e) = future.error() {
            errors.push(e);
        }
    }

    if errors.len() > 1 {
        return Err(Error::Aggregated(AggregateError::new(errors)));
    }
    match errors.pop() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Wait on a set of futures without inspecting their outcomes. Returns the
/// futures that had to be waited on, all of which are resolved.
pub fn settle(items: &[Waitable]) -> Result<Vec<AnyFuture>> {
    let mut pending = flatten(items, true)?;
    let co = Coroutine::current().ok_or(Error::NoCoroutineContext)?;

    let reused = match pending.iter().position(|f| f.inner.is_pending_task()) {
        Some(i) => {
            let candidate = pending.remove(i);
            match candidate.inner.claim() {
                Some(call) => Some((candidate, call)),
                None => {
                    pending.insert(i, candidate);
                    None
                }
            }
        }
        None => None,
    };

    let remaining = Arc::new(AtomicUsize::new(pending.len() + usize::from(reused.is_some())));
    for future in &pending {
        let remaining = Arc::clone(&remaining);
        let co = co.clone();
        future.inner.on_settle(Box::new(move || {
            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                co.run()?;
            }
            Ok(())
        }))?;
    }

    // Only the countdown may keep this coroutine resumable while it yields
    let id = co.id();
    drop(co);

    if let Some((future, call)) = reused {
        debug!("{} running {} inline", id, future.id());
        call();
        remaining.fetch_sub(1, Ordering::SeqCst);
        pending.push(future);
    }

    while remaining.load(Ordering::SeqCst) > 0 {
        coro::yield_now()?;
    }
    Ok(pending)
}

/// Flatten arguments into a list of futures, optionally leaving out those
/// that already resolved
fn flatten(items: &[Waitable], skip_resolved: bool) -> Result<Vec<AnyFuture>> {
    let mut futures = vec![];
    let mut push = |f: &AnyFuture| {
        if !(skip_resolved && f.is_resolved()) {
            futures.push(f.clone());
        }
    };

    for item in items {
        match item {
            Waitable::One(f) => push(f),
            Waitable::Many(list) => {
                for nested in list {
                    match nested {
                        Waitable::One(f) => push(f),
                        Waitable::Many(_) => {
                            return Err(Error::NotAFuture(
                                "nested sequence of futures".to_string(),
                            ))
                        }
                    }
                }
            }
        }
    }
    Ok(futures)
}

impl<T> From<&Future<T>> for Waitable
where
    T: Clone + Send + 'static,
{
    fn from(f: &Future<T>) -> Self {
        Waitable::One(f.erase())
    }
}

impl<T> From<&[Future<T>]> for Waitable
where
    T: Clone + Send + 'static,
{
    fn from(list: &[Future<T>]) -> Self {
        Waitable::Many(list.iter().map(Waitable::from).collect())
    }
}

impl<T> From<&Vec<Future<T>>> for Waitable
where
    T: Clone + Send + 'static,
{
    fn from(list: &Vec<Future<T>>) -> Self {
        Waitable::from(list.as_slice())
    }
}

impl From<AnyFuture> for Waitable {
    fn from(f: AnyFuture) -> Self {
        Waitable::One(f)
    }
}

impl From<&AnyFuture> for Waitable {
    fn from(f: &AnyFuture) -> Self {
        Waitable::One(f.clone())
    }
}

impl From<Vec<AnyFuture>> for Waitable {
    fn from(list: Vec<AnyFuture>) -> Self {
        Waitable::Many(list.into_iter().map(Waitable::One).collect())
    }
}

/// Wait on futures and slices of futures, see [wait](fn@crate::wait)
#[macro_export]
macro_rules! wait {
    ($($f:expr),+ $(,)?) => {
        $crate::wait(&[$($crate::Waitable::from($f)),+])
    };
}

/// Settle futures and slices of futures, see [settle](fn@crate::settle)
#[macro_export]
macro_rules! settle {
    ($($f:expr),+ $(,)?) => {
        $crate::settle(&[$($crate::Waitable::from($f)),+])
    };
}
