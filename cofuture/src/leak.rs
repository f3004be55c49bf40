//! Bookkeeping of futures that were created inside a coroutine but never
//! consumed.

use crate::coro::{Coroutine, CoroutineId};
use crate::future::FutureId;
use crate::runtime::Handle;
use crate::{Error, Result};
use serde::Serialize;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::panic::Location;

/// Futures awaiting consumption, per coroutine of one runtime
#[derive(Debug, Default)]
pub(crate) struct LeakRegistry {
    active: HashMap<CoroutineId, Vec<Entry>>,
}

#[derive(Debug)]
struct Entry {
    future: FutureId,
    location: &'static Location<'static>,
    backtrace: Option<Backtrace>,
}

/// Creation sites of futures still outstanding in a coroutine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakReport {
    pub coroutine: CoroutineId,
    pub sites: Vec<LeakSite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakSite {
    pub future: FutureId,
    pub location: String,
    pub backtrace: Option<String>,
}

impl LeakRegistry {
    pub(crate) fn track(
        &mut self,
        coroutine: CoroutineId,
        future: FutureId,
        location: &'static Location<'static>,
        capture_backtrace: bool,
    ) {
        let backtrace = capture_backtrace.then(Backtrace::force_capture);
        self.active.entry(coroutine).or_default().push(Entry {
            future,
            location,
            backtrace,
        });
    }

    pub(crate) fn untrack(&mut self, coroutine: CoroutineId, future: FutureId) {
        let Some(entries) = self.active.get_mut(&coroutine) else {
            return;
        };
        entries.retain(|e| e.future != future);
        if entries.is_empty() {
            self.active.remove(&coroutine);
        }
    }

    pub(crate) fn count(&self, coroutine: CoroutineId) -> usize {
        self.active.get(&coroutine).map_or(0, Vec::len)
    }

    pub(crate) fn report(&self, coroutine: CoroutineId) -> Option<LeakReport> {
        let entries = self.active.get(&coroutine)?;
        Some(LeakReport {
            coroutine,
            sites: entries.iter().map(LeakSite::from).collect(),
        })
    }

    /// Forget everything tracked for a finished coroutine, returning what was
    /// left behind
    pub(crate) fn teardown(&mut self, coroutine: CoroutineId) -> Option<LeakReport> {
        let report = self.report(coroutine);
        self.active.remove(&coroutine);
        report
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

impl From<&Entry> for LeakSite {
    fn from(e: &Entry) -> Self {
        LeakSite {
            future: e.future,
            location: e.location.to_string(),
            backtrace: e.backtrace.as_ref().map(|b| b.to_string()),
        }
    }
}

/// Fail if the current coroutine created futures that were never consumed
/// with `get`, `wait`, `resolve` or `detach`.
///
/// Meant to be called at natural checkpoints, e.g. at the end of a unit of
/// work. Outside of a runtime coroutine there is nothing to check.
pub fn assert_no_future_left_behind() -> Result<()> {
    let (Some(co), Some(handle)) = (Coroutine::current(), Handle::try_current()) else {
        return Ok(());
    };
    let report = handle.registry().report(co.id());
    match report {
        Some(report) => Err(Error::OutstandingFutures(report)),
        None => Ok(()),
    }
}

/// Number of futures the current coroutine has not consumed yet
pub fn outstanding() -> usize {
    match (Coroutine::current(), Handle::try_current()) {
        (Some(co), Some(handle)) => handle.registry().count(co.id()),
        _ => 0,
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "There are outstanding futures. Construction call stacks:"
        )?;
        for (i, site) in self.sites.iter().enumerate() {
            write!(f, "\n#{}\n    at {}", i + 1, site.location)?;
            if let Some(bt) = &site.backtrace {
                write!(f, "\n{bt}")?;
            }
        }
        Ok(())
    }
}
