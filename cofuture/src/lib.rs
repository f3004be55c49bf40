//! Futures that coroutines can block on.
//!
//! Code running inside a coroutine of a [Runtime] calls asynchronous,
//! callback-style operations through [Future]s and blocks on their results
//! with [Future::wait] or [wait], which suspend only the calling coroutine.
//! The event loop keeps running other coroutines, timers and I/O meanwhile.

mod config;
mod coordinator;
mod error;
mod future;
mod runtime;
mod task;
mod wrap;

pub mod coro;
pub mod leak;
pub mod timer;

pub use config::Config;
pub use coordinator::{settle, wait, Waitable};
pub use coro::{Coroutine, CoroutineId};
pub use error::{AggregateError, Error, Fault};
pub use future::{AnyFuture, Future, FutureId};
pub use leak::{assert_no_future_left_behind, LeakReport};
pub use runtime::{EnterGuard, Handle, Runtime};
pub use task::{detached, task, task_all};
pub use wrap::{wrap, wrap_with_return, Resolver};

pub type Result<T> = std::result::Result<T, Error>;
