//! Adapting callback-style functions to return futures.

use crate::runtime::{Handle, Hold};
use crate::{Error, Future, Result};
use tracing::debug;

/// The trailing callback handed to a wrapped function. Settles its future on
/// the event loop, so it may be called from any thread.
///
/// While a resolver is outstanding the event loop stays alive. Dropping it
/// without resolving fails its future with [Error::ResolverDropped].
pub struct Resolver<T>
where
    T: Clone + Send + 'static,
{
    pending: Option<(Future<T>, Hold)>,
    handle: Handle,
}

impl<T> Resolver<T>
where
    T: Clone + Send + 'static,
{
    fn new(future: Future<T>, handle: Handle) -> Self {
        let hold = handle.hold();
        Self {
            pending: Some((future, hold)),
            handle,
        }
    }

    /// Settle the future with a node-style outcome
    pub fn resolve<E>(mut self, outcome: std::result::Result<T, E>)
    where
        E: Into<Error>,
    {
        self.post(outcome.map_err(Into::into));
    }

    pub fn return_value(self, value: T) {
        self.resolve::<Error>(Ok(value));
    }

    pub fn throw(self, error: impl Into<Error>) {
        self.resolve::<Error>(Err(error.into()));
    }

    fn post(&mut self, outcome: Result<T>) {
        let Some((future, hold)) = self.pending.take() else {
            return;
        };
        self.handle.next_tick(move || {
            let _hold = hold;
            future.settle_with(outcome)
        });
    }
}

impl<T> Drop for Resolver<T>
where
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(id) = self.pending.as_ref().map(|(f, _)| f.id()) {
            debug!("resolver for {} dropped", id);
            self.post(Err(Error::ResolverDropped));
        }
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Returns a resolver that settles this future when called.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a runtime context, see [Handle::current].
    pub fn resolver(&self) -> Resolver<T> {
        self.resolver_on(Handle::current())
    }

    pub(crate) fn resolver_on(&self, handle: Handle) -> Resolver<T> {
        Resolver::new(self.clone(), handle)
    }
}

/// Wrap a function taking a trailing [Resolver] callback into one that
/// returns a [Future] instead.
///
/// ```no_run
/// use cofuture::{wrap, Resolver, Runtime};
///
/// fn read_config(path: String, done: Resolver<String>) {
///     std::thread::spawn(move || done.resolve(std::fs::read_to_string(path)));
/// }
///
/// let rt = Runtime::new().unwrap();
/// let read = wrap(read_config);
/// let contents = rt.block_on(move || read("app.toml".to_string()).wait());
/// ```
pub fn wrap<A, T, F>(f: F) -> impl Fn(A) -> Future<T>
where
    T: Clone + Send + 'static,
    F: Fn(A, Resolver<T>),
{
    let wrapped = wrap_with_return(f);
    move |args| wrapped(args).0
}

/// Like [wrap], but also hands back what the wrapped function itself
/// returned, e.g. a handle to the process or request it started.
pub fn wrap_with_return<A, T, R, F>(f: F) -> impl Fn(A) -> (Future<T>, R)
where
    T: Clone + Send + 'static,
    F: Fn(A, Resolver<T>) -> R,
{
    move |args| {
        let future = Future::new();
        let ret = f(args, future.resolver());
        (future, ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fault, Runtime};
    use assert_matches::assert_matches;
    use std::thread;
    use std::time::Duration;

    fn add_later(args: (i32, i32), done: Resolver<i32>) {
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            done.return_value(args.0 + args.1);
        });
    }

    fn fail_now(msg: &'static str, done: Resolver<()>) {
        done.throw(Fault::new(msg));
    }

    #[test]
    fn wrapped_from_foreign_thread() {
        let rt = Runtime::new().unwrap();
        let add = wrap(add_later);
        let v = rt.block_on(move || add((40, 2)).wait()).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn wrapped_failure() {
        let rt = Runtime::new().unwrap();
        let fail = wrap(fail_now);
        let res = rt.block_on(move || fail("nope").wait());
        assert_matches!(res, Err(Error::Failed(f)) if f.message() == "nope");
    }

    #[test]
    fn resolver_settles_on_next_tick() {
        let rt = Runtime::new().unwrap();
        let _ctx = rt.handle().enter();
        let f = Future::new();
        f.resolver().return_value(1);
        assert!(!f.is_resolved());

        drop(_ctx);
        rt.run().unwrap();
        assert_eq!(f.get().unwrap(), 1);
    }

    #[test]
    fn resolver_from_std_result() {
        let rt = Runtime::new().unwrap();
        let _ctx = rt.handle().enter();
        let f = Future::<String>::new();
        f.resolver()
            .resolve(std::fs::read_to_string("/definitely/not/here"));

        drop(_ctx);
        rt.run().unwrap();
        assert_matches!(f.get(), Err(Error::IOError(_)));
    }

    #[test]
    fn dropped_resolver() {
        let rt = Runtime::new().unwrap();
        let _ctx = rt.handle().enter();
        let f = Future::<()>::new();
        drop(f.resolver());

        drop(_ctx);
        rt.run().unwrap();
        assert_matches!(f.get(), Err(Error::ResolverDropped));
    }

    fn spawn_adder(args: (i32, i32), done: Resolver<i32>) -> thread::JoinHandle<()> {
        thread::spawn(move || done.return_value(args.0 + args.1))
    }

    #[test]
    fn wrapped_return_value_kept() {
        let rt = Runtime::new().unwrap();
        let add = wrap_with_return(spawn_adder);
        let v = rt
            .block_on(move || {
                let (sum, worker) = add((1, 2));
                assert!(worker.join().is_ok(), "caller gets the worker handle");
                sum.wait()
            })
            .unwrap();
        assert_eq!(v, 3);
    }
}
