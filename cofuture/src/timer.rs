//! Timer-backed futures. Timeouts are composed from these, e.g. by waiting
//! on a [sleep] alongside the operation being timed.

use crate::{Future, Handle};
use std::time::Duration;

/// A future that returns once `duration` has elapsed.
///
/// # Panics
///
/// Panics if called outside of a runtime context, see [Handle::current].
#[track_caller]
pub fn sleep(duration: Duration) -> Future<()> {
    Handle::current().spawn(async move {
        tokio::time::sleep(duration).await;
        Ok(())
    })
}

/// A future that returns on the next tick of the event loop
#[track_caller]
pub fn tick() -> Future<()> {
    let future = Future::new();
    let resolve = future.clone();
    Handle::current().next_tick(move || resolve.return_value(()));
    future
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Fault, Runtime};
    use assert_matches::assert_matches;
    use std::time::Instant;

    #[test]
    fn sleep_elapses() {
        let rt = Runtime::new().unwrap();
        let start = Instant::now();
        rt.block_on(|| sleep(Duration::from_millis(20)).wait())
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn timer_and_tick() {
        let rt = Runtime::new().unwrap();
        let res = rt.block_on(|| {
            let timer = sleep(Duration::from_millis(10));
            let tick = tick();
            crate::wait!(&timer, &tick)?;
            timer.get()?;
            tick.get()?;
            Ok("pass")
        });
        assert_eq!(res.unwrap(), "pass");
    }

    #[test]
    fn tick_before_timer() {
        let rt = Runtime::new().unwrap();
        let (timer_first, tick_first) = rt
            .block_on(|| {
                let timer = sleep(Duration::from_millis(10));
                let tick = tick();
                tick.wait()?;
                Ok((timer.is_resolved(), tick.is_resolved()))
            })
            .unwrap();
        assert!(!timer_first);
        assert!(tick_first);
    }

    #[test]
    fn timeout_composed_from_sleep() {
        let rt = Runtime::new().unwrap();
        let res: crate::Result<()> = rt.block_on(|| {
            let slow = Future::<()>::new();
            let deadline = sleep(Duration::from_millis(5));
            {
                let slow = slow.clone();
                deadline.resolve_success(move |_| slow.throw(Fault::new("timed out")))?;
            }
            slow.wait()
        });
        assert_matches!(res, Err(Error::Failed(f)) if f.message() == "timed out");
    }
}
