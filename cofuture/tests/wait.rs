//! Blocking on futures from inside coroutines
use assert_matches::assert_matches;
use cofuture::{
    assert_no_future_left_behind, settle, task, timer, wait, Coroutine, Error, Fault, Future,
    Handle, Runtime, Waitable,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A future that returns `value` after one tick of the event loop
fn later<T: Clone + Send + 'static>(value: T) -> Future<T> {
    let future = Future::new();
    let resolve = future.clone();
    Handle::current().next_tick(move || resolve.return_value(value));
    future
}

#[test]
fn wait_on_tick_and_immediate() {
    let rt = Runtime::new().unwrap();
    let (a, b) = rt
        .block_on(|| {
            let a = later(10);
            let b = Future::new();
            b.return_value(20)?;

            wait!(&a, &b)?;
            Ok((a.get()?, b.get()?))
        })
        .unwrap();
    assert_eq!((a, b), (10, 20));
}

#[test]
fn wait_propagates_exact_error() {
    let rt = Runtime::new().unwrap();
    let fault = Fault::new("x");
    let thrown = fault.clone();
    let res = rt.block_on(move || {
        let a = Future::<()>::new();
        {
            let a = a.clone();
            Handle::current().next_tick(move || a.throw(thrown));
        }
        wait!(&a)
    });
    assert_matches!(res, Err(Error::Failed(f)) if f.ptr_eq(&fault));
}

#[test]
fn future_wait_rethrows_with_call_site() {
    let rt = Runtime::new().unwrap();
    let fault = Fault::new("deep failure");
    let thrown = fault.clone();
    let res = rt.block_on(move || {
        let failing = task::<(), _>(move || Err(thrown.into()));
        failing.wait()
    });
    assert_matches!(res, Err(Error::Failed(f)) if f.ptr_eq(&fault));
    assert!(
        fault.sites().iter().any(|s| s.file().ends_with("wait.rs")),
        "wait records where the error was re-raised"
    );
}

#[test]
fn timers_scenario() {
    let rt = Runtime::new().unwrap();
    let res = rt.block_on(|| {
        let timer = timer::sleep(Duration::from_millis(10));
        let tick = timer::tick();
        wait!(&timer, &tick)?;
        timer.get()?;
        tick.get()?;
        Ok("pass")
    });
    assert_eq!(res.unwrap(), "pass");
}

#[test]
fn aggregate_counts_failures() {
    let rt = Runtime::new().unwrap();
    let res = rt.block_on(|| {
        let futures: Vec<Future<usize>> = (0..5)
            .map(|i| {
                task(move || {
                    if i % 2 == 0 {
                        Err(Fault::new(format!("task {i} failed")).into())
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect();
        wait!(&futures)
    });

    let err = match res {
        Err(Error::Aggregated(err)) => err,
        other => panic!("expected aggregate, got {other:?}"),
    };
    let messages: Vec<_> = err.inner_errors().iter().map(ToString::to_string).collect();
    assert_eq!(
        messages,
        vec!["task 0 failed", "task 2 failed", "task 4 failed"]
    );
}

#[test]
fn settle_mixed_outcomes() {
    let rt = Runtime::new().unwrap();
    rt.block_on(|| {
        let ok = later(1);
        let bad = task::<i32, _>(|| Err(Fault::new("bad").into()));

        let settled = settle(&[Waitable::from(&ok), Waitable::from(&bad)])?;
        assert!(settled.iter().all(|f| f.is_resolved()));
        assert_eq!(ok.get()?, 1);
        assert_matches!(bad.get(), Err(Error::Failed(_)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn wait_without_coroutine() {
    let f = Future::<()>::new();
    assert_matches!(wait(&[Waitable::from(&f)]), Err(Error::NoCoroutineContext));
}

#[test]
fn other_coroutines_run_while_waiting() {
    let rt = Runtime::new().unwrap();
    let log = Arc::new(Mutex::new(vec![]));
    let outer_log = Arc::clone(&log);
    rt.block_on(move || {
        let log = outer_log;
        let gate = Future::<()>::new();

        let waiter = {
            let gate = gate.clone();
            let log = Arc::clone(&log);
            task(move || {
                log.lock().unwrap().push("waiter blocked");
                gate.wait()?;
                log.lock().unwrap().push("waiter resumed");
                Ok(())
            })
        };
        let opener = {
            let gate = gate.clone();
            let log = Arc::clone(&log);
            task(move || {
                log.lock().unwrap().push("opener");
                gate.return_value(())
            })
        };

        // waiter runs inline here, opener in its own coroutine
        wait!(&waiter, &opener)?;
        Ok(())
    })
    .unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["waiter blocked", "opener", "waiter resumed"]
    );
}

#[test]
fn reuse_matches_fresh_coroutine() {
    let rt = Runtime::new().unwrap();
    rt.block_on(|| {
        let me = Coroutine::current().map(|c| c.id());
        let work = || Ok((1..=10).sum::<i32>());
        let probe = |v: i32| (v, Coroutine::current().map(|c| c.id()));

        let pending = later(());
        let inline = task(move || work().map(probe));
        wait!(&inline, &pending)?;

        let fresh = task(move || work().map(probe));
        wait!(&later(()))?;

        let (inline_value, inline_co) = inline.get()?;
        let (fresh_value, fresh_co) = fresh.get()?;
        assert_eq!(inline_co, me, "reused the waiting coroutine");
        assert_ne!(fresh_co, me, "ran in its own coroutine");
        assert_eq!(inline_value, fresh_value);
        Ok(())
    })
    .unwrap();
}

#[test]
fn no_leaks_after_consumption() {
    let rt = Runtime::new().unwrap();
    rt.block_on(|| {
        let a = later(1);
        let b = later(2);
        let c = Future::<()>::new();

        assert_matches!(
            assert_no_future_left_behind(),
            Err(Error::OutstandingFutures(r)) if r.sites.len() == 3
        );

        a.wait()?;
        wait!(&b)?;
        c.detach()?;
        assert_no_future_left_behind()?;
        c.return_value(())
    })
    .unwrap();
}
