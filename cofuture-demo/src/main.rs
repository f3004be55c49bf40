use anyhow::{Context, Result};
use clap::{arg, command, value_parser, Command};
use cofuture::{
    assert_no_future_left_behind, task, timer, Config, Error, Fault, Future, Runtime,
};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Two timers of different length, waited on together
fn run_timers(rt: &Runtime, millis: u64) -> Result<()> {
    let start = Instant::now();
    let res = rt.block_on(move || {
        let timer = timer::sleep(Duration::from_millis(millis));
        let tick = timer::tick();
        cofuture::wait!(&timer, &tick)?;
        timer.get()?;
        tick.get()?;
        Ok("pass")
    })?;
    println!("{} in {:?}", res, start.elapsed());
    Ok(())
}

/// Fan out work over tasks, some of which fail, and report every failure
fn run_fanout(rt: &Runtime, tasks: usize, every: usize) -> Result<()> {
    let res = rt.block_on(move || {
        let futures: Vec<Future<usize>> = (0..tasks)
            .map(|i| {
                task(move || {
                    timer::sleep(Duration::from_millis(i as u64)).wait()?;
                    if every > 0 && i % every == 0 {
                        return Err(Fault::new(format!("task {i} failed")).into());
                    }
                    Ok(i * i)
                })
            })
            .collect();
        cofuture::wait!(&futures)?;
        futures.iter().map(Future::get).sum::<cofuture::Result<usize>>()
    });

    match res {
        Ok(sum) => println!("sum of squares: {sum}"),
        Err(Error::Aggregated(err)) => {
            println!("{} tasks failed", err.inner_errors().len());
            println!("{err}");
        }
        Err(e) => println!("one task failed: {e}"),
    }
    Ok(())
}

/// Create futures that nobody consumes, and show the leak report
fn run_leak(rt: &Runtime, count: usize, json: bool) -> Result<()> {
    let res = rt.block_on(move || {
        let forgotten: Vec<Future<()>> = (0..count).map(|_| Future::new()).collect();
        debug!("created {} futures", forgotten.len());
        assert_no_future_left_behind()
    });

    match res {
        Ok(()) => println!("no futures left behind"),
        Err(Error::OutstandingFutures(report)) if json => {
            println!("{}", serde_json::to_string_pretty(&report)?)
        }
        Err(e) => println!("{e}"),
    }
    Ok(())
}

/// The clap CLI interface
fn cli() -> Command {
    command!()
        .arg(arg!(--backtraces "Capture creation backtraces of tracked futures"))
        .arg(
            arg!(--"stack-size" <BYTES> "Stack size of coroutine threads")
                .value_parser(value_parser!(usize)),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("timers").about("Wait on a timer and a tick together").arg(
                arg!(--millis <MILLIS> "Length of the timer")
                    .value_parser(value_parser!(u64))
                    .default_value("10"),
            ),
        )
        .subcommand(
            Command::new("fanout")
                .about("Fan out tasks and aggregate their failures")
                .arg(
                    arg!(--tasks <N> "Number of tasks")
                        .value_parser(value_parser!(usize))
                        .default_value("8"),
                )
                .arg(
                    arg!(--"fail-every" <K> "Fail every K-th task, 0 for none")
                        .value_parser(value_parser!(usize))
                        .default_value("3"),
                ),
        )
        .subcommand(
            Command::new("leak")
                .about("Report futures left behind by a coroutine")
                .arg(
                    arg!(--count <N> "Number of forgotten futures")
                        .value_parser(value_parser!(usize))
                        .default_value("2"),
                )
                .arg(arg!(--json "Print report as JSON")),
        )
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = cli().get_matches();

    let mut config = Config::default().capture_backtraces(args.get_flag("backtraces"));
    if let Some(size) = args.get_one::<usize>("stack-size") {
        config = config.stack_size(*size);
    }
    let rt = Runtime::with_config(config).context("Failed to start runtime")?;
    info!("runtime started - {:?}", rt);

    match args.subcommand() {
        Some(("timers", sub)) => run_timers(&rt, *sub.get_one::<u64>("millis").unwrap_or(&10)),
        Some(("fanout", sub)) => run_fanout(
            &rt,
            *sub.get_one::<usize>("tasks").unwrap_or(&8),
            *sub.get_one::<usize>("fail-every").unwrap_or(&3),
        ),
        Some(("leak", sub)) => run_leak(
            &rt,
            *sub.get_one::<usize>("count").unwrap_or(&2),
            sub.get_flag("json"),
        ),
        _ => Ok(()),
    }
}
