//! 固定速率漂移观测工具。
//!
//! 在 Tokio 适配层上运行一个固定速率调度，任务体每隔若干次故意超时，
//! 输出每次尝试相对首个槽位的实际开始时间，用于核对"对齐到下一个未来槽位、不补跑"的行为。
//!
//! 用法：`drift_report [--period-ms N] [--runs N] [--slow-every N]`，日志级别由 `RUST_LOG` 控制（默认 `info`）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use parking_lot::Mutex;
use spark_concurrent::context::{ContextProviderRegistry, TracingSpanProvider};
use spark_concurrent::rt::TokioNativeExecutor;
use spark_concurrent::{ManagedExecutor, ManagedExecutorConfig, interrupt};
use tracing::info;
use tracing_subscriber::EnvFilter;

struct Options {
    period: Duration,
    runs: usize,
    slow_every: usize,
}

fn parse_options() -> anyhow::Result<Options> {
    let mut options = Options {
        period: Duration::from_millis(50),
        runs: 10,
        slow_every: 4,
    };
    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let value = args
            .next()
            .with_context(|| format!("missing value for `{flag}`"))?;
        let number: u64 = value
            .parse()
            .with_context(|| format!("`{flag}` expects an integer, got `{value}`"))?;
        match flag.as_str() {
            "--period-ms" => options.period = Duration::from_millis(number),
            "--runs" => options.runs = number as usize,
            "--slow-every" => options.slow_every = number as usize,
            other => bail!("unknown option `{other}`"),
        }
    }
    if options.runs == 0 {
        bail!("--runs must be positive");
    }
    Ok(options)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let options = parse_options()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .context("failed to build tokio runtime")?;
    let native = Arc::new(TokioNativeExecutor::new("drift-tokio", runtime.handle().clone()));
    let executor = ManagedExecutor::builder(native)
        .with_config(ManagedExecutorConfig::named("drift-report"))
        .with_context_registry(ContextProviderRegistry::new().with(Arc::new(TracingSpanProvider))?)
        .build()?;

    let origin = Instant::now();
    let starts = Arc::new(Mutex::new(Vec::<Duration>::new()));
    let recorded = Arc::clone(&starts);
    let period = options.period;
    let slow_every = options.slow_every;
    let future = executor.schedule_at_fixed_rate(
        move || {
            let run = {
                let mut starts = recorded.lock();
                starts.push(origin.elapsed());
                starts.len()
            };
            if slow_every > 0 && run % slow_every == 0 {
                // 超过一个周期，迫使下一次跳到后续槽位。
                interrupt::sleep(period * 3 / 2)?;
            }
            Ok(run)
        },
        Duration::ZERO,
        period,
    )?;

    let deadline = Instant::now() + period * (options.runs as u32 * 3);
    while starts.lock().len() < options.runs && Instant::now() < deadline {
        std::thread::sleep(period / 4);
    }
    future.cancel(true);

    let starts = starts.lock().clone();
    for (index, start) in starts.iter().enumerate() {
        let slot = start.as_secs_f64() / period.as_secs_f64();
        info!(
            run = index + 1,
            start_ms = start.as_millis() as u64,
            slot = %format!("{slot:.2}"),
            "attempt started"
        );
    }
    info!(observed = starts.len(), attempts = future.attempts(), "drift report finished");
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}
