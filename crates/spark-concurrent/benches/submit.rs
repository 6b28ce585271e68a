use criterion::{Criterion, black_box};
use spark_concurrent::ManagedExecutor;
use spark_concurrent::context::{ContextProviderRegistry, TracingSpanProvider};
use spark_concurrent::test_stubs::{InlineExecutor, MarkerProvider, ThreadPoolStub};
use std::sync::Arc;
use std::{env, time::Duration};

/// 托管提交的固定开销：捕获、施加、恢复与状态机推进。
///
/// # 设计背景（Why）
/// - 托管层在每次提交上叠加了上下文捕获与监听器通知，需要确认这部分开销相对任务体可以忽略。
///
/// # 逻辑解析（How）
/// - `inline`：内联执行器，测得的是纯托管开销；
/// - `pool`：两个工作线程的线程池，额外包含跨线程唤醒。
fn bench_submit(c: &mut Criterion) {
    let registry = ContextProviderRegistry::new()
        .with(Arc::new(MarkerProvider::new("bench")))
        .and_then(|registry| registry.with(Arc::new(TracingSpanProvider)))
        .unwrap();

    let inline = ManagedExecutor::builder(InlineExecutor::new())
        .with_context_registry(registry.clone())
        .build()
        .unwrap();
    c.bench_function("submit_get_inline", |b| {
        b.iter(|| {
            let future = inline.submit(|| Ok(black_box(42u64))).unwrap();
            black_box(future.get().unwrap())
        });
    });

    let pool = ThreadPoolStub::new("bench", 2);
    let pooled = ManagedExecutor::builder(pool.clone())
        .with_context_registry(registry)
        .build()
        .unwrap();
    c.bench_function("submit_get_pool", |b| {
        b.iter(|| {
            let future = pooled.submit(|| Ok(black_box(42u64))).unwrap();
            black_box(future.get().unwrap())
        });
    });
    c.bench_function("stage_then_apply_pool", |b| {
        b.iter(|| {
            let stage = pooled
                .supply_async(|| Ok(black_box(1u64)))
                .then_apply_async(|value| value + 1);
            black_box(stage.join().unwrap())
        });
    });
    pool.shutdown();
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_submit(&mut criterion);
    criterion.final_summary();
}
