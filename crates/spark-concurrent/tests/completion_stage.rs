//! 上下文感知 CompletionStage 的组合语义。
//!
//! # 教案级导览
//!
//! - **Why**：依赖动作运行在哪个线程无法预知，但它们必须看到注册时的线程上下文；组合器的失败传播也必须可预测。
//! - **How**：借助线程局部的 `user` 标记观察动作运行时的上下文，用多线程完成源阶段制造"完成线程 ≠ 注册线程"。
//! - **What**：覆盖链式继承、失败恢复、双输入组合、外部完成、超时、长依赖链、内联 `join`、捕获/施加失败、
//!   预先绑定上下文、延迟执行器、`.await` 与最小视图。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use spark_concurrent::context::ContextProvider;
use spark_concurrent::test_stubs::{InlineExecutor, MarkerProvider, marker};
use spark_concurrent::{
    ConcurrencyError, ConcurrencyResult, Failure, ManagedExecutor, ManagedExecutorConfig,
    ManagedStage, NativeExecutor, StageAction, StageExecutor,
};

use support::{WAIT, executor, pool, registry_with};

fn executor_with_provider(native: Arc<dyn NativeExecutor>, provider: MarkerProvider) -> ManagedExecutor {
    ManagedExecutor::builder(native)
        .with_config(ManagedExecutorConfig::named("stage-executor"))
        .with_context_registry(registry_with([Arc::new(provider) as Arc<dyn ContextProvider>]))
        .build()
        .expect("配置应通过校验")
}

#[test]
fn async_chain_runs_in_registration_context() {
    let pool = pool(2);
    let executor = executor(pool.clone());

    MarkerProvider::set("user", Some("alice"));
    let stage = executor
        .supply_async(|| Ok(marker("user")))
        .then_apply_async(|seen: Option<String>| (seen, marker("user")));
    MarkerProvider::set("user", None);

    let (supplied, applied) = stage.get_timeout(WAIT).expect("链应成功");
    assert_eq!(supplied.as_deref(), Some("alice"));
    assert_eq!(applied.as_deref(), Some("alice"));
    assert_eq!(marker("user"), None, "调用线程的上下文不受影响");
    pool.shutdown();
}

#[test]
fn sync_dependents_inherit_context_transitively() {
    let executor = executor(InlineExecutor::new());
    let source: ManagedStage<u32> = executor.new_incomplete_stage();

    MarkerProvider::set("user", Some("bob"));
    let dependent = source
        .then_apply(|value: u32| value + 1)
        .then_apply(|value: u32| (value, marker("user")));
    MarkerProvider::set("user", None);

    let completer = source.clone();
    thread::spawn(move || {
        MarkerProvider::set("user", Some("intruder"));
        completer.complete(1);
        marker("user")
    })
    .join()
    .map(|after| assert_eq!(after.as_deref(), Some("intruder"), "完成线程的上下文应被恢复"))
    .expect("完成线程不应 panic");

    assert_eq!(
        dependent.get_timeout(WAIT).expect("依赖阶段应成功"),
        (2, Some("bob".to_owned()))
    );
}

#[test]
fn exceptionally_recovers_only_failures() {
    let executor = executor(InlineExecutor::new());
    let recovered = executor
        .failed_stage::<u32>(Failure::msg("broken"))
        .exceptionally(|error: ConcurrencyError| match error {
            ConcurrencyError::Execution(_) => 7,
            _ => 0,
        });
    assert_eq!(recovered.get().expect("应被恢复"), 7);

    let untouched = executor
        .completed_stage(3u32)
        .exceptionally(|_: ConcurrencyError| 0);
    assert_eq!(untouched.get().expect("成功值应原样传递"), 3);
}

#[test]
fn failure_skips_value_actions() {
    let executor = executor(InlineExecutor::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let stage = executor
        .supply_async(|| -> spark_concurrent::TaskResult<u32> { Err(Failure::msg("supplier failed")) })
        .then_apply(move |value: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            value
        });
    assert!(matches!(stage.get(), Err(ConcurrencyError::Execution(_))));
    assert!(stage.is_completed_exceptionally());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn handle_sees_both_outcomes() {
    let executor = executor(InlineExecutor::new());
    let failed = executor
        .failed_stage::<u32>(Failure::msg("bad"))
        .handle(|result: ConcurrencyResult<u32>| result.is_err());
    assert!(failed.get().expect("handle 总是产出值"));

    let doubled = executor
        .completed_stage(21u32)
        .handle(|result: ConcurrencyResult<u32>| result.map_or(0, |value| value * 2));
    assert_eq!(doubled.get().expect("handle 总是产出值"), 42);
}

#[test]
fn panicking_action_fails_dependent() {
    let executor = executor(InlineExecutor::new());
    let stage = executor
        .completed_stage(1u32)
        .then_apply(|_: u32| -> u32 { panic!("action exploded") });
    match stage.get() {
        Err(ConcurrencyError::Execution(failure)) => assert!(failure.is_panic()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn when_complete_keeps_source_failure() {
    let executor = executor(InlineExecutor::new());
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&observed);

    let passthrough = executor
        .completed_stage(5u32)
        .when_complete(move |result: &ConcurrencyResult<u32>| {
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    assert_eq!(passthrough.get().expect("结果应原样传递"), 5);
    assert_eq!(observed.load(Ordering::SeqCst), 1);

    let source_failure = executor
        .failed_stage::<u32>(Failure::msg("source failed"))
        .when_complete(|_: &ConcurrencyResult<u32>| panic!("observer failed too"));
    let error = source_failure.get().expect_err("源失败应保留");
    assert!(error.to_string().contains("source failed"));

    let action_failure = executor
        .completed_stage(5u32)
        .when_complete(|_: &ConcurrencyResult<u32>| panic!("observer failed"));
    assert!(matches!(
        action_failure.get(),
        Err(ConcurrencyError::Execution(_))
    ));
}

#[test]
fn combinators_wait_for_both_inputs() {
    let pool = pool(2);
    let executor = executor(pool.clone());
    let left = executor.completed_stage(6u32);
    let right = executor.supply_async(|| {
        thread::sleep(Duration::from_millis(5));
        Ok(7u32)
    });

    let product = left.then_combine(&right, |a: u32, b: u32| a * b);
    assert_eq!(product.get_timeout(WAIT).expect("组合应成功"), 42);

    let seen = Arc::new(AtomicUsize::new(0));
    let (sum_in, runs_in) = (Arc::clone(&seen), Arc::clone(&seen));
    left.then_accept_both(&right, move |a: u32, b: u32| {
        sum_in.fetch_add((a + b) as usize, Ordering::SeqCst);
    })
    .get_timeout(WAIT)
    .expect("accept_both 应成功");
    left.run_after_both(&right, move || {
        runs_in.fetch_add(100, Ordering::SeqCst);
    })
    .get_timeout(WAIT)
    .expect("run_after_both 应成功");
    assert_eq!(seen.load(Ordering::SeqCst), 113);

    let failed = executor.failed_stage::<u32>(Failure::msg("right failed"));
    assert!(matches!(
        left.then_combine(&failed, |a: u32, b: u32| a + b).get(),
        Err(ConcurrencyError::Execution(_))
    ));
    pool.shutdown();
}

#[test]
fn either_combinators_take_first_completion() {
    let executor = executor(InlineExecutor::new());
    let left: ManagedStage<u32> = executor.new_incomplete_stage();
    let right: ManagedStage<u32> = executor.new_incomplete_stage();

    let applied = left.apply_to_either(&right, |value: u32| value * 10);
    let accepted = Arc::new(AtomicUsize::new(0));
    let accept_in = Arc::clone(&accepted);
    let accepting = left.accept_either(&right, move |value: u32| {
        accept_in.store(value as usize, Ordering::SeqCst);
    });
    assert!(!applied.is_done());

    right.complete(4);
    left.complete(9);
    assert_eq!(applied.get().expect("应取先完成者"), 40);
    accepting.get().expect("accept_either 应成功");
    assert_eq!(accepted.load(Ordering::SeqCst), 4);

    let pending: ManagedStage<u32> = executor.new_incomplete_stage();
    let other_type = executor.completed_stage("ready");
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_in = Arc::clone(&ran);
    pending
        .run_after_either(&other_type, move || {
            ran_in.fetch_add(1, Ordering::SeqCst);
        })
        .get()
        .expect("不同值类型也可以竞速");
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn compose_flattens_nested_stages() {
    let pool = pool(2);
    let executor = executor(pool.clone());
    let inner_executor = executor.clone();

    let composed = executor
        .completed_stage(3u32)
        .then_compose(move |value: u32| inner_executor.supply_async(move || Ok(value + 1)));
    assert_eq!(composed.get_timeout(WAIT).expect("组合应成功"), 4);

    let fallback_executor = executor.clone();
    let recovered = executor
        .failed_stage::<u32>(Failure::msg("primary failed"))
        .exceptionally_compose(move |_: ConcurrencyError| fallback_executor.completed_stage(9));
    assert_eq!(recovered.get_timeout(WAIT).expect("应走备用阶段"), 9);
    pool.shutdown();
}

#[test]
fn cancel_propagates_to_dependents() {
    let executor = executor(InlineExecutor::new());
    let source: ManagedStage<u32> = executor.new_incomplete_stage();
    let dependent = source.then_apply(|value: u32| value + 1);

    assert!(source.cancel(true));
    assert!(!source.complete(1), "已取消的阶段不能再完成");
    assert!(source.is_cancelled());
    assert!(matches!(dependent.get(), Err(ConcurrencyError::Cancelled)));
    assert!(dependent.is_cancelled());
}

#[test]
fn external_completion_wins_over_pending_action() {
    let pool = pool(0);
    let executor = executor(pool.clone());
    let stage = executor.supply_async(|| Ok(1u32));
    assert!(stage.complete(2));
    assert_eq!(stage.get().expect("外部完成的值"), 2);
    assert_eq!(stage.join().expect("join 不会再运行被抢先的动作"), 2);
    pool.shutdown();
}

#[test]
fn timeouts_complete_pending_stages() {
    let pool = pool(1);
    let executor = executor(pool.clone());

    let defaulted: ManagedStage<u32> = executor.new_incomplete_stage();
    let defaulted = defaulted.complete_on_timeout(5, Duration::from_millis(10));
    assert_eq!(defaulted.get_timeout(WAIT).expect("超时后取默认值"), 5);

    let expiring: ManagedStage<u32> = executor.new_incomplete_stage();
    let expiring = expiring.or_timeout(Duration::from_millis(10));
    assert!(matches!(
        expiring.get_timeout(WAIT),
        Err(ConcurrencyError::Timeout(_))
    ));

    let done = executor.completed_stage(1u32).or_timeout(Duration::from_millis(1));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(done.get().expect("已完成的阶段不受超时影响"), 1);
    pool.shutdown();
}

#[test]
fn unbounded_get_timeout_waits_for_completion() {
    let executor = executor(InlineExecutor::new());
    let stage: ManagedStage<u32> = executor.new_incomplete_stage();
    let completer = stage.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        completer.complete(9)
    });
    assert_eq!(stage.get_timeout(Duration::MAX).expect("超出时间范围的超时按无限等待"), 9);
    assert!(handle.join().expect("完成线程不应 panic"));
}

#[test]
fn long_then_apply_chain_completes_on_small_stack() {
    const LINKS: u64 = 20_000;
    let executor = executor(InlineExecutor::new());
    let root: ManagedStage<u64> = executor.new_incomplete_stage();
    let mut tail = root.then_apply(|value: u64| value + 1);
    for _ in 1..LINKS {
        tail = tail.then_apply(|value: u64| value + 1);
    }

    let completer = root.clone();
    let completed = thread::Builder::new()
        .stack_size(512 * 1024)
        .spawn(move || completer.complete(0))
        .expect("线程应能创建")
        .join()
        .expect("长依赖链的完成不得溢出调用栈");
    assert!(completed);
    assert_eq!(tail.get_timeout(WAIT).expect("链尾应完成"), LINKS);
}

#[test]
fn obtrude_overwrites_settled_outcome() {
    let executor = executor(InlineExecutor::new());
    let stage = executor.completed_stage(1u32);
    stage.obtrude_value(2);
    assert_eq!(stage.get().expect("强制写入的值"), 2);

    stage.obtrude_exception(Failure::msg("forced"));
    assert!(stage.is_completed_exceptionally());
    assert!(matches!(stage.get(), Err(ConcurrencyError::Execution(_))));
}

#[test]
fn join_runs_unclaimed_action_inline() {
    let pool = pool(0);
    let executor = executor(pool.clone());
    let caller = thread::current().id();

    let supplied = executor.supply_async(move || Ok(thread::current().id() == caller));
    let dependent = supplied.then_apply_async(|inline: bool| inline);
    assert!(supplied.get_timeout(Duration::from_millis(20)).is_err(), "没有工作线程");

    assert!(supplied.join().expect("join 应内联运行"));
    assert!(dependent.join().expect("依赖动作同样可内联"));
    pool.shutdown();
}

#[test]
fn get_now_and_dependents_reflect_state() {
    let executor = executor(InlineExecutor::new());
    let stage: ManagedStage<u32> = executor.new_incomplete_stage();
    assert_eq!(stage.get_now(3).expect("未完成时取默认值"), 3);

    let _first = stage.then_apply(|value: u32| value);
    let _second = stage.then_run(|| {});
    assert_eq!(stage.number_of_dependents(), 2);

    stage.complete(8);
    assert_eq!(stage.get_now(3).expect("已完成时取真实值"), 8);
    assert_eq!(stage.number_of_dependents(), 0);
}

#[test]
fn capture_failure_rejects_stage() {
    let executor = executor_with_provider(InlineExecutor::new(), MarkerProvider::failing_capture("user"));
    let supplied = executor.supply_async(|| Ok(1u32));
    assert!(matches!(supplied.get(), Err(ConcurrencyError::Rejected { .. })));

    let dependent = executor.completed_stage(1u32).then_apply(|value: u32| value);
    assert!(matches!(dependent.get(), Err(ConcurrencyError::Rejected { .. })));
}

#[test]
fn apply_failure_aborts_action() {
    let executor = executor_with_provider(InlineExecutor::new(), MarkerProvider::failing_apply("user"));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let stage = executor.supply_async(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(1u32)
    });
    assert!(matches!(stage.get(), Err(ConcurrencyError::Aborted(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn contextualized_action_keeps_bound_snapshot() {
    let pool = pool(1);
    let executor = executor(pool.clone());
    let plain: Arc<dyn NativeExecutor> = pool.clone();

    MarkerProvider::set("user", Some("carol"));
    let action = executor
        .contextualize(|value: u32| (value, marker("user")))
        .expect("捕获应成功");
    assert!(action.is_contextual());
    MarkerProvider::set("user", Some("dave"));

    let stage = executor
        .completed_stage(1u32)
        .then_apply_async_on(action, &StageExecutor::from(plain.clone()));
    assert_eq!(
        stage.get_timeout(WAIT).expect("动作应成功"),
        (1, Some("carol".to_owned()))
    );

    let recaptured = executor
        .completed_stage(2u32)
        .then_apply_async_on(
            StageAction::plain(|value: u32| (value, marker("user"))),
            &StageExecutor::from(plain),
        );
    assert_eq!(
        recaptured.get_timeout(WAIT).expect("动作应成功"),
        (2, Some("dave".to_owned()))
    );
    MarkerProvider::set("user", None);
    pool.shutdown();
}

#[test]
fn delayed_executor_postpones_async_actions() {
    let pool = pool(1);
    let executor = executor(pool.clone());
    let delayed = executor.delayed_executor(Duration::from_millis(40));
    assert_eq!(delayed.name(), "test-pool");

    MarkerProvider::set("user", Some("erin"));
    let started = Instant::now();
    let stage = executor.completed_stage(1u32).then_apply_async_on(
        StageAction::plain(|value: u32| (value + 1, marker("user"))),
        &delayed,
    );
    MarkerProvider::set("user", None);
    assert!(!stage.is_done(), "延迟期间动作不应运行");

    let (value, seen) = stage.get_timeout(WAIT).expect("动作应在延迟后运行");
    assert!(started.elapsed() >= Duration::from_millis(40));
    assert_eq!(value, 2);
    assert_eq!(seen.as_deref(), Some("erin"), "延迟执行仍施加注册时的上下文");
    pool.shutdown();
}

#[test]
fn stage_can_be_awaited() {
    let pool = pool(1);
    let executor = executor(pool.clone());
    let stage = executor.supply_async(|| {
        thread::sleep(Duration::from_millis(5));
        Ok(5u32)
    });
    let value = futures::executor::block_on(async move { stage.await });
    assert_eq!(value.expect("await 应得到结果"), 5);
    pool.shutdown();
}

#[test]
fn minimal_view_and_copies_are_independent() {
    let executor = executor(InlineExecutor::new());
    let stage: ManagedStage<u32> = executor.new_incomplete_stage();
    let minimal = stage.minimal();
    let copy = stage.copy();

    assert!(minimal.to_stage().complete(100));
    assert!(copy.complete(200));
    assert!(!stage.is_done(), "副本的完成不影响原阶段");
    assert!(!minimal.is_done());

    let incremented = minimal.then_apply(|value: u32| value + 1);
    let combined = executor
        .completed_stage(10u32)
        .then_combine(&minimal, |a: u32, b: u32| a + b);
    stage.complete(1);

    assert_eq!(incremented.to_stage().get().expect("最小视图应随原阶段完成"), 2);
    assert_eq!(combined.get().expect("最小视图可作为组合输入"), 11);
    assert_eq!(minimal.default_executor().name(), executor.name());
}

#[test]
fn failed_copy_follows_source_failure() {
    let executor = executor(InlineExecutor::new());
    let stage: ManagedStage<u32> = executor.new_incomplete_stage();
    let copy = stage.copy();
    stage.complete_exceptionally(Failure::msg("source failed"));
    assert!(copy.is_completed_exceptionally());
}
