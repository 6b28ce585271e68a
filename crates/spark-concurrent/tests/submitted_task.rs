//! 一次性托管任务的生命周期契约。
//!
//! # 教案级导览
//!
//! - **Why**：一次性任务是其余能力的基础，监听器顺序、取消的幂等性与拒绝路径必须在各种竞争下保持一致。
//! - **How**：以线程池桩与内联执行器驱动真实提交流程，用 `RecordingListener` 记录通知序列后断言。
//! - **What**：覆盖成功、任务体失败、监听器取消/失败、底层拒绝、协作式中断、自调用 `get` 与批量提交。

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use spark_concurrent::test_stubs::{InlineExecutor, ListenerEvent, RecordingListener};
use spark_concurrent::{
    ConcurrencyError, Failure, ManagedFuture, ManagedTask, TaskState, interrupt,
};

use support::{WAIT, executor, executor_with_listener, pool};

#[test]
fn successful_task_notifies_in_order() {
    let listener = RecordingListener::new();
    let pool = pool(2);
    let executor = executor_with_listener(pool.clone(), listener.clone());

    let future = executor.submit(|| Ok(21 * 2)).expect("提交应成功");
    assert_eq!(future.get().expect("任务应成功"), 42);
    assert!(listener.wait_for("done", 1, WAIT));

    assert_eq!(listener.names(), ["submitted", "starting", "done"]);
    assert_eq!(
        listener.events().last(),
        Some(&ListenerEvent::Done {
            attempt: 1,
            code: None
        })
    );
    assert_eq!(future.state(), TaskState::Done);
    assert!(future.is_done());
    assert!(!future.is_cancelled());
    pool.shutdown();
}

#[test]
fn body_failure_is_reported_as_execution_error() {
    let listener = RecordingListener::new();
    let executor = executor_with_listener(InlineExecutor::new(), listener.clone());

    let future: ManagedFuture<u32> = executor
        .submit(|| Err(Failure::msg("boom")))
        .expect("提交应成功");
    let error = future.get().expect_err("任务体失败必须透出");
    assert!(matches!(error, ConcurrencyError::Execution(_)));
    assert!(error.to_string().contains("boom"));
    assert_eq!(listener.names(), ["submitted", "starting", "done"]);
    assert_eq!(future.state(), TaskState::Done);
}

#[test]
fn panicking_body_is_captured() {
    let executor = executor(InlineExecutor::new());
    let future: ManagedFuture<()> = executor
        .submit(|| panic!("body exploded"))
        .expect("提交应成功");
    match future.get() {
        Err(ConcurrencyError::Execution(failure)) => assert!(failure.is_panic()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn listener_cancel_during_submission_rejects() {
    let listener = RecordingListener::cancelling_on_submitted();
    let executor = executor_with_listener(InlineExecutor::new(), listener.clone());
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    let error = executor
        .submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect_err("提交阶段被取消应拒绝");
    assert!(matches!(error, ConcurrencyError::Rejected { .. }));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(listener.names(), ["submitted", "aborted", "done"]);
}

#[test]
fn listener_failure_during_submission_rejects() {
    let listener = RecordingListener::failing_on_submitted();
    let executor = executor_with_listener(InlineExecutor::new(), listener.clone());

    let error = executor.submit(|| Ok(1)).expect_err("监听器失败应拒绝提交");
    assert!(matches!(error, ConcurrencyError::Rejected { .. }));
    assert_eq!(listener.names(), ["submitted", "aborted", "done"]);
}

#[test]
fn listener_cancel_during_starting_skips_body() {
    let listener = RecordingListener::cancelling_on_starting();
    let executor = executor_with_listener(InlineExecutor::new(), listener.clone());
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);

    let future = executor
        .submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("提交应成功");
    assert!(matches!(future.get(), Err(ConcurrencyError::Cancelled)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(listener.names(), ["submitted", "starting", "aborted", "done"]);
    assert_eq!(
        listener.events()[2],
        ListenerEvent::Aborted {
            attempt: 1,
            code: ConcurrencyError::Cancelled.code()
        }
    );
}

#[test]
fn listener_failure_during_starting_aborts() {
    let listener = RecordingListener::failing_on_starting();
    let executor = executor_with_listener(InlineExecutor::new(), listener.clone());

    let future = executor.submit(|| Ok(1)).expect("提交应成功");
    assert!(matches!(future.get(), Err(ConcurrencyError::Aborted(_))));
    assert_eq!(future.state(), TaskState::Aborted);
    assert_eq!(listener.names(), ["submitted", "starting", "aborted", "done"]);
}

#[test]
fn panicking_listener_does_not_corrupt_state() {
    let listener = RecordingListener::panicking_on_done();
    let executor = executor_with_listener(InlineExecutor::new(), listener.clone());

    let future = executor.submit(|| Ok("ok")).expect("提交应成功");
    assert_eq!(future.get().expect("监听器失败不影响结果"), "ok");
    assert_eq!(listener.count("done"), 1);
}

#[test]
fn shut_down_pool_rejects_with_notifications() {
    let listener = RecordingListener::new();
    let pool = pool(1);
    pool.shutdown();
    let executor = executor_with_listener(pool.clone(), listener.clone());

    let error = executor.submit(|| Ok(1)).expect_err("已关闭的线程池必须拒绝");
    assert!(matches!(error, ConcurrencyError::Rejected { .. }));
    assert_eq!(listener.names(), ["submitted", "aborted", "done"]);
}

#[test]
fn work_discarded_by_shutdown_is_rejected() {
    let listener = RecordingListener::new();
    let pool = pool(0);
    let executor = executor_with_listener(pool.clone(), listener.clone());

    let future = executor.submit(|| Ok(1)).expect("排队的提交应成功");
    assert_eq!(pool.queued(), 1);
    pool.shutdown();

    let error = future.get_timeout(WAIT).expect_err("被丢弃的工作不得悬挂");
    assert!(matches!(error, ConcurrencyError::Rejected { .. }));
    assert_eq!(future.state(), TaskState::Aborted);
    assert_eq!(listener.names(), ["submitted", "aborted", "done"]);
}

#[test]
fn cancel_before_start_is_idempotent() {
    let listener = RecordingListener::new();
    let pool = pool(0);
    let executor = executor_with_listener(pool.clone(), listener.clone());

    let future = executor.submit(|| Ok(1)).expect("提交应成功");
    assert!(future.cancel(false), "第一次取消应生效");
    assert!(!future.cancel(false), "重复取消应返回 false");
    assert!(future.is_cancelled());
    assert!(matches!(future.get(), Err(ConcurrencyError::Cancelled)));
    assert_eq!(listener.names(), ["submitted", "aborted", "done"]);
    pool.shutdown();
}

#[test]
fn interrupting_cancel_wakes_sleeping_body() {
    let listener = RecordingListener::new();
    let pool = pool(1);
    let executor = executor_with_listener(pool.clone(), listener.clone());

    let future = executor
        .submit(|| {
            interrupt::sleep(Duration::from_secs(30))?;
            Ok(())
        })
        .expect("提交应成功");
    assert!(listener.wait_for("starting", 1, WAIT));
    thread::sleep(Duration::from_millis(20));

    assert!(future.cancel(true));
    assert!(matches!(
        future.get_timeout(WAIT),
        Err(ConcurrencyError::Cancelled)
    ));
    assert!(listener.wait_for("done", 1, WAIT));
    assert_eq!(listener.names(), ["submitted", "starting", "aborted", "done"]);
    pool.shutdown();
}

#[test]
fn get_from_running_thread_is_interrupted() {
    let pool = pool(1);
    let executor = executor(pool.clone());
    let cell: Arc<OnceLock<ManagedFuture<bool>>> = Arc::new(OnceLock::new());
    let inner = Arc::clone(&cell);

    let future = executor
        .submit(move || {
            let own = loop {
                if let Some(own) = inner.get() {
                    break own.clone();
                }
                thread::yield_now();
            };
            Ok(matches!(own.get(), Err(ConcurrencyError::Interrupted(_))))
        })
        .expect("提交应成功");
    let _ = cell.set(future.clone());

    assert!(future.get_timeout(WAIT).expect("任务应结束"), "自调用 get 必须立即返回 Interrupted");
    pool.shutdown();
}

#[test]
fn get_timeout_expires_for_unstarted_task() {
    let pool = pool(0);
    let executor = executor(pool.clone());
    let future = executor.submit(|| Ok(1)).expect("提交应成功");
    assert!(matches!(
        future.get_timeout(Duration::from_millis(20)),
        Err(ConcurrencyError::Timeout(_))
    ));
    pool.shutdown();
}

#[test]
fn unbounded_get_timeout_waits_for_result() {
    let pool = pool(1);
    let executor = executor(pool.clone());
    let future = executor
        .submit(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(1)
        })
        .expect("提交应成功");
    assert_eq!(future.get_timeout(Duration::MAX).expect("超出时间范围的超时按无限等待"), 1);
    pool.shutdown();
}

#[test]
fn managed_task_carries_identity_and_listener() {
    let listener = RecordingListener::new();
    let executor = executor(InlineExecutor::new());

    let task = ManagedTask::new(|| Ok(7))
        .with_identity_name("nightly-report")
        .with_listener(listener.clone());
    let future = executor.submit_task(task).expect("提交应成功");
    assert_eq!(future.identity(), "nightly-report");
    assert_eq!(future.get().expect("任务应成功"), 7);
    assert_eq!(listener.names(), ["submitted", "starting", "done"]);
}

#[test]
fn submit_runnable_returns_given_result() {
    let executor = executor(InlineExecutor::new());
    let future = executor
        .submit_runnable(|| Ok(()), "finished")
        .expect("提交应成功");
    assert_eq!(future.get().expect("任务应成功"), "finished");
    executor.execute(|| {}).expect("execute 应成功");
}

#[test]
fn invoke_all_waits_for_every_task() {
    let pool = pool(3);
    let executor = executor(pool.clone());
    let futures = executor
        .invoke_all((0..5u64).map(|n| {
            move || {
                thread::sleep(Duration::from_millis(5));
                Ok(n * n)
            }
        }))
        .expect("批量提交应成功");
    assert!(futures.iter().all(ManagedFuture::is_done));
    let values: Vec<u64> = futures
        .iter()
        .map(|future| future.get().expect("任务应成功"))
        .collect();
    assert_eq!(values, [0, 1, 4, 9, 16]);
    pool.shutdown();
}

#[test]
fn invoke_any_returns_first_success() {
    let pool = pool(3);
    let executor = executor(pool.clone());
    let bodies: Vec<Box<dyn FnOnce() -> spark_concurrent::TaskResult<&'static str> + Send>> = vec![
        Box::new(|| Err(Failure::msg("first fails"))),
        Box::new(|| {
            thread::sleep(Duration::from_millis(10));
            Ok("winner")
        }),
        Box::new(|| {
            interrupt::sleep(Duration::from_secs(30))?;
            Ok("too slow")
        }),
    ];
    assert_eq!(executor.invoke_any(bodies).expect("应有任务成功"), "winner");
    pool.shutdown();
}

#[test]
fn invoke_any_reports_failure_when_all_fail() {
    let executor = executor(InlineExecutor::new());
    let error = executor
        .invoke_any((0..3).map(|n| move || -> spark_concurrent::TaskResult<u32> {
            Err(Failure::msg(format!("failure {n}")))
        }))
        .expect_err("全部失败时应返回错误");
    assert!(matches!(error, ConcurrencyError::Execution(_)));
}
