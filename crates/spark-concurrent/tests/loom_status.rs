#![cfg(any(loom, spark_loom))]

use loom::{model, sync::Arc, thread};
use spark_concurrent::{HasNext, StatusCell, TaskState};

#[test]
fn cancel_and_finish_have_exactly_one_winner() {
    //
    // 教案级说明：执行线程完成与外部取消在同一尝试上竞争。
    // - **Why**：两者都试图把状态推进到终态，若 CAS 语义有误会出现"既完成又取消"的结果。
    // - **How**：执行线程尝试 `Started → Done`，取消线程调用 `cancel`；Loom 穷举两者的所有交错。
    // - **What**：恰好一方获胜，最终状态与获胜方一致。
    model(|| {
        let cell = Arc::new(StatusCell::new());
        assert!(cell.transition(TaskState::None, TaskState::Submitted));
        assert!(cell.transition(TaskState::Submitted, TaskState::Starting));
        assert!(cell.transition(TaskState::Starting, TaskState::Started));

        let runner = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.transition(TaskState::Started, TaskState::Done))
        };
        let canceller = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.cancel().is_ok())
        };

        let finished = runner.join().expect("执行线程不应 panic");
        let cancelled = canceller.join().expect("取消线程不应 panic");
        assert!(finished ^ cancelled, "完成与取消必须恰有一方成功");
        let expected = if finished {
            TaskState::Done
        } else {
            TaskState::Cancelled
        };
        assert_eq!(cell.state(), expected);
    });
}

#[test]
fn concurrent_cancels_succeed_once() {
    //
    // 教案级说明：多个调用方同时取消尚未开始的任务。
    // - **Why**：只有第一次取消负责发出终态通知，重复成功会导致 `on_done` 被发两次。
    // - **What**：两次 `cancel` 中恰有一次返回 `Ok(Submitted)`，另一次观察到 `Cancelled`。
    model(|| {
        let cell = Arc::new(StatusCell::new());
        assert!(cell.transition(TaskState::None, TaskState::Submitted));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || cell.cancel())
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("取消线程不应 panic"))
            .collect();

        assert_eq!(
            results.iter().filter(|result| result.is_ok()).count(),
            1,
            "只有一次取消可以成功"
        );
        assert!(results.contains(&Ok(TaskState::Submitted)));
        assert!(results.contains(&Err(TaskState::Cancelled)));
        assert_eq!(cell.state(), TaskState::Cancelled);
    });
}

#[test]
fn has_next_resolves_once() {
    //
    // 教案级说明：重新调度方与取消方同时落定 `HasNext`。
    // - **Why**：等待者依据 `HasNext` 判断调度是否结束，值被改写会让 `get` 提前返回或永久阻塞。
    // - **What**：第一次落定的值保持不变，第二次落定返回 `false`。
    model(|| {
        let cell = Arc::new(StatusCell::new());
        let rescheduler = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.resolve_has_next(HasNext::Yes))
        };
        let canceller = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || cell.resolve_has_next(HasNext::No))
        };

        let yes = rescheduler.join().expect("线程不应 panic");
        let no = canceller.join().expect("线程不应 panic");
        assert!(yes ^ no);
        let expected = if yes { HasNext::Yes } else { HasNext::No };
        assert_eq!(cell.has_next(), expected);
    });
}
