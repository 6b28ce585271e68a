//! 协作式中断。
//!
//! # 教案式说明
//! - **意图 (Why)**：`cancel(true)` 需要"打断"正在运行的任务，但 Rust 无法安全地强行终止线程；
//!   因此把中断建模为线程本地可见的标志位，由任务体自行轮询。
//! - **契约 (What)**：
//!   - 任务体内调用 [`is_interrupted`] / [`check`] 观察当前任务是否被带中断地取消；
//!   - [`sleep`] 是可被中断的睡眠：取消时提前返回 `Err`；
//!   - 不在托管任务中调用时，标志永远为假。
//! - **实现提示 (How)**：执行线程运行任务体前通过 [`enter`] 安装任务的标志，守卫析构时恢复外层标志，
//!   以支持内联执行器上的嵌套任务。

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Failure, TaskResult};

thread_local! {
    static CURRENT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// 当前托管任务是否已被带中断地取消。
pub fn is_interrupted() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    })
}

/// 被中断时返回 `Err`，便于在任务体中以 `?` 提前退出。
pub fn check() -> TaskResult<()> {
    if is_interrupted() {
        Err(Failure::msg("task interrupted"))
    } else {
        Ok(())
    }
}

/// 可中断睡眠：完整睡眠返回 `Ok`，被中断时提前返回 `Err`。
///
/// 超出 `Instant` 可表示范围的时长只能被中断结束。
pub fn sleep(duration: Duration) -> TaskResult<()> {
    let deadline = Instant::now().checked_add(duration);
    loop {
        check()?;
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                (deadline - now).min(POLL_SLICE)
            }
            None => POLL_SLICE,
        };
        thread::park_timeout(slice);
    }
}

/// 睡眠期间轮询中断标志的最长间隔。
const POLL_SLICE: Duration = Duration::from_millis(10);

pub(crate) struct InterruptScope {
    previous: Option<Arc<AtomicBool>>,
}

pub(crate) fn enter(flag: Arc<AtomicBool>) -> InterruptScope {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(flag));
    InterruptScope { previous }
}

impl Drop for InterruptScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}
