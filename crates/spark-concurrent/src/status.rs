//! # 任务状态机
//!
//! ## 角色定位（Why）
//! - 任务从提交到终态会被多个线程同时触碰：提交线程、执行线程、取消调用方、`get` 等待者；
//!   所有迁移必须以 CAS 完成，任何一方都不能"覆盖"另一方已经落定的结果。
//!
//! ## 契约（What）
//! - 合法迁移：`None → Submitted → Starting → Started → Done`；
//!   `Submitted/Starting → Aborted`；`Starting → Skipped`；任意非终态 `→ Cancelled`；
//! - 终态集合为 `{Done, Aborted, Cancelled, Skipped}`，进入终态后不再变化；
//! - 周期任务额外携带三态的 [`HasNext`]：只有在本次尝试的去向确定后才从 `Unknown` 落定。
//!
//! ## 实现提示（How）
//! - [`StatusCell`] 是纯原子核心，启用 `--cfg loom` 时切换为 Loom 原子类型以便模型检查；
//! - [`TaskStatus`] 在其上叠加一次性结果槽、完成闩锁与执行线程标记（用于自调用检测与协作式中断）。

#[cfg(not(any(loom, spark_loom)))]
use std::sync::atomic::{AtomicU8, Ordering};

#[cfg(any(loom, spark_loom))]
use loom::sync::atomic::{AtomicU8, Ordering};

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, Thread};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::{ConcurrencyError, ConcurrencyResult, Failure};

/// 任务生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    None = 0,
    Submitted = 1,
    Starting = 2,
    Started = 3,
    Done = 4,
    Aborted = 5,
    Cancelled = 6,
    Skipped = 7,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::None,
            1 => TaskState::Submitted,
            2 => TaskState::Starting,
            3 => TaskState::Started,
            4 => TaskState::Done,
            5 => TaskState::Aborted,
            6 => TaskState::Cancelled,
            _ => TaskState::Skipped,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Aborted | TaskState::Cancelled | TaskState::Skipped
        )
    }

    /// 任务体是否可能已经在执行线程上开始。
    pub fn is_running(self) -> bool {
        matches!(self, TaskState::Starting | TaskState::Started)
    }
}

/// 周期任务"是否还有下一次"的三态标记。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HasNext {
    Unknown = 0,
    Yes = 1,
    No = 2,
}

impl HasNext {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => HasNext::Unknown,
            1 => HasNext::Yes,
            _ => HasNext::No,
        }
    }
}

/// 状态机的原子核心。
///
/// # 教案式说明
/// - **意图 (Why)**：把"谁赢得迁移"的判定压缩到两个字节的 CAS 上，便于 Loom 穷举交错。
/// - **契约 (What)**：
///   - [`StatusCell::transition`] 仅当当前状态等于 `from` 时迁移；
///   - [`StatusCell::cancel`] 从任意非终态迁移到 `Cancelled`，成功时返回之前的状态，失败时返回观察到的终态；
///   - [`StatusCell::resolve_has_next`] 只允许从 `Unknown` 落定一次。
#[derive(Debug)]
pub struct StatusCell {
    state: AtomicU8,
    has_next: AtomicU8,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TaskState::None as u8),
            has_next: AtomicU8::new(HasNext::Unknown as u8),
        }
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn has_next(&self) -> HasNext {
        HasNext::from_u8(self.has_next.load(Ordering::Acquire))
    }

    pub fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cancel(&self) -> Result<TaskState, TaskState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let observed = TaskState::from_u8(current);
            if observed.is_terminal() {
                return Err(observed);
            }
            match self.state.compare_exchange(
                current,
                TaskState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(observed),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn resolve_has_next(&self, value: HasNext) -> bool {
        self.has_next
            .compare_exchange(
                HasNext::Unknown as u8,
                value as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次性打开的闩锁。
#[derive(Debug, Default)]
pub(crate) struct Latch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.cond.notify_all();
    }

    /// 等待闩锁打开；到达截止时间仍未打开时返回 `false`。
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut open = self.open.lock();
        while !*open {
            match deadline {
                None => self.cond.wait(&mut open),
                Some(deadline) => {
                    if self.cond.wait_until(&mut open, deadline).timed_out() {
                        return *open;
                    }
                }
            }
        }
        true
    }
}

/// 完整的任务状态：原子核心 + 结果槽 + 闩锁 + 执行线程标记。
pub(crate) struct TaskStatus<T> {
    cell: StatusCell,
    outcome: Mutex<Option<ConcurrencyResult<T>>>,
    latch: Latch,
    runner: Mutex<Option<Thread>>,
    interrupt: Arc<AtomicBool>,
    notified: AtomicBool,
}

impl<T> TaskStatus<T> {
    pub(crate) fn new() -> Self {
        Self {
            cell: StatusCell::new(),
            outcome: Mutex::new(None),
            latch: Latch::default(),
            runner: Mutex::new(None),
            interrupt: Arc::new(AtomicBool::new(false)),
            notified: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub(crate) fn has_next(&self) -> HasNext {
        self.cell.has_next()
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.cell.transition(from, to)
    }

    /// 取消：成功时返回之前的状态。
    ///
    /// 取消会落定 `HasNext::No`、打开闩锁；若任务体可能正在运行且 `interrupt` 为真，则置位中断标记并唤醒执行线程。
    pub(crate) fn cancel(&self, interrupt: bool) -> Result<TaskState, TaskState> {
        let previous = self.cell.cancel()?;
        self.cell.resolve_has_next(HasNext::No);
        if interrupt && previous.is_running() {
            self.interrupt.store(true, std::sync::atomic::Ordering::Release);
            if let Some(runner) = self.runner.lock().as_ref() {
                runner.unpark();
            }
        }
        self.latch.open();
        Ok(previous)
    }

    /// 写入结果并迁移到终态 `to`；若迁移失败（通常是并发取消）返回 `false`，结果被丢弃。
    pub(crate) fn finish(
        &self,
        from: TaskState,
        to: TaskState,
        outcome: ConcurrencyResult<T>,
        has_next: HasNext,
    ) -> bool {
        debug_assert!(to.is_terminal() && to != TaskState::Cancelled);
        {
            let mut slot = self.outcome.lock();
            if !self.cell.transition(from, to) {
                return false;
            }
            *slot = Some(outcome);
        }
        self.cell.resolve_has_next(has_next);
        self.latch.open();
        true
    }

    pub(crate) fn await_terminal(&self, deadline: Option<Instant>) -> bool {
        self.latch.wait(deadline)
    }

    /// 终态结果；`Cancelled` 优先于任何已记录的结果。
    pub(crate) fn result(&self) -> ConcurrencyResult<T>
    where
        T: Clone,
    {
        if self.cell.state() == TaskState::Cancelled {
            return Err(ConcurrencyError::Cancelled);
        }
        match self.outcome.lock().as_ref() {
            Some(outcome) => outcome.clone(),
            None => Err(ConcurrencyError::Aborted(Failure::msg(
                "task reached a terminal state without an outcome",
            ))),
        }
    }

    pub(crate) fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// 将当前线程登记为执行线程，守卫析构时撤销登记。
    pub(crate) fn enter_runner(&self) -> RunnerScope<'_> {
        let previous = self.runner.lock().replace(thread::current());
        RunnerScope {
            slot: &self.runner,
            previous,
        }
    }

    pub(crate) fn is_runner_current(&self) -> bool {
        self.runner
            .lock()
            .as_ref()
            .is_some_and(|runner| runner.id() == thread::current().id())
    }

    /// 抢占终态通知权：保证 `on_aborted`/`on_done` 在每次尝试上只发一次。
    pub(crate) fn claim_notification(&self) -> bool {
        !self.notified.swap(true, std::sync::atomic::Ordering::AcqRel)
    }
}

pub(crate) struct RunnerScope<'a> {
    slot: &'a Mutex<Option<Thread>>,
    previous: Option<Thread>,
}

impl Drop for RunnerScope<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = self.previous.take();
    }
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_wins_over_later_completion() {
        let status = TaskStatus::<u32>::new();
        assert!(status.transition(TaskState::None, TaskState::Submitted));
        assert!(status.transition(TaskState::Submitted, TaskState::Starting));
        assert!(status.transition(TaskState::Starting, TaskState::Started));

        assert_eq!(status.cancel(false), Ok(TaskState::Started));
        assert!(
            !status.finish(TaskState::Started, TaskState::Done, Ok(7), HasNext::No),
            "取消之后的完成必须失败"
        );
        assert!(matches!(status.result(), Err(ConcurrencyError::Cancelled)));
        assert_eq!(status.cancel(false), Err(TaskState::Cancelled), "取消是幂等的");
    }

    #[test]
    fn cancel_after_done_is_rejected() {
        let status = TaskStatus::<u32>::new();
        status.transition(TaskState::None, TaskState::Submitted);
        status.transition(TaskState::Submitted, TaskState::Starting);
        status.transition(TaskState::Starting, TaskState::Started);
        assert!(status.finish(TaskState::Started, TaskState::Done, Ok(7), HasNext::Yes));

        assert_eq!(status.cancel(true), Err(TaskState::Done));
        assert_eq!(status.has_next(), HasNext::Yes);
        assert_eq!(status.result().ok(), Some(7));
    }

    #[test]
    fn has_next_resolves_once() {
        let cell = StatusCell::new();
        assert!(cell.resolve_has_next(HasNext::No));
        assert!(!cell.resolve_has_next(HasNext::Yes));
        assert_eq!(cell.has_next(), HasNext::No);
    }

    #[test]
    fn latch_wait_times_out() {
        let status = TaskStatus::<()>::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!status.await_terminal(Some(deadline)));
    }

    #[test]
    fn notification_is_claimed_once() {
        let status = TaskStatus::<()>::new();
        assert!(status.claim_notification());
        assert!(!status.claim_notification());
    }
}
