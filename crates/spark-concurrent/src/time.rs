//! 时间来源抽象。
//!
//! # 教案式说明
//! - **意图 (Why)**：固定速率的漂移修正、`delay()` 与 `LastExecution` 的时间戳都依赖"当前时间"；
//!   直接调用系统时钟会让这些计算难以在测试中复现，因此以 [`Clock`] 注入。
//! - **契约 (What)**：`now` 返回单调时间，用于固定速率/固定延迟的算术；`wall_now` 返回墙钟时间，
//!   用于触发器（`Trigger`）的日历语义。
//! - **实现提示 (How)**：生产环境使用 [`SystemClock`]；测试注入 [`MockClock`] 并调用 `advance` 推进。

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

/// 可注入的时钟。
pub trait Clock: Send + Sync + 'static {
    /// 单调时间点。
    fn now(&self) -> Instant;

    /// 墙钟时间。
    fn wall_now(&self) -> SystemTime;
}

/// 委托给标准库的系统时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// 可手动推进的虚拟时钟。
///
/// # 契约说明（What）
/// - 构造时记录一个起点（单调与墙钟各一个），此后只有 [`MockClock::advance`] 会改变读数；
/// - 克隆共享同一内部状态，便于测试线程与被测组件观察到一致的时间；
/// - 底层执行器的真实延迟不受影响，本时钟只作用于运行时自身的时间计算。
#[derive(Clone, Debug)]
pub struct MockClock {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug)]
struct MockState {
    origin: Instant,
    wall_origin: SystemTime,
    elapsed: Duration,
}

impl MockClock {
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// 以指定的墙钟时间为起点构造。
    pub fn starting_at(wall_origin: SystemTime) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                origin: Instant::now(),
                wall_origin,
                elapsed: Duration::ZERO,
            })),
        }
    }

    /// 将时间向前推进 `delta`。
    pub fn advance(&self, delta: Duration) {
        let mut state = self.state.lock();
        state.elapsed = state.elapsed.saturating_add(delta);
    }

    /// 自构造以来推进的总时长。
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }
}

/// 从现在起 `timeout` 之后的截止时间；超出 `Instant` 可表示范围时返回 `None`，按无限等待处理。
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        let state = self.state.lock();
        state.origin + state.elapsed
    }

    fn wall_now(&self) -> SystemTime {
        let state = self.state.lock();
        state.wall_origin + state.elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_moves_only_when_advanced() {
        let clock = MockClock::starting_at(SystemTime::UNIX_EPOCH);
        let start = clock.now();
        assert_eq!(clock.now(), start, "未推进前读数必须保持不变");

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(
            clock.wall_now(),
            SystemTime::UNIX_EPOCH + Duration::from_millis(250)
        );

        let shared = clock.clone();
        shared.advance(Duration::from_millis(750));
        assert_eq!(clock.elapsed(), Duration::from_secs(1), "克隆应共享同一时间线");
    }

    #[test]
    fn huge_timeouts_have_no_deadline() {
        assert!(deadline_after(Duration::from_millis(5)).is_some());
        assert!(deadline_after(Duration::MAX).is_none());
    }
}
