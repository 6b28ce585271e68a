//! 固定速率调度的时间槽算术。
//!
//! # 教案式说明
//! - **意图 (Why)**：固定速率任务的每次运行都应落在 `anchor + initial + k * period` 的时间槽上；
//!   某次运行超时后如果简单地"上次计划时间 + 周期"，会连续补跑积压的槽位并持续漂移。
//! - **契约 (What)**：
//!   - 下一个计划时间 = 上一个计划时间 + 周期，只要它仍在未来；
//!   - 否则跳到严格晚于当前时刻的第一个对齐槽：`first + period * (floor(elapsed / period) + 1)`，
//!     其中 `first = anchor + initial`，`elapsed = now - first`；
//!   - 当前时刻早于首个槽位（理论上不会发生）时回落到首个槽位之后的下一槽；
//!   - 任何槽位超出 `Instant` 可表示范围时返回 `None`，由调用方结束调度。

use std::time::{Duration, Instant};

/// 固定速率游标，记录首个槽位与上一个计划时间。
#[derive(Clone, Copy, Debug)]
pub(crate) struct RateCursor {
    first: Instant,
    period: Duration,
    next: Instant,
}

impl RateCursor {
    /// 首个槽位溢出时返回 `None`。
    pub(crate) fn new(anchor: Instant, initial: Duration, period: Duration) -> Option<Self> {
        let first = anchor.checked_add(initial)?;
        Some(Self {
            first,
            period,
            next: first,
        })
    }

    pub(crate) fn first(&self) -> Instant {
        self.first
    }

    /// 推进到下一个计划时间并返回它；溢出时游标保持不变。
    pub(crate) fn advance(&mut self, now: Instant) -> Option<Instant> {
        let projected = self.next.checked_add(self.period)?;
        let next = if projected > now {
            projected
        } else {
            aligned_slot_after(self.first, self.period, now)?
        };
        self.next = next;
        Some(next)
    }
}

/// 严格晚于 `now` 的第一个对齐槽。
pub(crate) fn aligned_slot_after(first: Instant, period: Duration, now: Instant) -> Option<Instant> {
    debug_assert!(!period.is_zero(), "period must be positive");
    let Some(elapsed) = now.checked_duration_since(first) else {
        debug_assert!(false, "current time precedes the first fixed-rate slot");
        return first.checked_add(period);
    };
    let period_nanos = period.as_nanos().max(1);
    let slots = elapsed.as_nanos() / period_nanos + 1;
    let offset = period_nanos.checked_mul(slots)?;
    let secs = u64::try_from(offset / NANOS_PER_SEC).ok()?;
    let nanos = u32::try_from(offset % NANOS_PER_SEC).ok()?;
    first.checked_add(Duration::new(secs, nanos))
}

const NANOS_PER_SEC: u128 = 1_000_000_000;
