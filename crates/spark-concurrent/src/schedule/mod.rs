//! # schedule 模块说明
//!
//! ## 角色定位（Why）
//! - 周期任务由一串"尝试"组成：每次尝试都有独立的状态机与监听器通知，而调用方只持有一个
//!   [`ManagedScheduledFuture`]，它始终指向当前尝试；
//! - 前一次尝试落定之后才会提交下一次，同一调度的两次尝试永不重叠。
//!
//! ## 契约（What）
//! - `FixedDelay`：上一次结束后等待 `delay`；
//! - `FixedRate`：对齐到 `anchor + initial + k * period` 的槽位，超时后跳到下一个未来槽位而不是补跑；
//! - `Triggered`：由 [`Trigger`] 决定下一次时间与是否跳过；
//! - 取消与重新调度的竞争用三态 `HasNext` 加有界重试解决。

mod rate;
mod task;
mod trigger;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConcurrencyError, ConcurrencyResult};

pub(crate) use task::{RepeatBody, ScheduledTask};
pub use task::ManagedScheduledFuture;
pub use trigger::{LastExecution, Trigger};

/// 调度方式。
#[derive(Clone)]
pub enum Schedule {
    /// 延迟后运行一次。
    Once { delay: Duration },
    /// 首次延迟 `initial`，之后每次结束后等待 `delay`。
    FixedDelay { initial: Duration, delay: Duration },
    /// 首次延迟 `initial`，之后按 `period` 对齐运行。
    FixedRate { initial: Duration, period: Duration },
    /// 由触发器驱动。
    Triggered(Arc<dyn Trigger>),
}

impl Schedule {
    pub fn once(delay: Duration) -> Self {
        Schedule::Once { delay }
    }

    pub fn fixed_delay(initial: Duration, delay: Duration) -> Self {
        Schedule::FixedDelay { initial, delay }
    }

    pub fn fixed_rate(initial: Duration, period: Duration) -> Self {
        Schedule::FixedRate { initial, period }
    }

    pub fn triggered(trigger: Arc<dyn Trigger>) -> Self {
        Schedule::Triggered(trigger)
    }

    /// 零周期/零延迟的重复调度在提交时即被拒绝。
    pub(crate) fn validate(&self) -> ConcurrencyResult<()> {
        match self {
            Schedule::FixedDelay { delay, .. } if delay.is_zero() => Err(
                ConcurrencyError::configuration("fixed delay must be greater than zero"),
            ),
            Schedule::FixedRate { period, .. } if period.is_zero() => Err(
                ConcurrencyError::configuration("fixed rate period must be greater than zero"),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn is_repeating(&self) -> bool {
        !matches!(self, Schedule::Once { .. })
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Once { delay } => f.debug_struct("Once").field("delay", delay).finish(),
            Schedule::FixedDelay { initial, delay } => f
                .debug_struct("FixedDelay")
                .field("initial", initial)
                .field("delay", delay)
                .finish(),
            Schedule::FixedRate { initial, period } => f
                .debug_struct("FixedRate")
                .field("initial", initial)
                .field("period", period)
                .finish(),
            Schedule::Triggered(_) => f.write_str("Triggered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_periods_are_rejected() {
        assert!(Schedule::fixed_rate(Duration::ZERO, Duration::ZERO).validate().is_err());
        assert!(Schedule::fixed_delay(Duration::from_secs(1), Duration::ZERO)
            .validate()
            .is_err());
        assert!(Schedule::once(Duration::ZERO).validate().is_ok());
        assert!(!Schedule::once(Duration::ZERO).is_repeating());
    }
}
