//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义托管执行运行时的错误语义：提交被拒、执行失败、提前中止、取消、跳过、阻塞调用被打断与超时；
//! - 让 `ManagedFuture::get`、`ManagedStage::join` 等观察接口返回同一套可匹配的错误枚举。
//!
//! ## 设计要求（What）
//! - [`ConcurrencyError`] 派生 `thiserror::Error`，并实现 `Clone`，同一结果可被多个等待者反复读取；
//! - [`Failure`] 是任务体、监听器、上下文提供者返回的“任意失败”，以 `Arc` 共享，克隆廉价；
//! - 每个错误变体都对应 [`codes`] 中的稳定错误码，便于日志检索。
//!
//! ## 使用提示（How）
//! - 任务体签名为 `FnOnce() -> TaskResult<T>`，任何实现 `std::error::Error` 的错误都可以经 `?` 转为 [`Failure`]；
//! - 任务体 panic 会在边界处被捕获并转换为 [`Failure::from_panic`]，不会穿透到底层执行器线程。

use std::any::Any;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// 稳定错误码。
///
/// 码值按 `<域>.<类别>` 组织，供日志字段 `error.code` 与告警规则引用。
pub mod codes {
    pub const CONFIGURATION: &str = "concurrent.configuration";
    pub const REJECTED: &str = "concurrent.rejected";
    pub const EXECUTION: &str = "concurrent.execution";
    pub const ABORTED: &str = "concurrent.aborted";
    pub const CANCELLED: &str = "concurrent.cancelled";
    pub const SKIPPED: &str = "concurrent.skipped";
    pub const INTERRUPTED: &str = "concurrent.interrupted";
    pub const TIMEOUT: &str = "concurrent.timeout";
}

/// 任务体、监听器与上下文提供者的通用返回类型。
pub type TaskResult<T = ()> = Result<T, Failure>;

/// 观察接口（`get`/`join` 等）的返回类型。
pub type ConcurrencyResult<T> = Result<T, ConcurrencyError>;

/// 一次失败的共享描述。
///
/// # 教案式说明
/// - **意图 (Why)**：任务结果需要被多个等待者读取，失败必须可克隆；而用户错误类型通常不是 `Clone`，
///   因此以 `Arc` 包裹原始错误。
/// - **契约 (What)**：
///   - 任何 `std::error::Error + Send + Sync + 'static` 都可以通过 `From` 转换而来，`?` 可直接使用；
///   - [`Failure::downcast_ref`] 可取回原始错误类型；
///   - 自身刻意不实现 `std::error::Error`，以避免与泛型 `From` 冲突（与 `anyhow::Error` 同理），
///     需要 `dyn Error` 时调用 [`Failure::as_error`]。
#[derive(Clone)]
pub struct Failure {
    inner: Arc<FailureKind>,
}

enum FailureKind {
    Message(Cow<'static, str>),
    Error(Box<dyn StdError + Send + Sync + 'static>),
    Panic(String),
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageError {}

impl Failure {
    /// 以纯文本描述构造失败。
    pub fn msg(message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            inner: Arc::new(FailureKind::Message(message.into())),
        }
    }

    /// 包装一个具体错误，保留其类型以便后续向下转型。
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(FailureKind::Error(Box::new(error))),
        }
    }

    /// 将 `catch_unwind` 捕获的 panic 负载转换为失败。
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
            (*text).to_owned()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "task panicked with a non-string payload".to_owned()
        };
        Self {
            inner: Arc::new(FailureKind::Panic(message)),
        }
    }

    /// 失败是否源自 panic。
    pub fn is_panic(&self) -> bool {
        matches!(*self.inner, FailureKind::Panic(_))
    }

    /// 展示文本。
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// 被包装的原始错误；文本与 panic 形态没有来源。
    pub fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match &*self.inner {
            FailureKind::Error(error) => Some(&**error),
            _ => None,
        }
    }

    /// 尝试取回原始错误类型。
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match &*self.inner {
            FailureKind::Error(error) => error.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// 转换为 `Box<dyn Error>`，仅保留展示文本。
    pub fn as_error(&self) -> Box<dyn StdError + Send + Sync + 'static> {
        Box::new(MessageError(self.to_string()))
    }

    /// 两个句柄是否指向同一次失败。
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Failure::new(error)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FailureKind::Message(message) => f.write_str(message),
            FailureKind::Error(error) => fmt::Display::fmt(error, f),
            FailureKind::Panic(message) => write!(f, "panicked: {message}"),
        }
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            FailureKind::Message(message) => f.debug_tuple("Failure").field(message).finish(),
            FailureKind::Error(error) => f.debug_tuple("Failure").field(error).finish(),
            FailureKind::Panic(message) => f.debug_tuple("Panic").field(message).finish(),
        }
    }
}

/// 托管执行运行时的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“任务为何没有产出结果”精确地区分开，调用方据此决定重试、放弃或上报。
/// - **契约 (What)**：
///   - `Rejected` 只在提交/调度调用上同步返回，表示任务从未进入执行；
///   - `Execution` 表示任务体已运行并失败（包括 panic 与上下文恢复失败）；
///   - `Aborted` 表示任务在任务体运行前就被终止（上下文不可用、`on_starting` 监听器失败）；
///   - `Cancelled` 在结果读取中优先于任何已记录的执行失败；
///   - `Skipped` 仅出现在触发器调度中，携带触发器自身的失败（若有）。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConcurrencyError {
    /// 参数或配置不合法，例如固定速率周期为零。
    #[error("invalid configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// 底层执行器拒绝、监听器在提交阶段取消任务，或上下文捕获失败。
    #[error("task rejected: {reason}")]
    Rejected {
        reason: Cow<'static, str>,
        cause: Option<Failure>,
    },

    /// 任务体执行失败。
    #[error("task execution failed: {0}")]
    Execution(Failure),

    /// 任务体运行前被中止。
    #[error("task aborted before running: {0}")]
    Aborted(Failure),

    /// 任务已被取消。
    #[error("task was cancelled")]
    Cancelled,

    /// 触发器跳过了本次执行。
    #[error("scheduled execution was skipped")]
    Skipped(Option<Failure>),

    /// 阻塞等待被打断，或在执行线程上对自身调用了 `get`。
    #[error("blocking call interrupted: {0}")]
    Interrupted(Cow<'static, str>),

    /// 等待超时。
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ConcurrencyError {
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        ConcurrencyError::Configuration(message.into())
    }

    pub fn rejected(reason: impl Into<Cow<'static, str>>, cause: Option<Failure>) -> Self {
        ConcurrencyError::Rejected {
            reason: reason.into(),
            cause,
        }
    }

    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ConcurrencyError::Configuration(_) => codes::CONFIGURATION,
            ConcurrencyError::Rejected { .. } => codes::REJECTED,
            ConcurrencyError::Execution(_) => codes::EXECUTION,
            ConcurrencyError::Aborted(_) => codes::ABORTED,
            ConcurrencyError::Cancelled => codes::CANCELLED,
            ConcurrencyError::Skipped(_) => codes::SKIPPED,
            ConcurrencyError::Interrupted(_) => codes::INTERRUPTED,
            ConcurrencyError::Timeout(_) => codes::TIMEOUT,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConcurrencyError::Cancelled)
    }

    /// 错误所携带的底层失败（若有）。
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ConcurrencyError::Execution(failure) | ConcurrencyError::Aborted(failure) => {
                Some(failure)
            }
            ConcurrencyError::Rejected { cause, .. } => cause.as_ref(),
            ConcurrencyError::Skipped(cause) => cause.as_ref(),
            _ => None,
        }
    }
}

/// 在 panic 边界内运行 `body`，panic 负载被转换为 [`Failure`]。
pub(crate) fn catch<R>(body: impl FnOnce() -> TaskResult<R>) -> TaskResult<R> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(Failure::from_panic(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[test]
    fn failure_keeps_original_error_type() {
        let failure: Failure = DiskFull.into();
        assert!(failure.downcast_ref::<DiskFull>().is_some());
        assert_eq!(failure.message(), "disk full");
        assert!(failure.source().is_some());
        assert!(Failure::msg("plain").source().is_none());
        assert!(!failure.is_panic());
    }

    #[test]
    fn catch_converts_panics() {
        let result: TaskResult<u8> = catch(|| panic!("boom"));
        let failure = result.expect_err("panic 应被转换为失败");
        assert!(failure.is_panic());
        assert!(failure.to_string().contains("boom"));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ConcurrencyError::Cancelled.code(), codes::CANCELLED);
        assert_eq!(
            ConcurrencyError::Timeout(Duration::from_millis(5)).code(),
            codes::TIMEOUT
        );
        let rejected = ConcurrencyError::rejected("queue full", Some(Failure::msg("saturated")));
        assert_eq!(rejected.code(), codes::REJECTED);
        assert_eq!(
            rejected.failure().map(ToString::to_string).as_deref(),
            Some("saturated")
        );
    }
}
