//! 托管执行器配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：执行器名称、队列策略、上下文传播清单与取消重试上限都属于部署期决策，
//!   应当能够从 TOML 文件读取，而不是散落在构造代码里。
//! - **契约 (What)**：
//!   - [`ManagedExecutorConfig::from_toml_str`] 读取 `[managed_executor]` 表，缺失字段取默认值，
//!     未知字段视为配置错误；
//!   - [`ManagedExecutorConfig::validate`] 在构造执行器时调用，违反约束返回
//!     [`ConcurrencyError::Configuration`]。
//! - **实现提示 (How)**：serde 负责结构映射，语义校验集中在 `validate`，两者的错误统一转换为配置错误。

use serde::Deserialize;

use crate::error::{ConcurrencyError, ConcurrencyResult};
use crate::native::{QueuePolicy, TaskPriority};

/// 取消与重新调度竞争时的默认重试上限。
pub const DEFAULT_CANCEL_RETRY_LIMIT: u32 = 1024;

/// 托管执行器的可配置项。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagedExecutorConfig {
    /// 执行器名称，同时作为默认的 `TASK_OWNER` 与日志字段 `executor`。
    pub name: String,
    /// 提交到底层执行器时使用的优先级。
    pub priority: TaskPriority,
    /// 任务是否为长时运行，转交给底层执行器的队列策略。
    pub long_running: bool,
    /// 需要传播的上下文提供者；为空表示传播全部已注册的提供者。
    pub propagated: Vec<String>,
    /// 需要以"清空"状态施加的上下文提供者。
    pub cleared: Vec<String>,
    /// 捕获上下文时是否默认挂起事务。
    pub suspend_transaction: bool,
    /// 取消与重新调度竞争时的最大重试次数。
    pub cancel_retry_limit: u32,
}

impl Default for ManagedExecutorConfig {
    fn default() -> Self {
        Self {
            name: "managed-executor".to_owned(),
            priority: TaskPriority::Normal,
            long_running: false,
            propagated: Vec::new(),
            cleared: Vec::new(),
            suspend_transaction: true,
            cancel_retry_limit: DEFAULT_CANCEL_RETRY_LIMIT,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    #[serde(default)]
    managed_executor: ManagedExecutorConfig,
}

impl ManagedExecutorConfig {
    /// 以名称构造默认配置。
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// 从 TOML 文本读取 `[managed_executor]` 表并校验。
    pub fn from_toml_str(source: &str) -> ConcurrencyResult<Self> {
        let document: ConfigDocument = toml::from_str(source).map_err(|error| {
            ConcurrencyError::configuration(format!("malformed executor configuration: {error}"))
        })?;
        document.managed_executor.validate()?;
        Ok(document.managed_executor)
    }

    /// 语义校验。
    pub fn validate(&self) -> ConcurrencyResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConcurrencyError::configuration(
                "executor name must not be empty",
            ));
        }
        if self.cancel_retry_limit == 0 {
            return Err(ConcurrencyError::configuration(
                "cancel_retry_limit must be positive",
            ));
        }
        if let Some(name) = self
            .cleared
            .iter()
            .find(|name| self.propagated.contains(name))
        {
            return Err(ConcurrencyError::configuration(format!(
                "context provider `{name}` cannot be both propagated and cleared"
            )));
        }
        Ok(())
    }

    /// 派生底层执行器的队列策略。
    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            priority: self.priority,
            long_running: self.long_running,
        }
    }
}
