//! # context 模块说明
//!
//! ## 角色定位（Why）
//! - 任务在提交线程上"拍下"当时的线程上下文，在执行线程上"还原"，运行结束后把执行线程恢复原状；
//! - 本模块提供这一契约的全部构件：提供者 trait、显式注册表、不可变快照、施加守卫与内置提供者。
//!
//! ## 契约（What）
//! - 施加严格早于 `on_starting` 通知，恢复严格晚于任务体结束；
//! - 即使任务体或监听器失败，恢复也一定发生；
//! - 捕获规则：`cleared` 中的提供者以清空形态捕获，`propagated` 为空时传播全部提供者，否则只传播列出的提供者。

mod component;
mod properties;
mod provider;
mod snapshot;
mod span;

use std::sync::Arc;

use tracing::debug;

use crate::error::{ConcurrencyError, ConcurrencyResult};

pub use component::{
    ComponentContextProvider, ComponentMetadata, ComponentRegistry, ComponentScope,
    current_component, enter_component,
};
pub use properties::{
    ExecutionProperties, IDENTITY_NAME, LONGRUNNING_HINT, TASK_OWNER, TRANSACTION,
    TRANSACTION_SUSPEND, TRANSACTION_USE_EXECUTION_THREAD,
};
pub use provider::{CapturedContext, ContextProvider, ContextProviderRegistry, RestoreToken};
pub use snapshot::{AppliedContext, ContextSnapshot};
pub use span::TracingSpanProvider;

/// 上下文捕获服务：注册表 + 传播策略。
#[derive(Clone, Debug, Default)]
pub struct ContextService {
    registry: Arc<ContextProviderRegistry>,
    propagated: Vec<String>,
    cleared: Vec<String>,
}

impl ContextService {
    pub fn new(registry: ContextProviderRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            propagated: Vec::new(),
            cleared: Vec::new(),
        }
    }

    /// 设置传播与清空清单。
    pub fn with_policy(mut self, propagated: Vec<String>, cleared: Vec<String>) -> Self {
        self.propagated = propagated;
        self.cleared = cleared;
        self
    }

    pub fn registry(&self) -> &ContextProviderRegistry {
        &self.registry
    }

    /// 在当前线程捕获上下文。
    ///
    /// `owner` 作为缺省的 `TASK_OWNER`，`task_type` 作为缺省的 `IDENTITY_NAME`。
    /// 提供者捕获失败时返回 `Rejected`：任务尚未进入执行即被拒绝。
    pub fn capture(
        &self,
        mut properties: ExecutionProperties,
        owner: &str,
        task_type: Option<&str>,
    ) -> ConcurrencyResult<ContextSnapshot> {
        properties.insert_default(TASK_OWNER, || owner.to_owned());
        if let Some(task_type) = task_type {
            properties.insert_default(IDENTITY_NAME, || task_type.to_owned());
        }

        let mut entries = Vec::with_capacity(self.registry.len());
        for provider in self.registry.iter() {
            let name = provider.name();
            let captured = if self.cleared.iter().any(|c| c == name) {
                provider.cleared(&properties)
            } else if self.propagated.is_empty() || self.propagated.iter().any(|p| p == name) {
                provider.capture(&properties)
            } else {
                continue;
            };
            let captured = captured.map_err(|failure| {
                ConcurrencyError::rejected(
                    format!("context provider `{name}` failed to capture"),
                    Some(failure),
                )
            })?;
            entries.push((name.to_owned(), captured));
        }

        debug!(
            owner,
            providers = entries.len(),
            identity = properties.identity_name().unwrap_or("anonymous"),
            "captured thread context"
        );
        Ok(ContextSnapshot::new(entries, properties))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::{MarkerProvider, marker};

    fn registry() -> ContextProviderRegistry {
        ContextProviderRegistry::new()
            .with(Arc::new(MarkerProvider::new("alpha")))
            .and_then(|r| r.with(Arc::new(MarkerProvider::new("beta"))))
            .expect("注册应成功")
    }

    #[test]
    fn capture_fills_default_properties() {
        let service = ContextService::new(registry());
        let snapshot = service
            .capture(ExecutionProperties::new(), "exec-1", Some("my::Task"))
            .expect("捕获应成功");
        assert_eq!(snapshot.properties().task_owner(), Some("exec-1"));
        assert_eq!(snapshot.identity_name(), "my::Task");
        assert_eq!(snapshot.provider_names().collect::<Vec<_>>(), ["alpha", "beta"]);
    }

    #[test]
    fn cleared_providers_apply_empty_state() {
        let service = ContextService::new(registry())
            .with_policy(vec!["alpha".into()], vec!["beta".into()]);
        MarkerProvider::set("alpha", Some("a"));
        MarkerProvider::set("beta", Some("b"));
        let snapshot = service
            .capture(ExecutionProperties::new(), "exec", None)
            .expect("捕获应成功");

        let applied = snapshot.apply().expect("施加应成功");
        assert_eq!(marker("alpha").as_deref(), Some("a"));
        assert_eq!(marker("beta"), None, "被清空的提供者在执行期间应为空");
        drop(applied);
        assert_eq!(marker("beta").as_deref(), Some("b"));
    }

    #[test]
    fn unlisted_providers_are_not_propagated() {
        let service = ContextService::new(registry()).with_policy(vec!["beta".into()], vec![]);
        let snapshot = service
            .capture(ExecutionProperties::new(), "exec", None)
            .expect("捕获应成功");
        assert_eq!(snapshot.provider_names().collect::<Vec<_>>(), ["beta"]);
    }
}
