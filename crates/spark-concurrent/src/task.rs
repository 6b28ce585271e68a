//! 托管任务描述：任务体加上监听器、执行属性与身份名称。

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::context::{ExecutionProperties, IDENTITY_NAME, LONGRUNNING_HINT};
use crate::listener::TaskListener;

/// 带元数据的任务。
///
/// 闭包可以直接交给 `submit`/`schedule*`；需要监听器或自定义执行属性时，用本类型包装后交给 `*_task` 变体。
pub struct ManagedTask<F> {
    body: F,
    listener: Option<Arc<dyn TaskListener>>,
    properties: ExecutionProperties,
}

impl<F> ManagedTask<F> {
    pub fn new(body: F) -> Self {
        Self {
            body,
            listener: None,
            properties: ExecutionProperties::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TaskListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn with_identity_name(self, name: impl Into<String>) -> Self {
        self.with_property(IDENTITY_NAME, name)
    }

    pub fn long_running(self, hint: bool) -> Self {
        self.with_property(LONGRUNNING_HINT, hint.to_string())
    }

    pub fn listener(&self) -> Option<&Arc<dyn TaskListener>> {
        self.listener.as_ref()
    }

    pub fn properties(&self) -> &ExecutionProperties {
        &self.properties
    }

    /// 身份名称；未显式设置时取任务体的类型名。
    pub fn identity_name(&self) -> &str {
        self.properties
            .identity_name()
            .unwrap_or_else(|| type_name::<F>())
    }

    pub(crate) fn into_parts(
        self,
    ) -> (F, Option<Arc<dyn TaskListener>>, ExecutionProperties) {
        (self.body, self.listener, self.properties)
    }
}

impl<F> fmt::Debug for ManagedTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedTask")
            .field("identity", &self.identity_name())
            .field("has_listener", &self.listener.is_some())
            .field("properties", &self.properties)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_defaults_to_body_type() {
        fn job() {}
        let task = ManagedTask::new(job as fn());
        assert_eq!(task.identity_name(), type_name::<fn()>());

        let named = ManagedTask::new(job as fn()).with_identity_name("nightly-report");
        assert_eq!(named.identity_name(), "nightly-report");
    }
}
