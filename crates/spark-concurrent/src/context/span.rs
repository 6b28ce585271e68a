//! 以 `tracing::Span` 作为一类线程上下文传播。

use std::sync::Arc;

use tracing::Span;

use crate::error::TaskResult;

use super::properties::ExecutionProperties;
use super::provider::{CapturedContext, ContextProvider, RestoreToken};

/// 传播提交线程当前 span 的提供者。
///
/// 执行线程上施加时进入被捕获的 span，恢复时退出；任务内产生的日志因而挂在提交方的 span 之下。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSpanProvider;

impl TracingSpanProvider {
    pub const NAME: &'static str = "tracing-span";
}

#[derive(Debug)]
struct CapturedSpan {
    span: Span,
}

impl CapturedContext for CapturedSpan {
    fn apply(&self) -> TaskResult<RestoreToken> {
        Ok(RestoreToken::new(self.span.clone().entered()))
    }

    fn restore(&self, token: RestoreToken) -> TaskResult<()> {
        drop(token);
        Ok(())
    }
}

impl ContextProvider for TracingSpanProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capture(&self, _properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>> {
        Ok(Arc::new(CapturedSpan {
            span: Span::current(),
        }))
    }

    fn cleared(&self, _properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>> {
        Ok(Arc::new(CapturedSpan { span: Span::none() }))
    }
}
