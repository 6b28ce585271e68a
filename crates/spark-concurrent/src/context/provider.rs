//! 上下文提供者契约与显式注册表。
//!
//! # 教案式说明
//! - **意图 (Why)**：安全身份、类加载/组件归属、事务、日志 span 等"线程上下文"各自由独立的提供者负责，
//!   托管层只编排 `capture → apply → restore` 的顺序，不关心具体内容。
//! - **契约 (What)**：
//!   - [`ContextProvider::capture`] 在提交线程上调用，返回不可变的 [`CapturedContext`]；
//!   - [`CapturedContext::apply`] 在执行线程上调用，返回的 [`RestoreToken`] 记录被替换掉的线程状态；
//!   - [`RestoreToken`] 是 `!Send` 的：令牌只能在产生它的线程上交还给 `restore`；
//!   - 注册表是显式构造、显式注入的对象，不存在进程级静态注册表。

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{ConcurrencyError, ConcurrencyResult, TaskResult};

use super::properties::ExecutionProperties;

/// 施加上下文时被替换下来的线程状态。
pub struct RestoreToken {
    state: Option<Box<dyn Any>>,
    _not_send: PhantomData<*const ()>,
}

impl RestoreToken {
    pub fn new<S: Any>(state: S) -> Self {
        Self {
            state: Some(Box::new(state)),
            _not_send: PhantomData,
        }
    }

    /// 不携带任何状态的令牌。
    pub fn empty() -> Self {
        Self {
            state: None,
            _not_send: PhantomData,
        }
    }

    /// 取回施加时保存的状态；类型不符或令牌为空时返回 `None`。
    pub fn into_state<S: Any>(self) -> Option<S> {
        self.state?.downcast::<S>().ok().map(|state| *state)
    }
}

impl fmt::Debug for RestoreToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreToken")
            .field("empty", &self.state.is_none())
            .finish()
    }
}

/// 某个提供者捕获到的不可变上下文。
pub trait CapturedContext: Send + Sync + fmt::Debug {
    fn apply(&self) -> TaskResult<RestoreToken>;

    fn restore(&self, token: RestoreToken) -> TaskResult<()>;
}

/// 上下文提供者。
pub trait ContextProvider: Send + Sync + 'static {
    /// 提供者名称，在注册表内唯一，也是 `propagated`/`cleared` 配置引用的键。
    fn name(&self) -> &str;

    /// 在提交线程上捕获当前上下文。
    fn capture(&self, properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>>;

    /// "清空"形态：执行期间该类上下文为空。
    fn cleared(&self, properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>>;
}

/// 有序的提供者注册表。
///
/// 注册顺序即施加顺序，恢复按相反顺序进行。
#[derive(Clone, Default)]
pub struct ContextProviderRegistry {
    providers: Vec<Arc<dyn ContextProvider>>,
}

impl ContextProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册提供者；名称重复时返回配置错误。
    pub fn register(&mut self, provider: Arc<dyn ContextProvider>) -> ConcurrencyResult<()> {
        if self.get(provider.name()).is_some() {
            return Err(ConcurrencyError::configuration(format!(
                "context provider `{}` is already registered",
                provider.name()
            )));
        }
        self.providers.push(provider);
        Ok(())
    }

    /// 链式注册，便于构造期使用。
    pub fn with(mut self, provider: Arc<dyn ContextProvider>) -> ConcurrencyResult<Self> {
        self.register(provider)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ContextProvider>> {
        self.providers.iter().find(|provider| provider.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ContextProvider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ContextProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|provider| provider.name()))
            .finish()
    }
}
