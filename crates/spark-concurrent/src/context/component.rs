//! 组件归属上下文。
//!
//! # 教案式说明
//! - **意图 (Why)**：任务总是"代表某个已部署的组件"运行；组件下线后，排队中的任务不应再以它的身份执行。
//! - **契约 (What)**：
//!   - [`ComponentRegistry`] 是显式注入的已部署组件表，可被并发部署/下线；
//!   - [`ComponentContextProvider`] 捕获提交线程的当前组件标识；
//!   - 施加时若组件已下线，返回 "component unavailable" 失败，任务在任务体运行前被中止。
//! - **实现提示 (How)**：注册表由 `DashMap` 承载；当前组件保存在线程本地，施加时替换、恢复时还原。

use std::cell::RefCell;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Failure, TaskResult};

use super::properties::ExecutionProperties;
use super::provider::{CapturedContext, ContextProvider, RestoreToken};

/// 已部署组件的元数据。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentMetadata {
    pub id: String,
    pub application: String,
}

impl ComponentMetadata {
    pub fn new(id: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            application: application.into(),
        }
    }
}

/// 已部署组件表。克隆共享同一张表。
#[derive(Clone, Debug, Default)]
pub struct ComponentRegistry {
    components: Arc<DashMap<String, ComponentMetadata>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, metadata: ComponentMetadata) {
        self.components.insert(metadata.id.clone(), metadata);
    }

    /// 下线组件，返回被移除的元数据。
    pub fn undeploy(&self, id: &str) -> Option<ComponentMetadata> {
        self.components.remove(id).map(|(_, metadata)| metadata)
    }

    pub fn get(&self, id: &str) -> Option<ComponentMetadata> {
        self.components.get(id).map(|entry| entry.value().clone())
    }

    pub fn is_deployed(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ComponentMetadata>> = const { RefCell::new(None) };
}

/// 当前线程所代表的组件。
pub fn current_component() -> Option<ComponentMetadata> {
    CURRENT.with(|current| current.borrow().clone())
}

/// 在当前线程上以 `metadata` 的身份运行，守卫析构时还原。
pub fn enter_component(metadata: Option<ComponentMetadata>) -> ComponentScope {
    let previous = CURRENT.with(|current| current.replace(metadata));
    ComponentScope { previous }
}

pub struct ComponentScope {
    previous: Option<ComponentMetadata>,
}

impl Drop for ComponentScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// 组件上下文提供者。
#[derive(Clone, Debug)]
pub struct ComponentContextProvider {
    registry: ComponentRegistry,
}

impl ComponentContextProvider {
    pub const NAME: &'static str = "component";

    pub fn new(registry: ComponentRegistry) -> Self {
        Self { registry }
    }
}

#[derive(Debug)]
struct CapturedComponent {
    id: Option<String>,
    registry: ComponentRegistry,
}

impl CapturedContext for CapturedComponent {
    fn apply(&self) -> TaskResult<RestoreToken> {
        let metadata = match &self.id {
            Some(id) => Some(self.registry.get(id).ok_or_else(|| {
                Failure::msg(format!("component `{id}` is unavailable"))
            })?),
            None => None,
        };
        let previous = CURRENT.with(|current| current.replace(metadata));
        Ok(RestoreToken::new(previous))
    }

    fn restore(&self, token: RestoreToken) -> TaskResult<()> {
        let previous = token.into_state::<Option<ComponentMetadata>>().flatten();
        CURRENT.with(|current| *current.borrow_mut() = previous);
        Ok(())
    }
}

impl ContextProvider for ComponentContextProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capture(&self, _properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>> {
        Ok(Arc::new(CapturedComponent {
            id: current_component().map(|metadata| metadata.id),
            registry: self.registry.clone(),
        }))
    }

    fn cleared(&self, _properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>> {
        Ok(Arc::new(CapturedComponent {
            id: None,
            registry: self.registry.clone(),
        }))
    }
}
