#![allow(dead_code)]
//! 集成测试共用的构造与等待工具。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use spark_concurrent::context::{ContextProvider, ContextProviderRegistry};
use spark_concurrent::test_stubs::{MarkerProvider, ThreadPoolStub};
use spark_concurrent::{ManagedExecutor, ManagedExecutorConfig, NativeExecutor, TaskListener};

pub const WAIT: Duration = Duration::from_secs(5);

/// 注册了 `user` 标记提供者的注册表。
pub fn marker_registry() -> ContextProviderRegistry {
    registry_with([Arc::new(MarkerProvider::new("user")) as Arc<dyn ContextProvider>])
}

pub fn registry_with(
    providers: impl IntoIterator<Item = Arc<dyn ContextProvider>>,
) -> ContextProviderRegistry {
    let mut registry = ContextProviderRegistry::new();
    for provider in providers {
        registry.register(provider).expect("提供者名称不应重复");
    }
    registry
}

pub fn pool(workers: usize) -> Arc<ThreadPoolStub> {
    ThreadPoolStub::new("test-pool", workers)
}

pub fn executor(native: Arc<dyn NativeExecutor>) -> ManagedExecutor {
    ManagedExecutor::builder(native)
        .with_config(ManagedExecutorConfig::named("test-executor"))
        .with_context_registry(marker_registry())
        .build()
        .expect("默认配置应通过校验")
}

pub fn executor_with_listener(
    native: Arc<dyn NativeExecutor>,
    listener: Arc<dyn TaskListener>,
) -> ManagedExecutor {
    ManagedExecutor::builder(native)
        .with_config(ManagedExecutorConfig::named("test-executor"))
        .with_context_registry(marker_registry())
        .with_listener(listener)
        .build()
        .expect("默认配置应通过校验")
}

/// 轮询等待条件成立。
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
