//! 不可变的上下文快照与施加守卫。

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::{Failure, TaskResult, catch};

use super::properties::ExecutionProperties;
use super::provider::{CapturedContext, RestoreToken};

/// 捕获完成的线程上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：同一快照会被周期任务的每一次尝试、CompletionStage 的多个依赖动作反复施加，
///   因此必须不可变并以 `Arc` 共享。
/// - **契约 (What)**：
///   - [`ContextSnapshot::apply`] 按捕获顺序施加全部提供者，返回 [`AppliedContext`]；
///   - 某个提供者施加失败时，已施加的提供者按相反顺序恢复，然后返回该失败；
///   - 守卫析构或显式 [`AppliedContext::restore`] 时按 LIFO 顺序恢复。
#[derive(Clone)]
pub struct ContextSnapshot {
    inner: Arc<SnapshotInner>,
}

struct SnapshotInner {
    entries: Vec<(String, Arc<dyn CapturedContext>)>,
    properties: ExecutionProperties,
}

impl ContextSnapshot {
    pub(crate) fn new(
        entries: Vec<(String, Arc<dyn CapturedContext>)>,
        properties: ExecutionProperties,
    ) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                entries,
                properties,
            }),
        }
    }

    /// 不包含任何提供者的快照。
    pub fn empty(properties: ExecutionProperties) -> Self {
        Self::new(Vec::new(), properties)
    }

    pub fn properties(&self) -> &ExecutionProperties {
        &self.inner.properties
    }

    pub fn identity_name(&self) -> &str {
        self.inner.properties.identity_name().unwrap_or("anonymous")
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.inner.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// 在当前线程施加快照。
    pub fn apply(&self) -> TaskResult<AppliedContext> {
        let mut applied = AppliedContext {
            snapshot: self.clone(),
            tokens: Vec::with_capacity(self.inner.entries.len()),
            restored: false,
        };
        for (index, (name, captured)) in self.inner.entries.iter().enumerate() {
            match catch(|| captured.apply()) {
                Ok(token) => applied.tokens.push((index, token)),
                Err(failure) => {
                    warn!(
                        provider = %name,
                        identity = %self.identity_name(),
                        error = %failure,
                        "context provider failed to apply; unwinding"
                    );
                    if let Err(restore_failure) = applied.restore_all() {
                        warn!(error = %restore_failure, "restore during unwind failed");
                    }
                    return Err(failure);
                }
            }
        }
        Ok(applied)
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("providers", &self.provider_names().collect::<Vec<_>>())
            .field("properties", &self.inner.properties)
            .finish()
    }
}

/// 已施加的上下文；析构时恢复。持有 `RestoreToken`，因此同样是 `!Send`。
pub struct AppliedContext {
    snapshot: ContextSnapshot,
    tokens: Vec<(usize, RestoreToken)>,
    restored: bool,
}

impl AppliedContext {
    /// 显式恢复并报告第一个恢复失败；其余失败只记录日志。
    pub fn restore(mut self) -> TaskResult<()> {
        self.restore_all()
    }

    fn restore_all(&mut self) -> TaskResult<()> {
        self.restored = true;
        let mut first: Option<Failure> = None;
        while let Some((index, token)) = self.tokens.pop() {
            let (name, captured) = &self.snapshot.inner.entries[index];
            if let Err(failure) = catch(|| captured.restore(token)) {
                warn!(provider = %name, error = %failure, "context provider failed to restore");
                first.get_or_insert(failure);
            }
        }
        match first {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl Drop for AppliedContext {
    fn drop(&mut self) {
        if !self.restored {
            let _ = self.restore_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stubs::{MarkerProvider, marker};

    use super::super::provider::ContextProvider;

    #[test]
    fn apply_then_restore_is_lifo() {
        let outer = MarkerProvider::new("outer");
        let inner = MarkerProvider::new("inner");
        let properties = ExecutionProperties::new();

        MarkerProvider::set("outer", Some("captured-outer"));
        MarkerProvider::set("inner", Some("captured-inner"));
        let snapshot = ContextSnapshot::new(
            vec![
                ("outer".into(), outer.capture(&properties).expect("捕获")),
                ("inner".into(), inner.capture(&properties).expect("捕获")),
            ],
            properties,
        );
        MarkerProvider::set("outer", Some("thread-outer"));
        MarkerProvider::set("inner", None);

        let applied = snapshot.apply().expect("施加应成功");
        assert_eq!(marker("outer").as_deref(), Some("captured-outer"));
        assert_eq!(marker("inner").as_deref(), Some("captured-inner"));
        applied.restore().expect("恢复应成功");

        assert_eq!(marker("outer").as_deref(), Some("thread-outer"));
        assert_eq!(marker("inner"), None);
    }

    #[test]
    fn failed_apply_unwinds_previous_providers() {
        let good = MarkerProvider::new("good");
        let bad = MarkerProvider::failing_apply("bad");
        let properties = ExecutionProperties::new();

        MarkerProvider::set("good", Some("captured"));
        let snapshot = ContextSnapshot::new(
            vec![
                ("good".into(), good.capture(&properties).expect("捕获")),
                ("bad".into(), bad.capture(&properties).expect("捕获")),
            ],
            properties,
        );
        MarkerProvider::set("good", Some("original"));

        assert!(snapshot.apply().is_err());
        assert_eq!(
            marker("good").as_deref(),
            Some("original"),
            "施加失败时已施加的提供者必须被恢复"
        );
    }
}
