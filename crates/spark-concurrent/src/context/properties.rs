//! 执行属性：随任务一起捕获、供上下文提供者读取的键值对。

use std::collections::BTreeMap;

/// 任务的身份名称，默认取任务类型名。
pub const IDENTITY_NAME: &str = "concurrent.identity_name";
/// 提交任务的执行器（或组件）名称。
pub const TASK_OWNER: &str = "concurrent.task_owner";
/// 事务处理策略，取值见 [`TRANSACTION_SUSPEND`] 与 [`TRANSACTION_USE_EXECUTION_THREAD`]。
pub const TRANSACTION: &str = "concurrent.transaction";
/// 长时运行提示，取值 `"true"`/`"false"`。
pub const LONGRUNNING_HINT: &str = "concurrent.longrunning_hint";

pub const TRANSACTION_SUSPEND: &str = "SUSPEND";
pub const TRANSACTION_USE_EXECUTION_THREAD: &str = "USE_TRANSACTION_OF_EXECUTION_THREAD";

/// 有序的字符串属性表。
///
/// 以 `BTreeMap` 保存，迭代顺序稳定，日志与快照比较结果可复现。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionProperties {
    entries: BTreeMap<String, String>,
}

impl ExecutionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// 链式插入。
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// 仅当键不存在时写入。
    pub fn insert_default(&mut self, key: &str, value: impl FnOnce() -> String) {
        if !self.entries.contains_key(key) {
            self.entries.insert(key.to_owned(), value());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity_name(&self) -> Option<&str> {
        self.get(IDENTITY_NAME)
    }

    pub fn task_owner(&self) -> Option<&str> {
        self.get(TASK_OWNER)
    }

    /// 是否要求在任务执行期间挂起事务。
    pub fn suspends_transaction(&self) -> bool {
        self.get(TRANSACTION) != Some(TRANSACTION_USE_EXECUTION_THREAD)
    }

    pub fn is_long_running(&self) -> bool {
        self.get(LONGRUNNING_HINT)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}

impl<K, V> FromIterator<(K, V)> for ExecutionProperties
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Self::new();
        for (key, value) in iter {
            properties.insert(key, value);
        }
        properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_do_not_override_explicit_values() {
        let mut properties = ExecutionProperties::new().with(IDENTITY_NAME, "report-job");
        properties.insert_default(IDENTITY_NAME, || "closure".to_owned());
        properties.insert_default(TASK_OWNER, || "executor-a".to_owned());
        assert_eq!(properties.identity_name(), Some("report-job"));
        assert_eq!(properties.task_owner(), Some("executor-a"));
    }

    #[test]
    fn transaction_defaults_to_suspend() {
        let properties = ExecutionProperties::new();
        assert!(properties.suspends_transaction());
        let keep = properties.with(TRANSACTION, TRANSACTION_USE_EXECUTION_THREAD);
        assert!(!keep.suspends_transaction());
    }
}
