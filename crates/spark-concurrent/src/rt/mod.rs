//! 底层执行器的运行时适配层。
//!
//! 托管层只依赖 [`NativeExecutor`](crate::native::NativeExecutor) 契约；本模块按 feature 提供现成的适配实现。

#[cfg(feature = "runtime-tokio")]
mod tokio;

#[cfg(feature = "runtime-tokio")]
pub use self::tokio::TokioNativeExecutor;
