//! # stage 模块说明
//!
//! ## 角色定位（Why）
//! - 在 Promise 之上补齐"默认执行器"语义：依赖阶段默认在所属托管执行器上运行，
//!   并带着注册动作那一刻捕获的线程上下文；
//! - 链式派生的阶段继承默认执行器，因此 `a.then_apply(f).then_apply(g)` 中 `g` 同样在捕获的上下文里运行。
//!
//! ## 契约（What）
//! - 完成是线性化的：`complete`/`complete_exceptionally`/`cancel` 中恰有一个成功；
//! - 外部完成会尽力取消仍在途的异步动作；
//! - 超时完成是额外的定时动作，阶段已完成时为空操作。
//!
//! ## 结构（How）
//! - `slot`：结果槽与依赖回调；
//! - `managed`：派发机制与完成/观察 API；
//! - `compose`：依赖方法族；
//! - `minimal`：只读组合视图与 [`AsStage`]。

mod action;
mod compose;
mod managed;
mod minimal;
mod slot;

pub use action::{DelayedExecutor, StageAction, StageExecutor};
pub use managed::{ManagedStage, StageFuture};
pub use minimal::{AsStage, MinimalStage};
