//! 阶段的共享内核：结果槽、依赖回调与在途异步动作的句柄。
//!
//! 依赖回调不在完成它的调用栈上递归运行：同步依赖在回调里完成自己的下游时只会入队，
//! 由本线程最外层的完成调用依次排空，长依赖链不会耗尽栈空间。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{ConcurrencyResult, Failure};
use crate::native::NativeFuture;

pub(crate) type Outcome<T> = ConcurrencyResult<T>;
pub(crate) type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    /// 本线程正在排空的完成队列；`None` 表示当前没有排空者。
    static COMPLETIONS: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// 运行一批依赖回调。已有排空者时只入队，否则由当前调用排空本线程的队列。
fn dispatch<T: Clone + Send + 'static>(callbacks: Vec<Callback<T>>, outcome: Outcome<T>) {
    if callbacks.is_empty() {
        return;
    }
    let batch: Job = Box::new(move || {
        for callback in callbacks {
            callback(&outcome);
        }
    });
    let first = COMPLETIONS.with(|queue| {
        let mut queue = queue.borrow_mut();
        match queue.as_mut() {
            Some(pending) => {
                pending.push_back(batch);
                None
            }
            None => {
                *queue = Some(VecDeque::new());
                Some(batch)
            }
        }
    });
    let Some(first) = first else {
        return;
    };

    let _drain = DrainScope;
    let mut next = Some(first);
    while let Some(batch) = next {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(batch)) {
            warn!(error = %Failure::from_panic(payload), "stage dependent panicked while completing");
        }
        next = COMPLETIONS.with(|queue| queue.borrow_mut().as_mut().and_then(VecDeque::pop_front));
    }
}

struct DrainScope;

impl Drop for DrainScope {
    fn drop(&mut self) {
        COMPLETIONS.with(|queue| queue.borrow_mut().take());
    }
}

enum StageState<T> {
    Pending(Vec<Callback<T>>),
    Complete(Outcome<T>),
}

/// 只能被领取一次的待运行动作。
///
/// 工作线程与 `join` 调用方竞争领取：谁先领取谁运行，另一方成为空操作。
pub(crate) struct Claim {
    job: Mutex<Option<Job>>,
}

impl Claim {
    pub(crate) fn new(job: Job) -> Self {
        Self {
            job: Mutex::new(Some(job)),
        }
    }

    pub(crate) fn run(&self) -> bool {
        let job = self.job.lock().take();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    pub(crate) fn discard(&self) {
        self.job.lock().take();
    }
}

pub(crate) struct StageCore<T> {
    state: Mutex<StageState<T>>,
    completed: Condvar,
    backing: Mutex<Option<Arc<dyn NativeFuture>>>,
    pending: Mutex<Option<Arc<Claim>>>,
}

impl<T: Clone + Send + 'static> StageCore<T> {
    pub(crate) fn new() -> Self {
        Self::with_state(StageState::Pending(Vec::new()))
    }

    pub(crate) fn completed(outcome: Outcome<T>) -> Self {
        Self::with_state(StageState::Complete(outcome))
    }

    fn with_state(state: StageState<T>) -> Self {
        Self {
            state: Mutex::new(state),
            completed: Condvar::new(),
            backing: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    /// 首次完成；已完成时返回 `false`。回调在锁外按注册顺序运行。
    ///
    /// 在另一个完成的回调里调用时，本阶段的回调排在队尾，返回时可能尚未运行。
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            let StageState::Pending(callbacks) = &mut *state else {
                return false;
            };
            let callbacks = mem::take(callbacks);
            *state = StageState::Complete(outcome.clone());
            self.completed.notify_all();
            callbacks
        };
        dispatch(callbacks, outcome);
        true
    }

    /// 强制覆盖结果；尚未完成时等同于首次完成。
    pub(crate) fn overwrite(&self, outcome: Outcome<T>) {
        let callbacks = {
            let mut state = self.state.lock();
            let callbacks = match &mut *state {
                StageState::Pending(callbacks) => mem::take(callbacks),
                StageState::Complete(_) => Vec::new(),
            };
            *state = StageState::Complete(outcome.clone());
            self.completed.notify_all();
            callbacks
        };
        dispatch(callbacks, outcome);
    }

    /// 注册依赖回调；已完成时立即在当前线程运行。
    pub(crate) fn subscribe(&self, callback: Callback<T>) {
        let outcome = {
            let mut state = self.state.lock();
            match &mut *state {
                StageState::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                StageState::Complete(outcome) => outcome.clone(),
            }
        };
        callback(&outcome);
    }

    pub(crate) fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.state.lock() {
            StageState::Complete(outcome) => Some(outcome.clone()),
            StageState::Pending(_) => None,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(&*self.state.lock(), StageState::Complete(_))
    }

    pub(crate) fn dependents(&self) -> usize {
        match &*self.state.lock() {
            StageState::Pending(callbacks) => callbacks.len(),
            StageState::Complete(_) => 0,
        }
    }

    /// 阻塞等待结果；到达截止时间仍未完成时返回 `None`。
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> Option<Outcome<T>> {
        let mut state = self.state.lock();
        loop {
            if let StageState::Complete(outcome) = &*state {
                return Some(outcome.clone());
            }
            match deadline {
                None => self.completed.wait(&mut state),
                Some(deadline) => {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        return match &*state {
                            StageState::Complete(outcome) => Some(outcome.clone()),
                            StageState::Pending(_) => None,
                        };
                    }
                }
            }
        }
    }

    pub(crate) fn set_pending(&self, claim: Arc<Claim>) {
        *self.pending.lock() = Some(claim);
    }

    pub(crate) fn take_pending(&self) -> Option<Arc<Claim>> {
        self.pending.lock().take()
    }

    pub(crate) fn set_backing(&self, native: Arc<dyn NativeFuture>) {
        *self.backing.lock() = Some(native);
    }

    /// 外部完成阶段后，尽力取消仍在途的异步动作。
    pub(crate) fn cancel_backing(&self, interrupt: bool) {
        if let Some(claim) = self.take_pending() {
            claim.discard();
        }
        let backing = self.backing.lock().take();
        if let Some(native) = backing {
            native.cancel(interrupt);
        }
    }
}
