//! # 测试替身
//!
//! ## 定位
//! - 单元测试、集成测试与基准共用的协作者实现：底层执行器、监听器、上下文提供者与触发器；
//! - 它们不是运行时核心的一部分，只追求行为可预测、便于断言。
//!
//! ## 组成
//! - [`ThreadPoolStub`]：固定数量的工作线程加一个定时线程；关闭后拒绝新工作；
//! - [`InlineExecutor`]：在调用线程上直接运行，延迟工作交给独立的休眠线程；
//! - [`RecordingListener`]：按顺序记录通知，可配置在指定回调中取消或失败；
//! - [`MarkerProvider`]：以线程局部字符串模拟一类线程上下文；
//! - [`ScriptedTrigger`]：按预设的间隔与跳过标记驱动触发器调度。

use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use crate::context::{CapturedContext, ContextProvider, ExecutionProperties, RestoreToken};
use crate::error::{ConcurrencyError, Failure, TaskResult};
use crate::listener::{TaskEvent, TaskListener};
use crate::native::{NativeExecutor, NativeFuture, NativeTask, QueuePolicy, Work};
use crate::schedule::{LastExecution, Trigger};

// ---- ThreadPoolStub ----

struct Timed {
    due: Instant,
    seq: u64,
    work: Work,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    // 最早到期者位于堆顶。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct PoolState {
    ready: VecDeque<Work>,
    timers: BinaryHeap<Timed>,
    shutdown: bool,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    timer_changed: Condvar,
    seq: AtomicU64,
    executed: AtomicU64,
}

/// 固定线程数的底层执行器。
///
/// `workers` 可以为 0：此时提交的工作只会排队，适合验证 `join` 的内联执行。
pub struct ThreadPoolStub {
    name: String,
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolStub {
    pub fn new(name: impl Into<String>, workers: usize) -> Arc<Self> {
        let name = name.into();
        let shared = Arc::new(PoolShared::default());
        let mut threads = Vec::with_capacity(workers + 1);
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(&shared));
            if let Ok(handle) = spawned {
                threads.push(handle);
            }
        }
        let timer_shared = Arc::clone(&shared);
        if let Ok(handle) = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || timer_loop(&timer_shared))
        {
            threads.push(handle);
        }
        Arc::new(Self {
            name,
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// 停止接收新工作并等待线程退出；已排队但未运行的工作被丢弃。
    pub fn shutdown(&self) {
        self.signal_shutdown();
        let threads = std::mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    /// 已经运行完毕的工作数量（含被取消而跳过的工作）。
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Acquire)
    }

    /// 等待运行的工作数量。
    pub fn queued(&self) -> usize {
        self.shared.state.lock().ready.len()
    }

    fn signal_shutdown(&self) {
        let discarded = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_ready.notify_all();
            self.shared.timer_changed.notify_all();
            (
                std::mem::take(&mut state.ready),
                std::mem::take(&mut state.timers),
            )
        };
        // 被丢弃的工作会回调托管层，必须在锁外析构。
        drop(discarded);
    }

    fn rejected(&self) -> Failure {
        Failure::msg(format!("executor `{}` is shut down", self.name))
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            loop {
                if state.shutdown {
                    return;
                }
                if let Some(work) = state.ready.pop_front() {
                    break work;
                }
                shared.work_ready.wait(&mut state);
            }
        };
        let _ = catch_unwind(AssertUnwindSafe(work));
        shared.executed.fetch_add(1, Ordering::AcqRel);
    }
}

fn timer_loop(shared: &PoolShared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.timers.peek().map(|timed| timed.due) {
            Some(due) if due <= now => {
                if let Some(timed) = state.timers.pop() {
                    state.ready.push_back(timed.work);
                    shared.work_ready.notify_one();
                }
            }
            Some(due) => {
                shared.timer_changed.wait_until(&mut state, due);
            }
            None => shared.timer_changed.wait(&mut state),
        }
    }
}

impl NativeExecutor for ThreadPoolStub {
    fn submit(&self, work: Work, _policy: QueuePolicy) -> TaskResult<Arc<dyn NativeFuture>> {
        let (work, handle) = NativeTask::guard(work);
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(self.rejected());
        }
        state.ready.push_back(work);
        self.shared.work_ready.notify_one();
        Ok(handle)
    }

    fn schedule(&self, work: Work, delay: Duration) -> TaskResult<Arc<dyn NativeFuture>> {
        let due = Instant::now()
            .checked_add(delay)
            .ok_or_else(|| Failure::msg(format!("delay {delay:?} is out of range")))?;
        let (work, handle) = NativeTask::guard(work);
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(self.rejected());
        }
        state.timers.push(Timed {
            due,
            seq: self.shared.seq.fetch_add(1, Ordering::Relaxed),
            work,
        });
        self.shared.timer_changed.notify_one();
        Ok(handle)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ThreadPoolStub {
    fn drop(&mut self) {
        // 最后一个引用可能在工作线程上释放，这里只发信号不等待。
        self.signal_shutdown();
    }
}

// ---- InlineExecutor ----

/// 在调用线程上运行工作的底层执行器。
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl InlineExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl NativeExecutor for InlineExecutor {
    fn submit(&self, work: Work, _policy: QueuePolicy) -> TaskResult<Arc<dyn NativeFuture>> {
        let (work, handle) = NativeTask::guard(work);
        work();
        Ok(handle)
    }

    fn schedule(&self, work: Work, delay: Duration) -> TaskResult<Arc<dyn NativeFuture>> {
        let (work, handle) = NativeTask::guard(work);
        thread::Builder::new()
            .name("inline-sleeper".into())
            .spawn(move || {
                thread::sleep(delay);
                work();
            })
            .map_err(Failure::new)?;
        Ok(handle)
    }

    fn name(&self) -> &str {
        "inline"
    }
}

// ---- RecordingListener ----

/// 记录下来的一条通知。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Submitted { attempt: u64 },
    Starting { attempt: u64 },
    Aborted { attempt: u64, code: &'static str },
    Done { attempt: u64, code: Option<&'static str> },
}

impl ListenerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ListenerEvent::Submitted { .. } => "submitted",
            ListenerEvent::Starting { .. } => "starting",
            ListenerEvent::Aborted { .. } => "aborted",
            ListenerEvent::Done { .. } => "done",
        }
    }

    pub fn attempt(&self) -> u64 {
        match self {
            ListenerEvent::Submitted { attempt }
            | ListenerEvent::Starting { attempt }
            | ListenerEvent::Aborted { attempt, .. }
            | ListenerEvent::Done { attempt, .. } => *attempt,
        }
    }
}

/// 按顺序记录通知的监听器。
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
    recorded: Condvar,
    cancel_on_submitted: AtomicBool,
    cancel_on_starting: AtomicBool,
    fail_on_submitted: AtomicBool,
    fail_on_starting: AtomicBool,
    panic_on_done: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 在 `on_submitted` 中取消任务。
    pub fn cancelling_on_submitted() -> Arc<Self> {
        let listener = Self::default();
        listener.cancel_on_submitted.store(true, Ordering::Release);
        Arc::new(listener)
    }

    /// 在 `on_starting` 中取消任务。
    pub fn cancelling_on_starting() -> Arc<Self> {
        let listener = Self::default();
        listener.cancel_on_starting.store(true, Ordering::Release);
        Arc::new(listener)
    }

    pub fn failing_on_submitted() -> Arc<Self> {
        let listener = Self::default();
        listener.fail_on_submitted.store(true, Ordering::Release);
        Arc::new(listener)
    }

    pub fn failing_on_starting() -> Arc<Self> {
        let listener = Self::default();
        listener.fail_on_starting.store(true, Ordering::Release);
        Arc::new(listener)
    }

    pub fn panicking_on_done() -> Arc<Self> {
        let listener = Self::default();
        listener.panic_on_done.store(true, Ordering::Release);
        Arc::new(listener)
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ListenerEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    /// 等待名为 `name` 的通知累计达到 `count` 条。
    pub fn wait_for(&self, name: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if events.iter().filter(|event| event.name() == name).count() >= count {
                return true;
            }
            if self.recorded.wait_until(&mut events, deadline).timed_out() {
                return events.iter().filter(|event| event.name() == name).count() >= count;
            }
        }
    }

    fn record(&self, event: ListenerEvent) {
        self.events.lock().push(event);
        self.recorded.notify_all();
    }
}

impl TaskListener for RecordingListener {
    fn on_submitted(&self, event: &TaskEvent<'_>) -> TaskResult<()> {
        self.record(ListenerEvent::Submitted {
            attempt: event.attempt,
        });
        if self.cancel_on_submitted.load(Ordering::Acquire) {
            event.control.cancel(false);
        }
        if self.fail_on_submitted.load(Ordering::Acquire) {
            return Err(Failure::msg("listener refused submission"));
        }
        Ok(())
    }

    fn on_starting(&self, event: &TaskEvent<'_>) -> TaskResult<()> {
        self.record(ListenerEvent::Starting {
            attempt: event.attempt,
        });
        if self.cancel_on_starting.load(Ordering::Acquire) {
            event.control.cancel(false);
        }
        if self.fail_on_starting.load(Ordering::Acquire) {
            return Err(Failure::msg("listener refused to start"));
        }
        Ok(())
    }

    fn on_aborted(&self, event: &TaskEvent<'_>, error: &ConcurrencyError) -> TaskResult<()> {
        self.record(ListenerEvent::Aborted {
            attempt: event.attempt,
            code: error.code(),
        });
        Ok(())
    }

    fn on_done(&self, event: &TaskEvent<'_>, error: Option<&ConcurrencyError>) -> TaskResult<()> {
        self.record(ListenerEvent::Done {
            attempt: event.attempt,
            code: error.map(ConcurrencyError::code),
        });
        if self.panic_on_done.load(Ordering::Acquire) {
            panic!("listener panicked in on_done");
        }
        Ok(())
    }
}

// ---- MarkerProvider ----

thread_local! {
    static MARKERS: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// 读取当前线程上名为 `name` 的标记。
pub fn marker(name: &str) -> Option<String> {
    MARKERS.with(|markers| markers.borrow().get(name).cloned())
}

fn swap_marker(name: &str, value: Option<String>) -> Option<String> {
    MARKERS.with(|markers| {
        let mut markers = markers.borrow_mut();
        match value {
            Some(value) => markers.insert(name.to_owned(), value),
            None => markers.remove(name),
        }
    })
}

/// 以线程局部字符串模拟的上下文提供者。
#[derive(Clone, Debug)]
pub struct MarkerProvider {
    name: String,
    fail_apply: bool,
    fail_capture: bool,
}

impl MarkerProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_apply: false,
            fail_capture: false,
        }
    }

    /// 捕获正常、施加总是失败的提供者。
    pub fn failing_apply(name: impl Into<String>) -> Self {
        Self {
            fail_apply: true,
            ..Self::new(name)
        }
    }

    /// 捕获总是失败的提供者。
    pub fn failing_capture(name: impl Into<String>) -> Self {
        Self {
            fail_capture: true,
            ..Self::new(name)
        }
    }

    /// 设置当前线程上的标记。
    pub fn set(name: &str, value: Option<&str>) {
        swap_marker(name, value.map(str::to_owned));
    }
}

#[derive(Debug)]
struct CapturedMarker {
    name: String,
    value: Option<String>,
    fail_apply: bool,
}

impl CapturedContext for CapturedMarker {
    fn apply(&self) -> TaskResult<RestoreToken> {
        if self.fail_apply {
            return Err(Failure::msg(format!("marker `{}` refused to apply", self.name)));
        }
        let previous = swap_marker(&self.name, self.value.clone());
        Ok(RestoreToken::new(previous))
    }

    fn restore(&self, token: RestoreToken) -> TaskResult<()> {
        let previous = token.into_state::<Option<String>>().flatten();
        swap_marker(&self.name, previous);
        Ok(())
    }
}

impl ContextProvider for MarkerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&self, _properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>> {
        if self.fail_capture {
            return Err(Failure::msg(format!("marker `{}` refused to capture", self.name)));
        }
        Ok(Arc::new(CapturedMarker {
            name: self.name.clone(),
            value: marker(&self.name),
            fail_apply: self.fail_apply,
        }))
    }

    fn cleared(&self, _properties: &ExecutionProperties) -> TaskResult<Arc<dyn CapturedContext>> {
        Ok(Arc::new(CapturedMarker {
            name: self.name.clone(),
            value: None,
            fail_apply: self.fail_apply,
        }))
    }
}

// ---- ScriptedTrigger ----

/// 按脚本运行的触发器。
///
/// 每次 `next_run_time` 取出一个间隔：首次相对调度创建时刻，之后相对上一次运行结束时刻；
/// 间隔用尽时调度结束。`skip_run` 依次取出跳过标记，用尽后不再跳过。
pub struct ScriptedTrigger {
    delays: Mutex<VecDeque<Duration>>,
    skips: Mutex<VecDeque<bool>>,
    observed: Mutex<Vec<Option<LastExecution>>>,
}

impl ScriptedTrigger {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into_iter().collect()),
            skips: Mutex::new(VecDeque::new()),
            observed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_skips(self, skips: impl IntoIterator<Item = bool>) -> Self {
        *self.skips.lock() = skips.into_iter().collect();
        self
    }

    /// 每次 `next_run_time` 调用时看到的上一次执行记录。
    pub fn observed(&self) -> Vec<Option<LastExecution>> {
        self.observed.lock().clone()
    }
}

impl Trigger for ScriptedTrigger {
    fn next_run_time(
        &self,
        last: Option<&LastExecution>,
        task_scheduled_time: SystemTime,
    ) -> Option<SystemTime> {
        self.observed.lock().push(last.cloned());
        let delay = self.delays.lock().pop_front()?;
        let base = last.map_or(task_scheduled_time, LastExecution::run_end);
        Some(base + delay)
    }

    fn skip_run(
        &self,
        _last: Option<&LastExecution>,
        _scheduled_run_time: SystemTime,
    ) -> TaskResult<bool> {
        Ok(self.skips.lock().pop_front().unwrap_or(false))
    }
}
