use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::CoreError;

/// 一次通道操作的最终结局。
///
/// # 契约说明（What）
/// - `Success`：操作完成。
/// - `Failure`：操作失败，根因以 `Arc` 共享（同一根因可能喂给多个观察者）。
/// - `Cancelled`：用户在核心接管（`set_uncancellable`）之前取消了操作。
#[derive(Clone, Debug)]
pub enum OpOutcome {
    Success,
    Failure(Arc<CoreError>),
    Cancelled,
}

impl OpOutcome {
    /// 是否成功完成。
    pub fn is_success(&self) -> bool {
        matches!(self, OpOutcome::Success)
    }

    /// 是否以失败告终。
    pub fn is_failure(&self) -> bool {
        matches!(self, OpOutcome::Failure(_))
    }

    /// 是否被取消。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OpOutcome::Cancelled)
    }

    /// 获取失败根因。
    pub fn failure(&self) -> Option<&Arc<CoreError>> {
        match self {
            OpOutcome::Failure(cause) => Some(cause),
            _ => None,
        }
    }
}

type Listener = Box<dyn FnOnce(&OpOutcome) + Send + 'static>;

struct CellState {
    outcome: Option<OpOutcome>,
    uncancellable: bool,
    listeners: Vec<Listener>,
    wakers: Vec<Waker>,
}

struct Cell {
    state: Mutex<CellState>,
    completed: Condvar,
}

/// `OpPromise` 是单发完成单元：通道的每个异步操作返回它的 [`OpFuture`] 视图。
///
/// # 设计背景（Why）
/// - 核心的所有操作都在事件循环上同步推进，外部只通过 Promise 观察异步结局；
///   这与管线把操作回投到循环的路由方式配套。
/// - `set_uncancellable` 是核心接管操作的闸门：一旦接管，用户取消不再生效，
///   避免取消与完成之间的竞态撕裂状态机。
///
/// # 逻辑解析（How）
/// - 内部为互斥保护的状态单元加条件变量；完成时先在锁内迁移状态、摘下监听器，
///   随后在锁外依次回调，保证监听器可以安全地重入通道。
/// - 监听器在完成线程上同步触发；核心的完成都发生在事件循环线程。
///
/// # 契约说明（What）
/// - **后置条件**：完成恰好发生一次；后续 `try_*` 返回 `false` 且不产生副作用。
#[derive(Clone)]
pub struct OpPromise {
    cell: Arc<Cell>,
}

impl OpPromise {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(Cell {
                state: Mutex::new(CellState {
                    outcome: None,
                    uncancellable: false,
                    listeners: Vec::new(),
                    wakers: Vec::new(),
                }),
                completed: Condvar::new(),
            }),
        }
    }

    /// 获取只读的未来视图。
    pub fn future(&self) -> OpFuture {
        OpFuture {
            cell: Arc::clone(&self.cell),
        }
    }

    /// 尝试以成功完成；若已完成则返回 `false`。
    pub fn try_success(&self) -> bool {
        self.complete(OpOutcome::Success)
    }

    /// 尝试以失败完成；若已完成则返回 `false`。
    pub fn try_failure(&self, cause: impl Into<Arc<CoreError>>) -> bool {
        self.complete(OpOutcome::Failure(cause.into()))
    }

    /// 尝试取消。核心接管（`set_uncancellable`）之后取消失败。
    pub fn cancel(&self) -> bool {
        {
            let state = self.cell.state.lock();
            if state.uncancellable || state.outcome.is_some() {
                return false;
            }
        }
        self.complete(OpOutcome::Cancelled)
    }

    /// 标记为不可取消。
    ///
    /// 返回 `true` 表示核心可以继续推进该操作：要么成功上闩，要么操作已经以
    /// 非取消方式完成。返回 `false` 意味着用户已抢先取消。
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.cell.state.lock();
        match &state.outcome {
            None => {
                state.uncancellable = true;
                true
            }
            Some(OpOutcome::Cancelled) => false,
            Some(_) => true,
        }
    }

    /// 是否已完成。
    pub fn is_done(&self) -> bool {
        self.cell.state.lock().outcome.is_some()
    }

    /// 获取已完成的结局快照。
    pub fn outcome(&self) -> Option<OpOutcome> {
        self.cell.state.lock().outcome.clone()
    }

    /// 注册完成监听器；若已完成则立即在当前线程触发。
    pub fn add_listener(&self, listener: impl FnOnce(&OpOutcome) + Send + 'static) {
        let mut state = self.cell.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                listener(&outcome);
            }
            None => state.listeners.push(Box::new(listener)),
        }
    }

    fn complete(&self, outcome: OpOutcome) -> bool {
        let (listeners, wakers, outcome) = {
            let mut state = self.cell.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            let listeners = std::mem::take(&mut state.listeners);
            let wakers = std::mem::take(&mut state.wakers);
            self.cell.completed.notify_all();
            (listeners, wakers, outcome)
        };
        // 监听器与唤醒都在锁外执行，允许回调重入通道。
        for listener in listeners {
            listener(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl Default for OpPromise {
    fn default() -> Self {
        Self::new()
    }
}

/// `OpFuture` 是 [`OpPromise`] 的观察端：可轮询、可阻塞等待、可（在接管前）取消。
#[derive(Clone)]
pub struct OpFuture {
    cell: Arc<Cell>,
}

impl OpFuture {
    /// 是否已完成。
    pub fn is_done(&self) -> bool {
        self.cell.state.lock().outcome.is_some()
    }

    /// 获取已完成的结局快照。
    pub fn outcome(&self) -> Option<OpOutcome> {
        self.cell.state.lock().outcome.clone()
    }

    /// 用户侧取消入口，语义与 [`OpPromise::cancel`] 一致。
    pub fn cancel(&self) -> bool {
        OpPromise {
            cell: Arc::clone(&self.cell),
        }
        .cancel()
    }

    /// 注册完成监听器；若已完成则立即触发。
    pub fn add_listener(&self, listener: impl FnOnce(&OpOutcome) + Send + 'static) {
        OpPromise {
            cell: Arc::clone(&self.cell),
        }
        .add_listener(listener);
    }

    /// 阻塞等待完成，超时返回 `None`。供测试与同步宿主使用；
    /// 严禁在事件循环线程上调用（会自锁）。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<OpOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.cell.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self
                .cell
                .completed
                .wait_for(&mut state, deadline - now)
                .timed_out()
            {
                return state.outcome.clone();
            }
        }
    }
}

impl Future for OpFuture {
    type Output = OpOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn completes_exactly_once() {
        let promise = OpPromise::new();
        assert!(promise.try_success());
        assert!(!promise.try_failure(CoreError::new(codes::TRANSPORT_IO, "late")));
        assert!(promise.outcome().expect("done").is_success());
    }

    #[test]
    fn uncancellable_latch_blocks_cancel() {
        let promise = OpPromise::new();
        assert!(promise.set_uncancellable());
        assert!(!promise.future().cancel());
        assert!(promise.try_success());
    }

    #[test]
    fn cancel_before_latch_wins() {
        let promise = OpPromise::new();
        assert!(promise.future().cancel());
        assert!(!promise.set_uncancellable(), "取消后核心不得接管");
        assert!(promise.outcome().expect("done").is_cancelled());
    }

    #[test]
    fn listeners_fire_once_and_late_listeners_fire_inline() {
        let promise = OpPromise::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let early = Arc::clone(&fired);
        promise.add_listener(move |outcome| {
            assert!(outcome.is_failure());
            early.fetch_add(1, Ordering::SeqCst);
        });
        promise.try_failure(CoreError::new(codes::TRANSPORT_IO, "boom"));
        let late = Arc::clone(&fired);
        promise.add_listener(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_timeout_observes_completion_from_other_thread() {
        let promise = OpPromise::new();
        let future = promise.future();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.try_success();
        });
        let outcome = future.wait_timeout(Duration::from_secs(2)).expect("completed");
        assert!(outcome.is_success());
        worker.join().expect("worker exits");
    }

    #[test]
    fn wait_timeout_expires_when_pending() {
        let promise = OpPromise::new();
        assert!(promise
            .future()
            .wait_timeout(Duration::from_millis(10))
            .is_none());
    }
}
