use std::time::Duration;

mod single_thread;

pub use single_thread::SingleThreadLoop;

/// 投递到事件循环的一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 定时任务句柄，用于取消尚未触发的定时器。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken(pub(crate) u64);

/// `EventExecutor` 是通道核心对事件循环的全部要求。
///
/// # 设计背景（Why）
/// - 每个通道被钉死在唯一的事件循环上；所有状态迁移、缓冲变更与管线事件都在该
///   循环线程上推进。核心只需要四个原语：投递、定时、取消、线程归属判定。
/// - 出站操作触发的入站事件（例如出站 `close` 需要补发 `channel_inactive`）必须
///   经 `execute` 延后投递而非就地触发，防止同一 Handler 的两次回调相互嵌套。
///
/// # 契约说明（What）
/// - `execute`：入队任务；实现必须保持入队顺序并在循环线程上执行。循环已停止时
///   允许丢弃任务，但应记录告警。
/// - `schedule`：延迟投递；返回的 [`TimerToken`] 可交给 `cancel`。
/// - `cancel`：取消尚未触发的定时任务，返回是否确有取消发生。
/// - `in_event_loop`：当前线程是否就是循环线程；核心据此做重入断言与跨线程改道。
///
/// # 风险提示（Trade-offs）
/// - 任务为 `FnOnce + Send`：跨线程投递是常态（配置变更、取消监听都可能发生在
///   任意线程），循环内自投递同样走该通路以保持顺序语义单一。
pub trait EventExecutor: Send + Sync + 'static {
    /// 投递一个任务到循环线程。
    fn execute(&self, task: Task);

    /// 延迟 `delay` 后在循环线程上执行任务。
    fn schedule(&self, delay: Duration, task: Task) -> TimerToken;

    /// 取消定时任务；仅当任务仍在等待时返回 `true`。
    fn cancel(&self, token: TimerToken) -> bool;

    /// 判断当前线程是否为该循环的执行线程。
    fn in_event_loop(&self) -> bool;
}
