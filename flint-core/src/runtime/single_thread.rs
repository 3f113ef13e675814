use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::{EventExecutor, Task, TimerToken};

struct TimerEntry {
    deadline: Instant,
    id: u64,
    task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap 为大顶堆，反转比较得到最早截止优先。
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Sched {
    queue: VecDeque<Task>,
    timers: BinaryHeap<TimerEntry>,
    live_timers: HashSet<u64>,
    shutdown: bool,
}

struct Shared {
    sched: Mutex<Sched>,
    wakeup: Condvar,
    thread_id: OnceLock<ThreadId>,
}

/// `SingleThreadLoop` 是 [`EventExecutor`] 的专线实现：一条专属线程、一个 FIFO
/// 任务队列、一个小顶堆定时器。
///
/// # 设计背景（Why）
/// - 通道核心的并发模型是“单线程协作”；本实现为端到端场景与嵌入方提供最小可用
///   的循环宿主，不做任何 IO 轮询（IO 触发由具体传输负责投递）。
///
/// # 逻辑解析（How）
/// - 队列任务优先于定时任务；无事可做时在条件变量上停车，至多停到最近截止时间。
/// - 定时器取消采用活跃集合：`cancel` 将 id 移出集合，堆中尸体在弹出时丢弃。
///
/// # 契约说明（What）
/// - **后置条件**：`shutdown_gracefully` 返回时队列中先于停机标记的任务已全部
///   执行完毕；之后的 `execute` 丢弃任务并记录告警。
pub struct SingleThreadLoop {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_timer_id: AtomicU64,
}

impl SingleThreadLoop {
    /// 启动一条命名循环线程。
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            sched: Mutex::new(Sched {
                queue: VecDeque::new(),
                timers: BinaryHeap::new(),
                live_timers: HashSet::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
            thread_id: OnceLock::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _ = worker_shared.thread_id.set(thread::current().id());
                run(&worker_shared);
            })
            .expect("spawn event loop thread");
        Arc::new(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            next_timer_id: AtomicU64::new(1),
        })
    }

    /// 停机：处理完既有队列任务后退出线程并等待其结束。
    ///
    /// 待触发的定时任务被丢弃。禁止在循环线程自身上调用（会自我等待）。
    pub fn shutdown_gracefully(&self) {
        {
            let mut sched = self.shared.sched.lock();
            if sched.shutdown {
                return;
            }
            sched.shutdown = true;
            self.shared.wakeup.notify_all();
        }
        if self.in_event_loop() {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: &Shared) {
    loop {
        let task = {
            let mut sched = shared.sched.lock();
            loop {
                if let Some(task) = sched.queue.pop_front() {
                    break task;
                }
                let now = Instant::now();
                if let Some(entry) = sched.timers.peek() {
                    if entry.deadline <= now {
                        let entry = sched.timers.pop().expect("peeked entry");
                        if sched.live_timers.remove(&entry.id) {
                            break entry.task;
                        }
                        continue;
                    }
                }
                if sched.shutdown {
                    return;
                }
                match sched.timers.peek().map(|entry| entry.deadline) {
                    Some(deadline) => {
                        shared.wakeup.wait_for(&mut sched, deadline - now);
                    }
                    None => shared.wakeup.wait(&mut sched),
                }
            }
        };
        task();
    }
}

impl EventExecutor for SingleThreadLoop {
    fn execute(&self, task: Task) {
        let mut sched = self.shared.sched.lock();
        if sched.shutdown {
            warn!(target: "flint_core::runtime", "event loop already shut down; task dropped");
            return;
        }
        sched.queue.push_back(task);
        self.shared.wakeup.notify_all();
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerToken {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let mut sched = self.shared.sched.lock();
        if sched.shutdown {
            warn!(target: "flint_core::runtime", "event loop already shut down; timer dropped");
            return TimerToken(id);
        }
        sched.live_timers.insert(id);
        sched.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            task,
        });
        self.shared.wakeup.notify_all();
        TimerToken(id)
    }

    fn cancel(&self, token: TimerToken) -> bool {
        self.shared.sched.lock().live_timers.remove(&token.0)
    }

    fn in_event_loop(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }
}

impl Drop for SingleThreadLoop {
    fn drop(&mut self) {
        self.shutdown_gracefully();
    }
}
