//! 通道核心合约测试使用的桩对象合集。
//!
//! # 设计定位（Why）
//! - 合约测试与端到端验证反复需要满足 [`Controller`]、[`Transport`]、
//!   [`EventExecutor`] 契约的最小实现；集中提供避免各测试文件重复定义，
//!   并在契约演进时获得单点编译错误提示。
//!
//! # 使用方式（How）
//! - [`RecordingController`] 记录全部管线事件并支持条件等待。
//! - [`ManualExecutor`] 是确定性的手摇循环：任务入队不执行，由测试显式
//!   `run_pending` 泵动；定时器用虚拟时钟 `advance` 推进。
//! - [`MockTransport`] 以脚本驱动读写钩子，并记录每次钩子调用。
//!
//! # 契约说明（What）
//! - 桩对象仅面向测试与示例；生产代码若依赖应显式说明原因。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::buffer::PipelineMessage;
use crate::error::CoreError;
use crate::pipeline::Controller;
use crate::runtime::{EventExecutor, Task, TimerToken};
use crate::transport::{ConnectResult, ShutdownDirection, Transport, TransportAddr};
use crate::{ReadSink, WriteSink};

/// 吞掉一切事件的控制器。
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopController;

impl Controller for NoopController {
    fn emit_channel_registered(&self) {}
    fn emit_channel_unregistered(&self) {}
    fn emit_channel_active(&self) {}
    fn emit_channel_inactive(&self) {}
    fn emit_channel_shutdown(&self, _direction: ShutdownDirection) {}
    fn emit_read(&self, _msg: PipelineMessage) {}
    fn emit_read_complete(&self) {}
    fn emit_writability_changed(&self, _writable: bool) {}
    fn emit_exception(&self, _error: Arc<CoreError>) {}
}

/// 管线事件的记录形态。
#[derive(Debug)]
pub enum ChannelEvent {
    Registered,
    Unregistered,
    Active,
    Inactive,
    Shutdown(ShutdownDirection),
    Read(PipelineMessage),
    ReadComplete,
    WritabilityChanged(bool),
    Exception(Arc<CoreError>),
}

impl ChannelEvent {
    /// 事件的稳定名字，便于断言序列。
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Registered => "registered",
            ChannelEvent::Unregistered => "unregistered",
            ChannelEvent::Active => "active",
            ChannelEvent::Inactive => "inactive",
            ChannelEvent::Shutdown(_) => "shutdown",
            ChannelEvent::Read(_) => "read",
            ChannelEvent::ReadComplete => "read_complete",
            ChannelEvent::WritabilityChanged(_) => "writability_changed",
            ChannelEvent::Exception(_) => "exception",
        }
    }
}

/// 记录所有事件并支持条件等待的控制器。
pub struct RecordingController {
    events: Mutex<Vec<ChannelEvent>>,
    recorded: Condvar,
}

impl RecordingController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            recorded: Condvar::new(),
        })
    }

    fn record(&self, event: ChannelEvent) {
        self.events.lock().push(event);
        self.recorded.notify_all();
    }

    /// 摘走全部已记录事件。
    pub fn take_events(&self) -> Vec<ChannelEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// 当前事件名序列快照。
    pub fn event_names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.name()).collect()
    }

    /// 统计某一事件出现的次数。
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// 可写性迁移序列。
    pub fn writability_changes(&self) -> Vec<bool> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::WritabilityChanged(writable) => Some(*writable),
                _ => None,
            })
            .collect()
    }

    /// 阻塞等待事件序列满足谓词；跨循环断言用。
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&[ChannelEvent]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();
        loop {
            if pred(&events) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.recorded.wait_for(&mut events, deadline - now);
        }
    }
}

impl Controller for RecordingController {
    fn emit_channel_registered(&self) {
        self.record(ChannelEvent::Registered);
    }

    fn emit_channel_unregistered(&self) {
        self.record(ChannelEvent::Unregistered);
    }

    fn emit_channel_active(&self) {
        self.record(ChannelEvent::Active);
    }

    fn emit_channel_inactive(&self) {
        self.record(ChannelEvent::Inactive);
    }

    fn emit_channel_shutdown(&self, direction: ShutdownDirection) {
        self.record(ChannelEvent::Shutdown(direction));
    }

    fn emit_read(&self, msg: PipelineMessage) {
        self.record(ChannelEvent::Read(msg));
    }

    fn emit_read_complete(&self) {
        self.record(ChannelEvent::ReadComplete);
    }

    fn emit_writability_changed(&self, writable: bool) {
        self.record(ChannelEvent::WritabilityChanged(writable));
    }

    fn emit_exception(&self, error: Arc<CoreError>) {
        self.record(ChannelEvent::Exception(error));
    }
}

struct ManualTimer {
    id: u64,
    due: Duration,
    task: Task,
}

struct ManualState {
    queue: VecDeque<Task>,
    timers: Vec<ManualTimer>,
    now: Duration,
    next_timer_id: u64,
}

/// 确定性的手摇执行器：`in_event_loop` 恒真，任务与定时全靠测试显式泵动。
pub struct ManualExecutor {
    state: Mutex<ManualState>,
}

impl ManualExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ManualState {
                queue: VecDeque::new(),
                timers: Vec::new(),
                now: Duration::ZERO,
                next_timer_id: 1,
            }),
        })
    }

    /// 执行当前积压的全部任务（含执行过程中新入队者）。
    pub fn run_pending(&self) {
        loop {
            let task = self.state.lock().queue.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// 推进虚拟时钟并触发到期定时任务，随后清空任务队列。
    pub fn advance(&self, delta: Duration) {
        let due_tasks = {
            let mut state = self.state.lock();
            state.now += delta;
            let now = state.now;
            let mut due: Vec<ManualTimer> = Vec::new();
            let mut remaining = Vec::new();
            for timer in state.timers.drain(..) {
                if timer.due <= now {
                    due.push(timer);
                } else {
                    remaining.push(timer);
                }
            }
            state.timers = remaining;
            due.sort_by_key(|t| (t.due, t.id));
            due
        };
        for timer in due_tasks {
            (timer.task)();
            self.run_pending();
        }
        self.run_pending();
    }

    /// 积压任务数。
    pub fn pending_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 尚未触发的定时任务数。
    pub fn scheduled_len(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl EventExecutor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.state.lock().queue.push_back(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerToken {
        let mut state = self.state.lock();
        let id = state.next_timer_id;
        state.next_timer_id += 1;
        let due = state.now + delay;
        state.timers.push(ManualTimer { id, due, task });
        TimerToken(id)
    }

    fn cancel(&self, token: TimerToken) -> bool {
        let mut state = self.state.lock();
        let before = state.timers.len();
        state.timers.retain(|t| TimerToken(t.id) != token);
        state.timers.len() != before
    }

    fn in_event_loop(&self) -> bool {
        true
    }
}

/// `read_now` 的脚本步骤。
pub enum ReadStep {
    /// 投递一条消息（字节数按消息可读字节上报）。
    Message(PipelineMessage),
    /// 对端 EOF：`read_now` 返回 `Ok(true)`。
    Eof,
    /// 以错误中断本轮读取。
    Error(CoreError),
}

/// `write_now` 的脚本步骤。
pub enum WriteStep {
    /// 正常上报一次写入。
    Complete {
        attempted: u64,
        actual: u64,
        messages: Option<usize>,
        might_continue: bool,
    },
    /// 上报一次可恢复失败（头部条目出队）。
    FailEntry { code: &'static str, might_continue: bool },
    /// 直接让 `write_now` 返回错误。
    Error(&'static str),
    /// 违约：不调用 `complete` 便返回。
    SkipComplete,
    /// 违约：同一轮里上报两次。
    DoubleComplete,
}

/// 脚本驱动的传输桩。
///
/// 状态旋钮全部以原子量/互斥量暴露，测试可在任意时刻拧动；每次钩子调用都
/// 记录在 `calls` 里供断言。
pub struct MockTransport {
    open: AtomicBool,
    active: AtomicBool,
    inbound_shutdown: AtomicBool,
    outbound_shutdown: AtomicBool,
    server: AtomicBool,
    disconnect_supported: AtomicBool,
    fast_open: AtomicBool,
    activate_on_bind: AtomicBool,
    connect_result: Mutex<Option<Result<ConnectResult, CoreError>>>,
    finish_connect_result: Mutex<Option<Result<bool, CoreError>>>,
    register_result: Mutex<Option<CoreError>>,
    read_script: Mutex<VecDeque<ReadStep>>,
    write_script: Mutex<VecDeque<WriteStep>>,
    close_executor: Mutex<Option<Arc<dyn EventExecutor>>>,
    local: Mutex<Option<TransportAddr>>,
    remote: Mutex<Option<TransportAddr>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            active: AtomicBool::new(false),
            inbound_shutdown: AtomicBool::new(false),
            outbound_shutdown: AtomicBool::new(false),
            server: AtomicBool::new(false),
            disconnect_supported: AtomicBool::new(false),
            fast_open: AtomicBool::new(false),
            activate_on_bind: AtomicBool::new(true),
            connect_result: Mutex::new(None),
            finish_connect_result: Mutex::new(None),
            register_result: Mutex::new(None),
            read_script: Mutex::new(VecDeque::new()),
            write_script: Mutex::new(VecDeque::new()),
            close_executor: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn set_server(&self, server: bool) {
        self.server.store(server, Ordering::SeqCst);
    }

    pub fn set_supports_disconnect(&self, supported: bool) {
        self.disconnect_supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_fast_open(&self, enabled: bool) {
        self.fast_open.store(enabled, Ordering::SeqCst);
    }

    pub fn set_remote(&self, addr: Option<TransportAddr>) {
        *self.remote.lock() = addr;
    }

    pub fn set_connect_result(&self, result: Result<ConnectResult, CoreError>) {
        *self.connect_result.lock() = Some(result);
    }

    pub fn set_finish_connect_result(&self, result: Result<bool, CoreError>) {
        *self.finish_connect_result.lock() = Some(result);
    }

    pub fn fail_next_register(&self, cause: CoreError) {
        *self.register_result.lock() = Some(cause);
    }

    /// 让 `prepare_to_close` 交出外部关闭执行器（SO_LINGER 类场景）。
    pub fn set_close_executor(&self, executor: Arc<dyn EventExecutor>) {
        *self.close_executor.lock() = Some(executor);
    }

    pub fn script_read(&self, step: ReadStep) {
        self.read_script.lock().push_back(step);
    }

    pub fn script_write(&self, step: WriteStep) {
        self.write_script.lock().push_back(step);
    }

    /// 钩子调用记录快照。
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn log(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

impl Transport for MockTransport {
    fn local_addr(&self) -> Option<TransportAddr> {
        self.local.lock().clone()
    }

    fn remote_addr(&self) -> Option<TransportAddr> {
        self.remote.lock().clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.active.load(Ordering::SeqCst)
    }

    fn is_shutdown(&self, direction: ShutdownDirection) -> bool {
        if !self.is_open() {
            return true;
        }
        match direction {
            ShutdownDirection::Inbound => self.inbound_shutdown.load(Ordering::SeqCst),
            ShutdownDirection::Outbound => self.outbound_shutdown.load(Ordering::SeqCst),
        }
    }

    fn is_server(&self) -> bool {
        self.server.load(Ordering::SeqCst)
    }

    fn supports_disconnect(&self) -> bool {
        self.disconnect_supported.load(Ordering::SeqCst)
    }

    fn register_io(&self) -> Result<(), CoreError> {
        self.log("register_io");
        match self.register_result.lock().take() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    fn deregister_io(&self) -> Result<(), CoreError> {
        self.log("deregister_io");
        Ok(())
    }

    fn bind(&self, addr: &TransportAddr) -> Result<(), CoreError> {
        self.log("bind");
        *self.local.lock() = Some(addr.clone());
        if self.activate_on_bind.load(Ordering::SeqCst) {
            self.active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn connect(
        &self,
        remote: &TransportAddr,
        _local: Option<&TransportAddr>,
        _initial: Option<&bytes::Bytes>,
    ) -> Result<ConnectResult, CoreError> {
        self.log("connect");
        match self.connect_result.lock().take() {
            Some(Ok(result)) => {
                if matches!(result, ConnectResult::Connected { .. }) {
                    self.active.store(true, Ordering::SeqCst);
                    *self.remote.lock() = Some(remote.clone());
                }
                Ok(result)
            }
            Some(Err(cause)) => Err(cause),
            None => Ok(ConnectResult::Pending),
        }
    }

    fn finish_connect(&self, requested: &TransportAddr) -> Result<bool, CoreError> {
        self.log("finish_connect");
        match self.finish_connect_result.lock().take() {
            Some(Ok(true)) | None => {
                self.active.store(true, Ordering::SeqCst);
                *self.remote.lock() = Some(requested.clone());
                Ok(true)
            }
            Some(Ok(false)) => Ok(false),
            Some(Err(cause)) => Err(cause),
        }
    }

    fn disconnect(&self) -> Result<(), CoreError> {
        self.log("disconnect");
        self.active.store(false, Ordering::SeqCst);
        *self.remote.lock() = None;
        Ok(())
    }

    fn close(&self) -> Result<(), CoreError> {
        self.log("close");
        self.open.store(false, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CoreError> {
        self.log("shutdown");
        match direction {
            ShutdownDirection::Inbound => self.inbound_shutdown.store(true, Ordering::SeqCst),
            ShutdownDirection::Outbound => self.outbound_shutdown.store(true, Ordering::SeqCst),
        }
        Ok(())
    }

    fn read(&self, _was_pending: bool) -> Result<(), CoreError> {
        self.log("read");
        Ok(())
    }

    fn read_now(&self, sink: &mut ReadSink<'_>) -> Result<bool, CoreError> {
        self.log("read_now");
        let mut delivered = false;
        loop {
            let step = self.read_script.lock().pop_front();
            match step {
                Some(ReadStep::Message(msg)) => {
                    delivered = true;
                    let bytes = msg.readable_bytes();
                    if !sink.process_read(bytes, bytes, Some(msg)) {
                        return Ok(false);
                    }
                }
                Some(ReadStep::Eof) => return Ok(true),
                Some(ReadStep::Error(cause)) => return Err(cause),
                None => {
                    if !delivered {
                        sink.process_read(0, 0, None);
                    }
                    return Ok(false);
                }
            }
        }
    }

    fn write_now(&self, sink: &mut WriteSink<'_>) -> Result<(), CoreError> {
        self.log("write_now");
        let step = self.write_script.lock().pop_front();
        match step {
            Some(WriteStep::Complete {
                attempted,
                actual,
                messages,
                might_continue,
            }) => {
                sink.complete(attempted, actual, messages, might_continue);
                Ok(())
            }
            Some(WriteStep::FailEntry {
                code,
                might_continue,
            }) => {
                sink.complete_err(0, CoreError::new(code, "scripted write failure"), might_continue);
                Ok(())
            }
            Some(WriteStep::Error(code)) => Err(CoreError::new(code, "scripted write error")),
            Some(WriteStep::SkipComplete) => Ok(()),
            Some(WriteStep::DoubleComplete) => {
                sink.complete(0, 0, Some(0), false);
                sink.complete(0, 0, Some(0), false);
                Ok(())
            }
            None => {
                // 默认脚本：整条写掉头部消息。
                let bytes = sink
                    .with_first(|msg| msg.readable_bytes() as u64)
                    .unwrap_or(0);
                sink.complete(bytes, bytes, Some(1), true);
                Ok(())
            }
        }
    }

    fn clear_scheduled_read(&self) {
        self.log("clear_scheduled_read");
    }

    fn prepare_to_close(&self) -> Option<Arc<dyn EventExecutor>> {
        self.close_executor.lock().clone()
    }

    fn is_fast_open_connect(&self) -> bool {
        self.fast_open.load(Ordering::SeqCst)
    }
}
