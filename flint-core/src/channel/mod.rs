use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use crate::buffer::{
    default_allocator, default_read_allocator, default_size_estimator, BufferAllocator,
    MessageSizeEstimator, PipelineMessage, ReadBufferAllocator,
};
use crate::error::{annotate_connect_error, closed_channel, codes, CoreError};
use crate::future::{OpFuture, OpPromise};
use crate::pipeline::Controller;
use crate::runtime::{EventExecutor, TimerToken};
use crate::transport::{ConnectResult, ShutdownDirection, Transport, TransportAddr};

pub mod handles;
pub mod id;
pub mod options;
mod outbound;
pub mod sink;

use handles::{
    AdaptiveReadHandleFactory, MaxMessagesWriteHandleFactory, ReadHandle, ReadHandleFactory,
    WriteHandle, WriteHandleFactory,
};
use id::ChannelId;
use options::{ChannelOption, WriteBufferWaterMark};
use outbound::{Completions, OutboundBuffer};
use sink::{ReadSink, WriteSink};

/// 只在事件循环线程上触碰的状态。锁本身无竞争，存在只为跨线程移动 `Channel`；
/// **绝不**在持锁期间调用管线或传输钩子（重入会自锁）。
struct CoreState {
    outbound: Option<OutboundBuffer>,
    close_initiated: bool,
    initial_close_cause: Option<Arc<CoreError>>,
    never_registered: bool,
    never_active: bool,
    in_write_flushed: bool,
    input_closed_seen_error: bool,
    read_before_active: Option<Arc<dyn ReadBufferAllocator>>,
    pending_read_allocator: Option<Arc<dyn ReadBufferAllocator>>,
    connect_promise: Option<OpPromise>,
    connect_timeout_task: Option<TimerToken>,
    requested_remote: Option<TransportAddr>,
    read_handle: Option<Box<dyn ReadHandle>>,
    write_handle: Option<Box<dyn WriteHandle>>,
}

/// 一轮读循环的裁决。
enum ReadVerdict {
    Completed { closed: bool },
    FailedTransient,
    FailedShutdownReadSide,
    FailedClose,
}

/// `Channel` 是单条双工通道的骨架状态机：向上经 [`Controller`] 对接管线，
/// 向下经 [`Transport`] 能力集驱动具体传输，自身不做任何系统调用。
///
/// # 设计背景（Why）
/// - 注册、绑定、连接（含超时与快速打开）、读取背压、水位可写性、半关闭与
///   优雅拆除是所有传输共享的硬核逻辑，集中在一处实现；epoll/kqueue/进程内
///   等后端只补齐能力集钩子。
/// - 通道被钉死在唯一事件循环上：除可写标志外没有任何跨线程 CAS，整个状态机
///   靠单线程构造保证一致性。
///
/// # 逻辑解析（How）
/// - 跨线程可读的配置与标志以原子量或独立互斥量存放；循环专属状态集中在
///   `CoreState`，其锁从不跨越对外回调。
/// - 出站操作触发的入站事件（关闭补发 `channel_inactive` 等）一律经
///   `executor.execute` 延后投递，避免同一 Handler 的回调相互嵌套。
/// - Promise 的完成统一经 `safe_*`（迟到完成记告警）或 [`Completions`]
///  （锁外批量触发）。
///
/// # 契约说明（What）
/// - 所有公开操作必须在本通道的事件循环线程上调用（debug 断言把关）；
///   跨线程路由是管线的职责。
/// - 关闭 Promise 只能由核心完成；`close_future` 仅暴露观察端。
/// - `channel_active` 整个生命周期至多触发一次，再注册不重放。
pub struct Channel {
    id: ChannelId,
    // 自引用，用于把延后任务（闭包捕获强引用）投回循环。
    self_ref: Weak<Channel>,
    parent: Option<Arc<Channel>>,
    executor: Arc<dyn EventExecutor>,
    transport: Arc<dyn Transport>,
    controller: Arc<dyn Controller>,
    supports_disconnect: bool,

    // 跨线程可读区：任意线程 load，循环线程（或经循环改道的配置路径）store。
    writable: AtomicBool,
    auto_read: AtomicBool,
    auto_close: AtomicBool,
    allow_half_closure: AtomicBool,
    registered: AtomicBool,
    connect_timeout_millis: AtomicU64,
    water_mark: Mutex<WriteBufferWaterMark>,
    allocator: Mutex<Arc<dyn BufferAllocator>>,
    read_handle_factory: Mutex<Arc<dyn ReadHandleFactory>>,
    write_handle_factory: Mutex<Arc<dyn WriteHandleFactory>>,
    size_estimator: Mutex<Arc<dyn MessageSizeEstimator>>,
    local_addr: Mutex<Option<TransportAddr>>,
    remote_addr: Mutex<Option<TransportAddr>>,

    state: Mutex<CoreState>,
    close_promise: OpPromise,
}

impl Channel {
    /// 构造通道。`parent` 为派生关系（服务端子通道指向其监听通道）。
    ///
    /// 管线应只持有返回值的 `Weak` 引用：通道独占管线，反向强引用会成环。
    pub fn new(
        parent: Option<Arc<Channel>>,
        executor: Arc<dyn EventExecutor>,
        transport: Arc<dyn Transport>,
        controller: Arc<dyn Controller>,
    ) -> Arc<Channel> {
        let supports_disconnect = transport.supports_disconnect();
        Arc::new_cyclic(|self_ref| Channel {
            id: ChannelId::next(),
            self_ref: Weak::clone(self_ref),
            parent,
            executor,
            transport,
            controller,
            supports_disconnect,
            writable: AtomicBool::new(true),
            auto_read: AtomicBool::new(true),
            auto_close: AtomicBool::new(true),
            allow_half_closure: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            connect_timeout_millis: AtomicU64::new(30_000),
            water_mark: Mutex::new(WriteBufferWaterMark::default()),
            allocator: Mutex::new(default_allocator()),
            read_handle_factory: Mutex::new(Arc::new(AdaptiveReadHandleFactory::default())),
            write_handle_factory: Mutex::new(Arc::new(MaxMessagesWriteHandleFactory::default())),
            size_estimator: Mutex::new(default_size_estimator()),
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            state: Mutex::new(CoreState {
                outbound: Some(OutboundBuffer::new()),
                close_initiated: false,
                initial_close_cause: None,
                never_registered: true,
                never_active: true,
                in_write_flushed: false,
                input_closed_seen_error: false,
                read_before_active: None,
                pending_read_allocator: None,
                connect_promise: None,
                connect_timeout_task: None,
                requested_remote: None,
                read_handle: None,
                write_handle: None,
            }),
            close_promise: OpPromise::new(),
        })
    }

    // 方法总是经由活着的 Arc 调用，升级失败只可能发生在析构途中。
    fn self_arc(&self) -> Arc<Channel> {
        self.self_ref
            .upgrade()
            .expect("channel outlives its in-flight operations")
    }

    // ---------------------------------------------------------------- 查询面

    /// 通道标识。
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// 派生来源（服务端子通道的监听通道）。
    pub fn parent(&self) -> Option<&Arc<Channel>> {
        self.parent.as_ref()
    }

    /// 所属事件循环。
    pub fn executor(&self) -> &Arc<dyn EventExecutor> {
        &self.executor
    }

    /// 底层传输。
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// 管线控制面。
    pub fn controller(&self) -> &Arc<dyn Controller> {
        &self.controller
    }

    /// 是否已注册到事件循环。
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// 底层资源尚未关闭。
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// 是否处于活跃态。
    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    /// 指定方向是否已半关闭。
    pub fn is_shutdown(&self, direction: ShutdownDirection) -> bool {
        self.transport.is_shutdown(direction)
    }

    /// 关闭完成的观察端。该 Promise 只能由核心完成。
    pub fn close_future(&self) -> OpFuture {
        self.close_promise.future()
    }

    /// 本端地址（带缓存；关闭竞态下返回 `None`）。
    pub fn local_address(&self) -> Option<TransportAddr> {
        let mut cached = self.local_addr.lock();
        if cached.is_none() {
            *cached = self.transport.local_addr();
        }
        cached.clone()
    }

    /// 远端地址（带缓存）。
    pub fn remote_address(&self) -> Option<TransportAddr> {
        let mut cached = self.remote_addr.lock();
        if cached.is_none() {
            *cached = self.transport.remote_addr();
        }
        cached.clone()
    }

    /// 当前可写标志。任意线程可读。
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// 距高水位还能写入的字节；不可写时恒为 0。任意线程可读，尽力而为。
    pub fn writable_bytes(&self) -> u64 {
        let Some(total) = self.total_pending() else {
            return 0;
        };
        let high = self.water_mark.lock().high();
        let bytes = high.saturating_sub(total);
        if bytes > 0 && self.is_writable() {
            bytes
        } else {
            0
        }
    }

    /// 出站缓冲的估算积压字节；出站侧已拆除时返回 `None`。
    pub fn total_pending_write_bytes(&self) -> Option<u64> {
        self.with_state(|s| s.outbound.as_ref().map(|b| b.total_pending_bytes()))
    }

    // -------------------------------------------------------------- 配置面

    /// 应用一项配置。核心未识别的项下放传输层扩展钩子。
    ///
    /// 允许从任意线程调用；关闭自动读时，撤销读兴趣会被改道到循环线程执行。
    pub fn set_option(&self, option: ChannelOption) -> Result<(), CoreError> {
        match option {
            ChannelOption::AutoRead(value) => {
                self.set_auto_read(value);
                Ok(())
            }
            ChannelOption::AutoClose(value) => {
                self.auto_close.store(value, Ordering::SeqCst);
                Ok(())
            }
            ChannelOption::AllowHalfClosure(value) => {
                self.allow_half_closure.store(value, Ordering::SeqCst);
                Ok(())
            }
            ChannelOption::ConnectTimeout(value) => {
                self.connect_timeout_millis
                    .store(value.as_millis().min(u64::MAX as u128) as u64, Ordering::SeqCst);
                Ok(())
            }
            ChannelOption::WriteBufferWaterMark(value) => {
                *self.water_mark.lock() = value;
                Ok(())
            }
            ChannelOption::BufferAllocator(value) => {
                *self.allocator.lock() = value;
                Ok(())
            }
            ChannelOption::ReadHandleFactory(value) => {
                *self.read_handle_factory.lock() = value;
                Ok(())
            }
            ChannelOption::WriteHandleFactory(value) => {
                *self.write_handle_factory.lock() = value;
                Ok(())
            }
            ChannelOption::MessageSizeEstimator(value) => {
                *self.size_estimator.lock() = value;
                Ok(())
            }
            extended @ ChannelOption::Extended { .. } => {
                self.transport.set_extended_option(extended)
            }
        }
    }

    /// 自动读是否开启。
    pub fn auto_read(&self) -> bool {
        self.auto_read.load(Ordering::SeqCst)
    }

    /// 写失败是否自动整体关闭。
    pub fn auto_close(&self) -> bool {
        self.auto_close.load(Ordering::SeqCst)
    }

    /// 是否允许半关闭。
    pub fn allow_half_closure(&self) -> bool {
        self.allow_half_closure.load(Ordering::SeqCst)
    }

    /// 连接超时；零值表示禁用。
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_millis.load(Ordering::SeqCst))
    }

    /// 当前水位线。
    pub fn write_buffer_water_mark(&self) -> WriteBufferWaterMark {
        *self.water_mark.lock()
    }

    /// 当前分配器。
    pub fn buffer_allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(&self.allocator.lock())
    }

    fn set_auto_read(&self, value: bool) {
        let before = self.auto_read.swap(value, Ordering::SeqCst);
        if value && !before {
            if self.executor.in_event_loop() {
                self.read(None);
            } else {
                let channel = self.self_arc();
                self.executor.execute(Box::new(move || channel.read(None)));
            }
        } else if !value && before {
            if self.executor.in_event_loop() {
                self.clear_scheduled_read();
            } else {
                let channel = self.self_arc();
                self.executor.execute(Box::new(move || {
                    let pending = channel.with_state(|s| s.pending_read_allocator.is_some());
                    if !pending && !channel.auto_read() {
                        channel.clear_scheduled_read();
                    }
                }));
            }
        }
    }

    // -------------------------------------------------------------- 注册

    /// 注册到事件循环。重复注册被拒绝。
    pub fn register(&self) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        if self.is_registered() {
            self.safe_failure(
                &promise,
                CoreError::new(codes::CHANNEL_ALREADY_REGISTERED, "registered to an event loop already"),
            );
            return future;
        }
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return future;
        }
        let first_registration = self.with_state(|s| s.never_registered);
        match self.transport.register_io() {
            Ok(()) => {
                self.with_state(|s| s.never_registered = false);
                self.registered.store(true, Ordering::SeqCst);
                self.safe_success(&promise);
                self.controller.emit_channel_registered();
                if self.is_active() {
                    if first_registration {
                        self.fire_active_once();
                    }
                    self.read_if_auto_read();
                }
            }
            Err(cause) => self.close_now_and_fail(&promise, cause),
        }
        future
    }

    /// 注册失败的兜底：强制关闭以免资源泄漏。
    fn close_now_and_fail(&self, promise: &OpPromise, cause: CoreError) {
        self.close_forcibly();
        let _ = self.close_promise.try_success();
        self.safe_failure(promise, cause);
    }

    fn close_forcibly(&self) {
        self.assert_loop();
        self.cancel_connect();
        if let Err(error) = self.transport.close() {
            warn!(target: "flint_core::channel", channel = %self.id, %error, "failed to close a channel");
        }
    }

    // -------------------------------------------------------------- 绑定

    /// 绑定本地端点。
    pub fn bind(&self, local: TransportAddr) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return future;
        }
        if self.transport.should_warn_broadcast_bind(&local) {
            warn!(
                target: "flint_core::channel",
                channel = %self.id,
                address = %local,
                "a non-root user can't receive a broadcast packet if the socket is not bound to a \
                 wildcard address; binding to a non-wildcard address anyway as requested"
            );
        }
        let was_active = self.is_active();
        if let Err(cause) = self.transport.bind(&local) {
            self.safe_failure(&promise, cause);
            self.close_if_closed();
            return future;
        }
        if !was_active && self.is_active() {
            let channel = self.self_arc();
            self.invoke_later(move || {
                if channel.fire_active_once() {
                    channel.read_if_auto_read();
                }
            });
        }
        self.safe_success(&promise);
        future
    }

    // -------------------------------------------------------------- 连接

    /// 发起连接。已有在途连接或已连接时以对应错误种类拒绝。
    ///
    /// 连接 Promise 是唯一不上不可取消闩的操作 Promise：用户取消在途连接是
    /// 公开语义，取消会撤掉超时任务并强制关闭通道。
    pub fn connect(&self, remote: TransportAddr, local: Option<TransportAddr>) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        if !self.ensure_open(&promise) {
            return future;
        }
        if self.with_state(|s| s.connect_promise.is_some()) {
            self.safe_failure(
                &promise,
                CoreError::new(codes::CHANNEL_CONNECT_PENDING, "connection attempt already pending"),
            );
            return future;
        }
        if self.remote_address().is_some() {
            self.safe_failure(
                &promise,
                CoreError::new(codes::CHANNEL_ALREADY_CONNECTED, "already connected to a remote peer"),
            );
            return future;
        }

        let was_active = self.is_active();
        let initial = if self.transport.is_fast_open_connect() {
            self.with_state(|s| {
                s.outbound.as_mut().and_then(|buffer| {
                    buffer.add_flush();
                    buffer.current().and_then(|msg| msg.as_buffer().cloned())
                })
            })
        } else {
            None
        };

        match self.transport.connect(&remote, local.as_ref(), initial.as_ref()) {
            Ok(ConnectResult::Connected { initial_consumed }) => {
                self.fulfill_connect_success(Some(promise), was_active);
                if initial_consumed > 0 {
                    let mut completions = Completions::new();
                    self.with_state(|s| {
                        if let Some(buffer) = s.outbound.as_mut() {
                            buffer.remove_bytes(initial_consumed as u64, &mut completions);
                        }
                    });
                    completions.fire();
                }
            }
            Ok(ConnectResult::Pending) => {
                self.with_state(|s| {
                    s.connect_promise = Some(promise.clone());
                    s.requested_remote = Some(remote.clone());
                });
                let timeout = self.connect_timeout();
                if !timeout.is_zero() {
                    let channel = self.self_arc();
                    let timeout_remote = remote.clone();
                    let token = self.executor.schedule(
                        timeout,
                        Box::new(move || channel.on_connect_timeout(&timeout_remote)),
                    );
                    self.with_state(|s| s.connect_timeout_task = Some(token));
                }
                let channel = self.self_arc();
                promise.add_listener(move |outcome| {
                    if outcome.is_cancelled() {
                        let target = Arc::clone(&channel);
                        channel.executor.execute(Box::new(move || {
                            let token = target.with_state(|s| {
                                s.connect_promise = None;
                                s.requested_remote = None;
                                s.connect_timeout_task.take()
                            });
                            if let Some(token) = token {
                                target.executor.cancel(token);
                            }
                            target.close_internal();
                        }));
                    }
                });
            }
            Err(cause) => {
                self.close_if_closed();
                let _ = promise.try_failure(annotate_connect_error(cause, &remote));
            }
        }
        future
    }

    fn on_connect_timeout(&self, remote: &TransportAddr) {
        let pending = self.with_state(|s| s.connect_promise.clone());
        if let Some(promise) = pending {
            let timed_out = CoreError::new(
                codes::CHANNEL_CONNECT_TIMEOUT,
                format!("connection timed out: {remote}"),
            );
            if !promise.is_done() && promise.try_failure(timed_out) {
                self.close_internal();
            }
        }
    }

    /// 传输通知连接完成信号到达。仍在途时保持等待。
    pub fn finish_connect(&self) {
        self.assert_loop();
        let Some(requested) = self.with_state(|s| s.requested_remote.clone()) else {
            // 连接已被取消或超时收尾。
            return;
        };
        let was_active = self.is_active();
        let mut still_in_progress = false;
        match self.transport.finish_connect(&requested) {
            Ok(false) => still_in_progress = true,
            Ok(true) => {
                let promise = self.with_state(|s| {
                    s.requested_remote = None;
                    s.connect_promise.clone()
                });
                self.fulfill_connect_success(promise, was_active);
            }
            Err(cause) => {
                let promise = self.with_state(|s| s.connect_promise.clone());
                self.fulfill_connect_failure(promise, annotate_connect_error(cause, &requested));
            }
        }
        if !still_in_progress {
            let token = self.with_state(|s| {
                s.connect_promise = None;
                s.requested_remote = None;
                s.connect_timeout_task.take()
            });
            if let Some(token) = token {
                self.executor.cancel(token);
            }
        }
    }

    fn fulfill_connect_success(&self, promise: Option<OpPromise>, was_active: bool) {
        let Some(promise) = promise else {
            // 取消路径已经通知过用户。
            return;
        };
        let active = self.is_active();
        let promise_set = promise.try_success();
        // 无论用户是否已取消，事实上的活跃迁移都要如实广播。
        if !was_active && active {
            if self.fire_active_once() {
                self.read_if_auto_read();
            }
        }
        if !promise_set {
            self.close_internal();
        }
    }

    fn fulfill_connect_failure(&self, promise: Option<OpPromise>, cause: CoreError) {
        let Some(promise) = promise else {
            return;
        };
        let _ = promise.try_failure(cause);
        self.close_if_closed();
    }

    // -------------------------------------------------------------- 断开与半关闭

    /// 数据报式断开；仅受支持断开的传输有效。
    pub fn disconnect(&self) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        if !self.supports_disconnect {
            self.safe_failure(
                &promise,
                CoreError::new(
                    codes::CHANNEL_OPERATION_UNSUPPORTED,
                    "transport does not support disconnect",
                ),
            );
            return future;
        }
        if !promise.set_uncancellable() {
            return future;
        }
        let was_active = self.is_active();
        if let Err(cause) = self.transport.disconnect() {
            self.safe_failure(&promise, cause);
            self.close_if_closed();
            return future;
        }
        *self.local_addr.lock() = None;
        *self.remote_addr.lock() = None;
        self.with_state(|s| s.never_active = true);
        if was_active && !self.is_active() {
            let channel = self.self_arc();
            self.invoke_later(move || channel.controller.emit_channel_inactive());
        }
        self.safe_success(&promise);
        self.close_if_closed();
        future
    }

    /// 半关闭一个方向。活跃性校验失败时以 NotYetConnected / Closed 拒绝；
    /// 目标方向已关闭则为幂等成功。
    pub fn shutdown(&self, direction: ShutdownDirection) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        if !promise.set_uncancellable() {
            return future;
        }
        if !self.is_active() {
            let cause = if self.is_open() {
                CoreError::new(codes::CHANNEL_NOT_CONNECTED, "channel is open but not connected yet")
            } else {
                self.new_closed_error()
            };
            self.safe_failure(&promise, cause);
            return future;
        }
        if self.is_shutdown(direction) {
            self.safe_success(&promise);
            return future;
        }
        let fire_event = match direction {
            ShutdownDirection::Outbound => {
                let (fired, escalation) = self.shutdown_output(&promise, None);
                if let Some(error) = escalation {
                    warn!(
                        target: "flint_core::channel",
                        channel = %self.id, %error,
                        "transport failed to shut down outbound direction"
                    );
                }
                fired
            }
            ShutdownDirection::Inbound => match self.transport.shutdown(ShutdownDirection::Inbound) {
                Ok(()) => {
                    self.safe_success(&promise);
                    true
                }
                Err(cause) => {
                    self.safe_failure(&promise, cause);
                    false
                }
            },
        };
        if fire_event {
            self.controller.emit_channel_shutdown(direction);
        }
        future
    }

    /// 拆除出站侧：出站缓冲清场、传输半关闭出站方向。
    ///
    /// 返回（是否应广播 shutdown 事件，传输层半关闭失败）。
    fn shutdown_output(
        &self,
        promise: &OpPromise,
        cause: Option<CoreError>,
    ) -> (bool, Option<CoreError>) {
        let taken = self.with_state(|s| s.outbound.take());
        let Some(mut buffer) = taken else {
            self.safe_failure(promise, self.new_closed_error());
            return (false, None);
        };
        let shutdown_cause = match cause {
            Some(cause) => CoreError::new(codes::CHANNEL_OUTPUT_SHUTDOWN, "channel output shutdown")
                .with_shared_cause(cause.into_shared()),
            None => CoreError::new(codes::CHANNEL_OUTPUT_SHUTDOWN, "channel output shutdown"),
        }
        .into_shared();
        let transport_error = match self.transport.shutdown(ShutdownDirection::Outbound) {
            Ok(()) => {
                self.safe_success(promise);
                None
            }
            Err(error) => {
                // 半关闭失败仍要清场缓冲，错误同时回给 Promise 与调用方。
                let escalation = CoreError::new(error.code(), error.message().to_owned());
                self.safe_failure(promise, error);
                Some(escalation)
            }
        };
        let mut completions = Completions::new();
        buffer.fail_flushed_and_close(&shutdown_cause, &shutdown_cause, &mut completions);
        completions.fire();
        (true, transport_error)
    }

    // -------------------------------------------------------------- 关闭与反注册

    /// 发起关闭。幂等：后续调用挂到同一关闭 Promise 上。
    pub fn close(&self) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        let cause = self.new_closed_error().into_shared();
        self.close_inner(promise, Arc::clone(&cause), cause);
        future
    }

    fn close_internal(&self) {
        let _ = self.close();
    }

    fn close_with_error(&self, cause: Arc<CoreError>) {
        self.with_state(|s| s.initial_close_cause = Some(Arc::clone(&cause)));
        let close_cause = closed_channel(Some(&cause)).into_shared();
        self.close_inner(OpPromise::new(), cause, close_cause);
    }

    fn close_inner(
        &self,
        promise: OpPromise,
        cause: Arc<CoreError>,
        close_cause: Arc<CoreError>,
    ) {
        if !promise.set_uncancellable() {
            return;
        }
        let already_initiated = self.with_state(|s| {
            if s.close_initiated {
                true
            } else {
                s.close_initiated = true;
                false
            }
        });
        if already_initiated {
            if self.close_promise.is_done() {
                self.safe_success(&promise);
            } else {
                self.close_promise.add_listener(move |_| {
                    let _ = promise.try_success();
                });
            }
            return;
        }

        let was_active = self.is_active();
        let outbound = self.with_state(|s| s.outbound.take());
        match self.transport.prepare_to_close() {
            Some(close_executor) => {
                let channel = self.self_arc();
                close_executor.execute(Box::new(move || {
                    channel.do_close(&promise);
                    let aftermath = Arc::clone(&channel);
                    channel.executor.execute(Box::new(move || {
                        aftermath.close_aftermath(outbound, &cause, &close_cause);
                        aftermath.fire_inactive_and_deregister(was_active);
                    }));
                }));
            }
            None => {
                self.do_close(&promise);
                self.close_aftermath(outbound, &cause, &close_cause);
                if self.with_state(|s| s.in_write_flushed) {
                    // 写循环栈内：入站收尾延后，避免与循环中的 Handler 回调嵌套。
                    let channel = self.self_arc();
                    self.invoke_later(move || channel.fire_inactive_and_deregister(was_active));
                } else {
                    self.fire_inactive_and_deregister(was_active);
                }
            }
        }
    }

    fn do_close(&self, promise: &OpPromise) {
        self.cancel_connect();
        match self.transport.close() {
            Ok(()) => {
                let _ = self.close_promise.try_success();
                self.safe_success(promise);
            }
            Err(cause) => {
                let _ = self.close_promise.try_success();
                self.safe_failure(promise, cause);
            }
        }
    }

    fn cancel_connect(&self) {
        let (promise, token) = self.with_state(|s| {
            s.requested_remote = None;
            (s.connect_promise.take(), s.connect_timeout_task.take())
        });
        if let Some(promise) = promise {
            // 与用户取消竞争：迟到失败静默即可，无需告警。
            let _ = promise.try_failure(self.new_closed_error());
        }
        if let Some(token) = token {
            self.executor.cancel(token);
        }
    }

    fn close_aftermath(
        &self,
        outbound: Option<OutboundBuffer>,
        cause: &Arc<CoreError>,
        close_cause: &Arc<CoreError>,
    ) {
        if let Some(mut buffer) = outbound {
            let mut completions = Completions::new();
            buffer.fail_flushed_and_close(cause, close_cause, &mut completions);
            completions.fire();
            self.update_writability(false, false);
        }
    }

    fn fire_inactive_and_deregister(&self, was_active: bool) {
        self.deregister_inner(OpPromise::new(), was_active && !self.is_active());
    }

    /// 从事件循环反注册。真正的反注册动作总是延后投递，避免在 Handler
    /// 处理途中换线程。
    pub fn deregister(&self) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        self.deregister_inner(promise, false);
        future
    }

    fn deregister_inner(&self, promise: OpPromise, fire_inactive: bool) {
        if !promise.set_uncancellable() {
            return;
        }
        if !self.is_registered() {
            self.safe_success(&promise);
            return;
        }
        let channel = self.self_arc();
        self.invoke_later(move || {
            if let Err(error) = channel.transport.deregister_io() {
                warn!(
                    target: "flint_core::channel",
                    channel = %channel.id, %error,
                    "unexpected exception occurred while deregistering a channel"
                );
            }
            channel.deregister_done(fire_inactive, &promise);
        });
    }

    fn deregister_done(&self, fire_inactive: bool, promise: &OpPromise) {
        if fire_inactive {
            self.controller.emit_channel_inactive();
        }
        self.clear_scheduled_read();
        // 读柄随注册周期走：再注册后由工厂重建，读批节奏从头开始。
        self.with_state(|s| s.read_handle = None);
        // 某些传输在 deregister_io 里顺手关闭并重入本路径，再查一次防止重复广播。
        if self.registered.swap(false, Ordering::SeqCst) {
            self.controller.emit_channel_unregistered();
            if !self.is_open() {
                self.controller.drain_handlers();
            }
        }
        self.safe_success(promise);
    }

    fn close_if_closed(&self) {
        self.assert_loop();
        if self.is_open() {
            return;
        }
        self.close_internal();
    }

    // -------------------------------------------------------------- 读路径

    /// 请求一次读取。未活跃时暂存分配策略，活跃后重放；入站已关闭则忽略。
    pub fn read(&self, allocator: Option<Arc<dyn ReadBufferAllocator>>) {
        self.assert_loop();
        let allocator = allocator.unwrap_or_else(default_read_allocator);
        if !self.is_active() {
            self.with_state(|s| s.read_before_active = Some(allocator));
            return;
        }
        if self.is_shutdown(ShutdownDirection::Inbound) {
            return;
        }
        let was_pending = self.with_state(|s| {
            let was = s.pending_read_allocator.is_some();
            s.pending_read_allocator = Some(allocator);
            was
        });
        if let Err(cause) = self.transport.read(was_pending) {
            let channel = self.self_arc();
            let shared = cause.into_shared();
            self.invoke_later(move || channel.controller.emit_exception(shared));
            self.close_internal();
        }
    }

    /// 传输数据就绪时的读循环入口。
    pub fn read_now(&self) {
        self.assert_loop();
        if self.is_shutdown(ShutdownDirection::Inbound) {
            let seen_error = self.with_state(|s| s.input_closed_seen_error);
            if seen_error || !self.allow_half_closure() {
                self.clear_scheduled_read();
                return;
            }
        }
        let handle = self
            .with_state(|s| s.read_handle.take())
            .unwrap_or_else(|| self.read_handle_factory.lock().new_handle());
        let mut sink = ReadSink::new(self, handle);
        let verdict = match self.transport.read_now(&mut sink) {
            Ok(closed) => {
                sink.complete();
                ReadVerdict::Completed { closed }
            }
            Err(cause) => match sink.complete_failure(cause) {
                sink::ReadFailureVerdict::Transient => ReadVerdict::FailedTransient,
                sink::ReadFailureVerdict::ShutdownReadSide => ReadVerdict::FailedShutdownReadSide,
                sink::ReadFailureVerdict::Close => ReadVerdict::FailedClose,
            },
        };
        self.maybe_clear_read_interest();
        self.with_state(|s| s.read_handle = Some(sink.into_handle()));
        match verdict {
            ReadVerdict::Completed { closed: true } | ReadVerdict::FailedShutdownReadSide => {
                self.shutdown_read_side();
            }
            ReadVerdict::Completed { closed: false } | ReadVerdict::FailedTransient => {
                self.read_if_auto_read();
            }
            ReadVerdict::FailedClose => self.close_internal(),
        }
    }

    fn maybe_clear_read_interest(&self) {
        let pending = self.with_state(|s| s.pending_read_allocator.is_some());
        if !pending && !self.auto_read() {
            self.clear_scheduled_read();
        }
    }

    /// 读侧收口：允许半关闭则半关入站，否则整体关闭；已半关则只立错误标记。
    fn shutdown_read_side(&self) {
        if !self.is_shutdown(ShutdownDirection::Inbound) {
            if self.allow_half_closure() {
                let _ = self.shutdown(ShutdownDirection::Inbound);
            } else {
                self.close_internal();
            }
        } else {
            self.with_state(|s| s.input_closed_seen_error = true);
        }
    }

    fn clear_scheduled_read(&self) {
        self.with_state(|s| s.pending_read_allocator = None);
        self.transport.clear_scheduled_read();
    }

    fn read_if_auto_read(&self) {
        let replay = self.with_state(|s| s.read_before_active.take());
        if let Some(allocator) = replay {
            self.read(Some(allocator));
        } else if self.auto_read() {
            self.read(None);
        }
    }

    // -------------------------------------------------------------- 写路径

    /// 入队一条出站消息。出站侧已拆除时消息被释放并按状态拒绝。
    pub fn write(&self, msg: PipelineMessage) -> OpFuture {
        self.assert_loop();
        let promise = OpPromise::new();
        let future = promise.future();
        let accepting = self.with_state(|s| s.outbound.is_some());
        if !accepting {
            drop(msg);
            let cause = if !self.is_active() {
                self.new_closed_error()
            } else {
                CoreError::new(codes::CHANNEL_OUTPUT_SHUTDOWN, "channel output shutdown")
            };
            self.safe_failure(&promise, cause);
            return future;
        }
        let filtered = match self.transport.filter_outbound(msg) {
            Ok(filtered) => filtered,
            Err(cause) => {
                self.safe_failure(&promise, cause);
                return future;
            }
        };
        let estimator = Arc::clone(&self.size_estimator.lock());
        let size = estimator.size(&filtered).max(0) as u64;
        self.with_state(|s| {
            if let Some(buffer) = s.outbound.as_mut() {
                buffer.add_message(filtered, size, promise.clone());
            }
        });
        self.update_writability(true, false);
        future
    }

    /// 晋升全部待写消息并踢动写循环。
    pub fn flush(&self) {
        self.assert_loop();
        let has_buffer = self.with_state(|s| match s.outbound.as_mut() {
            Some(buffer) => {
                buffer.add_flush();
                true
            }
            None => false,
        });
        if has_buffer {
            self.write_flushed();
        }
    }

    /// `write` + `flush` 的便捷组合。
    pub fn write_and_flush(&self, msg: PipelineMessage) -> OpFuture {
        let future = self.write(msg);
        self.flush();
        future
    }

    /// 写循环踢动点：传输声明推迟时等待其回调，否则立即驱动。
    pub fn write_flushed(&self) {
        self.assert_loop();
        if self.transport.is_write_flush_deferred() {
            return;
        }
        self.write_flushed_now();
    }

    /// 立即驱动写循环（传输重新可写时由其调用）。非重入。
    pub fn write_flushed_now(&self) {
        self.assert_loop();
        let entered = self.with_state(|s| {
            if s.in_write_flushed {
                return false;
            }
            match s.outbound.as_ref() {
                Some(buffer) if !buffer.is_empty() => {
                    s.in_write_flushed = true;
                    true
                }
                _ => false,
            }
        });
        if !entered {
            return;
        }

        if !self.is_active() {
            let open = self.is_open();
            let cause = if open {
                CoreError::new(codes::CHANNEL_NOT_CONNECTED, "channel is open but not connected yet")
            } else {
                self.new_closed_error()
            }
            .into_shared();
            let mut completions = Completions::new();
            self.with_state(|s| {
                if let Some(buffer) = s.outbound.as_mut() {
                    buffer.fail_flushed(&cause, &mut completions);
                }
            });
            completions.fire();
            if open {
                self.update_writability(true, true);
            }
            self.with_state(|s| s.in_write_flushed = false);
            return;
        }

        let handle = self
            .with_state(|s| s.write_handle.take())
            .unwrap_or_else(|| self.write_handle_factory.lock().new_handle());
        let mut sink = WriteSink::new(self, handle);
        loop {
            match self.transport.write_now(&mut sink) {
                Err(cause) => {
                    self.handle_write_error(cause);
                    break;
                }
                Ok(()) => match sink.consume() {
                    Err(contract_violation) => {
                        self.handle_write_error(contract_violation);
                        break;
                    }
                    Ok(continue_writing) => {
                        let drained = self.with_state(|s| {
                            s.outbound.as_ref().map(|b| b.is_empty()).unwrap_or(true)
                        });
                        if !continue_writing || drained {
                            break;
                        }
                    }
                },
            }
        }
        let all_written = self
            .with_state(|s| s.outbound.as_ref().map(|b| b.is_empty()).unwrap_or(true));
        if !all_written && !self.transport.is_write_flush_deferred() {
            let channel = self.self_arc();
            self.invoke_later(move || channel.write_flushed());
        }
        let mut handle = sink.into_handle();
        handle.write_complete();
        self.with_state(|s| {
            s.write_handle = Some(handle);
            s.in_write_flushed = false;
        });
        // 延后通知：可写性 Handler 里再次 flush 也不会与本轮循环嵌套。
        self.update_writability(true, true);
    }

    /// 写路径容错分类：IO 失败且开启自动关闭时整体关闭；否则只拆出站侧，
    /// 拆除再失败时升级为整体关闭。
    fn handle_write_error(&self, cause: CoreError) {
        self.assert_loop();
        if cause.is_io() && self.auto_close() {
            self.close_with_error(cause.into_shared());
            return;
        }
        let promise = OpPromise::new();
        let (fired, escalation) = self.shutdown_output(&promise, Some(cause));
        if let Some(error) = escalation {
            self.close_with_error(error.into_shared());
            return;
        }
        if fired {
            self.controller.emit_channel_shutdown(ShutdownDirection::Outbound);
        }
    }

    // -------------------------------------------------------------- 可写性

    /// 管线侧出站积压变化后的重判入口（管线实现调用）。
    pub fn pending_outbound_bytes_updated(&self) {
        self.update_writability(true, false);
    }

    pub(crate) fn update_writability(&self, notify: bool, notify_later: bool) {
        let total = self.total_pending().unwrap_or(0);
        let mark = *self.water_mark.lock();
        if total > mark.high() {
            if self
                .writable
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.fire_writability_changed(notify, notify_later);
            }
        } else if total < mark.low()
            && self
                .writable
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.fire_writability_changed(notify, notify_later);
        }
    }

    fn fire_writability_changed(&self, notify: bool, notify_later: bool) {
        if !notify {
            return;
        }
        if notify_later {
            let channel = self.self_arc();
            self.invoke_later(move || {
                let writable = channel.is_writable();
                channel.controller.emit_writability_changed(writable);
            });
        } else {
            self.controller.emit_writability_changed(self.is_writable());
        }
    }

    fn total_pending(&self) -> Option<u64> {
        let buffered = self.with_state(|s| s.outbound.as_ref().map(|b| b.total_pending_bytes()))?;
        Some(buffered + self.controller.pending_outbound_bytes())
    }

    // -------------------------------------------------------------- 内部工具

    fn with_state<R>(&self, f: impl FnOnce(&mut CoreState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub(crate) fn with_outbound<R>(&self, f: impl FnOnce(&mut OutboundBuffer) -> R) -> Option<R> {
        self.with_state(|s| s.outbound.as_mut().map(f))
    }

    pub(crate) fn pending_read_allocator(&self) -> Option<Arc<dyn ReadBufferAllocator>> {
        self.with_state(|s| s.pending_read_allocator.clone())
    }

    pub(crate) fn clear_pending_read_allocator(&self) {
        self.with_state(|s| s.pending_read_allocator = None);
    }

    pub(crate) fn is_server(&self) -> bool {
        self.transport.is_server()
    }

    fn invoke_later(&self, task: impl FnOnce() + Send + 'static) {
        self.executor.execute(Box::new(task));
    }

    fn assert_loop(&self) {
        debug_assert!(
            self.executor.in_event_loop(),
            "channel state must only be mutated from its event loop"
        );
    }

    fn ensure_open(&self, promise: &OpPromise) -> bool {
        if self.is_open() {
            return true;
        }
        self.safe_failure(promise, self.new_closed_error());
        false
    }

    fn new_closed_error(&self) -> CoreError {
        let initial = self.with_state(|s| s.initial_close_cause.clone());
        closed_channel(initial.as_ref())
    }

    fn fire_active_once(&self) -> bool {
        let first = self.with_state(|s| {
            if s.never_active {
                s.never_active = false;
                true
            } else {
                false
            }
        });
        if first {
            self.controller.emit_channel_active();
        }
        first
    }

    fn safe_success(&self, promise: &OpPromise) {
        if !promise.try_success() {
            warn!(
                target: "flint_core::channel",
                channel = %self.id,
                "failed to mark a promise as success because it is done already"
            );
        }
    }

    fn safe_failure(&self, promise: &OpPromise, cause: CoreError) {
        if !promise.try_failure(cause) {
            warn!(
                target: "flint_core::channel",
                channel = %self.id,
                "failed to mark a promise as failure because it is done already"
            );
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for Channel {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self.local_address();
        let remote = self.remote_address();
        match (local, remote) {
            (Some(local), Some(remote)) => {
                let separator = if self.is_active() { " - " } else { " ! " };
                write!(f, "[id: 0x{}, L:{local}{separator}R:{remote}]", self.id)
            }
            (Some(local), None) => write!(f, "[id: 0x{}, L:{local}]", self.id),
            _ => write!(f, "[id: 0x{}]", self.id),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("registered", &self.is_registered())
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}
