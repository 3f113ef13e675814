use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::warn;

use flint_core::error::codes;
use flint_core::transport::{ConnectResult, ShutdownDirection, Transport, TransportAddr};
use flint_core::{Channel, CoreError, PipelineMessage, ReadSink, WriteSink};

use crate::registry::LocalRegistry;

/// 对端链路上流动的信号。
pub(crate) enum LinkSignal {
    Msg(PipelineMessage),
    Eof,
}

/// 服务端接受队列里交付的对端句柄：上层据此装配子通道。
pub struct LocalPeer(pub Arc<LocalTransport>);

impl std::fmt::Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LocalPeer").finish()
    }
}

/// 进程内双工传输的一端。
///
/// # 设计背景（Why）
/// - 建连同步完成：客户端在自己的循环上查注册表、就地配对两个端点，
///   对端句柄经服务端循环投递到接受队列。
/// - 消息传递是移动语义：写循环把负载整体搬进对端收件队列，再按完成协议
///   结算条目；对端循环收到投递任务后驱动自己的读循环。
///
/// # 契约说明（What）
/// - [`LocalTransport::attach`] 必须在注册/建连之前调用，传输据此回指通道。
/// - EOF 标记承载半关闭：出站半关闭或整体关闭都会向对端追加 EOF，
///   对端读循环据此收口读侧。
pub struct LocalTransport {
    registry: Arc<LocalRegistry>,
    open: AtomicBool,
    connected: AtomicBool,
    inbound_shutdown: AtomicBool,
    outbound_shutdown: AtomicBool,
    input_eof: AtomicBool,
    read_interest: AtomicBool,
    inbound: Mutex<VecDeque<LinkSignal>>,
    peer: OnceLock<Weak<LocalTransport>>,
    channel: OnceLock<Weak<Channel>>,
    self_ref: Weak<LocalTransport>,
    local_name: Mutex<Option<TransportAddr>>,
    remote_name: Mutex<Option<TransportAddr>>,
}

impl LocalTransport {
    fn build(
        registry: Arc<LocalRegistry>,
        connected: bool,
        local_name: Option<TransportAddr>,
        remote_name: Option<TransportAddr>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry,
            open: AtomicBool::new(true),
            connected: AtomicBool::new(connected),
            inbound_shutdown: AtomicBool::new(false),
            outbound_shutdown: AtomicBool::new(false),
            input_eof: AtomicBool::new(false),
            read_interest: AtomicBool::new(false),
            inbound: Mutex::new(VecDeque::new()),
            peer: OnceLock::new(),
            channel: OnceLock::new(),
            self_ref: Weak::clone(self_ref),
            local_name: Mutex::new(local_name),
            remote_name: Mutex::new(remote_name),
        })
    }

    /// 构造一个待建连的客户端传输。
    pub fn new(registry: Arc<LocalRegistry>) -> Arc<Self> {
        Self::build(registry, false, None, None)
    }

    /// 回指通道；注册或建连之前必须调用恰好一次。
    pub fn attach(&self, channel: &Arc<Channel>) {
        let _ = self.channel.set(Arc::downgrade(channel));
    }

    fn pair(
        client: &Arc<LocalTransport>,
        server_name: &TransportAddr,
        client_name: TransportAddr,
    ) -> Arc<LocalTransport> {
        let accepted = Self::build(
            Arc::clone(&client.registry),
            true,
            Some(server_name.clone()),
            Some(client_name),
        );
        let _ = accepted.peer.set(Arc::downgrade(client));
        let _ = client.peer.set(Arc::downgrade(&accepted));
        accepted
    }

    fn peer_transport(&self) -> Option<Arc<LocalTransport>> {
        self.peer.get().and_then(|weak| weak.upgrade())
    }

    fn attached_channel(&self) -> Option<Arc<Channel>> {
        self.channel.get().and_then(|weak| weak.upgrade())
    }

    /// 接收一批链路信号并请求本端循环驱动读循环。
    fn receive(&self, signals: Vec<LinkSignal>) {
        if !self.is_open() {
            return;
        }
        self.inbound.lock().extend(signals);
        self.schedule_read_delivery();
    }

    fn schedule_read_delivery(&self) {
        let Some(channel) = self.attached_channel() else {
            // 通道尚未装配，数据滞留队列等待首次 read。
            return;
        };
        let Some(transport) = self.self_ref.upgrade() else {
            return;
        };
        let driver = Arc::clone(&channel);
        channel.executor().execute(Box::new(move || {
            if transport.read_interest.load(Ordering::SeqCst) {
                driver.read_now();
            }
        }));
    }

    fn send_eof_to_peer(&self) {
        if let Some(peer) = self.peer_transport() {
            peer.receive(vec![LinkSignal::Eof]);
        }
    }
}

impl Transport for LocalTransport {
    fn local_addr(&self) -> Option<TransportAddr> {
        self.local_name.lock().clone()
    }

    fn remote_addr(&self) -> Option<TransportAddr> {
        self.remote_name.lock().clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open() && self.connected.load(Ordering::SeqCst)
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

    fn connect(
        &self,
        remote: &TransportAddr,
        _local: Option<&TransportAddr>,
        _initial: Option<&bytes::Bytes>,
    ) -> Result<ConnectResult, CoreError> {
        let TransportAddr::Name(name) = remote else {
            return Err(CoreError::new(
                codes::TRANSPORT_UNRESOLVED,
                format!("local transport only resolves symbolic names: {remote}"),
            ));
        };
        let Some(server) = self.registry.lookup(name) else {
            return Err(CoreError::new(
                codes::TRANSPORT_CONNECT_REFUSED,
                "connection refused",
            ));
        };
        let Some(client) = self.self_ref.upgrade() else {
            return Err(CoreError::new(
                codes::TRANSPORT_IO,
                "transport already torn down",
            ));
        };
        let client_name = self
            .attached_channel()
            .map(|channel| TransportAddr::Name(Cow::Owned(format!("local:{}", channel.id()))))
            .unwrap_or_else(|| TransportAddr::name("local:unattached"));
        *self.local_name.lock() = Some(client_name.clone());
        *self.remote_name.lock() = Some(remote.clone());

        let accepted = Self::pair(&client, remote, client_name);
        server.offer(accepted)?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(ConnectResult::Connected { initial_consumed: 0 })
    }

    fn disconnect(&self) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_OPERATION_UNSUPPORTED,
            "local transport does not support disconnect",
        ))
    }

    fn close(&self) -> Result<(), CoreError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().clear();
        self.send_eof_to_peer();
        Ok(())
    }

    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CoreError> {
        match direction {
            ShutdownDirection::Inbound => {
                self.inbound_shutdown.store(true, Ordering::SeqCst);
            }
            ShutdownDirection::Outbound => {
                if !self.outbound_shutdown.swap(true, Ordering::SeqCst) {
                    self.send_eof_to_peer();
                }
            }
        }
        Ok(())
    }

    fn read(&self, _was_pending: bool) -> Result<(), CoreError> {
        self.read_interest.store(true, Ordering::SeqCst);
        let backlog =
            !self.inbound.lock().is_empty() || self.input_eof.load(Ordering::SeqCst);
        if backlog {
            self.schedule_read_delivery();
        }
        Ok(())
    }

    fn read_now(&self, sink: &mut ReadSink<'_>) -> Result<bool, CoreError> {
        let mut delivered = false;
        loop {
            let signal = self.inbound.lock().pop_front();
            match signal {
                Some(LinkSignal::Msg(msg)) => {
                    delivered = true;
                    let bytes = msg.readable_bytes();
                    if !sink.process_read(bytes, bytes, Some(msg)) {
                        break;
                    }
                }
                Some(LinkSignal::Eof) => {
                    self.input_eof.store(true, Ordering::SeqCst);
                    break;
                }
                None => {
                    if !delivered {
                        sink.process_read(0, 0, None);
                    }
                    break;
                }
            }
        }
        Ok(self.input_eof.load(Ordering::SeqCst) && self.inbound.lock().is_empty())
    }

    fn write_now(&self, sink: &mut WriteSink<'_>) -> Result<(), CoreError> {
        let Some(peer) = self.peer_transport().filter(|peer| peer.is_open()) else {
            sink.complete_err(
                0,
                CoreError::new(codes::TRANSPORT_IO, "peer channel is gone"),
                true,
            );
            return Ok(());
        };
        let pending = sink.flushed_len();
        let messages = sink.take_flushed(pending);
        let count = messages.len();
        let bytes: u64 = messages
            .iter()
            .map(|msg| msg.readable_bytes() as u64)
            .sum();
        peer.receive(messages.into_iter().map(LinkSignal::Msg).collect());
        sink.complete(bytes, bytes, Some(count), false);
        Ok(())
    }

    fn clear_scheduled_read(&self) {
        self.read_interest.store(false, Ordering::SeqCst);
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if self.open.load(Ordering::SeqCst) {
            warn!(
                target: "flint_transport_local",
                "local transport dropped while still open; notifying peer"
            );
            self.open.store(false, Ordering::SeqCst);
            self.send_eof_to_peer();
        }
    }
}
