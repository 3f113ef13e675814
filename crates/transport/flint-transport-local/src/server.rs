use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use flint_core::error::codes;
use flint_core::transport::{ShutdownDirection, Transport, TransportAddr};
use flint_core::{Channel, CoreError, PipelineMessage, ReadSink, WriteSink};

use crate::channel::{LocalPeer, LocalTransport};
use crate::registry::LocalRegistry;

/// 进程内监听端传输：占住注册表里的名字，把撮合出的对端作为入站消息交付。
///
/// # 契约说明（What）
/// - `bind` 后进入活跃态；关闭时解除绑定并丢弃未被取走的接受队列。
/// - 客户端建连产生的对端句柄以 [`LocalPeer`] 形态经读循环交付，上层据此
///   装配子通道（父通道即本监听通道）。
pub struct LocalServerTransport {
    registry: Arc<LocalRegistry>,
    open: AtomicBool,
    bound: Mutex<Option<String>>,
    accept_queue: Mutex<VecDeque<Arc<LocalTransport>>>,
    read_interest: AtomicBool,
    channel: OnceLock<Weak<Channel>>,
    self_ref: Weak<LocalServerTransport>,
}

impl LocalServerTransport {
    pub fn new(registry: Arc<LocalRegistry>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            registry,
            open: AtomicBool::new(true),
            bound: Mutex::new(None),
            accept_queue: Mutex::new(VecDeque::new()),
            read_interest: AtomicBool::new(false),
            channel: OnceLock::new(),
            self_ref: Weak::clone(self_ref),
        })
    }

    /// 回指通道；注册或绑定之前必须调用恰好一次。
    pub fn attach(&self, channel: &Arc<Channel>) {
        let _ = self.channel.set(Arc::downgrade(channel));
    }

    /// 客户端循环递交一个撮合完成的对端；入队与读循环驱动改道到监听循环。
    pub(crate) fn offer(&self, accepted: Arc<LocalTransport>) -> Result<(), CoreError> {
        if !self.is_open() || self.bound.lock().is_none() {
            return Err(CoreError::new(
                codes::TRANSPORT_CONNECT_REFUSED,
                "connection refused",
            ));
        }
        let Some(channel) = self.channel.get().and_then(|weak| weak.upgrade()) else {
            return Err(CoreError::new(
                codes::TRANSPORT_CONNECT_REFUSED,
                "connection refused",
            ));
        };
        let Some(server) = self.self_ref.upgrade() else {
            return Err(CoreError::new(
                codes::TRANSPORT_CONNECT_REFUSED,
                "connection refused",
            ));
        };
        let driver = Arc::clone(&channel);
        channel.executor().execute(Box::new(move || {
            server.accept_queue.lock().push_back(accepted);
            if server.read_interest.load(Ordering::SeqCst) {
                driver.read_now();
            }
        }));
        Ok(())
    }
}

impl Transport for LocalServerTransport {
    fn local_addr(&self) -> Option<TransportAddr> {
        self.bound
            .lock()
            .as_ref()
            .map(|name| TransportAddr::name(name.clone()))
    }

    fn remote_addr(&self) -> Option<TransportAddr> {
        None
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.is_open() && self.bound.lock().is_some()
    }

    fn is_shutdown(&self, _direction: ShutdownDirection) -> bool {
        !self.is_open()
    }

    fn is_server(&self) -> bool {
        true
    }

    fn bind(&self, addr: &TransportAddr) -> Result<(), CoreError> {
        let TransportAddr::Name(name) = addr else {
            return Err(CoreError::new(
                codes::TRANSPORT_UNRESOLVED,
                format!("local transport only binds symbolic names: {addr}"),
            ));
        };
        let Some(server) = self.self_ref.upgrade() else {
            return Err(CoreError::new(
                codes::TRANSPORT_IO,
                "transport already torn down",
            ));
        };
        self.registry.bind(name, &server)?;
        *self.bound.lock() = Some(name.to_string());
        Ok(())
    }

    fn close(&self) -> Result<(), CoreError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(name) = self.bound.lock().take() {
            self.registry.unbind(&name);
        }
        self.accept_queue.lock().clear();
        Ok(())
    }

    fn shutdown(&self, _direction: ShutdownDirection) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_OPERATION_UNSUPPORTED,
            "server transport has no data directions to shut down",
        ))
    }

    fn read(&self, _was_pending: bool) -> Result<(), CoreError> {
        self.read_interest.store(true, Ordering::SeqCst);
        if !self.accept_queue.lock().is_empty() {
            if let Some(channel) = self.channel.get().and_then(|weak| weak.upgrade()) {
                let driver = Arc::clone(&channel);
                channel.executor().execute(Box::new(move || {
                    driver.read_now();
                }));
            }
        }
        Ok(())
    }

    fn read_now(&self, sink: &mut ReadSink<'_>) -> Result<bool, CoreError> {
        let mut delivered = false;
        loop {
            let accepted = self.accept_queue.lock().pop_front();
            match accepted {
                Some(peer) => {
                    delivered = true;
                    if !sink.process_read(0, 0, Some(PipelineMessage::user(LocalPeer(peer)))) {
                        break;
                    }
                }
                None => {
                    if !delivered {
                        sink.process_read(0, 0, None);
                    }
                    break;
                }
            }
        }
        Ok(false)
    }

    fn write_now(&self, sink: &mut WriteSink<'_>) -> Result<(), CoreError> {
        // 监听通道没有出站数据面。
        sink.complete(0, 0, Some(0), false);
        Ok(())
    }

    fn clear_scheduled_read(&self) {
        self.read_interest.store(false, Ordering::SeqCst);
    }
}

impl Drop for LocalServerTransport {
    fn drop(&mut self) {
        if let Some(name) = self.bound.lock().take() {
            self.registry.unbind(&name);
        }
    }
}
