use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::buffer::PipelineMessage;
use crate::channel::options::ChannelOption;
use crate::channel::sink::{ReadSink, WriteSink};
use crate::error::{codes, CoreError};
use crate::runtime::EventExecutor;

/// 半关闭的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    /// 入站（读）方向。
    Inbound,
    /// 出站（写）方向。
    Outbound,
}

/// 传输端点地址：套接字地址或进程内符号名。
///
/// 进程内传输（以及测试）以名字寻址，套接字传输以 [`SocketAddr`] 寻址；
/// 核心只透传与展示，不解释其内容。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    Socket(SocketAddr),
    Name(Cow<'static, str>),
}

impl TransportAddr {
    /// 以符号名构造地址。
    pub fn name(name: impl Into<Cow<'static, str>>) -> Self {
        TransportAddr::Name(name.into())
    }

    /// 是否为通配绑定地址。
    pub fn is_wildcard(&self) -> bool {
        match self {
            TransportAddr::Socket(addr) => addr.ip().is_unspecified(),
            TransportAddr::Name(_) => false,
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportAddr::Socket(addr) => write!(f, "{addr}"),
            TransportAddr::Name(name) => write!(f, "{name}"),
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(addr: SocketAddr) -> Self {
        TransportAddr::Socket(addr)
    }
}

impl From<&'static str> for TransportAddr {
    fn from(name: &'static str) -> Self {
        TransportAddr::Name(Cow::Borrowed(name))
    }
}

/// `Transport::connect` 的即时结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectResult {
    /// 连接同步完成；`initial_consumed` 为随连接送出的快速打开字节数，
    /// 核心据此从出站缓冲中扣除。
    Connected { initial_consumed: usize },
    /// 连接在途，完成时传输须触发通道的 `finish_connect`。
    Pending,
}

/// `Transport` 是具体传输必须实现的能力集：核心状态机通过它驱动底层资源，
/// 自身不做任何系统调用。
///
/// # 设计背景（Why）
/// - 以单一 trait 对象表达能力集（绑定/连接/读写/关闭/半关闭），不同后端
///   （epoll、kqueue、进程内管道）按需实现对应变体，无需继承层级。
/// - 钩子一律接收 `&self`：读分发期间 Handler 可能重入 `flush`，传输内部
///   必须用内部可变性自护。
///
/// # 契约说明（What）
/// - 除标注外，所有钩子只会在通道的事件循环线程上被调用。
/// - `read_now` 返回 `Ok(true)` 表示读侧应当收口（对端 EOF）。
/// - `write_now` 每次调用必须恰好调用一次 `sink.complete` / `sink.complete_err`。
/// - `close` 应尽力而为且幂等。
pub trait Transport: Send + Sync + 'static {
    /// 本端地址；关闭竞态下允许返回 `None`。
    fn local_addr(&self) -> Option<TransportAddr>;

    /// 远端地址；未连接或关闭竞态下允许返回 `None`。
    fn remote_addr(&self) -> Option<TransportAddr>;

    /// 底层资源尚未关闭。
    fn is_open(&self) -> bool;

    /// 处于可收发应用数据的状态（语义由传输定义，如“已连接”）。
    fn is_active(&self) -> bool;

    /// 指定方向是否已半关闭。
    fn is_shutdown(&self, direction: ShutdownDirection) -> bool;

    /// 是否为接受连接的服务端传输（影响读路径的 IO 失败分类）。
    fn is_server(&self) -> bool {
        false
    }

    /// 是否支持 disconnect-再-connect（数据报语义）。
    fn supports_disconnect(&self) -> bool {
        false
    }

    /// 向事件循环登记 IO 兴趣。注册失败将导致通道被强制关闭。
    fn register_io(&self) -> Result<(), CoreError> {
        Ok(())
    }

    /// 从事件循环撤销 IO 兴趣。
    fn deregister_io(&self) -> Result<(), CoreError> {
        Ok(())
    }

    /// 绑定本地端点。
    fn bind(&self, _addr: &TransportAddr) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_OPERATION_UNSUPPORTED,
            "bind not supported by this transport",
        ))
    }

    /// 发起连接。`initial` 为快速打开场景下随握手发送的首段数据。
    fn connect(
        &self,
        _remote: &TransportAddr,
        _local: Option<&TransportAddr>,
        _initial: Option<&Bytes>,
    ) -> Result<ConnectResult, CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_OPERATION_UNSUPPORTED,
            "connect not supported by this transport",
        ))
    }

    /// 完成一个在途连接；`Ok(false)` 表示仍在途，之后会再次被调用。
    fn finish_connect(&self, _requested: &TransportAddr) -> Result<bool, CoreError> {
        Ok(true)
    }

    /// 断开数据报连接。
    fn disconnect(&self) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_OPERATION_UNSUPPORTED,
            "disconnect not supported by this transport",
        ))
    }

    /// 关闭底层资源。
    fn close(&self) -> Result<(), CoreError>;

    /// 半关闭指定方向。
    fn shutdown(&self, direction: ShutdownDirection) -> Result<(), CoreError>;

    /// 声明读兴趣。水平触发后端可为空操作；`was_pending` 表示此前已有读挂起。
    fn read(&self, was_pending: bool) -> Result<(), CoreError>;

    /// 执行一批读取并经 `sink` 上报；返回 `Ok(true)` 要求收口读侧。
    fn read_now(&self, sink: &mut ReadSink<'_>) -> Result<bool, CoreError>;

    /// 执行一次写尝试并经 `sink` 上报进度。
    fn write_now(&self, sink: &mut WriteSink<'_>) -> Result<(), CoreError>;

    /// 撤销挂起的读兴趣。
    fn clear_scheduled_read(&self) {}

    /// 返回 `true` 时，flush 触发被推迟：待传输重新可写时由其回调
    /// `write_flushed` 驱动写循环。
    fn is_write_flush_deferred(&self) -> bool {
        false
    }

    /// 返回承接真实 `close` 的外部执行器（如 SO_LINGER 场景），`None` 表示
    /// 在循环上同步关闭。
    fn prepare_to_close(&self) -> Option<Arc<dyn EventExecutor>> {
        None
    }

    /// 出站消息变换钩子（如堆缓冲转直写缓冲）。失败时消息即被释放。
    fn filter_outbound(&self, msg: PipelineMessage) -> Result<PipelineMessage, CoreError> {
        Ok(msg)
    }

    /// 是否启用了快速打开连接。
    fn is_fast_open_connect(&self) -> bool {
        false
    }

    /// 绑定前询问：非通配地址上的广播套接字在受限环境下收不到广播包，
    /// 返回 `true` 让核心记录告警。
    fn should_warn_broadcast_bind(&self, _addr: &TransportAddr) -> bool {
        false
    }

    /// 扩展配置钩子：核心不认识的选项经此下放。
    fn set_extended_option(&self, _option: ChannelOption) -> Result<(), CoreError> {
        Err(CoreError::new(
            codes::CHANNEL_OPTION_UNSUPPORTED,
            "channel option not supported",
        ))
    }
}
