use std::borrow::Cow;
use std::fmt;
use std::io;
use std::sync::Arc;

/// `CoreError` 表示 `flint-core` 统一的错误域，是所有通道操作失败的最终形态。
///
/// # 设计背景（Why）
/// - 通道核心的失败需要跨越 Promise、管线异常事件与日志三条通路，必须以稳定错误码
///   作为机读锚点，避免上层通过解析消息文本推断语义。
/// - 同一个根因（例如首次关闭原因）可能同时喂给多个 Promise，因此底层原因以 `Arc`
///   共享而非独占装箱。
///
/// # 逻辑解析（How）
/// - 结构体以 Builder 风格方法叠加上下文（`with_cause` / `with_shared_cause`）。
/// - `code` 恒为 `'static` 字符串，承载稳定语义；`message` 面向排障人员。
///
/// # 契约说明（What）
/// - **前置条件**：调用方必须使用 [`codes`] 模块声明的码值，或遵循 `<域>.<语义>`
///   命名的自定义码值。
/// - **后置条件**：构造出的错误拥有独立所有权，可安全跨线程移动与共享。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
}

/// `ErrorCause` 封装底层原因；以 `Arc` 共享以便同一根因喂给多个 Promise。
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

impl CoreError {
    /// 使用稳定错误码与消息构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带一个底层原因，形成错误链。
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 附带一个已共享的底层原因。
    pub fn with_shared_cause(mut self, cause: ErrorCause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取可选的底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 判断错误码是否等于给定码值。
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// 判断是否属于传输层 IO 失败（`transport.` 域）。
    ///
    /// 写循环的容错分类依赖该判定：IO 失败在 `AUTO_CLOSE` 开启时升级为整体关闭，
    /// 其余失败仅关闭出站方向。
    pub fn is_io(&self) -> bool {
        self.code.starts_with("transport.")
    }

    /// 转换为共享形态，便于同一根因喂给多个 Promise。
    pub fn into_shared(self) -> Arc<CoreError> {
        Arc::new(self)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| &**cause as &(dyn std::error::Error + 'static))
    }
}

/// 稳定错误码表。
///
/// 命名遵循 `<域>.<语义>`：`channel.*` 为状态机自身的拒绝语义，`transport.*`
/// 为底层传输失败。新增码值须同步更新合约测试。
pub mod codes {
    /// 通道已关闭（或其出站缓冲已被拆除）。
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    /// 出站方向已关闭，写入被拒绝。
    pub const CHANNEL_OUTPUT_SHUTDOWN: &str = "channel.output_shutdown";
    /// 通道尚未进入活跃态，操作要求活跃通道。
    pub const CHANNEL_NOT_CONNECTED: &str = "channel.not_connected";
    /// 已连接到远端，重复 connect 被拒绝。
    pub const CHANNEL_ALREADY_CONNECTED: &str = "channel.already_connected";
    /// 已有一个 connect 在途。
    pub const CHANNEL_CONNECT_PENDING: &str = "channel.connect_pending";
    /// 连接超时定时器触发。
    pub const CHANNEL_CONNECT_TIMEOUT: &str = "channel.connect_timeout";
    /// 通道已注册到事件循环，重复注册被拒绝。
    pub const CHANNEL_ALREADY_REGISTERED: &str = "channel.already_registered";
    /// 配置项不被识别且传输层扩展钩子未接管。
    pub const CHANNEL_OPTION_UNSUPPORTED: &str = "channel.option_unsupported";
    /// 操作不被当前传输能力集支持（如无 disconnect 能力）。
    pub const CHANNEL_OPERATION_UNSUPPORTED: &str = "channel.operation_unsupported";

    /// 通用传输层 IO 失败。
    pub const TRANSPORT_IO: &str = "transport.io";
    /// 对端拒绝连接。
    pub const TRANSPORT_CONNECT_REFUSED: &str = "transport.connect_refused";
    /// 无法路由到远端主机。
    pub const TRANSPORT_NO_ROUTE: &str = "transport.no_route";
    /// 端口不可达（数据报场景下为瞬时故障，读循环不据此关闭）。
    pub const TRANSPORT_PORT_UNREACHABLE: &str = "transport.port_unreachable";
    /// 地址无法解析。
    pub const TRANSPORT_UNRESOLVED: &str = "transport.unresolved";
    /// 传输层操作超时。
    pub const TRANSPORT_TIMEOUT: &str = "transport.timeout";
    /// 传输实现违反了与核心的调用协定（如 `write_now` 未调用 `complete`）。
    /// 不属于 `transport.` IO 域：该失败走出站拆除而非整体关闭。
    pub const CONTRACT_VIOLATION: &str = "contract.violation";
}

/// 描述一次底层操作对应的稳定语境，用于 IO 错误映射时拼接消息前缀。
#[derive(Clone, Copy, Debug)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const REGISTER: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel register",
};
pub const BIND: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel bind",
};
pub const CONNECT: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel connect",
};
pub const READ: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel read",
};
pub const WRITE: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel write",
};
pub const SHUTDOWN: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel shutdown",
};
pub const CLOSE: OperationKind = OperationKind {
    code: codes::TRANSPORT_IO,
    message: "channel close",
};

/// 将 IO 错误映射为框架级 [`CoreError`]。
///
/// 连接类故障（拒绝 / 不可路由）映射到专属码值，其余落入通用 `transport.io`；
/// 原始错误保留在错误链上。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let code = match error.kind() {
        io::ErrorKind::ConnectionRefused => codes::TRANSPORT_CONNECT_REFUSED,
        io::ErrorKind::TimedOut => codes::TRANSPORT_TIMEOUT,
        io::ErrorKind::AddrNotAvailable => codes::TRANSPORT_UNRESOLVED,
        _ => kind.code,
    };
    CoreError::new(code, format!("{}: {}", kind.message, error)).with_cause(error)
}

/// 为连接失败附注远端地址。
///
/// 三类常见连接错误（拒绝、不可路由、通用 IO）被重新包装：消息携带远端地址，
/// 原错误降级为链上原因。其余错误原样返回。
pub fn annotate_connect_error(error: CoreError, remote: &impl fmt::Display) -> CoreError {
    match error.code() {
        codes::TRANSPORT_CONNECT_REFUSED | codes::TRANSPORT_NO_ROUTE | codes::TRANSPORT_IO => {
            let message = format!("{}: {}", error.message(), remote);
            let code = error.code();
            CoreError::new(code, message).with_shared_cause(Arc::new(error))
        }
        _ => error,
    }
}

/// 构造“通道已关闭”错误，可选携带首次关闭原因作为链上上下文。
pub fn closed_channel(initial_cause: Option<&Arc<CoreError>>) -> CoreError {
    let error = CoreError::new(codes::CHANNEL_CLOSED, "channel closed");
    match initial_cause {
        Some(cause) => error.with_shared_cause(Arc::clone(cause) as ErrorCause),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotated_connect_error_carries_remote_and_cause() {
        let raw = map_io_error(
            CONNECT,
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let annotated = annotate_connect_error(raw, &"ANY");
        assert_eq!(annotated.code(), codes::TRANSPORT_CONNECT_REFUSED);
        assert!(annotated.message().ends_with(": ANY"));
        assert!(annotated.cause().is_some(), "原始错误必须保留在错误链上");
    }

    #[test]
    fn annotate_leaves_unrelated_codes_untouched() {
        let error = CoreError::new(codes::CHANNEL_CONNECT_PENDING, "connection pending");
        let annotated = annotate_connect_error(error, &"ANY");
        assert_eq!(annotated.code(), codes::CHANNEL_CONNECT_PENDING);
        assert_eq!(annotated.message(), "connection pending");
    }

    #[test]
    fn closed_channel_links_initial_cause() {
        let initial = CoreError::new(codes::TRANSPORT_IO, "pipe broke").into_shared();
        let closed = closed_channel(Some(&initial));
        assert_eq!(closed.code(), codes::CHANNEL_CLOSED);
        let source = std::error::Error::source(&closed).expect("cause present");
        assert!(source.to_string().contains("pipe broke"));
    }

    #[test]
    fn io_classification_covers_transport_domain_only() {
        assert!(CoreError::new(codes::TRANSPORT_IO, "io").is_io());
        assert!(!CoreError::new(codes::CHANNEL_CLOSED, "closed").is_io());
    }
}
