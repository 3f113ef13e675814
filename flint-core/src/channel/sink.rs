use bytes::BytesMut;

use crate::buffer::PipelineMessage;
use crate::channel::handles::{ReadHandle, WriteHandle};
use crate::channel::outbound::Completions;
use crate::channel::Channel;
use crate::error::{codes, CoreError};

/// 读失败后的裁决。
pub(crate) enum ReadFailureVerdict {
    /// 瞬时故障，通道照常存续。
    Transient,
    /// 收口读侧（半关闭或整体关闭由核心按配置裁定）。
    ShutdownReadSide,
    /// 整体关闭。
    Close,
}

/// `ReadSink` 是单轮读循环的进度上报面：传输读到什么、读了多少都经它走，
/// 核心借此统一记账与事件分发。
///
/// # 契约说明（What）
/// - `allocate_buffer`：按读柄估计与本次读取的分配策略产出入站缓冲。
/// - `process_read`：上报一次读取；携带消息时向管线广播 `read` 事件，
///   返回读柄的继续提示。
/// - 一轮结束后由核心调用 `complete`：仅当本轮确有消息送出时补发
///   `read_complete`。
pub struct ReadSink<'a> {
    channel: &'a Channel,
    handle: Box<dyn ReadHandle>,
    read_something: bool,
}

impl<'a> ReadSink<'a> {
    pub(crate) fn new(channel: &'a Channel, handle: Box<dyn ReadHandle>) -> Self {
        Self {
            channel,
            handle,
            read_something: false,
        }
    }

    /// 分配一块大概率装得下本批数据、又不过度浪费的入站缓冲。
    ///
    /// 返回 `None` 表示本次读取被分配策略否决，传输应跳过读取。
    pub fn allocate_buffer(&self) -> Option<BytesMut> {
        let estimated = self.handle.estimated_buffer_capacity();
        let allocator = self.channel.buffer_allocator();
        match self.channel.pending_read_allocator() {
            Some(strategy) => strategy.allocate(&*allocator, estimated),
            None => Some(allocator.allocate(estimated.max(1))),
        }
    }

    /// 上报一次读取结果；返回是否继续本轮循环。
    pub fn process_read(
        &mut self,
        attempted_bytes: usize,
        actual_bytes: usize,
        message: Option<PipelineMessage>,
    ) -> bool {
        match message {
            None => {
                self.handle.last_read(attempted_bytes, actual_bytes, 0);
                false
            }
            Some(msg) => {
                self.read_something = true;
                self.channel.clear_pending_read_allocator();
                let continue_reading = self.handle.last_read(attempted_bytes, actual_bytes, 1);
                self.channel.controller().emit_read(msg);
                continue_reading
            }
        }
    }

    pub(crate) fn complete(&mut self) {
        if self.read_something {
            self.read_something = false;
            self.handle.read_complete();
            self.channel.controller().emit_read_complete();
        }
    }

    /// 异常收尾：补发 `read_complete`、广播异常，并裁决读路径的后续动作。
    ///
    /// 端口不可达是瞬时故障，通道照常存续；其余 IO 失败在非服务端通道上
    /// 收口读侧；再其余整体关闭。
    pub(crate) fn complete_failure(&mut self, cause: CoreError) -> ReadFailureVerdict {
        self.complete();
        let shared = cause.into_shared();
        self.channel.controller().emit_exception(shared.clone());
        if shared.is(codes::TRANSPORT_PORT_UNREACHABLE) {
            return ReadFailureVerdict::Transient;
        }
        if shared.is_io() && !self.channel.is_server() {
            ReadFailureVerdict::ShutdownReadSide
        } else {
            ReadFailureVerdict::Close
        }
    }

    pub(crate) fn into_handle(self) -> Box<dyn ReadHandle> {
        self.handle
    }
}

/// 一次 `write_now` 尝试的上报记录。
pub(crate) struct WriteRound {
    attempted_bytes: u64,
    actual_bytes: u64,
    /// `None` 表示写掉的消息数未知，按 `actual_bytes` 从缓冲头部逐字节结算。
    messages: Option<usize>,
    error: Option<CoreError>,
    might_continue: bool,
}

/// `WriteSink` 是单轮写循环的进度上报面。
///
/// # 契约说明（What）
/// - 传输在 `write_now` 里读取待写消息（`with_first` / `for_each_flushed` /
///   `take_flushed`），随后 **恰好一次** 调用 `complete` 或 `complete_err`；
///   重复上报按编程错误触发 panic，漏报则以传输契约错误进入写路径容错。
/// - 字节结算（`messages = None`）按上报的实际字节跨条目推进出站缓冲，
///   支持部分写；消息结算移除恰好 `n` 条头部条目。
pub struct WriteSink<'a> {
    channel: &'a Channel,
    handle: Box<dyn WriteHandle>,
    round: Option<WriteRound>,
}

impl<'a> WriteSink<'a> {
    pub(crate) fn new(channel: &'a Channel, handle: Box<dyn WriteHandle>) -> Self {
        Self {
            channel,
            handle,
            round: None,
        }
    }

    /// 单次聚合写建议的最大字节数。
    pub fn estimated_max_bytes_per_gathering_write(&self) -> u64 {
        self.handle.estimated_max_bytes_per_gathering_write()
    }

    /// 待写消息条数。
    pub fn flushed_len(&self) -> usize {
        self.channel
            .with_outbound(|buffer| buffer.flushed_count())
            .unwrap_or(0)
    }

    /// 观察头部待写消息。回调执行期间持有通道状态锁，不得重入通道。
    pub fn with_first<R>(&self, f: impl FnOnce(&PipelineMessage) -> R) -> Option<R> {
        self.channel
            .with_outbound(|buffer| buffer.current().map(f))
            .flatten()
    }

    /// 依序观察待写消息，回调返回 `false` 时停止。约束同 [`Self::with_first`]。
    pub fn for_each_flushed(&self, f: impl FnMut(&PipelineMessage) -> bool) {
        let _ = self.channel.with_outbound(|buffer| buffer.for_each_flushed(f));
    }

    /// 取走至多 `max` 条待写消息的负载，供移动语义传输投递对端。
    ///
    /// 条目与记账原样保留：取走后仍须按完成协议上报（通常
    /// `complete(bytes, bytes, Some(n), ..)`）以移除条目并完成 Promise。
    pub fn take_flushed(&mut self, max: usize) -> Vec<PipelineMessage> {
        self.channel
            .with_outbound(|buffer| buffer.take_flushed_messages(max))
            .unwrap_or_default()
    }

    /// 上报一次成功写入。
    pub fn complete(
        &mut self,
        attempted_bytes: u64,
        actual_bytes: u64,
        messages: Option<usize>,
        might_continue: bool,
    ) {
        assert!(
            self.round.is_none(),
            "WriteSink::complete(...) was already called for this write attempt"
        );
        self.round = Some(WriteRound {
            attempted_bytes,
            actual_bytes,
            messages,
            error: None,
            might_continue,
        });
    }

    /// 上报一次可恢复的写失败：头部条目以 `cause` 出队。
    pub fn complete_err(&mut self, attempted_bytes: u64, cause: CoreError, might_continue: bool) {
        assert!(
            self.round.is_none(),
            "WriteSink::complete(...) was already called for this write attempt"
        );
        self.round = Some(WriteRound {
            attempted_bytes,
            actual_bytes: 0,
            messages: Some(0),
            error: Some(cause),
            might_continue,
        });
    }

    /// 结算上一次 `write_now` 的上报：推进出站缓冲并咨询写柄是否续轮。
    pub(crate) fn consume(&mut self) -> Result<bool, CoreError> {
        let Some(round) = self.round.take() else {
            return Err(CoreError::new(
                codes::CONTRACT_VIOLATION,
                "Transport::write_now returned without calling WriteSink::complete",
            ));
        };
        let WriteRound {
            attempted_bytes,
            actual_bytes,
            messages,
            error,
            might_continue,
        } = round;
        let mut completions = Completions::new();
        let mut messages_written = 0;
        self.channel.with_outbound(|buffer| match error {
            Some(error) => {
                let shared = error.into_shared();
                buffer.remove_err(&shared, &mut completions);
            }
            None => match messages {
                Some(0) => {}
                Some(n) => {
                    for _ in 0..n {
                        if !buffer.remove(&mut completions) {
                            break;
                        }
                        messages_written += 1;
                    }
                }
                None => {
                    messages_written = buffer.remove_bytes(actual_bytes, &mut completions);
                }
            },
        });
        completions.fire();
        let more = self
            .handle
            .last_write(attempted_bytes, actual_bytes, messages_written);
        Ok(more && might_continue)
    }

    pub(crate) fn into_handle(self) -> Box<dyn WriteHandle> {
        self.handle
    }
}
