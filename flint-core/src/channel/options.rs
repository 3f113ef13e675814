use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::{BufferAllocator, MessageSizeEstimator};
use crate::channel::handles::{ReadHandleFactory, WriteHandleFactory};

/// 出站缓冲水位线：`low ≤ high`。
///
/// 积压超过 `high` 时可写标志翻转为不可写；回落到 `low` 以下时翻转回可写；
/// 两线之间保持粘滞，杜绝抖动通知。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteBufferWaterMark {
    low: u64,
    high: u64,
}

impl WriteBufferWaterMark {
    /// 构造水位线。`low` 不得超过 `high`。
    pub fn new(low: u64, high: u64) -> Self {
        assert!(
            low <= high,
            "write buffer water mark requires low ({low}) <= high ({high})"
        );
        Self { low, high }
    }

    /// 低水位。
    pub fn low(&self) -> u64 {
        self.low
    }

    /// 高水位。
    pub fn high(&self) -> u64 {
        self.high
    }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self {
            low: 32 * 1024,
            high: 64 * 1024,
        }
    }
}

/// 通道的类型化配置项。
///
/// 核心识别的项直接落到通道字段；`Extended` 项下放给传输层扩展钩子，
/// 未被接管时以 `channel.option_unsupported` 拒绝。
pub enum ChannelOption {
    /// 每轮读取结束后自动调度下一次读取。
    AutoRead(bool),
    /// 写路径 IO 失败时自动整体关闭。
    AutoClose(bool),
    /// 允许单方向半关闭而不整体关闭。
    AllowHalfClosure(bool),
    /// 连接超时；零值禁用。
    ConnectTimeout(Duration),
    /// 出站水位线。
    WriteBufferWaterMark(WriteBufferWaterMark),
    /// 出站负载分配器。
    BufferAllocator(Arc<dyn BufferAllocator>),
    /// 读柄工厂（控制批量大小与轮次）。
    ReadHandleFactory(Arc<dyn ReadHandleFactory>),
    /// 写柄工厂（控制聚合写字节上限）。
    WriteHandleFactory(Arc<dyn WriteHandleFactory>),
    /// 出站消息大小估算器。
    MessageSizeEstimator(Arc<dyn MessageSizeEstimator>),
    /// 传输层专属扩展项。
    Extended {
        name: Cow<'static, str>,
        value: Box<dyn std::any::Any + Send + Sync>,
    },
}

impl ChannelOption {
    /// 稳定的选项名，用于日志与拒绝消息。
    pub fn name(&self) -> &str {
        match self {
            ChannelOption::AutoRead(_) => "AUTO_READ",
            ChannelOption::AutoClose(_) => "AUTO_CLOSE",
            ChannelOption::AllowHalfClosure(_) => "ALLOW_HALF_CLOSURE",
            ChannelOption::ConnectTimeout(_) => "CONNECT_TIMEOUT_MILLIS",
            ChannelOption::WriteBufferWaterMark(_) => "WRITE_BUFFER_WATER_MARK",
            ChannelOption::BufferAllocator(_) => "BUFFER_ALLOCATOR",
            ChannelOption::ReadHandleFactory(_) => "READ_HANDLE_FACTORY",
            ChannelOption::WriteHandleFactory(_) => "WRITE_HANDLE_FACTORY",
            ChannelOption::MessageSizeEstimator(_) => "MESSAGE_SIZE_ESTIMATOR",
            ChannelOption::Extended { name, .. } => name,
        }
    }
}

impl fmt::Debug for ChannelOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOption")
            .field("name", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn water_mark_defaults_bracket_low_below_high() {
        let mark = WriteBufferWaterMark::default();
        assert!(mark.low() <= mark.high());
        assert_eq!(mark.low(), 32 * 1024);
        assert_eq!(mark.high(), 64 * 1024);
    }

    #[test]
    #[should_panic(expected = "low (8) <= high (4)")]
    fn water_mark_rejects_inverted_bounds() {
        let _ = WriteBufferWaterMark::new(8, 4);
    }

    #[test]
    fn option_names_are_stable() {
        assert_eq!(ChannelOption::AutoRead(true).name(), "AUTO_READ");
        assert_eq!(
            ChannelOption::Extended {
                name: Cow::Borrowed("SO_CUSTOM"),
                value: Box::new(1u8),
            }
            .name(),
            "SO_CUSTOM"
        );
    }
}
