use std::sync::Arc;

use crate::buffer::PipelineMessage;
use crate::error::CoreError;
use crate::transport::ShutdownDirection;

/// `Controller` 是管线面向通道核心的控制面：核心把全部入站事件广播给它，
/// 并向它询问管线侧的出站积压。
///
/// # 设计背景（Why）
/// - 管线与 Handler 调度是核心的外部协作者；核心只依赖这份最小事件合约，
///   不感知 Handler 链的组织方式。
/// - 管线对通道持弱引用（通道独占管线），否则会形成引用环。
///
/// # 契约说明（What）
/// - 所有 `emit_*` 都在通道的事件循环线程上被调用，实现必须无阻塞。
/// - 事件顺序即投递顺序；`emit_channel_active` 先于任何 `emit_read`，
///   `emit_channel_inactive` 晚于最后一次 `emit_read` / `emit_read_complete`。
/// - `pending_outbound_bytes`：管线侧尚未进入出站缓冲的积压字节，参与水位判定；
///   允许任意线程读取。
/// - `drain_handlers`：通道既关闭又反注册后调用一次，管线应移除全部 Handler
///   以释放资源；实现需容忍并发的外部移除。
pub trait Controller: Send + Sync + 'static {
    /// 通道完成注册。可因反注册/再注册被多次触发。
    fn emit_channel_registered(&self);

    /// 通道完成反注册。
    fn emit_channel_unregistered(&self);

    /// 通道首次进入活跃态。整个生命周期至多一次。
    fn emit_channel_active(&self);

    /// 通道离开活跃态。
    fn emit_channel_inactive(&self);

    /// 某个方向完成了半关闭。
    fn emit_channel_shutdown(&self, direction: ShutdownDirection);

    /// 广播一条读到的消息。
    fn emit_read(&self, msg: PipelineMessage);

    /// 一轮读取结束。
    fn emit_read_complete(&self);

    /// 可写性发生迁移。仅在真实迁移时触发，绝不重复。
    fn emit_writability_changed(&self, writable: bool);

    /// 广播一个被核心捕获的异常。
    fn emit_exception(&self, error: Arc<CoreError>);

    /// 管线侧的出站积压字节。
    fn pending_outbound_bytes(&self) -> u64 {
        0
    }

    /// 通道关闭且反注册后的 Handler 清场。
    fn drain_handlers(&self) {}
}
