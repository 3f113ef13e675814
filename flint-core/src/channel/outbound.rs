use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::buffer::PipelineMessage;
use crate::error::CoreError;
use crate::future::OpPromise;

/// 写条目：消息、估算字节与完成 Promise。
///
/// `msg` 为 `Option`，移动语义的传输可在完成协议之外先行取走负载
/// （见 [`OutboundBuffer::take_flushed_messages`]），记账不受影响。
struct Entry {
    msg: Option<PipelineMessage>,
    /// 该条目尚未被写掉的估算字节。
    pending: u64,
    promise: OpPromise,
}

/// 待触发的 Promise 完成集合。
///
/// 出站缓冲的所有变更都发生在通道状态锁内，而 Promise 监听器可能重入通道，
/// 因此缓冲方法只收集完成项，由调用方在锁外统一触发。
#[derive(Default)]
pub(crate) struct Completions {
    successes: Vec<OpPromise>,
    failures: Vec<(OpPromise, Arc<CoreError>)>,
}

impl Completions {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 在锁外触发全部完成。已完成的 Promise 记告警后跳过。
    pub(crate) fn fire(self) {
        for promise in self.successes {
            if !promise.try_success() {
                warn!(
                    target: "flint_core::channel",
                    "failed to mark a promise as success because it is done already"
                );
            }
        }
        for (promise, cause) in self.failures {
            if !promise.try_failure(cause) {
                warn!(
                    target: "flint_core::channel",
                    "failed to mark a promise as failure because it is done already"
                );
            }
        }
    }
}

/// 出站缓冲：带刷写分界的 FIFO 写队列。
///
/// # 契约说明（What）
/// - 队列分为两个逻辑区：头部 `flushed` 条已晋升为“待写”，尾部为“已入队未刷写”。
/// - `total_pending` 为全队列估算字节之和；按字节消费（`remove_bytes`）精确扣减，
///   整条移除扣减该条剩余估算，两者合计与写循环上报的实际字节一致。
/// - 所有方法只在通道的事件循环上调用；计数对外的可见性由随后的可写性更新保证。
pub(crate) struct OutboundBuffer {
    entries: VecDeque<Entry>,
    flushed: usize,
    total_pending: u64,
}

impl OutboundBuffer {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            flushed: 0,
            total_pending: 0,
        }
    }

    /// 追加一条未刷写消息。
    pub(crate) fn add_message(&mut self, msg: PipelineMessage, size: u64, promise: OpPromise) {
        self.entries.push_back(Entry {
            msg: Some(msg),
            pending: size,
            promise,
        });
        self.total_pending += size;
    }

    /// 把全部未刷写条目晋升为待写。
    pub(crate) fn add_flush(&mut self) {
        self.flushed = self.entries.len();
    }

    /// 待写区头部消息。
    pub(crate) fn current(&self) -> Option<&PipelineMessage> {
        if self.flushed == 0 {
            return None;
        }
        self.entries.front().and_then(|entry| entry.msg.as_ref())
    }

    /// 弹出头部待写条目并标记成功。返回是否确有条目被移除。
    pub(crate) fn remove(&mut self, out: &mut Completions) -> bool {
        if self.flushed == 0 {
            return false;
        }
        let entry = self.entries.pop_front().expect("flushed head present");
        self.flushed -= 1;
        self.total_pending -= entry.pending;
        out.successes.push(entry.promise);
        true
    }

    /// 弹出头部待写条目并以 `cause` 标记失败。
    pub(crate) fn remove_err(&mut self, cause: &Arc<CoreError>, out: &mut Completions) -> bool {
        if self.flushed == 0 {
            return false;
        }
        let entry = self.entries.pop_front().expect("flushed head present");
        self.flushed -= 1;
        self.total_pending -= entry.pending;
        out.failures.push((entry.promise, Arc::clone(cause)));
        true
    }

    /// 自头部起按字节推进 `n` 字节：整条吃尽则移除并成功其 Promise；
    /// 吃到一半只缩减该条剩余字节。返回完整移除的条目数。
    ///
    /// 计数归零后仍继续清扫：零字节条目不需要任何字节，必须在同一次调用里
    /// 完成，不得滞留到下一轮结算。
    pub(crate) fn remove_bytes(&mut self, mut n: u64, out: &mut Completions) -> usize {
        let mut completed = 0;
        while self.flushed > 0 {
            let head_pending = self
                .entries
                .front()
                .expect("flushed head present")
                .pending;
            if n >= head_pending {
                n -= head_pending;
                let entry = self.entries.pop_front().expect("flushed head present");
                self.flushed -= 1;
                self.total_pending -= head_pending;
                out.successes.push(entry.promise);
                completed += 1;
            } else {
                let entry = self.entries.front_mut().expect("flushed head present");
                entry.pending -= n;
                if let Some(PipelineMessage::Buffer(buffer)) = entry.msg.as_mut() {
                    let advance = (n as usize).min(buffer.len());
                    let _ = buffer.split_to(advance);
                }
                self.total_pending -= n;
                break;
            }
        }
        completed
    }

    /// 以 `cause` 失败整个待写区。
    pub(crate) fn fail_flushed(&mut self, cause: &Arc<CoreError>, out: &mut Completions) {
        while self.remove_err(cause, out) {}
    }

    /// 先以 `flushed_cause` 失败待写区，再以 `unflushed_cause` 失败其余条目。
    /// 用于关闭与出站半关闭时的整体清场。
    pub(crate) fn fail_flushed_and_close(
        &mut self,
        flushed_cause: &Arc<CoreError>,
        unflushed_cause: &Arc<CoreError>,
        out: &mut Completions,
    ) {
        self.fail_flushed(flushed_cause, out);
        while let Some(entry) = self.entries.pop_front() {
            self.total_pending -= entry.pending;
            out.failures.push((entry.promise, Arc::clone(unflushed_cause)));
        }
    }

    /// 依序访问待写区消息，回调返回 `false` 时停止。
    pub(crate) fn for_each_flushed(&self, mut f: impl FnMut(&PipelineMessage) -> bool) {
        for entry in self.entries.iter().take(self.flushed) {
            match entry.msg.as_ref() {
                Some(msg) => {
                    if !f(msg) {
                        break;
                    }
                }
                None => continue,
            }
        }
    }

    /// 取走至多 `max` 条待写消息的负载（条目与记账原样保留）。
    ///
    /// 供移动语义传输使用：负载交给对端后，仍须按完成协议上报并移除条目。
    pub(crate) fn take_flushed_messages(&mut self, max: usize) -> Vec<PipelineMessage> {
        let mut taken = Vec::new();
        for entry in self.entries.iter_mut().take(self.flushed) {
            if taken.len() >= max {
                break;
            }
            if let Some(msg) = entry.msg.take() {
                taken.push(msg);
            }
        }
        taken
    }

    /// 待写区条目数。
    pub(crate) fn flushed_count(&self) -> usize {
        self.flushed
    }

    /// 待写区是否为空（即写循环无事可做）。
    pub(crate) fn is_empty(&self) -> bool {
        self.flushed == 0
    }

    /// 全队列估算字节。
    pub(crate) fn total_pending_bytes(&self) -> u64 {
        self.total_pending
    }

    /// 全队列条目数。
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
