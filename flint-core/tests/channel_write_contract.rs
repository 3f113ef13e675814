//! 写路径合约：水位可写性、出站缓冲记账、写循环消费模式与容错分类。

use std::sync::Arc;

use bytes::Bytes;
use flint_core::error::codes;
use flint_core::test_stubs::{ManualExecutor, MockTransport, RecordingController, WriteStep};
use flint_core::{Channel, ChannelOption, PipelineMessage, TransportAddr, WriteBufferWaterMark};

fn active_channel() -> (
    Arc<Channel>,
    Arc<ManualExecutor>,
    Arc<MockTransport>,
    Arc<RecordingController>,
) {
    let executor = ManualExecutor::new();
    let transport = MockTransport::new();
    let controller = RecordingController::new();
    let channel = Channel::new(
        None,
        executor.clone(),
        transport.clone(),
        controller.clone(),
    );
    channel.register();
    channel.bind(TransportAddr::from("TEST"));
    executor.run_pending();
    (channel, executor, transport, controller)
}

fn payload(bytes: &'static [u8]) -> PipelineMessage {
    PipelineMessage::Buffer(Bytes::from_static(bytes))
}

#[test]
fn watermark_transitions_fire_exactly_once_per_crossing() {
    let (channel, executor, transport, controller) = active_channel();
    channel
        .set_option(ChannelOption::WriteBufferWaterMark(WriteBufferWaterMark::new(4, 8)))
        .expect("set water mark");

    channel.write(payload(b"aaa"));
    channel.write(payload(b"bbb"));
    assert!(channel.is_writable());
    assert_eq!(controller.writability_changes(), Vec::<bool>::new());

    channel.write(payload(b"ccc"));
    assert!(!channel.is_writable(), "9 字节越过高水位 8");
    assert_eq!(controller.writability_changes(), vec![false]);
    assert_eq!(channel.writable_bytes(), 0, "不可写时可写字节恒为 0");

    // 写循环一次性清空 9 字节，回落到低水位之下。
    transport.script_write(WriteStep::Complete {
        attempted: 9,
        actual: 9,
        messages: None,
        might_continue: true,
    });
    channel.flush();
    executor.run_pending();
    assert!(channel.is_writable());
    assert_eq!(controller.writability_changes(), vec![false, true]);
    assert!(channel.writable_bytes() > 0);
}

#[test]
fn sticky_between_watermarks() {
    let (channel, _executor, _transport, controller) = active_channel();
    channel
        .set_option(ChannelOption::WriteBufferWaterMark(WriteBufferWaterMark::new(4, 8)))
        .expect("set water mark");
    channel.write(payload(b"abcdef"));
    assert!(channel.is_writable(), "6 字节位于两线之间，保持粘滞");
    assert_eq!(controller.writability_changes(), Vec::<bool>::new());
}

#[test]
fn byte_counted_write_loop_decrements_pending_exactly() {
    let (channel, _executor, transport, _controller) = active_channel();
    let first = channel.write(payload(b"abcd"));
    let second = channel.write(payload(b"efghij"));
    assert_eq!(channel.total_pending_write_bytes(), Some(10));

    transport.script_write(WriteStep::Complete {
        attempted: 10,
        actual: 6,
        messages: None,
        might_continue: false,
    });
    channel.flush();

    assert_eq!(
        channel.total_pending_write_bytes(),
        Some(4),
        "积压字节按上报的实际字节精确扣减"
    );
    assert!(first.outcome().expect("first done").is_success());
    assert!(second.outcome().is_none(), "未写完的条目不得提前完成");
}

#[test]
fn byte_counted_write_loop_sweeps_zero_byte_entry_at_exact_boundary() {
    let (channel, _executor, transport, _controller) = active_channel();
    let data = channel.write(payload(b"abcde"));
    // 空缓冲作为零字节标记消息：不占字节，但同样要求完成语义。
    let marker = channel.write(payload(b""));
    let tail = channel.write(payload(b"xyz"));
    assert_eq!(channel.total_pending_write_bytes(), Some(8));

    transport.script_write(WriteStep::Complete {
        attempted: 8,
        actual: 5,
        messages: None,
        might_continue: false,
    });
    channel.flush();

    assert!(data.outcome().expect("data done").is_success());
    assert!(
        marker.outcome().expect("marker done").is_success(),
        "计数恰好归零时，零字节条目必须在同一轮结算里完成"
    );
    assert!(tail.outcome().is_none(), "未写到的字节条目保持在途");
    assert_eq!(channel.total_pending_write_bytes(), Some(3));
}

#[test]
fn message_counted_write_loop_removes_whole_entries() {
    let (channel, _executor, transport, _controller) = active_channel();
    let first = channel.write(payload(b"aa"));
    let second = channel.write(payload(b"bb"));
    transport.script_write(WriteStep::Complete {
        attempted: 4,
        actual: 4,
        messages: Some(2),
        might_continue: false,
    });
    channel.flush();
    assert!(first.outcome().expect("first").is_success());
    assert!(second.outcome().expect("second").is_success());
    assert_eq!(channel.total_pending_write_bytes(), Some(0));
}

#[test]
fn recoverable_write_failure_fails_one_entry_and_continues() {
    let (channel, _executor, transport, _controller) = active_channel();
    let first = channel.write(payload(b"bad"));
    let second = channel.write(payload(b"good"));
    transport.script_write(WriteStep::FailEntry {
        code: "app.rejected",
        might_continue: true,
    });
    channel.flush();

    assert_eq!(
        first.outcome().expect("first").failure().expect("failed").code(),
        "app.rejected"
    );
    assert!(second.outcome().expect("second").is_success(), "默认脚本续写后一条");
    assert!(channel.is_open());
}

#[test]
fn io_error_with_auto_close_closes_channel_and_fails_flushed() {
    let (channel, executor, transport, _controller) = active_channel();
    let pending = channel.write(payload(b"doomed"));
    transport.script_write(WriteStep::Error(codes::TRANSPORT_IO));
    channel.flush();
    executor.run_pending();

    assert!(!channel.is_open(), "IO 失败 + AUTO_CLOSE 必须整体关闭");
    let failure = pending.outcome().expect("failed");
    assert_eq!(failure.failure().expect("cause").code(), codes::TRANSPORT_IO);
    assert!(channel.close_future().outcome().expect("closed").is_success());
}

#[test]
fn io_error_without_auto_close_only_shuts_down_output() {
    let (channel, executor, transport, controller) = active_channel();
    channel
        .set_option(ChannelOption::AutoClose(false))
        .expect("disable auto close");
    let pending = channel.write(payload(b"doomed"));
    transport.script_write(WriteStep::Error(codes::TRANSPORT_IO));
    channel.flush();
    executor.run_pending();

    assert!(channel.is_open(), "关闭自动关闭后仅拆出站侧");
    assert_eq!(controller.count("shutdown"), 1);
    assert_eq!(
        pending.outcome().expect("failed").failure().expect("cause").code(),
        codes::CHANNEL_OUTPUT_SHUTDOWN
    );

    let late = channel.write(PipelineMessage::user(()));
    assert_eq!(
        late.outcome().expect("rejected").failure().expect("cause").code(),
        codes::CHANNEL_OUTPUT_SHUTDOWN
    );
}

#[test]
fn missing_complete_is_a_contract_violation_routed_to_output_shutdown() {
    let (channel, executor, transport, controller) = active_channel();
    let pending = channel.write(payload(b"lost"));
    transport.script_write(WriteStep::SkipComplete);
    channel.flush();
    executor.run_pending();

    assert!(channel.is_open());
    assert_eq!(controller.count("shutdown"), 1);
    assert_eq!(
        pending.outcome().expect("failed").failure().expect("cause").code(),
        codes::CHANNEL_OUTPUT_SHUTDOWN
    );
}

#[test]
#[should_panic(expected = "already called")]
fn double_complete_panics() {
    let (channel, _executor, transport, _controller) = active_channel();
    channel.write(payload(b"x"));
    transport.script_write(WriteStep::DoubleComplete);
    channel.flush();
}

#[test]
fn write_after_close_rejects_and_disposes_message() {
    let (channel, executor, _transport, _controller) = active_channel();
    channel.close();
    executor.run_pending();

    let tracked = Arc::new(());
    let probe = Arc::clone(&tracked);
    let rejected = channel.write(PipelineMessage::user(probe));
    assert_eq!(
        rejected.outcome().expect("rejected").failure().expect("cause").code(),
        codes::CHANNEL_CLOSED
    );
    assert_eq!(Arc::strong_count(&tracked), 1, "被拒绝的消息必须立即释放");
}

#[test]
fn write_after_output_shutdown_rejects_with_shutdown_kind() {
    let (channel, executor, _transport, _controller) = active_channel();
    let shutdown = channel.shutdown(flint_core::ShutdownDirection::Outbound);
    executor.run_pending();
    assert!(shutdown.outcome().expect("shutdown").is_success());

    let tracked = Arc::new(());
    let probe = Arc::clone(&tracked);
    let rejected = channel.write(PipelineMessage::user(probe));
    assert_eq!(
        rejected.outcome().expect("rejected").failure().expect("cause").code(),
        codes::CHANNEL_OUTPUT_SHUTDOWN
    );
    assert_eq!(Arc::strong_count(&tracked), 1);
}

#[test]
fn shutdown_output_fails_queued_writes_with_shutdown_cause() {
    let (channel, executor, _transport, controller) = active_channel();
    let flushed = channel.write(payload(b"flushed"));
    let queued = channel.write(payload(b"queued"));

    let shutdown = channel.shutdown(flint_core::ShutdownDirection::Outbound);
    executor.run_pending();
    assert!(shutdown.outcome().expect("ok").is_success());
    assert_eq!(controller.count("shutdown"), 1);
    for (label, future) in [("flushed", flushed), ("queued", queued)] {
        assert_eq!(
            future.outcome().expect(label).failure().expect("cause").code(),
            codes::CHANNEL_OUTPUT_SHUTDOWN,
            "{label} 条目以出站关闭失败"
        );
    }
}

#[test]
fn pipeline_pending_bytes_count_toward_watermark() {
    use flint_core::{Controller, ShutdownDirection};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    struct PressureController {
        pending: AtomicU64,
        changes: StdMutex<Vec<bool>>,
    }

    impl Controller for PressureController {
        fn emit_channel_registered(&self) {}
        fn emit_channel_unregistered(&self) {}
        fn emit_channel_active(&self) {}
        fn emit_channel_inactive(&self) {}
        fn emit_channel_shutdown(&self, _direction: ShutdownDirection) {}
        fn emit_read(&self, _msg: PipelineMessage) {}
        fn emit_read_complete(&self) {}
        fn emit_writability_changed(&self, writable: bool) {
            self.changes.lock().expect("changes lock").push(writable);
        }
        fn emit_exception(&self, _error: Arc<flint_core::CoreError>) {}
        fn pending_outbound_bytes(&self) -> u64 {
            self.pending.load(Ordering::SeqCst)
        }
    }

    let executor = ManualExecutor::new();
    let transport = MockTransport::new();
    let controller = Arc::new(PressureController {
        pending: AtomicU64::new(7),
        changes: StdMutex::new(Vec::new()),
    });
    let channel = Channel::new(
        None,
        executor.clone(),
        transport.clone(),
        controller.clone(),
    );
    channel.register();
    channel.bind(TransportAddr::from("TEST"));
    executor.run_pending();
    channel
        .set_option(ChannelOption::WriteBufferWaterMark(WriteBufferWaterMark::new(4, 8)))
        .expect("set water mark");

    // 管线侧 7 字节 + 出站缓冲 2 字节 = 9，越过高水位。
    channel.write(payload(b"xy"));
    assert!(!channel.is_writable());
    assert_eq!(channel.writable_bytes(), 0);
    assert_eq!(*controller.changes.lock().expect("changes lock"), vec![false]);

    // 管线积压回落后，经显式重判入口恢复可写。
    controller.pending.store(0, Ordering::SeqCst);
    channel.pending_outbound_bytes_updated();
    assert!(channel.is_writable());
    assert_eq!(
        *controller.changes.lock().expect("changes lock"),
        vec![false, true]
    );
}

#[test]
fn flush_when_inactive_but_open_fails_with_not_connected() {
    let executor = ManualExecutor::new();
    let transport = MockTransport::new();
    let controller = RecordingController::new();
    let channel = Channel::new(
        None,
        executor.clone(),
        transport.clone(),
        controller.clone(),
    );
    channel.register();
    executor.run_pending();

    // 写入在未活跃时仍被接受，刷写时整体判罚。
    let pending = channel.write(payload(b"early"));
    channel.flush();
    executor.run_pending();
    assert_eq!(
        pending.outcome().expect("failed").failure().expect("cause").code(),
        codes::CHANNEL_NOT_CONNECTED
    );
}
