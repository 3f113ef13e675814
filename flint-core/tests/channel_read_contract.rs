//! 读路径合约：批量读事件、半关闭收口、失败分类与读兴趣管理。

use std::sync::Arc;

use bytes::Bytes;
use flint_core::error::{codes, map_io_error, READ};
use flint_core::test_stubs::{ManualExecutor, MockTransport, ReadStep, RecordingController};
use flint_core::{
    Channel, ChannelOption, CoreError, MaxMessagesReadHandleFactory, PipelineMessage,
    ShutdownDirection, TransportAddr,
};

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

fn inbound(bytes: &'static [u8]) -> ReadStep {
    ReadStep::Message(PipelineMessage::Buffer(Bytes::from_static(bytes)))
}

#[test]
fn read_loop_emits_reads_then_single_read_complete() {
    let (channel, _executor, transport, controller) = active_channel();
    transport.script_read(inbound(b"one"));
    transport.script_read(inbound(b"two"));
    channel.read_now();

    assert_eq!(controller.count("read"), 2);
    assert_eq!(controller.count("read_complete"), 1, "整批结束只补发一次");
    assert_eq!(controller.count("exception"), 0);
}

#[test]
fn empty_read_batch_skips_read_complete() {
    let (channel, _executor, _transport, controller) = active_channel();
    channel.read_now();
    assert_eq!(controller.count("read"), 0);
    assert_eq!(controller.count("read_complete"), 0, "没读到东西不触发 read_complete");
}

#[test]
fn max_messages_one_reads_one_message_per_explicit_read() {
    let (channel, _executor, transport, controller) = active_channel();
    channel
        .set_option(ChannelOption::AutoRead(false))
        .expect("disable auto read");
    channel
        .set_option(ChannelOption::ReadHandleFactory(Arc::new(
            MaxMessagesReadHandleFactory::new(1),
        )))
        .expect("limit batch to one message");
    for _ in 0..3 {
        transport.script_read(inbound(b"msg"));
    }

    for round in 1..=3 {
        channel.read(None);
        channel.read_now();
        assert_eq!(controller.count("read"), round, "每次显式 read 恰好一条");
        assert_eq!(controller.count("read_complete"), round);
    }
    assert!(
        transport.calls().contains(&"clear_scheduled_read"),
        "非自动读模式下批末撤销读兴趣"
    );
}

#[test]
fn eof_without_half_closure_closes_channel() {
    let (channel, executor, transport, controller) = active_channel();
    transport.script_read(inbound(b"tail"));
    transport.script_read(ReadStep::Eof);
    channel.read_now();
    executor.run_pending();

    assert_eq!(controller.count("read"), 1);
    assert!(!channel.is_open(), "不允许半关闭时 EOF 整体关闭");
    assert_eq!(controller.count("inactive"), 1);
}

#[test]
fn eof_with_half_closure_shuts_down_inbound_only() {
    let (channel, executor, transport, controller) = active_channel();
    channel
        .set_option(ChannelOption::AllowHalfClosure(true))
        .expect("allow half closure");
    transport.script_read(ReadStep::Eof);
    channel.read_now();
    executor.run_pending();

    assert!(channel.is_open(), "半关闭保留通道");
    assert!(channel.is_shutdown(ShutdownDirection::Inbound));
    assert!(!channel.is_shutdown(ShutdownDirection::Outbound));
    assert_eq!(controller.count("shutdown"), 1);
    assert_eq!(controller.count("inactive"), 0);
}

#[test]
fn io_read_failure_on_client_channel_shuts_down_read_side() {
    let (channel, executor, transport, controller) = active_channel();
    channel
        .set_option(ChannelOption::AllowHalfClosure(true))
        .expect("allow half closure");
    transport.script_read(ReadStep::Error(map_io_error(
        READ,
        std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer"),
    )));
    channel.read_now();
    executor.run_pending();

    assert_eq!(controller.count("exception"), 1, "读失败经异常事件广播");
    assert!(channel.is_shutdown(ShutdownDirection::Inbound));
    assert!(channel.is_open());
}

#[test]
fn port_unreachable_is_transient() {
    let (channel, executor, transport, controller) = active_channel();
    transport.script_read(ReadStep::Error(CoreError::new(
        codes::TRANSPORT_PORT_UNREACHABLE,
        "icmp port unreachable",
    )));
    channel.read_now();
    executor.run_pending();

    assert_eq!(controller.count("exception"), 1);
    assert!(channel.is_open(), "端口不可达是瞬时故障");
    assert!(!channel.is_shutdown(ShutdownDirection::Inbound));
}

#[test]
fn non_io_read_failure_closes_channel() {
    let (channel, executor, transport, _controller) = active_channel();
    transport.script_read(ReadStep::Error(CoreError::new(
        "app.decode",
        "malformed frame",
    )));
    channel.read_now();
    executor.run_pending();
    assert!(!channel.is_open(), "非 IO 失败整体关闭");
}

#[test]
fn io_read_failure_on_server_channel_does_not_shut_down_read_side() {
    let executor = ManualExecutor::new();
    let transport = MockTransport::new();
    transport.set_server(true);
    let controller = RecordingController::new();
    let channel = Channel::new(
        None,
        executor.clone(),
        transport.clone(),
        controller.clone(),
    );
    channel.register();
    channel.bind(TransportAddr::from("SRV"));
    executor.run_pending();

    transport.script_read(ReadStep::Error(map_io_error(
        READ,
        std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "accept failed"),
    )));
    channel.read_now();
    executor.run_pending();
    assert!(!channel.is_open(), "服务端读失败走整体关闭路径");
}

#[test]
fn read_before_active_is_replayed_once_active() {
    let executor = ManualExecutor::new();
    let transport = MockTransport::new();
    let controller = RecordingController::new();
    let channel = Channel::new(
        None,
        executor.clone(),
        transport.clone(),
        controller.clone(),
    );
    channel
        .set_option(ChannelOption::AutoRead(false))
        .expect("disable auto read");
    channel.register();
    executor.run_pending();

    channel.read(None);
    assert!(
        !transport.calls().contains(&"read"),
        "未活跃时读请求暂存而非下发"
    );

    channel.bind(TransportAddr::from("TEST"));
    executor.run_pending();
    assert!(
        transport.calls().contains(&"read"),
        "活跃后重放暂存的读请求"
    );
}

#[test]
fn read_after_inbound_shutdown_is_ignored() {
    let (channel, executor, transport, _controller) = active_channel();
    channel
        .set_option(ChannelOption::AllowHalfClosure(true))
        .expect("allow half closure");
    let shutdown = channel.shutdown(ShutdownDirection::Inbound);
    executor.run_pending();
    assert!(shutdown.outcome().expect("ok").is_success());

    let reads_before = transport.calls().iter().filter(|c| **c == "read").count();
    channel.read(None);
    let reads_after = transport.calls().iter().filter(|c| **c == "read").count();
    assert_eq!(reads_before, reads_after, "入站关闭后读请求被忽略");
}

#[test]
fn disabling_auto_read_from_foreign_thread_clears_interest_on_loop() {
    let (channel, executor, transport, _controller) = active_channel();
    let worker_channel = Arc::clone(&channel);
    std::thread::spawn(move || {
        worker_channel
            .set_option(ChannelOption::AutoRead(false))
            .expect("disable auto read");
    })
    .join()
    .expect("worker exits");

    executor.run_pending();
    assert!(
        transport.calls().contains(&"clear_scheduled_read"),
        "跨线程关闭自动读应改道循环撤销读兴趣"
    );
}
