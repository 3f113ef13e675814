//! 连接合约：重复连接的拒绝种类、超时、取消与快速打开。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flint_core::error::{codes, map_io_error, CONNECT};
use flint_core::test_stubs::{ManualExecutor, MockTransport, RecordingController};
use flint_core::{Channel, ChannelOption, ConnectResult, PipelineMessage, TransportAddr};

fn new_channel() -> (
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
    executor.run_pending();
    (channel, executor, transport, controller)
}

#[test]
fn pending_connect_rejects_second_attempt_with_distinct_kind() {
    let (channel, _executor, _transport, _controller) = new_channel();
    let first = channel.connect(TransportAddr::from("PEER"), None);
    assert!(first.outcome().is_none(), "默认脚本保持在途");

    let second = channel.connect(TransportAddr::from("PEER"), None);
    assert_eq!(
        second.outcome().expect("rejected").failure().expect("cause").code(),
        codes::CHANNEL_CONNECT_PENDING
    );
}

#[test]
fn connect_on_connected_channel_rejects_with_already_connected() {
    let (channel, _executor, transport, _controller) = new_channel();
    transport.set_connect_result(Ok(ConnectResult::Connected { initial_consumed: 0 }));
    let first = channel.connect(TransportAddr::from("PEER"), None);
    assert!(first.outcome().expect("connected").is_success());

    let second = channel.connect(TransportAddr::from("OTHER"), None);
    assert_eq!(
        second.outcome().expect("rejected").failure().expect("cause").code(),
        codes::CHANNEL_ALREADY_CONNECTED
    );
}

#[test]
fn synchronous_connect_fires_active_and_auto_read() {
    let (channel, executor, transport, controller) = new_channel();
    transport.set_connect_result(Ok(ConnectResult::Connected { initial_consumed: 0 }));
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    assert!(connect.outcome().expect("connected").is_success());
    executor.run_pending();
    assert_eq!(controller.count("active"), 1);
    assert!(
        transport.calls().contains(&"read"),
        "自动读开启时连接完成应立即声明读兴趣"
    );
}

#[test]
fn finish_connect_completes_pending_attempt() {
    let (channel, executor, _transport, controller) = new_channel();
    channel
        .set_option(ChannelOption::ConnectTimeout(Duration::from_secs(5)))
        .expect("set timeout");
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    assert!(connect.outcome().is_none());
    assert_eq!(executor.scheduled_len(), 1, "超时任务已挂起");

    channel.finish_connect();
    executor.run_pending();
    assert!(connect.outcome().expect("connected").is_success());
    assert_eq!(controller.count("active"), 1);
    assert_eq!(executor.scheduled_len(), 0, "完成后必须取消超时任务");
}

#[test]
fn finish_connect_in_progress_keeps_waiting() {
    let (channel, _executor, transport, _controller) = new_channel();
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    transport.set_finish_connect_result(Ok(false));
    channel.finish_connect();
    assert!(connect.outcome().is_none(), "未完成的连接保持在途");

    channel.finish_connect();
    assert!(connect.outcome().expect("connected").is_success());
}

#[test]
fn connect_timeout_fails_promise_and_closes_channel() {
    let (channel, executor, _transport, _controller) = new_channel();
    channel
        .set_option(ChannelOption::ConnectTimeout(Duration::from_millis(100)))
        .expect("set timeout");
    let connect = channel.connect(TransportAddr::from("SLOW"), None);

    executor.advance(Duration::from_millis(150));
    let failure = connect.outcome().expect("timed out");
    let cause = failure.failure().expect("cause");
    assert_eq!(cause.code(), codes::CHANNEL_CONNECT_TIMEOUT);
    assert!(cause.message().contains("SLOW"), "超时错误必须附注远端地址");
    assert!(!channel.is_open(), "超时后通道强制关闭");
}

#[test]
fn zero_timeout_disables_the_timer() {
    let (channel, executor, _transport, _controller) = new_channel();
    channel
        .set_option(ChannelOption::ConnectTimeout(Duration::ZERO))
        .expect("disable timeout");
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    assert!(connect.outcome().is_none());
    assert_eq!(executor.scheduled_len(), 0);
}

#[test]
fn cancelling_connect_cancels_timer_and_closes() {
    let (channel, executor, _transport, _controller) = new_channel();
    channel
        .set_option(ChannelOption::ConnectTimeout(Duration::from_secs(5)))
        .expect("set timeout");
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    assert_eq!(executor.scheduled_len(), 1);

    assert!(connect.cancel(), "在途连接的 Promise 可被用户取消");
    executor.run_pending();
    assert_eq!(executor.scheduled_len(), 0, "取消必须撤掉超时任务");
    assert!(!channel.is_open(), "取消后通道强制关闭");
    assert!(channel.close_future().outcome().expect("closed").is_success());
}

#[test]
fn refused_connect_is_annotated_with_remote_address() {
    let (channel, _executor, transport, _controller) = new_channel();
    transport.set_connect_result(Err(map_io_error(
        CONNECT,
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
    )));
    let connect = channel.connect(TransportAddr::from("ANY"), None);
    let cause = connect.outcome().expect("refused").failure().expect("cause").clone();
    assert_eq!(cause.code(), codes::TRANSPORT_CONNECT_REFUSED);
    assert!(cause.message().ends_with(": ANY"), "{}", cause.message());
    assert!(cause.cause().is_some(), "原始拒绝错误保留为根因");
}

#[test]
fn fast_open_connect_consumes_initial_bytes_from_outbound_buffer() {
    let (channel, executor, transport, _controller) = new_channel();
    transport.set_fast_open(true);
    transport.set_connect_result(Ok(ConnectResult::Connected { initial_consumed: 5 }));

    let write = channel.write(PipelineMessage::Buffer(Bytes::from_static(b"hello")));
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    executor.run_pending();

    assert!(connect.outcome().expect("connected").is_success());
    assert!(
        write.outcome().expect("write done").is_success(),
        "随握手送出的首段数据按消费结算"
    );
    assert_eq!(channel.total_pending_write_bytes(), Some(0));
}

#[test]
fn connect_on_closed_channel_fails_with_closed() {
    let (channel, executor, _transport, _controller) = new_channel();
    channel.close();
    executor.run_pending();
    let connect = channel.connect(TransportAddr::from("PEER"), None);
    assert_eq!(
        connect.outcome().expect("rejected").failure().expect("cause").code(),
        codes::CHANNEL_CLOSED
    );
}
