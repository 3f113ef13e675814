#![doc = "flint-core: 协议无关的异步通道传输核心。"]
#![doc = ""]
#![doc = "本 crate 实现单条双工通道的骨架状态机：事件循环注册、绑定、连接（含超时"]
#![doc = "与快速打开）、带背压的读取、水位驱动的可写性、半关闭与优雅拆除。具体传输"]
#![doc = "（epoll/kqueue/进程内）与管线 Handler 调度是外部协作者，各自实现"]
#![doc = "[`Transport`] 能力集与 [`Controller`] 事件合约。"]

pub mod buffer;
pub mod channel;
pub mod error;
pub mod future;
pub mod pipeline;
pub mod runtime;
pub mod test_stubs;
pub mod transport;

pub use buffer::{
    default_allocator, default_read_allocator, default_size_estimator, BufferAllocator,
    DefaultSizeEstimator, EstimatedReadAllocator, ExactReadAllocator, HeapAllocator,
    MessageSizeEstimator, PipelineMessage, ReadBufferAllocator,
};
pub use channel::handles::{
    AdaptiveReadHandleFactory, MaxMessagesReadHandleFactory, MaxMessagesWriteHandleFactory,
    ReadHandle, ReadHandleFactory, WriteHandle, WriteHandleFactory,
};
pub use channel::id::ChannelId;
pub use channel::options::{ChannelOption, WriteBufferWaterMark};
pub use channel::sink::{ReadSink, WriteSink};
pub use channel::Channel;
pub use error::{CoreError, ErrorCause};
pub use future::{OpFuture, OpOutcome, OpPromise};
pub use pipeline::Controller;
pub use runtime::{EventExecutor, SingleThreadLoop, Task, TimerToken};
pub use transport::{ConnectResult, ShutdownDirection, Transport, TransportAddr};
