use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use bytes::{Bytes, BytesMut};

/// `PipelineMessage` 统一承载传输层字节与业务层对象。
///
/// # 设计背景（Why）
/// - 出站缓冲、读循环与管线事件需要在一个通道内安全穿梭不同层级的数据，
///   通过类型擦除屏蔽具体类型。
/// - 消息的“释放”即 Rust 的 Drop：任何失败路径上由核心丢弃消息就完成了资源
///   回收，不存在显式 dispose 调用。
///
/// # 契约说明（What）
/// - `Buffer` 承载字节负载，参与按字节的出站记账与部分消费。
/// - `User` 承载任意 `Send + Sync` 对象；其字节计数由消息大小估算器决定。
/// - `Debug` 实现刻意隐藏内部细节，避免日志泄漏负载。
pub enum PipelineMessage {
    /// 字节缓冲负载。
    Buffer(Bytes),
    /// 业务层对象。
    User(Box<dyn Any + Send + Sync>),
}

impl PipelineMessage {
    /// 包装一个业务对象。
    pub fn user<T: Any + Send + Sync>(value: T) -> Self {
        PipelineMessage::User(Box::new(value))
    }

    /// 当前可读字节数；业务对象恒为 0。
    pub fn readable_bytes(&self) -> usize {
        match self {
            PipelineMessage::Buffer(buffer) => buffer.len(),
            PipelineMessage::User(_) => 0,
        }
    }

    /// 以缓冲视角借用。
    pub fn as_buffer(&self) -> Option<&Bytes> {
        match self {
            PipelineMessage::Buffer(buffer) => Some(buffer),
            PipelineMessage::User(_) => None,
        }
    }

    /// 拆出缓冲负载。
    pub fn into_buffer(self) -> Option<Bytes> {
        match self {
            PipelineMessage::Buffer(buffer) => Some(buffer),
            PipelineMessage::User(_) => None,
        }
    }

    /// 尝试把业务对象向下转型为具体类型。
    pub fn downcast_user<T: Any>(self) -> Result<Box<T>, PipelineMessage> {
        match self {
            PipelineMessage::User(value) => value
                .downcast::<T>()
                .map_err(|value| PipelineMessage::User(value)),
            other => Err(other),
        }
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineMessage::Buffer(buffer) => f
                .debug_tuple("Buffer")
                .field(&format_args!("{} bytes", buffer.len()))
                .finish(),
            PipelineMessage::User(_) => f.debug_tuple("User").field(&"<erased>").finish(),
        }
    }
}

/// 出入站负载的分配器契约。
pub trait BufferAllocator: Send + Sync + 'static {
    /// 分配一块至少 `capacity` 字节的可写缓冲。
    fn allocate(&self, capacity: usize) -> BytesMut;
}

/// 默认堆分配器。
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, capacity: usize) -> BytesMut {
        BytesMut::with_capacity(capacity)
    }
}

/// 获取进程共享的默认分配器。
pub fn default_allocator() -> Arc<dyn BufferAllocator> {
    static DEFAULT: OnceLock<Arc<dyn BufferAllocator>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(HeapAllocator)))
}

/// 单次读取的缓冲分配策略：由 `read` 调用方携带，覆盖读柄的容量估计。
///
/// 返回 `None` 表示本次不分配（读柄估计为 0 等退化场景），传输实现应跳过读取。
pub trait ReadBufferAllocator: Send + Sync + 'static {
    fn allocate(&self, allocator: &dyn BufferAllocator, estimated_capacity: usize)
        -> Option<BytesMut>;
}

/// 按读柄估计值分配的默认策略。
#[derive(Debug, Default, Clone, Copy)]
pub struct EstimatedReadAllocator;

impl ReadBufferAllocator for EstimatedReadAllocator {
    fn allocate(
        &self,
        allocator: &dyn BufferAllocator,
        estimated_capacity: usize,
    ) -> Option<BytesMut> {
        if estimated_capacity == 0 {
            return None;
        }
        Some(allocator.allocate(estimated_capacity))
    }
}

/// 固定容量分配策略：无视读柄估计，总是索取恰好 `size` 字节。
#[derive(Debug, Clone, Copy)]
pub struct ExactReadAllocator {
    size: usize,
}

impl ExactReadAllocator {
    pub fn new(size: usize) -> Self {
        Self { size }
    }
}

impl ReadBufferAllocator for ExactReadAllocator {
    fn allocate(
        &self,
        allocator: &dyn BufferAllocator,
        _estimated_capacity: usize,
    ) -> Option<BytesMut> {
        if self.size == 0 {
            return None;
        }
        Some(allocator.allocate(self.size))
    }
}

/// 获取进程共享的默认读取分配策略。
pub fn default_read_allocator() -> Arc<dyn ReadBufferAllocator> {
    static DEFAULT: OnceLock<Arc<dyn ReadBufferAllocator>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(EstimatedReadAllocator)))
}

/// 消息大小估算器：为出站记账提供字节数。负值在入队处被钳制为 0。
pub trait MessageSizeEstimator: Send + Sync + 'static {
    fn size(&self, msg: &PipelineMessage) -> isize;
}

/// 默认估算：缓冲取可读字节数，业务对象取固定猜测值。
#[derive(Debug, Clone, Copy)]
pub struct DefaultSizeEstimator {
    unknown_size: isize,
}

impl DefaultSizeEstimator {
    pub fn new(unknown_size: isize) -> Self {
        Self { unknown_size }
    }
}

impl Default for DefaultSizeEstimator {
    fn default() -> Self {
        Self { unknown_size: 8 }
    }
}

impl MessageSizeEstimator for DefaultSizeEstimator {
    fn size(&self, msg: &PipelineMessage) -> isize {
        match msg {
            PipelineMessage::Buffer(buffer) => buffer.len() as isize,
            PipelineMessage::User(_) => self.unknown_size,
        }
    }
}

/// 获取进程共享的默认估算器。
pub fn default_size_estimator() -> Arc<dyn MessageSizeEstimator> {
    static DEFAULT: OnceLock<Arc<dyn MessageSizeEstimator>> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| Arc::new(DefaultSizeEstimator::default())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimator_defaults() {
        let estimator = DefaultSizeEstimator::default();
        let buffer = PipelineMessage::Buffer(Bytes::from_static(b"abc"));
        assert_eq!(estimator.size(&buffer), 3);
        let user = PipelineMessage::user("anything");
        assert_eq!(estimator.size(&user), 8);
    }

    #[test]
    fn read_allocator_skips_zero_capacity() {
        let allocator = HeapAllocator;
        assert!(EstimatedReadAllocator.allocate(&allocator, 0).is_none());
        let buffer = EstimatedReadAllocator
            .allocate(&allocator, 64)
            .expect("non-zero estimate allocates");
        assert!(buffer.capacity() >= 64);
    }

    #[test]
    fn user_downcast_round_trip() {
        let msg = PipelineMessage::user(42u32);
        let value = msg.downcast_user::<u32>().expect("matching type");
        assert_eq!(*value, 42);
    }
}
