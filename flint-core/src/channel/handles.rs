/// 读柄：单轮读循环的顾问，决定缓冲容量并限制批量轮次。
///
/// 与读循环同生命周期地复用（跨循环保留在通道上，反注册时重置由工厂重建）。
pub trait ReadHandle: Send + 'static {
    /// 下一次分配的建议缓冲容量。
    fn estimated_buffer_capacity(&self) -> usize;

    /// 记录一次读取结果；返回是否继续本轮循环。
    fn last_read(&mut self, attempted_bytes: usize, actual_bytes: usize, messages: usize) -> bool;

    /// 一轮读取结束。
    fn read_complete(&mut self);
}

/// 读柄工厂。
pub trait ReadHandleFactory: Send + Sync + 'static {
    fn new_handle(&self) -> Box<dyn ReadHandle>;
}

/// 固定容量、限定单轮消息数的读柄工厂。
#[derive(Clone, Copy, Debug)]
pub struct MaxMessagesReadHandleFactory {
    buffer_capacity: usize,
    max_messages: usize,
}

impl MaxMessagesReadHandleFactory {
    /// 限定单轮最多 `max_messages` 条消息。
    pub fn new(max_messages: usize) -> Self {
        assert!(max_messages > 0, "max_messages must be positive");
        Self {
            buffer_capacity: 2048,
            max_messages,
        }
    }

    /// 调整固定缓冲容量。
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }
}

impl Default for MaxMessagesReadHandleFactory {
    fn default() -> Self {
        Self::new(16)
    }
}

impl ReadHandleFactory for MaxMessagesReadHandleFactory {
    fn new_handle(&self) -> Box<dyn ReadHandle> {
        Box::new(MaxMessagesReadHandle {
            buffer_capacity: self.buffer_capacity,
            max_messages: self.max_messages,
            seen: 0,
        })
    }
}

struct MaxMessagesReadHandle {
    buffer_capacity: usize,
    max_messages: usize,
    seen: usize,
}

impl ReadHandle for MaxMessagesReadHandle {
    fn estimated_buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    fn last_read(&mut self, _attempted_bytes: usize, _actual_bytes: usize, messages: usize) -> bool {
        self.seen += messages;
        self.seen < self.max_messages
    }

    fn read_complete(&mut self) {
        self.seen = 0;
    }
}

/// 自适应读柄工厂：满读后容量翻倍，连续两轮浅读后容量减半。
///
/// # 逻辑解析（How）
/// - 读满建议容量说明对端可能还有数据，立即扩容以减少轮次。
/// - 浅读采用两轮确认再缩容，避免单次低谷引起来回震荡。
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveReadHandleFactory {
    minimum: usize,
    initial: usize,
    maximum: usize,
    max_messages: usize,
}

impl AdaptiveReadHandleFactory {
    pub fn new(minimum: usize, initial: usize, maximum: usize) -> Self {
        assert!(
            minimum <= initial && initial <= maximum,
            "adaptive bounds require minimum <= initial <= maximum"
        );
        assert!(minimum > 0, "minimum capacity must be positive");
        Self {
            minimum,
            initial,
            maximum,
            max_messages: 16,
        }
    }

    /// 限定单轮最多消息数。
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        assert!(max_messages > 0, "max_messages must be positive");
        self.max_messages = max_messages;
        self
    }
}

impl Default for AdaptiveReadHandleFactory {
    fn default() -> Self {
        Self::new(64, 2048, 65536)
    }
}

impl ReadHandleFactory for AdaptiveReadHandleFactory {
    fn new_handle(&self) -> Box<dyn ReadHandle> {
        Box::new(AdaptiveReadHandle {
            minimum: self.minimum,
            maximum: self.maximum,
            capacity: self.initial,
            max_messages: self.max_messages,
            seen: 0,
            shallow_streak: 0,
            last_actual: 0,
        })
    }
}

struct AdaptiveReadHandle {
    minimum: usize,
    maximum: usize,
    capacity: usize,
    max_messages: usize,
    seen: usize,
    shallow_streak: u8,
    last_actual: usize,
}

impl ReadHandle for AdaptiveReadHandle {
    fn estimated_buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn last_read(&mut self, attempted_bytes: usize, actual_bytes: usize, messages: usize) -> bool {
        self.seen += messages;
        self.last_actual = actual_bytes;
        // 没有读满尝试量时对端缓冲已被掏空，无谓再转一轮。
        if actual_bytes < attempted_bytes {
            return false;
        }
        self.seen < self.max_messages
    }

    fn read_complete(&mut self) {
        self.seen = 0;
        if self.last_actual >= self.capacity {
            self.capacity = (self.capacity * 2).min(self.maximum);
            self.shallow_streak = 0;
        } else if self.last_actual * 2 <= self.capacity {
            self.shallow_streak += 1;
            if self.shallow_streak >= 2 {
                self.capacity = (self.capacity / 2).max(self.minimum);
                self.shallow_streak = 0;
            }
        } else {
            self.shallow_streak = 0;
        }
        self.last_actual = 0;
    }
}

/// 写柄：单轮写循环的顾问，限制轮次并给出聚合写字节上限。
pub trait WriteHandle: Send + 'static {
    /// 单次聚合写建议的最大字节数。
    fn estimated_max_bytes_per_gathering_write(&self) -> u64;

    /// 记录一次写入结果；返回是否允许再来一轮。
    fn last_write(&mut self, attempted_bytes: u64, actual_bytes: u64, messages: usize) -> bool;

    /// 一轮写循环结束。
    fn write_complete(&mut self);
}

/// 写柄工厂。
pub trait WriteHandleFactory: Send + Sync + 'static {
    fn new_handle(&self) -> Box<dyn WriteHandle>;
}

/// 限定单轮消息数的写柄工厂，默认不设上限。
#[derive(Clone, Copy, Debug)]
pub struct MaxMessagesWriteHandleFactory {
    max_messages: usize,
    max_bytes_per_gathering_write: u64,
}

impl MaxMessagesWriteHandleFactory {
    pub fn new(max_messages: usize) -> Self {
        assert!(max_messages > 0, "max_messages must be positive");
        Self {
            max_messages,
            max_bytes_per_gathering_write: u64::MAX,
        }
    }

    /// 调整聚合写字节上限。
    pub fn with_max_bytes_per_gathering_write(mut self, max_bytes: u64) -> Self {
        self.max_bytes_per_gathering_write = max_bytes;
        self
    }
}

impl Default for MaxMessagesWriteHandleFactory {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl WriteHandleFactory for MaxMessagesWriteHandleFactory {
    fn new_handle(&self) -> Box<dyn WriteHandle> {
        Box::new(MaxMessagesWriteHandle {
            max_messages: self.max_messages,
            max_bytes: self.max_bytes_per_gathering_write,
            written: 0,
        })
    }
}

struct MaxMessagesWriteHandle {
    max_messages: usize,
    max_bytes: u64,
    written: usize,
}

impl WriteHandle for MaxMessagesWriteHandle {
    fn estimated_max_bytes_per_gathering_write(&self) -> u64 {
        self.max_bytes
    }

    fn last_write(&mut self, _attempted_bytes: u64, _actual_bytes: u64, messages: usize) -> bool {
        self.written = self.written.saturating_add(messages);
        self.written < self.max_messages
    }

    fn write_complete(&mut self) {
        self.written = 0;
    }
}
