#![doc = "flint-transport-local: 进程内传输实现。"]
#![doc = ""]
#![doc = "以命名注册表撮合服务端与客户端通道：建连同步完成，消息经对端事件循环"]
#![doc = "投递，EOF 标记承载半关闭，关闭时自动清理注册表。适合测试、同进程 RPC"]
#![doc = "与管线装配验证，不触碰任何系统调用。"]

mod channel;
mod registry;
mod server;

pub use channel::{LocalPeer, LocalTransport};
pub use registry::LocalRegistry;
pub use server::LocalServerTransport;
