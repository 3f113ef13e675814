use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use flint_core::error::codes;
use flint_core::CoreError;

use crate::server::LocalServerTransport;

/// 进程内端点注册表：名字到已绑定服务端传输的映射。
///
/// # 契约说明（What）
/// - 绑定独占：同名重复绑定以 `transport.io` 拒绝。
/// - 服务端关闭时解除绑定；弱引用兜底，已消亡的服务端视同不存在。
/// - 查找允许任意线程调用（客户端建连发生在客户端循环上）。
pub struct LocalRegistry {
    bindings: DashMap<String, Weak<LocalServerTransport>>,
}

impl LocalRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bindings: DashMap::new(),
        })
    }

    pub(crate) fn bind(
        &self,
        name: &str,
        server: &Arc<LocalServerTransport>,
    ) -> Result<(), CoreError> {
        match self.bindings.entry(name.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().upgrade().is_some() {
                    return Err(CoreError::new(
                        codes::TRANSPORT_IO,
                        format!("address already in use: {name}"),
                    ));
                }
                // 尸位绑定：服务端早已消亡，直接顶替。
                occupied.insert(Arc::downgrade(server));
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(server));
                Ok(())
            }
        }
    }

    pub(crate) fn unbind(&self, name: &str) {
        self.bindings.remove(name);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<LocalServerTransport>> {
        self.bindings.get(name).and_then(|weak| weak.upgrade())
    }

    /// 名字当前是否被活着的服务端占用。
    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// 活跃绑定数。
    pub fn len(&self) -> usize {
        self.bindings
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
