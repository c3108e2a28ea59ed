//! 远程树存储传输层
//!
//! [`TreeTransport`] 抽象一个支持推送的层级存储；[`MemoryTransport`]
//! 是进程内实现，供嵌入方与测试使用。

use crate::config::path::ConfigPath;
use crate::config::tree;
use crate::error::ConfigError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// 远程树上的一次写入
#[derive(Debug, Clone, PartialEq)]
pub enum TreeChange {
    /// 整体替换 `path` 上的值，`null` 表示删除
    Put { path: ConfigPath, value: Value },
    /// 逐个替换 `path` 下列出的子节点
    Patch {
        path: ConfigPath,
        children: Map<String, Value>,
    },
}

impl TreeChange {
    /// 受影响的路径
    pub fn path(&self) -> &ConfigPath {
        match self {
            TreeChange::Put { path, .. } | TreeChange::Patch { path, .. } => path,
        }
    }

    /// 应用到本地文档
    pub fn apply(self, document: &mut Value) -> Result<(), ConfigError> {
        match self {
            TreeChange::Put { path, value } => tree::assign(document, &path, value),
            TreeChange::Patch { path, children } => {
                for (key, value) in children {
                    tree::assign(document, &path.child(key), value)?;
                }
                Ok(())
            }
        }
    }
}

/// 变更流
pub type ChangeStream = BoxStream<'static, Result<TreeChange, ConfigError>>;

/// 远程树传输trait
#[async_trait]
pub trait TreeTransport: Send + Sync + 'static {
    /// 传输名称，用于日志
    fn name(&self) -> &'static str;

    /// 读取路径上的值（一次往返）
    async fn fetch(&self, path: &ConfigPath) -> Result<Option<Value>, ConfigError>;

    /// 整体替换路径上的值
    async fn store(&self, path: &ConfigPath, value: Value) -> Result<(), ConfigError>;

    /// 打开变更流
    ///
    /// 流的第一个元素必须是根路径的完整快照（`Put` 到根）。
    /// 流出错或结束后调用方会重新调用 `watch`。
    async fn watch(&self) -> Result<ChangeStream, ConfigError>;
}

struct MemoryTree {
    document: Mutex<Value>,
    changes: broadcast::Sender<TreeChange>,
    offline: AtomicBool,
}

/// 进程内树存储
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryTree>,
}

impl MemoryTransport {
    /// 以初始文档创建
    pub fn new(document: Value) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(MemoryTree {
                document: Mutex::new(document),
                changes,
                offline: AtomicBool::new(false),
            }),
        }
    }

    /// 模拟后端不可用，此时 `fetch` / `store` 返回 `BackendIo`
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// 当前完整文档
    pub fn snapshot(&self) -> Value {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Value> {
        self.inner
            .document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_online(&self) -> Result<(), ConfigError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(ConfigError::BackendIo("内存存储处于离线状态".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(Value::Object(Map::new()))
    }
}

#[async_trait]
impl TreeTransport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, path: &ConfigPath) -> Result<Option<Value>, ConfigError> {
        self.ensure_online()?;
        Ok(tree::lookup(&self.lock(), path).cloned())
    }

    async fn store(&self, path: &ConfigPath, value: Value) -> Result<(), ConfigError> {
        self.ensure_online()?;
        let mut document = self.lock();

        let mut updated = document.clone();
        tree::assign(&mut updated, path, value.clone())?;
        *document = updated;

        // 在持有锁时广播，保证与 watch 的快照顺序一致
        let _ = self.inner.changes.send(TreeChange::Put {
            path: path.clone(),
            value,
        });
        Ok(())
    }

    async fn watch(&self) -> Result<ChangeStream, ConfigError> {
        let (snapshot, receiver) = {
            let document = self.lock();
            (document.clone(), self.inner.changes.subscribe())
        };

        let initial = stream::once(async move {
            Ok(TreeChange::Put {
                path: ConfigPath::root(),
                value: snapshot,
            })
        });

        let live = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(change) => Some((Ok(change), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(ConfigError::BackendIo(format!(
                        "变更流落后，丢失 {skipped} 个事件"
                    ))),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(initial.chain(live).boxed())
    }
}
