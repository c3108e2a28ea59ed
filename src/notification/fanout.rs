//! 通知广播
//!
//! 维护活跃观察者集合，把一条消息同时投递给所有观察者

use crate::error::ObserverError;
use crate::notification::observer::NotificationObserver;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// 一次广播的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// 投递成功的观察者数量
    pub delivered: usize,
    /// 投递失败的观察者数量
    pub failed: usize,
}

impl DispatchSummary {
    /// 参与本次广播的观察者总数
    pub fn total(&self) -> usize {
        self.delivered + self.failed
    }
}

/// 通知广播集合
///
/// 以实例身份去重，同一实例注册两次等同于注册一次。
#[derive(Default)]
pub struct NotificationFanout {
    observers: RwLock<HashMap<usize, Arc<dyn NotificationObserver>>>,
}

fn identity(observer: &Arc<dyn NotificationObserver>) -> usize {
    Arc::as_ptr(observer) as *const () as usize
}

impl NotificationFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入广播集合，返回是否为新加入
    pub async fn register(&self, observer: Arc<dyn NotificationObserver>) -> bool {
        let mut observers = self.observers.write().await;
        observers.insert(identity(&observer), observer).is_none()
    }

    /// 移出广播集合，返回实例是否在集合中
    pub async fn unregister(&self, observer: &Arc<dyn NotificationObserver>) -> bool {
        let mut observers = self.observers.write().await;
        observers.remove(&identity(observer)).is_some()
    }

    /// 在同一把写锁内移出旧实例并加入新实例
    ///
    /// 并发的 `send` 只会看到替换前或替换后的集合。
    pub async fn swap(
        &self,
        old: Option<&Arc<dyn NotificationObserver>>,
        new: Option<Arc<dyn NotificationObserver>>,
    ) {
        let mut observers = self.observers.write().await;
        if let Some(old) = old {
            observers.remove(&identity(old));
        }
        if let Some(new) = new {
            observers.insert(identity(&new), new);
        }
    }

    /// 当前观察者数量
    pub async fn len(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.read().await.is_empty()
    }

    /// 向所有观察者广播
    ///
    /// 每个观察者独立投递，单个失败（包括panic）只记录日志，不影响其他观察者。
    ///
    /// # 参数
    /// * `topic` - 消息主题
    /// * `message` - 消息内容
    ///
    /// # 返回
    /// * `DispatchSummary` - 成功与失败数量
    pub async fn send(&self, topic: &str, message: &Value) -> DispatchSummary {
        let observers: Vec<Arc<dyn NotificationObserver>> =
            self.observers.read().await.values().cloned().collect();
        debug!("广播消息 {} 到 {} 个观察者", topic, observers.len());

        let results = join_all(observers.iter().map(|observer| {
            AssertUnwindSafe(observer.update(topic, message)).catch_unwind()
        }))
        .await;

        let mut summary = DispatchSummary::default();
        for (observer, result) in observers.iter().zip(results) {
            let failure = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(anyhow::anyhow!("观察者发生panic")),
            };

            match failure {
                None => summary.delivered += 1,
                Some(source) => {
                    summary.failed += 1;
                    let error = ObserverError::Dispatch {
                        observer: observer.kind().to_string(),
                        source,
                    };
                    error!(topic = %topic, "{:#}", error);
                }
            }
        }

        summary
    }
}
