//! 配置变更事件模型
//!
//! 两种后端产生的事件统一为 [`ChangeEvent`]

use crate::config::path::ConfigPath;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// 配置事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// 路径上的完整值
    Value,
    /// 新增直接子节点
    ChildAdded,
    /// 直接子节点的值发生变化
    ChildChanged,
    /// 直接子节点被删除
    ChildRemoved,
    /// 子节点排序变化（保留，当前后端不产生）
    ChildMoved,
}

impl EventKind {
    /// 事件名称
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Value => "value",
            EventKind::ChildAdded => "child_added",
            EventKind::ChildChanged => "child_changed",
            EventKind::ChildRemoved => "child_removed",
            EventKind::ChildMoved => "child_moved",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 配置变更事件
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// 事件类型
    pub kind: EventKind,
    /// 订阅的路径
    pub path: ConfigPath,
    /// 子节点键；`Value` 事件为路径自身的键
    pub key: Option<String>,
    /// 事件携带的值，不存在时为 `None`
    pub value: Option<Value>,
}

impl ChangeEvent {
    /// 创建 `Value` 事件
    pub fn value(path: &ConfigPath, value: Option<Value>) -> Self {
        Self {
            kind: EventKind::Value,
            key: path.key().map(str::to_string),
            path: path.clone(),
            value,
        }
    }

    /// 创建子节点事件
    pub fn child(kind: EventKind, path: &ConfigPath, key: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            path: path.clone(),
            key: Some(key.into()),
            value: Some(value),
        }
    }
}

/// 订阅标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// 事件回调
///
/// 回调返回的错误只会被记录，订阅保持有效。
pub type ChangeListener =
    Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 由异步闭包构造 [`ChangeListener`]
pub fn listener<F, Fut>(callback: F) -> ChangeListener
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(callback(event)))
}
