//! 观察者接口
//!
//! 定义通知观察者与观察者工厂的trait

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// 通知观察者trait
///
/// 观察者只需实现 `update`，具体客户端通过组合持有。
#[async_trait]
pub trait NotificationObserver: Send + Sync {
    /// 接收一条广播
    ///
    /// # 参数
    /// * `topic` - 消息主题
    /// * `message` - 消息内容
    ///
    /// # 返回
    /// * `Result<()>` - 投递结果，失败只会被记录
    async fn update(&self, topic: &str, message: &Value) -> Result<()>;

    /// 观察者类型，用于日志
    fn kind(&self) -> &str {
        "observer"
    }
}

/// 观察者工厂trait
///
/// 由 `type` 字符串选择工厂，工厂根据设置对象构造观察者。
/// 构造失败的错误会原样传给注册调用方。
#[async_trait]
pub trait ObserverFactory: Send + Sync {
    /// 根据设置构造观察者
    async fn create(&self, settings: &Value) -> Result<Arc<dyn NotificationObserver>>;
}

#[async_trait]
impl<F> ObserverFactory for F
where
    F: Fn(&Value) -> Result<Arc<dyn NotificationObserver>> + Send + Sync,
{
    async fn create(&self, settings: &Value) -> Result<Arc<dyn NotificationObserver>> {
        self(settings)
    }
}

/// 把消息写入日志的观察者
#[derive(Debug, Clone, Default)]
pub struct LogObserver {
    /// 日志前缀
    prefix: String,
}

impl LogObserver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// 从设置构造，可选字段 `prefix`
    pub fn from_settings(settings: &Value) -> Result<Arc<dyn NotificationObserver>> {
        let prefix = settings
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(Arc::new(Self::new(prefix)))
    }
}

#[async_trait]
impl NotificationObserver for LogObserver {
    async fn update(&self, topic: &str, message: &Value) -> Result<()> {
        info!("{}[{}] {}", self.prefix, topic, message_text(message));
        Ok(())
    }

    fn kind(&self) -> &str {
        "log"
    }
}

/// 将消息内容转换为文本：字符串原样输出，其余值序列化为JSON
pub fn message_text(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
