//! 观察者注册表
//!
//! 按配置子节点键维护观察者实例，并与广播集合保持同步

use crate::error::ObserverError;
use crate::notification::fanout::NotificationFanout;
use crate::notification::observer::{NotificationObserver, ObserverFactory};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct RegisteredObserver {
    kind: String,
    instance: Arc<dyn NotificationObserver>,
}

/// 观察者注册表
pub struct ObserverRegistry {
    /// 类型名到工厂的映射，构建后不再变化
    factories: HashMap<String, Arc<dyn ObserverFactory>>,
    /// 键到实例的映射
    observers: Mutex<HashMap<String, RegisteredObserver>>,
    /// 共享的广播集合
    fanout: Arc<NotificationFanout>,
}

impl ObserverRegistry {
    /// 创建注册表
    ///
    /// # 参数
    /// * `factories` - 类型名到工厂的映射
    /// * `fanout` - 广播集合
    pub fn new(
        factories: HashMap<String, Arc<dyn ObserverFactory>>,
        fanout: Arc<NotificationFanout>,
    ) -> Self {
        Self {
            factories,
            observers: Mutex::new(HashMap::new()),
            fanout,
        }
    }

    /// 广播集合
    pub fn fanout(&self) -> &Arc<NotificationFanout> {
        &self.fanout
    }

    /// 已注册的观察者类型
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// 根据设置构造并注册观察者
    ///
    /// 键已存在时按替换处理：旧实例与新实例在同一步内交换。
    /// 任何失败都不改变注册表。
    ///
    /// # 参数
    /// * `settings` - 观察者设置，必须包含 `type`
    /// * `key` - 观察者标识
    ///
    /// # 返回
    /// * `Err(ObserverError::Validation)` - 设置不是对象或缺少 `type`
    /// * `Err(ObserverError::UnknownType)` - `type` 没有对应的工厂
    /// * `Err(ObserverError::Construction)` - 工厂返回的错误，原样透传
    pub async fn register_from_settings(
        &self,
        settings: &Value,
        key: &str,
    ) -> Result<(), ObserverError> {
        let (kind, instance) = self.construct(settings, key).await?;
        self.attach(key, kind, instance).await;
        Ok(())
    }

    /// 注销观察者，键不存在时不做任何事
    ///
    /// # 返回
    /// * `bool` - 键是否存在
    pub async fn unregister(&self, key: &str) -> bool {
        let mut observers = self.observers.lock().await;
        match observers.remove(key) {
            Some(previous) => {
                self.fanout.unregister(&previous.instance).await;
                info!(observer = %key, kind = %previous.kind, "观察者已注销");
                true
            }
            None => {
                debug!(observer = %key, "观察者不存在，忽略注销");
                false
            }
        }
    }

    /// 用新设置替换观察者
    ///
    /// 新实例构造失败时旧实例保持已注销状态，错误返回给调用方。
    pub async fn replace(&self, settings: &Value, key: &str) -> Result<(), ObserverError> {
        match self.construct(settings, key).await {
            Ok((kind, instance)) => {
                self.attach(key, kind, instance).await;
                Ok(())
            }
            Err(e) => {
                if self.unregister(key).await {
                    warn!(observer = %key, "替换失败，旧观察者已移除");
                }
                Err(e)
            }
        }
    }

    /// 当前观察者数量
    pub async fn len(&self) -> usize {
        self.observers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.lock().await.is_empty()
    }

    /// 是否存在指定键
    pub async fn contains(&self, key: &str) -> bool {
        self.observers.lock().await.contains_key(key)
    }

    /// 已注册的 `(键, 类型)` 列表，按键排序
    pub async fn entries(&self) -> Vec<(String, String)> {
        let observers = self.observers.lock().await;
        let mut entries: Vec<(String, String)> = observers
            .iter()
            .map(|(key, registered)| (key.clone(), registered.kind.clone()))
            .collect();
        entries.sort();
        entries
    }

    async fn construct(
        &self,
        settings: &Value,
        key: &str,
    ) -> Result<(String, Arc<dyn NotificationObserver>), ObserverError> {
        let map = settings.as_object().ok_or_else(|| {
            ObserverError::Validation(format!("观察者 {key} 的设置必须是对象"))
        })?;
        let kind = map
            .get("type")
            .and_then(Value::as_str)
            .filter(|kind| !kind.is_empty())
            .ok_or_else(|| ObserverError::Validation(format!("观察者 {key} 缺少 type 字段")))?;
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| ObserverError::UnknownType(kind.to_string()))?;

        let instance = factory
            .create(settings)
            .await
            .map_err(ObserverError::Construction)?;
        Ok((kind.to_string(), instance))
    }

    async fn attach(&self, key: &str, kind: String, instance: Arc<dyn NotificationObserver>) {
        let mut observers = self.observers.lock().await;
        let registered = RegisteredObserver {
            kind: kind.clone(),
            instance: Arc::clone(&instance),
        };
        let previous = observers.insert(key.to_string(), registered);

        self.fanout
            .swap(previous.as_ref().map(|p| &p.instance), Some(instance))
            .await;

        if previous.is_some() {
            info!(observer = %key, kind = %kind, "观察者已替换");
        } else {
            info!(observer = %key, kind = %kind, "观察者已注册");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::observer::LogObserver;
    use anyhow::Result;
    use serde_json::json;

    fn registry() -> ObserverRegistry {
        let mut factories: HashMap<String, Arc<dyn ObserverFactory>> = HashMap::new();
        factories.insert("log".to_string(), Arc::new(LogObserver::from_settings));
        factories.insert(
            "strict".to_string(),
            Arc::new(|settings: &Value| -> Result<Arc<dyn NotificationObserver>> {
                if settings.get("id").is_none() {
                    anyhow::bail!("strict 观察者需要 id");
                }
                Ok(Arc::new(LogObserver::new("strict")))
            }),
        );
        ObserverRegistry::new(factories, Arc::new(NotificationFanout::new()))
    }

    #[tokio::test]
    async fn test_validation_errors_leave_registry_unchanged() {
        let registry = registry();

        let missing = registry.register_from_settings(&json!({}), "a").await;
        assert!(matches!(missing, Err(ObserverError::Validation(_))));

        let scalar = registry.register_from_settings(&json!("log"), "a").await;
        assert!(matches!(scalar, Err(ObserverError::Validation(_))));

        let unknown = registry.register_from_settings(&json!({"type": "x"}), "a").await;
        assert!(matches!(unknown, Err(ObserverError::UnknownType(ref t)) if t == "x"));

        assert!(registry.is_empty().await);
        assert!(registry.fanout().is_empty().await);
    }

    #[tokio::test]
    async fn test_construction_error_propagates_unchanged() {
        let registry = registry();

        let result = registry
            .register_from_settings(&json!({"type": "strict"}), "s")
            .await;
        match result {
            Err(ObserverError::Construction(e)) => assert_eq!(e.to_string(), "strict 观察者需要 id"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!registry.contains("s").await);
    }

    #[tokio::test]
    async fn test_unregister_absent_is_noop() {
        let registry = registry();
        assert!(!registry.unregister("missing").await);

        registry
            .register_from_settings(&json!({"type": "log"}), "a")
            .await
            .unwrap();
        assert!(registry.unregister("a").await);
        assert!(registry.fanout().is_empty().await);
    }

    #[tokio::test]
    async fn test_register_existing_key_replaces() {
        let registry = registry();
        registry
            .register_from_settings(&json!({"type": "log"}), "a")
            .await
            .unwrap();
        registry
            .register_from_settings(&json!({"type": "strict", "id": 1}), "a")
            .await
            .unwrap();

        assert_eq!(registry.entries().await, vec![("a".to_string(), "strict".to_string())]);
        assert_eq!(registry.fanout().len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_replace_removes_old_instance() {
        let registry = registry();
        registry
            .register_from_settings(&json!({"type": "log"}), "a")
            .await
            .unwrap();

        let result = registry.replace(&json!({"type": "strict"}), "a").await;
        assert!(matches!(result, Err(ObserverError::Construction(_))));
        assert!(!registry.contains("a").await);
        assert!(registry.fanout().is_empty().await);
    }
}
