//! 框架组合根
//!
//! 把配置存储、观察者注册表、广播集合与更新器调度器连接起来：
//! - `observers` 下的子节点增删改驱动观察者的注册、替换与注销；
//! - `updater/<configId>` 下的 `startTime` / `interval` 驱动对应更新器的调度。

use crate::config::{bootstrap, listener, ChangeEvent, ConfigStore, EventKind, SubscriptionId};
use crate::error::{ObserverError, Result};
use crate::notification::{
    DiscordWebhook, DispatchSummary, FeishuObserver, LogObserver, NotificationFanout,
    ObserverFactory, ObserverRegistry,
};
use crate::updater::{Updater, UpdaterScheduler};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 观察者配置所在路径
pub const OBSERVERS_PATH: &str = "observers";

/// 更新器配置所在路径
pub const UPDATER_PATH: &str = "updater";

/// 框架构建器
#[derive(Default)]
pub struct FrameworkBuilder {
    factories: Vec<(String, Arc<dyn ObserverFactory>)>,
    config_dir: Option<PathBuf>,
    store: Option<Arc<dyn ConfigStore>>,
    updaters: Vec<Arc<dyn Updater>>,
}

impl FrameworkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册观察者类型
    ///
    /// # 参数
    /// * `kind` - 设置中 `type` 字段的取值
    /// * `factory` - 根据设置构造观察者的工厂
    pub fn observer<F>(mut self, kind: impl Into<String>, factory: F) -> Self
    where
        F: ObserverFactory + 'static,
    {
        self.factories.push((kind.into(), Arc::new(factory)));
        self
    }

    /// 注册内置观察者类型：`discord_webhook`、`feishu`、`log`
    pub fn with_builtin_observers(self) -> Self {
        self.observer("discord_webhook", DiscordWebhook::from_settings)
            .observer("feishu", FeishuObserver::from_settings)
            .observer("log", LogObserver::from_settings)
    }

    /// 配置目录，未指定存储时从这里读取启动配置
    pub fn config_folder_path(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(config_dir.into());
        self
    }

    /// 直接指定配置存储
    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 添加更新器，在 `Framework::start` 时初始化
    pub fn updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updaters.push(updater);
        self
    }

    /// 构建框架
    ///
    /// 打开配置存储并订阅 `observers` 的子节点事件。
    ///
    /// # 返回
    /// * `Err(ObserverError::Validation)` - 观察者类型为空
    /// * `Err(ConfigError)` - 配置存储无法打开
    pub async fn build(self) -> Result<Framework> {
        let mut factories = HashMap::new();
        for (kind, factory) in self.factories {
            if kind.trim().is_empty() {
                return Err(ObserverError::Validation("观察者类型不能为空".to_string()).into());
            }
            if factories.insert(kind.clone(), factory).is_some() {
                warn!("观察者类型 {} 重复注册，使用最后一次注册的工厂", kind);
            }
        }

        let store = match self.store {
            Some(store) => store,
            None => {
                let config_dir = self
                    .config_dir
                    .unwrap_or_else(bootstrap::default_config_dir);
                bootstrap::open_store(&config_dir).await?
            }
        };

        let fanout = Arc::new(NotificationFanout::new());
        let registry = Arc::new(ObserverRegistry::new(factories, Arc::clone(&fanout)));
        let subscriptions = Self::watch_observers(store.as_ref(), &registry)?;

        info!(
            "框架已构建: 存储={}, 观察者类型={:?}",
            store.backend_name(),
            registry.types()
        );

        let schedulers = self
            .updaters
            .into_iter()
            .map(ManagedUpdater::new)
            .collect();

        Ok(Framework {
            store,
            registry,
            fanout,
            started_at: OnceLock::new(),
            updaters: Mutex::new(schedulers),
            subscriptions: Mutex::new(subscriptions),
        })
    }

    fn watch_observers(
        store: &dyn ConfigStore,
        registry: &Arc<ObserverRegistry>,
    ) -> Result<Vec<SubscriptionId>> {
        let added = {
            let registry = Arc::clone(registry);
            listener(move |event: ChangeEvent| {
                let registry = Arc::clone(&registry);
                async move {
                    let (key, settings) = child_of(&event)?;
                    registry.register_from_settings(&settings, &key).await?;
                    Ok(())
                }
            })
        };
        let changed = {
            let registry = Arc::clone(registry);
            listener(move |event: ChangeEvent| {
                let registry = Arc::clone(&registry);
                async move {
                    let (key, settings) = child_of(&event)?;
                    registry.replace(&settings, &key).await?;
                    Ok(())
                }
            })
        };
        let removed = {
            let registry = Arc::clone(registry);
            listener(move |event: ChangeEvent| {
                let registry = Arc::clone(&registry);
                async move {
                    if let Some(key) = event.key.as_deref() {
                        registry.unregister(key).await;
                    }
                    Ok(())
                }
            })
        };

        Ok(vec![
            store.on(OBSERVERS_PATH, EventKind::ChildAdded, added)?,
            store.on(OBSERVERS_PATH, EventKind::ChildChanged, changed)?,
            store.on(OBSERVERS_PATH, EventKind::ChildRemoved, removed)?,
        ])
    }
}

fn child_of(event: &ChangeEvent) -> anyhow::Result<(String, Value)> {
    let key = event
        .key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("子节点事件缺少键"))?;
    Ok((key, event.value.clone().unwrap_or(Value::Null)))
}

struct ManagedUpdater {
    scheduler: UpdaterScheduler,
    subscription: Option<SubscriptionId>,
    /// 是否已按配置初始化
    initialized: bool,
}

impl ManagedUpdater {
    fn new(updater: Arc<dyn Updater>) -> Self {
        Self {
            scheduler: UpdaterScheduler::new(updater),
            subscription: None,
            initialized: false,
        }
    }
}

/// 框架
pub struct Framework {
    store: Arc<dyn ConfigStore>,
    registry: Arc<ObserverRegistry>,
    fanout: Arc<NotificationFanout>,
    started_at: OnceLock<Instant>,
    updaters: Mutex<Vec<ManagedUpdater>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Framework {
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::new()
    }

    /// 配置存储
    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    /// 观察者注册表
    pub fn registry(&self) -> &Arc<ObserverRegistry> {
        &self.registry
    }

    /// 是否已启动
    pub fn is_started(&self) -> bool {
        self.started_at.get().is_some()
    }

    /// 启动框架
    ///
    /// 首次调用记录启动时刻，然后初始化所有尚未初始化的更新器。
    /// 读取配置失败时返回错误，已初始化的更新器保持运行；
    /// 再次调用会从未初始化的更新器继续，启动时刻不变。
    pub async fn start(&self) -> Result<()> {
        let mut updaters = self.updaters.lock().await;
        if self.started_at.set(Instant::now()).is_ok() {
            info!("框架启动");
        } else if updaters.iter().all(|managed| managed.initialized) {
            warn!("框架已启动，忽略重复的start");
            return Ok(());
        } else {
            info!("继续初始化未完成的更新器");
        }

        for managed in updaters.iter_mut().filter(|managed| !managed.initialized) {
            self.init_updater(managed).await?;
        }
        Ok(())
    }

    /// 添加更新器
    ///
    /// 框架已启动时立即按当前配置初始化。与 `start` 持有同一把锁，
    /// 不会出现添加后漏掉初始化的情况。
    ///
    /// # 返回
    /// * `Result<UpdaterScheduler>` - 更新器的调度器句柄
    pub async fn add_updater(&self, updater: Arc<dyn Updater>) -> Result<UpdaterScheduler> {
        let mut updaters = self.updaters.lock().await;
        let mut managed = ManagedUpdater::new(updater);
        if self.is_started() {
            self.init_updater(&mut managed).await?;
        }

        let scheduler = managed.scheduler.clone();
        updaters.push(managed);
        Ok(scheduler)
    }

    /// 所有更新器的调度器句柄
    pub async fn schedulers(&self) -> Vec<UpdaterScheduler> {
        self.updaters
            .lock()
            .await
            .iter()
            .map(|managed| managed.scheduler.clone())
            .collect()
    }

    /// 读取更新器配置、订阅周期变化并安排启动
    async fn init_updater(&self, managed: &mut ManagedUpdater) -> Result<()> {
        let scheduler = managed.scheduler.clone();
        let updater = Arc::clone(scheduler.updater());
        let base = format!("{}/{}", UPDATER_PATH, updater.config_id());

        let start_time = self
            .store
            .get(&format!("{base}/startTime"))
            .await?
            .as_ref()
            .and_then(as_millis)
            .unwrap_or_else(|| updater.default_start_time());
        let interval = self
            .store
            .get(&format!("{base}/interval"))
            .await?
            .as_ref()
            .and_then(as_millis)
            .unwrap_or_else(|| updater.default_interval());

        let elapsed = self
            .started_at
            .get()
            .map(|started| i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        let delay = start_time.saturating_sub(elapsed);

        scheduler.set_start_time(delay);
        scheduler.set_interval(interval);

        let on_interval = {
            let scheduler = scheduler.clone();
            let fallback = updater.default_interval();
            listener(move |event: ChangeEvent| {
                let scheduler = scheduler.clone();
                async move {
                    let interval = event.value.as_ref().and_then(as_millis).unwrap_or(fallback);
                    scheduler.set_interval(interval);
                    Ok(())
                }
            })
        };
        if let Some(previous) = managed.subscription.take() {
            self.store.off(previous);
        }
        managed.subscription =
            Some(self.store.on(&format!("{base}/interval"), EventKind::Value, on_interval)?);

        info!(
            updater = %updater.id(),
            "初始化更新器: 延迟={}ms, 周期={}ms",
            delay.max(0),
            interval
        );
        scheduler.init();
        managed.initialized = true;
        Ok(())
    }

    /// 向所有观察者广播
    ///
    /// # 参数
    /// * `topic` - 消息主题
    /// * `message` - 消息内容
    ///
    /// # 返回
    /// * `DispatchSummary` - 成功与失败数量
    pub async fn send(&self, topic: &str, message: impl Into<Value>) -> DispatchSummary {
        let message = message.into();
        let summary = self.fanout.send(topic, &message).await;
        debug!(
            "广播 {} 完成: 成功 {}, 失败 {}",
            topic, summary.delivered, summary.failed
        );
        summary
    }

    /// 等待已产生的配置事件处理完毕
    pub async fn settled(&self) {
        self.store.settled().await;
    }

    /// 停止所有更新器并取消配置订阅
    pub async fn shutdown(&self) {
        let mut updaters = self.updaters.lock().await;
        for managed in updaters.iter_mut() {
            managed.scheduler.stop();
            if let Some(id) = managed.subscription.take() {
                self.store.off(id);
            }
        }

        let mut subscriptions = self.subscriptions.lock().await;
        for id in subscriptions.drain(..) {
            self.store.off(id);
        }
        info!("框架已停止");
    }
}

/// 把配置值解释为毫秒数
fn as_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
