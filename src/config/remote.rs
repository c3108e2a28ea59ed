//! 远程层级配置存储
//!
//! 通过 [`TreeTransport`] 维护远程树的本地镜像，每次推送到来时对相关订阅
//! 计算前后快照差异并产生事件：
//! - `ChildAdded` 在订阅时对现有子节点各触发一次，之后每新增一个子节点触发一次；
//! - `ChildChanged` / `ChildRemoved` 在真实变更时实时触发，不轮询；
//! - `Value` 在订阅时触发一次，之后值变化时触发；
//! - `ChildMoved` 不产生（后端没有排序优先级）。

use crate::config::dispatch::EventDispatcher;
use crate::config::event::{ChangeEvent, ChangeListener, EventKind, SubscriptionId};
use crate::config::path::ConfigPath;
use crate::config::store::{append_member, is_key_free, is_member_key, type_mismatch, ConfigStore};
use crate::config::transport::{TreeChange, TreeTransport};
use crate::config::tree;
use crate::error::ConfigError;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 变更流断开后的默认重连间隔
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

struct Subscription {
    id: SubscriptionId,
    path: ConfigPath,
    kind: EventKind,
    listener: ChangeListener,
}

struct SyncState {
    /// 远程树的本地镜像
    mirror: Value,
    /// 是否已收到首个完整快照
    synced: bool,
    /// 活跃订阅
    subscriptions: Vec<Subscription>,
}

type Pending = Vec<(SubscriptionId, ChangeListener, ChangeEvent)>;

/// 远程层级配置存储
pub struct RemoteHierarchicalStore {
    /// 传输层
    transport: Arc<dyn TreeTransport>,
    /// 镜像与订阅
    state: Arc<Mutex<SyncState>>,
    /// 事件投递器
    dispatcher: EventDispatcher,
    /// 下一个订阅编号
    next_id: AtomicU64,
    /// 首次同步完成信号
    synced: watch::Receiver<bool>,
    /// 同步任务
    sync_task: JoinHandle<()>,
}

impl RemoteHierarchicalStore {
    /// 连接远程存储并启动同步任务
    ///
    /// 必须在 tokio 运行时内调用。
    pub fn connect<T: TreeTransport>(transport: T) -> Self {
        Self::connect_with_retry(Arc::new(transport), DEFAULT_RETRY_DELAY)
    }

    /// 使用指定重连间隔连接远程存储
    pub fn connect_with_retry(transport: Arc<dyn TreeTransport>, retry_delay: Duration) -> Self {
        let state = Arc::new(Mutex::new(SyncState {
            mirror: Value::Null,
            synced: false,
            subscriptions: Vec::new(),
        }));
        let dispatcher = EventDispatcher::spawn("remote");
        let (synced_tx, synced) = watch::channel(false);

        let sync_task = tokio::spawn(Self::sync_loop(
            Arc::clone(&transport),
            Arc::clone(&state),
            dispatcher.clone(),
            synced_tx,
            retry_delay,
        ));

        info!("已连接远程配置存储: {}", transport.name());

        Self {
            transport,
            state,
            dispatcher,
            next_id: AtomicU64::new(1),
            synced,
            sync_task,
        }
    }

    /// 是否已收到首个完整快照
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn sync_loop(
        transport: Arc<dyn TreeTransport>,
        state: Arc<Mutex<SyncState>>,
        dispatcher: EventDispatcher,
        synced: watch::Sender<bool>,
        retry_delay: Duration,
    ) {
        loop {
            match transport.watch().await {
                Ok(mut changes) => {
                    debug!("远程变更流已打开: {}", transport.name());
                    while let Some(item) = changes.next().await {
                        match item {
                            Ok(change) => {
                                Self::apply_change(&state, &dispatcher, change);
                                synced.send_replace(true);
                            }
                            Err(e) => {
                                warn!("远程变更流出错: {}", e);
                                break;
                            }
                        }
                    }
                    warn!(
                        "远程变更流已断开，{}秒后重连: {}",
                        retry_delay.as_secs_f64(),
                        transport.name()
                    );
                }
                Err(e) => {
                    error!("打开远程变更流失败: {}", e);
                }
            }
            tokio::time::sleep(retry_delay).await;
        }
    }

    /// 将一次远程写入应用到镜像并为相关订阅生成事件
    fn apply_change(state: &Mutex<SyncState>, dispatcher: &EventDispatcher, change: TreeChange) {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        let first_sync = !state.synced;
        let changed_path = change.path().clone();

        let before: Vec<(usize, Option<Value>)> = state
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, sub)| {
                sub.path.is_prefix_of(&changed_path) || changed_path.is_prefix_of(&sub.path)
            })
            .map(|(index, sub)| (index, tree::lookup(&state.mirror, &sub.path).cloned()))
            .collect();

        if state.mirror.is_null() {
            state.mirror = Value::Object(Map::new());
        }
        if let Err(e) = change.apply(&mut state.mirror) {
            error!("无法应用远程变更 {}: {}", changed_path, e);
            return;
        }
        state.synced = true;

        let mut pending = Pending::new();
        for (index, old) in before {
            let sub = &state.subscriptions[index];
            let new = tree::lookup(&state.mirror, &sub.path);
            Self::collect_events(sub, old.as_ref(), new, first_sync, &mut pending);
        }

        for (id, listener, event) in pending {
            dispatcher.enqueue(id, listener, event);
        }
    }

    fn collect_events(
        sub: &Subscription,
        before: Option<&Value>,
        after: Option<&Value>,
        force_value: bool,
        pending: &mut Pending,
    ) {
        let mut push = |event: ChangeEvent| pending.push((sub.id, sub.listener.clone(), event));

        match sub.kind {
            EventKind::Value => {
                if force_value || before != after {
                    push(ChangeEvent::value(&sub.path, after.cloned()));
                }
            }
            EventKind::ChildAdded | EventKind::ChildChanged | EventKind::ChildRemoved => {
                let diff = tree::diff_children(before, after);
                let entries = match sub.kind {
                    EventKind::ChildAdded => diff.added,
                    EventKind::ChildChanged => diff.changed,
                    _ => diff.removed,
                };
                for (key, value) in entries {
                    push(ChangeEvent::child(sub.kind, &sub.path, key, value));
                }
            }
            EventKind::ChildMoved => {}
        }
    }
}

impl Drop for RemoteHierarchicalStore {
    fn drop(&mut self) {
        self.sync_task.abort();
    }
}

#[async_trait]
impl ConfigStore for RemoteHierarchicalStore {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, ConfigError> {
        let path = ConfigPath::parse(path)?;
        self.transport.fetch(&path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let path = ConfigPath::parse(path)?;
        self.transport.store(&path, value).await
    }

    async fn push(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let key = match &value {
            Value::String(key) if is_member_key(key) => key.clone(),
            _ => return append_member(self, path, value).await,
        };

        let parsed = ConfigPath::parse(path)?;
        match self.transport.fetch(&parsed).await? {
            Some(Value::Object(map)) if !is_key_free(&map, &key) => {
                append_member(self, path, value).await
            }
            None | Some(Value::Object(_)) => {
                self.transport
                    .store(&parsed.child(key), Value::Bool(true))
                    .await
            }
            Some(Value::Array(_)) => append_member(self, path, value).await,
            Some(other) => Err(type_mismatch(path, &other)),
        }
    }

    fn on(
        &self,
        path: &str,
        kind: EventKind,
        listener: ChangeListener,
    ) -> Result<SubscriptionId, ConfigError> {
        let path = ConfigPath::parse(path)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.synced {
            let current = tree::lookup(&state.mirror, &path);
            match kind {
                EventKind::Value => {
                    self.dispatcher.enqueue(
                        id,
                        listener.clone(),
                        ChangeEvent::value(&path, current.cloned()),
                    );
                }
                EventKind::ChildAdded => {
                    for (key, child) in current.map(tree::children).unwrap_or_default() {
                        self.dispatcher.enqueue(
                            id,
                            listener.clone(),
                            ChangeEvent::child(kind, &path, key, child.clone()),
                        );
                    }
                }
                _ => {}
            }
        }

        debug!("注册远程订阅 {} {} {}", id, kind, path);
        state.subscriptions.push(Subscription {
            id,
            path,
            kind,
            listener,
        });
        Ok(id)
    }

    fn off(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.subscriptions.len();
        state.subscriptions.retain(|sub| sub.id != id);
        before != state.subscriptions.len()
    }

    fn subscription_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscriptions
            .len()
    }

    async fn settled(&self) {
        let mut synced = self.synced.clone();
        let _ = synced.wait_for(|ready| *ready).await;
        self.dispatcher.settled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::event::listener;
    use crate::config::transport::MemoryTransport;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn channel_listener() -> (ChangeListener, mpsc::UnboundedReceiver<ChangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback = listener(move |event: ChangeEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
                Ok(())
            }
        });
        (callback, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ChangeEvent>) -> ChangeEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("事件超时")
            .expect("通道已关闭")
    }

    #[tokio::test]
    async fn test_child_events_are_live() {
        let transport = MemoryTransport::new(json!({"observers": {"a": {"type": "x"}}}));
        let store = RemoteHierarchicalStore::connect(transport.clone());
        store.settled().await;

        let (added, mut added_rx) = channel_listener();
        let (changed, mut changed_rx) = channel_listener();
        let (removed, mut removed_rx) = channel_listener();
        store.on("observers", EventKind::ChildAdded, added).unwrap();
        store.on("observers", EventKind::ChildChanged, changed).unwrap();
        store.on("observers", EventKind::ChildRemoved, removed).unwrap();

        // 订阅时对现有子节点触发
        let existing = next(&mut added_rx).await;
        assert_eq!(existing.key.as_deref(), Some("a"));

        store.set("observers/b", json!({"type": "y"})).await.unwrap();
        let added_b = next(&mut added_rx).await;
        assert_eq!(added_b.key.as_deref(), Some("b"));
        assert_eq!(added_b.value, Some(json!({"type": "y"})));

        store.set("observers.a.type", json!("z")).await.unwrap();
        let changed_a = next(&mut changed_rx).await;
        assert_eq!(changed_a.key.as_deref(), Some("a"));
        assert_eq!(changed_a.value, Some(json!({"type": "z"})));

        store.set("observers/b", Value::Null).await.unwrap();
        let removed_b = next(&mut removed_rx).await;
        assert_eq!(removed_b.kind, EventKind::ChildRemoved);
        assert_eq!(removed_b.value, Some(json!({"type": "y"})));
    }

    #[tokio::test]
    async fn test_subscription_before_sync_sees_existing_children_once() {
        let transport = MemoryTransport::new(json!({"observers": {"a": 1, "b": 2}}));
        let store = RemoteHierarchicalStore::connect(transport);

        let (added, mut rx) = channel_listener();
        store.on("observers", EventKind::ChildAdded, added).unwrap();
        store.settled().await;

        let mut keys = vec![next(&mut rx).await.key.unwrap(), next(&mut rx).await.key.unwrap()];
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_value_subscription_tracks_changes() {
        let transport = MemoryTransport::new(json!({"updater": {"news": {"interval": 1000}}}));
        let store = RemoteHierarchicalStore::connect(transport);
        store.settled().await;

        let (callback, mut rx) = channel_listener();
        store.on("updater/news/interval", EventKind::Value, callback).unwrap();
        assert_eq!(next(&mut rx).await.value, Some(json!(1000)));

        store.set("updater.news", json!({"interval": 3000})).await.unwrap();
        assert_eq!(next(&mut rx).await.value, Some(json!(3000)));

        // 无关路径的写入不触发
        store.set("other", json!(1)).await.unwrap();
        store.set("updater.news.interval", json!(4000)).await.unwrap();
        assert_eq!(next(&mut rx).await.value, Some(json!(4000)));
    }

    #[tokio::test]
    async fn test_string_push_uses_key_encoding() {
        let store = RemoteHierarchicalStore::connect(MemoryTransport::default());

        store.push("seen", json!("post-1")).await.unwrap();
        store.push("seen", json!("post-2")).await.unwrap();
        store.push("seen", json!(42)).await.unwrap();

        assert_eq!(
            store.get("seen").await.unwrap(),
            Some(json!({"post-1": true, "post-2": true, "0": 42}))
        );
        assert!(store.has_member("seen", &json!("post-1")).await.unwrap());
        assert!(store.has_member("seen", &json!(42)).await.unwrap());
        assert!(!store.has_member("seen", &json!("post-3")).await.unwrap());
    }

    #[tokio::test]
    async fn test_off_bounds_subscriptions() {
        let store = RemoteHierarchicalStore::connect(MemoryTransport::default());

        for _ in 0..100 {
            let (callback, _rx) = channel_listener();
            let id = store.on("updater/a/interval", EventKind::Value, callback).unwrap();
            assert!(store.off(id));
        }
        assert_eq!(store.subscription_count(), 0);
        assert!(!store.off(SubscriptionId(9999)));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let transport = MemoryTransport::default();
        let store = RemoteHierarchicalStore::connect(transport.clone());
        transport.set_offline(true);

        assert!(matches!(
            store.get("a").await,
            Err(ConfigError::BackendIo(_))
        ));
        assert!(matches!(
            store.set("a", json!(1)).await,
            Err(ConfigError::BackendIo(_))
        ));
    }
}
