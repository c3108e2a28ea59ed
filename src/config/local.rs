//! 本地文件配置存储
//!
//! 构造时一次性加载整个文档（JSON，或扩展名为 `.toml` 时使用TOML）。
//!
//! 事件语义是一次性的：
//! - `Value` 订阅在注册时以当前快照触发一次，之后的修改不会再通知；
//! - `ChildAdded` 订阅在注册时对每个现有子节点触发一次（列表按下标，映射按键）；
//! - `ChildChanged` / `ChildRemoved` / `ChildMoved` 在此后端不可观察。
//!
//! 不监控文件变化，静态部署依赖这种一次性初始化行为。

use crate::config::dispatch::EventDispatcher;
use crate::config::event::{ChangeEvent, ChangeListener, EventKind, SubscriptionId};
use crate::config::path::ConfigPath;
use crate::config::store::ConfigStore;
use crate::config::tree;
use crate::error::ConfigError;
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 文档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    /// JSON文档
    Json,
    /// TOML文档
    Toml,
}

impl DocumentFormat {
    /// 根据文件扩展名判断格式
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => DocumentFormat::Toml,
            _ => DocumentFormat::Json,
        }
    }

    fn parse(&self, content: &str) -> Result<Value, ConfigError> {
        match self {
            DocumentFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("JSON解析失败: {e}"))),
            DocumentFormat::Toml => toml::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("TOML解析失败: {e}"))),
        }
    }

    fn render(&self, document: &Value) -> Result<String, ConfigError> {
        match self {
            DocumentFormat::Json => serde_json::to_string_pretty(document)
                .map_err(|e| ConfigError::ParseError(format!("JSON序列化失败: {e}"))),
            DocumentFormat::Toml => toml::to_string_pretty(document)
                .map_err(|e| ConfigError::ParseError(format!("TOML序列化失败: {e}"))),
        }
    }
}

/// 本地文件配置存储
pub struct LocalFileStore {
    /// 文档文件路径
    file_path: PathBuf,
    /// 文档格式
    format: DocumentFormat,
    /// 内存中的文档
    document: RwLock<Value>,
    /// 串行化写入
    write_lock: Mutex<()>,
    /// 事件投递器
    dispatcher: EventDispatcher,
    /// 下一个订阅编号
    next_id: AtomicU64,
}

impl LocalFileStore {
    /// 从文件加载配置存储
    ///
    /// # 参数
    /// * `file_path` - 配置文档路径
    ///
    /// # 返回
    /// * `Result<Self, ConfigError>` - 存储实例或错误
    pub async fn open<P: AsRef<Path>>(file_path: P) -> Result<Self, ConfigError> {
        let file_path = file_path.as_ref().to_path_buf();

        if !file_path.exists() {
            return Err(ConfigError::FileNotFound {
                path: file_path.display().to_string(),
            });
        }

        let content = tokio::fs::read_to_string(&file_path)
            .await
            .map_err(|e| ConfigError::BackendIo(format!("读取文件失败 {}: {e}", file_path.display())))?;

        let format = DocumentFormat::from_path(&file_path);
        let document = format.parse(&content)?;

        info!("成功加载配置文件: {}", file_path.display());
        Ok(Self::from_document(file_path, document))
    }

    /// 使用已解析的文档创建存储，写入时仍会落盘到 `file_path`
    pub fn from_document<P: Into<PathBuf>>(file_path: P, document: Value) -> Self {
        let file_path = file_path.into();
        let format = DocumentFormat::from_path(&file_path);

        Self {
            file_path,
            format,
            document: RwLock::new(document),
            write_lock: Mutex::new(()),
            dispatcher: EventDispatcher::spawn("local"),
            next_id: AtomicU64::new(1),
        }
    }

    /// 文档文件路径
    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn snapshot(&self, path: &ConfigPath) -> Option<Value> {
        let document = self.document.read().unwrap_or_else(PoisonError::into_inner);
        tree::lookup(&document, path).cloned()
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "config".into());
        name.push(".tmp");
        self.file_path.with_file_name(name)
    }
}

#[async_trait]
impl ConfigStore for LocalFileStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, ConfigError> {
        let path = ConfigPath::parse(path)?;
        Ok(self.snapshot(&path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        let path = ConfigPath::parse(path)?;
        let _guard = self.write_lock.lock().await;

        let mut updated = self
            .document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tree::assign(&mut updated, &path, value)?;
        let content = self.format.render(&updated)?;

        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| ConfigError::BackendIo(format!("写入文件失败 {}: {e}", temp_path.display())))?;
        if let Err(e) = tokio::fs::rename(&temp_path, &self.file_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(ConfigError::BackendIo(format!(
                "替换文件失败 {}: {e}",
                self.file_path.display()
            )));
        }

        *self.document.write().unwrap_or_else(PoisonError::into_inner) = updated;
        debug!("配置已写入: {} ({})", path, self.file_path.display());
        Ok(())
    }

    fn on(
        &self,
        path: &str,
        kind: EventKind,
        listener: ChangeListener,
    ) -> Result<SubscriptionId, ConfigError> {
        let path = ConfigPath::parse(path)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        match kind {
            EventKind::Value => {
                let event = ChangeEvent::value(&path, self.snapshot(&path));
                self.dispatcher.enqueue(id, listener, event);
            }
            EventKind::ChildAdded => {
                if let Some(value) = self.snapshot(&path) {
                    for (key, child) in tree::children(&value) {
                        let event = ChangeEvent::child(kind, &path, key, child.clone());
                        self.dispatcher.enqueue(id, listener.clone(), event);
                    }
                }
            }
            EventKind::ChildChanged | EventKind::ChildRemoved | EventKind::ChildMoved => {
                warn!("本地配置文件不支持 {} 事件，订阅 {} 不会触发: {}", kind, id, path);
            }
        }

        Ok(id)
    }

    fn off(&self, _id: SubscriptionId) -> bool {
        false
    }

    fn subscription_count(&self) -> usize {
        0
    }

    async fn settled(&self) {
        self.dispatcher.settled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::event::listener;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store_with(document: Value) -> (TempDir, LocalFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string(&document).unwrap()).unwrap();
        let store = LocalFileStore::open(&path).await.unwrap();
        (dir, store)
    }

    fn recorder() -> (ChangeListener, Arc<std::sync::Mutex<Vec<ChangeEvent>>>) {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback = listener(move |event: ChangeEvent| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        });
        (callback, events)
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let result = LocalFileStore::open("/nonexistent/config.json").await;
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[tokio::test]
    async fn test_set_persists_and_get_reads_back() {
        let (_dir, store) = store_with(json!({"observers": {}})).await;

        store.set("updater/news/interval", json!(1000)).await.unwrap();
        assert_eq!(store.get("updater.news.interval").await.unwrap(), Some(json!(1000)));

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(store.file_path()).unwrap()).unwrap();
        assert_eq!(on_disk["updater"]["news"]["interval"], json!(1000));
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_failed_write_does_not_apply() {
        let dir = tempfile::tempdir().unwrap();
        let missing_dir = dir.path().join("gone").join("config.json");
        let store = LocalFileStore::from_document(&missing_dir, json!({"a": 1}));

        let result = store.set("a", json!(2)).await;
        assert!(matches!(result, Err(ConfigError::BackendIo(_))));
        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_toml_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[observers.abc]\ntype = \"log\"\n").unwrap();

        let store = LocalFileStore::open(&path).await.unwrap();
        assert_eq!(store.get("observers.abc.type").await.unwrap(), Some(json!("log")));

        store.set("updater.news.interval", json!(5000)).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("interval = 5000"));
    }

    #[tokio::test]
    async fn test_value_subscription_is_one_shot() {
        let (_dir, store) = store_with(json!({"updater": {"news": {"interval": 1000}}})).await;
        let (callback, events) = recorder();

        store.on("updater.news.interval", EventKind::Value, callback).unwrap();
        store.set("updater.news.interval", json!(3000)).await.unwrap();
        store.settled().await;

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, Some(json!(1000)));
        assert_eq!(events[0].key.as_deref(), Some("interval"));
    }

    #[tokio::test]
    async fn test_child_added_iterates_once() {
        let (_dir, store) =
            store_with(json!({"observers": {"a": {"type": "x"}, "b": {"type": "y"}}, "list": ["p", "q"]}))
                .await;
        let (callback, events) = recorder();

        store.on("observers", EventKind::ChildAdded, callback.clone()).unwrap();
        store.on("list", EventKind::ChildAdded, callback).unwrap();
        store.set("observers/c", json!({"type": "z"})).await.unwrap();
        store.settled().await;

        let keys: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.key.clone())
            .collect();
        assert_eq!(keys, vec!["a", "b", "0", "1"]);
    }

    #[tokio::test]
    async fn test_change_and_remove_are_not_observable() {
        let (_dir, store) = store_with(json!({"observers": {"a": {"type": "x"}}})).await;
        let (callback, events) = recorder();

        store.on("observers", EventKind::ChildChanged, callback.clone()).unwrap();
        store.on("observers", EventKind::ChildRemoved, callback).unwrap();
        store.set("observers/a", json!({"type": "y"})).await.unwrap();
        store.set("observers/a", Value::Null).await.unwrap();
        store.settled().await;

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_path_fails_synchronously() {
        let (_dir, store) = store_with(json!({})).await;
        let (callback, _events) = recorder();

        let result = store.on("a..b", EventKind::Value, callback);
        assert!(matches!(result, Err(ConfigError::InvalidPath(_))));
    }
}
