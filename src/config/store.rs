//! 配置存储接口
//!
//! 定义两种后端共同实现的路径寻址读写与订阅接口

use crate::config::event::{ChangeListener, EventKind, SubscriptionId};
use crate::config::tree;
use crate::error::ConfigError;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// 配置存储trait
///
/// 所有路径先经 [`ConfigPath::parse`](crate::config::ConfigPath::parse) 解析，
/// `.` 与 `/` 分隔符等价。
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// 后端名称，用于日志
    fn backend_name(&self) -> &'static str;

    /// 读取路径上的值
    ///
    /// # 返回
    /// * `Ok(None)` - 路径上没有值
    /// * `Err(ConfigError::BackendIo)` - 后端读取失败
    async fn get(&self, path: &str) -> Result<Option<Value>, ConfigError>;

    /// 整体替换路径上的值，失败时不产生部分写入
    ///
    /// 写入 `null` 表示删除该节点。
    async fn set(&self, path: &str, value: Value) -> Result<(), ConfigError>;

    /// 注册订阅
    ///
    /// 路径解析失败时同步返回错误；回调内部的失败只会被记录。
    /// 同一路径重复注册会得到两个独立的订阅。
    fn on(
        &self,
        path: &str,
        kind: EventKind,
        listener: ChangeListener,
    ) -> Result<SubscriptionId, ConfigError>;

    /// 取消订阅，返回订阅是否存在
    fn off(&self, id: SubscriptionId) -> bool;

    /// 当前保留的订阅数量
    fn subscription_count(&self) -> usize;

    /// 等待已产生的事件全部投递完成
    async fn settled(&self);

    /// 路径上是否存在值
    async fn has(&self, path: &str) -> Result<bool, ConfigError> {
        Ok(self.get(path).await?.is_some())
    }

    /// 路径上的列表是否包含 `member`
    ///
    /// 路径不存在时返回 `false`；值存在但不是列表时返回 `TypeMismatch`。
    async fn has_member(&self, path: &str, member: &Value) -> Result<bool, ConfigError> {
        match self.get(path).await? {
            None => Ok(false),
            Some(value) => contains_member(path, &value, member),
        }
    }

    /// 向路径上的列表追加 `value`，路径不存在时创建单元素列表
    async fn push(&self, path: &str, value: Value) -> Result<(), ConfigError> {
        append_member(self, path, value).await
    }
}

/// 判断列表是否包含成员
///
/// 除普通列表外也接受以成员字符串为键、`true` 为值的映射，
/// 以及远程存储生成的以任意键保存成员的映射。
/// 成员映射中的 `true` 只作为键标记，不按值匹配。
pub fn contains_member(path: &str, value: &Value, member: &Value) -> Result<bool, ConfigError> {
    match value {
        Value::Array(items) => Ok(items.contains(member)),
        Value::Object(map) => {
            let keyed = member
                .as_str()
                .is_some_and(|key| is_key_marker(map.get(key)));
            Ok(keyed || map.values().any(|v| !is_key_marker(Some(v)) && v == member))
        }
        other => Err(type_mismatch(path, other)),
    }
}

/// 以列表方式追加成员
pub(crate) async fn append_member<S>(store: &S, path: &str, value: Value) -> Result<(), ConfigError>
where
    S: ConfigStore + ?Sized,
{
    let merged = match store.get(path).await? {
        None => Value::Array(vec![value]),
        Some(Value::Array(mut items)) => {
            items.push(value);
            Value::Array(items)
        }
        Some(Value::Object(mut map)) => {
            insert_into_member_map(&mut map, value);
            Value::Object(map)
        }
        Some(other) => return Err(type_mismatch(path, &other)),
    };

    store.set(path, merged).await
}

/// 向成员映射中写入：字符串作为键，其余值放在下一个数字键下
///
/// 键已被其他成员占用时字符串也放在下一个数字键下。
fn insert_into_member_map(map: &mut Map<String, Value>, value: Value) {
    if let Value::String(key) = &value {
        if is_member_key(key) && is_key_free(map, key) {
            map.insert(key.clone(), Value::Bool(true));
            return;
        }
    }

    let next = map
        .keys()
        .filter_map(|k| k.parse::<u64>().ok())
        .max()
        .map_or(0, |max| max + 1);
    map.insert(next.to_string(), value);
}

fn is_key_marker(value: Option<&Value>) -> bool {
    value == Some(&Value::Bool(true))
}

/// 成员映射中的键是否可以写入键标记
pub(crate) fn is_key_free(map: &Map<String, Value>, key: &str) -> bool {
    map.get(key).map_or(true, |existing| is_key_marker(Some(existing)))
}

/// 字符串能否直接作为子节点键
pub(crate) fn is_member_key(key: &str) -> bool {
    !key.is_empty()
        && !key
            .chars()
            .any(|c| matches!(c, '.' | '/' | '#' | '$' | '[' | ']') || c.is_control())
}

pub(crate) fn type_mismatch(path: &str, found: &Value) -> ConfigError {
    ConfigError::TypeMismatch {
        path: path.to_string(),
        found: tree::type_name(found).to_string(),
    }
}
