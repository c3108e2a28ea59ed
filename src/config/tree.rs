//! 配置树操作
//!
//! 在 `serde_json::Value` 文档上按路径读取、写入并计算子节点差异。
//! `null` 节点一律视为不存在。

use crate::config::path::ConfigPath;
use crate::error::ConfigError;
use serde_json::{Map, Value};

/// 按路径读取节点
pub fn lookup<'a>(root: &'a Value, path: &ConfigPath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// 按路径写入节点，整体替换目标值
///
/// 中间节点不存在或为标量时创建为对象；写入 `null` 表示删除。
pub fn assign(root: &mut Value, path: &ConfigPath, value: Value) -> Result<(), ConfigError> {
    let Some((last, parents)) = path.segments().split_last() else {
        *root = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value
        };
        return Ok(());
    };

    let mut current = root;
    for (depth, segment) in parents.iter().enumerate() {
        current = step_mut(current, segment, &path.segments()[..=depth])?;
    }

    match current {
        Value::Object(map) => {
            if value.is_null() {
                map.remove(last);
            } else {
                map.insert(last.clone(), value);
            }
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_index(last, path)?;
            if index < items.len() {
                items[index] = value;
                Ok(())
            } else if index == items.len() {
                if !value.is_null() {
                    items.push(value);
                }
                Ok(())
            } else {
                Err(ConfigError::InvalidPath(format!(
                    "数组下标 {index} 超出范围: {path}"
                )))
            }
        }
        other => {
            let mut map = Map::new();
            if !value.is_null() {
                map.insert(last.clone(), value);
            }
            *other = Value::Object(map);
            Ok(())
        }
    }
}

/// 单步向下导航，必要时创建中间对象
fn step_mut<'a>(
    current: &'a mut Value,
    segment: &str,
    walked: &[String],
) -> Result<&'a mut Value, ConfigError> {
    match current {
        Value::Object(map) => Ok(map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let index = segment.parse::<usize>().map_err(|_| {
                ConfigError::InvalidPath(format!(
                    "无效的数组下标 '{}'，位于 {}",
                    segment,
                    walked.join("/")
                ))
            })?;
            if index == items.len() {
                items.push(Value::Object(Map::new()));
            }
            items.get_mut(index).ok_or_else(|| {
                ConfigError::InvalidPath(format!(
                    "数组下标 {} 超出范围，位于 {}",
                    index,
                    walked.join("/")
                ))
            })
        }
        other => {
            *other = Value::Object(Map::new());
            match other {
                Value::Object(map) => Ok(map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()))),
                _ => Err(ConfigError::InvalidPath(format!(
                    "无法进入节点 {}",
                    walked.join("/")
                ))),
            }
        }
    }
}

fn parse_index(segment: &str, path: &ConfigPath) -> Result<usize, ConfigError> {
    segment
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidPath(format!("无效的数组下标 '{segment}': {path}")))
}

/// 列出直接子节点：对象按键，列表按下标
pub fn children(value: &Value) -> Vec<(String, &Value)> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v))
            .collect(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_null())
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => Vec::new(),
    }
}

/// 值的类型名称，用于错误信息
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// 两个快照之间的子节点差异
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChildDiff {
    /// 新增的子节点
    pub added: Vec<(String, Value)>,
    /// 值发生变化的子节点（新值）
    pub changed: Vec<(String, Value)>,
    /// 被删除的子节点（旧值）
    pub removed: Vec<(String, Value)>,
}

impl ChildDiff {
    /// 是否没有任何差异
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// 计算子节点差异
pub fn diff_children(before: Option<&Value>, after: Option<&Value>) -> ChildDiff {
    let old: Vec<(String, &Value)> = before.map(children).unwrap_or_default();
    let new: Vec<(String, &Value)> = after.map(children).unwrap_or_default();

    let mut diff = ChildDiff::default();

    for (key, old_value) in &old {
        match new.iter().find(|(k, _)| k == key) {
            Some((_, new_value)) if new_value != old_value => {
                diff.changed.push((key.clone(), (*new_value).clone()));
            }
            Some(_) => {}
            None => diff.removed.push((key.clone(), (*old_value).clone())),
        }
    }

    for (key, new_value) in &new {
        if !old.iter().any(|(k, _)| k == key) {
            diff.added.push((key.clone(), (*new_value).clone()));
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(raw: &str) -> ConfigPath {
        ConfigPath::parse(raw).unwrap()
    }

    #[test]
    fn test_lookup_objects_and_arrays() {
        let doc = json!({"a": {"b": [10, {"c": "x"}]}, "n": null});

        assert_eq!(lookup(&doc, &path("a.b.0")), Some(&json!(10)));
        assert_eq!(lookup(&doc, &path("a/b/1/c")), Some(&json!("x")));
        assert_eq!(lookup(&doc, &path("a.b.7")), None);
        assert_eq!(lookup(&doc, &path("n")), None);
        assert_eq!(lookup(&doc, &path("a.b.0.deeper")), None);
    }

    #[test]
    fn test_assign_creates_intermediates_and_deletes() {
        let mut doc = json!({"flag": true});

        assign(&mut doc, &path("updater.news.interval"), json!(1000)).unwrap();
        assert_eq!(doc["updater"]["news"]["interval"], json!(1000));

        // 标量中间节点被替换为对象
        assign(&mut doc, &path("flag.inner"), json!(1)).unwrap();
        assert_eq!(doc["flag"], json!({"inner": 1}));

        assign(&mut doc, &path("updater.news"), Value::Null).unwrap();
        assert_eq!(lookup(&doc, &path("updater.news")), None);
    }

    #[test]
    fn test_assign_array_append_and_out_of_range() {
        let mut doc = json!({"list": ["a"]});

        assign(&mut doc, &path("list.1"), json!("b")).unwrap();
        assert_eq!(doc["list"], json!(["a", "b"]));

        let result = assign(&mut doc, &path("list.5"), json!("c"));
        assert!(matches!(result, Err(ConfigError::InvalidPath(_))));
    }

    #[test]
    fn test_diff_children() {
        let before = json!({"keep": 1, "change": 1, "drop": 1});
        let after = json!({"keep": 1, "change": 2, "new": 3});

        let diff = diff_children(Some(&before), Some(&after));
        assert_eq!(diff.added, vec![("new".to_string(), json!(3))]);
        assert_eq!(diff.changed, vec![("change".to_string(), json!(2))]);
        assert_eq!(diff.removed, vec![("drop".to_string(), json!(1))]);

        let from_nothing = diff_children(None, Some(&json!(["x", "y"])));
        assert_eq!(from_nothing.added.len(), 2);
        assert_eq!(from_nothing.added[1].0, "1");
    }
}
