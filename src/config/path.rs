//! 配置路径解析模块
//!
//! 将 `a.b/c` 形式的字符串解析为有序的路径段序列，`.` 与 `/` 可混用

use crate::error::ConfigError;
use std::fmt;

/// 配置路径，由非空路径段组成
///
/// 空路径表示根节点。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ConfigPath {
    segments: Vec<String>,
}

impl ConfigPath {
    /// 根路径
    pub fn root() -> Self {
        Self::default()
    }

    /// 解析路径字符串
    ///
    /// # 参数
    /// * `raw` - 以 `.` 或 `/` 分隔的路径
    ///
    /// # 返回
    /// * `Result<Self, ConfigError>` - 解析结果，中间存在空段时返回 `InvalidPath`
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix(['.', '/'])
            .unwrap_or(trimmed);
        let trimmed = trimmed.strip_suffix(['.', '/']).unwrap_or(trimmed);

        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split(['.', '/']) {
            if segment.is_empty() {
                return Err(ConfigError::InvalidPath(format!(
                    "路径 '{raw}' 含有空的路径段"
                )));
            }
            segments.push(segment.to_string());
        }

        Ok(Self { segments })
    }

    /// 路径段
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// 是否为根路径
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// 最后一个路径段，即该节点的键
    pub fn key(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// 追加一个子节点键
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(key.into());
        Self { segments }
    }

    /// 判断 `self` 是否为 `other` 的祖先或与之相同
    pub fn is_prefix_of(&self, other: &ConfigPath) -> bool {
        other.segments.len() >= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// 以 `/` 连接的路径字符串
    pub fn to_slash_path(&self) -> String {
        self.segments.join("/")
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.segments.join("/"))
        }
    }
}

impl std::str::FromStr for ConfigPath {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_delimiters_resolve_identically() {
        let dotted = ConfigPath::parse("a.b.c").unwrap();
        let slashed = ConfigPath::parse("a/b/c").unwrap();
        let mixed = ConfigPath::parse("a.b/c").unwrap();

        assert_eq!(dotted, slashed);
        assert_eq!(dotted, mixed);
        assert_eq!(mixed.segments(), &["a", "b", "c"]);
    }

    #[test]
    fn test_root_and_outer_delimiters() {
        assert!(ConfigPath::parse("").unwrap().is_root());
        assert!(ConfigPath::parse("/").unwrap().is_root());
        assert_eq!(
            ConfigPath::parse("/observers/").unwrap(),
            ConfigPath::parse("observers").unwrap()
        );
    }

    #[test]
    fn test_empty_segment_is_rejected() {
        let result = ConfigPath::parse("a..b");
        assert!(matches!(result, Err(ConfigError::InvalidPath(_))));
        assert!(ConfigPath::parse("a/./b").is_err());
    }

    #[test]
    fn test_prefix_and_child() {
        let parent = ConfigPath::parse("updater").unwrap();
        let child = parent.child("news").child("interval");

        assert!(parent.is_prefix_of(&child));
        assert!(!child.is_prefix_of(&parent));
        assert!(ConfigPath::root().is_prefix_of(&child));
        assert_eq!(child.key(), Some("interval"));
        assert_eq!(child.to_string(), "updater/news/interval");
    }
}
