//! 消息模板模块
//!
//! 使用 Handlebars 把 `(topic, message)` 渲染为文本，供内置 webhook 观察者使用

use crate::notification::observer::message_text;
use anyhow::{Context, Result};
use handlebars::Handlebars;
use serde_json::{json, Value};

const TEMPLATE_NAME: &str = "message";

/// 默认模板：只输出消息文本
pub const DEFAULT_TEMPLATE: &str = "{{text}}";

/// 带主题的模板
pub const TOPIC_TEMPLATE: &str = "**{{topic}}**\n{{text}}";

/// 消息模板
///
/// 模板可用的变量：
/// - `topic`: 消息主题
/// - `text`: 消息文本（字符串原样，其余值为JSON）
/// - `message`: 原始消息值，可访问其字段
pub struct MessageTemplate {
    registry: Handlebars<'static>,
}

impl std::fmt::Debug for MessageTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTemplate").finish_non_exhaustive()
    }
}

impl MessageTemplate {
    /// 编译模板
    ///
    /// # 参数
    /// * `template` - Handlebars 模板字符串
    ///
    /// # 返回
    /// * `Result<Self>` - 语法错误时返回错误
    pub fn new(template: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        // 输出用于聊天消息，不做HTML转义
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(TEMPLATE_NAME, template)
            .context("消息模板语法错误")?;
        Ok(Self { registry })
    }

    /// 从观察者设置的 `template` 字段构造，缺省时使用 `default`
    pub fn from_settings(settings: &Value, default: &str) -> Result<Self> {
        let template = settings
            .get("template")
            .and_then(Value::as_str)
            .unwrap_or(default);
        Self::new(template)
    }

    /// 渲染消息
    pub fn render(&self, topic: &str, message: &Value) -> Result<String> {
        let data = json!({
            "topic": topic,
            "text": message_text(message),
            "message": message,
        });
        self.registry
            .render(TEMPLATE_NAME, &data)
            .context("消息模板渲染失败")
    }
}
