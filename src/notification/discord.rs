//! Discord webhook 观察者
//!
//! 组合一个 HTTP 客户端，把消息渲染后发送到 `<api_base>/<id>/<key>`

use crate::notification::observer::NotificationObserver;
use crate::notification::template::{MessageTemplate, DEFAULT_TEMPLATE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Discord webhook 接口地址
pub const DISCORD_API_BASE: &str = "https://discord.com/api/webhooks";

/// Discord 单条消息的最大字符数
const MAX_CONTENT_CHARS: usize = 2000;

/// Discord webhook 观察者
pub struct DiscordWebhook {
    /// HTTP客户端
    client: Client,
    /// webhook 地址
    webhook_url: String,
    /// 显示的用户名
    username: Option<String>,
    /// 消息模板
    template: MessageTemplate,
}

impl DiscordWebhook {
    /// 创建 Discord webhook 观察者
    ///
    /// # 参数
    /// * `api_base` - 接口地址，通常为 [`DISCORD_API_BASE`]
    /// * `id` - webhook id
    /// * `key` - webhook token
    /// * `template` - 消息模板
    ///
    /// # 返回
    /// * `Result<Self>` - 观察者实例
    pub fn new(api_base: &str, id: &str, key: &str, template: MessageTemplate) -> Result<Self> {
        if id.is_empty() || key.is_empty() {
            anyhow::bail!("Discord webhook 需要 id 和 key");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("创建HTTP客户端失败")?;

        Ok(Self {
            client,
            webhook_url: format!("{}/{}/{}", api_base.trim_end_matches('/'), id, key),
            username: None,
            template,
        })
    }

    /// 设置显示的用户名
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// 从观察者设置构造
    ///
    /// 设置字段：`id`、`key`（必填），`template`、`username`、`api_base`（可选）。
    pub fn from_settings(settings: &Value) -> Result<Arc<dyn NotificationObserver>> {
        let id = credential(settings, "id");
        let key = credential(settings, "key");
        let (Some(id), Some(key)) = (id, key) else {
            anyhow::bail!("Discord webhook 需要 id 和 key");
        };

        let api_base = settings
            .get("api_base")
            .and_then(Value::as_str)
            .unwrap_or(DISCORD_API_BASE);
        let template = MessageTemplate::from_settings(settings, DEFAULT_TEMPLATE)?;

        let mut webhook = Self::new(api_base, &id, &key, template)?;
        if let Some(username) = settings.get("username").and_then(Value::as_str) {
            webhook = webhook.with_username(username);
        }
        Ok(Arc::new(webhook))
    }

    /// 构建消息体
    fn build_message_body(&self, content: &str) -> Value {
        let content: String = content.chars().take(MAX_CONTENT_CHARS).collect();
        let mut body = Map::new();
        body.insert("content".to_string(), json!(content));
        if let Some(username) = &self.username {
            body.insert("username".to_string(), json!(username));
        }
        Value::Object(body)
    }

    /// 发送消息到 webhook
    async fn execute(&self, body: &Value) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(body)
            .send()
            .await
            .context("发送Discord消息失败")?;

        let status = response.status();
        if status.is_success() {
            debug!("Discord消息发送成功");
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            error!("Discord消息发送失败: {} - {}", status, text);
            Err(anyhow::anyhow!("Discord消息发送失败: {}", status))
        }
    }
}

/// 读取凭据字段，接受字符串或数字
fn credential(settings: &Value, field: &str) -> Option<String> {
    match settings.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl NotificationObserver for DiscordWebhook {
    async fn update(&self, topic: &str, message: &Value) -> Result<()> {
        let content = self.template.render(topic, message)?;
        let body = self.build_message_body(&content);
        self.execute(&body).await
    }

    fn kind(&self) -> &str {
        "discord_webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[test]
    fn test_missing_credentials_fail_construction() {
        let error = DiscordWebhook::from_settings(&json!({"id": "1"})).err().unwrap();
        assert!(error.to_string().contains("id 和 key"));

        let error = DiscordWebhook::from_settings(&json!({"id": "", "key": "k"}))
            .err()
            .unwrap();
        assert!(error.to_string().contains("id 和 key"));
    }

    #[test]
    fn test_numeric_id_accepted() {
        assert!(DiscordWebhook::from_settings(&json!({"id": 123, "key": "k"})).is_ok());
    }

    #[test]
    fn test_content_is_truncated() {
        let webhook =
            DiscordWebhook::new(DISCORD_API_BASE, "1", "k", MessageTemplate::new("{{text}}").unwrap())
                .unwrap();
        let long = "x".repeat(MAX_CONTENT_CHARS + 10);
        let body = webhook.build_message_body(&long);
        assert_eq!(body["content"].as_str().unwrap().len(), MAX_CONTENT_CHARS);
    }

    #[tokio::test]
    async fn test_update_posts_rendered_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/1/k")
            .match_body(Matcher::Json(json!({"content": "**hey**\nhoho", "username": "bot"})))
            .with_status(204)
            .create_async()
            .await;

        let observer = DiscordWebhook::from_settings(&json!({
            "id": "1",
            "key": "k",
            "username": "bot",
            "template": "**{{topic}}**\n{{text}}",
            "api_base": server.url(),
        }))
        .unwrap();

        observer.update("hey", &json!("hoho")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/1/k")
            .with_status(404)
            .with_body(r#"{"message": "Unknown Webhook"}"#)
            .create_async()
            .await;

        let observer = DiscordWebhook::from_settings(&json!({
            "id": "1",
            "key": "k",
            "api_base": server.url(),
        }))
        .unwrap();

        assert!(observer.update("hey", &json!("hoho")).await.is_err());
    }
}
