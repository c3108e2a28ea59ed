//! 飞书通知观察者模块
//!
//! 实现飞书自定义机器人 webhook 通知，支持签名校验

use crate::notification::observer::NotificationObserver;
use crate::notification::template::{MessageTemplate, DEFAULT_TEMPLATE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// 飞书通知观察者
pub struct FeishuObserver {
    /// HTTP客户端
    client: Client,
    /// webhook URL
    webhook_url: String,
    /// 签名密钥
    secret: Option<String>,
    /// 卡片颜色
    color: String,
    /// 消息模板
    template: MessageTemplate,
}

impl FeishuObserver {
    /// 创建新的飞书观察者
    ///
    /// # 参数
    /// * `webhook_url` - 机器人 webhook URL
    /// * `secret` - 签名密钥，未开启签名校验时为 `None`
    /// * `template` - 消息模板
    ///
    /// # 返回
    /// * `Result<Self>` - 观察者实例
    pub fn new(webhook_url: String, secret: Option<String>, template: MessageTemplate) -> Result<Self> {
        if webhook_url.is_empty() {
            anyhow::bail!("飞书观察者需要 webhook_url");
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("创建HTTP客户端失败")?;

        Ok(Self {
            client,
            webhook_url,
            secret,
            color: "blue".to_string(),
            template,
        })
    }

    /// 从观察者设置构造
    ///
    /// 设置字段：`webhook_url`（必填），`secret`、`template`、`color`（可选）。
    pub fn from_settings(settings: &Value) -> Result<Arc<dyn NotificationObserver>> {
        let webhook_url = settings
            .get("webhook_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let secret = settings
            .get("secret")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let template = MessageTemplate::from_settings(settings, DEFAULT_TEMPLATE)?;

        let mut observer = Self::new(webhook_url, secret, template)?;
        if let Some(color) = settings.get("color").and_then(Value::as_str) {
            observer.color = color.to_string();
        }
        Ok(Arc::new(observer))
    }

    /// 构建飞书消息体
    fn build_message_body(&self, title: &str, content: &str, timestamp: i64) -> Result<Value> {
        let mut body = json!({
            "msg_type": "interactive",
            "card": {
                "elements": [
                    {
                        "tag": "div",
                        "text": {
                            "content": content,
                            "tag": "lark_md"
                        }
                    }
                ],
                "header": {
                    "title": {
                        "content": title,
                        "tag": "plain_text"
                    },
                    "template": self.color
                }
            }
        });

        if let Some(secret) = &self.secret {
            body["timestamp"] = json!(timestamp.to_string());
            body["sign"] = json!(sign(timestamp, secret)?);
        }

        Ok(body)
    }

    /// 发送消息到飞书
    async fn send_to_webhook(&self, body: &Value) -> Result<()> {
        debug!("发送消息到飞书webhook: {}", self.webhook_url);

        let response = self
            .client
            .post(&self.webhook_url)
            .json(body)
            .send()
            .await
            .context("发送飞书消息失败")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("飞书消息发送失败: {} - {}", status, text);
            return Err(anyhow::anyhow!("飞书消息发送失败: {}", status));
        }

        // 飞书在 HTTP 200 时也可能通过 code 返回业务错误
        let reply: Value = response.json().await.unwrap_or(Value::Null);
        match reply.get("code").and_then(Value::as_i64) {
            Some(code) if code != 0 => {
                let msg = reply.get("msg").and_then(Value::as_str).unwrap_or_default();
                error!("飞书消息发送失败: code={} msg={}", code, msg);
                Err(anyhow::anyhow!("飞书消息发送失败: code={} msg={}", code, msg))
            }
            _ => {
                info!("飞书消息发送成功");
                Ok(())
            }
        }
    }
}

/// 计算飞书签名：以 `timestamp + "\n" + secret` 为密钥对空串做 HMAC-SHA256，再 base64 编码
pub fn sign(timestamp: i64, secret: &str) -> Result<String> {
    let string_to_sign = format!("{}\n{}", timestamp, secret);
    let mac = Hmac::<Sha256>::new_from_slice(string_to_sign.as_bytes())
        .map_err(|e| anyhow::anyhow!("签名密钥无效: {}", e))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl NotificationObserver for FeishuObserver {
    async fn update(&self, topic: &str, message: &Value) -> Result<()> {
        let content = self.template.render(topic, message)?;
        let body = self.build_message_body(topic, &content, chrono::Utc::now().timestamp())?;
        self.send_to_webhook(&body).await
    }

    fn kind(&self) -> &str {
        "feishu"
    }
}
