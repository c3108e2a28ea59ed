//! Firebase 实时数据库传输
//!
//! 通过 REST 接口读写 `<database_url>/<root>/<path>.json`，
//! 通过 `text/event-stream` 接收 `put` / `patch` 推送。
//! 仅支持 `?auth=` 令牌认证。

use crate::config::path::ConfigPath;
use crate::config::transport::{ChangeStream, TreeChange, TreeTransport};
use crate::error::ConfigError;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{header, Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Firebase 传输
pub struct FirebaseTransport {
    /// 读写请求客户端
    client: Client,
    /// 长连接客户端（无整体超时）
    stream_client: Client,
    /// 数据库地址
    database_url: Url,
    /// 配置树在数据库中的根路径
    root: ConfigPath,
    /// 认证令牌
    auth_token: Option<String>,
}

impl FirebaseTransport {
    /// 创建 Firebase 传输
    ///
    /// # 参数
    /// * `database_url` - 数据库地址，如 `https://<project>.firebaseio.com`
    /// * `root` - 配置树的根路径
    /// * `auth_token` - 可选的数据库令牌
    ///
    /// # 返回
    /// * `Result<Self, ConfigError>` - 传输实例
    pub fn new(
        database_url: &str,
        root: &str,
        auth_token: Option<String>,
    ) -> Result<Self, ConfigError> {
        let database_url = Url::parse(database_url)
            .map_err(|e| ConfigError::ParseError(format!("无效的数据库地址 {database_url}: {e}")))?;
        if database_url.cannot_be_a_base() {
            return Err(ConfigError::ParseError(format!(
                "无效的数据库地址: {database_url}"
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::BackendIo(format!("创建HTTP客户端失败: {e}")))?;
        let stream_client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::BackendIo(format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self {
            client,
            stream_client,
            database_url,
            root: ConfigPath::parse(root)?,
            auth_token,
        })
    }

    /// 路径对应的 REST 地址
    fn endpoint(&self, path: &ConfigPath) -> Result<Url, ConfigError> {
        let mut segments: Vec<String> = self
            .root
            .segments()
            .iter()
            .chain(path.segments())
            .cloned()
            .collect();
        match segments.last_mut() {
            Some(last) => last.push_str(".json"),
            None => segments.push(".json".to_string()),
        }

        let mut url = self.database_url.clone();
        url.path_segments_mut()
            .map_err(|_| ConfigError::ParseError(format!("无效的数据库地址: {}", self.database_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.query(&[("auth", token)]),
            None => request,
        }
    }

    async fn check(response: Response, action: &str) -> Result<Response, ConfigError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(ConfigError::BackendIo(format!(
                "Firebase {action}失败: {status} - {text}"
            )))
        }
    }
}

#[async_trait]
impl TreeTransport for FirebaseTransport {
    fn name(&self) -> &'static str {
        "firebase"
    }

    async fn fetch(&self, path: &ConfigPath) -> Result<Option<Value>, ConfigError> {
        let url = self.endpoint(path)?;
        debug!("读取Firebase路径: {}", path);

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| ConfigError::BackendIo(format!("Firebase读取请求失败: {e}")))?;
        let response = Self::check(response, "读取").await?;

        let value: Value = response
            .json()
            .await
            .map_err(|e| ConfigError::ParseError(format!("Firebase响应解析失败: {e}")))?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn store(&self, path: &ConfigPath, value: Value) -> Result<(), ConfigError> {
        let url = self.endpoint(path)?;
        debug!("写入Firebase路径: {}", path);

        let request = if value.is_null() {
            self.client.delete(url)
        } else {
            self.client.put(url).json(&value)
        };
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ConfigError::BackendIo(format!("Firebase写入请求失败: {e}")))?;
        Self::check(response, "写入").await?;
        Ok(())
    }

    async fn watch(&self) -> Result<ChangeStream, ConfigError> {
        let url = self.endpoint(&ConfigPath::root())?;
        info!("打开Firebase变更流: {}", self.root);

        let response = self
            .authorize(self.stream_client.get(url))
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ConfigError::BackendIo(format!("Firebase监听请求失败: {e}")))?;
        let response = Self::check(response, "监听").await?;

        let bytes = Box::pin(response.bytes_stream());
        let changes = stream::unfold(
            (bytes, SseDecoder::default(), VecDeque::new()),
            |(mut bytes, mut decoder, mut pending)| async move {
                loop {
                    if let Some(item) = pending.pop_front() {
                        return Some((item, (bytes, decoder, pending)));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            pending.extend(decoder.feed(&chunk).iter().filter_map(parse_sse_event));
                        }
                        Some(Err(e)) => {
                            let error = ConfigError::BackendIo(format!("Firebase变更流读取失败: {e}"));
                            return Some((Err(error), (bytes, decoder, pending)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(changes.boxed())
    }
}

/// 一条服务端推送事件
#[derive(Debug, Clone, PartialEq)]
pub struct SseMessage {
    pub event: String,
    pub data: String,
}

/// `text/event-stream` 增量解码器
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// 输入一段字节，返回其中完整的事件
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(message) = self.finish() {
                    messages.push(message);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }

        messages
    }

    fn finish(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        let data = std::mem::take(&mut self.data);
        if event.is_none() && data.is_empty() {
            return None;
        }
        Some(SseMessage {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    }
}

#[derive(Deserialize)]
struct EventPayload {
    path: String,
    data: Value,
}

/// 将推送事件转换为树变更
///
/// `keep-alive` 与未知事件返回 `None`；`cancel` / `auth_revoked` 返回错误，
/// 调用方据此重连。
pub fn parse_sse_event(message: &SseMessage) -> Option<Result<TreeChange, ConfigError>> {
    match message.event.as_str() {
        "put" | "patch" => Some(parse_payload(message)),
        "keep-alive" => None,
        "cancel" => Some(Err(ConfigError::BackendIo(
            "Firebase取消了监听，请检查安全规则".to_string(),
        ))),
        "auth_revoked" => Some(Err(ConfigError::BackendIo(
            "Firebase认证令牌已失效".to_string(),
        ))),
        other => {
            warn!("忽略未知的Firebase事件: {}", other);
            None
        }
    }
}

fn parse_payload(message: &SseMessage) -> Result<TreeChange, ConfigError> {
    let payload: EventPayload = serde_json::from_str(&message.data)
        .map_err(|e| ConfigError::ParseError(format!("Firebase事件解析失败: {e}")))?;
    let path = ConfigPath::parse(&payload.path)?;

    if message.event == "put" {
        return Ok(TreeChange::Put {
            path,
            value: payload.data,
        });
    }

    match payload.data {
        Value::Object(children) => Ok(TreeChange::Patch { path, children }),
        other => Err(ConfigError::ParseError(format!(
            "Firebase patch 事件的数据不是对象: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: put\nda").is_empty());

        let messages = decoder.feed(b"ta: {\"path\":\"/\",\"data\":{}}\n\nevent: keep-alive\ndata: null\n\n");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].event, "put");
        assert_eq!(messages[0].data, r#"{"path":"/","data":{}}"#);
        assert_eq!(messages[1].event, "keep-alive");
    }

    #[test]
    fn test_parse_events() {
        let put = SseMessage {
            event: "put".to_string(),
            data: r#"{"path":"/observers/abc","data":{"type":"x"}}"#.to_string(),
        };
        assert_eq!(
            parse_sse_event(&put).unwrap().unwrap(),
            TreeChange::Put {
                path: ConfigPath::parse("observers/abc").unwrap(),
                value: json!({"type": "x"})
            }
        );

        let patch = SseMessage {
            event: "patch".to_string(),
            data: r#"{"path":"/observers","data":{"abc":null}}"#.to_string(),
        };
        assert!(matches!(
            parse_sse_event(&patch),
            Some(Ok(TreeChange::Patch { .. }))
        ));

        let keep_alive = SseMessage {
            event: "keep-alive".to_string(),
            data: "null".to_string(),
        };
        assert!(parse_sse_event(&keep_alive).is_none());

        let revoked = SseMessage {
            event: "auth_revoked".to_string(),
            data: "credential is no longer valid".to_string(),
        };
        assert!(matches!(
            parse_sse_event(&revoked),
            Some(Err(ConfigError::BackendIo(_)))
        ));
    }

    #[test]
    fn test_endpoint_layout() {
        let transport =
            FirebaseTransport::new("https://demo.firebaseio.com", "config", None).unwrap();

        let url = transport
            .endpoint(&ConfigPath::parse("updater.news").unwrap())
            .unwrap();
        assert_eq!(url.as_str(), "https://demo.firebaseio.com/config/updater/news.json");

        let root = transport.endpoint(&ConfigPath::root()).unwrap();
        assert_eq!(root.as_str(), "https://demo.firebaseio.com/config.json");
    }

    #[tokio::test]
    async fn test_fetch_and_store() {
        let mut server = mockito::Server::new_async().await;
        let get = server
            .mock("GET", "/config/observers.json")
            .match_query(Matcher::UrlEncoded("auth".into(), "secret".into()))
            .with_status(200)
            .with_body(r#"{"abc":{"type":"log"}}"#)
            .create_async()
            .await;
        let missing = server
            .mock("GET", "/config/missing.json")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("null")
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/config/observers/abc.json")
            .match_query(Matcher::Any)
            .match_body(Matcher::Json(json!({"type": "log"})))
            .with_status(200)
            .with_body(r#"{"type":"log"}"#)
            .create_async()
            .await;

        let transport =
            FirebaseTransport::new(&server.url(), "config", Some("secret".to_string())).unwrap();

        let value = transport
            .fetch(&ConfigPath::parse("observers").unwrap())
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"abc": {"type": "log"}})));

        let absent = transport
            .fetch(&ConfigPath::parse("missing").unwrap())
            .await
            .unwrap();
        assert_eq!(absent, None);

        transport
            .store(&ConfigPath::parse("observers/abc").unwrap(), json!({"type": "log"}))
            .await
            .unwrap();

        get.assert_async().await;
        missing.assert_async().await;
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_backend_io() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/config/a.json")
            .with_status(401)
            .with_body(r#"{"error":"Permission denied"}"#)
            .create_async()
            .await;

        let transport = FirebaseTransport::new(&server.url(), "config", None).unwrap();
        let result = transport.fetch(&ConfigPath::parse("a").unwrap()).await;
        assert!(matches!(result, Err(ConfigError::BackendIo(_))));
    }

    #[tokio::test]
    async fn test_watch_yields_snapshot() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/config.json")
            .match_header("accept", "text/event-stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "event: put\n",
                "data: {\"path\":\"/\",\"data\":{\"observers\":{}}}\n\n",
                "event: keep-alive\n",
                "data: null\n\n",
                "event: patch\n",
                "data: {\"path\":\"/observers\",\"data\":{\"abc\":{\"type\":\"log\"}}}\n\n",
            ))
            .create_async()
            .await;

        let transport = FirebaseTransport::new(&server.url(), "config", None).unwrap();
        let changes: Vec<_> = transport.watch().await.unwrap().collect().await;

        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0].as_ref().unwrap(),
            &TreeChange::Put {
                path: ConfigPath::root(),
                value: json!({"observers": {}})
            }
        );
        assert!(matches!(changes[1], Ok(TreeChange::Patch { .. })));
    }
}
