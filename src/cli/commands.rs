//! 命令处理实现
//!
//! 实现各个CLI子命令的具体逻辑

use crate::cli::args::{Args, Commands, OutputFormat};
use crate::config::{bootstrap, tree, ConfigStore};
use crate::framework::{Framework, OBSERVERS_PATH};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 命令执行trait
#[async_trait]
pub trait Command: Send + Sync {
    /// 执行命令
    async fn execute(&self, args: &Args) -> Result<()>;
}

fn config_dir(args: &Args) -> PathBuf {
    args.config_dir
        .clone()
        .unwrap_or_else(bootstrap::default_config_dir)
}

async fn build_framework(args: &Args) -> Result<Framework> {
    let config_dir = config_dir(args);
    info!("使用配置目录: {}", config_dir.display());

    Framework::builder()
        .with_builtin_observers()
        .config_folder_path(config_dir)
        .build()
        .await
        .context("构建框架失败")
}

/// 运行命令
pub struct RunCommand;

#[async_trait]
impl Command for RunCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let framework = build_framework(args).await?;
        framework.start().await.context("启动框架失败")?;

        info!("框架运行中，按 Ctrl-C 停止");
        tokio::signal::ctrl_c()
            .await
            .context("监听停止信号失败")?;

        info!("收到停止信号");
        framework.shutdown().await;
        Ok(())
    }
}

/// 广播命令
pub struct SendCommand;

impl SendCommand {
    /// 解析消息：合法的JSON按JSON发送，否则作为字符串
    fn parse_message(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    }
}

#[async_trait]
impl Command for SendCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Send {
            topic,
            message,
            wait,
        } = &args.command
        else {
            return Ok(());
        };

        let framework = build_framework(args).await?;
        if tokio::time::timeout(Duration::from_secs(*wait), framework.settled())
            .await
            .is_err()
        {
            warn!("等待配置同步超时（{}秒），使用当前已注册的观察者", wait);
        }

        let summary = framework.send(topic, Self::parse_message(message)).await;
        println!(
            "已发送到 {} 个观察者，失败 {} 个",
            summary.delivered, summary.failed
        );
        framework.shutdown().await;

        if summary.failed > 0 {
            anyhow::bail!("{} 个观察者发送失败", summary.failed);
        }
        Ok(())
    }
}

/// 观察者列表命令
pub struct ObserversCommand;

impl ObserversCommand {
    /// 从 `observers` 节点提取 `(键, 类型)` 列表
    fn entries(observers: Option<&Value>) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = observers
            .map(tree::children)
            .unwrap_or_default()
            .into_iter()
            .map(|(key, settings)| {
                let kind = settings
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("<缺少type>")
                    .to_string();
                (key, kind)
            })
            .collect();
        entries.sort();
        entries
    }
}

#[async_trait]
impl Command for ObserversCommand {
    async fn execute(&self, args: &Args) -> Result<()> {
        let Commands::Observers { format } = &args.command else {
            return Ok(());
        };

        let store: Arc<dyn ConfigStore> = bootstrap::open_store(&config_dir(args))
            .await
            .context("打开配置存储失败")?;
        let observers = store
            .get(OBSERVERS_PATH)
            .await
            .context("读取观察者配置失败")?;
        let entries = Self::entries(observers.as_ref());

        match format {
            OutputFormat::Json => {
                let list: Vec<Value> = entries
                    .iter()
                    .map(|(key, kind)| json!({"key": key, "type": kind}))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            }
            OutputFormat::Text => {
                if entries.is_empty() {
                    println!("没有配置观察者");
                }
                for (key, kind) in &entries {
                    println!("{:<24} {}", key, kind);
                }
            }
        }
        Ok(())
    }
}
