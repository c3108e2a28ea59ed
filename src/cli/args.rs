//! 命令行参数定义
//!
//! 使用clap定义应用程序的命令行接口

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Bot Framework - 配置驱动的通知观察者框架
#[derive(Parser, Debug, Clone)]
#[command(
    name = "bot-framework",
    version = crate::VERSION,
    about = crate::APP_DESCRIPTION,
    long_about = None
)]
pub struct Args {
    /// 配置目录（包含 config.json）
    #[arg(
        short,
        long,
        value_name = "DIR",
        help = "配置目录（包含 config.json）",
        env = "BOT_FRAMEWORK_CONFIG_DIR"
    )]
    pub config_dir: Option<PathBuf>,

    /// 日志级别
    #[arg(
        short,
        long,
        value_enum,
        default_value = "info",
        help = "日志级别",
        env = "BOT_FRAMEWORK_LOG_LEVEL"
    )]
    pub log_level: LogLevel,

    /// 是否使用JSON格式日志
    #[arg(long, help = "使用JSON格式日志")]
    pub json_logs: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Commands,
}

/// 日志级别枚举
#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum LogLevel {
    /// 调试级别
    Debug,
    /// 信息级别
    Info,
    /// 警告级别
    Warn,
    /// 错误级别
    Error,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// 输出格式
#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum OutputFormat {
    /// 文本
    Text,
    /// JSON
    Json,
}

/// 子命令定义
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// 启动框架，注册配置中的观察者，直到收到 Ctrl-C
    Run,

    /// 向配置中的所有观察者广播一条消息
    Send {
        /// 消息主题
        topic: String,

        /// 消息内容，能解析为JSON时按JSON发送
        message: String,

        /// 等待观察者注册的最长时间（秒）
        #[arg(long, value_name = "SECONDS", default_value_t = 10)]
        wait: u64,
    },

    /// 列出配置中的观察者
    Observers {
        /// 输出格式
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}
