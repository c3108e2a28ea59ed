//! Bot Framework - 配置驱动的通知观察者框架
//!
//! 这是一个用Rust编写的通知观察者框架，支持：
//! - 路径寻址的层级配置存储（Firebase 实时数据库或本地文件）
//! - 根据配置热更新的观察者注册表与消息广播
//! - 运行期间可调整周期的后台更新器
//! - 内置 Discord、飞书与日志观察者
//! - 结构化日志记录

pub mod cli;
pub mod config;
pub mod error;
pub mod framework;
pub mod logging;
pub mod notification;
pub mod updater;

// 重新导出主要类型
pub use config::{ConfigPath, ConfigStore, EventKind};
pub use error::{BotFrameworkError, ConfigError, ObserverError};
pub use framework::{Framework, FrameworkBuilder};
pub use notification::{DispatchSummary, NotificationObserver, ObserverFactory};
pub use updater::{Updater, UpdaterScheduler};

/// 应用程序版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 应用程序名称
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// 应用程序描述
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
