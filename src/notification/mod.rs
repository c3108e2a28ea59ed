//! 通知模块
//!
//! 提供观察者注册表、消息广播以及内置的 Discord、飞书与日志观察者

pub mod discord;
pub mod fanout;
pub mod feishu;
pub mod observer;
pub mod registry;
pub mod template;

// 重新导出主要类型
pub use discord::DiscordWebhook;
pub use fanout::{DispatchSummary, NotificationFanout};
pub use feishu::FeishuObserver;
pub use observer::{LogObserver, NotificationObserver, ObserverFactory};
pub use registry::ObserverRegistry;
pub use template::MessageTemplate;
