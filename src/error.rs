//! 错误处理模块
//!
//! 定义应用程序的统一错误类型

use thiserror::Error;

/// Bot Framework 的主要错误类型
#[derive(Error, Debug)]
pub enum BotFrameworkError {
    /// 配置相关错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 观察者相关错误
    #[error("观察者错误: {0}")]
    Observer(#[from] ObserverError),

    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON序列化/反序列化错误
    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    /// 其他错误
    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

/// 配置存储错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 路径无法解析
    #[error("无效的配置路径: {0}")]
    InvalidPath(String),

    /// 数组操作作用于非数组值
    #[error("路径 {path} 上的值不是列表: {found}")]
    TypeMismatch { path: String, found: String },

    /// 后端读写失败（文件或网络）
    #[error("配置后端读写失败: {0}")]
    BackendIo(String),

    /// 配置内容解析错误
    #[error("配置文件解析失败: {0}")]
    ParseError(String),

    /// 配置文件不存在
    #[error("配置文件不存在: {path}")]
    FileNotFound { path: String },

    /// 环境变量替换错误
    #[error("环境变量替换失败: {var}")]
    EnvVarError { var: String },
}

/// 观察者错误类型
#[derive(Error, Debug)]
pub enum ObserverError {
    /// 观察者设置缺失或格式错误
    #[error("观察者设置无效: {0}")]
    Validation(String),

    /// 未注册的观察者类型
    #[error("未知的观察者类型: {0}")]
    UnknownType(String),

    /// 具体观察者构造失败，原样透传
    #[error(transparent)]
    Construction(anyhow::Error),

    /// 单个观察者分发失败
    #[error("观察者 {observer} 分发失败: {source}")]
    Dispatch {
        observer: String,
        #[source]
        source: anyhow::Error,
    },
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, BotFrameworkError>;
