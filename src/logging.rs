//! 日志系统模块
//!
//! 安装全局 tracing 订阅者，并把 `log` 记录桥接到 tracing

use log::LevelFilter;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter, Layer};

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// 日志级别
    pub level: LevelFilter,
    /// 日志文件路径，`console` 为 false 时使用
    pub file_path: Option<PathBuf>,
    /// 是否输出到控制台
    pub console: bool,
    /// 是否使用JSON格式
    pub json_format: bool,
    /// 模块级别日志控制
    pub module_levels: HashMap<String, LevelFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Info,
            file_path: None,
            console: true,
            json_format: false,
            module_levels: HashMap::new(),
        }
    }
}

impl LogConfig {
    /// 以级别字符串创建配置，如 `debug`
    pub fn with_level(level: &str) -> anyhow::Result<Self> {
        let level = LevelFilter::from_str(level)
            .map_err(|_| anyhow::anyhow!("无效的日志级别: {}", level))?;
        Ok(Self {
            level,
            ..Self::default()
        })
    }
}

#[derive(Debug, Default)]
struct GlobalLoggingState {
    initialized: bool,
    current_config: Option<LogConfig>,
}

static GLOBAL_LOGGING_STATE: OnceLock<Mutex<GlobalLoggingState>> = OnceLock::new();

fn global_state() -> std::sync::MutexGuard<'static, GlobalLoggingState> {
    GLOBAL_LOGGING_STATE
        .get_or_init(|| Mutex::new(GlobalLoggingState::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// 日志系统
pub struct LoggingSystem;

impl LoggingSystem {
    /// 初始化日志系统
    ///
    /// 进程内只安装一次全局订阅者，重复调用直接返回成功。
    ///
    /// # 参数
    /// * `config` - 日志配置
    ///
    /// # 返回
    /// * `anyhow::Result<()>` - 初始化结果
    pub fn setup_logging(config: LogConfig) -> anyhow::Result<()> {
        let mut state = global_state();
        if state.initialized {
            return Ok(());
        }

        Self::init_log_tracer()?;
        Self::init_tracing_subscriber(&config)?;

        state.initialized = true;
        state.current_config = Some(config);
        Ok(())
    }

    /// 初始化 LogTracer（log crate 到 tracing 的桥接）
    fn init_log_tracer() -> anyhow::Result<()> {
        static LOG_TRACER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

        LOG_TRACER_INIT
            .get_or_init(|| tracing_log::LogTracer::init().map_err(|e| e.to_string()))
            .as_ref()
            .map_err(|e| anyhow::anyhow!("LogTracer初始化失败: {}", e))?;
        Ok(())
    }

    fn init_tracing_subscriber(config: &LogConfig) -> anyhow::Result<()> {
        let mut env_filter =
            EnvFilter::from_default_env().add_directive(Self::level_directive(config.level));
        for (module, level) in &config.module_levels {
            match format!("{}={}", module, level.as_str().to_lowercase()).parse::<Directive>() {
                Ok(directive) => env_filter = env_filter.add_directive(directive),
                Err(e) => eprintln!("忽略无效的模块日志级别 {}: {}", module, e),
            }
        }

        let fmt_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_timer(fmt::time::ChronoUtc::rfc_3339())
                .with_ansi(true)
                .with_target(true)
                .boxed()
        };

        let result = match (&config.file_path, config.console) {
            (Some(file_path), false) => {
                let file = std::fs::File::create(file_path)
                    .map_err(|e| anyhow::anyhow!("创建日志文件失败: {}", e))?;
                let file_layer = fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_timer(fmt::time::ChronoUtc::rfc_3339())
                    .with_ansi(false);
                registry().with(env_filter).with(file_layer).try_init()
            }
            _ => registry().with(env_filter).with(fmt_layer).try_init(),
        };

        match result {
            Ok(()) => {
                tracing::debug!("日志配置: {:?}", config);
                Ok(())
            }
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("already been set")
                    || error_msg.contains("already initialized")
                {
                    // 其他组件（如测试框架）已经安装了订阅者
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("tracing subscriber初始化失败: {}", error_msg))
                }
            }
        }
    }

    fn level_directive(level: LevelFilter) -> Directive {
        match level.to_level() {
            Some(log::Level::Error) => Directive::from(tracing::Level::ERROR),
            Some(log::Level::Warn) => Directive::from(tracing::Level::WARN),
            Some(log::Level::Info) => Directive::from(tracing::Level::INFO),
            Some(log::Level::Debug) => Directive::from(tracing::Level::DEBUG),
            Some(log::Level::Trace) => Directive::from(tracing::Level::TRACE),
            None => Directive::from(tracing_subscriber::filter::LevelFilter::OFF),
        }
    }

    /// 是否已初始化
    pub fn is_initialized() -> bool {
        global_state().initialized
    }

    /// 当前日志配置
    pub fn current_config() -> Option<LogConfig> {
        global_state().current_config.clone()
    }

    /// 重置状态（仅用于测试）
    #[cfg(test)]
    pub fn reset_for_testing() {
        let mut state = global_state();
        state.initialized = false;
        state.current_config = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::NamedTempFile;

    #[test]
    fn test_with_level() {
        assert_eq!(LogConfig::with_level("debug").unwrap().level, LevelFilter::Debug);
        assert_eq!(LogConfig::with_level("WARN").unwrap().level, LevelFilter::Warn);
        assert!(LogConfig::with_level("loud").is_err());
    }

    #[test]
    #[serial]
    fn test_single_initialization() {
        LoggingSystem::reset_for_testing();

        assert!(LoggingSystem::setup_logging(LogConfig::default()).is_ok());
        assert!(LoggingSystem::is_initialized());

        let mut second = LogConfig::default();
        second.json_format = true;
        assert!(LoggingSystem::setup_logging(second).is_ok());

        // 第二次调用不会替换已生效的配置
        assert!(!LoggingSystem::current_config().unwrap().json_format);
    }

    #[test]
    #[serial]
    fn test_file_output_and_module_levels() {
        LoggingSystem::reset_for_testing();

        let temp_file = NamedTempFile::new().unwrap();
        let mut config = LogConfig::default();
        config.console = false;
        config.file_path = Some(temp_file.path().to_path_buf());
        config
            .module_levels
            .insert("bot_framework::config".to_string(), LevelFilter::Debug);

        assert!(LoggingSystem::setup_logging(config).is_ok());
        assert!(LoggingSystem::current_config().is_some());
    }
}
