//! 启动配置
//!
//! 读取 `<配置目录>/config.json`，决定使用远程 Firebase 存储还是本地文件存储

use crate::config::firebase::FirebaseTransport;
use crate::config::local::LocalFileStore;
use crate::config::remote::RemoteHierarchicalStore;
use crate::config::store::ConfigStore;
use crate::error::ConfigError;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// 启动配置文件名
pub const BOOTSTRAP_FILE: &str = "config.json";

/// 启动配置
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BootstrapConfig {
    /// 是否使用 Firebase
    #[serde(default = "default_use_firebase")]
    pub use_firebase: bool,

    /// 服务账号文件名（相对配置目录）
    #[serde(default = "default_service_account")]
    pub firebase_service_account: String,

    /// 配置树在数据库中的根路径
    #[serde(default = "default_config_root")]
    pub firebase_config_path: String,

    /// 数据库地址，未设置时由服务账号的 `project_id` 推导
    #[serde(default)]
    pub firebase_database_url: Option<String>,

    /// 数据库令牌
    #[serde(default)]
    pub firebase_auth_token: Option<String>,
}

fn default_use_firebase() -> bool {
    true
}

fn default_service_account() -> String {
    "firebase_service_account.json".to_string()
}

fn default_config_root() -> String {
    "config".to_string()
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            use_firebase: default_use_firebase(),
            firebase_service_account: default_service_account(),
            firebase_config_path: default_config_root(),
            firebase_database_url: None,
            firebase_auth_token: None,
        }
    }
}

/// 服务账号文件中需要的字段
#[derive(Debug, Deserialize)]
struct ServiceAccount {
    project_id: String,
}

impl BootstrapConfig {
    /// 从配置目录加载启动配置
    ///
    /// 文件不存在时返回默认值（使用 Firebase）。
    ///
    /// # 参数
    /// * `config_dir` - 配置目录
    ///
    /// # 返回
    /// * `Result<Self, ConfigError>` - 启动配置或错误
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(BOOTSTRAP_FILE);
        if !path.exists() {
            info!(
                "未找到 {}，尝试使用 {} 从Firebase加载配置",
                path.display(),
                default_service_account()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::BackendIo(format!("读取文件失败 {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// 解析启动配置内容，先进行 `${VAR}` 环境变量替换
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let processed = substitute_env_vars(content)?;
        serde_json::from_str(&processed)
            .map_err(|e| ConfigError::ParseError(format!("JSON解析失败: {e}")))
    }

    /// 解析数据库地址
    ///
    /// 优先使用 `firebase_database_url`，否则读取服务账号文件的 `project_id`。
    pub fn database_url(&self, config_dir: &Path) -> Result<String, ConfigError> {
        if let Some(url) = &self.firebase_database_url {
            return Ok(url.clone());
        }

        let path = config_dir.join(&self.firebase_service_account);
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::BackendIo(format!("读取文件失败 {}: {e}", path.display())))?;
        let account: ServiceAccount = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("服务账号文件解析失败: {e}")))?;

        Ok(format!("https://{}.firebaseio.com", account.project_id))
    }
}

/// 替换 `${VAR}` 形式的环境变量，变量不存在时返回错误
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let env_var_regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::ParseError(format!("正则表达式错误: {e}")))?;

    let mut result = content.to_string();
    for captures in env_var_regex.captures_iter(content) {
        let full_match = &captures[0];
        let var_name = &captures[1];

        match std::env::var(var_name) {
            Ok(value) => result = result.replace(full_match, &value),
            Err(_) => {
                return Err(ConfigError::EnvVarError {
                    var: var_name.to_string(),
                })
            }
        }
    }

    Ok(result)
}

/// 默认配置目录
///
/// 当前目录存在 `config/` 时使用它，否则使用系统配置目录下的 `bot-framework/`。
pub fn default_config_dir() -> PathBuf {
    let local = PathBuf::from("config");
    if local.is_dir() {
        return local;
    }
    dirs::config_dir()
        .map(|dir| dir.join("bot-framework"))
        .unwrap_or(local)
}

/// 根据启动配置打开配置存储
///
/// 必须在 tokio 运行时内调用。
pub async fn open_store(config_dir: &Path) -> Result<Arc<dyn ConfigStore>, ConfigError> {
    let bootstrap = BootstrapConfig::load(config_dir)?;
    debug!("启动配置: {:?}", bootstrap);

    if bootstrap.use_firebase {
        let database_url = bootstrap.database_url(config_dir)?;
        info!(
            "从Firebase加载配置 ({}/{})",
            database_url, bootstrap.firebase_config_path
        );
        let transport = FirebaseTransport::new(
            &database_url,
            &bootstrap.firebase_config_path,
            bootstrap.firebase_auth_token.clone(),
        )?;
        Ok(Arc::new(RemoteHierarchicalStore::connect(transport)))
    } else {
        let path = config_dir.join(BOOTSTRAP_FILE);
        info!("从 {} 加载配置", path.display());
        Ok(Arc::new(LocalFileStore::open(path).await?))
    }
}
