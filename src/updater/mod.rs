//! 更新器模块
//!
//! 提供延迟启动、运行期间可调整周期的后台任务调度

pub mod scheduler;

use anyhow::Result;
use async_trait::async_trait;

pub use scheduler::{SchedulerPhase, UpdaterScheduler};

/// 更新器trait
///
/// 由应用实现具体工作；调度由 [`UpdaterScheduler`] 负责。
/// 配置中 `updater/<config_id>/startTime` 与 `updater/<config_id>/interval`
/// 会覆盖这里的默认值。
#[async_trait]
pub trait Updater: Send + Sync + 'static {
    /// 更新器标识，用于日志
    fn id(&self) -> &str;

    /// 配置子路径使用的标识，默认与 `id` 相同
    fn config_id(&self) -> &str {
        self.id()
    }

    /// 默认启动延迟（毫秒，相对框架启动时刻）
    fn default_start_time(&self) -> i64 {
        0
    }

    /// 默认周期（毫秒），不大于 1 表示不重复执行
    fn default_interval(&self) -> i64 {
        0
    }

    /// 执行一次更新
    ///
    /// 返回的错误只会被记录，不影响后续调度。
    async fn run(&self) -> Result<()>;
}
