//! 更新器调度器
//!
//! 状态机：`Idle → Pending → RunningIdle | Periodic`
//!
//! - `init` 在启动延迟后进入运行状态：周期大于 1 时进入 `Periodic`，
//!   否则执行一次后停在 `RunningIdle`；
//! - `Periodic` 中修改周期时，已排定的周期按原节奏完成，
//!   下一次触发后才按新周期重新排定；
//! - 新周期不大于 1 时在本次触发后回到 `RunningIdle`；
//! - `RunningIdle` 中把周期设为大于 1 会立即触发并进入 `Periodic`。

use crate::updater::Updater;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// 调度阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// 尚未初始化
    Idle,
    /// 等待启动延迟
    Pending,
    /// 已运行，没有周期
    RunningIdle,
    /// 周期执行中
    Periodic,
}

impl SchedulerPhase {
    /// 启动延迟是否已经结束
    pub fn is_running(&self) -> bool {
        matches!(self, SchedulerPhase::RunningIdle | SchedulerPhase::Periodic)
    }
}

struct SchedulerState {
    phase: SchedulerPhase,
    /// 当前周期（毫秒）
    interval: i64,
    /// 启动延迟（毫秒）
    start_time: i64,
    init_task: Option<JoinHandle<()>>,
    periodic_task: Option<JoinHandle<()>>,
    /// `RunningIdle` 下的单次执行
    fire_task: Option<JoinHandle<()>>,
}

struct Inner {
    updater: Arc<dyn Updater>,
    state: Mutex<SchedulerState>,
}

/// 更新器调度器
///
/// 克隆得到的句柄共享同一状态。
#[derive(Clone)]
pub struct UpdaterScheduler {
    inner: Arc<Inner>,
}

fn has_interval(interval: i64) -> bool {
    interval > 1
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0).unsigned_abs())
}

impl UpdaterScheduler {
    /// 创建调度器，周期与启动延迟取更新器的默认值
    pub fn new(updater: Arc<dyn Updater>) -> Self {
        let state = SchedulerState {
            phase: SchedulerPhase::Idle,
            interval: updater.default_interval(),
            start_time: updater.default_start_time(),
            init_task: None,
            periodic_task: None,
            fire_task: None,
        };

        Self {
            inner: Arc::new(Inner {
                updater,
                state: Mutex::new(state),
            }),
        }
    }

    /// 更新器标识
    pub fn id(&self) -> &str {
        self.inner.updater.id()
    }

    /// 更新器
    pub fn updater(&self) -> &Arc<dyn Updater> {
        &self.inner.updater
    }

    /// 当前阶段
    pub fn phase(&self) -> SchedulerPhase {
        self.inner.lock().phase
    }

    /// 启动延迟是否已经结束
    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    /// 当前周期（毫秒）
    pub fn interval(&self) -> i64 {
        self.inner.lock().interval
    }

    /// 周期是否有效（大于 1）
    pub fn has_interval(&self) -> bool {
        has_interval(self.interval())
    }

    /// 启动延迟（毫秒）
    pub fn start_time(&self) -> i64 {
        self.inner.lock().start_time
    }

    /// 设置启动延迟，只影响之后的 `init`
    pub fn set_start_time(&self, start_time: i64) {
        self.inner.lock().start_time = start_time;
    }

    /// 安排一次延迟启动
    ///
    /// 延迟为负数时视为立即启动。重复调用会被忽略。
    pub fn init(&self) {
        let mut state = self.inner.lock();
        if state.phase != SchedulerPhase::Idle {
            warn!(updater = %self.id(), "更新器已初始化，忽略重复的init");
            return;
        }

        let delay = millis(state.start_time);
        state.phase = SchedulerPhase::Pending;
        debug!(updater = %self.id(), "更新器将在 {:?} 后启动", delay);

        let scheduler = self.clone();
        state.init_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("启动更新器: {}", scheduler.id());
            scheduler.start();
        }));
    }

    /// 进入运行状态
    ///
    /// 周期有效时进入 `Periodic` 并立即触发第一次，否则触发一次后停在 `RunningIdle`。
    /// 已在 `Periodic` 中时不做任何事，保证同一时刻最多一个周期任务。
    pub fn start(&self) {
        let mut state = self.inner.lock();
        match state.phase {
            SchedulerPhase::Periodic => {}
            _ if has_interval(state.interval) => {
                state.phase = SchedulerPhase::Periodic;
                state.periodic_task = Some(tokio::spawn(Inner::periodic(Arc::clone(&self.inner))));
            }
            _ => {
                state.phase = SchedulerPhase::RunningIdle;
                let inner = Arc::clone(&self.inner);
                state.fire_task = Some(tokio::spawn(async move { inner.fire().await }));
            }
        }
    }

    /// 修改周期，任何时刻都可以调用
    ///
    /// `RunningIdle` 中设为大于 1 的值会立即进入 `Periodic`；
    /// `Periodic` 中的修改在下一次触发时生效。
    pub fn set_interval(&self, interval: i64) {
        let mut state = self.inner.lock();
        let previous = state.interval;
        state.interval = interval;

        if state.phase == SchedulerPhase::RunningIdle && has_interval(interval) {
            info!(updater = %self.id(), "周期设为 {}ms，开始周期执行", interval);
            state.phase = SchedulerPhase::Periodic;
            state.periodic_task = Some(tokio::spawn(Inner::periodic(Arc::clone(&self.inner))));
        } else if previous != interval {
            debug!(updater = %self.id(), "周期由 {}ms 改为 {}ms", previous, interval);
        }
    }

    /// 停止调度，取消等待中的启动、单次执行与周期任务
    ///
    /// 正在执行的 `run` 会在下一个挂起点被取消。
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        for task in [
            state.init_task.take(),
            state.fire_task.take(),
            state.periodic_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
        state.phase = SchedulerPhase::Idle;
        debug!(updater = %self.id(), "更新器已停止");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 执行一次更新，失败与panic只记录日志
    async fn fire(&self) {
        let id = self.updater.id();
        match AssertUnwindSafe(self.updater.run()).catch_unwind().await {
            Ok(Ok(())) => debug!(updater = %id, "更新完成"),
            Ok(Err(e)) => report_failure(id, &e),
            Err(_) => error!(updater = %id, "更新任务发生panic"),
        }
    }

    /// 读取当前周期并决定下一步
    ///
    /// 返回 `None` 表示周期已失效，阶段已回到 `RunningIdle`。
    fn next_interval(&self, current: Option<i64>) -> Option<i64> {
        let mut state = self.lock();
        let live = state.interval;
        if current == Some(live) {
            return Some(live);
        }
        if has_interval(live) {
            return Some(live);
        }

        state.phase = SchedulerPhase::RunningIdle;
        state.periodic_task = None;
        debug!(updater = %self.updater.id(), "周期已失效，停止周期执行");
        None
    }

    async fn periodic(self: Arc<Self>) {
        let edge = Instant::now();
        self.fire().await;

        let Some(mut current) = self.next_interval(None) else {
            return;
        };
        let mut ticker = period_ticker(edge, current);

        loop {
            let tick = ticker.tick().await;
            self.fire().await;

            match self.next_interval(Some(current)) {
                None => return,
                Some(live) if live == current => {}
                Some(live) => {
                    debug!(updater = %self.updater.id(), "按新周期 {}ms 重新排定", live);
                    current = live;
                    ticker = period_ticker(tick, live);
                }
            }
        }
    }
}

/// 从 `edge` 起每 `period` 毫秒触发一次，第一次在 `edge + period`
fn period_ticker(edge: Instant, period: i64) -> Interval {
    let period = millis(period);
    let mut ticker = interval_at(edge + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// 记录更新失败，HTTP 错误单独标注
fn report_failure(id: &str, err: &anyhow::Error) {
    let is_http = err
        .chain()
        .any(|cause| cause.downcast_ref::<reqwest::Error>().is_some());
    if is_http {
        error!(updater = %id, "错误响应: {:#}", err);
    } else {
        error!(updater = %id, "更新时出错: {:#}", err);
    }
}
