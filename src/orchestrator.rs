//! 会话编排
//!
//! SessionOrchestrator 持有一次会话的全部组件 (无全局单例):
//! 规划每个单元 → 逐段推进 → 活动集合与看门狗在后台并发运行 → 有序关闭。
//!
//! 关闭顺序: Stopped → 等待全部活动循环与看门狗退出 → close 句柄。

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::activity::{default_descriptors, ActivityDescriptor, ActivitySet, ActivityStats};
use crate::config::{PacingConfig, StudyPattern};
use crate::error::{PacingError, Result};
use crate::handle::{BlockingIndicator, HandleProvider, MarkerIndicator, SessionHandle};
use crate::humanizer::Humanizer;
use crate::planner::{check_pace_anomaly, plan_duration, DurationPlan};
use crate::progress::ProgressAccumulator;
use crate::retry::retry;
use crate::timeutil::{format_duration, human_duration, jitter, random_between};
use crate::watchdog::{Watchdog, WatchdogPhase, WatchdogState};

/// 段内测速前至少经过的时长, 避免开头短片段误报
const PACE_CHECK_AFTER: Duration = Duration::from_secs(60);

// =====================================================================
// 类型
// =====================================================================

/// 一个工作单元 (如一段视频)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    pub name: String,
    /// 所属分组 (如课程)，同组共享一份 StudyPattern
    pub group: Option<String>,
    pub nominal_ms: u64,
    /// 显式指定的模式, 否则按分组随机生成
    pub pattern: Option<StudyPattern>,
}

impl WorkUnit {
    pub fn new(id: impl Into<String>, nominal_ms: u64) -> Self {
        let id = id.into();
        Self { name: id.clone(), id, group: None, nominal_ms, pattern: None }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_pattern(mut self, pattern: StudyPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    fn group_key(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Completed,
    Abandoned,
    Interrupted,
}

/// 供 API 展示的会话状态
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub phase: WatchdogPhase,
    pub blocking_detected: bool,
    pub last_activity_ms: u64,
    pub activities: Vec<ActivityStats>,
}

// =====================================================================
// SessionOrchestrator
// =====================================================================

pub struct SessionOrchestrator {
    cfg: PacingConfig,
    state: Arc<WatchdogState>,
    progress: RwLock<ProgressAccumulator>,
    /// 分组 → 模式 (每组只生成一次)
    patterns: Mutex<HashMap<String, StudyPattern>>,
    activities: RwLock<Option<Arc<ActivitySet>>>,
    custom_activities: Option<Vec<ActivityDescriptor>>,
    indicators: Vec<Arc<dyn BlockingIndicator>>,
    humanizer: Humanizer,
    /// 会话收尾 (含取消后的后台收尾) 完成前保持 true
    running: Arc<AtomicBool>,
}

impl SessionOrchestrator {
    pub fn new(cfg: PacingConfig) -> Result<Self> {
        cfg.validate()?;
        let indicators = MarkerIndicator::from_config(&cfg.watchdog.markers);
        let humanizer = Humanizer::new(cfg.activities.viewport_width, cfg.activities.viewport_height);
        Ok(Self {
            cfg,
            state: Arc::new(WatchdogState::new()),
            progress: RwLock::new(ProgressAccumulator::default()),
            patterns: Mutex::new(HashMap::new()),
            activities: RwLock::new(None),
            custom_activities: None,
            indicators,
            humanizer,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 替换默认活动集合
    pub fn with_activities(mut self, descriptors: Vec<ActivityDescriptor>) -> Self {
        self.custom_activities = Some(descriptors);
        self
    }

    /// 替换配置中的阻塞标记
    pub fn with_indicators(mut self, indicators: Vec<Arc<dyn BlockingIndicator>>) -> Self {
        self.indicators = indicators;
        self
    }

    pub fn config(&self) -> &PacingConfig {
        &self.cfg
    }

    pub fn watchdog_state(&self) -> &Arc<WatchdogState> {
        &self.state
    }

    // =================================================================
    // 对外接口
    // =================================================================

    /// 通过 provider 获取句柄 (按重试策略)，随后运行会话
    pub async fn start_session_with(
        &self,
        provider: &dyn HandleProvider,
        units: &[WorkUnit],
    ) -> Result<ProgressAccumulator> {
        self.validate_units(units)?;
        let handle = retry(&self.cfg.retry, "acquire", || provider.acquire())
            .await
            .map_err(|e| PacingError::Acquire(e.to_string()))?;
        self.start_session(handle, units).await
    }

    /// 运行会话直到全部单元结束或被停止
    ///
    /// 初次存活探测失败视为获取失败 (致命)，此时不会启动任何后台任务。
    /// 若 future 被中途丢弃, 会话立即进入 Stopped, 收尾 (等待循环退出 → close)
    /// 转到后台完成, 收尾结束前新的会话会被拒绝。
    pub async fn start_session(
        &self,
        handle: Arc<dyn SessionHandle>,
        units: &[WorkUnit],
    ) -> Result<ProgressAccumulator> {
        self.validate_units(units)?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PacingError::AlreadyRunning);
        }
        let running = RunningGuard(self.running.clone());

        let watchdog = Arc::new(Watchdog::new(
            self.state.clone(),
            self.indicators.clone(),
            self.cfg.watchdog.clone(),
        ));
        if !watchdog.probe_liveness(handle.as_ref()).await {
            error!("❌ 会话句柄不可用, 放弃启动");
            return Err(PacingError::Acquire("初次存活探测失败".into()));
        }

        info!("🚀 会话启动: {} 个单元", units.len());
        self.state.start();

        let descriptors = self
            .custom_activities
            .clone()
            .unwrap_or_else(|| default_descriptors(&self.cfg.activities));
        let set = Arc::new(ActivitySet::new(descriptors, watchdog.clone(), self.cfg.retry.clone()));
        set.spawn(handle.clone());
        let watchdog_task = {
            let (watchdog, handle) = (watchdog.clone(), handle.clone());
            tokio::spawn(async move { watchdog.run(handle).await })
        };
        let session = SessionGuard(Some(SessionParts {
            state: self.state.clone(),
            activities: set.clone(),
            watchdog_task,
            handle: handle.clone(),
            _running: running,
        }));
        *self.activities.write().await = Some(set);

        self.drive_units(&watchdog, &handle, units).await;
        session.finish().await;

        let progress = self.get_progress().await;
        info!("🏁 会话结束: {}", progress.summary());
        Ok(progress)
    }

    /// 请求停止当前会话 (各循环在下一个边界退出)
    pub fn stop_session(&self) -> bool {
        let stopped = self.state.stop();
        if stopped {
            info!("⏹️ 收到停止请求");
        }
        stopped
    }

    pub fn pause_all(&self) -> bool {
        self.state.pause_all()
    }

    pub fn resume_all(&self) -> bool {
        self.state.resume_all()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 进度快照 (包含中途放弃前已完成的部分)
    pub async fn get_progress(&self) -> ProgressAccumulator {
        self.progress.read().await.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        let activities = match self.activities.read().await.as_ref() {
            Some(set) => set.stats(),
            None => Vec::new(),
        };
        SessionStatus {
            running: self.is_running(),
            phase: self.state.phase(),
            blocking_detected: self.state.blocking_detected(),
            last_activity_ms: self.state.last_activity_ms(),
            activities,
        }
    }

    // =================================================================
    // 内部
    // =================================================================

    fn validate_units(&self, units: &[WorkUnit]) -> Result<()> {
        let mut seen = HashSet::new();
        for unit in units {
            if unit.id.trim().is_empty() {
                return Err(PacingError::InvalidConfig("单元 ID 不能为空".into()));
            }
            if !seen.insert(unit.id.as_str()) {
                return Err(PacingError::InvalidConfig(format!("单元 ID 重复: {}", unit.id)));
            }
            if let Some(p) = &unit.pattern {
                p.validate()
                    .map_err(|e| PacingError::InvalidConfig(format!("单元 {}: {e}", unit.id)))?;
            }
        }
        Ok(())
    }

    async fn drive_units(&self, watchdog: &Watchdog, handle: &Arc<dyn SessionHandle>, units: &[WorkUnit]) {
        let session_started = Instant::now();
        let mut since_break = Instant::now();

        for (i, unit) in units.iter().enumerate() {
            if self.state.is_stopped() {
                break;
            }
            let pattern = self.pattern_for(unit).await;

            if self.cfg.session.enforce_daily_budget
                && session_started.elapsed() >= minutes(pattern.daily_max_minutes)
            {
                info!("📅 已达每日时长上限 ({} 分钟), 结束会话", pattern.daily_max_minutes);
                break;
            }

            match self.run_unit(unit, &pattern, watchdog, handle.as_ref()).await {
                UnitOutcome::Interrupted => break,
                UnitOutcome::Completed | UnitOutcome::Abandoned => {}
            }

            if i + 1 == units.len() {
                break;
            }

            let rest = if self.cfg.session.take_breaks
                && since_break.elapsed() >= minutes(pattern.session_max_minutes)
            {
                let rest = random_between(
                    minutes(pattern.break_min_minutes),
                    minutes(pattern.break_max_minutes),
                );
                info!("☕ 连续学习超过 {} 分钟, 休息 {}", pattern.session_max_minutes, human_duration(ms(rest)));
                since_break = Instant::now() + rest;
                rest
            } else {
                jitter(
                    Duration::from_millis(self.cfg.session.unit_gap_ms),
                    self.cfg.session.unit_gap_variance,
                )
            };
            if !self.state.sleep_or_stop(rest).await {
                break;
            }
        }
    }

    async fn pattern_for(&self, unit: &WorkUnit) -> StudyPattern {
        if let Some(p) = &unit.pattern {
            return p.clone();
        }
        let mut patterns = self.patterns.lock().await;
        patterns
            .entry(unit.group_key().to_string())
            .or_insert_with(|| {
                let p = StudyPattern::generate();
                debug!(
                    "🎲 分组 [{}] 模式: 速度 {:.2}, 专注 {:.2}",
                    unit.group_key(),
                    p.speed_factor,
                    p.focus_level
                );
                p
            })
            .clone()
    }

    async fn run_unit(
        &self,
        unit: &WorkUnit,
        pattern: &StudyPattern,
        watchdog: &Watchdog,
        handle: &dyn SessionHandle,
    ) -> UnitOutcome {
        let plan = plan_duration(unit.nominal_ms, pattern, &self.cfg.planner);
        info!(
            "📚 开始单元 [{}]: 名义 {} → 计划 {}",
            unit.name,
            format_duration(plan.original_ms),
            format_duration(plan.study_ms)
        );
        self.progress
            .write()
            .await
            .begin_unit(&unit.id, &unit.name, unit.group.as_deref(), plan.study_ms);

        let started = Instant::now();
        let outcome = self.play_segments(&plan, pattern, watchdog, handle, started).await;
        let elapsed = ms(started.elapsed());

        let mut progress = self.progress.write().await;
        match outcome {
            UnitOutcome::Completed => {
                progress.complete_unit(&unit.id, elapsed);
                if check_pace_anomaly(plan.original_ms, elapsed) {
                    warn!("⚠️ 单元 [{}] 速度异常: 名义 {} / 实际 {}", unit.name, format_duration(plan.original_ms), format_duration(elapsed));
                }
                info!("✅ 单元完成 [{}]: 用时 {}", unit.name, human_duration(elapsed));
            }
            UnitOutcome::Abandoned => {
                progress.abandon_unit(&unit.id, elapsed);
                warn!("⚠️ 会话句柄失效, 放弃单元 [{}] (已用 {})", unit.name, human_duration(elapsed));
            }
            UnitOutcome::Interrupted => {
                progress.interrupt_unit(&unit.id, elapsed);
                info!("⏹️ 单元 [{}] 被停止 (已用 {})", unit.name, human_duration(elapsed));
            }
        }
        outcome
    }

    async fn play_segments(
        &self,
        plan: &DurationPlan,
        pattern: &StudyPattern,
        watchdog: &Watchdog,
        handle: &dyn SessionHandle,
        started: Instant,
    ) -> UnitOutcome {
        let segments = plan.segments();
        let total = segments.len();

        for (idx, seg) in segments.iter().enumerate() {
            // 阻塞界面或手动暂停期间不推进
            if self.state.wait_until_runnable().await == WatchdogPhase::Stopped {
                return UnitOutcome::Interrupted;
            }
            if !watchdog.probe_liveness(handle).await {
                return UnitOutcome::Abandoned;
            }

            debug!(
                "📺 片段 {}/{}: {} - {} (播放 {}ms)",
                idx + 1,
                total,
                format_duration(seg.start_ms),
                format_duration(seg.end_ms),
                seg.play_ms
            );
            if !self.state.sleep_active(Duration::from_millis(seg.play_ms)).await {
                return UnitOutcome::Interrupted;
            }
            if seg.rewind_ms > 0 {
                debug!("⏪ 回看 {}ms", seg.rewind_ms);
                if !self.state.sleep_active(Duration::from_millis(seg.rewind_ms)).await {
                    return UnitOutcome::Interrupted;
                }
            }
            if self.humanizer.chance(1.0 - pattern.focus_level) {
                let think = random_between(
                    Duration::from_millis(self.cfg.session.think_pause_min_ms),
                    Duration::from_millis(self.cfg.session.think_pause_max_ms),
                );
                debug!("🤔 停顿思考 {}ms", think.as_millis());
                if !self.state.sleep_active(think).await {
                    return UnitOutcome::Interrupted;
                }
            }
            if seg.pause_after_ms > 0 {
                debug!("⏸️ 暂停 {}ms", seg.pause_after_ms);
                if !self.state.sleep_active(Duration::from_millis(seg.pause_after_ms)).await {
                    return UnitOutcome::Interrupted;
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= PACE_CHECK_AFTER && check_pace_anomaly(seg.end_ms, ms(elapsed)) {
                warn!(
                    "⚠️ 学习速度异常: 进度 {} / 耗时 {}",
                    format_duration(seg.end_ms),
                    format_duration(ms(elapsed))
                );
            }
            if plan.original_ms > 0 {
                debug!("📊 进度 {:.1}%", seg.end_ms as f64 * 100.0 / plan.original_ms as f64);
            }
        }
        // 最后一段期间句柄失效同样算放弃
        if !watchdog.probe_liveness(handle).await {
            return UnitOutcome::Abandoned;
        }
        UnitOutcome::Completed
    }
}

/// 会话结束 (含提前返回) 时复位 running 标记
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 一次会话的后台部件
struct SessionParts {
    state: Arc<WatchdogState>,
    activities: Arc<ActivitySet>,
    watchdog_task: JoinHandle<()>,
    handle: Arc<dyn SessionHandle>,
    _running: RunningGuard,
}

impl SessionParts {
    /// 停止 → 等待全部循环退出 → close; running 标记最后复位
    async fn teardown(self) {
        self.activities.shutdown().await;
        if let Err(e) = self.watchdog_task.await {
            warn!("🐕 看门狗任务异常退出: {e}");
        }
        if let Err(e) = self.handle.close().await {
            warn!("🔒 关闭会话句柄失败: {e}");
        }
    }
}

/// 正常结束时由 `finish` 收尾; 被丢弃时先 Stopped 再把收尾交给后台任务
struct SessionGuard(Option<SessionParts>);

impl SessionGuard {
    async fn finish(mut self) {
        if let Some(parts) = self.0.take() {
            parts.teardown().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(parts) = self.0.take() else { return };
        warn!("⚠️ 会话被取消, 停止并在后台收尾");
        parts.state.stop();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(parts.teardown());
            }
            Err(_) => warn!("⚠️ 运行时已关闭, 无法关闭会话句柄"),
        }
    }
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m.saturating_mul(60))
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
