//! 存活看门狗
//!
//! - WatchdogState: 会话内共享的阶段 (Idle/Active/Suspended/Stopped) + 心跳时间戳
//! - Watchdog: 存活探测、阻塞界面检测与全局暂停/恢复
//!
//! 阶段转换只经由 `WatchdogPhase::next` 这一个状态机函数，每次转换都写日志并留档。

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WatchdogConfig;
use crate::handle::{BlockingIndicator, SessionHandle};
use crate::timeutil::{human_duration, unix_millis};

/// 保留的转换记录条数
const TRANSITION_LOG_CAP: usize = 64;

// =====================================================================
// 状态机
// =====================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogPhase {
    /// 尚无会话
    Idle,
    Active,
    /// 暂停中 (阻塞界面或手动暂停)
    Suspended,
    /// 会话终止
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogEvent {
    Start,
    Pause,
    Resume,
    BlockingDetected,
    BlockingCleared,
    WaitTimedOut,
    Stop,
}

impl WatchdogPhase {
    /// 返回 None 表示该事件在当前阶段不引起转换
    pub fn next(self, event: WatchdogEvent) -> Option<Self> {
        use WatchdogEvent::*;
        use WatchdogPhase::*;
        match (self, event) {
            (Idle | Stopped, Start) => Some(Active),
            (Active, Pause | BlockingDetected) => Some(Suspended),
            (Suspended, Resume | BlockingCleared | WaitTimedOut) => Some(Active),
            (Active | Suspended, Stop) => Some(Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for WatchdogPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "空闲"),
            Self::Active => write!(f, "运行中"),
            Self::Suspended => write!(f, "已暂停"),
            Self::Stopped => write!(f, "已停止"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: WatchdogPhase,
    pub to: WatchdogPhase,
    pub event: WatchdogEvent,
    pub at_ms: u64,
}

// =====================================================================
// WatchdogState
// =====================================================================

/// 会话内共享状态
///
/// 阶段保存在 watch 通道里: 读取是快照，写入后写者胜；
/// 等待方可以订阅变化，停止时睡眠中的循环能及时醒来。
pub struct WatchdogState {
    phase: watch::Sender<WatchdogPhase>,
    blocking: AtomicBool,
    last_activity_ms: AtomicU64,
    transitions: Mutex<VecDeque<Transition>>,
}

impl WatchdogState {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(WatchdogPhase::Idle);
        Self {
            phase,
            blocking: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(0),
            transitions: Mutex::new(VecDeque::new()),
        }
    }

    /// 投递事件, 返回是否发生了转换
    pub fn apply(&self, event: WatchdogEvent) -> bool {
        let mut from = WatchdogPhase::Idle;
        let mut to = WatchdogPhase::Idle;
        let changed = self.phase.send_if_modified(|phase| match phase.next(event) {
            Some(next) => {
                from = *phase;
                to = next;
                *phase = next;
                true
            }
            None => false,
        });
        if changed {
            info!("🐕 阶段 {from} → {to} ({event:?})");
            if let Ok(mut log) = self.transitions.lock() {
                if log.len() == TRANSITION_LOG_CAP {
                    log.pop_front();
                }
                log.push_back(Transition { from, to, event, at_ms: unix_millis() });
            }
        } else {
            debug!("🐕 忽略事件 {event:?} (当前 {})", self.phase());
        }
        changed
    }

    pub fn phase(&self) -> WatchdogPhase {
        *self.phase.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.phase() == WatchdogPhase::Active
    }

    pub fn is_stopped(&self) -> bool {
        self.phase() == WatchdogPhase::Stopped
    }

    pub fn start(&self) -> bool {
        self.blocking.store(false, Ordering::SeqCst);
        self.apply(WatchdogEvent::Start)
    }

    /// 暂停全部活动 (幂等)
    pub fn pause_all(&self) -> bool {
        self.apply(WatchdogEvent::Pause)
    }

    /// 恢复全部活动 (幂等, 已停止时无效)
    pub fn resume_all(&self) -> bool {
        self.apply(WatchdogEvent::Resume)
    }

    /// 永久停止本次会话
    pub fn stop(&self) -> bool {
        self.apply(WatchdogEvent::Stop)
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchdogPhase> {
        self.phase.subscribe()
    }

    /// 记录心跳 (写者胜)
    pub fn mark_activity(&self) {
        self.last_activity_ms.store(unix_millis(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    pub fn blocking_detected(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    fn set_blocking(&self, value: bool) {
        self.blocking.store(value, Ordering::SeqCst);
    }

    pub fn transitions(&self) -> Vec<Transition> {
        self.transitions
            .lock()
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 睡眠 `d`，期间若进入 Stopped 则提前返回 false
    pub async fn sleep_or_stop(&self, d: Duration) -> bool {
        let mut rx = self.subscribe();
        if *rx.borrow() == WatchdogPhase::Stopped {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => !self.is_stopped(),
            _ = rx.wait_for(|p| *p == WatchdogPhase::Stopped) => false,
        }
    }

    /// 只在 Active 期间计时的睡眠: 暂停时冻结剩余时长, 恢复后继续
    ///
    /// 返回 false 表示期间进入了 Stopped。
    pub async fn sleep_active(&self, d: Duration) -> bool {
        let mut remaining = d;
        let mut rx = self.subscribe();
        loop {
            if self.wait_until_runnable().await == WatchdogPhase::Stopped {
                return false;
            }
            if remaining.is_zero() {
                return true;
            }
            let started = Instant::now();
            tokio::select! {
                _ = tokio::time::sleep(remaining) => return !self.is_stopped(),
                _ = rx.wait_for(|p| *p != WatchdogPhase::Active) => {
                    remaining = remaining.saturating_sub(started.elapsed());
                }
            }
        }
    }

    /// 等待进入 Active 或 Stopped, 返回到达的阶段
    pub async fn wait_until_runnable(&self) -> WatchdogPhase {
        let mut rx = self.subscribe();
        let result = rx
            .wait_for(|p| matches!(p, WatchdogPhase::Active | WatchdogPhase::Stopped))
            .await
            .map(|p| *p);
        result.unwrap_or(WatchdogPhase::Stopped)
    }
}

impl Default for WatchdogState {
    fn default() -> Self {
        Self::new()
    }
}

// =====================================================================
// Watchdog
// =====================================================================

pub struct Watchdog {
    state: Arc<WatchdogState>,
    indicators: Vec<Arc<dyn BlockingIndicator>>,
    cfg: WatchdogConfig,
}

impl Watchdog {
    pub fn new(
        state: Arc<WatchdogState>,
        indicators: Vec<Arc<dyn BlockingIndicator>>,
        cfg: WatchdogConfig,
    ) -> Self {
        Self { state, indicators, cfg }
    }

    pub fn state(&self) -> &Arc<WatchdogState> {
        &self.state
    }

    /// 存活探测: 超时或失败均返回 false, 从不报错
    pub async fn probe_liveness(&self, handle: &dyn SessionHandle) -> bool {
        let timeout = Duration::from_millis(self.cfg.probe_timeout_ms);
        match tokio::time::timeout(timeout, handle.probe()).await {
            Ok(alive) => {
                if !alive {
                    debug!("💀 会话句柄已失效");
                }
                alive
            }
            Err(_) => {
                warn!("💀 存活探测超时 ({}ms)", timeout.as_millis());
                false
            }
        }
    }

    /// 检测阻塞界面并处理: 暂停 → 等待消失或超时 → 恢复
    ///
    /// 返回是否检测到了阻塞条件。
    pub async fn detect_blocking_condition(&self, handle: &dyn SessionHandle) -> bool {
        let mut hit = None;
        for ind in &self.indicators {
            if ind.detect(handle).await {
                hit = Some(ind.clone());
                break;
            }
        }
        let Some(indicator) = hit else { return false };

        warn!("🚨 检测到阻塞界面 [{}], 暂停全部活动", indicator.name());
        self.state.set_blocking(true);
        let suspended_here = self.state.apply(WatchdogEvent::BlockingDetected);

        let started = Instant::now();
        let max_wait = Duration::from_millis(self.cfg.max_blocking_wait_ms);
        let poll = Duration::from_millis(self.cfg.poll_interval_ms);
        let outcome = loop {
            if !self.state.sleep_or_stop(poll).await {
                break None;
            }
            if !indicator.detect(handle).await {
                break Some(WatchdogEvent::BlockingCleared);
            }
            if started.elapsed() >= max_wait {
                break Some(WatchdogEvent::WaitTimedOut);
            }
        };

        match outcome {
            Some(WatchdogEvent::BlockingCleared) => {
                info!("✅ 阻塞界面 [{}] 已消失 (等待 {})", indicator.name(), human_duration(started.elapsed().as_millis() as u64));
            }
            Some(_) => {
                warn!("⏰ 阻塞界面 [{}] 等待超时, 强制恢复", indicator.name());
            }
            None => debug!("会话已停止, 结束阻塞等待"),
        }
        if let (Some(event), true) = (outcome, suspended_here) {
            self.state.apply(event);
        }
        self.state.set_blocking(false);
        true
    }

    /// 后台循环: 每隔 check_interval 检测一次，直到会话停止
    pub async fn run(&self, handle: Arc<dyn SessionHandle>) {
        info!("🐕 看门狗启动 ({} 个阻塞标记)", self.indicators.len());
        let interval = Duration::from_millis(self.cfg.check_interval_ms);
        while self.state.sleep_or_stop(interval).await {
            if self.state.is_active() {
                self.detect_blocking_condition(handle.as_ref()).await;
            }
        }
        info!("🐕 看门狗退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::MarkerIndicator;
    use crate::testing::FakeHandle;

    fn watchdog(state: Arc<WatchdogState>) -> Watchdog {
        let cfg = WatchdogConfig {
            markers: Vec::new(),
            ..WatchdogConfig::default()
        };
        Watchdog::new(state, vec![Arc::new(MarkerIndicator::new("verify", ".verify"))], cfg)
    }

    #[test]
    fn state_machine_transitions() {
        use WatchdogEvent::*;
        use WatchdogPhase::*;
        assert_eq!(Idle.next(Start), Some(Active));
        assert_eq!(Active.next(BlockingDetected), Some(Suspended));
        assert_eq!(Active.next(Pause), Some(Suspended));
        assert_eq!(Suspended.next(BlockingCleared), Some(Active));
        assert_eq!(Suspended.next(WaitTimedOut), Some(Active));
        assert_eq!(Suspended.next(Resume), Some(Active));
        assert_eq!(Active.next(Stop), Some(Stopped));
        assert_eq!(Suspended.next(Stop), Some(Stopped));
        // 终止态
        assert_eq!(Stopped.next(Resume), None);
        assert_eq!(Stopped.next(BlockingCleared), None);
        assert_eq!(Stopped.next(Pause), None);
        // 幂等
        assert_eq!(Active.next(Resume), None);
        assert_eq!(Suspended.next(Pause), None);
        assert_eq!(Idle.next(Stop), None);
    }

    #[test]
    fn pause_resume_are_idempotent_and_logged() {
        let s = WatchdogState::new();
        assert!(!s.is_active());
        assert!(s.start());
        assert!(s.pause_all());
        assert!(!s.pause_all());
        assert!(!s.is_active());
        assert!(s.resume_all());
        assert!(!s.resume_all());
        assert!(s.stop());
        assert!(!s.resume_all());
        assert!(s.is_stopped());
        let log: Vec<_> = s.transitions().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            log,
            vec![
                (WatchdogPhase::Idle, WatchdogPhase::Active),
                (WatchdogPhase::Active, WatchdogPhase::Suspended),
                (WatchdogPhase::Suspended, WatchdogPhase::Active),
                (WatchdogPhase::Active, WatchdogPhase::Stopped),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_times_out_instead_of_hanging() {
        let wd = watchdog(Arc::new(WatchdogState::new()));
        let h = FakeHandle::new();
        assert!(wd.probe_liveness(&h).await);
        h.hang_probe(true);
        assert!(!wd.probe_liveness(&h).await);
        h.hang_probe(false);
        h.set_alive(false);
        assert!(!wd.probe_liveness(&h).await);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_condition_suspends_until_cleared() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let wd = Arc::new(watchdog(state.clone()));
        let h = Arc::new(FakeHandle::new());
        assert!(!wd.detect_blocking_condition(h.as_ref()).await);

        h.set_marker(".verify", true);
        let task = {
            let (wd, h) = (wd.clone(), h.clone());
            tokio::spawn(async move { wd.detect_blocking_condition(h.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(state.phase(), WatchdogPhase::Suspended);
        assert!(state.blocking_detected());

        h.set_marker(".verify", false);
        assert!(task.await.unwrap());
        assert_eq!(state.phase(), WatchdogPhase::Active);
        assert!(!state.blocking_detected());
        let last = state.transitions().last().cloned().unwrap();
        assert_eq!(last.event, WatchdogEvent::BlockingCleared);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_wait_force_resumes_after_timeout() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let wd = watchdog(state.clone());
        let h = FakeHandle::new();
        h.set_marker(".verify", true);

        let started = Instant::now();
        assert!(wd.detect_blocking_condition(&h).await);
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert!(started.elapsed() < Duration::from_secs(310));
        assert_eq!(state.phase(), WatchdogPhase::Active);
        assert_eq!(state.transitions().last().unwrap().event, WatchdogEvent::WaitTimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_blocking_wait_stays_stopped() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let wd = Arc::new(watchdog(state.clone()));
        let h = Arc::new(FakeHandle::new());
        h.set_marker(".verify", true);
        let task = {
            let (wd, h) = (wd.clone(), h.clone());
            tokio::spawn(async move { wd.detect_blocking_condition(h.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        state.stop();
        assert!(task.await.unwrap());
        assert_eq!(state.phase(), WatchdogPhase::Stopped);
        assert!(!state.blocking_detected());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pause_is_not_undone_by_blocking_clear() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        state.pause_all();
        let wd = watchdog(state.clone());
        let h = Arc::new(FakeHandle::new());
        h.set_marker(".verify", true);
        let clear = {
            let h = h.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(7)).await;
                h.set_marker(".verify", false);
            })
        };
        assert!(wd.detect_blocking_condition(h.as_ref()).await);
        clear.await.unwrap();
        assert_eq!(state.phase(), WatchdogPhase::Suspended);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_exits_on_stop() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let wd = Arc::new(watchdog(state.clone()));
        let h: Arc<dyn SessionHandle> = Arc::new(FakeHandle::new());
        let task = {
            let wd = wd.clone();
            tokio::spawn(async move { wd.run(h).await })
        };
        tokio::time::sleep(Duration::from_secs(60)).await;
        state.stop();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_active_freezes_while_suspended() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let driver = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            driver.pause_all();
            tokio::time::sleep(Duration::from_secs(5)).await;
            driver.resume_all();
        });

        let started = Instant::now();
        assert!(state.sleep_active(Duration::from_secs(10)).await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(15) && waited < Duration::from_millis(15_100), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_active_returns_false_when_stopped_while_suspended() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        state.pause_all();
        let driver = state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            driver.stop();
        });
        let started = Instant::now();
        assert!(!state.sleep_active(Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
