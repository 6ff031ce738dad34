//! 模拟活动集合
//!
//! 每个活动一个独立的 tokio 任务，各自随机间隔触发：
//! 睡眠 → 检查看门狗阶段 → 存活探测 → 执行动作 (带重试)。
//! 活动之间没有顺序保证，只共享 WatchdogState。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{ActivitiesConfig, ActivityConfig};
use crate::handle::{Action, SessionHandle};
use crate::humanizer::Humanizer;
use crate::retry::{retry_while_running, RetryPolicy};
use crate::timeutil::unix_millis;
use crate::watchdog::Watchdog;

/// 产生下一次动作; 返回 None 表示本轮不执行
pub type ActionSource = Arc<dyn Fn() -> Option<Action> + Send + Sync>;

/// 单个活动的计数器, 只由其自身循环写入
#[derive(Debug, Default)]
pub struct ActivityCounters {
    fired: AtomicU64,
    skipped: AtomicU64,
    failure_count: AtomicU64,
    consecutive_failures: AtomicU64,
    last_fired_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityStats {
    pub name: String,
    pub fired: u64,
    pub skipped: u64,
    pub failure_count: u64,
    pub consecutive_failures: u64,
    pub last_fired_ms: u64,
}

#[derive(Clone)]
pub struct ActivityDescriptor {
    pub name: String,
    pub min_interval: Duration,
    pub max_interval: Duration,
    action: ActionSource,
    counters: Arc<ActivityCounters>,
}

impl ActivityDescriptor {
    pub fn new(
        name: impl Into<String>,
        min_interval: Duration,
        max_interval: Duration,
        action: impl Fn() -> Option<Action> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            min_interval,
            max_interval,
            action: Arc::new(action),
            counters: Arc::new(ActivityCounters::default()),
        }
    }

    fn from_config(
        name: &str,
        cfg: &ActivityConfig,
        action: impl Fn() -> Option<Action> + Send + Sync + 'static,
    ) -> Option<Self> {
        cfg.enabled.then(|| {
            Self::new(
                name,
                Duration::from_millis(cfg.min_interval_ms),
                Duration::from_millis(cfg.max_interval_ms),
                action,
            )
        })
    }

    pub fn stats(&self) -> ActivityStats {
        let c = &self.counters;
        ActivityStats {
            name: self.name.clone(),
            fired: c.fired.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            failure_count: c.failure_count.load(Ordering::Relaxed),
            consecutive_failures: c.consecutive_failures.load(Ordering::Relaxed),
            last_fired_ms: c.last_fired_ms.load(Ordering::Relaxed),
        }
    }

    fn record_failure(&self) -> u64 {
        self.counters.failure_count.fetch_add(1, Ordering::Relaxed);
        self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_skip(&self) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_success(&self) {
        self.counters.fired.fetch_add(1, Ordering::Relaxed);
        self.counters.consecutive_failures.store(0, Ordering::Relaxed);
        self.counters.last_fired_ms.store(unix_millis(), Ordering::Relaxed);
    }
}

/// 默认活动: 指针漂移、滚动、空白点击、按键、心跳
pub fn default_descriptors(cfg: &ActivitiesConfig) -> Vec<ActivityDescriptor> {
    let h = Humanizer::new(cfg.viewport_width, cfg.viewport_height);
    let mut out = Vec::new();

    let (hd, chance) = (h.clone(), cfg.pointer_drift.chance);
    out.extend(ActivityDescriptor::from_config("pointer_drift", &cfg.pointer_drift, move || {
        hd.chance(chance).then(|| hd.pointer_drift())
    }));

    let (hd, chance) = (h.clone(), cfg.scroll.chance);
    out.extend(ActivityDescriptor::from_config("scroll", &cfg.scroll, move || {
        hd.chance(chance).then(|| hd.scroll())
    }));

    let (hd, chance) = (h.clone(), cfg.idle_click.chance);
    out.extend(ActivityDescriptor::from_config("idle_click", &cfg.idle_click, move || {
        hd.chance(chance).then(|| hd.idle_click())
    }));

    let (hd, chance, key) = (h.clone(), cfg.key_press.chance, cfg.key.clone());
    out.extend(ActivityDescriptor::from_config("key_press", &cfg.key_press, move || {
        hd.chance(chance).then(|| hd.key_press(&key))
    }));

    let (hd, chance) = (h, cfg.heartbeat.chance);
    out.extend(ActivityDescriptor::from_config("heartbeat", &cfg.heartbeat, move || {
        hd.chance(chance).then_some(Action::Heartbeat)
    }));

    out
}

// =====================================================================
// ActivitySet
// =====================================================================

pub struct ActivitySet {
    descriptors: Vec<ActivityDescriptor>,
    watchdog: Arc<Watchdog>,
    retry: RetryPolicy,
    humanizer: Humanizer,
    /// 丢弃集合时未退出的任务随之中止
    tasks: Mutex<JoinSet<()>>,
}

impl ActivitySet {
    pub fn new(descriptors: Vec<ActivityDescriptor>, watchdog: Arc<Watchdog>, retry: RetryPolicy) -> Self {
        Self {
            descriptors,
            watchdog,
            retry,
            humanizer: Humanizer::default(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// 为每个活动启动独立任务 (后台运行)
    pub fn spawn(&self, handle: Arc<dyn SessionHandle>) {
        let mut tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        for desc in &self.descriptors {
            let desc = desc.clone();
            let watchdog = self.watchdog.clone();
            let policy = self.retry.clone();
            let humanizer = self.humanizer.clone();
            let handle = handle.clone();
            tasks.spawn(async move {
                run_activity(desc, watchdog, policy, humanizer, handle).await;
            });
        }
        info!("🎭 已启动 {} 个模拟活动", self.descriptors.len());
    }

    /// 暂停全部活动 (幂等)
    pub fn pause_all(&self) -> bool {
        self.watchdog.state().pause_all()
    }

    pub fn resume_all(&self) -> bool {
        self.watchdog.state().resume_all()
    }

    /// 标记停止并等待所有循环自然退出
    pub async fn shutdown(&self) {
        self.watchdog.state().stop();
        let mut tasks = match self.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let count = tasks.len();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                warn!("🎭 活动任务异常退出: {e}");
            }
        }
        info!("🎭 {count} 个模拟活动已全部退出");
    }

    pub fn stats(&self) -> Vec<ActivityStats> {
        self.descriptors.iter().map(ActivityDescriptor::stats).collect()
    }
}

async fn run_activity(
    desc: ActivityDescriptor,
    watchdog: Arc<Watchdog>,
    policy: RetryPolicy,
    humanizer: Humanizer,
    handle: Arc<dyn SessionHandle>,
) {
    let state = watchdog.state().clone();
    debug!("🎭 [{}] 循环启动", desc.name);

    loop {
        let wait = humanizer.interval(desc.min_interval, desc.max_interval);
        if !state.sleep_or_stop(wait).await {
            break;
        }
        if !state.is_active() {
            desc.record_skip();
            continue;
        }
        if !watchdog.probe_liveness(handle.as_ref()).await {
            let n = desc.record_failure();
            debug!("🎭 [{}] 句柄不可用, 跳过 (连续 {n} 次)", desc.name);
            continue;
        }
        let Some(action) = (desc.action)() else {
            desc.record_skip();
            continue;
        };

        let (st, h, act) = (state.as_ref(), handle.as_ref(), &action);
        let outcome = retry_while_running(&policy, &desc.name, st, move || async move {
            // 探测期间可能已被暂停: 调用前最后一次检查
            if !st.is_active() {
                return Ok(false);
            }
            h.perform_action(act).await.map(|_| true)
        })
        .await;

        match outcome {
            Ok(true) => {
                desc.record_success();
                state.mark_activity();
                debug!("🎭 [{}] {}", desc.name, action.kind());
            }
            Ok(false) => desc.record_skip(),
            Err(e) => {
                let n = desc.record_failure();
                warn!("🎭 [{}] 执行失败 (连续 {n} 次): {e}", desc.name);
            }
        }
    }

    debug!("🎭 [{}] 循环退出", desc.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::testing::FakeHandle;
    use crate::watchdog::WatchdogState;
    use tokio::time::Instant;

    fn setup(descs: Vec<ActivityDescriptor>) -> (Arc<WatchdogState>, ActivitySet) {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let wd = Arc::new(Watchdog::new(state.clone(), Vec::new(), WatchdogConfig::default()));
        let policy = RetryPolicy { max_attempts: 2, initial_delay_ms: 100, multiplier: 1.0 };
        (state, ActivitySet::new(descs, wd, policy))
    }

    fn every_second(name: &str) -> ActivityDescriptor {
        ActivityDescriptor::new(name, Duration::from_millis(900), Duration::from_millis(1100), || {
            Some(Action::Heartbeat)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn no_actions_while_paused() {
        let (state, set) = setup(vec![every_second("a"), every_second("b"), every_second("c")]);
        let handle = Arc::new(FakeHandle::new());
        set.spawn(handle.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        set.pause_all();
        let paused_at = Instant::now();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let resumed_at = Instant::now();
        set.resume_all();
        tokio::time::sleep(Duration::from_secs(10)).await;
        set.shutdown().await;

        let times = handle.action_times();
        assert!(times.iter().any(|t| *t < paused_at));
        assert!(times.iter().any(|t| *t > resumed_at));
        assert!(
            times.iter().all(|t| *t <= paused_at || *t >= resumed_at),
            "活动在暂停期间触发"
        );
        assert!(set.stats().iter().all(|s| s.skipped > 0 && s.fired > 0));
        assert!(state.last_activity_ms() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_and_loop_continues() {
        let (_state, set) = setup(vec![every_second("flaky")]);
        let handle = Arc::new(FakeHandle::new());
        handle.fail_actions(true);
        set.spawn(handle.clone());

        tokio::time::sleep(Duration::from_secs(10)).await;
        let failing = set.stats()[0].clone();
        assert!(failing.failure_count >= 3);
        assert_eq!(failing.consecutive_failures, failing.failure_count);
        assert_eq!(failing.fired, 0);

        handle.fail_actions(false);
        tokio::time::sleep(Duration::from_secs(5)).await;
        set.shutdown().await;

        let s = set.stats()[0].clone();
        assert!(s.fired > 0);
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.failure_count >= failing.failure_count);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_handle_skips_and_counts() {
        let (_state, set) = setup(vec![every_second("a")]);
        let handle = Arc::new(FakeHandle::new());
        handle.set_alive(false);
        set.spawn(handle.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        set.shutdown().await;
        assert!(handle.actions().is_empty());
        assert!(set.stats()[0].failure_count >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_joins_promptly_even_with_long_intervals() {
        let slow = ActivityDescriptor::new("slow", Duration::from_secs(300), Duration::from_secs(600), || {
            Some(Action::Heartbeat)
        });
        let (state, set) = setup(vec![slow]);
        let handle = Arc::new(FakeHandle::new());
        set.spawn(handle.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = Instant::now();
        set.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(state.is_stopped());
        assert!(handle.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_does_not_wait_out_retry_backoff() {
        let state = Arc::new(WatchdogState::new());
        state.start();
        let wd = Arc::new(Watchdog::new(state.clone(), Vec::new(), WatchdogConfig::default()));
        let policy = RetryPolicy { max_attempts: 5, initial_delay_ms: 10_000, multiplier: 1.0 };
        let set = ActivitySet::new(vec![every_second("flaky")], wd, policy);
        let handle = Arc::new(FakeHandle::new());
        handle.fail_actions(true);
        set.spawn(handle.clone());

        // 第一次失败后进入 10s 退避
        tokio::time::sleep(Duration::from_secs(3)).await;
        let started = Instant::now();
        set.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(1200), "{:?}", started.elapsed());
        assert!(set.stats()[0].failure_count >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_set_aborts_its_loops() {
        let (state, set) = setup(vec![every_second("a")]);
        let handle = Arc::new(FakeHandle::new());
        set.spawn(handle.clone());
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(set);
        let before = handle.actions().len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(handle.actions().len(), before);
        assert!(state.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn declined_actions_count_as_skips() {
        let never = ActivityDescriptor::new("never", Duration::from_secs(1), Duration::from_secs(1), || None);
        let (_state, set) = setup(vec![never]);
        let handle = Arc::new(FakeHandle::new());
        set.spawn(handle.clone());
        tokio::time::sleep(Duration::from_millis(5500)).await;
        set.shutdown().await;
        let s = &set.stats()[0];
        assert!(s.skipped >= 4, "{s:?}");
        assert_eq!(s.fired, 0);
        assert!(handle.actions().is_empty());
    }

    #[test]
    fn default_set_respects_enabled_flags() {
        let mut cfg = ActivitiesConfig::default();
        assert_eq!(default_descriptors(&cfg).len(), 5);
        cfg.key_press.enabled = false;
        cfg.idle_click.enabled = false;
        let names: Vec<_> = default_descriptors(&cfg).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["pointer_drift", "scroll", "heartbeat"]);
    }
}
