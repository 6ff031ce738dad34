//! 测试用会话句柄: 记录每次调用的时间点，可注入失败

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::handle::{Action, HandleProvider, SessionHandle};

#[derive(Default)]
pub struct FakeHandle {
    alive: AtomicBool,
    fail_actions: AtomicBool,
    fail_markers: AtomicBool,
    /// 探测时挂起 (模拟无响应)
    hang_probe: AtomicBool,
    markers: Mutex<HashMap<String, bool>>,
    actions: Mutex<Vec<(Instant, Action)>>,
    closed_at: Mutex<Option<Instant>>,
    close_calls: AtomicU32,
    post_close_actions: AtomicU32,
    probes: AtomicU32,
}

impl FakeHandle {
    pub fn new() -> Self {
        let h = Self::default();
        h.alive.store(true, Ordering::SeqCst);
        h
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }

    pub fn fail_markers(&self, fail: bool) {
        self.fail_markers.store(fail, Ordering::SeqCst);
    }

    pub fn hang_probe(&self, hang: bool) {
        self.hang_probe.store(hang, Ordering::SeqCst);
    }

    pub fn set_marker(&self, marker: &str, present: bool) {
        self.markers.lock().unwrap().insert(marker.to_string(), present);
    }

    pub fn actions(&self) -> Vec<(Instant, Action)> {
        self.actions.lock().unwrap().clone()
    }

    pub fn action_times(&self) -> Vec<Instant> {
        self.actions().into_iter().map(|(t, _)| t).collect()
    }

    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.lock().unwrap()
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// close 之后仍被调用的动作次数
    pub fn post_close_actions(&self) -> u32 {
        self.post_close_actions.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionHandle for FakeHandle {
    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.hang_probe.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.alive.load(Ordering::SeqCst) && self.closed_at().is_none()
    }

    async fn perform_action(&self, action: &Action) -> Result<()> {
        if self.closed_at().is_some() {
            self.post_close_actions.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("handle closed");
        }
        if self.fail_actions.load(Ordering::SeqCst) {
            anyhow::bail!("injected failure");
        }
        self.actions.lock().unwrap().push((Instant::now(), action.clone()));
        Ok(())
    }

    async fn has_marker(&self, marker: &str) -> Result<bool> {
        if self.fail_markers.load(Ordering::SeqCst) {
            anyhow::bail!("marker query failed");
        }
        Ok(self.markers.lock().unwrap().get(marker).copied().unwrap_or(false))
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut closed = self.closed_at.lock().unwrap();
        if closed.is_none() {
            *closed = Some(Instant::now());
        }
        Ok(())
    }
}

/// 前 `failures` 次获取失败, 之后返回同一个 FakeHandle
pub struct FakeProvider {
    pub handle: Arc<FakeHandle>,
    failures: AtomicU32,
    pub attempts: AtomicU32,
}

impl FakeProvider {
    pub fn new(handle: Arc<FakeHandle>, failures: u32) -> Self {
        Self { handle, failures: AtomicU32::new(failures), attempts: AtomicU32::new(0) }
    }
}

#[async_trait]
impl HandleProvider for FakeProvider {
    async fn acquire(&self) -> Result<Arc<dyn SessionHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("browser not reachable");
        }
        Ok(self.handle.clone())
    }
}
