//! 会话句柄能力接口
//!
//! 引擎不关心底层是浏览器页面还是别的交互界面，只依赖这里的固定方法集:
//! 存活探测、执行动作、检测标记、关闭。

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::MarkerConfig;

/// 模拟活动发给会话句柄的动作
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// 指针移动到 (x, y)，分 steps 步
    PointerMove { x: i32, y: i32, steps: u32 },
    /// 滚轮 (正数向下)
    Scroll { dy: i32 },
    Click { x: i32, y: i32 },
    KeyPress { key: String },
    /// 焦点/可见性等保活信号
    Heartbeat,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PointerMove { .. } => "pointer_move",
            Self::Scroll { .. } => "scroll",
            Self::Click { .. } => "click",
            Self::KeyPress { .. } => "key_press",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// 外部会话句柄
///
/// 随时可能失效 (关闭/崩溃/跳转)，调用方必须先探测或容忍失败。
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// 轻量存活探测 (如读取 readyState)
    async fn probe(&self) -> bool;

    async fn perform_action(&self, action: &Action) -> Result<()>;

    /// 界面上是否存在指定标记 (如选择器命中)
    async fn has_marker(&self, marker: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// 会话句柄的获取方
#[async_trait]
pub trait HandleProvider: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn SessionHandle>>;
}

/// 阻塞界面 (验证弹窗等) 的检测谓词
#[async_trait]
pub trait BlockingIndicator: Send + Sync {
    fn name(&self) -> &str;

    /// 出错视为不存在
    async fn detect(&self, handle: &dyn SessionHandle) -> bool;
}

/// 基于标记的阻塞检测: 名称 → `has_marker(marker)`
#[derive(Debug, Clone)]
pub struct MarkerIndicator {
    name: String,
    marker: String,
}

impl MarkerIndicator {
    pub fn new(name: impl Into<String>, marker: impl Into<String>) -> Self {
        Self { name: name.into(), marker: marker.into() }
    }

    pub fn from_config(markers: &[MarkerConfig]) -> Vec<Arc<dyn BlockingIndicator>> {
        markers
            .iter()
            .map(|m| Arc::new(Self::new(&m.name, &m.marker)) as Arc<dyn BlockingIndicator>)
            .collect()
    }
}

#[async_trait]
impl BlockingIndicator for MarkerIndicator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, handle: &dyn SessionHandle) -> bool {
        match handle.has_marker(&self.marker).await {
            Ok(found) => found,
            Err(e) => {
                debug!("标记检测失败 [{}]: {e}", self.name);
                false
            }
        }
    }
}

// =====================================================================
// DryRunHandle: 进程内句柄, 只记录动作
// =====================================================================

/// 空跑句柄: 不连接任何界面，动作写入日志
#[derive(Default)]
pub struct DryRunHandle {
    closed: AtomicBool,
    actions: AtomicU64,
}

impl DryRunHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action_count(&self) -> u64 {
        self.actions.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl SessionHandle for DryRunHandle {
    async fn probe(&self) -> bool {
        !self.is_closed()
    }

    async fn perform_action(&self, action: &Action) -> Result<()> {
        anyhow::ensure!(!self.is_closed(), "句柄已关闭");
        self.actions.fetch_add(1, Ordering::Relaxed);
        debug!("🎭 [dry-run] {action:?}");
        Ok(())
    }

    async fn has_marker(&self, _marker: &str) -> Result<bool> {
        Ok(false)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        info!("🔒 [dry-run] 句柄已关闭 (共 {} 个动作)", self.action_count());
        Ok(())
    }
}

/// 每次获取都返回新的空跑句柄
pub struct DryRunProvider;

#[async_trait]
impl HandleProvider for DryRunProvider {
    async fn acquire(&self) -> Result<Arc<dyn SessionHandle>> {
        Ok(Arc::new(DryRunHandle::new()))
    }
}
