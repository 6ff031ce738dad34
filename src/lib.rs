//! pacekeeper: 拟人化会话节奏与存活看门狗
//!
//! 模块:
//! - timeutil / retry / humanizer: 基础工具 (时间解析、抖动、重试、随机动作)
//! - planner: 名义时长 → 含暂停与回看的实际计划
//! - handle: 会话句柄抽象与空跑实现
//! - watchdog: 阶段状态机、存活探测、阻塞界面检测
//! - activity: 并发的模拟活动循环
//! - orchestrator: 单元调度与有序关闭
//! - api: HTTP 控制接口

pub mod activity;
pub mod api;
pub mod config;
pub mod error;
pub mod handle;
pub mod humanizer;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod retry;
pub mod timeutil;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use config::PacingConfig;
pub use error::{PacingError, Result};
pub use orchestrator::{SessionOrchestrator, WorkUnit};
