//! 统一重试 (指数退避)
//!
//! 所有调用外部会话句柄的组件共用这一套重试逻辑。

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::watchdog::WatchdogState;

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大尝试次数 (含首次)
    pub max_attempts: u32,
    /// 首次重试前的等待 (ms)
    pub initial_delay_ms: u64,
    /// 退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 2000,
            multiplier: 1.5,
        }
    }
}

impl RetryPolicy {
    /// 只尝试一次, 不重试
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次失败后 (从 1 开始) 的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let ms = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.max(0.0).round() as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts 必须 ≥ 1".into());
        }
        if !(self.multiplier >= 1.0) {
            return Err(format!("retry.multiplier 必须 ≥ 1.0, 实际: {}", self.multiplier));
        }
        Ok(())
    }
}

/// 按策略执行 `op`，全部失败时返回最后一次的错误
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, context: &str, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run(policy, context, None, op).await
}

/// 同 `retry`，但退避等待期间会话停止则立即放弃并返回最后一次的错误
pub async fn retry_while_running<T, E, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    state: &WatchdogState,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    run(policy, context, Some(state), op).await
}

async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    state: Option<&WatchdogState>,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    debug!("🔄 [{context}] 第 {attempt} 次尝试成功");
                }
                return Ok(v);
            }
            Err(e) if attempt < max => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "🔄 [{context}] 重试 ({attempt}/{max}), {}ms 后重试: {e}",
                    delay.as_millis()
                );
                let keep_going = match state {
                    Some(state) => state.sleep_or_stop(delay).await,
                    None => {
                        tokio::time::sleep(delay).await;
                        true
                    }
                };
                if !keep_going {
                    debug!("🔄 [{context}] 会话已停止, 放弃重试");
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => {
                warn!("❌ [{context}] {max} 次尝试后仍失败: {e}");
                return Err(e);
            }
        }
    }
}
