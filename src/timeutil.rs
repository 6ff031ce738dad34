//! 时间工具
//!
//! 抖动延迟、随机区间，以及对外部页面上读到的时长字符串的宽松解析。

use rand::Rng;
use std::time::Duration;

/// 计算 base × (1 ± variance) 的抖动时长，结果不会为负
pub fn jitter(base: Duration, variance: f64) -> Duration {
    let variance = variance.clamp(0.0, 1.0);
    if variance == 0.0 || base.is_zero() {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-variance..=variance);
    Duration::from_secs_f64((base.as_secs_f64() * factor).max(0.0))
}

/// 协作式抖动等待: 只挂起当前任务
pub async fn jittered_delay(base: Duration, variance: f64) -> Duration {
    let wait = jitter(base, variance);
    tokio::time::sleep(wait).await;
    wait
}

/// [min, max] 内均匀随机 (毫秒粒度)，区间颠倒时自动交换
pub fn random_between(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let lo_ms = lo.as_millis() as u64;
    let hi_ms = hi.as_millis() as u64;
    if lo_ms == hi_ms {
        return Duration::from_millis(lo_ms);
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo_ms..=hi_ms))
}

/// 解析时长字符串为毫秒
///
/// 支持 `HH:MM:SS` / `MM:SS` / `SS` / 纯数字，其余字符先被剔除。
/// 格式不完整时按数字组回退解析；没有任何数字返回 0，从不失败。
pub fn parse_duration(text: Option<&str>) -> u64 {
    let Some(text) = text else { return 0 };
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ':')
        .collect();

    let groups: Vec<u64> = cleaned
        .split(':')
        .filter(|g| !g.is_empty())
        .map(|g| g.parse::<u64>().unwrap_or(0))
        .collect();

    let secs = match groups.as_slice() {
        [] => 0,
        [s] => *s,
        [m, s] => m.saturating_mul(60).saturating_add(*s),
        [h, m, s, ..] => h
            .saturating_mul(3600)
            .saturating_add(m.saturating_mul(60))
            .saturating_add(*s),
    };
    secs.saturating_mul(1000)
}

/// 毫秒格式化为 `HH:MM:SS`，小时为 0 时输出 `MM:SS`
pub fn format_duration(ms: u64) -> String {
    let total = ms / 1000;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

/// 日志用的紧凑时长 (如 `1h02m03s`)
pub fn human_duration(ms: u64) -> String {
    let total = ms / 1000;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m{secs:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

/// 当前 Unix 时间戳 (ms)
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
