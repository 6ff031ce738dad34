//! 时长规划
//!
//! 给定名义时长 (如一段视频) 和 StudyPattern，生成拟人化的观看计划:
//! 暂停点、回看点、总耗时，并切分为编排器逐段推进的片段。

use rand::Rng;
use serde::Serialize;
use tracing::debug;

use crate::config::{PlannerConfig, StudyPattern};
use crate::timeutil::format_duration;

/// 速度比正常范围
const PACE_MIN: f64 = 0.5;
const PACE_MAX: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PausePoint {
    /// 在名义时间轴上的位置
    pub position_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RewindPoint {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl RewindPoint {
    pub fn span_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// 一个单元的观看计划
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationPlan {
    pub original_ms: u64,
    pub study_ms: u64,
    pub speed_factor: f64,
    /// 按 position 升序
    pub pause_points: Vec<PausePoint>,
    pub rewind_points: Vec<RewindPoint>,
    /// 回看额外时长 (= Σ回看跨度 × 权重)
    pub rewind_extra_ms: u64,
}

/// 编排器推进的一个片段: 播放 [start, end) → 回看额外时长 → 暂停
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub play_ms: u64,
    pub rewind_ms: u64,
    pub pause_after_ms: u64,
}

impl Segment {
    pub fn total_ms(&self) -> u64 {
        self.play_ms + self.rewind_ms + self.pause_after_ms
    }
}

/// 使用线程随机数生成计划
pub fn plan_duration(nominal_ms: u64, pattern: &StudyPattern, cfg: &PlannerConfig) -> DurationPlan {
    plan_duration_with(&mut rand::thread_rng(), nominal_ms, pattern, cfg)
}

pub fn plan_duration_with<R: Rng + ?Sized>(
    rng: &mut R,
    nominal_ms: u64,
    pattern: &StudyPattern,
    cfg: &PlannerConfig,
) -> DurationPlan {
    if nominal_ms == 0 {
        return DurationPlan {
            original_ms: 0,
            study_ms: 0,
            speed_factor: pattern.speed_factor,
            pause_points: Vec::new(),
            rewind_points: Vec::new(),
            rewind_extra_ms: 0,
        };
    }

    let base_ms = scaled(nominal_ms, pattern.speed_factor);

    // 暂停: 每 pause_every 一次 + 0..=extra 次随机
    let pause_count = (nominal_ms / cfg.pause_every_ms.max(1)) as usize
        + rng.gen_range(0..=cfg.pause_extra_max) as usize;
    let mut pause_points: Vec<PausePoint> = (0..pause_count)
        .map(|_| PausePoint {
            position_ms: rng.gen_range(0..nominal_ms),
            duration_ms: rng.gen_range(cfg.pause_min_ms..=cfg.pause_max_ms),
        })
        .collect();
    pause_points.sort_by_key(|p| p.position_ms);

    // 回看: 短单元少回看
    let max_rewinds = if nominal_ms < cfg.short_unit_ms {
        0
    } else if nominal_ms < cfg.medium_unit_ms {
        cfg.rewind_max_count.min(1)
    } else {
        cfg.rewind_max_count
    };
    let rewind_count = rng.gen_range(0..=max_rewinds);
    let window = ((nominal_ms as f64) * cfg.rewind_window) as u64;
    let mut rewind_points: Vec<RewindPoint> = (0..rewind_count)
        .map(|_| {
            let start_ms = if window == 0 { 0 } else { rng.gen_range(0..window) };
            let span = rng.gen_range(cfg.rewind_min_ms..=cfg.rewind_max_ms);
            RewindPoint { start_ms, end_ms: (start_ms + span).min(nominal_ms) }
        })
        .collect();
    rewind_points.sort_by_key(|r| r.start_ms);

    let pause_total: u64 = pause_points.iter().map(|p| p.duration_ms).sum();
    let rewind_span: u64 = rewind_points.iter().map(RewindPoint::span_ms).sum();
    let rewind_extra_ms = scaled(rewind_span, cfg.rewind_weight);
    let study_ms = base_ms + pause_total + rewind_extra_ms;

    debug!(
        "⏱️ 名义时长 {} → 计划时长 {} (暂停 {} 次, 回看 {} 次)",
        format_duration(nominal_ms),
        format_duration(study_ms),
        pause_points.len(),
        rewind_points.len()
    );

    DurationPlan {
        original_ms: nominal_ms,
        study_ms,
        speed_factor: pattern.speed_factor,
        pause_points,
        rewind_points,
        rewind_extra_ms,
    }
}

/// 完成进度 / 实际耗时 落在 [0.5, 2.0] 之外即为异常 (边界值正常)
pub fn check_pace_anomaly(completed_ms: u64, elapsed_ms: u64) -> bool {
    if elapsed_ms == 0 {
        return completed_ms > 0;
    }
    let speed = completed_ms as f64 / elapsed_ms as f64;
    !(PACE_MIN..=PACE_MAX).contains(&speed)
}

impl DurationPlan {
    /// 按暂停点切分为片段
    ///
    /// 各片段 play 之和等于 round(名义 × 速度)，最后一段吸收舍入误差；
    /// 回看额外时长挂在回看起点所在片段上。Σ片段总时长 == study_ms。
    pub fn segments(&self) -> Vec<Segment> {
        if self.original_ms == 0 {
            return Vec::new();
        }

        // 切分边界
        let mut bounds: Vec<(u64, u64)> = Vec::new(); // (end, pause_after)
        for p in &self.pause_points {
            match bounds.last_mut() {
                Some((end, pause)) if *end == p.position_ms => *pause += p.duration_ms,
                _ => bounds.push((p.position_ms, p.duration_ms)),
            }
        }
        if bounds.last().map(|(end, _)| *end) != Some(self.original_ms) {
            bounds.push((self.original_ms, 0));
        }

        let base_total = scaled(self.original_ms, self.speed_factor);
        let mut segments = Vec::with_capacity(bounds.len());
        let mut start = 0u64;
        let mut played = 0u64;
        for (i, (end, pause_after_ms)) in bounds.iter().copied().enumerate() {
            let play_ms = if i + 1 == bounds.len() {
                base_total.saturating_sub(played)
            } else {
                scaled(end - start, self.speed_factor)
                    .min(base_total.saturating_sub(played))
            };
            played += play_ms;
            segments.push(Segment { start_ms: start, end_ms: end, play_ms, rewind_ms: 0, pause_after_ms });
            start = end;
        }

        // 回看额外时长: 按跨度比例分配, 最后一个回看吸收余数
        let total_span: u64 = self.rewind_points.iter().map(RewindPoint::span_ms).sum();
        if total_span > 0 && self.rewind_extra_ms > 0 {
            let mut assigned = 0u64;
            for (i, r) in self.rewind_points.iter().enumerate() {
                let share = if i + 1 == self.rewind_points.len() {
                    self.rewind_extra_ms - assigned
                } else {
                    (self.rewind_extra_ms as u128 * r.span_ms() as u128 / total_span as u128) as u64
                };
                assigned += share;
                let idx = segments
                    .iter()
                    .position(|s| r.start_ms < s.end_ms)
                    .unwrap_or(segments.len() - 1);
                segments[idx].rewind_ms += share;
            }
        } else if self.rewind_extra_ms > 0 {
            if let Some(last) = segments.last_mut() {
                last.rewind_ms += self.rewind_extra_ms;
            }
        }

        segments
    }
}

fn scaled(ms: u64, factor: f64) -> u64 {
    ((ms as f64) * factor).round().max(0.0) as u64
}
