//! 拟人化引擎
//!
//! 为模拟活动生成符合自然人行为特征的动作参数与触发间隔。

use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::time::Duration;

use crate::handle::Action;

/// 拟人化参数引擎
#[derive(Debug, Clone)]
pub struct Humanizer {
    /// 视口尺寸 (px)
    width: i32,
    height: i32,

    /// 指针漂移时与边缘保持的距离
    margin: i32,

    /// 滚动幅度 (正态分布, px)
    scroll_mean: f64,
    scroll_std: f64,
}

impl Humanizer {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            margin: 100,
            scroll_mean: 0.0,
            scroll_std: 60.0,
        }
    }

    /// 指针漂移到视口内随机一点
    pub fn pointer_drift(&self) -> Action {
        let mut rng = rand::thread_rng();
        let (x, y) = self.point_in(&mut rng, self.margin);
        let (cx, cy) = (self.width / 2, self.height / 2);
        let steps = self.move_steps(x - cx, y - cy);
        Action::PointerMove { x, y, steps }
    }

    /// 上下滚动 (±100px 左右, 不为 0)
    pub fn scroll(&self) -> Action {
        let dy = self.sample(self.scroll_mean, self.scroll_std, -150.0, 150.0).round() as i32;
        Action::Scroll { dy: if dy == 0 { 1 } else { dy } }
    }

    /// 在视口中部区域空白处点击
    pub fn idle_click(&self) -> Action {
        let mut rng = rand::thread_rng();
        let x = self.width / 2 + rng.gen_range(-100..=100);
        let y = self.height / 2 + rng.gen_range(-100..=100);
        Action::Click { x: x.clamp(0, self.width - 1), y: y.clamp(0, self.height - 1) }
    }

    pub fn key_press(&self, key: &str) -> Action {
        Action::KeyPress { key: key.to_string() }
    }

    /// 以 `p` 的概率返回 true
    pub fn chance(&self, p: f64) -> bool {
        if p >= 1.0 {
            return true;
        }
        if p <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_bool(p)
    }

    /// 活动触发间隔: 以区间中点为均值的正态分布, 裁剪到 [min, max]
    pub fn interval(&self, min: Duration, max: Duration) -> Duration {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let lo_ms = lo.as_millis() as f64;
        let hi_ms = hi.as_millis() as f64;
        if hi_ms - lo_ms < 1.0 {
            return lo;
        }
        let mean = (lo_ms + hi_ms) / 2.0;
        let std = (hi_ms - lo_ms) / 6.0;
        Duration::from_millis(self.sample(mean, std, lo_ms, hi_ms).round() as u64)
    }

    /// 根据位移距离决定移动步数 (3-50)
    pub fn move_steps(&self, dx: i32, dy: i32) -> u32 {
        let distance = ((dx as f64).powi(2) + (dy as f64).powi(2)).sqrt();
        let base = (distance / 5.0).clamp(3.0, 50.0);
        let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
        (base * jitter).round().clamp(3.0, 50.0) as u32
    }

    fn point_in<R: Rng>(&self, rng: &mut R, margin: i32) -> (i32, i32) {
        let mx = margin.min(self.width / 4);
        let my = margin.min(self.height / 4);
        let x = rng.gen_range(mx..=(self.width - 1 - mx).max(mx));
        let y = rng.gen_range(my..=(self.height - 1 - my).max(my));
        (x, y)
    }

    /// 从正态分布采样并裁剪到范围内
    fn sample(&self, mean: f64, std: f64, min: f64, max: f64) -> f64 {
        let sample = match Normal::new(mean, std.max(f64::EPSILON)) {
            Ok(normal) => normal.sample(&mut rand::thread_rng()),
            Err(_) => mean,
        };
        sample.clamp(min, max)
    }
}

impl Default for Humanizer {
    fn default() -> Self {
        Self::new(1000, 800)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_stays_inside_viewport() {
        let h = Humanizer::new(1000, 800);
        for _ in 0..500 {
            match h.pointer_drift() {
                Action::PointerMove { x, y, steps } => {
                    assert!((100..=899).contains(&x), "x={x}");
                    assert!((100..=699).contains(&y), "y={y}");
                    assert!((3..=50).contains(&steps));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn tiny_viewport_does_not_panic() {
        let h = Humanizer::new(2, 2);
        for _ in 0..50 {
            let _ = h.pointer_drift();
            let _ = h.idle_click();
        }
    }

    #[test]
    fn scroll_is_bounded_and_nonzero() {
        let h = Humanizer::default();
        for _ in 0..500 {
            match h.scroll() {
                Action::Scroll { dy } => assert!(dy != 0 && (-150..=150).contains(&dy)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn interval_is_clamped() {
        let h = Humanizer::default();
        let (lo, hi) = (Duration::from_millis(15_000), Duration::from_millis(45_000));
        for _ in 0..1000 {
            let d = h.interval(lo, hi);
            assert!(d >= lo && d <= hi);
        }
        assert_eq!(h.interval(hi, hi), hi);
        let d = h.interval(hi, lo);
        assert!(d >= lo && d <= hi);
    }

    #[test]
    fn chance_extremes_are_deterministic() {
        let h = Humanizer::default();
        assert!((0..100).all(|_| h.chance(1.0)));
        assert!((0..100).all(|_| !h.chance(0.0)));
    }
}
