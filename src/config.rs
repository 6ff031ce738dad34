//! 配置
//!
//! 全部字段均有默认值，TOML 文件中只需写要覆盖的部分:
//!
//! ```toml
//! [planner]
//! rewind_weight = 0.2
//!
//! [watchdog]
//! max_blocking_wait_ms = 120000
//! markers = [{ name = "verify", marker = ".verify-code" }]
//!
//! [[units]]
//! id = "c1-s1"
//! group = "c1"
//! duration = "12:34"
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use crate::error::{PacingError, Result};
use crate::orchestrator::WorkUnit;
use crate::retry::RetryPolicy;
use crate::timeutil;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "pacekeeper.toml";
/// 配置文件路径环境变量
pub const CONFIG_ENV: &str = "PACEKEEPER_CONFIG";

// =====================================================================
// StudyPattern: 每个单元组 (课程) 一份, 创建后不可变
// =====================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyPattern {
    /// 速度系数 (名义时长的倍数)
    pub speed_factor: f64,
    /// 专注度 (越低越容易出现额外停顿)
    pub focus_level: f64,
    pub daily_min_minutes: u64,
    pub daily_max_minutes: u64,
    pub session_min_minutes: u64,
    pub session_max_minutes: u64,
    pub break_min_minutes: u64,
    pub break_max_minutes: u64,
}

impl Default for StudyPattern {
    fn default() -> Self {
        Self {
            speed_factor: 1.0,
            focus_level: 0.85,
            daily_min_minutes: 30,
            daily_max_minutes: 180,
            session_min_minutes: 15,
            session_max_minutes: 60,
            break_min_minutes: 5,
            break_max_minutes: 20,
        }
    }
}

impl StudyPattern {
    /// 随机生成: 速度 0.8-1.2, 专注度 0.7-1.0
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            speed_factor: rng.gen_range(0.8..=1.2),
            focus_level: rng.gen_range(0.7..=1.0),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(self.speed_factor > 0.0 && self.speed_factor.is_finite()) {
            return Err(format!("speed_factor 必须 > 0, 实际: {}", self.speed_factor));
        }
        if !(0.0..=1.0).contains(&self.focus_level) {
            return Err(format!("focus_level 必须在 [0, 1], 实际: {}", self.focus_level));
        }
        check_range("daily", self.daily_min_minutes, self.daily_max_minutes)?;
        check_range("session", self.session_min_minutes, self.session_max_minutes)?;
        check_range("break", self.break_min_minutes, self.break_max_minutes)?;
        Ok(())
    }
}

// =====================================================================
// 各组件配置
// =====================================================================

/// 时长规划常量 (经验值, 均可覆盖)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// 每多少毫秒名义时长安排一次暂停
    pub pause_every_ms: u64,
    /// 额外随机暂停次数上限 (含)
    pub pause_extra_max: u32,
    pub pause_min_ms: u64,
    pub pause_max_ms: u64,
    /// 回看次数上限 (含)
    pub rewind_max_count: u32,
    /// 回看起点只落在前这一比例内
    pub rewind_window: f64,
    pub rewind_min_ms: u64,
    pub rewind_max_ms: u64,
    /// 回看片段计入额外时长的权重
    pub rewind_weight: f64,
    /// 短于此值不回看
    pub short_unit_ms: u64,
    /// 短于此值最多回看一次
    pub medium_unit_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            pause_every_ms: 300_000,
            pause_extra_max: 2,
            pause_min_ms: 5_000,
            pause_max_ms: 20_000,
            rewind_max_count: 2,
            rewind_window: 0.8,
            rewind_min_ms: 30_000,
            rewind_max_ms: 90_000,
            rewind_weight: 0.1,
            short_unit_ms: 60_000,
            medium_unit_ms: 300_000,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.pause_every_ms == 0 {
            return Err("planner.pause_every_ms 必须 > 0".into());
        }
        check_range("planner.pause", self.pause_min_ms, self.pause_max_ms)?;
        check_range("planner.rewind", self.rewind_min_ms, self.rewind_max_ms)?;
        if !(0.0..=1.0).contains(&self.rewind_window) {
            return Err(format!("planner.rewind_window 必须在 [0, 1], 实际: {}", self.rewind_window));
        }
        if !(self.rewind_weight >= 0.0 && self.rewind_weight.is_finite()) {
            return Err(format!("planner.rewind_weight 必须 ≥ 0, 实际: {}", self.rewind_weight));
        }
        Ok(())
    }
}

/// 单个模拟活动的调度参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub enabled: bool,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// 每次触发时真正执行的概率
    pub chance: f64,
}

impl ActivityConfig {
    fn new(min_interval_ms: u64, max_interval_ms: u64, chance: f64) -> Self {
        Self { enabled: true, min_interval_ms, max_interval_ms, chance }
    }

    fn validate(&self, name: &str) -> std::result::Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.min_interval_ms == 0 {
            return Err(format!("activities.{name}.min_interval_ms 必须 > 0"));
        }
        check_range(&format!("activities.{name}"), self.min_interval_ms, self.max_interval_ms)?;
        if !(0.0..=1.0).contains(&self.chance) {
            return Err(format!("activities.{name}.chance 必须在 [0, 1], 实际: {}", self.chance));
        }
        Ok(())
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self::new(30_000, 60_000, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitiesConfig {
    pub pointer_drift: ActivityConfig,
    pub scroll: ActivityConfig,
    pub idle_click: ActivityConfig,
    pub key_press: ActivityConfig,
    pub heartbeat: ActivityConfig,
    /// 按键活动使用的键名
    pub key: String,
    pub viewport_width: i32,
    pub viewport_height: i32,
}

impl Default for ActivitiesConfig {
    fn default() -> Self {
        Self {
            pointer_drift: ActivityConfig::new(15_000, 45_000, 1.0),
            scroll: ActivityConfig::new(20_000, 60_000, 0.3),
            idle_click: ActivityConfig::new(60_000, 180_000, 0.2),
            key_press: ActivityConfig::new(120_000, 300_000, 0.1),
            heartbeat: ActivityConfig::new(30_000, 60_000, 1.0),
            key: "Tab".to_string(),
            viewport_width: 1000,
            viewport_height: 800,
        }
    }
}

impl ActivitiesConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.pointer_drift.validate("pointer_drift")?;
        self.scroll.validate("scroll")?;
        self.idle_click.validate("idle_click")?;
        self.key_press.validate("key_press")?;
        self.heartbeat.validate("heartbeat")?;
        if self.viewport_width <= 0 || self.viewport_height <= 0 {
            return Err("activities.viewport 尺寸必须 > 0".into());
        }
        Ok(())
    }
}

/// 阻塞标记: 名称 → 会话句柄可识别的标记 (如选择器)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerConfig {
    pub name: String,
    pub marker: String,
}

impl MarkerConfig {
    pub fn new(name: &str, marker: &str) -> Self {
        Self { name: name.to_string(), marker: marker.to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// 单次存活探测超时
    pub probe_timeout_ms: u64,
    /// 后台检测阻塞条件的间隔
    pub check_interval_ms: u64,
    /// 阻塞期间轮询标记是否消失的间隔
    pub poll_interval_ms: u64,
    /// 阻塞等待上限, 超时后强制恢复
    pub max_blocking_wait_ms: u64,
    pub markers: Vec<MarkerConfig>,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 3_000,
            check_interval_ms: 5_000,
            poll_interval_ms: 2_000,
            max_blocking_wait_ms: 300_000,
            markers: vec![
                MarkerConfig::new("captcha-modal", ".captcha-modal"),
                MarkerConfig::new("verify-code", ".verify-code"),
                MarkerConfig::new("validation-popup", ".validation-popup"),
                MarkerConfig::new("captcha-any", "[class*=\"captcha\"]"),
                MarkerConfig::new("verify-any", "[class*=\"verify\"]"),
            ],
        }
    }
}

impl WatchdogConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.probe_timeout_ms == 0 || self.check_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err("watchdog 的超时与轮询间隔必须 > 0".into());
        }
        if let Some(m) = self.markers.iter().find(|m| m.name.trim().is_empty() || m.marker.trim().is_empty()) {
            return Err(format!("watchdog.markers 存在空项: {m:?}"));
        }
        Ok(())
    }
}

/// 单元之间的节奏
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// 单元间休息基准 (ms)
    pub unit_gap_ms: u64,
    pub unit_gap_variance: f64,
    /// 段内 "思考" 停顿区间
    pub think_pause_min_ms: u64,
    pub think_pause_max_ms: u64,
    /// 连续学习超过 session_max_minutes 时插入长休息
    pub take_breaks: bool,
    /// 累计超过 daily_max_minutes 时结束会话
    pub enforce_daily_budget: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            unit_gap_ms: 60_000,
            unit_gap_variance: 0.5,
            think_pause_min_ms: 2_000,
            think_pause_max_ms: 8_000,
            take_breaks: true,
            enforce_daily_budget: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..=1.0).contains(&self.unit_gap_variance) {
            return Err(format!("session.unit_gap_variance 必须在 [0, 1], 实际: {}", self.unit_gap_variance));
        }
        check_range("session.think_pause", self.think_pause_min_ms, self.think_pause_max_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: true, bind: "0.0.0.0:8899".to_string() }
    }
}

/// 配置文件中的工作单元描述 (`duration` 为 `HH:MM:SS` / `MM:SS` / 秒)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    pub duration: String,
    #[serde(default)]
    pub pattern: Option<StudyPattern>,
}

impl UnitSpec {
    pub fn to_unit(&self) -> WorkUnit {
        WorkUnit {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            group: self.group.clone(),
            nominal_ms: timeutil::parse_duration(Some(&self.duration)),
            pattern: self.pattern.clone(),
        }
    }
}

// =====================================================================
// PacingConfig: 顶层
// =====================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub planner: PlannerConfig,
    pub activities: ActivitiesConfig,
    pub watchdog: WatchdogConfig,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
    pub api: ApiConfig,
    pub units: Vec<UnitSpec>,
}

impl PacingConfig {
    /// 从 TOML 字符串解析并校验
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| PacingError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 读取配置文件; 文件不存在时使用默认配置
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("⚙️ 配置文件不存在, 使用默认配置: {}", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| PacingError::Config(format!("{}: {e}", path.display())))?;
        let cfg = Self::from_toml(&text)?;
        info!("⚙️ 已加载配置: {} ({} 个单元)", path.display(), cfg.units.len());
        Ok(cfg)
    }

    /// 按 `PACEKEEPER_CONFIG` 或默认文件名定位配置
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load(Path::new(&path))
    }

    pub fn validate(&self) -> Result<()> {
        self.planner
            .validate()
            .and_then(|_| self.activities.validate())
            .and_then(|_| self.watchdog.validate())
            .and_then(|_| self.retry.validate())
            .and_then(|_| self.session.validate())
            .map_err(PacingError::InvalidConfig)?;
        for unit in &self.units {
            if let Some(p) = &unit.pattern {
                p.validate()
                    .map_err(|e| PacingError::InvalidConfig(format!("单元 {}: {e}", unit.id)))?;
            }
        }
        Ok(())
    }

    pub fn work_units(&self) -> Vec<WorkUnit> {
        self.units.iter().map(UnitSpec::to_unit).collect()
    }
}

fn check_range(name: &str, min: u64, max: u64) -> std::result::Result<(), String> {
    if min > max {
        return Err(format!("{name} 区间颠倒: min={min} > max={max}"));
    }
    Ok(())
}
