//! 进度累计
//!
//! 只增不减；单元中途放弃时已耗时间同样计入，调用方随时可取快照。

use serde::Serialize;
use std::collections::BTreeMap;

use crate::timeutil::{human_duration, unix_millis};

/// 正在进行的单元
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentUnit {
    pub id: String,
    pub name: String,
    pub group: Option<String>,
    pub planned_ms: u64,
    pub started_ms: u64,
}

/// 分组 (课程) 汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub total_time_ms: u64,
    pub completed_units: u64,
    /// 最近一次计入时间 (unix ms)
    pub last_studied_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressAccumulator {
    pub total_time_ms: u64,
    pub completed_units: u64,
    pub per_unit_time: BTreeMap<String, u64>,
    pub units_started: u64,
    /// 被放弃的单元 (按发生顺序)
    pub abandoned_units: Vec<String>,
    pub current_unit: Option<CurrentUnit>,
    /// 按分组汇总, 未分组的单元不计入
    pub per_group: BTreeMap<String, GroupStats>,
}

impl ProgressAccumulator {
    pub fn begin_unit(&mut self, id: &str, name: &str, group: Option<&str>, planned_ms: u64) {
        self.units_started += 1;
        self.current_unit = Some(CurrentUnit {
            id: id.to_string(),
            name: name.to_string(),
            group: group.map(str::to_string),
            planned_ms,
            started_ms: unix_millis(),
        });
    }

    /// 单元正常完成
    pub fn complete_unit(&mut self, id: &str, elapsed_ms: u64) {
        if let Some(g) = self.add_time(id, elapsed_ms) {
            g.completed_units += 1;
        }
        self.completed_units += 1;
        self.current_unit = None;
    }

    /// 单元被放弃: 已耗时间照常计入
    pub fn abandon_unit(&mut self, id: &str, elapsed_ms: u64) {
        self.add_time(id, elapsed_ms);
        self.abandoned_units.push(id.to_string());
        self.current_unit = None;
    }

    /// 会话停止时中断的单元: 计入时间, 既不算完成也不算放弃
    pub fn interrupt_unit(&mut self, id: &str, elapsed_ms: u64) {
        self.add_time(id, elapsed_ms);
        self.current_unit = None;
    }

    /// 计入单元时间, 返回其所属分组的汇总 (若有)
    fn add_time(&mut self, id: &str, elapsed_ms: u64) -> Option<&mut GroupStats> {
        self.total_time_ms = self.total_time_ms.saturating_add(elapsed_ms);
        let entry = self.per_unit_time.entry(id.to_string()).or_insert(0);
        *entry = entry.saturating_add(elapsed_ms);

        let group = self
            .current_unit
            .as_ref()
            .filter(|u| u.id == id)
            .and_then(|u| u.group.clone())?;
        let stats = self.per_group.entry(group).or_default();
        stats.total_time_ms = stats.total_time_ms.saturating_add(elapsed_ms);
        stats.last_studied_ms = unix_millis();
        Some(stats)
    }

    pub fn group_stats(&self, group: &str) -> Option<&GroupStats> {
        self.per_group.get(group)
    }

    pub fn unit_time(&self, id: &str) -> u64 {
        self.per_unit_time.get(id).copied().unwrap_or(0)
    }

    /// 每个单元的平均耗时
    pub fn average_unit_ms(&self) -> u64 {
        match self.per_unit_time.len() {
            0 => 0,
            n => self.total_time_ms / n as u64,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "完成 {} 个单元, 放弃 {} 个, 累计 {}",
            self.completed_units,
            self.abandoned_units.len(),
            human_duration(self.total_time_ms)
        )
    }
}
