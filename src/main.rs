//! pacekeeper: 空跑模式入口
//!
//! 流程:
//! - 加载配置 (PACEKEEPER_CONFIG 或 ./pacekeeper.toml)
//! - 启动 HTTP 控制接口
//! - 获取句柄并按配置中的单元运行会话, Ctrl+C 停止

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use pacekeeper::api::{self, AppState};
use pacekeeper::handle::DryRunProvider;
use pacekeeper::timeutil::human_duration;
use pacekeeper::{PacingConfig, SessionOrchestrator};

#[tokio::main]
async fn main() -> Result<()> {
    // 日志 (PACEKEEPER_LOG_FORMAT=json 输出结构化日志)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pacekeeper=debug,tower_http=info".into());
    if std::env::var("PACEKEEPER_LOG_FORMAT").is_ok_and(|f| f == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🚀 pacekeeper v{} 启动中...", env!("CARGO_PKG_VERSION"));

    // ① 配置
    let cfg = PacingConfig::load_default().context("加载配置失败")?;
    let units = cfg.work_units();
    if units.is_empty() {
        warn!("⚠️ 配置中没有工作单元, 会话将立即结束");
    }
    let total: u64 = units.iter().map(|u| u.nominal_ms).sum();
    info!("📋 {} 个单元, 名义总时长 {}", units.len(), human_duration(total));

    // ② 编排器
    let api_cfg = cfg.api.clone();
    let orchestrator = Arc::new(SessionOrchestrator::new(cfg).context("配置校验失败")?);

    // ③ 控制接口
    if api_cfg.enabled {
        let state = Arc::new(AppState { orchestrator: orchestrator.clone() });
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &api_cfg.bind).await {
                error!("❌ 控制接口退出: {e:#}");
            }
        });
    }

    // ④ Ctrl+C → 停止会话
    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 收到 Ctrl+C, 正在停止...");
            stopper.stop_session();
        }
    });

    // ⑤ 运行会话
    let progress = orchestrator
        .start_session_with(&DryRunProvider, &units)
        .await
        .context("会话运行失败")?;

    info!("📊 {}", progress.summary());
    Ok(())
}
