//! HTTP 控制接口
//!
//! 查看会话状态与进度，手动暂停/恢复/停止。

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::orchestrator::{SessionOrchestrator, SessionStatus};
use crate::progress::ProgressAccumulator;

/// API 服务共享状态
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/progress", get(progress))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/stop", post(stop))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 绑定地址并运行, 直到监听失败
pub async fn serve(state: Arc<AppState>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("🌐 控制接口就绪: http://{bind}");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

// ================================================================
// Handlers
// ================================================================

async fn index() -> &'static str {
    concat!("pacekeeper API v", env!("CARGO_PKG_VERSION"))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<SessionStatus> {
    Json(state.orchestrator.status().await)
}

async fn progress(State(state): State<Arc<AppState>>) -> Json<ProgressAccumulator> {
    Json(state.orchestrator.get_progress().await)
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    /// 本次请求是否引起了阶段变化
    changed: bool,
    phase: crate::watchdog::WatchdogPhase,
}

fn control(state: &AppState, changed: bool) -> (StatusCode, Json<ControlResponse>) {
    let code = if state.orchestrator.is_running() { StatusCode::OK } else { StatusCode::CONFLICT };
    let phase = state.orchestrator.watchdog_state().phase();
    (code, Json(ControlResponse { changed, phase }))
}

async fn pause(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ControlResponse>) {
    info!("⏸️ API: 暂停");
    let changed = state.orchestrator.pause_all();
    control(&state, changed)
}

async fn resume(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ControlResponse>) {
    info!("▶️ API: 恢复");
    let changed = state.orchestrator.resume_all();
    control(&state, changed)
}

async fn stop(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ControlResponse>) {
    info!("⏹️ API: 停止");
    let changed = state.orchestrator.stop_session();
    control(&state, changed)
}
