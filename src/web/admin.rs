use super::ApiError;
use crate::handle::{ActiveRestream, Profile, RestreamHandle};
use crate::state::SharedState;
use crate::supervisor::TestReport;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// 获取系统状态 API
/// 返回系统的内存和负载信息, 以及活跃转推数量
pub async fn sys_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    // 获取内存信息，默认值为 0
    let mem = sys_info::mem_info().map(|m| (m.total, m.avail)).unwrap_or((0, 0));
    // 获取负载信息，默认值为 0.0
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);
    let active = state.supervisor.status().await.len();

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
        "active_restreams": active,
    }))
}

/// 获取活跃转推列表 API
pub async fn list_restreams(State(state): State<SharedState>) -> Json<Vec<ActiveRestream>> {
    Json(state.supervisor.status().await)
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    pub url: String,
    #[serde(default = "default_profile")]
    pub profile: Profile,
}

fn default_profile() -> Profile {
    Profile::DirectCopy
}

/// 启动转推 API
pub async fn handle_start(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(body): Json<StartBody>,
) -> ApiResult<ActiveRestream> {
    let active = state.supervisor.start(&key, &body.url, body.profile).await?;
    Ok(Json(active))
}

/// 停止转推 API
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> ApiResult<RestreamHandle> {
    Ok(Json(state.supervisor.stop(&key).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TestBody {
    /// 为空时使用内置测试图案
    pub url: Option<String>,
}

/// 连通性测试 API
pub async fn handle_test(
    State(state): State<SharedState>,
    Json(body): Json<TestBody>,
) -> ApiResult<TestReport> {
    Ok(Json(state.supervisor.test(body.url.as_deref()).await?))
}

/// 后端状态与地址
pub async fn backend_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let backend = state.supervisor.backend();
    Json(serde_json::json!({
        "state": backend.status().await,
        "endpoints": backend.endpoints(),
    }))
}

pub async fn backend_build(State(state): State<SharedState>) -> ApiResult<serde_json::Value> {
    let backend = state.supervisor.backend();
    backend.ensure_built().await?;
    Ok(Json(serde_json::json!({ "state": backend.status().await })))
}

pub async fn backend_start(State(state): State<SharedState>) -> ApiResult<serde_json::Value> {
    let backend = state.supervisor.backend();
    backend.start().await?;
    Ok(Json(serde_json::json!({
        "state": backend.status().await,
        "endpoints": backend.endpoints(),
    })))
}

pub async fn backend_stop(State(state): State<SharedState>) -> ApiResult<serde_json::Value> {
    let backend = state.supervisor.backend();
    backend.stop().await?;
    Ok(Json(serde_json::json!({ "state": backend.status().await })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_lines")]
    pub lines: usize,
}

fn default_lines() -> usize {
    50
}

pub async fn backend_logs(
    State(state): State<SharedState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<serde_json::Value> {
    let lines = state.supervisor.backend().tail_logs(query.lines).await?;
    Ok(Json(serde_json::json!({ "lines": lines })))
}

pub async fn backend_endpoints(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.supervisor.backend().endpoints()))
}
