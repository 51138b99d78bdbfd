pub mod admin;

use crate::error::RestreamError;
use crate::state::SharedState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// 注册控制 API 路由
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/sys/status", get(admin::sys_status)) // 系统状态
        .route("/restreams", get(admin::list_restreams)) // 活跃转推列表
        .route("/restreams/:key/start", post(admin::handle_start)) // 启动转推
        .route("/restreams/:key/stop", post(admin::handle_stop)) // 停止转推
        .route("/test", post(admin::handle_test)) // 连通性测试
        .route("/backend", get(admin::backend_status))
        .route("/backend/build", post(admin::backend_build))
        .route("/backend/start", post(admin::backend_start))
        .route("/backend/stop", post(admin::backend_stop))
        .route("/backend/logs", get(admin::backend_logs))
        .route("/backend/endpoints", get(admin::backend_endpoints))
        .with_state(state)
}

/// 把监控器错误转换为 `{kind, error, hint}` JSON 响应
pub struct ApiError(pub RestreamError);

impl From<RestreamError> for ApiError {
    fn from(err: RestreamError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            RestreamError::InvalidSource { .. } | RestreamError::InvalidKey { .. } => {
                StatusCode::BAD_REQUEST
            }
            RestreamError::AlreadyActive { .. } => StatusCode::CONFLICT,
            RestreamError::NotActive { .. } => StatusCode::NOT_FOUND,
            RestreamError::BackendNotRunning { .. }
            | RestreamError::BackendUnreachable { .. }
            | RestreamError::NotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "kind": self.0.kind(),
            "error": self.0.to_string(),
            "hint": self.0.hint(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_status_codes() {
        let cases = [
            (RestreamError::NotActive { key: "k".into() }, StatusCode::NOT_FOUND),
            (
                RestreamError::AlreadyActive { key: "k".into(), pid: 1 },
                StatusCode::CONFLICT,
            ),
            (
                RestreamError::BackendNotRunning { state: "stopped".into() },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RestreamError::Launch { key: "k".into(), reason: "x".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }
}
