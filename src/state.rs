use crate::supervisor::Supervisor;
use std::sync::Arc;

/// HTTP 控制 API 的全局上下文
pub struct AppState {
    pub supervisor: Supervisor,
}

pub type SharedState = Arc<AppState>;
