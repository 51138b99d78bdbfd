use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RestreamError>;

/// 转推监控器对外返回的全部错误
///
/// 每个变体都携带 key 或底层原因, 并通过 [`RestreamError::hint`] 给出一条可操作的提示。
#[derive(Error, Debug)]
pub enum RestreamError {
    #[error("invalid source url '{url}': {reason}")]
    InvalidSource { url: String, reason: String },

    #[error("invalid stream key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("restream '{key}' is already active (pid {pid})")]
    AlreadyActive { key: String, pid: u32 },

    #[error("restream '{key}' is not active")]
    NotActive { key: String },

    #[error("backend container group is not running (state: {state})")]
    BackendNotRunning { state: String },

    #[error("backend ingest {target} does not accept connections")]
    BackendUnreachable { target: String },

    #[error("failed to launch transcoder for '{key}': {reason}")]
    Launch { key: String, reason: String },

    #[error("failed to persist handle for '{key}' at {path:?}: {source}")]
    Persistence {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backend build failed: {reason}")]
    Build { reason: String },

    #[error("backend start failed: {reason}")]
    Start { reason: String },

    #[error("backend not ready after {}s", .timeout.as_secs())]
    NotReady { timeout: Duration },

    #[error("process {pid} for '{key}' survived SIGKILL")]
    TerminateFailed { key: String, pid: u32 },

    #[error("container runtime failed during {action}: {reason}")]
    Runtime { action: &'static str, reason: String },
}

impl RestreamError {
    /// 稳定的错误类别名, 用于 CLI 输出和 HTTP 响应
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSource { .. } => "invalid_source",
            Self::InvalidKey { .. } => "invalid_key",
            Self::AlreadyActive { .. } => "already_active",
            Self::NotActive { .. } => "not_active",
            Self::BackendNotRunning { .. } => "backend_not_running",
            Self::BackendUnreachable { .. } => "backend_unreachable",
            Self::Launch { .. } => "launch",
            Self::Persistence { .. } => "persistence",
            Self::Build { .. } => "build",
            Self::Start { .. } => "start",
            Self::NotReady { .. } => "not_ready",
            Self::TerminateFailed { .. } => "terminate_failed",
            Self::Runtime { .. } => "runtime",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            Self::InvalidSource { .. } => "check the channel's stream url in the catalog",
            Self::InvalidKey { .. } => "use a key made of lowercase letters, digits and single '_'",
            Self::AlreadyActive { .. } => "stop the running restream first",
            Self::NotActive { .. } => "run `status` to list active restreams",
            Self::BackendNotRunning { .. } => "backend not running, start it first with `backend up`",
            Self::BackendUnreachable { .. } => "check `backend status` and the configured rtmp_port",
            Self::Launch { .. } => "make sure ffmpeg is installed (apt install ffmpeg / brew install ffmpeg)",
            Self::Persistence { .. } => "check that the restream state_dir is writable",
            Self::Build { .. } => "inspect the compose file and run `docker compose build` manually",
            Self::Start { .. } => "make sure docker is running and the ports are free",
            Self::NotReady { .. } => "inspect `backend logs` for startup errors",
            Self::TerminateFailed { .. } => "kill the process manually, then run `status` again",
            Self::Runtime { .. } => "make sure docker is installed and the daemon is reachable",
        }
    }
}
