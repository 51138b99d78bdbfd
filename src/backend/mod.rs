pub mod compose;

use crate::config::BackendConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

pub use compose::ComposeBackend;

/// 容器组的即时状态, 每次查询都重新计算, 不做缓存
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerGroupState {
    Absent,
    Built,
    Running,
    Stopped,
}

impl fmt::Display for ContainerGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Built => "built",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// 后端对外地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoints {
    pub ingest: String,
    pub hls_base: String,
    pub stats_url: String,
    pub admin_url: String,
}

impl Endpoints {
    /// 纯计算, 不做任何 I/O
    pub fn from_config(cfg: &BackendConfig) -> Self {
        Self {
            ingest: format!("rtmp://{}:{}/live", cfg.host, cfg.rtmp_port),
            hls_base: format!("http://{}:{}/hls", cfg.host, cfg.http_port),
            stats_url: format!("http://{}:{}/stat", cfg.host, cfg.http_port),
            admin_url: format!("http://{}:{}", cfg.host, cfg.admin_port),
        }
    }
}

/// 媒体服务后端的生命周期接口
///
/// 监控器只依赖这个接口, 不关心背后是哪种容器运行时。
#[async_trait]
pub trait BackendController: Send + Sync {
    /// 镜像不存在时构建; 已构建则不做任何事
    async fn ensure_built(&self) -> Result<()>;

    /// 启动容器组并等待就绪; 已在运行则直接成功
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn status(&self) -> ContainerGroupState;

    fn endpoints(&self) -> Endpoints;

    async fn tail_logs(&self, lines: usize) -> Result<Vec<String>>;

    /// RTMP ingest 端口当前是否接受连接
    async fn probe_ingest(&self) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// 测试用的内存后端
    pub(crate) struct FakeBackend {
        config: BackendConfig,
        state: Mutex<ContainerGroupState>,
        reachable: AtomicBool,
    }

    impl FakeBackend {
        pub(crate) fn new(state: ContainerGroupState) -> Self {
            Self {
                config: BackendConfig::default(),
                state: Mutex::new(state),
                reachable: AtomicBool::new(true),
            }
        }

        pub(crate) fn set_state(&self, state: ContainerGroupState) {
            *self.state.lock().unwrap() = state;
        }

        pub(crate) fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BackendController for FakeBackend {
        async fn ensure_built(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if *state == ContainerGroupState::Absent {
                *state = ContainerGroupState::Built;
            }
            Ok(())
        }

        async fn start(&self) -> Result<()> {
            self.set_state(ContainerGroupState::Running);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.set_state(ContainerGroupState::Stopped);
            Ok(())
        }

        async fn status(&self) -> ContainerGroupState {
            *self.state.lock().unwrap()
        }

        fn endpoints(&self) -> Endpoints {
            Endpoints::from_config(&self.config)
        }

        async fn tail_logs(&self, lines: usize) -> Result<Vec<String>> {
            Ok((0..lines).map(|i| format!("line {}", i)).collect())
        }

        async fn probe_ingest(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }
    }
}
