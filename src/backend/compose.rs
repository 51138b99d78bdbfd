use super::{BackendController, ContainerGroupState, Endpoints};
use crate::config::BackendConfig;
use crate::error::{RestreamError, Result};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// 错误信息中保留的 stderr 尾部行数
const ERROR_TAIL_LINES: usize = 5;

/// 基于 docker compose 命令行的后端实现
pub struct ComposeBackend {
    config: BackendConfig,
}

impl ComposeBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    /// 组装 `<compose_command> -f <compose_file> <args...>`
    fn compose(&self, args: &[&str]) -> std::result::Result<Command, String> {
        let (program, prefix) = self
            .config
            .compose_command
            .split_first()
            .ok_or_else(|| "compose_command is empty".to_string())?;
        let mut cmd = Command::new(program);
        cmd.args(prefix).arg("-f").arg(&self.config.compose_file).args(args);
        Ok(cmd)
    }

    fn docker(&self) -> Command {
        Command::new(&self.config.docker_command)
    }

    async fn run_compose(&self, args: &[&str]) -> std::result::Result<(), String> {
        let mut cmd = self.compose(args)?;
        info!("Running compose {}", args.join(" "));
        let output = run(&mut cmd).await.map_err(|e| format!("{}", e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "exited with {}: {}",
                output.status,
                stderr_tail(&output, ERROR_TAIL_LINES)
            ))
        }
    }

    async fn container_state(&self) -> std::io::Result<Option<ContainerGroupState>> {
        let filter = format!("name=^/{}$", self.config.container_name);
        let mut cmd = self.docker();
        cmd.args(["ps", "-a", "--filter", &filter, "--format", "{{.State}}"]);
        let output = query(&mut cmd).await?;
        if !output.status.success() {
            return Err(std::io::Error::other(stderr_tail(&output, 1)));
        }
        Ok(parse_ps_state(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn image_exists(&self) -> std::io::Result<bool> {
        let mut cmd = self.docker();
        cmd.args(["image", "inspect", &self.config.image]);
        let output = query(&mut cmd).await?;
        Ok(output.status.success())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let ready_timeout = self.config.ready_timeout();
        let deadline = Instant::now() + ready_timeout;
        loop {
            if self.status().await == ContainerGroupState::Running && self.probe_ingest().await {
                info!("Backend is ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RestreamError::NotReady {
                    timeout: ready_timeout,
                });
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl BackendController for ComposeBackend {
    async fn ensure_built(&self) -> Result<()> {
        let state = self.status().await;
        if state != ContainerGroupState::Absent {
            debug!("Backend already built ({})", state);
            return Ok(());
        }
        self.run_compose(&["build"])
            .await
            .map_err(|reason| RestreamError::Build { reason })
    }

    async fn start(&self) -> Result<()> {
        if self.status().await == ContainerGroupState::Running {
            debug!("Backend already running");
            return Ok(());
        }
        self.run_compose(&["up", "-d"])
            .await
            .map_err(|reason| RestreamError::Start { reason })?;
        self.wait_until_ready().await
    }

    async fn stop(&self) -> Result<()> {
        match self.status().await {
            ContainerGroupState::Absent | ContainerGroupState::Built => {
                debug!("Backend has no containers, nothing to stop");
                Ok(())
            }
            _ => self
                .run_compose(&["down"])
                .await
                .map_err(|reason| RestreamError::Runtime {
                    action: "stop",
                    reason,
                }),
        }
    }

    async fn status(&self) -> ContainerGroupState {
        match self.container_state().await {
            Ok(Some(state)) => state,
            Ok(None) => match self.image_exists().await {
                Ok(true) => ContainerGroupState::Built,
                Ok(false) => ContainerGroupState::Absent,
                Err(e) => {
                    warn!("Cannot inspect backend image: {}", e);
                    ContainerGroupState::Absent
                }
            },
            Err(e) => {
                warn!("Cannot query container runtime: {}", e);
                ContainerGroupState::Absent
            }
        }
    }

    fn endpoints(&self) -> Endpoints {
        Endpoints::from_config(&self.config)
    }

    async fn tail_logs(&self, lines: usize) -> Result<Vec<String>> {
        let tail = lines.to_string();
        let mut cmd = self.docker();
        cmd.args(["logs", "--tail", &tail, &self.config.container_name]);
        let output = query(&mut cmd).await.map_err(|e| RestreamError::Runtime {
            action: "logs",
            reason: e.to_string(),
        })?;
        if !output.status.success() {
            return Err(RestreamError::Runtime {
                action: "logs",
                reason: stderr_tail(&output, ERROR_TAIL_LINES),
            });
        }
        // nginx 同时写 stdout 和 stderr
        let mut merged: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::to_string)
            .collect();
        let excess = merged.len().saturating_sub(lines);
        merged.drain(..excess);
        Ok(merged)
    }

    async fn probe_ingest(&self) -> bool {
        let addr = (self.config.host.as_str(), self.config.rtmp_port);
        match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Ingest probe {}:{} failed: {}", addr.0, addr.1, e);
                false
            }
            Err(_) => {
                debug!("Ingest probe {}:{} timed out", addr.0, addr.1);
                false
            }
        }
    }
}

async fn run(cmd: &mut Command) -> std::io::Result<Output> {
    cmd.stdin(Stdio::null()).output().await
}

async fn query(cmd: &mut Command) -> std::io::Result<Output> {
    timeout(QUERY_TIMEOUT, run(cmd))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "container runtime query timed out"))?
}

fn stderr_tail(output: &Output, lines: usize) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let all: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// 解析 `docker ps --format {{.State}}` 的输出; 空输出表示容器不存在
fn parse_ps_state(stdout: &str) -> Option<ContainerGroupState> {
    let state = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    if state.eq_ignore_ascii_case("running") {
        Some(ContainerGroupState::Running)
    } else {
        Some(ContainerGroupState::Stopped)
    }
}
