use crate::backend::BackendController;
use crate::config::RestreamConfig;
use crate::error::{RestreamError, Result};
use crate::handle::{Profile, RestreamHandle};
use crate::process;
use crate::store::HandleStore;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use url::Url;

/// 允许的拉流协议
const ALLOWED_SCHEMES: &[&str] = &["http", "https", "rtmp", "rtmps", "rtsp", "rtp", "udp", "srt", "mms"];

/// 启动前要求的最低可用内存 (KB)
const MIN_AVAILABLE_MEM_KB: u64 = 5120;

/// 测试图案在句柄中记录的来源
pub const TEST_PATTERN_SOURCE: &str = "lavfi:testsrc2";

/// 拉流来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Url(String),
    /// ffmpeg 内置的彩条测试图案 + 正弦音
    TestPattern,
}

impl Source {
    fn describe(&self) -> &str {
        match self {
            Source::Url(url) => url,
            Source::TestPattern => TEST_PATTERN_SOURCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub key: String,
    pub source: Source,
    pub profile: Profile,
    /// 设置后 ffmpeg 以 `-t` 运行固定时长
    pub duration: Option<Duration>,
}

/// 校验来源地址: 非空, 可解析, 协议在白名单内且带主机名
pub fn validate_source(url: &str) -> Result<()> {
    let invalid = |reason: &str| RestreamError::InvalidSource {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    if url.trim().is_empty() {
        return Err(invalid("url is empty"));
    }
    let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(invalid(&format!("unsupported scheme '{}'", parsed.scheme())));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("url has no host"));
    }
    Ok(())
}

/// 构建 ffmpeg 参数 (不含可执行文件本身)
pub fn build_args(source: &Source, profile: Profile, target: &str, duration: Option<Duration>) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "warning"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    match source {
        Source::Url(url) => {
            push(&["-i", url.as_str()]);
            match profile {
                Profile::DirectCopy => push(&["-c", "copy"]),
                Profile::Transcoded => push(&[
                    "-c:v", "libx264",
                    "-preset", "superfast",
                    "-tune", "zerolatency",
                    "-b:v", "1M",
                    "-maxrate", "1M",
                    "-bufsize", "2M",
                    "-vf", "scale=854:480",
                    "-c:a", "aac",
                    "-b:a", "128k",
                ]),
            }
        }
        Source::TestPattern => push(&[
            "-re",
            "-f", "lavfi", "-i", "testsrc2=size=640x480:rate=25",
            "-f", "lavfi", "-i", "sine=frequency=1000",
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-g", "50",
            "-c:a", "aac",
        ]),
    }

    if let Some(duration) = duration {
        let secs = duration.as_secs().max(1).to_string();
        push(&["-t", secs.as_str()]);
    }
    push(&["-f", "flv", target]);
    args
}

/// 转码进程启动器
pub struct Launcher {
    config: RestreamConfig,
    store: HandleStore,
    backend: Arc<dyn BackendController>,
}

impl Launcher {
    pub fn new(config: RestreamConfig, store: HandleStore, backend: Arc<dyn BackendController>) -> Self {
        Self {
            config,
            store,
            backend,
        }
    }

    pub fn log_path(&self, key: &str) -> PathBuf {
        self.config.log_dir.join(format!("{}.log", key))
    }

    /// 启动一个转推进程并立即持久化其句柄
    ///
    /// # 副作用
    /// - 启动一个与调用方生命周期分离的子进程
    /// - 创建或追加 `<log_dir>/<key>.log`
    ///
    /// # 错误处理
    /// - 来源地址非法时返回 `InvalidSource`
    /// - ffmpeg 不存在、内存不足或启动失败时返回 `Launch`
    /// - 后端 ingest 端口不可达时返回 `BackendUnreachable`, 此时不会启动进程
    /// - 句柄写入失败时先杀掉新进程, 再返回 `Persistence`
    pub async fn launch(&self, req: LaunchRequest) -> Result<RestreamHandle> {
        let launch_err = |reason: String| RestreamError::Launch {
            key: req.key.clone(),
            reason,
        };

        // 1. 校验来源
        if let Source::Url(url) = &req.source {
            validate_source(url)?;
        }

        // 2. 查找 ffmpeg
        let binary = which::which(&self.config.ffmpeg_binary).map_err(|e| {
            launch_err(format!("'{}' not found or not executable: {}", self.config.ffmpeg_binary, e))
        })?;

        // 3. 确认后端 ingest 可达, 避免白白启动一个注定失败的进程
        let target = format!("{}/{}", self.backend.endpoints().ingest, req.key);
        if !self.backend.probe_ingest().await {
            return Err(RestreamError::BackendUnreachable { target });
        }

        // 4. 检查系统内存
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < MIN_AVAILABLE_MEM_KB => {
                return Err(launch_err(format!(
                    "insufficient system memory ({} KB available)",
                    mem.avail
                )));
            }
            Ok(_) => {}
            Err(e) => {
                // 无法获取内存信息时仅记录警告
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 5. 准备日志文件
        let args = build_args(&req.source, req.profile, &target, req.duration);
        let log_path = self.log_path(&req.key);
        let log = open_log(&log_path, &binary, &args)
            .map_err(|e| launch_err(format!("cannot open log file {:?}: {}", log_path, e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| launch_err(format!("cannot open log file {:?}: {}", log_path, e)))?;

        info!(
            "Starting restream [{}] ({}) {} -> {}",
            req.key,
            req.profile,
            req.source.describe(),
            target
        );

        // 6. 启动 ffmpeg, 作为独立进程组, 调用返回后继续运行
        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn FFmpeg process: {}", e);
            launch_err(e.to_string())
        })?;

        let Some(pid) = child.id() else {
            return Err(launch_err("process exited immediately".to_string()));
        };

        let handle = RestreamHandle {
            key: req.key.clone(),
            pid,
            source_url: req.source.describe().to_string(),
            profile: req.profile,
            started_at: Utc::now(),
            backend_target: target,
            log_path,
        };

        // 7. 立即持久化; 失败时补偿性地杀掉刚启动的进程
        if let Err(e) = self.store.put(&handle) {
            error!("Persisting handle [{}] failed, killing pid {}: {}", req.key, pid, e);
            // ffmpeg 是进程组组长, 连同其子进程一起杀掉
            if let Err(kill_err) = process::kill_group(pid) {
                warn!("Failed to kill untracked process group {}: {}", pid, kill_err);
            }
            if let Err(wait_err) = child.wait().await {
                debug!("Wait on untracked process {} failed: {}", pid, wait_err);
            }
            return Err(e);
        }

        // 8. 本进程存活期间负责回收子进程
        let key = req.key.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("Restream [{}] (pid {}) exited with: {}", key, pid, status),
                Err(e) => debug!("Wait on restream [{}] (pid {}) failed: {}", key, pid, e),
            }
        });

        Ok(handle)
    }
}

fn open_log(path: &Path, binary: &Path, args: &[String]) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(
        file,
        "=== {} {} {}",
        Utc::now().to_rfc3339(),
        binary.display(),
        args.join(" ")
    )?;
    Ok(file)
}
