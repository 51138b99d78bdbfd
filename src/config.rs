use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub restream: RestreamConfig,
}

/// HTTP 控制 API 监听配置 (仅 `serve` 子命令使用)
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9090".to_string(),
        }
    }
}

/// 媒体服务后端 (NGINX-RTMP 容器组) 配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    /// 对外公布 URL 时使用的主机名
    pub host: String,
    pub rtmp_port: u16,
    pub http_port: u16,
    pub admin_port: u16,
    /// compose 调用方式, 例如 ["docker", "compose"] 或 ["docker-compose"]
    pub compose_command: Vec<String>,
    /// 查询容器状态与日志时调用的 docker 可执行文件
    pub docker_command: String,
    pub compose_file: PathBuf,
    pub container_name: String,
    pub image: String,
    /// 启动后等待就绪的最长时间 (秒)
    pub ready_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            rtmp_port: 1935,
            http_port: 8080,
            admin_port: 8081,
            compose_command: vec!["docker".to_string(), "compose".to_string()],
            docker_command: "docker".to_string(),
            compose_file: PathBuf::from("docker-compose.yml"),
            container_name: "iptv-nginx-rtmp".to_string(),
            image: "iptv-nginx-rtmp:latest".to_string(),
            ready_timeout_secs: 15,
        }
    }
}

impl BackendConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// 转推进程相关配置
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RestreamConfig {
    pub ffmpeg_binary: String,
    /// 句柄记录目录, 每个活跃 key 一个 JSON 文件
    pub state_dir: PathBuf,
    /// 每个 key 的 ffmpeg 日志目录
    pub log_dir: PathBuf,
    /// SIGTERM 之后等待进程退出的宽限期 (秒)
    pub stop_grace_secs: u64,
    /// 连通性测试保留的 key
    pub test_key: String,
    pub test_duration_secs: u64,
    pub test_wait_secs: u64,
}

impl Default for RestreamConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: "ffmpeg".to_string(),
            state_dir: PathBuf::from(".restream"),
            log_dir: PathBuf::from(".restream/logs"),
            stop_grace_secs: 5,
            test_key: "test_stream".to_string(),
            test_duration_secs: 10,
            test_wait_secs: 15,
        }
    }
}

impl RestreamConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_secs)
    }

    pub fn test_wait(&self) -> Duration {
        Duration::from_secs(self.test_wait_secs)
    }
}

impl AppConfig {
    /// 加载配置文件; 文件不存在时使用全部默认值
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        // 空文件视为全部默认
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = serde_yaml::from_str(content)?;
        Ok(config)
    }
}
