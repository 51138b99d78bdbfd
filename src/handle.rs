use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 转推质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// 仅转封装, 不重新编码
    DirectCopy,
    /// 固定 854x480 / 1Mbps 重新编码, 后端据此派生多档码率
    Transcoded,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::DirectCopy => write!(f, "direct_copy"),
            Profile::Transcoded => write!(f, "transcoded"),
        }
    }
}

/// 活跃转推的持久化记录, 创建后不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestreamHandle {
    pub key: String,
    /// ffmpeg 进程号, 同时也是其进程组号
    pub pid: u32,
    pub source_url: String,
    pub profile: Profile,
    pub started_at: DateTime<Utc>,
    /// 推流目标, 例如 rtmp://localhost:1935/live/cnn_hd
    pub backend_target: String,
    #[serde(default)]
    pub log_path: PathBuf,
}

/// 某个 key 对外公布的播放地址
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamUrls {
    pub rtmp: String,
    pub hls: Vec<String>,
}

/// Transcoded 推流时后端生成的 HLS 子流后缀
pub const TRANSCODED_RENDITIONS: [&str; 3] = ["src", "mid", "low"];

impl StreamUrls {
    /// 由 ingest 基址 (`rtmp://host:port/live`) 与 HLS 基址 (`http://host:port/hls`) 派生
    pub fn derive(ingest: &str, hls_base: &str, key: &str, profile: Profile) -> Self {
        let hls = match profile {
            Profile::DirectCopy => vec![format!("{}/{}.m3u8", hls_base, key)],
            Profile::Transcoded => TRANSCODED_RENDITIONS
                .iter()
                .map(|suffix| format!("{}/{}_{}.m3u8", hls_base, key, suffix))
                .collect(),
        };
        Self {
            rtmp: format!("{}/{}", ingest, key),
            hls,
        }
    }
}

/// `start` / `status` 返回的投影
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRestream {
    pub handle: RestreamHandle,
    pub urls: StreamUrls,
}
