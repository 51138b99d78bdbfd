use crate::backend::{BackendController, ContainerGroupState};
use crate::config::RestreamConfig;
use crate::error::{RestreamError, Result};
use crate::handle::{ActiveRestream, Profile, RestreamHandle, StreamUrls};
use crate::key::derive_key;
use crate::launcher::{LaunchRequest, Launcher, Source};
use crate::process::{self, Termination};
use crate::store::HandleStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const TEST_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `test` 的结果
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub key: String,
    pub hls_url: String,
    /// 等待期内播放列表中是否出现了切片
    pub segments_appeared: bool,
}

/// 每个 key 一把互斥锁, 不同 key 之间互不阻塞
///
/// 锁在最后一个使用者释放后从表中移除。
#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// 持有期间独占某个 key
struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // 先释放互斥锁, 再检查是否还有其他等待者
        self.guard.take();
        self.owner.prune(&self.key);
    }
}

impl KeyLocks {
    fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let guard = self.entry(key).lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn try_lock(&self, key: &str) -> Option<KeyGuard<'_>> {
        let attempt = self.entry(key).try_lock_owned();
        match attempt {
            Ok(guard) => Some(KeyGuard {
                owner: self,
                key: key.to_string(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.prune(key);
                None
            }
        }
    }

    /// 表中的引用是唯一引用时删除该项; 等待者各自持有一份 Arc
    fn prune(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// 转推监控器
///
/// 保证每个 key 至多一个活跃转推, 并在每次 start / stop / status 前清理失效句柄。
pub struct Supervisor {
    config: RestreamConfig,
    store: HandleStore,
    launcher: Launcher,
    backend: Arc<dyn BackendController>,
    locks: KeyLocks,
    http: reqwest::Client,
}

impl Supervisor {
    pub fn new(config: RestreamConfig, backend: Arc<dyn BackendController>) -> Self {
        let store = HandleStore::new(&config.state_dir);
        let launcher = Launcher::new(config.clone(), store.clone(), backend.clone());
        Self {
            config,
            store,
            launcher,
            backend,
            locks: KeyLocks::default(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BackendController> {
        &self.backend
    }

    /// 纯计算: 某个 key 在给定档位下的播放地址
    pub fn urls(&self, key: &str, profile: Profile) -> StreamUrls {
        let endpoints = self.backend.endpoints();
        StreamUrls::derive(&endpoints.ingest, &endpoints.hls_base, key, profile)
    }

    fn project(&self, handle: RestreamHandle) -> ActiveRestream {
        let urls = self.urls(&handle.key, handle.profile);
        ActiveRestream { handle, urls }
    }

    fn check_key(&self, key: &str) -> Result<()> {
        let invalid = |reason: &str| RestreamError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        if derive_key(key) != key {
            return Err(invalid("key is not sanitized"));
        }
        if key == self.config.test_key {
            return Err(invalid("key is reserved for the connectivity test"));
        }
        Ok(())
    }

    /// 若 key 的句柄已失效则删除; 调用方必须持有该 key 的锁
    fn purge_if_stale(&self, key: &str) {
        let Some(handle) = self.store.get(key) else {
            return;
        };
        if self.store.is_alive(&handle) {
            return;
        }
        info!(
            "Restream [{}] (pid {}) is no longer running, purging stale handle",
            key, handle.pid
        );
        if let Err(e) = self.store.remove(key) {
            warn!("Failed to purge stale handle [{}]: {}", key, e);
        }
    }

    /// 清理所有失效句柄; `held` 为调用方已持有锁的 key
    ///
    /// 其他 key 只在拿到锁后重新读取再清理, 避免删掉并发 start 刚写入的句柄。
    /// 正被操作的 key 直接跳过, 由持锁方自己清理。
    fn reconcile(&self, held: Option<&str>) {
        let keys: Vec<String> = self.store.list_all().map(|h| h.key).collect();
        for key in keys {
            if Some(key.as_str()) == held {
                self.purge_if_stale(&key);
                continue;
            }
            match self.locks.try_lock(&key) {
                Some(_guard) => self.purge_if_stale(&key),
                None => debug!("Restream [{}] is busy, skipping reconciliation", key),
            }
        }
    }

    /// 启动转推
    ///
    /// 1. 清理失效句柄
    /// 2. 已有活跃句柄时返回 `AlreadyActive`
    /// 3. 后端不在运行时返回 `BackendNotRunning` (不会自动启动后端)
    /// 4. 交给 launcher 启动并持久化
    pub async fn start(&self, key: &str, source_url: &str, profile: Profile) -> Result<ActiveRestream> {
        self.check_key(key)?;
        let _guard = self.locks.lock(key).await;
        self.start_locked(key, Source::Url(source_url.to_string()), profile, None)
            .await
    }

    /// 调用方必须持有 `key` 的锁
    async fn start_locked(
        &self,
        key: &str,
        source: Source,
        profile: Profile,
        duration: Option<Duration>,
    ) -> Result<ActiveRestream> {
        self.reconcile(Some(key));

        if let Some(existing) = self.store.get(key) {
            return Err(RestreamError::AlreadyActive {
                key: key.to_string(),
                pid: existing.pid,
            });
        }

        let state = self.backend.status().await;
        if state != ContainerGroupState::Running {
            return Err(RestreamError::BackendNotRunning {
                state: state.to_string(),
            });
        }

        let handle = self
            .launcher
            .launch(LaunchRequest {
                key: key.to_string(),
                source,
                profile,
                duration,
            })
            .await?;

        let active = self.project(handle);
        info!(
            "Restream [{}] active (pid {}), HLS: {}",
            key,
            active.handle.pid,
            active.urls.hls.join(", ")
        );
        Ok(active)
    }

    /// 停止转推: 先 SIGTERM, 宽限期后强制终止, 确认退出后删除句柄
    pub async fn stop(&self, key: &str) -> Result<RestreamHandle> {
        let _guard = self.locks.lock(key).await;
        self.stop_locked(key).await
    }

    /// 调用方必须持有 `key` 的锁
    async fn stop_locked(&self, key: &str) -> Result<RestreamHandle> {
        self.reconcile(Some(key));

        let handle = self.store.get(key).ok_or_else(|| RestreamError::NotActive {
            key: key.to_string(),
        })?;

        match process::terminate(handle.pid, self.config.stop_grace()).await {
            Termination::AlreadyGone | Termination::Graceful => {}
            Termination::Forced => warn!(
                "Restream [{}] (pid {}) ignored SIGTERM and was killed",
                key, handle.pid
            ),
            Termination::Survived => {
                return Err(RestreamError::TerminateFailed {
                    key: key.to_string(),
                    pid: handle.pid,
                })
            }
        }

        self.store.remove(key)?;
        info!("Restream [{}] stopped.", key);
        Ok(handle)
    }

    /// 列出所有活跃转推 (按 key 排序)
    pub async fn status(&self) -> Vec<ActiveRestream> {
        self.reconcile(None);
        // 跳过的忙碌 key 也不能把失效句柄报告为活跃
        let mut active: Vec<_> = self
            .store
            .list_all()
            .filter(|h| self.store.is_alive(h))
            .map(|h| self.project(h))
            .collect();
        active.sort_by(|a, b| a.handle.key.cmp(&b.handle.key));
        active
    }

    /// 端到端连通性测试
    ///
    /// 用保留 key 启动一个有时长上限的转推, 等待 HLS 切片出现, 最后停止本次启动的进程。
    /// 整个过程持有保留 key 的锁, 并发的测试依次执行。
    pub async fn test(&self, source_url: Option<&str>) -> Result<TestReport> {
        let key = self.config.test_key.clone();
        let source = match source_url {
            Some(url) => Source::Url(url.to_string()),
            None => Source::TestPattern,
        };
        let hls_url = self.urls(&key, Profile::DirectCopy).hls[0].clone();

        let _guard = self.locks.lock(&key).await;
        // 启动失败时没有留下进程; AlreadyActive 说明进程属于别的调用方, 不能停
        self.start_locked(&key, source, Profile::DirectCopy, Some(self.config.test_duration()))
            .await?;

        let segments_appeared = self.wait_for_segments(&hls_url, self.config.test_wait()).await;

        match self.stop_locked(&key).await {
            Ok(_) | Err(RestreamError::NotActive { .. }) => {}
            Err(e) => warn!("Cleanup of test restream [{}] failed: {}", key, e),
        }

        info!(
            "Test restream finished, segments appeared: {}",
            segments_appeared
        );
        Ok(TestReport {
            key,
            hls_url,
            segments_appeared,
        })
    }

    async fn wait_for_segments(&self, playlist_url: &str, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            match self.http.get(playlist_url).send().await {
                Ok(resp) if resp.status().is_success() => match resp.text().await {
                    Ok(body) if body.contains("#EXTINF") => return true,
                    Ok(_) => debug!("Playlist {} has no segments yet", playlist_url),
                    Err(e) => debug!("Reading playlist {} failed: {}", playlist_url, e),
                },
                Ok(resp) => debug!("Playlist {} returned {}", playlist_url, resp.status()),
                Err(e) => debug!("Fetching playlist {} failed: {}", playlist_url, e),
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(TEST_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        backend: Arc<FakeBackend>,
        supervisor: Supervisor,
    }

    fn fixture(state: ContainerGroupState) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ffmpeg = write_fake_ffmpeg(dir.path());
        let config = RestreamConfig {
            ffmpeg_binary: ffmpeg,
            state_dir: dir.path().join("state"),
            log_dir: dir.path().join("logs"),
            stop_grace_secs: 2,
            test_duration_secs: 2,
            test_wait_secs: 1,
            ..RestreamConfig::default()
        };
        let backend = Arc::new(FakeBackend::new(state));
        let supervisor = Supervisor::new(config, backend.clone());
        Fixture {
            _dir: dir,
            backend,
            supervisor,
        }
    }

    fn write_fake_ffmpeg(dir: &Path) -> String {
        let path = dir.join("ffmpeg");
        std::fs::write(&path, "#!/bin/sh\nsleep 30\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn keys(active: &[ActiveRestream]) -> Vec<&str> {
        active.iter().map(|a| a.handle.key.as_str()).collect()
    }

    #[tokio::test]
    async fn start_then_stop_round_trip() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let active = sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap();
        assert_eq!(active.urls.hls, vec!["http://localhost:8080/hls/cnn_hd.m3u8"]);
        assert_eq!(active.urls.rtmp, "rtmp://localhost:1935/live/cnn_hd");

        assert_eq!(keys(&sup.status().await), vec!["cnn_hd"]);

        let stopped = sup.stop("cnn_hd").await.unwrap();
        assert_eq!(stopped.pid, active.handle.pid);
        assert!(sup.status().await.is_empty());
        assert!(!process::is_running(stopped.pid, &stopped.backend_target));
    }

    #[tokio::test]
    async fn transcoded_start_reports_three_renditions() {
        let f = fixture(ContainerGroupState::Running);
        let active = f
            .supervisor
            .start("cnn_hd", "rtmp://src/cnn", Profile::Transcoded)
            .await
            .unwrap();
        let suffixes: Vec<_> = active
            .urls
            .hls
            .iter()
            .map(|u| u.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(suffixes, vec!["cnn_hd_src.m3u8", "cnn_hd_mid.m3u8", "cnn_hd_low.m3u8"]);
        f.supervisor.stop("cnn_hd").await.unwrap();
    }

    #[tokio::test]
    async fn second_start_is_already_active() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let first = sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap();
        let err = sup
            .start("cnn_hd", "rtmp://src/other", Profile::Transcoded)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_active");

        let status = sup.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].handle.pid, first.handle.pid);
        assert!(process::is_running(first.handle.pid, &first.handle.backend_target));

        sup.stop("cnn_hd").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_for_same_key_leave_one_process() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let (a, b) = tokio::join!(
            sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy),
            sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy),
        );
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert_eq!(sup.status().await.len(), 1);

        sup.stop("cnn_hd").await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let (a, b) = tokio::join!(
            sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy),
            sup.start("bbc_one", "rtmp://src/bbc", Profile::Transcoded),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(keys(&sup.status().await), vec!["bbc_one", "cnn_hd"]);

        sup.stop("cnn_hd").await.unwrap();
        assert_eq!(keys(&sup.status().await), vec!["bbc_one"]);
        sup.stop("bbc_one").await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_handle_is_not_active() {
        let f = fixture(ContainerGroupState::Running);
        let err = f.supervisor.stop("nothing_here").await.unwrap_err();
        assert_eq!(err.kind(), "not_active");
        assert!(f.supervisor.status().await.is_empty());
    }

    #[tokio::test]
    async fn externally_killed_process_is_reconciled() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let active = sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap();
        killpg(Pid::from_raw(active.handle.pid as i32), Signal::SIGKILL).unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(sup.status().await.is_empty());
        assert!(sup.store.get("cnn_hd").is_none());

        let err = sup.stop("cnn_hd").await.unwrap_err();
        assert_eq!(err.kind(), "not_active");

        // 清理后可以重新启动
        sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap();
        sup.stop("cnn_hd").await.unwrap();
    }

    #[tokio::test]
    async fn stopped_backend_blocks_start() {
        let f = fixture(ContainerGroupState::Stopped);
        let sup = &f.supervisor;

        let err = sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap_err();
        assert_eq!(err.kind(), "backend_not_running");
        assert!(sup.store.get("cnn_hd").is_none());
        assert!(!sup.launcher.log_path("cnn_hd").exists());

        f.backend.set_state(ContainerGroupState::Running);
        sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap();
        sup.stop("cnn_hd").await.unwrap();
    }

    #[tokio::test]
    async fn invalid_source_leaves_no_handle() {
        let f = fixture(ContainerGroupState::Running);
        let err = f
            .supervisor
            .start("cnn_hd", "definitely not a url", Profile::DirectCopy)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_source");
        assert!(f.supervisor.status().await.is_empty());
    }

    #[tokio::test]
    async fn keys_must_be_sanitized_and_unreserved() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;
        for key in ["", "CNN HD", "_cnn", "test_stream"] {
            let err = sup.start(key, "rtmp://src/cnn", Profile::DirectCopy).await.unwrap_err();
            assert_eq!(err.kind(), "invalid_key", "accepted {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_probe_always_cleans_up() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let report = sup.test(Some("rtmp://src/test")).await.unwrap();
        assert_eq!(report.key, "test_stream");
        assert_eq!(report.hls_url, "http://localhost:8080/hls/test_stream.m3u8");
        assert!(!report.segments_appeared);
        assert!(!keys(&sup.status().await).contains(&"test_stream"));
    }

    #[tokio::test]
    async fn overlapping_tests_do_not_stop_each_other() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        let (first, second) = tokio::join!(sup.test(Some("rtmp://src/test")), async {
            sleep(Duration::from_millis(300)).await;
            let running = sup.store.get("test_stream").unwrap();
            let (second, ()) = tokio::join!(sup.test(Some("rtmp://src/test")), async {
                sleep(Duration::from_millis(300)).await;
                // 第一个测试仍在等待切片, 进程不能被第二个调用停掉
                assert!(sup.store.is_alive(&running));
            });
            (running, second)
        });
        first.unwrap();
        let (running, second) = second;
        second.unwrap();
        assert!(!sup.store.is_alive(&running));
        assert!(sup.status().await.is_empty());
    }

    #[tokio::test]
    async fn lock_entries_are_released() {
        let f = fixture(ContainerGroupState::Running);
        let sup = &f.supervisor;

        sup.start("cnn_hd", "rtmp://src/cnn", Profile::DirectCopy).await.unwrap();
        sup.start("bbc_one", "rtmp://src/bbc", Profile::DirectCopy).await.unwrap();
        sup.status().await;
        assert_eq!(sup.locks.len(), 0);

        sup.stop("cnn_hd").await.unwrap();
        sup.stop("bbc_one").await.unwrap();
        let _ = sup.stop("never_started").await;
        assert_eq!(sup.locks.len(), 0);
    }

    #[tokio::test]
    async fn failed_test_probe_still_leaves_no_test_key() {
        let f = fixture(ContainerGroupState::Running);
        f.backend.set_reachable(false);

        let err = f.supervisor.test(None).await.unwrap_err();
        assert_eq!(err.kind(), "backend_unreachable");
        assert!(f.supervisor.status().await.is_empty());
    }
}
