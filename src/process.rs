//! 进程存活检测与终止
//!
//! 转推进程由 launcher 以进程组组长身份启动, 因此 pid 同时是进程组号,
//! 终止时对整个进程组发送信号。

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::Duration;
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(1);

/// 终止结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// 发送信号前进程已不存在
    AlreadyGone,
    /// SIGTERM 宽限期内退出
    Graceful,
    /// 宽限期超时后被 SIGKILL
    Forced,
    /// SIGKILL 之后仍然存在
    Survived,
}

fn to_nix_pid(pid: u32) -> Option<Pid> {
    // pid 0 / 负数会把信号发给调用者自己的进程组
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(Pid::from_raw(pid as i32))
}

/// 如果是本进程已退出的子进程则回收它, 返回 true
fn reap_if_exited(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(status) => {
            debug!("Reaped child {}: {:?}", pid, status);
            true
        }
        // ECHILD: 不是本进程的子进程 (例如来自上一次 CLI 调用)
        Err(_) => false,
    }
}

/// 查询进程表; None 表示进程不存在或已是僵尸
fn query_cmdline(pid: u32) -> Option<Vec<String>> {
    let mut sys = System::new();
    let sys_pid = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
    );
    let process = sys.process(sys_pid)?;
    if process.status() == ProcessStatus::Zombie {
        trace!("Process {} is a zombie", pid);
        return None;
    }
    Some(
        process
            .cmd()
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect(),
    )
}

fn exists(pid: Pid) -> bool {
    if reap_if_exited(pid) {
        return false;
    }
    kill(pid, None).is_ok()
}

/// 判断 pid 是否仍是我们启动的转推进程
///
/// 命令行可读时必须有一个参数与 `marker` (推流目标地址) 完全相等, 否则视为 pid 已被复用。
/// 子串匹配会让 `live/cnn` 误认 `live/cnn_hd` 的进程。
/// 命令行不可读 (权限或平台限制) 时只依据进程是否存在。
pub fn is_running(pid: u32, marker: &str) -> bool {
    let Some(nix_pid) = to_nix_pid(pid) else {
        return false;
    };
    if !exists(nix_pid) {
        trace!("Process {} does not exist", pid);
        return false;
    }
    let Some(cmdline) = query_cmdline(pid) else {
        return false;
    };
    if cmdline.is_empty() {
        return true;
    }
    let matches = cmdline.iter().any(|arg| arg.as_str() == marker);
    if !matches {
        debug!(
            "Process {} command line does not reference {}, treating pid as reused",
            pid, marker
        );
    }
    matches
}

fn is_gone(pid: Pid) -> bool {
    !exists(pid) || query_cmdline(pid.as_raw() as u32).is_none()
}

fn signal_group(pid: Pid, signal: Signal) -> Result<(), Errno> {
    match killpg(pid, signal) {
        Ok(()) => Ok(()),
        // 进程不是组长时退回到单个进程
        Err(_) => kill(pid, signal),
    }
}

/// 立即 SIGKILL 整个进程组, 不等待退出
pub fn kill_group(pid: u32) -> Result<(), Errno> {
    match to_nix_pid(pid) {
        Some(nix_pid) => signal_group(nix_pid, Signal::SIGKILL),
        None => Ok(()),
    }
}

async fn wait_until_gone(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if is_gone(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// 先 SIGTERM, 宽限期后 SIGKILL; 整个过程有界
pub async fn terminate(pid: u32, grace: Duration) -> Termination {
    let Some(nix_pid) = to_nix_pid(pid) else {
        return Termination::AlreadyGone;
    };
    if is_gone(nix_pid) {
        return Termination::AlreadyGone;
    }

    debug!("Sending SIGTERM to process group {}", pid);
    if let Err(e) = signal_group(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Termination::AlreadyGone;
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    if wait_until_gone(nix_pid, grace).await {
        return Termination::Graceful;
    }

    warn!(
        "Process group {} did not exit within {}s, sending SIGKILL",
        pid,
        grace.as_secs()
    );
    if let Err(e) = signal_group(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Termination::Forced;
        }
        warn!("Failed to send SIGKILL to {}: {}", pid, e);
    }

    if wait_until_gone(nix_pid, KILL_WAIT).await {
        Termination::Forced
    } else {
        Termination::Survived
    }
}
