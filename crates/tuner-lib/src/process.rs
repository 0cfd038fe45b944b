//! OS process plumbing shared by the broker applier and workload coordinator
//!
//! Liveness checks by pid, graceful-then-forced termination of single
//! processes and whole process groups, and TCP port state probes.

use crate::poll::{poll_until, PollOutcome};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Whether a process with this pid currently exists (signal 0 probe)
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Send SIGTERM to a process, escalate to SIGKILL if it survives the grace
/// period. Polls liveness at a fixed sub-interval of the grace period.
pub async fn terminate_pid(pid: u32, grace: Duration) {
    let target = Pid::from_raw(pid as i32);
    if kill(target, Signal::SIGTERM).is_err() {
        // Already gone
        return;
    }

    let attempts = 8;
    let interval = grace / attempts;
    let outcome = poll_until(attempts, interval, || async move { !pid_alive(pid) }).await;

    if outcome == PollOutcome::TimedOut {
        warn!(pid, "process survived SIGTERM grace period, sending SIGKILL");
        let _ = kill(target, Signal::SIGKILL);
    } else {
        debug!(pid, "process exited on SIGTERM");
    }
}

/// Same escalation as [`terminate_pid`], addressed to a whole process group
pub async fn terminate_group(pgid: u32, grace: Duration) {
    let group = Pid::from_raw(pgid as i32);
    if killpg(group, Signal::SIGTERM).is_err() {
        return;
    }

    let attempts = 8;
    let interval = grace / attempts;
    let outcome = poll_until(attempts, interval, || async move {
        killpg(Pid::from_raw(pgid as i32), None).is_err()
    })
    .await;

    if outcome == PollOutcome::TimedOut {
        warn!(pgid, "process group survived SIGTERM, sending SIGKILL");
        let _ = killpg(group, Signal::SIGKILL);
    }
}

/// Whether a TCP port on `host` currently accepts connections
pub async fn port_bound(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            Duration::from_secs(1),
            TcpStream::connect((host, port))
        )
        .await,
        Ok(Ok(_))
    )
}

/// Poll until the port stops accepting connections. Used between broker
/// stop and start to avoid a bind race with the old process.
pub async fn wait_port_released(
    host: &str,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> PollOutcome {
    poll_until(attempts, interval, || async {
        !port_bound(host, port).await
    })
    .await
}

/// Poll until the port accepts connections
pub async fn wait_port_bound(
    host: &str,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> PollOutcome {
    poll_until(attempts, interval, || async { port_bound(host, port).await }).await
}
