//! Process-group signal helpers.
//!
//! Children run in their own process group (`Command::process_group(0)`), so
//! signalling the negative PID reaches the whole tree.

use std::time::Duration;

/// SIGKILL the whole process group. Used by cancellation, where immediate
/// termination is the correctness requirement.
pub fn kill_group(pid: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: plain syscall on a PID we spawned; delivery to an already-dead
    // group fails with ESRCH which we ignore.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

/// Whether a process with this PID currently exists (signal 0 probe).
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Gentle stop for components that can afford to wait: SIGTERM the group,
/// give the main PID up to 10 s to exit, then SIGKILL the group.
pub async fn graceful_kill(pid: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: see kill_group.
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    kill_group(pid);
}
