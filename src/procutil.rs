//! Shared child-process teardown helpers.
//!
//! Every long-lived or one-shot child this worker spawns — the patched CLI
//! host (§4.B) and the one-shot backtest CLI (§4.C Mode 2) — is started as
//! its own process-group leader (`process_group(0)`), the same pattern the
//! teacher's `dispatch/cli.rs` uses via its `ProcessGroupGuard`: killing the
//! negative PID reaches grandchildren a plain `Child::kill()` would orphan.
//! This module generalizes that one-shot guard into the "terminate politely,
//! escalate to kill" sequence §4.B/§4.G both specify.

use std::time::Duration;

use tokio::process::{Child, Command};

/// Spawn `cmd` as the leader of its own process group, with piped stdio.
/// Centralizes the `process_group(0)` + piped-stdio setup every spawn site
/// in this crate needs, so no call site can forget it.
pub fn configure_child(cmd: &mut Command) {
    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .process_group(0);
}

/// Politely terminate `child` (SIGTERM to its process group), waiting up to
/// `term_grace`; if it hasn't exited by then, SIGKILL the group and wait up
/// to `kill_grace`. Returns `true` if the child was reaped by either stage.
pub async fn terminate_then_kill(
    child: &mut Child,
    term_grace: Duration,
    kill_grace: Duration,
) -> bool {
    let Some(pid) = child.id() else {
        // Already reaped (no pid — process exited and was waited on already).
        return true;
    };

    signal_group(pid, libc::SIGTERM);
    if tokio::time::timeout(term_grace, child.wait()).await.is_ok() {
        return true;
    }

    signal_group(pid, libc::SIGKILL);
    tokio::time::timeout(kill_grace, child.wait()).await.is_ok()
}

/// Send a signal to the process group led by `pid` (i.e. `kill(-pid, sig)`),
/// matching the teacher's `ProcessGroupGuard::drop` semantics.
pub fn signal_group(pid: u32, signal: i32) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}
