//! Engine process launching, with optional cgroup v2 memory containment on Linux.
//!
//! Every engine leads its own process group. Killing an engine kills the group (and the cgroup
//! when there is one), so helper processes an engine spawned die with it.

#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

use std::{
    path::Path,
    process::{Child, Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

/// Spawn `command` with piped stdin/stdout, the channel of the UCI protocol.
fn create_process(command: &Path, args: &[String], allow_stderr: bool) -> anyhow::Result<Child> {
    let mut cmd = Command::new(command);
    cmd.args(args).stdin(Stdio::piped()).stdout(Stdio::piped());
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    if !allow_stderr {
        cmd.stderr(Stdio::null());
    }
    cmd.spawn()
        .with_context(|| format!("could not launch '{}'", command.display()))
}

/// Poll `child` until it exits or `max_duration` elapses. Returns whether it exited.
fn wait_for_exit(child: &mut Child, max_duration: Duration) -> bool {
    let deadline = Instant::now() + max_duration;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return false,
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10).min(max_duration / 10).max(Duration::from_millis(1)));
    }
}

/// SIGKILL every process of the group led by `child`.
///
/// Fails when the group is already empty. The group id stays reserved while any member lives,
/// so this never hits an unrelated process.
#[cfg(unix)]
fn kill_process_group(child: &Child) -> anyhow::Result<()> {
    let status = Command::new("sh")
        .arg("-c")
        .arg(format!("kill -s KILL -- -{}", child.id()))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("could not launch 'kill'")?;
    if !status.success() {
        bail!("no process left in group {}", child.id());
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) -> anyhow::Result<()> {
    Ok(())
}

/// Kill `child` with its whole process group and reap it, waiting at most `max_duration`.
fn kill_and_reap(child: &mut Child, max_duration: Duration) -> anyhow::Result<()> {
    let _ = kill_process_group(child);
    if let Ok(Some(_)) = child.try_wait() {
        return Ok(());
    }
    child.kill().context("could not kill process")?;
    if wait_for_exit(child, max_duration) {
        Ok(())
    } else {
        bail!("process {} still running after kill", child.id())
    }
}
