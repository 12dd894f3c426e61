use std::{
    path::Path,
    process::{Child, ChildStdin, ChildStdout, ExitStatus},
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use anyhow::{self, Context};
use cgroups_rs::Cgroup;

use super::{create_process, kill_and_reap, kill_process_group, wait_for_exit};

/// Engines may spawn helper threads, not process trees.
const MAX_PIDS: i64 = 100;

fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("could not launch 'id -u'")?;
    let untrimmed_id = std::str::from_utf8(&output.stdout).context("id is not a valid string")?;
    Ok(untrimmed_id.trim().to_string())
}

fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path` with a hard memory limit in bytes (non-positive means none).
fn create_cgroup(path: &str, max_memory: i64) -> anyhow::Result<Cgroup> {
    let mut builder = cgroups_rs::cgroup_builder::CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder.memory().memory_hard_limit(max_memory).done();
    }
    builder
        .pid()
        .maximum_number_of_processes(cgroups_rs::MaxValue::Value(MAX_PIDS))
        .done()
        .build(cgroups_rs::hierarchies::auto())
        .context("could not create cgroup")
}

fn wait_for_cgroup_cleanup(cgroup: &Cgroup, pid: u64, max_duration: Duration) -> anyhow::Result<()> {
    let deadline = Instant::now() + max_duration;
    while cgroup.tasks().iter().any(|cpid| cpid.pid == pid) {
        if Instant::now() > deadline {
            anyhow::bail!("process {pid} still in its cgroup after {max_duration:?}");
        }
        std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
    }
    Ok(())
}

fn create_process_in_cgroup(
    command: &Path,
    args: &[String],
    group: &Cgroup,
    allow_stderr: bool,
) -> anyhow::Result<Child> {
    let mut child = create_process(command, args, allow_stderr)?;

    let pid = child.id() as u64;
    if let Err(addition) = group.add_task_by_tgid(cgroups_rs::CgroupPid { pid }) {
        let kill = child.kill();
        let _ = child.wait();
        return Err(addition).with_context(|| match kill {
            Err(err) => format!(
                "could not add process to cgroup, and process could not be killed either ({err})"
            ),
            Ok(()) => "could not add process to cgroup".to_string(),
        });
    }
    Ok(child)
}

/// An engine process, optionally confined to its own cgroup.
pub struct LimitedProcess {
    child: Child,
    cgroup: Option<Cgroup>,
    cleaned_up: bool,
}

impl std::fmt::Debug for LimitedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedProcess")
            .field("pid", &self.child.id())
            .field("cgroup", &self.cgroup.as_ref().map(Cgroup::path))
            .field("cleaned_up", &self.cleaned_up)
            .finish()
    }
}

impl LimitedProcess {
    /// Launch `command` inside a fresh cgroup limited to `max_memory` bytes, or unlimited when
    /// `max_memory` is not positive.
    pub fn launch(
        command: &Path,
        args: &[String],
        max_memory: i64,
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        static COUNTER: AtomicU32 = AtomicU32::new(1);
        let user_id = get_current_user_id().context("could not get user id")?;
        let group_name = format!(
            "ENGINETEST_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = get_cgroup_path(&user_id, &group_name);
        let group = create_cgroup(&path, max_memory).context("could not create cgroup")?;
        let child = match create_process_in_cgroup(command, args, &group, allow_stderr) {
            Ok(child) => child,
            Err(e) => {
                let _ = group.delete();
                return Err(e.context("could not create process in cgroup"));
            }
        };

        Ok(LimitedProcess {
            child,
            cgroup: Some(group),
            cleaned_up: false,
        })
    }

    /// Launch `command` with no limits. Only its process group holds it together.
    pub fn launch_without_container(
        command: &Path,
        args: &[String],
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        let child =
            create_process(command, args, allow_stderr).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cgroup: None,
            cleaned_up: false,
        })
    }

    /// Hand over the pipes. `None` once taken.
    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        Some((self.child.stdin.take()?, self.child.stdout.take()?))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Wait for a voluntary exit. Returns whether the process is gone.
    ///
    /// Whatever the engine left running is killed.
    pub fn wait_for_exit(&mut self, max_duration: Duration) -> bool {
        if !wait_for_exit(&mut self.child, max_duration) {
            return false;
        }
        let _ = kill_process_group(&self.child);
        if let Some(cgroup) = &self.cgroup {
            let _ = cgroup.kill();
        }
        self.delete_cgroup();
        self.cleaned_up = true;
        true
    }

    /// Kill the process and everything it spawned.
    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        match &self.cgroup {
            Some(cgroup) => {
                // helpers forked before the move into the cgroup are only in the group
                match cgroup.kill() {
                    Ok(()) => {
                        let _ = kill_process_group(&self.child);
                        wait_for_cgroup_cleanup(cgroup, self.child.id() as u64, max_duration)
                            .context("process cleanup timed out")?;
                        let _ = self.child.wait();
                    }
                    Err(e) => {
                        tracing::debug!("cgroup.kill unavailable, killing the process group: {e}");
                        kill_and_reap(&mut self.child, max_duration)?;
                    }
                }
                self.delete_cgroup();
            }
            None => kill_and_reap(&mut self.child, max_duration)?,
        }
        self.cleaned_up = true;
        Ok(())
    }

    fn delete_cgroup(&mut self) {
        if let Some(cgroup) = self.cgroup.take() {
            if let Err(e) = cgroup.delete() {
                tracing::warn!(
                    "failed to remove cgroup {}. If this happens a lot, it may slow down the computer. {e}",
                    cgroup.path()
                );
            }
        }
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        static CLEANUP_DURATION: Duration = Duration::from_secs(1);
        if !self.cleaned_up {
            if let Err(e) = self.try_kill(CLEANUP_DURATION) {
                tracing::error!("could not kill process {} on drop: {e:#}", self.child.id());
            }
        }
    }
}
