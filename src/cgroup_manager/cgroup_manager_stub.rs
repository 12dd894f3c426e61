use std::{
    path::Path,
    process::{Child, ChildStdin, ChildStdout, ExitStatus},
    time::Duration,
};

use anyhow::{self, bail, Context};

use super::{create_process, kill_and_reap, kill_process_group, wait_for_exit};

#[derive(Debug)]
pub struct LimitedProcess {
    child: Child,
    cleaned_up: bool,
}

impl LimitedProcess {
    pub fn launch(
        _command: &Path,
        _args: &[String],
        _max_memory: i64,
        _allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        bail!("cgroups only available on linux")
    }

    pub fn launch_without_container(
        command: &Path,
        args: &[String],
        allow_stderr: bool,
    ) -> anyhow::Result<LimitedProcess> {
        let child =
            create_process(command, args, allow_stderr).context("could not create process")?;

        Ok(LimitedProcess {
            child,
            cleaned_up: false,
        })
    }

    pub fn take_stdio(&mut self) -> Option<(ChildStdin, ChildStdout)> {
        Some((self.child.stdin.take()?, self.child.stdout.take()?))
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn try_wait(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn wait_for_exit(&mut self, max_duration: Duration) -> bool {
        let exited = wait_for_exit(&mut self.child, max_duration);
        if exited {
            let _ = kill_process_group(&self.child);
            self.cleaned_up = true;
        }
        exited
    }

    pub fn try_kill(&mut self, max_duration: Duration) -> anyhow::Result<()> {
        kill_and_reap(&mut self.child, max_duration)?;
        self.cleaned_up = true;
        Ok(())
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
