//! Process trees for programs under test
//!
//! Every program is started as the leader of its own process group so that
//! anything it forks can be torn down with it. Callers only see
//! [`ProcessTree`] and [`terminate_process_tree`]; the platform strategy is
//! picked at build time.

use std::io;
use std::time::Duration;
use tokio::process::{Child, Command};

/// A spawned program together with every process it starts
pub struct ProcessTree {
    child: Child,
    pid: Option<u32>,
    terminated: bool,
}

impl ProcessTree {
    /// Spawn `command` as the root of a new process tree
    pub fn spawn(command: &mut Command) -> io::Result<Self> {
        imp::configure(command);
        let child = command.spawn()?;
        let pid = child.id();
        Ok(Self {
            child,
            pid,
            terminated: false,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Terminate the whole tree and reap its root.
///
/// Gives the tree `grace` to exit after a polite signal before killing it
/// outright. Safe to call after the root has already exited; stragglers
/// left in the tree are still removed.
pub async fn terminate_process_tree(tree: &mut ProcessTree, grace: Duration) -> io::Result<()> {
    tree.terminated = true;
    imp::terminate(&mut tree.child, tree.pid, grace).await
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        // Cannot await here; kill without grace
        if !self.terminated {
            imp::kill_now(&mut self.child, self.pid);
        }
    }
}

#[cfg(unix)]
mod imp {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    use std::io;
    use std::time::Duration;
    use tokio::process::{Child, Command};
    use tracing::{debug, warn};

    pub fn configure(command: &mut Command) {
        command.process_group(0);
    }

    pub async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<()> {
        let Some(pid) = pid else {
            return Ok(());
        };
        let group = Pid::from_raw(pid as i32);

        signal_group(group, Signal::SIGTERM);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(pid, %status, "Process group leader exited"),
            Ok(Err(e)) => warn!(pid, error = %e, "Failed to wait for process group leader"),
            Err(_) => warn!(pid, grace_ms = grace.as_millis() as u64, "Process group ignored SIGTERM, killing"),
        }

        // Descendants may outlive the leader or ignore SIGTERM
        signal_group(group, Signal::SIGKILL);
        child.wait().await?;
        Ok(())
    }

    pub fn kill_now(child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            signal_group(Pid::from_raw(pid as i32), Signal::SIGKILL);
        }
        let _ = child.start_kill();
    }

    fn signal_group(group: Pid, signal: Signal) {
        match killpg(group, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = group.as_raw(), ?signal, error = %e, "Failed to signal process group"),
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::{Child, Command};
    use tracing::{debug, warn};

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub fn configure(command: &mut Command) {
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    pub async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<()> {
        if let Some(pid) = pid {
            let status = Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            match status {
                Ok(status) => debug!(pid, %status, "taskkill finished"),
                Err(e) => warn!(pid, error = %e, "Failed to run taskkill"),
            }
        }

        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            warn!(?pid, "Process did not exit after taskkill, killing directly");
            child.kill().await?;
        }
        Ok(())
    }

    pub fn kill_now(child: &mut Child, pid: Option<u32>) {
        if let Some(pid) = pid {
            let _ = std::process::Command::new("taskkill")
                .args(["/T", "/F", "/PID", &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
        }
        let _ = child.start_kill();
    }
}
