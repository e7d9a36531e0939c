//! Process management - owning, stopping and finding server processes

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Sole owner of one spawned OS process
///
/// [`ProcessHandle::terminate`] is the orderly way out. Dropping a handle that
/// was never terminated still sends SIGKILL so no process outlives its owner.
pub struct ProcessHandle {
    label: String,
    pid: u32,
    child: Child,
    reaped: bool,
}

impl ProcessHandle {
    /// Spawn `command`, tagging the handle with `label` for logs.
    pub fn spawn(label: impl Into<String>, command: &mut Command) -> HarnessResult<Self> {
        let label = label.into();
        command.kill_on_drop(true);

        let child = command.spawn().map_err(|e| HarnessError::Spawn {
            what: label.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id().ok_or_else(|| HarnessError::Spawn {
            what: label.clone(),
            reason: "process exited before its pid was read".to_string(),
        })?;

        info!("Started {} (pid: {})", label, pid);
        Ok(Self {
            label,
            pid,
            child,
            reaped: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True once the process has exited and been reaped.
    pub fn has_exited(&mut self) -> bool {
        if !self.reaped {
            if let Ok(Some(_)) = self.child.try_wait() {
                self.reaped = true;
            }
        }
        self.reaped
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps the process.
    pub async fn terminate(&mut self, grace: Duration) -> HarnessResult<()> {
        if self.has_exited() {
            debug!("{} (pid: {}) already exited", self.label, self.pid);
            return Ok(());
        }

        info!("Stopping {} (pid: {})", self.label, self.pid);
        let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM);

        match timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!("{} exited with {}", self.label, status);
            }
            Err(_) => {
                warn!(
                    "{} (pid: {}) still running after {:?}, killing",
                    self.label, self.pid, grace
                );
                self.child.kill().await?;
            }
        }

        self.reaped = true;
        info!("{} stopped", self.label);
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.start_kill();
        }
    }
}

/// True while `pid` names a live (or not yet reaped) process.
pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// True if a process with exactly this name is running.
pub async fn process_running(name: &str) -> bool {
    match Command::new("pgrep")
        .args(["-x", name])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
    {
        Ok(output) => {
            output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty()
        }
        Err(e) => {
            warn!("pgrep unavailable: {}", e);
            false
        }
    }
}

/// Poll [`process_running`] until it succeeds or `budget` elapses.
pub async fn wait_for_process(name: &str, budget: Duration, poll: Duration) -> bool {
    let start = Instant::now();
    loop {
        if process_running(name).await {
            return true;
        }
        if start.elapsed() >= budget {
            return false;
        }
        sleep(poll).await;
    }
}

/// Name the kernel reports for a process started from `program`.
pub fn process_name(program: impl AsRef<Path>) -> String {
    let program = program.as_ref();
    program
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string_lossy().to_string())
}

/// How `pkill` selects the processes it signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessMatch {
    /// Process name equals the pattern
    ExactName,
    /// Process name contains the pattern, so `php-fpm` also hits `php-fpm8.2`
    Name,
    /// Full command line contains the pattern
    CommandLine,
}

/// Arguments for `pkill`, SIGKILL when `force`.
pub fn pkill_args(pattern: &str, matching: ProcessMatch, force: bool) -> Vec<String> {
    let mut args = Vec::new();
    if force {
        args.push("-9".to_string());
    }
    match matching {
        ProcessMatch::ExactName => args.push("-x".to_string()),
        ProcessMatch::Name => {}
        ProcessMatch::CommandLine => args.push("-f".to_string()),
    }
    args.push(pattern.to_string());
    args
}

/// Signal every process matching `pattern`. No match is not an error.
pub async fn kill_processes(pattern: &str, matching: ProcessMatch, force: bool) {
    let args = pkill_args(pattern, matching, force);
    let result = Command::new("pkill")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        warn!("pkill {:?} failed: {}", args, e);
    }
}
