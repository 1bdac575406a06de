//! OS process discovery, spawning and termination.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessStatus, System};
use tracing::{debug, info, warn};

use tapedeck_core::Target;

use crate::error::SupervisorError;

/// How long a fresh child must survive to count as started.
const SPAWN_SETTLE: Duration = Duration::from_millis(300);
const POLL_STEP: Duration = Duration::from_millis(100);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(1);

/// A running capture process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Argument following the capture signature.
    pub capture_name: String,
}

/// Everything the supervisor does to the OS. Calls block.
pub trait ProcessControl: Send {
    /// Capture processes currently running.
    fn scan(&mut self) -> Vec<ProcessInfo>;

    /// Start a capture for `target` and return its pid.
    fn spawn(&mut self, target: &Target) -> Result<u32, SupervisorError>;

    /// Signal, wait up to `wait`, then force-kill. Returns whether the
    /// process is gone.
    fn terminate(&mut self, pid: u32, wait: Duration) -> bool;
}

/// Program and arguments used to start a capture.
#[derive(Debug, Clone)]
pub struct SpawnCommand {
    pub program: String,
    /// Placed before the target's capture name.
    pub args: Vec<String>,
    /// Argument identifying a capture process; the next argument is the
    /// capture name.
    pub signature: String,
    pub workdir: Option<PathBuf>,
    pub log_dir: PathBuf,
}

/// Extract the capture name from a command line.
pub fn capture_name_from_cmdline(cmd: &[String], signature: &str) -> Option<String> {
    let pos = cmd
        .iter()
        .position(|arg| arg == signature || arg.ends_with(&format!("/{signature}")))?;
    cmd.get(pos + 1).filter(|name| !name.is_empty()).cloned()
}

/// [`ProcessControl`] backed by `sysinfo` for discovery and `nix` signals.
pub struct OsProcesses {
    system: System,
    command: SpawnCommand,
    /// Children we started, kept so they can be reaped.
    children: HashMap<u32, Child>,
}

impl OsProcesses {
    pub fn new(command: SpawnCommand) -> Self {
        Self {
            system: System::new(),
            command,
            children: HashMap::new(),
        }
    }

    /// Collect exit statuses of our own children so they do not linger as zombies.
    fn reap(&mut self) {
        self.children.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                info!(pid, %status, "capture process exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid, error = %e, "failed to poll child status");
                false
            }
        });
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        if let Some(child) = self.children.get_mut(&pid) {
            return match child.try_wait() {
                Ok(Some(_)) => {
                    self.children.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(_) => false,
            };
        }
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn wait_gone(&mut self, pid: u32, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if !self.is_alive(pid) {
                return true;
            }
            std::thread::sleep(POLL_STEP);
        }
        !self.is_alive(pid)
    }
}

/// Signal the process group led by `pid`, falling back to the process alone.
fn send(pid: u32, sig: Signal) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let pid = Pid::from_raw(raw);
    match killpg(pid, sig) {
        Ok(()) => true,
        Err(_) => kill(pid, sig).is_ok(),
    }
}

impl ProcessControl for OsProcesses {
    fn scan(&mut self) -> Vec<ProcessInfo> {
        self.reap();
        self.system.refresh_processes();
        let own = std::process::id();
        self.system
            .processes()
            .iter()
            .filter(|(pid, p)| pid.as_u32() != own && p.status() != ProcessStatus::Zombie)
            .filter_map(|(pid, p)| {
                let capture_name = capture_name_from_cmdline(p.cmd(), &self.command.signature)?;
                let started_at = Utc
                    .timestamp_opt(p.start_time() as i64, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                Some(ProcessInfo { pid: pid.as_u32(), started_at, capture_name })
            })
            .collect()
    }

    fn spawn(&mut self, target: &Target) -> Result<u32, SupervisorError> {
        let log_path = self
            .command
            .log_dir
            .join(format!("{}_recording.log", target.id));
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg(target.capture_name())
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        if let Some(dir) = &self.command.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group: captures outlive the supervisor and can be
            // signalled as a unit.
            cmd.process_group(0);
        }

        let mut child = cmd.spawn()?;
        std::thread::sleep(SPAWN_SETTLE);
        if let Some(status) = child.try_wait()? {
            return Err(SupervisorError::ExitedImmediately {
                target: target.id.clone(),
                status: status.to_string(),
            });
        }

        let pid = child.id();
        debug!(target = %target.id, pid, log = %log_path.display(), "capture spawned");
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn terminate(&mut self, pid: u32, wait: Duration) -> bool {
        if !send(pid, Signal::SIGTERM) {
            return !self.is_alive(pid);
        }
        if self.wait_gone(pid, wait) {
            return true;
        }
        warn!(pid, "capture ignored SIGTERM, force killing");
        send(pid, Signal::SIGKILL);
        self.wait_gone(pid, FORCE_KILL_WAIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn capture_name_follows_signature() {
        let cmd = args(&["python3", "-u", "/opt/rec/showroom.py", "Hashimoto Haruna"]);
        assert_eq!(
            capture_name_from_cmdline(&cmd, "showroom.py").as_deref(),
            Some("Hashimoto Haruna")
        );
        let cmd = args(&["python3", "showroom.py", "Solo"]);
        assert_eq!(capture_name_from_cmdline(&cmd, "showroom.py").as_deref(), Some("Solo"));
    }

    #[test]
    fn unrelated_commands_do_not_match() {
        assert!(capture_name_from_cmdline(&args(&["vim", "showroom.py.bak"]), "showroom.py").is_none());
        assert!(capture_name_from_cmdline(&args(&["python3", "showroom.py"]), "showroom.py").is_none());
        assert!(capture_name_from_cmdline(
            &args(&["bash", "-c", "python3 showroom.py \"X\""]),
            "showroom.py"
        )
        .is_none());
    }

    #[cfg(unix)]
    #[test]
    fn spawn_and_terminate_a_real_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut os = OsProcesses::new(SpawnCommand {
            program: "sleep".into(),
            args: vec![],
            signature: "sleep".into(),
            workdir: None,
            log_dir: dir.path().to_path_buf(),
        });
        let mut target = Target::new("sleeper", "Sleeper");
        target.naming_override = Some("30".into());

        let pid = os.spawn(&target).unwrap();
        assert!(dir.path().join("sleeper_recording.log").exists());
        assert!(os.terminate(pid, Duration::from_secs(3)));
        assert!(!os.is_alive(pid));
    }

    #[cfg(unix)]
    #[test]
    fn immediate_exit_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut os = OsProcesses::new(SpawnCommand {
            program: "true".into(),
            args: vec![],
            signature: "true".into(),
            workdir: None,
            log_dir: dir.path().to_path_buf(),
        });
        let err = os.spawn(&Target::new("t", "T")).unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedImmediately { .. }));
    }
}
