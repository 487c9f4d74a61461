//! OS process layer - spawning, tree inspection and signalling

use crate::error::SupervisorError;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::Path;
use std::process::Stdio;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::process::{Child, Command};

/// What the OS knows about a PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Exited but not yet reaped
    Zombie,
    Missing,
}

/// Summed usage over a set of processes
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    /// Raw CPU percent, 100 per fully used core
    pub cpu_percent: f32,
    pub rss_bytes: u64,
}

/// Process table access used by the supervisor.
///
/// Reads come from the snapshot taken by the last [`ProcessProbe::refresh`].
pub trait ProcessProbe: Send {
    fn refresh(&mut self);
    fn state(&self, pid: u32) -> ProcessState;
    /// All transitive children of `pid`
    fn descendants(&self, pid: u32) -> Vec<u32>;
    fn usage(&self, pids: &[u32]) -> Usage;
    fn logical_cores(&self) -> usize;
    fn terminate(&mut self, pid: u32);
    fn force_kill(&mut self, pid: u32);
}

/// Builds a fresh probe for every started process
pub type ProbeFactory = std::sync::Arc<dyn Fn() -> Box<dyn ProcessProbe> + Send + Sync>;

/// Factory for the real [`SystemProbe`]
pub fn system_probe_factory() -> ProbeFactory {
    std::sync::Arc::new(|| Box::new(SystemProbe::new()) as Box<dyn ProcessProbe>)
}

/// Probe backed by the host process table.
///
/// CPU usage is measured between two consecutive refreshes, so a probe kept
/// alive across sampling ticks needs no extra measurement window.
pub struct SystemProbe {
    system: System,
    cores: usize,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        let cores = system.cpus().len().max(1);
        Self { system, cores }
    }

    /// Thread ids the kernel lists next to real processes
    fn thread_ids(&self) -> HashSet<Pid> {
        let mut threads = HashSet::new();
        for (pid, process) in self.system.processes() {
            if let Some(tasks) = process.tasks() {
                threads.extend(tasks.iter().copied().filter(|t| t != pid));
            }
        }
        threads
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn refresh(&mut self) {
        self.system.refresh_processes();
    }

    fn state(&self, pid: u32) -> ProcessState {
        match self.system.process(Pid::from_u32(pid)) {
            None => ProcessState::Missing,
            Some(p) if p.status() == ProcessStatus::Zombie => ProcessState::Zombie,
            Some(_) => ProcessState::Alive,
        }
    }

    fn descendants(&self, pid: u32) -> Vec<u32> {
        let threads = self.thread_ids();
        let mut found = Vec::new();
        let mut frontier = vec![Pid::from_u32(pid)];

        while let Some(parent) = frontier.pop() {
            for (child, process) in self.system.processes() {
                if process.parent() == Some(parent)
                    && !threads.contains(child)
                    && !found.contains(&child.as_u32())
                {
                    found.push(child.as_u32());
                    frontier.push(*child);
                }
            }
        }
        found
    }

    fn usage(&self, pids: &[u32]) -> Usage {
        pids.iter()
            .filter_map(|pid| self.system.process(Pid::from_u32(*pid)))
            .fold(Usage::default(), |acc, p| Usage {
                cpu_percent: acc.cpu_percent + p.cpu_usage(),
                rss_bytes: acc.rss_bytes + p.memory(),
            })
    }

    fn logical_cores(&self) -> usize {
        self.cores
    }

    fn terminate(&mut self, pid: u32) {
        send_signal(pid, Signal::SIGTERM);
    }

    fn force_kill(&mut self, pid: u32) {
        send_signal(pid, Signal::SIGKILL);
    }
}

fn send_signal(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        log::warn!("PID {} out of range, cannot send {:?}", pid, signal);
        return;
    };
    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to send {:?} to PID {}: {}", signal, pid, e),
    }
}

/// Spawn `command` with stdout and stderr appended to `log_path`.
///
/// The command is split into words with shell quoting rules, then run
/// directly without a shell. The child gets its own process group so a terminal Ctrl-C aimed at the
/// supervisor does not reach it.
pub fn spawn_logged(command: &str, log_path: &Path) -> Result<Child, SupervisorError> {
    let words = shell_words::split(command).map_err(|source| SupervisorError::Syntax {
        command: command.to_string(),
        source,
    })?;
    let Some((program, args)) = words.split_first() else {
        return Err(SupervisorError::EmptyCommand);
    };

    let log_error = |source| SupervisorError::LogFile {
        path: log_path.to_path_buf(),
        source,
    };
    if let Some(dir) = log_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(log_error)?;
    }
    let stdout = File::create(log_path).map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(false);
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|source| SupervisorError::Spawn {
        command: command.to_string(),
        source,
    })
}

/// Exit code of a finished child; signal deaths map to `128 + signal`
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_logged("   ", &dir.path().join("x.log")).unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_quoted_argument_stays_one_word() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_logged("sh -c 'exit 3'", &dir.path().join("q.log")).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(exit_code_of(status), 3);

        let log_path = dir.path().join("echo.log");
        let mut child = spawn_logged(r#"echo "two  spaces" 'it''s'"#, &log_path).unwrap();
        child.wait().await.unwrap();
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.trim_end(), "two  spaces its");
    }

    #[test]
    fn test_unterminated_quote_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_logged("sh -c 'exit 3", &dir.path().join("u.log")).unwrap_err();
        assert!(matches!(err, SupervisorError::Syntax { .. }));
        assert!(err.is_configuration());
        assert!(!dir.path().join("u.log").exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = spawn_logged(
            "/definitely/not/a/real/interpreter arg",
            &dir.path().join("x.log"),
        )
        .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_output_goes_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("nested").join("7.log");

        let mut child = spawn_logged("echo hello-from-task", &log_path).unwrap();
        let status = child.wait().await.unwrap();

        assert_eq!(exit_code_of(status), 0);
        let content = std::fs::read_to_string(&log_path).unwrap();
        assert!(content.contains("hello-from-task"));
    }

    #[tokio::test]
    async fn test_signal_death_maps_to_128_plus_signal() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_logged("sleep 30", &dir.path().join("s.log")).unwrap();
        let pid = child.id().unwrap();

        SystemProbe::new().force_kill(pid);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit_code_of(status), 137);
    }

    #[tokio::test]
    async fn test_probe_sees_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tree.sh");
        std::fs::write(&script, "sleep 30 &\nsleep 30 &\nwait\n").unwrap();

        let mut child =
            spawn_logged(&format!("sh {}", script.display()), &dir.path().join("t.log")).unwrap();
        let pid = child.id().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut probe = SystemProbe::new();
        probe.refresh();
        let children = probe.descendants(pid);
        assert_eq!(probe.state(pid), ProcessState::Alive);
        assert_eq!(children.len(), 2);
        assert!(probe.usage(&[pid]).rss_bytes > 0);

        for c in children {
            probe.force_kill(c);
        }
        probe.force_kill(pid);
        let _ = child.wait().await;
    }
}
