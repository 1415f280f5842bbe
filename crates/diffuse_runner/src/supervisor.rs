//! Backend process supervisor.
//!
//! Owns the single backend child process. The supervisor itself is plain
//! state mutated by one owner; everything it observes from the child (first
//! output, complete lines, exit) is sent as a [`SupervisorEvent`] on the
//! channel handed to [`ProcessSupervisor::new`]. Events carry the run id of
//! the process that produced them so stale events can be discarded.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::LaunchConfig;
use crate::error::{LaunchError, RunnerError, RunnerResult};
use crate::lines::LineReassembler;

const READ_CHUNK: usize = 4096;
#[cfg(unix)]
const GROUP_POLL: Duration = Duration::from_millis(100);

/// Lifecycle of the backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessLifecycleState {
    /// No launch script configured
    NotConfigured,
    /// Configured and stopped
    ReadyToStart,
    /// Spawned, no output seen yet
    Launching,
    /// Running and producing output
    Active,
    /// Stop requested, waiting for exit
    Terminating,
}

impl ProcessLifecycleState {
    /// Whether a child process currently exists.
    pub fn has_process(&self) -> bool {
        matches!(self, Self::Launching | Self::Active | Self::Terminating)
    }
}

impl std::fmt::Display for ProcessLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotConfigured => "not-configured",
            Self::ReadyToStart => "ready-to-start",
            Self::Launching => "launching",
            Self::Active => "active",
            Self::Terminating => "terminating",
        };
        write!(f, "{}", name)
    }
}

/// Log stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A complete line of backend output.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

/// Something observed about a running backend process.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// First bytes were read from either output stream.
    OutputStarted { run: u64 },
    /// A complete line (or the final partial line at teardown).
    Line { run: u64, line: LogLine },
    /// The process exited.
    Exited {
        run: u64,
        code: Option<i32>,
        requested: bool,
    },
}

impl SupervisorEvent {
    pub fn run(&self) -> u64 {
        match self {
            Self::OutputStarted { run } | Self::Line { run, .. } | Self::Exited { run, .. } => *run,
        }
    }
}

/// Outcome of a process exit as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// True when the process exited without being asked to.
    pub crashed: bool,
}

/// Supervises the single backend process.
pub struct ProcessSupervisor {
    config: LaunchConfig,
    state: ProcessLifecycleState,
    run_id: u64,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    last_exit: Option<ExitReport>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state)
            .field("run_id", &self.run_id)
            .field("pid", &self.pid)
            .field("executable", &self.config.executable)
            .finish()
    }
}

impl ProcessSupervisor {
    /// Create a supervisor. Events from child processes go to `events`.
    pub fn new(config: LaunchConfig, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        let state = if config.executable.is_some() {
            ProcessLifecycleState::ReadyToStart
        } else {
            ProcessLifecycleState::NotConfigured
        };

        Self {
            config,
            state,
            run_id: 0,
            pid: None,
            kill_tx: None,
            events,
            last_exit: None,
        }
    }

    pub fn state(&self) -> ProcessLifecycleState {
        self.state
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> Option<&Path> {
        self.config.executable.as_deref()
    }

    /// Exit report of the most recent run, if it has ended.
    pub fn last_exit(&self) -> Option<ExitReport> {
        self.last_exit
    }

    /// Whether an event belongs to the process currently supervised.
    pub fn is_current(&self, run: u64) -> bool {
        run == self.run_id && self.state.has_process()
    }

    /// Launch the backend. `executable` overrides the configured script.
    ///
    /// Returns the run id of the new process.
    pub fn start(&mut self, executable: Option<PathBuf>) -> RunnerResult<u64> {
        if self.state.has_process() {
            warn!("Start requested while backend is {}, ignoring", self.state);
            return Err(RunnerError::AlreadyRunning);
        }

        if let Some(path) = executable {
            self.config.executable = Some(path);
        }

        let path = match validate_executable(self.config.executable.as_deref()) {
            Ok(path) => path,
            Err(e) => {
                if self.config.executable.as_ref().is_some_and(|p| !p.as_os_str().is_empty()) {
                    self.state = ProcessLifecycleState::ReadyToStart;
                }
                warn!("Backend launch rejected: {}", e);
                return Err(e.into());
            }
        };

        let mut cmd = Command::new(&path);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so terminate reaches the Python children too.
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = self.config.working_dir_for(&path) {
            cmd.current_dir(dir);
        }

        debug!("Spawning backend: {} {:?}", path.display(), self.config.args);

        let mut child = cmd.spawn().map_err(|e| {
            self.state = ProcessLifecycleState::ReadyToStart;
            LaunchError::Spawn {
                path: path.clone(),
                message: e.to_string(),
            }
        })?;

        self.run_id += 1;
        let run = self.run_id;
        self.pid = child.id();
        self.last_exit = None;
        self.state = ProcessLifecycleState::Launching;

        let started = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_stream(
                stdout,
                LogStream::Stdout,
                run,
                started.clone(),
                self.events.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_stream(
                stderr,
                LogStream::Stderr,
                run,
                started,
                self.events.clone(),
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_tx = Some(kill_tx);
        tokio::spawn(wait_for_exit(
            child,
            kill_rx,
            readers,
            Duration::from_millis(self.config.drain_timeout_ms),
            Duration::from_millis(self.config.stop_timeout_ms),
            run,
            self.events.clone(),
        ));

        info!("Backend launching (run {}, pid {:?})", run, self.pid);
        Ok(run)
    }

    /// Record that the process is confirmed running. Returns true on the
    /// `launching -> active` transition.
    pub fn mark_active(&mut self, run: u64) -> bool {
        if run == self.run_id && self.state == ProcessLifecycleState::Launching {
            self.state = ProcessLifecycleState::Active;
            info!("Backend active (run {})", run);
            true
        } else {
            false
        }
    }

    /// Ask the process to stop. No-op unless a launching or active process
    /// exists. Returns true if a stop signal was sent.
    pub fn terminate(&mut self) -> bool {
        if !matches!(
            self.state,
            ProcessLifecycleState::Launching | ProcessLifecycleState::Active
        ) {
            debug!("Terminate ignored while backend is {}", self.state);
            return false;
        }

        self.state = ProcessLifecycleState::Terminating;
        if let Some(kill_tx) = self.kill_tx.take() {
            // The waiter may already be gone if the process just exited.
            let _ = kill_tx.send(());
        }
        info!("Backend terminating (run {})", self.run_id);
        true
    }

    /// Apply an exit event. Returns `None` for events of an older run.
    pub fn on_exit(&mut self, run: u64, code: Option<i32>, requested: bool) -> Option<ExitReport> {
        if !self.is_current(run) {
            debug!("Ignoring exit of stale run {}", run);
            return None;
        }

        let crashed = !requested && self.state != ProcessLifecycleState::Terminating;
        let report = ExitReport { code, crashed };

        if crashed {
            warn!("Backend exited unexpectedly (code {:?})", code);
        } else {
            info!("Backend stopped (code {:?})", code);
        }

        self.state = ProcessLifecycleState::ReadyToStart;
        self.pid = None;
        self.kill_tx = None;
        self.last_exit = Some(report);
        Some(report)
    }
}

/// Check that `path` names an existing executable file.
///
/// Returns the path made absolute against the current directory, since the
/// child runs with the script's parent as its working directory.
pub fn validate_executable(path: Option<&Path>) -> Result<PathBuf, LaunchError> {
    let path = match path {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => return Err(LaunchError::EmptyPath),
    };

    let metadata =
        std::fs::metadata(path).map_err(|_| LaunchError::NotFound(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(LaunchError::NotExecutable(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::NotExecutable(path.to_path_buf()));
        }
    }

    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|_| LaunchError::NotFound(path.to_path_buf()))
}

/// Read raw chunks from one output stream and forward complete lines.
async fn pump_stream<R>(
    mut reader: R,
    stream: LogStream,
    run: u64,
    started: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = LineReassembler::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("Failed reading backend {}: {}", stream, e);
                break;
            }
        };

        if !started.swap(true, Ordering::SeqCst) {
            let _ = events.send(SupervisorEvent::OutputStarted { run });
        }

        for message in lines.push(&buf[..n]) {
            if !forward_line(&events, run, stream, message) {
                return;
            }
        }
    }

    if let Some(rest) = lines.finish() {
        forward_line(&events, run, stream, rest);
    }
}

fn forward_line(
    events: &mpsc::UnboundedSender<SupervisorEvent>,
    run: u64,
    stream: LogStream,
    message: String,
) -> bool {
    trace!(target: "diffuse::backend", stream = %stream, "{}", message);
    events
        .send(SupervisorEvent::Line {
            run,
            line: LogLine {
                timestamp: Utc::now(),
                stream,
                message,
            },
        })
        .is_ok()
}

/// Wait for the child to exit (or stop it on request), drain the readers,
/// then report the exit.
async fn wait_for_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
    stop_timeout: Duration,
    run: u64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        _ = kill_rx => (stop_process(&mut child, stop_timeout).await, true),
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!("Failed to wait for backend: {}", e);
            None
        }
    };

    // Lines already read must reach the owner before the exit does.
    for reader in readers {
        if tokio::time::timeout(drain_timeout, reader).await.is_err() {
            debug!("Output reader still open after exit, not waiting further");
        }
    }

    let _ = events.send(SupervisorEvent::Exited {
        run,
        code,
        requested,
    });
}

/// SIGTERM the child's process group, then SIGKILL whatever is left once
/// `grace` runs out. Returns the exit status of the child itself.
#[cfg(unix)]
async fn stop_process(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        // Already reaped.
        return child.wait().await;
    };
    let group = Pid::from_raw(pid);

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!("SIGTERM to process group {} failed: {}", pid, e);
    }

    let deadline = tokio::time::Instant::now() + grace;
    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Backend ignored SIGTERM for {:?}, sending SIGKILL", grace);
            let _ = killpg(group, Signal::SIGKILL);
            return child.wait().await;
        }
    };

    // The script is gone; give its children the rest of the grace period.
    while killpg(group, None::<Signal>).is_ok() {
        if tokio::time::Instant::now() >= deadline {
            warn!("Backend process group {} still alive, sending SIGKILL", pid);
            let _ = killpg(group, Signal::SIGKILL);
            break;
        }
        tokio::time::sleep(GROUP_POLL).await;
    }

    status
}

#[cfg(not(unix))]
async fn stop_process(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        warn!("Failed to signal backend: {}", e);
    }
    child.wait().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_follows_config() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(LaunchConfig::new(), tx.clone());
        assert_eq!(supervisor.state(), ProcessLifecycleState::NotConfigured);

        let supervisor = ProcessSupervisor::new(LaunchConfig::new().executable("/bin/sh"), tx);
        assert_eq!(supervisor.state(), ProcessLifecycleState::ReadyToStart);
    }

    #[test]
    fn test_validate_rejects_empty_and_missing() {
        assert_eq!(validate_executable(None), Err(LaunchError::EmptyPath));
        assert_eq!(validate_executable(Some(Path::new(""))), Err(LaunchError::EmptyPath));
        assert_eq!(
            validate_executable(Some(Path::new("/definitely/not/here.sh"))),
            Err(LaunchError::NotFound(PathBuf::from("/definitely/not/here.sh")))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_returns_absolute_path() {
        use std::os::unix::fs::PermissionsExt;

        let cwd = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir_in(&cwd).unwrap();
        let script = dir.path().join("webui.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let relative = script.strip_prefix(&cwd).unwrap();
        assert!(relative.is_relative());
        assert_eq!(validate_executable(Some(relative)), Ok(script.clone()));
        assert_eq!(validate_executable(Some(script.as_path())), Ok(script.clone()));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_rejects_non_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("webui.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        assert_eq!(
            validate_executable(Some(script.as_path())),
            Err(LaunchError::NotExecutable(script.clone()))
        );
        assert_eq!(
            validate_executable(Some(dir.path())),
            Err(LaunchError::NotExecutable(dir.path().to_path_buf()))
        );
    }

    #[test]
    fn test_terminate_is_noop_when_stopped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(LaunchConfig::new().executable("/bin/sh"), tx);

        assert!(!supervisor.terminate());
        assert_eq!(supervisor.state(), ProcessLifecycleState::ReadyToStart);
    }

    #[test]
    fn test_failed_launch_keeps_ready_state() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut supervisor = ProcessSupervisor::new(LaunchConfig::new(), tx);

        let err = supervisor
            .start(Some(PathBuf::from("/definitely/not/here.sh")))
            .unwrap_err();
        assert!(matches!(err, RunnerError::Launch(LaunchError::NotFound(_))));
        assert_eq!(supervisor.state(), ProcessLifecycleState::ReadyToStart);
        assert_eq!(supervisor.run_id(), 0);
    }
}
