//! Controller side of one worker interpreter session: the child process, its IPC connection and
//! the readers that copy its raw stdout/stderr into the console feed.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

#[cfg(target_family = "unix")]
use std::os::unix::process::CommandExt;

use crate::console::{ConsoleChannel, StreamMultiplexer};
use crate::event_log::{self, DebugRecord};
#[cfg(target_family = "unix")]
use crate::ipc::{IPC_READ_FD_ENV, IPC_WRITE_FD_ENV};
use crate::ipc::{
    ControllerIpcConnection, ControllerToWorkerMessage, IpcServer, IpcWaitError, StreamHandler,
};
use crate::worker_protocol::{CLASS_PATH_ENV, EvalReply, WORKER_MODE_ARG, WorkerInfo};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const SIGTERM_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error("worker response timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("worker failed to start: {0}")]
    Startup(String),
    #[error("worker sessions are unsupported on this platform")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    Resetting,
    Dead,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Resetting => "resetting",
            SessionState::Dead => "dead",
        };
        f.write_str(name)
    }
}

/// Everything needed to start one session. Fixed for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub class_path: Vec<PathBuf>,
    pub startup_timeout: Duration,
}

pub struct WorkerSession {
    process: WorkerProcess,
    ipc: ControllerIpcConnection,
    info: WorkerInfo,
    generation: u64,
    working_dir: PathBuf,
    class_path: Vec<PathBuf>,
    state: SessionState,
    next_request_id: u64,
    in_flight: Option<u64>,
}

impl WorkerSession {
    /// Spawns the worker and blocks until it reports `Ready` or `startup_timeout` elapses.
    pub fn start(
        config: &SessionConfig,
        generation: u64,
        feed: StreamMultiplexer,
    ) -> Result<Self, WorkerError> {
        let (process, ipc) = WorkerProcess::spawn(config, feed)?;
        let info = match ipc.wait_for_ready(config.startup_timeout) {
            Ok(info) => info,
            Err(err) => {
                let reason = match err {
                    IpcWaitError::Timeout => format!(
                        "worker did not become ready within {} ms",
                        config.startup_timeout.as_millis()
                    ),
                    IpcWaitError::SessionEnd | IpcWaitError::Disconnected => {
                        "worker exited before becoming ready".to_string()
                    }
                };
                let _ = process.kill();
                return Err(WorkerError::Startup(reason));
            }
        };
        tracing::debug!(
            pid = info.pid,
            generation,
            working_dir = %info.working_dir.display(),
            "worker session ready"
        );
        event_log::record(DebugRecord::WorkerReady {
            worker_pid: info.pid,
            generation,
            working_dir: info.working_dir.clone(),
        });
        Ok(Self {
            process,
            ipc,
            info,
            generation,
            working_dir: config.working_dir.clone(),
            class_path: config.class_path.clone(),
            state: SessionState::Ready,
            next_request_id: 1,
            in_flight: None,
        })
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn class_path(&self) -> &[PathBuf] {
        &self.class_path
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    /// Sends one `Evaluate`. A session accepts a single request at a time.
    pub fn send_evaluate(&mut self, text: &str) -> Result<u64, WorkerError> {
        if self.in_flight.is_some() {
            return Err(WorkerError::Protocol(
                "a request is already in flight".to_string(),
            ));
        }
        let id = self.next_request_id;
        self.next_request_id += 1;
        self.ipc
            .send(ControllerToWorkerMessage::Evaluate {
                id,
                text: text.to_string(),
            })
            .map_err(|err| WorkerError::Protocol(err.to_string()))?;
        self.in_flight = Some(id);
        self.state = SessionState::Busy;
        Ok(id)
    }

    /// Waits up to `timeout` for the in-flight reply. `Ok(None)` means nothing arrived yet.
    pub fn poll_reply(&mut self, timeout: Duration) -> Result<Option<EvalReply>, WorkerError> {
        let Some(id) = self.in_flight else {
            return Ok(None);
        };
        match self.ipc.wait_for_reply(id, timeout) {
            Ok(reply) => {
                self.in_flight = None;
                self.state = SessionState::Ready;
                Ok(Some(reply))
            }
            Err(IpcWaitError::Timeout) => {
                if self.process.is_running()? {
                    Ok(None)
                } else {
                    Err(self.lost_worker_error())
                }
            }
            Err(IpcWaitError::SessionEnd | IpcWaitError::Disconnected) => {
                Err(self.lost_worker_error())
            }
        }
    }

    pub fn interrupt(&self) -> Result<(), WorkerError> {
        self.ipc
            .send(ControllerToWorkerMessage::Interrupt)
            .map_err(|err| WorkerError::Protocol(err.to_string()))
    }

    /// False once the worker process exited or its IPC channel closed.
    pub fn is_alive(&mut self) -> bool {
        if self.ipc.is_disconnected() || self.ipc.session_ended() {
            return false;
        }
        self.process.is_running().unwrap_or(false)
    }

    pub fn mark_resetting(&mut self) {
        self.state = SessionState::Resetting;
    }

    /// Orderly stop: `Shutdown`, then SIGTERM, then SIGKILL of the process group once `grace`
    /// has elapsed.
    pub fn shutdown(mut self, grace: Duration) -> Result<(), WorkerError> {
        self.state = SessionState::Dead;
        let _ = self.ipc.send(ControllerToWorkerMessage::Shutdown);
        let pid = self.info.pid;
        let generation = self.generation;
        let result = self.process.shutdown_graceful(grace);
        event_log::record(DebugRecord::WorkerShutdown {
            worker_pid: pid,
            generation,
        });
        result
    }

    pub fn kill(mut self) -> Result<(), WorkerError> {
        self.state = SessionState::Dead;
        self.process.kill()
    }

    fn lost_worker_error(&mut self) -> WorkerError {
        self.in_flight = None;
        self.state = SessionState::Dead;
        let status = self
            .process
            .exit_status_message()
            .unwrap_or_else(|err| Some(err.to_string()));
        WorkerError::Protocol(match status {
            Some(status) => format!("worker exited unexpectedly ({status})"),
            None => "worker disconnected unexpectedly".to_string(),
        })
    }
}

struct WorkerProcess {
    child: Child,
    expected_exit: bool,
    exit_status: Option<ExitStatus>,
}

impl WorkerProcess {
    #[cfg(target_family = "unix")]
    fn spawn(
        config: &SessionConfig,
        feed: StreamMultiplexer,
    ) -> Result<(Self, ControllerIpcConnection), WorkerError> {
        let mut ipc_server = IpcServer::bind()?;
        let client_fds = ipc_server.take_child_fds().ok_or_else(|| {
            WorkerError::Protocol("IPC pipe setup failed; no client fds available".to_string())
        })?;
        let class_path = std::env::join_paths(&config.class_path)
            .map_err(|err| WorkerError::Startup(format!("invalid class path: {err}")))?;

        let mut command = Command::new(&config.program);
        command
            .arg(format!("--{WORKER_MODE_ARG}"))
            .current_dir(&config.working_dir)
            .env(CLASS_PATH_ENV, class_path)
            .env(IPC_READ_FD_ENV, client_fds.read_fd.to_string())
            .env(IPC_WRITE_FD_ENV, client_fds.write_fd.to_string());
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let spawned = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        unsafe {
            libc::close(client_fds.read_fd);
            libc::close(client_fds.write_fd);
        }
        let mut child = spawned.map_err(|err| {
            WorkerError::Startup(format!(
                "failed to spawn {} in {}: {err}",
                config.program.display(),
                config.working_dir.display()
            ))
        })?;
        if let Some(status) = child.try_wait()? {
            return Err(WorkerError::Startup(format!(
                "worker process exited immediately with status {status}"
            )));
        }
        tracing::debug!(pid = child.id(), program = %config.program.display(), "worker spawned");
        event_log::record(DebugRecord::WorkerSpawned {
            worker_pid: child.id(),
            program: config.program.clone(),
            working_dir: config.working_dir.clone(),
        });

        spawn_output_reader(child.stdout.take(), ConsoleChannel::Out, feed.clone());
        spawn_output_reader(child.stderr.take(), ConsoleChannel::Err, feed.clone());

        let on_stream: StreamHandler = Arc::new(move |channel, data: String| {
            feed.append_stream(channel, &data);
        });
        let process = Self {
            child,
            expected_exit: false,
            exit_status: None,
        };
        match ipc_server.connect(on_stream) {
            Ok(ipc) => Ok((process, ipc)),
            Err(err) => {
                let _ = process.kill();
                Err(WorkerError::Io(err))
            }
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn spawn(
        _config: &SessionConfig,
        _feed: StreamMultiplexer,
    ) -> Result<(Self, ControllerIpcConnection), WorkerError> {
        Err(WorkerError::Unsupported)
    }

    fn send_sigterm(&mut self) -> Result<(), WorkerError> {
        #[cfg(target_family = "unix")]
        {
            self.send_signal(libc::SIGTERM)
        }
        #[cfg(not(target_family = "unix"))]
        {
            self.child.kill()?;
            Ok(())
        }
    }

    fn send_sigkill(&mut self) -> Result<(), WorkerError> {
        #[cfg(target_family = "unix")]
        {
            self.send_signal(libc::SIGKILL)
        }
        #[cfg(not(target_family = "unix"))]
        {
            self.child.kill()?;
            Ok(())
        }
    }

    #[cfg(target_family = "unix")]
    fn send_signal(&self, signal: i32) -> Result<(), WorkerError> {
        let pid = self.child.id() as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            // The group is already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            Err(WorkerError::Io(err))
        }
    }

    fn exit_status_message(&mut self) -> Result<Option<String>, WorkerError> {
        if self.exit_status.is_none()
            && let Some(status) = self.child.try_wait()?
        {
            self.exit_status = Some(status);
        }
        let Some(status) = self.exit_status.as_ref() else {
            return Ok(None);
        };
        Ok(Some(format_exit_status_message(status)))
    }

    fn is_running(&mut self) -> Result<bool, WorkerError> {
        if self.exit_status.is_some() {
            return Ok(false);
        }
        if let Some(status) = self.child.try_wait()? {
            self.exit_status = Some(status);
            if !self.expected_exit {
                tracing::warn!(
                    pid = self.child.id(),
                    "worker {}",
                    format_exit_status_message(&status)
                );
                event_log::record(DebugRecord::WorkerExited {
                    worker_pid: self.child.id(),
                    status: format_exit_status_message(&status),
                });
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn shutdown_graceful(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        self.expected_exit = true;
        let deadline = Instant::now() + timeout;
        while !timeout.is_zero() {
            if let Some(status) = self.child.try_wait()? {
                self.exit_status = Some(status);
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }

        if self.child.try_wait()?.is_none() {
            tracing::debug!(pid = self.child.id(), "worker ignored shutdown; sending SIGTERM");
            let _ = self.send_sigterm();
            let term_deadline = Instant::now() + SIGTERM_WAIT;
            loop {
                if let Some(status) = self.child.try_wait()? {
                    self.exit_status = Some(status);
                    break;
                }
                if Instant::now() >= term_deadline {
                    tracing::warn!(pid = self.child.id(), "worker ignored SIGTERM; killing");
                    let _ = self.send_sigkill();
                    self.exit_status = self.child.wait().ok();
                    break;
                }
                thread::sleep(EXIT_POLL_INTERVAL);
            }
        }
        Ok(())
    }

    fn kill(mut self) -> Result<(), WorkerError> {
        self.expected_exit = true;
        let signaled = self.send_sigkill();
        if signaled.is_err() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        Ok(())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // Never leave an orphaned worker behind.
        if self.exit_status.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            self.expected_exit = true;
            let _ = self.send_sigkill();
            let _ = self.child.wait();
        }
    }
}

fn format_exit_status_message(status: &ExitStatus) -> String {
    #[cfg(target_family = "unix")]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(status) {
        return format!("exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => format!("exited with {status}"),
    }
}

fn spawn_output_reader<R>(stream: Option<R>, channel: ConsoleChannel, feed: StreamMultiplexer)
where
    R: Read + Send + 'static,
{
    let Some(mut stream) = stream else {
        return;
    };
    thread::spawn(move || {
        let mut buffer = [0u8; 8192];
        let mut pending = Vec::new();
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buffer[..n]);
                    let valid = valid_utf8_prefix_len(&pending);
                    if valid > 0 {
                        let text = String::from_utf8_lossy(&pending[..valid]).to_string();
                        feed.append(channel, &text);
                        pending.drain(..valid);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            feed.append(channel, &String::from_utf8_lossy(&pending));
        }
    });
}

/// Length of the longest prefix that does not end inside a multi-byte sequence.
fn valid_utf8_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(err) => match err.error_len() {
            // Genuinely invalid bytes: hand everything to lossy decoding.
            Some(_) => bytes.len(),
            None => err.valid_up_to(),
        },
    }
}
