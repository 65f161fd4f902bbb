//! The interactions controller.
//!
//! A background driver thread owns the worker session. Public calls only enqueue commands or
//! read shared bookkeeping, so no caller ever blocks on the worker. The driver runs one request
//! at a time, queues later submissions in FIFO order and reacts to resets, interrupts and worker
//! crashes between polls of the in-flight request.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::EngineConfig;
use crate::console::{ConsoleChannel, StreamMultiplexer};
use crate::error::InteractionError;
use crate::event_log::{self, DebugRecord};
use crate::events::{CompletionStatus, EngineEvent, EventDispatcher};
use crate::history::{
    FileOpenSelector, FileSaveSelector, History, HistoryEntry, InteractionsScript, load_script,
};
use crate::worker_process::{SessionConfig, SessionState, WorkerError, WorkerSession};
use crate::worker_protocol::EvalReply;

const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(20);
const IDLE_HEALTH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct InteractionRequest {
    pub id: RequestId,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionOutcome {
    /// `None` when the interaction produced no value.
    Value(Option<String>),
    Error(String),
}

impl InteractionOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, InteractionOutcome::Error(_))
    }
}

pub type InteractionResult = Result<InteractionOutcome, InteractionError>;

/// Controller-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Submitting,
    WaitingResult,
    Resetting,
}

pub struct PendingInteraction {
    id: RequestId,
    rx: oneshot::Receiver<InteractionResult>,
}

impl PendingInteraction {
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub async fn outcome(self) -> InteractionResult {
        self.rx.await.unwrap_or(Err(InteractionError::ShutDown))
    }

    /// Returns `None` while the request is still queued or running.
    pub fn try_outcome(&mut self) -> Option<InteractionResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(InteractionError::ShutDown)),
        }
    }

    /// Blocks the current thread. Must not be called from inside an async runtime.
    pub fn blocking_outcome(self) -> InteractionResult {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(InteractionError::ShutDown))
    }
}

/// Result of replaying a script. Replay stops at the first failing line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplaySummary {
    pub executed: usize,
    pub remaining: usize,
    pub outcomes: Vec<InteractionOutcome>,
}

impl ReplaySummary {
    pub fn aborted(&self) -> bool {
        self.outcomes.last().is_some_and(InteractionOutcome::is_error)
    }
}

pub struct PendingReplay {
    rx: oneshot::Receiver<Result<ReplaySummary, InteractionError>>,
}

impl PendingReplay {
    pub async fn outcome(self) -> Result<ReplaySummary, InteractionError> {
        self.rx.await.unwrap_or(Err(InteractionError::ShutDown))
    }

    pub fn blocking_outcome(self) -> Result<ReplaySummary, InteractionError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(InteractionError::ShutDown))
    }
}

struct Shared {
    state: ControllerState,
    session_state: Option<SessionState>,
    history: History,
    class_path: Vec<PathBuf>,
    interactions_class_path: Vec<PathBuf>,
    working_dir: PathBuf,
    worker_pid: Option<u32>,
    generation: u64,
}

enum Command {
    Submit {
        request: InteractionRequest,
        reply: oneshot::Sender<InteractionResult>,
    },
    Replay {
        lines: Vec<String>,
        reply: oneshot::Sender<Result<ReplaySummary, InteractionError>>,
    },
    Reset {
        working_dir: Option<PathBuf>,
        reply: oneshot::Sender<Result<(), InteractionError>>,
    },
    Interrupt,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the interactions engine. Cheap to clone; every clone drives the same worker.
#[derive(Clone)]
pub struct InteractionsController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    tx: mpsc::Sender<Command>,
    shared: Arc<Mutex<Shared>>,
    events: EventDispatcher,
    feed: StreamMultiplexer,
    next_request_id: Arc<AtomicU64>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InteractionsController {
    /// Creates the controller and its driver thread. No worker is started until the first
    /// submission or an explicit reset.
    pub fn new(
        config: Arc<EngineConfig>,
        events: EventDispatcher,
        feed: StreamMultiplexer,
    ) -> std::io::Result<Self> {
        let program = config
            .resolve_worker_program()
            .map_err(std::io::Error::other)?;
        let shared = Arc::new(Mutex::new(Shared {
            state: ControllerState::Idle,
            session_state: None,
            history: History::new(),
            class_path: config.class_path.clone(),
            interactions_class_path: Vec::new(),
            working_dir: config.resolve_working_dir(),
            worker_pid: None,
            generation: 0,
        }));
        let (tx, rx) = mpsc::channel();
        let next_request_id = Arc::new(AtomicU64::new(1));
        let driver = Driver {
            next_request_id: next_request_id.clone(),
            config,
            program,
            rx,
            shared: shared.clone(),
            events: events.clone(),
            feed: feed.clone(),
            session: None,
            queue: VecDeque::new(),
            startup_failure: None,
            shutdown_reply: None,
        };
        thread::Builder::new()
            .name("interactions-driver".to_string())
            .spawn(move || driver.run())?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                tx,
                shared,
                events,
                feed,
                next_request_id,
            }),
        })
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.inner.shared)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId(self.inner.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, command: Command) -> Result<(), InteractionError> {
        self.inner
            .tx
            .send(command)
            .map_err(|_| InteractionError::ShutDown)
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn console(&self) -> &StreamMultiplexer {
        &self.inner.feed
    }

    /// Queues `text` for evaluation. Empty or whitespace-only input is rejected without any
    /// state change.
    pub fn submit(&self, text: &str) -> Result<PendingInteraction, InteractionError> {
        if text.trim().is_empty() {
            return Err(InteractionError::InvalidInput);
        }
        let id = self.next_request_id();
        let (reply, rx) = oneshot::channel();
        let request = InteractionRequest {
            id,
            text: text.to_string(),
            submitted_at: Utc::now(),
        };
        self.send(Command::Submit { request, reply })?;
        Ok(PendingInteraction { id, rx })
    }

    /// Runs the script's interactions in order as one unit: the first failure skips the rest.
    pub fn replay(&self, script: InteractionsScript) -> Result<PendingReplay, InteractionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Replay {
            lines: script.into_interactions(),
            reply,
        })?;
        Ok(PendingReplay { rx })
    }

    /// Replaces the worker with a fresh one in `working_dir` (or the current directory).
    pub async fn reset(&self, working_dir: Option<PathBuf>) -> Result<(), InteractionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { working_dir, reply })?;
        rx.await.unwrap_or(Err(InteractionError::ShutDown))
    }

    pub fn blocking_reset(&self, working_dir: Option<PathBuf>) -> Result<(), InteractionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Reset { working_dir, reply })?;
        rx.blocking_recv().unwrap_or(Err(InteractionError::ShutDown))
    }

    /// Interrupts the in-flight request, if any.
    pub fn interrupt(&self) {
        let _ = self.send(Command::Interrupt);
    }

    /// Records the class path for the next session. A running session keeps its own.
    pub fn update_class_path(&self, class_path: Vec<PathBuf>) {
        let running = {
            let mut shared = self.shared();
            shared.class_path = class_path;
            matches!(
                shared.session_state,
                Some(SessionState::Starting | SessionState::Ready | SessionState::Busy)
            )
        };
        if running {
            self.inner.events.publish(EngineEvent::Warning {
                message: "class path updated; it takes effect after the next interpreter reset"
                    .to_string(),
            });
        }
    }

    /// Configured class path, applied at the next reset.
    pub fn class_path(&self) -> Vec<PathBuf> {
        self.shared().class_path.clone()
    }

    /// Class path of the running session.
    pub fn interactions_class_path(&self) -> Vec<PathBuf> {
        self.shared().interactions_class_path.clone()
    }

    pub fn working_dir(&self) -> PathBuf {
        self.shared().working_dir.clone()
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.shared().worker_pid
    }

    pub fn state(&self) -> ControllerState {
        self.shared().state
    }

    /// `None` until a session has been started.
    pub fn session_state(&self) -> Option<SessionState> {
        self.shared().session_state
    }

    pub fn session_generation(&self) -> u64 {
        self.shared().generation
    }

    pub fn reset_console(&self) {
        self.inner.feed.reset();
        self.inner.events.publish(EngineEvent::ConsoleReset);
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared().history.entries().to_vec()
    }

    pub fn history_as_string(&self) -> String {
        self.shared().history.as_string()
    }

    pub fn history_as_string_with_semicolons(&self) -> String {
        self.shared().history.as_string_with_semicolons()
    }

    pub fn clear_history(&self) {
        self.shared().history.clear();
        self.inner.events.publish(EngineEvent::HistoryCleared);
    }

    /// Writes the history file. `edited_version` replaces the recorded entries.
    pub fn save_history(
        &self,
        selector: &dyn FileSaveSelector,
        edited_version: Option<&str>,
    ) -> Result<PathBuf, InteractionError> {
        let history = self.shared().history.clone();
        Ok(history.save(selector, edited_version)?)
    }

    /// Parses a saved history file and replays it immediately.
    pub fn load_history(
        &self,
        selector: &dyn FileOpenSelector,
    ) -> Result<PendingReplay, InteractionError> {
        let script = load_script(selector)?;
        self.replay(script)
    }

    /// Parses a saved history file for step-through; nothing is executed.
    pub fn load_history_as_script(
        &self,
        selector: &dyn FileOpenSelector,
    ) -> Result<InteractionsScript, InteractionError> {
        Ok(load_script(selector)?)
    }

    /// Cancels outstanding work and stops the worker.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn blocking_shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.blocking_recv();
        }
    }
}

enum Job {
    Single {
        request: InteractionRequest,
        reply: oneshot::Sender<InteractionResult>,
    },
    Replay {
        lines: Vec<String>,
        reply: oneshot::Sender<Result<ReplaySummary, InteractionError>>,
    },
}

impl Job {
    fn cancel(self) {
        match self {
            Job::Single { request, reply } => {
                tracing::debug!(request = %request.id, "cancelling queued request");
                let _ = reply.send(Err(InteractionError::Cancelled));
            }
            Job::Replay { reply, .. } => {
                let _ = reply.send(Err(InteractionError::Cancelled));
            }
        }
    }
}

/// A command that must pre-empt whatever the driver is doing.
enum Preempt {
    Reset {
        working_dir: Option<PathBuf>,
        reply: oneshot::Sender<Result<(), InteractionError>>,
    },
    Shutdown {
        reply: Option<oneshot::Sender<()>>,
    },
}

enum Execution {
    Done(InteractionResult),
    Preempted(InteractionError, Preempt),
}

struct Driver {
    config: Arc<EngineConfig>,
    program: PathBuf,
    rx: mpsc::Receiver<Command>,
    shared: Arc<Mutex<Shared>>,
    events: EventDispatcher,
    feed: StreamMultiplexer,
    next_request_id: Arc<AtomicU64>,
    session: Option<WorkerSession>,
    queue: VecDeque<Job>,
    /// Set after a failed start; cleared only by an explicit reset.
    startup_failure: Option<String>,
    shutdown_reply: Option<oneshot::Sender<()>>,
}

impl Driver {
    fn run(mut self) {
        loop {
            if let Some(job) = self.queue.pop_front() {
                if let Some(preempt) = self.run_job(job)
                    && !self.apply_preempt(preempt)
                {
                    break;
                }
                continue;
            }
            self.set_state(ControllerState::Idle);
            match self.rx.recv_timeout(IDLE_HEALTH_INTERVAL) {
                Ok(command) => {
                    if let Some(preempt) = self.accept(command)
                        && !self.apply_preempt(preempt)
                    {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => self.check_idle_health(),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = self.apply_preempt(Preempt::Shutdown { reply: None });
                    break;
                }
            }
        }
        // Commands sent after shutdown must fail, so the receiver goes before the reply.
        let Driver {
            rx, shutdown_reply, ..
        } = self;
        drop(rx);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    /// Queues work; returns reset or shutdown for the caller to act on.
    fn accept(&mut self, command: Command) -> Option<Preempt> {
        match command {
            Command::Submit { request, reply } => {
                self.queue.push_back(Job::Single { request, reply });
                None
            }
            Command::Replay { lines, reply } => {
                self.queue.push_back(Job::Replay { lines, reply });
                None
            }
            Command::Interrupt => {
                if let Some(session) = self.session.as_ref()
                    && session.in_flight().is_some()
                {
                    let _ = session.interrupt();
                }
                None
            }
            Command::Reset { working_dir, reply } => Some(Preempt::Reset { working_dir, reply }),
            Command::Shutdown { reply } => Some(Preempt::Shutdown { reply: Some(reply) }),
        }
    }

    /// Returns false when the driver should stop.
    fn apply_preempt(&mut self, preempt: Preempt) -> bool {
        for job in self.queue.drain(..) {
            job.cancel();
        }
        match preempt {
            Preempt::Reset { working_dir, reply } => {
                let result = self.reset(working_dir);
                let _ = reply.send(result);
                true
            }
            Preempt::Shutdown { reply } => {
                self.set_state(ControllerState::Resetting);
                if let Some(session) = self.session.take() {
                    let _ = session.shutdown(self.config.shutdown_grace());
                }
                self.set_session_state(SessionState::Dead);
                self.update_shared(|shared| shared.worker_pid = None);
                self.shutdown_reply = reply;
                false
            }
        }
    }

    fn run_job(&mut self, job: Job) -> Option<Preempt> {
        match job {
            Job::Single { request, reply } => match self.execute(&request, false) {
                Execution::Done(result) => {
                    let _ = reply.send(result);
                    None
                }
                Execution::Preempted(err, preempt) => {
                    let _ = reply.send(Err(err));
                    Some(preempt)
                }
            },
            Job::Replay { lines, reply } => {
                let total = lines.len();
                let mut summary = ReplaySummary {
                    executed: 0,
                    remaining: total,
                    outcomes: Vec::new(),
                };
                for text in lines {
                    let request = InteractionRequest {
                        id: RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed)),
                        text,
                        submitted_at: Utc::now(),
                    };
                    let result = match self.execute(&request, true) {
                        Execution::Done(result) => result,
                        Execution::Preempted(err, preempt) => {
                            self.publish_replay_abort(&summary);
                            let _ = reply.send(Err(err));
                            return Some(preempt);
                        }
                    };
                    summary.executed += 1;
                    summary.remaining -= 1;
                    match result {
                        Ok(outcome) => {
                            let failed = outcome.is_error();
                            summary.outcomes.push(outcome);
                            if failed {
                                break;
                            }
                        }
                        Err(err) => {
                            self.publish_replay_abort(&summary);
                            let _ = reply.send(Err(err));
                            return None;
                        }
                    }
                }
                if summary.aborted() {
                    self.publish_replay_abort(&summary);
                }
                let _ = reply.send(Ok(summary));
                None
            }
        }
    }

    fn publish_replay_abort(&self, summary: &ReplaySummary) {
        if summary.remaining == 0 && !summary.aborted() {
            return;
        }
        self.events.publish(EngineEvent::ReplayAborted {
            executed: summary.executed,
            remaining: summary.remaining,
        });
    }

    fn execute(&mut self, request: &InteractionRequest, edited: bool) -> Execution {
        self.set_state(ControllerState::Submitting);
        if let Err(err) = self.ensure_session() {
            self.publish_completion(request.id, CompletionStatus::StartupFailed(err.to_string()));
            return Execution::Done(Err(err));
        }
        let Some(session) = self.session.as_mut() else {
            return Execution::Done(Err(InteractionError::SlaveStartup(
                "interpreter is not running".to_string(),
            )));
        };

        self.feed.append(ConsoleChannel::Echo, &request.text);
        self.events.publish(EngineEvent::InteractionStarted {
            request: request.id,
            text: request.text.clone(),
        });
        if let Err(err) = session.send_evaluate(&request.text) {
            let reason = err.to_string();
            self.handle_crash(&reason);
            self.publish_completion(request.id, CompletionStatus::Crashed(reason.clone()));
            return Execution::Done(Err(InteractionError::SlaveCrashed(reason)));
        }
        let busy = session.state();
        // Only requests that reached the worker become history.
        self.update_shared(|shared| shared.history.append(request.text.clone(), edited));
        self.events.publish(EngineEvent::HistoryAppended {
            text: request.text.clone(),
            edited,
        });
        self.set_session_state(busy);
        self.set_state(ControllerState::WaitingResult);

        loop {
            let Some(session) = self.session.as_mut() else {
                return Execution::Done(Err(InteractionError::SlaveCrashed(
                    "interpreter session lost".to_string(),
                )));
            };
            match session.poll_reply(REPLY_POLL_INTERVAL) {
                Ok(Some(reply)) => {
                    let ready = session.state();
                    self.set_session_state(ready);
                    let result = reply_to_result(reply);
                    self.finish(request, &result);
                    return Execution::Done(result);
                }
                Ok(None) => {}
                Err(err) => {
                    let reason = err.to_string();
                    self.handle_crash(&reason);
                    self.publish_completion(request.id, CompletionStatus::Crashed(reason.clone()));
                    return Execution::Done(Err(InteractionError::SlaveCrashed(reason)));
                }
            }

            while let Ok(command) = self.rx.try_recv() {
                if let Some(preempt) = self.accept(command) {
                    let err = self.abandon_in_flight();
                    let status = match err {
                        InteractionError::Interrupted => CompletionStatus::Interrupted,
                        _ => CompletionStatus::Cancelled,
                    };
                    self.publish_completion(request.id, status);
                    return Execution::Preempted(err, preempt);
                }
            }
        }
    }

    /// Interrupts the in-flight request ahead of a reset or shutdown and reports how it ended.
    fn abandon_in_flight(&mut self) -> InteractionError {
        let Some(session) = self.session.as_mut() else {
            return InteractionError::Cancelled;
        };
        let _ = session.interrupt();
        let deadline = Instant::now() + self.config.interrupt_grace();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return InteractionError::Cancelled;
            }
            match session.poll_reply(remaining.min(REPLY_POLL_INTERVAL)) {
                Ok(Some(EvalReply::Error {
                    interrupted: true, ..
                })) => return InteractionError::Interrupted,
                Ok(Some(_)) | Err(_) => return InteractionError::Cancelled,
                Ok(None) => {}
            }
        }
    }

    fn finish(&self, request: &InteractionRequest, result: &InteractionResult) {
        let status = match result {
            Ok(InteractionOutcome::Value(_)) => CompletionStatus::Value,
            Ok(InteractionOutcome::Error(description)) => {
                CompletionStatus::Error(description.clone())
            }
            Err(InteractionError::Interrupted) => {
                tracing::debug!(request = %request.id, "evaluation interrupted");
                CompletionStatus::Interrupted
            }
            Err(err) => CompletionStatus::Error(err.to_string()),
        };
        let generation = lock(&self.shared).generation;
        event_log::record(DebugRecord::InteractionCompleted {
            request: request.id,
            generation,
            elapsed_ms: (Utc::now() - request.submitted_at).num_milliseconds(),
        });
        self.publish_completion(request.id, status);
    }

    fn publish_completion(&self, request: RequestId, status: CompletionStatus) {
        self.events
            .publish(EngineEvent::InteractionCompleted { request, status });
    }

    fn ensure_session(&mut self) -> Result<(), InteractionError> {
        if self.session.is_some() {
            return Ok(());
        }
        if let Some(reason) = self.startup_failure.as_ref() {
            return Err(InteractionError::SlaveStartup(format!(
                "{reason} (reset the interpreter to retry)"
            )));
        }
        let (working_dir, class_path) = {
            let shared = lock(&self.shared);
            (shared.working_dir.clone(), shared.class_path.clone())
        };
        self.start_session(&working_dir, class_path)
            .map_err(InteractionError::SlaveStartup)
    }

    fn start_session(&mut self, working_dir: &Path, class_path: Vec<PathBuf>) -> Result<(), String> {
        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.generation
        };
        self.set_session_state(SessionState::Starting);
        let config = SessionConfig {
            program: self.program.clone(),
            working_dir: working_dir.to_path_buf(),
            class_path,
            startup_timeout: self.config.startup_timeout(),
        };
        match WorkerSession::start(&config, generation, self.feed.clone()) {
            Ok(session) => {
                let pid = session.info().pid;
                self.update_shared(|shared| {
                    shared.worker_pid = Some(pid);
                    shared.interactions_class_path = config.class_path.clone();
                    shared.working_dir = config.working_dir.clone();
                });
                self.session = Some(session);
                self.startup_failure = None;
                self.set_session_state(SessionState::Ready);
                Ok(())
            }
            Err(err) => {
                let reason = startup_reason(&err);
                tracing::warn!("interpreter failed to start: {reason}");
                self.update_shared(|shared| shared.worker_pid = None);
                self.startup_failure = Some(reason.clone());
                self.set_session_state(SessionState::Dead);
                self.events.publish(EngineEvent::WorkerStartupFailed {
                    reason: reason.clone(),
                });
                Err(reason)
            }
        }
    }

    fn reset(&mut self, working_dir: Option<PathBuf>) -> Result<(), InteractionError> {
        self.set_state(ControllerState::Resetting);
        self.set_session_state(SessionState::Resetting);
        if let Some(mut session) = self.session.take() {
            session.mark_resetting();
            if let Err(err) = session.shutdown(self.config.shutdown_grace()) {
                tracing::warn!("failed to stop interpreter cleanly: {err}");
            }
        }
        self.update_shared(|shared| shared.worker_pid = None);
        self.feed.reset();
        self.events.publish(EngineEvent::ConsoleReset);

        let (working_dir, class_path) = {
            let shared = lock(&self.shared);
            (
                working_dir.unwrap_or_else(|| shared.working_dir.clone()),
                shared.class_path.clone(),
            )
        };
        self.startup_failure = None;
        self.start_session(&working_dir, class_path)
            .map_err(InteractionError::SlaveStartup)?;
        let generation = lock(&self.shared).generation;
        tracing::info!(working_dir = %working_dir.display(), generation, "interpreter reset");
        self.events.publish(EngineEvent::InterpreterReset {
            working_dir,
            generation,
        });
        Ok(())
    }

    /// Replaces a worker that died on its own. The in-flight request, if any, is the caller's
    /// to fail; it is never retried.
    fn handle_crash(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        let generation = session.generation();
        let working_dir = session.working_dir().to_path_buf();
        let class_path = session.class_path().to_vec();
        let _ = session.kill();
        tracing::warn!(generation, "interpreter crashed: {reason}");
        event_log::record(DebugRecord::WorkerCrashed {
            generation,
            reason: reason.to_string(),
        });
        self.set_session_state(SessionState::Dead);
        self.events.publish(EngineEvent::WorkerCrashed {
            generation,
            reason: reason.to_string(),
        });
        let _ = self.start_session(&working_dir, class_path);
    }

    fn check_idle_health(&mut self) {
        if let Some(session) = self.session.as_mut()
            && !session.is_alive()
        {
            self.handle_crash("worker exited while idle");
        }
    }

    fn set_state(&self, state: ControllerState) {
        self.update_shared(|shared| shared.state = state);
    }

    fn set_session_state(&self, state: SessionState) {
        let changed = {
            let mut shared = lock(&self.shared);
            let changed = shared.session_state != Some(state);
            shared.session_state = Some(state);
            changed
        };
        if changed {
            self.events
                .publish(EngineEvent::SessionStateChanged { state });
        }
    }

    fn update_shared(&self, f: impl FnOnce(&mut Shared)) {
        let mut shared = lock(&self.shared);
        f(&mut shared);
    }
}

fn reply_to_result(reply: EvalReply) -> InteractionResult {
    match reply {
        EvalReply::Value { result } => Ok(InteractionOutcome::Value(result)),
        EvalReply::Error {
            interrupted: true, ..
        } => Err(InteractionError::Interrupted),
        EvalReply::Error { description, .. } => Ok(InteractionOutcome::Error(description)),
    }
}

fn startup_reason(err: &WorkerError) -> String {
    match err {
        WorkerError::Startup(reason) => reason.clone(),
        other => other.to_string(),
    }
}
