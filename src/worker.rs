use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use crate::evaluator::Evaluator;
use crate::ipc::{
    ControllerToWorkerMessage, StreamHandler, WorkerIpcConnection, WorkerToControllerMessage,
    connect_from_env,
};
use crate::worker_protocol::{EvalReply, WorkerInfo, class_path_from_env, is_worker_mode_arg};

const SESSION_END_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct WorkerState {
    busy: AtomicBool,
    shutting_down: AtomicBool,
    interrupt: Arc<AtomicBool>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            busy: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl WorkerState {
    fn try_mark_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn mark_idle(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.interrupt.store(true, Ordering::SeqCst);
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

enum WorkerRequest {
    Evaluate { id: u64, text: String },
    Shutdown,
}

pub fn is_worker_mode() -> bool {
    std::env::args().skip(1).any(|arg| is_worker_mode_arg(&arg))
}

/// Worker process entry point. Evaluation runs on the calling thread; a separate thread drains
/// the IPC channel so `Interrupt` can land while a script is running.
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connect_from_env().map_err(|err| {
        eprintln!("worker ipc init error: {err}");
        err
    })?;
    let state = Arc::new(WorkerState::default());
    let class_path = class_path_from_env();

    let output_conn = conn.clone();
    let output: StreamHandler = Arc::new(move |channel, data| {
        let _ = output_conn.send(WorkerToControllerMessage::StreamData { channel, data });
    });
    let mut evaluator = Evaluator::new(&class_path, state.interrupt.clone(), output);

    let (request_tx, request_rx) = mpsc::channel();
    let ipc_state = state.clone();
    let ipc_conn = conn.clone();
    thread::Builder::new()
        .name("worker-ipc".to_string())
        .spawn(move || ipc_loop(ipc_conn, ipc_state, request_tx))
        .map_err(|err| format!("failed to spawn worker ipc thread: {err}"))?;

    let info = WorkerInfo {
        pid: std::process::id(),
        working_dir: std::env::current_dir()?,
        class_path,
    };
    conn.send(WorkerToControllerMessage::Ready { info })?;

    for request in request_rx {
        match request {
            WorkerRequest::Evaluate { id, text } => {
                let reply = evaluator.evaluate(&text);
                // The controller sends the next request as soon as it sees this reply.
                state.mark_idle();
                let _ = conn.send(WorkerToControllerMessage::Reply { id, reply });
            }
            WorkerRequest::Shutdown => break,
        }
    }

    let _ = conn.send_flushed(
        WorkerToControllerMessage::SessionEnd,
        SESSION_END_FLUSH_TIMEOUT,
    );
    Ok(())
}

fn ipc_loop(
    conn: WorkerIpcConnection,
    state: Arc<WorkerState>,
    request_tx: mpsc::Sender<WorkerRequest>,
) {
    loop {
        match conn.recv() {
            Some(ControllerToWorkerMessage::Evaluate { id, text }) => {
                if state.is_shutting_down() {
                    continue;
                }
                if !state.try_mark_busy() {
                    let _ = conn.send(WorkerToControllerMessage::Reply {
                        id,
                        reply: EvalReply::error("worker is busy; request already running"),
                    });
                    continue;
                }
                // An interrupt that arrived while idle must not cancel this request.
                state.interrupt.store(false, Ordering::SeqCst);
                if request_tx.send(WorkerRequest::Evaluate { id, text }).is_err() {
                    state.mark_idle();
                    let _ = conn.send(WorkerToControllerMessage::Reply {
                        id,
                        reply: EvalReply::error("worker evaluation loop exited unexpectedly"),
                    });
                }
            }
            Some(ControllerToWorkerMessage::Interrupt) => {
                state.interrupt.store(true, Ordering::SeqCst);
            }
            Some(ControllerToWorkerMessage::Shutdown) => {
                state.begin_shutdown();
                let _ = request_tx.send(WorkerRequest::Shutdown);
                return;
            }
            None => {
                // Without IPC the worker can neither receive requests nor report results.
                std::process::exit(0);
            }
        }
    }
}
