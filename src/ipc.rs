#![cfg_attr(not(target_family = "unix"), allow(dead_code))]

use std::collections::VecDeque;
#[cfg(target_family = "unix")]
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
#[cfg(target_family = "unix")]
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::worker_protocol::{EvalReply, StreamChannel, WorkerInfo};

#[cfg(target_family = "unix")]
pub const IPC_READ_FD_ENV: &str = "WORKBENCH_IPC_READ_FD";
#[cfg(target_family = "unix")]
pub const IPC_WRITE_FD_ENV: &str = "WORKBENCH_IPC_WRITE_FD";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerToWorkerMessage {
    Evaluate { id: u64, text: String },
    Interrupt,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerToControllerMessage {
    Ready { info: WorkerInfo },
    Reply { id: u64, reply: EvalReply },
    StreamData { channel: StreamChannel, data: String },
    SessionEnd,
}

pub type StreamHandler = Arc<dyn Fn(StreamChannel, String) + Send + Sync>;

#[derive(Default)]
struct ControllerIpcInbox {
    replies: VecDeque<(u64, EvalReply)>,
    ready: Option<WorkerInfo>,
    session_end: bool,
    disconnected: bool,
}

#[derive(Default)]
struct WorkerIpcInbox {
    queue: VecDeque<ControllerToWorkerMessage>,
    disconnected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcSendError;

impl std::fmt::Display for IpcSendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ipc channel closed")
    }
}

impl std::error::Error for IpcSendError {}

#[derive(Debug, PartialEq, Eq)]
pub enum IpcWaitError {
    Timeout,
    SessionEnd,
    Disconnected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Outgoing<T> {
    message: T,
    flushed: Option<mpsc::Sender<()>>,
}

#[derive(Clone)]
pub struct ControllerIpcConnection {
    sender: mpsc::Sender<Outgoing<ControllerToWorkerMessage>>,
    inbox: Arc<Mutex<ControllerIpcInbox>>,
    cvar: Arc<Condvar>,
}

#[derive(Clone)]
pub struct WorkerIpcConnection {
    sender: mpsc::Sender<Outgoing<WorkerToControllerMessage>>,
    inbox: Arc<Mutex<WorkerIpcInbox>>,
    cvar: Arc<Condvar>,
}

impl ControllerIpcConnection {
    fn new(transport: IpcTransport, on_stream: StreamHandler) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(ControllerIpcInbox::default()));
        let cvar = Arc::new(Condvar::new());

        let reader_inbox = inbox.clone();
        let reader_cvar = cvar.clone();
        let IpcTransport { reader, writer } = transport;
        thread::Builder::new()
            .name("controller-ipc-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => {
                            let mut guard = lock(&reader_inbox);
                            guard.disconnected = true;
                            reader_cvar.notify_all();
                            break;
                        }
                        Ok(_) => {}
                    }
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    let Ok(message) = serde_json::from_str::<WorkerToControllerMessage>(trimmed)
                    else {
                        tracing::debug!("ignoring unparseable worker message: {trimmed}");
                        continue;
                    };
                    match message {
                        // Stream data is forwarded before any later terminal reply is queued,
                        // so output always lands ahead of the reply that follows it.
                        WorkerToControllerMessage::StreamData { channel, data } => {
                            on_stream(channel, data);
                        }
                        WorkerToControllerMessage::Reply { id, reply } => {
                            let mut guard = lock(&reader_inbox);
                            guard.replies.push_back((id, reply));
                            reader_cvar.notify_all();
                        }
                        WorkerToControllerMessage::Ready { info } => {
                            let mut guard = lock(&reader_inbox);
                            guard.ready = Some(info);
                            reader_cvar.notify_all();
                        }
                        WorkerToControllerMessage::SessionEnd => {
                            let mut guard = lock(&reader_inbox);
                            guard.session_end = true;
                            reader_cvar.notify_all();
                        }
                    }
                }
            })?;

        spawn_writer(rx, writer)?;

        Ok(Self {
            sender: tx,
            inbox,
            cvar,
        })
    }

    pub fn send(&self, message: ControllerToWorkerMessage) -> Result<(), IpcSendError> {
        self.sender
            .send(Outgoing {
                message,
                flushed: None,
            })
            .map_err(|_| IpcSendError)
    }

    pub fn is_disconnected(&self) -> bool {
        lock(&self.inbox).disconnected
    }

    pub fn session_ended(&self) -> bool {
        lock(&self.inbox).session_end
    }

    pub fn wait_for_ready(&self, timeout: Duration) -> Result<WorkerInfo, IpcWaitError> {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.inbox);
        loop {
            if let Some(info) = guard.ready.take() {
                return Ok(info);
            }
            if guard.session_end {
                return Err(IpcWaitError::SessionEnd);
            }
            if guard.disconnected {
                return Err(IpcWaitError::Disconnected);
            }
            guard = self.wait_until(guard, deadline)?;
        }
    }

    /// Waits for the terminal reply to request `id`. Replies for older ids (left over from an
    /// abandoned request) are dropped.
    pub fn wait_for_reply(&self, id: u64, timeout: Duration) -> Result<EvalReply, IpcWaitError> {
        let deadline = Instant::now() + timeout;
        let mut guard = lock(&self.inbox);
        loop {
            while let Some((reply_id, reply)) = guard.replies.pop_front() {
                if reply_id == id {
                    return Ok(reply);
                }
                tracing::debug!("dropping stale reply for request {reply_id}");
            }
            if guard.session_end {
                return Err(IpcWaitError::SessionEnd);
            }
            if guard.disconnected {
                return Err(IpcWaitError::Disconnected);
            }
            guard = self.wait_until(guard, deadline)?;
        }
    }

    fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, ControllerIpcInbox>,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, ControllerIpcInbox>, IpcWaitError> {
        let now = Instant::now();
        if now >= deadline {
            return Err(IpcWaitError::Timeout);
        }
        let remaining = deadline.saturating_duration_since(now);
        let (next_guard, _timeout_res) = self
            .cvar
            .wait_timeout(guard, remaining)
            .unwrap_or_else(PoisonError::into_inner);
        Ok(next_guard)
    }
}

impl WorkerIpcConnection {
    fn new(transport: IpcTransport) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let inbox = Arc::new(Mutex::new(WorkerIpcInbox::default()));
        let cvar = Arc::new(Condvar::new());

        let reader_inbox = inbox.clone();
        let reader_cvar = cvar.clone();
        let IpcTransport { reader, writer } = transport;
        thread::Builder::new()
            .name("worker-ipc-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => {
                            let mut guard = lock(&reader_inbox);
                            guard.disconnected = true;
                            reader_cvar.notify_all();
                            break;
                        }
                        Ok(_) => {}
                    }
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Ok(message) = serde_json::from_str::<ControllerToWorkerMessage>(trimmed)
                    {
                        let mut guard = lock(&reader_inbox);
                        guard.queue.push_back(message);
                        reader_cvar.notify_all();
                    }
                }
            })?;

        spawn_writer(rx, writer)?;

        Ok(Self {
            sender: tx,
            inbox,
            cvar,
        })
    }

    pub fn send(&self, message: WorkerToControllerMessage) -> Result<(), IpcSendError> {
        self.sender
            .send(Outgoing {
                message,
                flushed: None,
            })
            .map_err(|_| IpcSendError)
    }

    /// Sends `message` and waits until the writer thread has flushed it to the pipe.
    pub fn send_flushed(
        &self,
        message: WorkerToControllerMessage,
        timeout: Duration,
    ) -> Result<(), IpcSendError> {
        let (flushed_tx, flushed_rx) = mpsc::channel();
        self.sender
            .send(Outgoing {
                message,
                flushed: Some(flushed_tx),
            })
            .map_err(|_| IpcSendError)?;
        flushed_rx.recv_timeout(timeout).map_err(|_| IpcSendError)
    }

    /// Blocks until the next controller message. `None` means the controller went away.
    pub fn recv(&self) -> Option<ControllerToWorkerMessage> {
        let mut guard = lock(&self.inbox);
        loop {
            if let Some(message) = guard.queue.pop_front() {
                return Some(message);
            }
            if guard.disconnected {
                return None;
            }
            guard = self.cvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

fn spawn_writer<T>(
    rx: mpsc::Receiver<Outgoing<T>>,
    mut writer: Box<dyn Write + Send>,
) -> io::Result<()>
where
    T: Serialize + Send + 'static,
{
    thread::Builder::new()
        .name("ipc-writer".to_string())
        .spawn(move || {
            for Outgoing { message, flushed } in rx {
                if let Ok(payload) = serde_json::to_string(&message) {
                    if writer.write_all(payload.as_bytes()).is_err() {
                        break;
                    }
                    if writer.write_all(b"\n").is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
                if let Some(flushed) = flushed {
                    let _ = flushed.send(());
                }
            }
        })?;
    Ok(())
}

pub struct IpcServer {
    #[cfg(target_family = "unix")]
    server_read: Option<std::io::PipeReader>,
    #[cfg(target_family = "unix")]
    server_write: Option<std::io::PipeWriter>,
    #[cfg(target_family = "unix")]
    child_fds: Option<IpcChildFds>,
}

#[cfg(target_family = "unix")]
pub(crate) struct IpcChildFds {
    pub(crate) read_fd: RawFd,
    pub(crate) write_fd: RawFd,
}

impl IpcServer {
    pub fn bind() -> io::Result<Self> {
        #[cfg(target_family = "unix")]
        {
            let (server_read, server_write, child_read, child_write) = create_pipe_pair()?;
            Ok(Self {
                server_read: Some(server_read),
                server_write: Some(server_write),
                child_fds: Some(IpcChildFds {
                    read_fd: child_read,
                    write_fd: child_write,
                }),
            })
        }
        #[cfg(not(target_family = "unix"))]
        {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "worker IPC is unsupported on this platform",
            ))
        }
    }

    #[cfg(target_family = "unix")]
    pub fn connect(mut self, on_stream: StreamHandler) -> io::Result<ControllerIpcConnection> {
        let Some(server_read) = self.server_read.take() else {
            return Err(io::Error::other("missing ipc read pipe"));
        };
        let Some(server_write) = self.server_write.take() else {
            return Err(io::Error::other("missing ipc write pipe"));
        };
        let conn = ControllerIpcConnection::new(
            IpcTransport {
                reader: Box::new(server_read),
                writer: Box::new(server_write),
            },
            on_stream,
        )?;
        tracing::debug!("ipc: connected");
        Ok(conn)
    }

    #[cfg(not(target_family = "unix"))]
    pub fn connect(self, _on_stream: StreamHandler) -> io::Result<ControllerIpcConnection> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "worker IPC is unsupported on this platform",
        ))
    }

    #[cfg(target_family = "unix")]
    pub(crate) fn take_child_fds(&mut self) -> Option<IpcChildFds> {
        self.child_fds.take()
    }
}

#[cfg(target_family = "unix")]
impl Drop for IpcServer {
    fn drop(&mut self) {
        // Child ends are normally closed right after spawn; close them here if spawn failed.
        if let Some(fds) = self.child_fds.take() {
            unsafe {
                libc::close(fds.read_fd);
                libc::close(fds.write_fd);
            }
        }
    }
}

pub fn connect_from_env() -> io::Result<WorkerIpcConnection> {
    #[cfg(target_family = "unix")]
    {
        let read_fd = std::env::var(IPC_READ_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "IPC read fd missing"))?;
        let write_fd = std::env::var(IPC_WRITE_FD_ENV)
            .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "IPC write fd missing"))?;
        let read_fd: RawFd = read_fd
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPC read fd"))?;
        let write_fd: RawFd = write_fd
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid IPC write fd"))?;
        set_cloexec(read_fd, true)?;
        set_cloexec(write_fd, true)?;
        let reader = unsafe { File::from_raw_fd(read_fd) };
        let writer = unsafe { File::from_raw_fd(write_fd) };
        WorkerIpcConnection::new(IpcTransport {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
    #[cfg(not(target_family = "unix"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "worker IPC is unsupported on this platform",
        ))
    }
}

struct IpcTransport {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

#[cfg(target_family = "unix")]
fn set_cloexec(fd: RawFd, enabled: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let new_flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_family = "unix")]
fn create_pipe_pair() -> io::Result<(std::io::PipeReader, std::io::PipeWriter, RawFd, RawFd)> {
    let (server_read, child_write) = std::io::pipe()?;
    let (child_read, server_write) = std::io::pipe()?;

    let child_read_fd = child_read.into_raw_fd();
    let child_write_fd = child_write.into_raw_fd();

    set_cloexec(child_read_fd, false)?;
    set_cloexec(child_write_fd, false)?;
    set_cloexec(server_read.as_raw_fd(), true)?;
    set_cloexec(server_write.as_raw_fd(), true)?;

    Ok((server_read, server_write, child_read_fd, child_write_fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    type Received = Arc<Mutex<Vec<(StreamChannel, String)>>>;

    fn loopback() -> (ControllerIpcConnection, WorkerIpcConnection, Received) {
        let (controller_read, worker_write) = std::io::pipe().expect("pipe");
        let (worker_read, controller_write) = std::io::pipe().expect("pipe");
        let received: Received = Arc::default();
        let sink = received.clone();
        let controller = ControllerIpcConnection::new(
            IpcTransport {
                reader: Box::new(controller_read),
                writer: Box::new(controller_write),
            },
            Arc::new(move |channel, data| sink.lock().unwrap().push((channel, data))),
        )
        .expect("controller connection");
        let worker = WorkerIpcConnection::new(IpcTransport {
            reader: Box::new(worker_read),
            writer: Box::new(worker_write),
        })
        .expect("worker connection");
        (controller, worker, received)
    }

    #[test]
    fn messages_use_snake_case_type_tags() {
        let json = serde_json::to_string(&ControllerToWorkerMessage::Evaluate {
            id: 7,
            text: "1+1".to_string(),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"type":"evaluate","id":7,"text":"1+1"}"#);
        let json = serde_json::to_string(&ControllerToWorkerMessage::Interrupt).expect("ser");
        assert_eq!(json, r#"{"type":"interrupt"}"#);
    }

    #[test]
    fn reply_round_trips_between_connections() {
        let (controller, worker, received) = loopback();
        controller
            .send(ControllerToWorkerMessage::Evaluate {
                id: 1,
                text: "1+1".to_string(),
            })
            .expect("send evaluate");
        assert_eq!(
            worker.recv(),
            Some(ControllerToWorkerMessage::Evaluate {
                id: 1,
                text: "1+1".to_string()
            })
        );
        worker
            .send(WorkerToControllerMessage::StreamData {
                channel: StreamChannel::Out,
                data: "hi\n".to_string(),
            })
            .expect("send stream");
        worker
            .send(WorkerToControllerMessage::Reply {
                id: 1,
                reply: EvalReply::value("2"),
            })
            .expect("send reply");
        let reply = controller
            .wait_for_reply(1, Duration::from_secs(5))
            .expect("reply");
        assert_eq!(reply, EvalReply::value("2"));
        // Output is handed over before the reply that follows it is queued.
        assert_eq!(
            *received.lock().unwrap(),
            vec![(StreamChannel::Out, "hi\n".to_string())]
        );
    }

    #[test]
    fn stale_replies_are_skipped() {
        let (controller, worker, _) = loopback();
        worker
            .send(WorkerToControllerMessage::Reply {
                id: 1,
                reply: EvalReply::interrupted(),
            })
            .expect("send");
        worker
            .send(WorkerToControllerMessage::Reply {
                id: 2,
                reply: EvalReply::unit(),
            })
            .expect("send");
        let reply = controller
            .wait_for_reply(2, Duration::from_secs(5))
            .expect("reply");
        assert_eq!(reply, EvalReply::unit());
    }

    #[test]
    fn wait_reports_disconnect_when_worker_drops() {
        let (controller, worker, _) = loopback();
        drop(worker);
        // The worker-side writer thread exits once its sender is dropped, closing the pipe.
        let err = controller
            .wait_for_reply(1, Duration::from_secs(5))
            .expect_err("disconnect");
        assert_eq!(err, IpcWaitError::Disconnected);
    }
}
