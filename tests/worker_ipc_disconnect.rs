mod common;

#[cfg(target_family = "unix")]
mod unix {
    use std::io::{BufRead, BufReader, PipeReader, Write};
    use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
    use std::path::PathBuf;
    use std::process::Stdio;
    use std::time::Duration;

    use tokio::process::Command;
    use tokio::time;
    use workbench_repl::ipc::{IPC_READ_FD_ENV, IPC_WRITE_FD_ENV, WorkerToControllerMessage};
    use workbench_repl::worker_protocol::{CLASS_PATH_ENV, EvalReply};

    use crate::common::{TestResult, worker_exe};

    const LINE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Lets the worker inherit `fd` across exec.
    fn inheritable(fd: RawFd) -> TestResult<RawFd> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(fd)
    }

    async fn read_message(
        reader: BufReader<PipeReader>,
    ) -> TestResult<(WorkerToControllerMessage, BufReader<PipeReader>)> {
        let read = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut line = String::new();
            reader.read_line(&mut line).map(|_| (line, reader))
        });
        let (line, reader) = time::timeout(LINE_TIMEOUT, read)
            .await
            .map_err(|_| "no message from worker")???;
        let message = serde_json::from_str(line.trim_end())
            .map_err(|err| format!("bad worker line {line:?}: {err}"))?;
        Ok((message, reader))
    }

    #[tokio::test]
    async fn worker_announces_itself_then_exits_when_ipc_closes() -> TestResult<()> {
        let temp = tempfile::tempdir()?;
        // std pipes are close-on-exec, so only the child ends are handed to the worker.
        let (controller_read, child_write) = std::io::pipe()?;
        let (child_read, mut controller_write) = std::io::pipe()?;
        let child_read = inheritable(child_read.into_raw_fd())?;
        let child_write = inheritable(child_write.into_raw_fd())?;

        let mut child = Command::new(worker_exe())
            .arg("--worker")
            .current_dir(temp.path())
            .env(IPC_READ_FD_ENV, child_read.to_string())
            .env(IPC_WRITE_FD_ENV, child_write.to_string())
            .env(CLASS_PATH_ENV, "/lib/one")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        // The controller keeps only its own ends; otherwise EOF never reaches the worker.
        drop(unsafe { OwnedFd::from_raw_fd(child_read) });
        drop(unsafe { OwnedFd::from_raw_fd(child_write) });

        let (ready, reader) = read_message(BufReader::new(controller_read)).await?;
        let WorkerToControllerMessage::Ready { info } = ready else {
            return Err(format!("expected ready first, got {ready:?}").into());
        };
        assert_eq!(Some(info.pid), child.id());
        assert_eq!(
            info.working_dir.canonicalize()?,
            temp.path().canonicalize()?
        );
        assert_eq!(info.class_path, vec![PathBuf::from("/lib/one")]);

        writeln!(
            controller_write,
            r#"{{"type":"evaluate","id":1,"text":"40 + 2"}}"#
        )?;
        controller_write.flush()?;
        let (reply, reader) = read_message(reader).await?;
        assert_eq!(
            reply,
            WorkerToControllerMessage::Reply {
                id: 1,
                reply: EvalReply::value("42"),
            }
        );

        drop(controller_write);
        drop(reader);
        let status = match time::timeout(LINE_TIMEOUT, child.wait()).await {
            Ok(status) => status?,
            Err(_) => return Err("worker did not exit after IPC closed".into()),
        };
        assert!(status.success(), "worker exit status: {status:?}");
        Ok(())
    }
}
