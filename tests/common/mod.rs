#![allow(dead_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use workbench_repl::config::EngineConfig;
use workbench_repl::console::StreamMultiplexer;
use workbench_repl::events::{EngineEvent, EventDispatcher, EventScope};
use workbench_repl::interactions::InteractionsController;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn worker_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_workbench-repl"))
}

pub fn test_config(working_dir: &Path) -> EngineConfig {
    EngineConfig {
        worker_program: Some(worker_exe()),
        working_dir: Some(working_dir.to_path_buf()),
        startup_timeout_ms: 15_000,
        shutdown_grace_ms: 1_000,
        interrupt_grace_ms: 1_000,
        ..EngineConfig::default()
    }
}

pub struct TestEngine {
    pub controller: InteractionsController,
    pub events: UnboundedReceiver<EngineEvent>,
    pub feed: StreamMultiplexer,
    pub temp: tempfile::TempDir,
}

impl TestEngine {
    pub fn start() -> TestResult<Self> {
        Self::start_with(|_| {})
    }

    pub fn start_with(adjust: impl FnOnce(&mut EngineConfig)) -> TestResult<Self> {
        let temp = tempfile::tempdir()?;
        let mut config = test_config(temp.path());
        adjust(&mut config);
        let dispatcher = EventDispatcher::new()?;
        let (_, events) = dispatcher.subscribe_channel(&EventScope::ALL);
        let feed = StreamMultiplexer::default();
        let controller = InteractionsController::new(Arc::new(config), dispatcher, feed.clone())?;
        Ok(Self {
            controller,
            events,
            feed,
            temp,
        })
    }

    /// Waits for the first event matching `pred`, returning every event seen up to it.
    pub async fn wait_for_event(
        &mut self,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> TestResult<Vec<EngineEvent>> {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .map_err(|_| format!("timed out waiting for event; saw {seen:?}"))?
                .ok_or("event channel closed")?;
            let done = pred(&event);
            seen.push(event);
            if done {
                return Ok(seen);
            }
        }
    }

    /// Events received so far without waiting.
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event);
        }
        seen
    }

    pub async fn shutdown(self) {
        self.controller.shutdown().await;
    }
}

pub fn count(events: &[EngineEvent], pred: impl Fn(&EngineEvent) -> bool) -> usize {
    events.iter().filter(|event| pred(event)).count()
}
