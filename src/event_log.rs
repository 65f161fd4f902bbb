//! Opt-in JSONL trace of worker lifecycle, request timing and cache eviction.
//!
//! Enabled by `--debug-events-dir` or `WORKBENCH_DEBUG_EVENTS_DIR`. Each process writes its
//! own file; every line is one [`DebugRecord`] wrapped with a timestamp, a sequence number and
//! the writing pid.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::document_cache::{DeclineReason, DocumentId, EvictionReport};
use crate::events::EngineEvent;
use crate::interactions::RequestId;

pub const DEBUG_EVENTS_DIR_ENV: &str = "WORKBENCH_DEBUG_EVENTS_DIR";
const LOG_FILE_PREFIX: &str = "workbench-repl";
const MAX_NAME_ATTEMPTS: u32 = 1_000;

static LOGGER: OnceLock<Option<EventLogger>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DebugRecord {
    Startup {
        mode: String,
        working_dir: PathBuf,
        class_path: Vec<PathBuf>,
        cache_capacity: usize,
    },
    WorkerSpawned {
        worker_pid: u32,
        program: PathBuf,
        working_dir: PathBuf,
    },
    WorkerReady {
        worker_pid: u32,
        generation: u64,
        working_dir: PathBuf,
    },
    /// The worker exited without being asked to.
    WorkerExited {
        worker_pid: u32,
        status: String,
    },
    WorkerShutdown {
        worker_pid: u32,
        generation: u64,
    },
    WorkerCrashed {
        generation: u64,
        reason: String,
    },
    InteractionCompleted {
        request: RequestId,
        generation: u64,
        elapsed_ms: i64,
    },
    CacheEviction {
        trigger: PathBuf,
        evicted: Vec<PathBuf>,
        spilled: Vec<PathBuf>,
        declined: Vec<DeclinedDocument>,
    },
    /// A published [`EngineEvent`], nested under `detail`.
    Engine {
        detail: EngineEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclinedDocument {
    pub document: PathBuf,
    pub reason: String,
}

impl DebugRecord {
    /// `None` when the pass did nothing.
    pub fn cache_eviction(trigger: &DocumentId, report: &EvictionReport) -> Option<Self> {
        if report.is_empty() {
            return None;
        }
        let paths = |ids: &[DocumentId]| -> Vec<PathBuf> {
            ids.iter().map(|id| id.path().to_path_buf()).collect()
        };
        Some(DebugRecord::CacheEviction {
            trigger: trigger.path().to_path_buf(),
            evicted: paths(&report.evicted),
            spilled: paths(&report.spilled),
            declined: report
                .declined
                .iter()
                .map(|declined| DeclinedDocument {
                    document: declined.id.path().to_path_buf(),
                    reason: match &declined.reason {
                        DeclineReason::NoScratchTarget => "no_scratch_target".to_string(),
                        DeclineReason::EditedDuringFlush => "edited_during_flush".to_string(),
                        DeclineReason::FlushFailed(err) => format!("flush_failed: {err}"),
                    },
                })
                .collect(),
        })
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    ts: DateTime<Utc>,
    seq: u64,
    pid: u32,
    #[serde(flatten)]
    record: &'a DebugRecord,
}

#[derive(Debug)]
struct EventLogger {
    file: Mutex<File>,
    path: PathBuf,
    pid: u32,
    seq: AtomicU64,
}

impl EventLogger {
    fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let pid = std::process::id();
        let (file, path) = create_log_file(dir, Utc::now(), pid)?;
        Ok(Self {
            file: Mutex::new(file),
            path,
            pid,
            seq: AtomicU64::new(0),
        })
    }

    fn write(&self, record: &DebugRecord) -> io::Result<()> {
        let line = LogLine {
            ts: Utc::now(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            pid: self.pid,
            record,
        };
        let encoded = serde_json::to_string(&line).map_err(io::Error::other)?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{encoded}")?;
        file.flush()
    }
}

/// Opens the log once per process and writes `startup` as its first record. Later calls are
/// no-ops. Without a directory the log stays disabled.
pub fn initialize(dir: Option<PathBuf>, startup: DebugRecord) -> io::Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = match resolve_dir(dir) {
        Some(dir) => {
            let logger = EventLogger::open(&dir)?;
            logger.write(&startup)?;
            tracing::debug!(path = %logger.path.display(), "debug event log opened");
            Some(logger)
        }
        None => None,
    };
    let _ = LOGGER.set(logger);
    Ok(())
}

pub fn enabled() -> bool {
    matches!(LOGGER.get(), Some(Some(_)))
}

pub fn record(record: DebugRecord) {
    if let Some(Some(logger)) = LOGGER.get()
        && let Err(err) = logger.write(&record)
    {
        tracing::debug!("debug event log write failed: {err}");
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> Option<PathBuf> {
    dir.filter(|path| !path.as_os_str().is_empty()).or_else(|| {
        std::env::var_os(DEBUG_EVENTS_DIR_ENV)
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from)
    })
}

fn create_log_file(dir: &Path, now: DateTime<Utc>, pid: u32) -> io::Result<(File, PathBuf)> {
    let stamp = now.format("%Y%m%dT%H%M%S%.3fZ");
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = match attempt {
            0 => format!("{LOG_FILE_PREFIX}-{stamp}-{pid}.jsonl"),
            n => format!("{LOG_FILE_PREFIX}-{stamp}-{pid}.{n}.jsonl"),
        };
        let path = dir.join(name);
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free event log name in {}", dir.display()),
    ))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::{Value, json};

    use super::*;
    use crate::document_cache::Declined;

    #[test]
    fn records_carry_snake_case_event_tag() {
        let record = DebugRecord::WorkerReady {
            worker_pid: 42,
            generation: 3,
            working_dir: PathBuf::from("/work"),
        };
        assert_eq!(
            serde_json::to_value(&record).expect("serialize"),
            json!({
                "event": "worker_ready",
                "worker_pid": 42,
                "generation": 3,
                "working_dir": "/work"
            })
        );
    }

    #[test]
    fn empty_eviction_pass_is_not_recorded() {
        let trigger = DocumentId::new("/docs/a.txt");
        assert!(DebugRecord::cache_eviction(&trigger, &EvictionReport::default()).is_none());
    }

    #[test]
    fn eviction_record_lists_each_outcome() {
        let trigger = DocumentId::new("/docs/c.txt");
        let report = EvictionReport {
            evicted: vec![DocumentId::new("/docs/a.txt")],
            spilled: vec![DocumentId::new("/docs/a.txt")],
            declined: vec![Declined {
                id: DocumentId::new("/docs/b.txt"),
                reason: DeclineReason::EditedDuringFlush,
            }],
        };
        let record = DebugRecord::cache_eviction(&trigger, &report).expect("non-empty pass");
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["event"], "cache_eviction");
        assert_eq!(value["trigger"], "/docs/c.txt");
        assert_eq!(value["spilled"], json!(["/docs/a.txt"]));
        assert_eq!(
            value["declined"],
            json!([{"document": "/docs/b.txt", "reason": "edited_during_flush"}])
        );
    }

    #[test]
    fn logger_writes_one_sequenced_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::open(temp.path()).expect("open logger");
        logger
            .write(&DebugRecord::WorkerCrashed {
                generation: 2,
                reason: "killed".to_string(),
            })
            .expect("write crash");
        logger
            .write(&DebugRecord::WorkerShutdown {
                worker_pid: 7,
                generation: 3,
            })
            .expect("write shutdown");

        let text = fs::read_to_string(&logger.path).expect("read log");
        let lines: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["seq"], 1);
        assert_eq!(lines[0]["event"], "worker_crashed");
        assert_eq!(lines[0]["reason"], "killed");
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[1]["event"], "worker_shutdown");
        assert_eq!(lines[1]["generation"], 3);
        assert_eq!(lines[1]["worker_pid"], 7);
        assert_eq!(lines[1]["pid"], std::process::id());
        assert!(lines[1]["ts"].is_string());
    }

    #[test]
    fn log_file_name_collision_takes_next_suffix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let now = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 30, 0)
            .single()
            .expect("valid time");
        let (_first, first) = create_log_file(temp.path(), now, 9).expect("first");
        let (_second, second) = create_log_file(temp.path(), now, 9).expect("second");
        assert_eq!(
            first.file_name().and_then(|name| name.to_str()),
            Some("workbench-repl-20240501T123000.000Z-9.jsonl")
        );
        assert_eq!(
            second.file_name().and_then(|name| name.to_str()),
            Some("workbench-repl-20240501T123000.000Z-9.1.jsonl")
        );
    }
}
