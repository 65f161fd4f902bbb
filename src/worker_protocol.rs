use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const WORKER_MODE_ARG: &str = "worker";
pub const CLASS_PATH_ENV: &str = "WORKBENCH_WORKER_CLASS_PATH";
pub const INTERRUPTED_DESCRIPTION: &str = "interrupted";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Out,
    Err,
}

/// Terminal answer to one `Evaluate` request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvalReply {
    Value {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    Error {
        description: String,
        #[serde(default)]
        interrupted: bool,
    },
}

impl EvalReply {
    pub fn value(result: impl Into<String>) -> Self {
        EvalReply::Value {
            result: Some(result.into()),
        }
    }

    pub fn unit() -> Self {
        EvalReply::Value { result: None }
    }

    pub fn error(description: impl Into<String>) -> Self {
        EvalReply::Error {
            description: description.into(),
            interrupted: false,
        }
    }

    pub fn interrupted() -> Self {
        EvalReply::Error {
            description: INTERRUPTED_DESCRIPTION.to_string(),
            interrupted: true,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EvalReply::Error { .. })
    }
}

/// What the worker reports once it can accept `Evaluate` requests.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub pid: u32,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub class_path: Vec<PathBuf>,
}

pub fn is_worker_mode_arg(arg: &str) -> bool {
    arg == WORKER_MODE_ARG || arg.strip_prefix("--") == Some(WORKER_MODE_ARG)
}

pub fn class_path_from_env() -> Vec<PathBuf> {
    std::env::var_os(CLASS_PATH_ENV)
        .map(|raw| std::env::split_paths(&raw).collect())
        .unwrap_or_default()
}
