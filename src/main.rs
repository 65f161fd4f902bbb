use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use workbench_repl::config::EngineConfig;
use workbench_repl::event_log::{self, DebugRecord};
use workbench_repl::{debug_console, worker};

const LOG_FILTER_ENV: &str = "WORKBENCH_LOG";

#[derive(Debug, Parser)]
#[command(name = "workbench-repl", version, about = "Interactive interpreter console")]
struct Cli {
    /// TOML config file.
    #[arg(long, env = "WORKBENCH_CONFIG")]
    config: Option<PathBuf>,
    /// Working directory for the interpreter.
    #[arg(long)]
    working_dir: Option<PathBuf>,
    /// Module search path, separated like PATH.
    #[arg(long)]
    class_path: Option<String>,
    /// Directory for the JSONL debug event log.
    #[arg(long)]
    debug_events_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(target_family = "unix")]
    // A closed console pipe should surface as a write error, not kill the process.
    ignore_sigpipe();

    // Workers are launched with `--worker`, which the console's parser does not accept.
    if worker::is_worker_mode() {
        return worker::run();
    }

    let cli = Cli::parse();
    init_tracing();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.working_dir {
        config.working_dir = Some(dir);
    }
    if let Some(raw) = cli.class_path.as_deref() {
        config.class_path = std::env::split_paths(raw).collect();
    }
    if let Some(dir) = cli.debug_events_dir {
        config.debug_events_dir = Some(dir);
    }

    event_log::initialize(
        config.debug_events_dir.clone(),
        DebugRecord::Startup {
            mode: "console".to_string(),
            working_dir: config.resolve_working_dir(),
            class_path: config.class_path.clone(),
            cache_capacity: config.cache.capacity,
        },
    )?;
    tracing::debug!(?config, "configuration loaded");
    debug_console::run(config)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(target_family = "unix")]
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
