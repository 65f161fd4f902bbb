pub mod config;
pub mod console;
pub mod debug_console;
pub mod document_cache;
pub mod error;
pub mod evaluator;
pub mod event_log;
pub mod events;
pub mod history;
pub mod interactions;
pub mod ipc;
pub mod worker;
pub mod worker_process;
pub mod worker_protocol;

pub use config::EngineConfig;
pub use console::{ConsoleChannel, ConsoleSink, StdConsoleSink, StreamMultiplexer};
pub use document_cache::{DocumentCache, DocumentId};
pub use error::InteractionError;
pub use events::{CompletionStatus, EngineEvent, EventDispatcher, EventScope};
pub use history::{FileOpenSelector, FileSaveSelector, History, InteractionsScript};
pub use interactions::{InteractionOutcome, InteractionsController, RequestId};
pub use worker_process::SessionState;
