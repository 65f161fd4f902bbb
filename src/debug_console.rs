//! Line-oriented console for driving the engine by hand.
//!
//! Input lines are evaluated one at a time; a line ending in `\` continues onto the next.
//! Upper-case words on a line of their own are console commands; the startup banner lists them.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::console::{StdConsoleSink, StreamMultiplexer};
use crate::document_cache::{DocumentCache, DocumentId};
use crate::events::{EngineEvent, EventDispatcher, EventScope};
use crate::interactions::{
    InteractionOutcome, InteractionResult, InteractionsController, PendingInteraction,
};

const OUTCOME_POLL_INTERVAL: Duration = Duration::from_millis(25);

const HELP: &str = "commands: INTERRUPT | RESET [dir] | HISTORY | SAVE <file> | LOAD <file> | \
CLEAR | CLASSPATH <paths> | OPEN <file> | CLOSE <file> | DOCS | QUIT (or Ctrl-D)";

enum Line {
    Input(String),
    Eof,
}

pub fn run(config: EngineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let events = EventDispatcher::new()?;
    events.subscribe(
        &[EventScope::Session, EventScope::Warnings, EventScope::Interactions],
        |event: &EngineEvent| report_event(event),
    );
    let feed = StreamMultiplexer::new(Some(Arc::new(StdConsoleSink)));
    let controller = InteractionsController::new(config.clone(), events, feed)?;
    let documents = DocumentCache::with_fs(config.cache.capacity, config.cache.scratch_dir.clone());

    eprintln!("workbench console: end a line with \\ to continue it | {HELP}");
    let lines = spawn_stdin_reader()?;

    while let Some(input) = read_input(&lines)? {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (command, argument) = split_command(trimmed);
        match command {
            "QUIT" => break,
            "INTERRUPT" => controller.interrupt(),
            "RESET" => {
                let dir = (!argument.is_empty()).then(|| PathBuf::from(argument));
                if let Err(err) = controller.blocking_reset(dir) {
                    eprintln!("[workbench] reset failed: {err}");
                }
            }
            "HISTORY" => print!("{}", controller.history_as_string()),
            "CLEAR" => controller.clear_history(),
            "SAVE" if !argument.is_empty() => {
                match controller.save_history(&PathBuf::from(argument), None) {
                    Ok(path) => eprintln!("[workbench] history saved to {}", path.display()),
                    Err(err) => eprintln!("[workbench] {err}"),
                }
            }
            "LOAD" if !argument.is_empty() => {
                match controller.load_history(&PathBuf::from(argument)) {
                    Ok(replay) => match replay.blocking_outcome() {
                        Ok(summary) => eprintln!(
                            "[workbench] replayed {} interaction(s), {} skipped",
                            summary.executed, summary.remaining
                        ),
                        Err(err) => eprintln!("[workbench] replay failed: {err}"),
                    },
                    Err(err) => eprintln!("[workbench] {err}"),
                }
            }
            "CLASSPATH" => {
                controller.update_class_path(std::env::split_paths(argument).collect());
            }
            "OPEN" if !argument.is_empty() => {
                let id = DocumentId::new(argument);
                match documents.get_with_report(&id) {
                    Ok((rope, report)) => {
                        documents.mark_open(&id);
                        eprintln!(
                            "[workbench] {} lines, {} chars",
                            rope.len_lines(),
                            rope.len_chars()
                        );
                        for err in report.errors() {
                            eprintln!("[workbench] eviction: {err}");
                        }
                    }
                    Err(err) => eprintln!("[workbench] {err}"),
                }
            }
            "CLOSE" if !argument.is_empty() => documents.mark_closed(&DocumentId::new(argument)),
            "DOCS" => {
                for id in documents.resident_ids() {
                    let Some(info) = documents.document_info(&id) else {
                        continue;
                    };
                    let dirty = if info.dirty { " (modified)" } else { "" };
                    println!(
                        "{}{dirty} last used {}",
                        id.path().display(),
                        info.last_access.format("%H:%M:%S")
                    );
                }
            }
            "SAVE" | "LOAD" | "OPEN" | "CLOSE" => eprintln!("[workbench] {command} needs a path"),
            _ => match controller.submit(&input) {
                Ok(pending) => await_outcome(&controller, pending, &lines)?,
                Err(err) => eprintln!("[workbench] {err}"),
            },
        }
    }

    controller.blocking_shutdown();
    controller.events().flush(Duration::from_secs(1));
    Ok(())
}

/// Waits for `pending`, still honouring `INTERRUPT` and `RESET` typed in the meantime.
fn await_outcome(
    controller: &InteractionsController,
    mut pending: PendingInteraction,
    lines: &mpsc::Receiver<Line>,
) -> io::Result<()> {
    loop {
        if let Some(result) = pending.try_outcome() {
            return print_result(result);
        }
        match lines.recv_timeout(OUTCOME_POLL_INTERVAL) {
            Ok(Line::Input(line)) => match split_command(line.trim()) {
                ("INTERRUPT", _) => controller.interrupt(),
                ("RESET", dir) => {
                    let dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
                    let controller = controller.clone();
                    // The pending request resolves as cancelled once the reset begins.
                    thread::spawn(move || {
                        if let Err(err) = controller.blocking_reset(dir) {
                            eprintln!("[workbench] reset failed: {err}");
                        }
                    });
                }
                _ => eprintln!("[workbench] busy; only INTERRUPT and RESET are accepted"),
            },
            Ok(Line::Eof) | Err(RecvTimeoutError::Disconnected) => {
                controller.interrupt();
                return print_result(pending.blocking_outcome());
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn print_result(result: InteractionResult) -> io::Result<()> {
    let mut stdout = io::stdout();
    match result {
        Ok(InteractionOutcome::Value(Some(value))) => writeln!(stdout, "{value}")?,
        Ok(InteractionOutcome::Value(None)) => {}
        Ok(InteractionOutcome::Error(description)) => eprintln!("[workbench] error: {description}"),
        Err(err) => eprintln!("[workbench] {err}"),
    }
    stdout.flush()
}

fn spawn_stdin_reader() -> io::Result<mpsc::Receiver<Line>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            let mut stdin = stdin.lock();
            loop {
                let mut line = String::new();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => {
                        let _ = tx.send(Line::Eof);
                        return;
                    }
                    Ok(_) => {
                        if tx.send(Line::Input(line)).is_err() {
                            return;
                        }
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Joins continuation lines. `None` at end of input.
fn read_input(lines: &mpsc::Receiver<Line>) -> io::Result<Option<String>> {
    let mut input = String::new();
    loop {
        let line = match lines.recv() {
            Ok(Line::Input(line)) => line,
            Ok(Line::Eof) | Err(_) => {
                return Ok((!input.is_empty()).then_some(input));
            }
        };
        let (body, continued) = split_continuation(&line);
        input.push_str(body);
        if !continued {
            return Ok(Some(input));
        }
        input.push('\n');
    }
}

fn split_continuation(line: &str) -> (&str, bool) {
    let body = strip_line_ending(line);
    match body.strip_suffix('\\') {
        Some(prefix) => (prefix, true),
        None => (body, false),
    }
}

fn strip_line_ending(line: &str) -> &str {
    line.strip_suffix("\r\n")
        .or_else(|| line.strip_suffix('\n'))
        .unwrap_or(line)
}

fn split_command(line: &str) -> (&str, &str) {
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    if head.chars().all(|c| c.is_ascii_uppercase()) && !head.is_empty() {
        (head, rest.trim())
    } else {
        ("", line)
    }
}

fn report_event(event: &EngineEvent) {
    match event {
        EngineEvent::InterpreterReset {
            working_dir,
            generation,
        } => eprintln!(
            "[workbench] interpreter reset (generation {generation}) in {}",
            working_dir.display()
        ),
        EngineEvent::WorkerStartupFailed { reason } => {
            eprintln!("[workbench] interpreter failed to start: {reason}")
        }
        EngineEvent::WorkerCrashed { generation, reason } => {
            eprintln!("[workbench] interpreter {generation} crashed: {reason}; restarting")
        }
        EngineEvent::ReplayAborted {
            executed,
            remaining,
        } => eprintln!("[workbench] replay stopped after {executed}, {remaining} not run"),
        EngineEvent::Warning { message } => eprintln!("[workbench] warning: {message}"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_lines_are_joined() {
        let (tx, rx) = mpsc::channel();
        tx.send(Line::Input("let x = 1 + \\\n".to_string())).unwrap();
        tx.send(Line::Input("2;\r\n".to_string())).unwrap();
        tx.send(Line::Eof).unwrap();
        assert_eq!(
            read_input(&rx).unwrap().as_deref(),
            Some("let x = 1 + \n2;")
        );
        assert_eq!(read_input(&rx).unwrap(), None);
    }

    #[test]
    fn commands_are_upper_case_words() {
        assert_eq!(split_command("RESET /tmp/work"), ("RESET", "/tmp/work"));
        assert_eq!(split_command("HISTORY"), ("HISTORY", ""));
        assert_eq!(split_command("print(1)"), ("", "print(1)"));
    }
}
