//! Console feed shared by the interactions controller and the worker output readers.
//!
//! Every chunk of text that reaches the user's console passes through [`StreamMultiplexer`]:
//! echoed input, the worker's `Out`/`Err` stream data and anything the worker process writes
//! to its raw stdout/stderr. The feed keeps a bounded, offset-addressed history so callers can
//! read back what a single interaction produced.

use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::worker_protocol::StreamChannel;

pub const DEFAULT_FEED_CAPACITY_BYTES: usize = 2 * 1024 * 1024;
const TRUNCATION_NOTICE: &str = "[workbench-repl] console output truncated (older output dropped)\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleChannel {
    Out,
    Err,
    Echo,
}

impl From<StreamChannel> for ConsoleChannel {
    fn from(channel: StreamChannel) -> Self {
        match channel {
            StreamChannel::Out => ConsoleChannel::Out,
            StreamChannel::Err => ConsoleChannel::Err,
        }
    }
}

/// Where console text is rendered. Implementations must tolerate calls from any thread.
pub trait ConsoleSink: Send + Sync {
    fn print_out(&self, text: &str);
    fn print_err(&self, text: &str);
    fn echo_input(&self, text: &str);
}

/// Writes to the process stdout/stderr, serializing writers so chunks never interleave.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdConsoleSink;

impl ConsoleSink for StdConsoleSink {
    fn print_out(&self, text: &str) {
        write_stdout_bytes(text.as_bytes());
    }

    fn print_err(&self, text: &str) {
        write_stderr_bytes(text.as_bytes());
    }

    fn echo_input(&self, text: &str) {
        let mut line = String::with_capacity(text.len() + 3);
        line.push_str("> ");
        line.push_str(text);
        if !text.ends_with('\n') {
            line.push('\n');
        }
        write_stdout_bytes(line.as_bytes());
    }
}

static OUTPUT_LOCK: Mutex<()> = Mutex::new(());
thread_local! {
    static OUTPUT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub(crate) fn with_output_lock<T>(f: impl FnOnce() -> T) -> T {
    OUTPUT_DEPTH.with(|depth| {
        let _guard = OutputLockGuard::new(depth);
        f()
    })
}

struct OutputLockGuard<'a> {
    depth: &'a Cell<usize>,
    guard: Option<MutexGuard<'static, ()>>,
}

impl<'a> OutputLockGuard<'a> {
    fn new(depth: &'a Cell<usize>) -> Self {
        // Re-entrant on the same thread: only the outermost caller takes the lock.
        let guard = (depth.get() == 0)
            .then(|| OUTPUT_LOCK.lock().unwrap_or_else(PoisonError::into_inner));
        depth.set(depth.get().saturating_add(1));
        Self { depth, guard }
    }
}

impl Drop for OutputLockGuard<'_> {
    fn drop(&mut self) {
        let current = self.depth.get();
        if current > 0 {
            self.depth.set(current - 1);
        }
        if self.depth.get() == 0 {
            self.guard.take();
        }
    }
}

fn write_stdout_bytes(bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    with_output_lock(|| {
        let stdout = io::stdout();
        let mut stdout = stdout.lock();
        let _ = write_all_bytes(&mut stdout, bytes);
    });
}

fn write_stderr_bytes(bytes: &[u8]) {
    if bytes.is_empty() {
        return;
    }
    with_output_lock(|| {
        let stderr = io::stderr();
        let mut stderr = stderr.lock();
        let _ = write_all_bytes(&mut stderr, bytes);
    });
}

fn write_all_bytes<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)?;
    writer.flush()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleChunk {
    pub offset: u64,
    pub channel: ConsoleChannel,
    pub text: String,
}

impl ConsoleChunk {
    fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.text.len() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConsoleRange {
    pub start_offset: u64,
    pub end_offset: u64,
    pub chunks: Vec<ConsoleChunk>,
    /// True when part of the requested range was already dropped from the feed.
    pub truncated: bool,
}

impl ConsoleRange {
    pub fn text(&self) -> String {
        self.chunks.iter().map(|chunk| chunk.text.as_str()).collect()
    }

    pub fn text_for(&self, channel: ConsoleChannel) -> String {
        self.chunks
            .iter()
            .filter(|chunk| chunk.channel == channel)
            .map(|chunk| chunk.text.as_str())
            .collect()
    }
}

struct FeedInner {
    chunks: VecDeque<ConsoleChunk>,
    start_offset: u64,
    end_offset: u64,
    buffered_bytes: usize,
}

impl FeedInner {
    fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            start_offset: 0,
            end_offset: 0,
            buffered_bytes: 0,
        }
    }

    fn make_room_for(&mut self, bytes: usize, capacity: usize) -> bool {
        let mut dropped = false;
        while self.buffered_bytes.saturating_add(bytes) > capacity {
            let Some(chunk) = self.chunks.pop_front() else {
                break;
            };
            self.buffered_bytes = self.buffered_bytes.saturating_sub(chunk.text.len());
            self.start_offset = chunk.end_offset();
            dropped = true;
        }
        dropped
    }

    fn push(&mut self, channel: ConsoleChannel, text: String) {
        let offset = self.end_offset;
        self.end_offset = offset.saturating_add(text.len() as u64);
        self.buffered_bytes = self.buffered_bytes.saturating_add(text.len());
        self.chunks.push_back(ConsoleChunk {
            offset,
            channel,
            text,
        });
    }
}

/// Ordered, append-only console feed. Chunks keep the order in which they were appended;
/// within a channel that is the production order.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Mutex<FeedInner>>,
    sink: Option<Arc<dyn ConsoleSink>>,
    capacity_bytes: usize,
}

impl StreamMultiplexer {
    pub fn new(sink: Option<Arc<dyn ConsoleSink>>) -> Self {
        Self::with_capacity(sink, DEFAULT_FEED_CAPACITY_BYTES)
    }

    pub fn with_capacity(sink: Option<Arc<dyn ConsoleSink>>, capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner::new())),
            sink,
            capacity_bytes: capacity_bytes.max(TRUNCATION_NOTICE.len() * 2),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `text` and forwards it to the sink. Returns the feed end offset after the append.
    pub fn append(&self, channel: ConsoleChannel, text: &str) -> u64 {
        if text.is_empty() {
            return self.end_offset();
        }
        // The sink is called under the feed lock so rendering order matches feed order.
        let mut guard = self.lock();
        let mut text = text;
        if text.len() > self.capacity_bytes {
            let mut cut = text.len() - self.capacity_bytes / 2;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text = &text[cut..];
        }
        if guard.make_room_for(text.len(), self.capacity_bytes) {
            let _ = guard.make_room_for(
                text.len().saturating_add(TRUNCATION_NOTICE.len()),
                self.capacity_bytes,
            );
            guard.push(ConsoleChannel::Err, TRUNCATION_NOTICE.to_string());
        }
        guard.push(channel, text.to_string());
        if let Some(sink) = self.sink.as_ref() {
            match channel {
                ConsoleChannel::Out => sink.print_out(text),
                ConsoleChannel::Err => sink.print_err(text),
                ConsoleChannel::Echo => sink.echo_input(text),
            }
        }
        guard.end_offset
    }

    pub fn append_stream(&self, channel: StreamChannel, text: &str) -> u64 {
        self.append(channel.into(), text)
    }

    pub fn end_offset(&self) -> u64 {
        self.lock().end_offset
    }

    pub fn start_offset(&self) -> u64 {
        self.lock().start_offset
    }

    /// Chunks overlapping `[start, end)`, clipped to the range.
    pub fn read_range(&self, start: u64, end: u64) -> ConsoleRange {
        let guard = self.lock();
        let end = end.min(guard.end_offset);
        let effective_start = start.max(guard.start_offset);
        let mut chunks = Vec::new();
        if effective_start < end {
            for chunk in guard.chunks.iter() {
                if chunk.offset >= end {
                    break;
                }
                if chunk.end_offset() <= effective_start {
                    continue;
                }
                let from = effective_start.saturating_sub(chunk.offset) as usize;
                let to = (end.min(chunk.end_offset()) - chunk.offset) as usize;
                let Some(text) = chunk.text.get(from..to) else {
                    continue;
                };
                chunks.push(ConsoleChunk {
                    offset: chunk.offset + from as u64,
                    channel: chunk.channel,
                    text: text.to_string(),
                });
            }
        }
        ConsoleRange {
            start_offset: effective_start,
            end_offset: end.max(effective_start),
            chunks,
            truncated: start < guard.start_offset,
        }
    }

    pub fn read_since(&self, start: u64) -> ConsoleRange {
        self.read_range(start, u64::MAX)
    }

    pub fn text(&self) -> String {
        self.read_since(0).text()
    }

    /// Clears the feed. Offsets restart from zero.
    pub fn reset(&self) {
        let mut guard = self.lock();
        *guard = FeedInner::new();
    }
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new(None)
    }
}
