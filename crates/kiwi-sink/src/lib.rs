// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sink Fan-Out (C8): dispatch a primitive's output stream to an ordered
//! list of sinks, synchronously per chunk — each sink returns before the
//! next chunk is dispatched. A non-critical sink's error is logged and
//! skipped rather than halting the stream (spec §4.8).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

/// Which primitive produced a chunk, carried through to sinks that care
/// (e.g. `stdout` only forwards `Stdout` chunks, never `Stderr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Stdout,
    Stderr,
    Http,
}

/// One chunk of primitive output, as delivered to every sink in turn.
#[derive(Debug, Clone)]
pub struct SinkEvent {
    pub source: EventSource,
    pub chunk: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl SinkEvent {
    #[must_use]
    pub fn new(source: EventSource, chunk: Vec<u8>, timestamp: DateTime<Utc>) -> Self {
        Self {
            source,
            chunk,
            timestamp,
        }
    }
}

/// Failure from a single sink's handling of one event.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink `{sink}` I/O error: {source}")]
    Io {
        sink: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sink `{sink}` could not decode chunk as UTF-8")]
    NotUtf8 { sink: String },
    #[error("sink `{sink}` failed to parse JSON: {source}")]
    Json {
        sink: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A single fan-out consumer. Implementors buffer, transform, discard, or
/// forward each event as it arrives (spec §4.8 contract).
pub trait Sink: Send {
    /// Stable name used in error messages and `critical` reporting.
    fn name(&self) -> &str;

    /// Handle one event. Called synchronously; the fan-out waits for this
    /// to return before dispatching the next event to the next sink.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] describing why this sink could not accept
    /// the event. Whether that aborts the stream depends on `critical()`.
    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError>;

    /// A sink's error halts the whole stream only when this is `true`
    /// (spec §4.8: "A sink that errors does not halt the stream unless
    /// marked `critical: true`").
    fn critical(&self) -> bool {
        false
    }
}

/// One declared sink plus the `critical` flag from its config, and whether
/// dispatch to it failed (for the caller to inspect after the stream ends).
struct SinkSlot {
    sink: Box<dyn Sink>,
    failed: Mutex<Option<String>>,
}

/// Dispatches events to an ordered list of sinks, in declaration order,
/// synchronously per chunk.
pub struct FanOut {
    slots: Vec<SinkSlot>,
}

impl FanOut {
    #[must_use]
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            slots: sinks
                .into_iter()
                .map(|sink| SinkSlot {
                    sink,
                    failed: Mutex::new(None),
                })
                .collect(),
        }
    }

    /// Dispatch one event to every sink in declaration order.
    ///
    /// # Errors
    ///
    /// Returns the first [`SinkError`] raised by a `critical` sink, aborting
    /// before later sinks in this call run. Non-critical sink errors are
    /// logged via `tracing` and recorded for [`FanOut::failures`], but do
    /// not stop the dispatch.
    pub fn dispatch(&self, event: &SinkEvent) -> Result<(), SinkError> {
        for slot in &self.slots {
            if let Err(err) = slot.sink.accept(event) {
                if slot.sink.critical() {
                    return Err(err);
                }
                tracing::warn!(sink = slot.sink.name(), error = %err, "non-critical sink error");
                *slot.failed.lock().expect("sink failure lock poisoned") = Some(err.to_string());
            }
        }
        Ok(())
    }

    /// Names of sinks that raised a non-critical error during this fan-out's
    /// lifetime, with their last error message.
    #[must_use]
    pub fn failures(&self) -> Vec<(String, String)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                slot.failed
                    .lock()
                    .expect("sink failure lock poisoned")
                    .clone()
                    .map(|msg| (slot.sink.name().to_string(), msg))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Stock sinks (spec §4.8: return, stdout, file, parse_json, line_split,
// regex_extract)
// ---------------------------------------------------------------------------

/// Accumulates every chunk verbatim into the final response (the default
/// sink when a caller declares none).
#[derive(Default)]
pub struct ReturnSink {
    buffer: Mutex<Vec<u8>>,
}

impl ReturnSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything accumulated so far.
    #[must_use]
    pub fn collected(&self) -> Vec<u8> {
        self.buffer.lock().expect("return sink lock poisoned").clone()
    }
}

impl Sink for ReturnSink {
    fn name(&self) -> &str {
        "return"
    }

    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
        self.buffer
            .lock()
            .expect("return sink lock poisoned")
            .extend_from_slice(&event.chunk);
        Ok(())
    }
}

/// Forwards `stdout`-sourced chunks to `tracing` at info level; `stderr` and
/// `http` chunks are ignored (mirrors a terminal echoing only the primitive's
/// stdout stream).
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
        if event.source != EventSource::Stdout {
            return Ok(());
        }
        match std::str::from_utf8(&event.chunk) {
            Ok(text) => {
                tracing::info!(target: "kiwi_sink.stdout", "{text}");
                Ok(())
            }
            Err(_) => Err(SinkError::NotUtf8 {
                sink: "stdout".to_string(),
            }),
        }
    }
}

/// Appends every chunk to a file, creating parent directories on first
/// write. One `FileSink` instance is scoped to a single fan-out call.
pub struct FileSink {
    path: PathBuf,
    handle: Mutex<Option<std::fs::File>>,
}

impl FileSink {
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the parent directory cannot be created.
    pub fn new(path: PathBuf) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SinkError::Io {
                sink: "file".to_string(),
                source,
            })?;
        }
        Ok(Self {
            path,
            handle: Mutex::new(None),
        })
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    fn critical(&self) -> bool {
        true
    }

    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
        use std::io::Write;
        let mut handle = self.handle.lock().expect("file sink lock poisoned");
        if handle.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|source| SinkError::Io {
                    sink: "file".to_string(),
                    source,
                })?;
            *handle = Some(file);
        }
        handle
            .as_mut()
            .expect("handle populated above")
            .write_all(&event.chunk)
            .map_err(|source| SinkError::Io {
                sink: "file".to_string(),
                source,
            })
    }
}

/// Accumulates chunks and, on request, parses the full buffer as JSON.
/// Non-critical by default: a malformed buffer is reported but does not
/// halt sibling sinks.
#[derive(Default)]
pub struct ParseJsonSink {
    buffer: Mutex<Vec<u8>>,
}

impl ParseJsonSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse everything accumulated so far as a single JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Json`] if the buffer is not valid JSON.
    pub fn parse(&self) -> Result<serde_json::Value, SinkError> {
        let buffer = self.buffer.lock().expect("parse_json sink lock poisoned");
        serde_json::from_slice(&buffer).map_err(|source| SinkError::Json {
            sink: "parse_json".to_string(),
            source,
        })
    }
}

impl Sink for ParseJsonSink {
    fn name(&self) -> &str {
        "parse_json"
    }

    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
        self.buffer
            .lock()
            .expect("parse_json sink lock poisoned")
            .extend_from_slice(&event.chunk);
        Ok(())
    }
}

/// Buffers partial chunks and emits complete newline-terminated lines via
/// `on_line`, called synchronously as each line completes.
pub struct LineSplitSink {
    pending: Mutex<Vec<u8>>,
    on_line: Box<dyn Fn(&str) + Send + Sync>,
}

impl LineSplitSink {
    pub fn new(on_line: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            on_line: Box::new(on_line),
        }
    }
}

impl Sink for LineSplitSink {
    fn name(&self) -> &str {
        "line_split"
    }

    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
        let mut pending = self.pending.lock().expect("line_split sink lock poisoned");
        pending.extend_from_slice(&event.chunk);
        loop {
            let Some(newline_at) = pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = pending.drain(..=newline_at).collect();
            let text = String::from_utf8_lossy(&line);
            (self.on_line)(text.trim_end_matches(['\n', '\r']));
        }
        Ok(())
    }
}

/// Accumulates chunks and extracts every match of a regex against the full
/// buffer, calling `on_match` for each capture-group-0 match found.
pub struct RegexExtractSink {
    buffer: Mutex<Vec<u8>>,
    pattern: Regex,
    on_match: Box<dyn Fn(&str) + Send + Sync>,
}

impl RegexExtractSink {
    /// # Errors
    ///
    /// Returns an error if `pattern` fails to compile.
    pub fn new(
        pattern: &str,
        on_match: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            buffer: Mutex::new(Vec::new()),
            pattern: Regex::new(pattern)?,
            on_match: Box::new(on_match),
        })
    }
}

impl Sink for RegexExtractSink {
    fn name(&self) -> &str {
        "regex_extract"
    }

    fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
        let mut buffer = self.buffer.lock().expect("regex_extract sink lock poisoned");
        buffer.extend_from_slice(&event.chunk);
        let text = String::from_utf8_lossy(&buffer);
        for m in self.pattern.find_iter(&text) {
            (self.on_match)(m.as_str());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(bytes: &[u8]) -> SinkEvent {
        SinkEvent::new(EventSource::Stdout, bytes.to_vec(), Utc::now())
    }

    #[test]
    fn fan_out_delivers_in_declaration_order_to_every_sink() {
        let a = std::sync::Arc::new(ReturnSink::new());
        let b = std::sync::Arc::new(ReturnSink::new());
        let fan_out = FanOut::new(vec![
            Box::new(ArcSink(a.clone())),
            Box::new(ArcSink(b.clone())),
        ]);
        fan_out.dispatch(&event(b"hello ")).unwrap();
        fan_out.dispatch(&event(b"world")).unwrap();
        assert_eq!(a.collected(), b"hello world");
        assert_eq!(b.collected(), b"hello world");
    }

    struct ArcSink(std::sync::Arc<ReturnSink>);
    impl Sink for ArcSink {
        fn name(&self) -> &str {
            "return"
        }
        fn accept(&self, event: &SinkEvent) -> Result<(), SinkError> {
            self.0.accept(event)
        }
    }

    struct AlwaysFails {
        critical: bool,
    }
    impl Sink for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }
        fn critical(&self) -> bool {
            self.critical
        }
        fn accept(&self, _event: &SinkEvent) -> Result<(), SinkError> {
            Err(SinkError::NotUtf8 {
                sink: "broken".to_string(),
            })
        }
    }

    #[test]
    fn non_critical_sink_error_does_not_halt_the_stream() {
        let tail = std::sync::Arc::new(ReturnSink::new());
        let fan_out = FanOut::new(vec![
            Box::new(AlwaysFails { critical: false }),
            Box::new(ArcSink(tail.clone())),
        ]);
        fan_out.dispatch(&event(b"x")).unwrap();
        assert_eq!(tail.collected(), b"x");
        assert_eq!(fan_out.failures().len(), 1);
    }

    #[test]
    fn critical_sink_error_halts_the_stream() {
        let tail = std::sync::Arc::new(ReturnSink::new());
        let fan_out = FanOut::new(vec![
            Box::new(AlwaysFails { critical: true }),
            Box::new(ArcSink(tail.clone())),
        ]);
        assert!(fan_out.dispatch(&event(b"x")).is_err());
        assert_eq!(tail.collected(), b"", "later sinks never ran");
    }

    #[test]
    fn line_split_emits_complete_lines_only() {
        let lines = std::sync::Arc::new(Mutex::new(Vec::<String>::new()));
        let collector = lines.clone();
        let sink = LineSplitSink::new(move |line| collector.lock().unwrap().push(line.to_string()));
        sink.accept(&event(b"foo\nbar")).unwrap();
        assert_eq!(*lines.lock().unwrap(), vec!["foo".to_string()]);
        sink.accept(&event(b"baz\n")).unwrap();
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["foo".to_string(), "barbaz".to_string()]
        );
    }

    #[test]
    fn regex_extract_finds_every_match_across_chunks() {
        let matches = std::sync::Arc::new(Mutex::new(Vec::<String>::new()));
        let collector = matches.clone();
        let sink = RegexExtractSink::new(r"\d+", move |m| collector.lock().unwrap().push(m.to_string())).unwrap();
        sink.accept(&event(b"id=1 id=2")).unwrap();
        assert_eq!(*matches.lock().unwrap(), vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn parse_json_sink_parses_full_accumulated_buffer() {
        let sink = ParseJsonSink::new();
        sink.accept(&event(b"{\"a\":")).unwrap();
        sink.accept(&event(b"1}")).unwrap();
        let value = sink.parse().unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn file_sink_appends_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let sink = FileSink::new(path.clone()).unwrap();
        sink.accept(&event(b"a")).unwrap();
        sink.accept(&event(b"b")).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ab");
    }
}
