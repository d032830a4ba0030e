//! Bounded event bus between running agents and their observers.
//!
//! Every publish takes one mutex, appends to the ring buffer and calls each
//! observer in registration order before releasing it, so observers see one
//! global order. A full buffer evicts its oldest event and counts the drop.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::memory::model::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStarted,
    FileConsidered,
    FindingEmitted,
    LlmCall,
    AgentFinished,
    AgentFailed,
    Metric,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub content: String,
    pub metadata: Metadata,
}

pub trait Observer: Send {
    fn on_event(&mut self, event: &StreamEvent);

    fn flush(&mut self) {}
}

struct Inner {
    buffer: VecDeque<StreamEvent>,
    capacity: usize,
    dropped: u64,
    observers: Vec<Box<dyn Observer>>,
}

pub struct StreamingOutput {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl StreamingOutput {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buffer: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
                dropped: 0,
                observers: Vec::new(),
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, observer: Box<dyn Observer>) {
        self.lock().observers.push(observer);
    }

    pub fn publish(&self, agent: &str, event_type: EventType, content: impl Into<String>, metadata: Metadata) {
        let event = StreamEvent {
            event_type,
            timestamp: self.clock.now(),
            agent: agent.to_string(),
            content: content.into(),
            metadata,
        };
        let mut inner = self.lock();
        for obs in inner.observers.iter_mut() {
            obs.on_event(&event);
        }
        if inner.buffer.len() >= inner.capacity {
            inner.buffer.pop_front();
            inner.dropped += 1;
        }
        inner.buffer.push_back(event);
    }

    pub fn emit(&self, agent: &str, event_type: EventType, content: impl Into<String>) {
        self.publish(agent, event_type, content, Metadata::new());
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<StreamEvent> {
        self.lock().buffer.iter().cloned().collect()
    }

    /// Emit the drop metric (when anything was dropped) and flush observers.
    pub fn finish(&self) -> u64 {
        let dropped = self.dropped();
        if dropped > 0 {
            warn!(dropped, "agent event buffer overflowed");
            let mut meta = Metadata::new();
            meta.insert("dropped".into(), dropped.to_string());
            self.publish("runtime", EventType::Metric, format!("dropped={dropped}"), meta);
        }
        for obs in self.lock().observers.iter_mut() {
            obs.flush();
        }
        dropped
    }
}

// ── Trace writer ────────────────────────────────────────────────────────────

/// Appends every event as one JSON line. Write errors are logged once and
/// the writer goes quiet; tracing must never fail a bootstrap.
pub struct TraceWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
}

impl TraceWriter {
    /// Truncates any previous trace at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create trace dir {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("Failed to create trace {}", path.display()))?;
        debug!(path = %path.display(), "trace writer opened");
        Ok(Self {
            path: path.to_path_buf(),
            out: Some(BufWriter::new(file)),
        })
    }

    fn fail(&mut self, err: impl std::fmt::Display) {
        warn!(path = %self.path.display(), "trace write failed: {err}");
        self.out = None;
    }
}

impl Observer for TraceWriter {
    fn on_event(&mut self, event: &StreamEvent) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let res = serde_json::to_writer(&mut *out, event)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"));
        if let Err(e) = res {
            self.fail(e);
        }
    }

    fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.flush() {
                self.fail(e);
            }
        }
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        Observer::flush(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use tempfile::TempDir;

    struct Collect(Arc<Mutex<Vec<String>>>);

    impl Observer for Collect {
        fn on_event(&mut self, event: &StreamEvent) {
            self.0.lock().unwrap().push(event.content.clone());
        }
    }

    fn bus(capacity: usize) -> StreamingOutput {
        StreamingOutput::new(capacity, Arc::new(FixedClock::at_millis(0)))
    }

    #[test]
    fn observers_see_every_event_even_when_buffer_drops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let out = bus(2);
        out.subscribe(Box::new(Collect(seen.clone())));
        for i in 0..5 {
            out.emit("docs", EventType::FileConsidered, format!("f{i}"));
        }
        assert_eq!(out.dropped(), 3);
        let kept: Vec<_> = out.snapshot().into_iter().map(|e| e.content).collect();
        assert_eq!(kept, vec!["f3", "f4"]);
        assert_eq!(seen.lock().unwrap().len(), 5);

        assert_eq!(out.finish(), 3);
        assert_eq!(seen.lock().unwrap().last().unwrap(), "dropped=3");
    }

    #[test]
    fn trace_is_line_delimited_json() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs").join("bootstrap.trace.jsonl");
        let out = bus(16);
        out.subscribe(Box::new(TraceWriter::create(&path).unwrap()));
        out.emit("symbols", EventType::AgentStarted, "start");
        out.emit("symbols", EventType::FindingEmitted, "run");
        out.finish();

        let raw = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = raw.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "agent_started");
        assert_eq!(lines[1]["agent"], "symbols");
        assert!(lines[1]["timestamp"].is_string());
        assert!(lines[1]["metadata"].is_object());
    }
}
