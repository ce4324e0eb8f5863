//! Console tap
//!
//! A `tracing_subscriber` layer that turns the host application's log
//! events into `console` breadcrumbs and console entries for snapshots, so
//! call sites never have to instrument themselves. Events emitted by this
//! crate are ignored; otherwise persisting a breadcrumb could log about
//! itself.

use crate::breadcrumbs::{BreadcrumbLevel, BreadcrumbTracker};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub const DEFAULT_CONSOLE_CAPACITY: usize = 50;

const OWN_TARGET: &str = "guardrail_core";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub timestamp: DateTime<Utc>,
    pub level: BreadcrumbLevel,
    pub target: String,
    pub message: String,
}

/// Ring of recent console entries
pub struct ConsoleRecorder {
    entries: Mutex<VecDeque<ConsoleEntry>>,
    capacity: usize,
}

impl Default for ConsoleRecorder {
    fn default() -> Self {
        Self::new(DEFAULT_CONSOLE_CAPACITY)
    }
}

impl ConsoleRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, entry: ConsoleEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub fn recent(&self, n: usize) -> Vec<ConsoleEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Clone)]
pub struct ConsoleTap {
    tracker: Arc<BreadcrumbTracker>,
    recorder: Arc<ConsoleRecorder>,
    max_level: Level,
}

impl ConsoleTap {
    pub fn new(tracker: Arc<BreadcrumbTracker>, recorder: Arc<ConsoleRecorder>) -> Self {
        Self {
            tracker,
            recorder,
            max_level: Level::INFO,
        }
    }

    /// Most verbose level that is still tapped (default INFO)
    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }
}

fn map_level(level: &Level) -> BreadcrumbLevel {
    match *level {
        Level::ERROR => BreadcrumbLevel::Error,
        Level::WARN => BreadcrumbLevel::Warning,
        Level::INFO => BreadcrumbLevel::Info,
        _ => BreadcrumbLevel::Debug,
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for ConsoleTap {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(OWN_TARGET) || *metadata.level() > self.max_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = format!("{}{}", visitor.message, visitor.fields);
        let level = map_level(metadata.level());

        self.tracker.console(level, message.clone(), metadata.target());
        self.recorder.record(ConsoleEntry {
            timestamp: Utc::now(),
            level,
            target: metadata.target().to_string(),
            message,
        });
    }
}
