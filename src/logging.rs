//! Tracing setup and the bounded native log queue drained by host runtimes.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

use crate::config::{BridgeConfig, DEFAULT_LOG_CAPACITY};

static LOG_BUFFER: Lazy<Mutex<VecDeque<LogRecord>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static LOG_CAPACITY: AtomicUsize = AtomicUsize::new(DEFAULT_LOG_CAPACITY);
static TRACING_INIT: Once = Once::new();

/// Severity attached to a queued log line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Verbose diagnostics.
    Verbose,
    /// Informational messages.
    Info,
    /// Recoverable problems.
    Warning,
    /// Failures.
    Error,
}

impl From<&Level> for Severity {
    fn from(level: &Level) -> Self {
        match *level {
            Level::ERROR => Severity::Error,
            Level::WARN => Severity::Warning,
            Level::INFO => Severity::Info,
            _ => Severity::Verbose,
        }
    }
}

/// One native log line waiting to be drained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity of the originating event.
    pub severity: Severity,
    /// Module path that emitted the event.
    pub target: String,
    /// Formatted message including structured fields.
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.severity, self.target, self.message)
    }
}

/// Install the process-wide subscriber. Later calls are no-ops.
pub fn init_tracing(config: &BridgeConfig) {
    TRACING_INIT.call_once(|| {
        LOG_CAPACITY.store(config.log_capacity.max(1), Ordering::Relaxed);
        let _ = tracing_subscriber::registry()
            .with(LevelFilter::from_level(config.log_level))
            .with(tracing_subscriber::fmt::layer())
            .with(LogSinkLayer)
            .try_init();
    });
}

/// Queue a record, dropping the oldest entries beyond the configured capacity.
pub fn push_log(record: LogRecord) {
    let capacity = LOG_CAPACITY.load(Ordering::Relaxed);
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(record);
    while guard.len() > capacity {
        guard.pop_front();
    }
}

/// Pop the oldest queued record.
pub fn pop_log() -> Option<LogRecord> {
    LOG_BUFFER.lock().pop_front()
}

/// Number of records currently queued.
pub fn pending_logs() -> usize {
    LOG_BUFFER.lock().len()
}

/// Layer copying every event into the native log queue.
pub struct LogSinkLayer;

impl<S: Subscriber> Layer<S> for LogSinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        push_log(LogRecord {
            severity: Severity::from(metadata.level()),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
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
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_captures_message_and_fields() {
        let subscriber = tracing_subscriber::registry().with(LogSinkLayer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(handle = 7u64, "capture device vanished");
        });

        let mut found = None;
        while let Some(record) = pop_log() {
            if record.message.contains("capture device vanished") {
                found = Some(record);
            }
        }
        let record = found.expect("record queued");
        assert_eq!(record.severity, Severity::Warning);
        assert!(record.message.contains("handle=7"), "fields missing: {}", record.message);
    }
}
