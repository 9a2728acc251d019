//! Bulk operation progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for
//! scripts. A bulk run reports every `progress_every` processed items and
//! once more when it finishes.

use std::io::Write;
use std::time::Duration;

/// A single progress event for a bulk run.
#[derive(Clone, Debug)]
pub enum BulkProgressEvent {
    /// `processed` items done so far, `elapsed` since the previous report.
    Processed {
        operation: String,
        processed: u64,
        skipped: u64,
        elapsed: Duration,
    },
    /// The walk is over.
    Finished {
        operation: String,
        processed: u64,
        skipped: u64,
        total: Duration,
    },
}

/// Reports bulk progress. Implementations write to stderr (human or JSON).
pub trait BulkProgressReporter: Send + Sync {
    fn report(&self, event: BulkProgressEvent);
}

/// Human-friendly progress on stderr: "move  12,000 items (3 skipped)  +1.52s".
pub struct StderrProgress;

impl BulkProgressReporter for StderrProgress {
    fn report(&self, event: BulkProgressEvent) {
        let line = match &event {
            BulkProgressEvent::Processed {
                operation,
                processed,
                skipped,
                elapsed,
            } => format!(
                "{}  {} items ({} skipped)  +{:.2}s\n",
                operation,
                format_number(*processed),
                format_number(*skipped),
                elapsed.as_secs_f64()
            ),
            BulkProgressEvent::Finished {
                operation,
                processed,
                skipped,
                total,
            } => format!(
                "{}  done: {} items ({} skipped) in {:.2}s\n",
                operation,
                format_number(*processed),
                format_number(*skipped),
                total.as_secs_f64()
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BulkProgressReporter for JsonProgress {
    fn report(&self, event: BulkProgressEvent) {
        let obj = match &event {
            BulkProgressEvent::Processed {
                operation,
                processed,
                skipped,
                elapsed,
            } => serde_json::json!({
                "event": "progress",
                "operation": operation,
                "processed": processed,
                "skipped": skipped,
                "elapsed_ms": elapsed.as_millis() as u64,
            }),
            BulkProgressEvent::Finished {
                operation,
                processed,
                skipped,
                total,
            } => serde_json::json!({
                "event": "finished",
                "operation": operation,
                "processed": processed,
                "skipped": skipped,
                "total_ms": total.as_millis() as u64,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BulkProgressReporter for NoProgress {
    fn report(&self, _event: BulkProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BulkProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
