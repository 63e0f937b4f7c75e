//! Directory ingestion progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a directory ingestion run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestProgressEvent {
    /// Walking the input paths. Total unknown.
    Discovering { dataset: String },
    /// `n` of `total` files processed.
    Ingesting { dataset: String, n: u64, total: u64 },
    /// Run complete.
    Finished {
        dataset: String,
        ingested: u64,
        skipped: u64,
        failed: u64,
    },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest docs  1,234 / 5,000 files".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Discovering { dataset } => {
                format!("ingest {}  discovering...\n", dataset)
            }
            IngestProgressEvent::Ingesting { dataset, n, total } => format!(
                "ingest {}  {} / {} files\n",
                dataset,
                format_number(*n),
                format_number(*total)
            ),
            IngestProgressEvent::Finished {
                dataset,
                ingested,
                skipped,
                failed,
            } => format!(
                "ingest {}  done: {} ingested, {} skipped, {} failed\n",
                dataset,
                format_number(*ingested),
                format_number(*skipped),
                format_number(*failed)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Discovering { dataset } => serde_json::json!({
                "event": "progress",
                "dataset": dataset,
                "phase": "discovering"
            }),
            IngestProgressEvent::Ingesting { dataset, n, total } => serde_json::json!({
                "event": "progress",
                "dataset": dataset,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            IngestProgressEvent::Finished {
                dataset,
                ingested,
                skipped,
                failed,
            } => serde_json::json!({
                "event": "finished",
                "dataset": dataset,
                "ingested": ingested,
                "skipped": skipped,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(12_345), "12,345");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
