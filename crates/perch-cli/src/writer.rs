//! CSV sink for collected batches.
//!
//! Records accumulate until `records_per_file` are pending, then land in
//! `<n>-<unix_millis>-records.csv` under the output directory. Every
//! rotation is announced so the caller can end the current collection run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use perch_core::models::{ExtractedRecord, NOT_AVAILABLE, RecordKind, ResultBatch};
use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Outcome of handing a batch to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkStatus {
    /// Still accumulating.
    Pending { collected: usize, capacity: usize },
    /// A file was written and the pending set cleared.
    Rotated { path: PathBuf, records: usize },
}

#[derive(Serialize)]
struct CsvRow<'a> {
    date: i64,
    id: u64,
    author: &'a str,
    name: &'a str,
    mentions: String,
    urls: String,
    last_seen: &'a str,
    hint: &'a str,
    status: &'a str,
}

impl<'a> From<&'a ExtractedRecord> for CsvRow<'a> {
    fn from(record: &'a ExtractedRecord) -> Self {
        let mentions = if record.mentions().is_empty() {
            NOT_AVAILABLE.to_string()
        } else {
            join(record.mentions().iter())
        };
        CsvRow {
            date: record.created_at().timestamp_millis(),
            id: record.author_id(),
            author: record.author(),
            name: record.author_name(),
            mentions,
            urls: join(record.urls().iter()),
            last_seen: record.last_seen(),
            hint: record.hint(),
            status: record.message(),
        }
    }
}

fn join<'a>(values: impl Iterator<Item = &'a String>) -> String {
    values.map(String::as_str).collect::<Vec<_>>().join(", ")
}

pub struct CsvResultsWriter {
    output_dir: PathBuf,
    records_per_file: usize,
    pending: Vec<ExtractedRecord>,
    /// Post ids accepted so far, written or pending.
    seen: HashSet<u64>,
    files_written: usize,
}

impl CsvResultsWriter {
    pub fn new(output_dir: impl Into<PathBuf>, records_per_file: usize) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

        Ok(Self {
            output_dir,
            records_per_file: records_per_file.max(1),
            pending: Vec::new(),
            seen: HashSet::new(),
            files_written: 0,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn files_written(&self) -> usize {
        self.files_written
    }

    /// Adds the batch's unseen records and rotates once the file is full.
    pub fn accept(&mut self, batch: &ResultBatch) -> Result<SinkStatus> {
        for record in batch.iter(RecordKind::Tweet) {
            if self.seen.insert(record.id()) {
                self.pending.push(record.clone());
            }
        }

        let collected = self.pending.len();
        tracing::info!(
            collected,
            capacity = self.records_per_file,
            percent = collected * 100 / self.records_per_file,
            "Records collected"
        );

        if collected < self.records_per_file {
            return Ok(SinkStatus::Pending {
                collected,
                capacity: self.records_per_file,
            });
        }
        let path = self.write_pending()?;
        Ok(SinkStatus::Rotated {
            path,
            records: collected,
        })
    }

    /// Writes whatever is pending; `None` when nothing is.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        self.write_pending().map(Some)
    }

    fn write_pending(&mut self) -> Result<PathBuf> {
        let path = self.next_path()?;
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create results file: {}", path.display()))?;
        for record in &self.pending {
            writer.serialize(CsvRow::from(record))?;
        }
        writer.flush()?;

        tracing::info!(path = %path.display(), records = self.pending.len(), "Results file written");
        self.pending.clear();
        self.files_written += 1;
        Ok(path)
    }

    fn next_path(&self) -> Result<PathBuf> {
        let existing = std::fs::read_dir(&self.output_dir)
            .with_context(|| format!("Failed to list {}", self.output_dir.display()))?
            .count();
        let millis = chrono::Utc::now().timestamp_millis();
        Ok(self
            .output_dir
            .join(format!("{}-{millis}-records.csv", existing + 1)))
    }
}

/// Drains `rx` into `writer` until `shutdown` fires or every sender is gone,
/// then flushes the partial file. Each rotated file's path goes to
/// `rotations`.
pub fn spawn_writer(
    mut writer: CsvResultsWriter,
    mut rx: UnboundedReceiver<Arc<ResultBatch>>,
    shutdown: CancellationToken,
    rotations: UnboundedSender<PathBuf>,
) -> JoinHandle<Result<CsvResultsWriter>> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                batch = rx.recv() => match batch {
                    Some(batch) => match writer.accept(&batch) {
                        Ok(SinkStatus::Rotated { path, .. }) => {
                            // The receiver may already be gone during teardown.
                            let _ = rotations.send(path);
                        }
                        Ok(SinkStatus::Pending { .. }) => {}
                        Err(e) => tracing::error!(error = %e, "Failed to write results"),
                    },
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    drain(&mut writer, &mut rx);
                    break;
                }
            }
        }
        writer.flush()?;
        Ok(writer)
    })
}

/// Accepts every batch still queued; a failed write leaves its records
/// pending for the final flush. Returns the number of failed writes.
fn drain(writer: &mut CsvResultsWriter, rx: &mut UnboundedReceiver<Arc<ResultBatch>>) -> usize {
    let mut failures = 0;
    while let Ok(batch) = rx.try_recv() {
        if let Err(e) = writer.accept(&batch) {
            tracing::error!(error = %e, "Failed to write results during shutdown");
            failures += 1;
        }
    }
    failures
}
