//! Clone job model: status machine, counters and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    FetchingSeed,
    Extracting,
    Downloading,
    Rewriting,
    Archiving,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    /// Position in the forward pipeline; `Failed` has none.
    fn rank(self) -> Option<u8> {
        match self {
            JobStatus::Queued => Some(0),
            JobStatus::FetchingSeed => Some(1),
            JobStatus::Extracting => Some(2),
            JobStatus::Downloading => Some(3),
            JobStatus::Rewriting => Some(4),
            JobStatus::Archiving => Some(5),
            JobStatus::Done => Some(6),
            JobStatus::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to == from || to == from + 1,
            (None, Some(_)) => false,
        }
    }

    /// Like [`can_transition_to`](Self::can_transition_to) but tolerates
    /// skipped intermediate states.
    pub fn advances_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::FetchingSeed => "fetching-seed",
            JobStatus::Extracting => "extracting",
            JobStatus::Downloading => "downloading",
            JobStatus::Rewriting => "rewriting",
            JobStatus::Archiving => "archiving",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Options accepted with every clone request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloneOptions {
    pub rename_assets: bool,
    pub simple_download: bool,
    pub mobile_version: bool,
    pub save_structure: bool,
}

/// A resource that failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub url: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: usize,
    pub downloaded: usize,
    pub optimized: usize,
    pub errors: usize,
    pub bytes: u64,
}

/// Notification emitted by the orchestrator whenever a job moves forward.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub status: JobStatus,
    pub percent: u8,
    pub message: String,
    pub counters: JobCounters,
    pub archive_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Snapshot of a job as exposed to progress queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneJob {
    pub id: JobId,
    pub source_url: String,
    pub options: CloneOptions,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub message: String,
    pub counters: JobCounters,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub archive_path: Option<PathBuf>,
}

impl CloneJob {
    pub fn new(id: JobId, source_url: &str, options: CloneOptions) -> Self {
        Self {
            id,
            source_url: source_url.to_string(),
            options,
            status: JobStatus::Queued,
            progress_percent: 0,
            message: "Queued".to_string(),
            counters: JobCounters::default(),
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
            archive_path: None,
        }
    }

    /// Folds an orchestrator event into the snapshot.
    ///
    /// Out-of-order events never move the status backwards and the
    /// percentage never decreases.
    pub fn apply(&mut self, event: &JobEvent) {
        if event.status != self.status {
            if !self.status.advances_to(event.status) {
                return;
            }
            self.status = event.status;
        }

        self.progress_percent = self.progress_percent.max(event.percent.min(100));
        self.message = event.message.clone();
        self.counters = event.counters;

        if event.archive_path.is_some() {
            self.archive_path = event.archive_path.clone();
        }
        if event.error.is_some() {
            self.error_message = event.error.clone();
        }
        if self.status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Formats a byte count the way the final job summary shows it.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}
