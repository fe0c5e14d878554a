//! Append-only JSONL audit log for control-plane transitions.
//!
//! Every job, deployment, and pipeline transition is recorded here with a
//! timestamp and the subject id, and can be flushed to an `events.jsonl`
//! file for post-hoc diagnosis. This log is an audit trail, not a queue;
//! nothing reads it on the hot path.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EventKind {
    JobQueued { priority: String },
    JobAssigned { server_id: String },
    JobCompleted { duration_ms: u64, artifact_count: usize },
    JobFailed { message: String },
    JobCancelled,
    DeploymentCreated { target_id: String },
    DeploymentTransition { status: String },
    DeploymentRolledBack { replacement_id: String },
    PipelineCreated,
    StageStarted { stage: String, attempt: u32 },
    StageCompleted { stage: String },
    StageFailed { stage: String, message: String },
    PipelineFinished { status: String },
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEvent {
    pub timestamp: DateTime<Utc>,
    /// Job, deployment, or pipeline id.
    pub subject: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Append-only in-memory event log, flushable to JSONL.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<FleetEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event stamped now.
    pub fn record(&self, subject: &str, kind: EventKind) {
        self.events.lock().expect("event lock").push(FleetEvent {
            timestamp: Utc::now(),
            subject: subject.to_string(),
            kind,
        });
    }

    /// Append all recorded events to a JSONL file and clear the buffer.
    pub fn flush_to_file(&self, path: &Path) -> Result<usize> {
        let events: Vec<FleetEvent> = {
            let mut events = self.events.lock().expect("event lock");
            std::mem::take(&mut *events)
        };
        if events.is_empty() {
            return Ok(0);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);

        let count = events.len();
        for event in events {
            let line =
                serde_json::to_string(&event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(count)
    }

    /// Read all events from a JSONL file.
    pub fn read_from_file(path: &Path) -> Result<Vec<FleetEvent>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.context("failed to read event line")?;
            let event: FleetEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }
        Ok(events)
    }

    /// Events recorded for one subject, in order.
    pub fn for_subject(&self, subject: &str) -> Vec<FleetEvent> {
        self.events
            .lock()
            .expect("event lock")
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("event lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_filter_by_subject() {
        let log = EventLog::new();
        log.record("job-1", EventKind::JobQueued { priority: "normal".to_string() });
        log.record("job-2", EventKind::JobQueued { priority: "high".to_string() });
        log.record(
            "job-1",
            EventKind::JobAssigned { server_id: "srv-1".to_string() },
        );

        let job_1 = log.for_subject("job-1");
        assert_eq!(job_1.len(), 2);
        assert!(matches!(job_1[1].kind, EventKind::JobAssigned { .. }));
    }

    #[test]
    fn flush_appends_and_clears() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = events_path(td.path());

        let log = EventLog::new();
        log.record("job-1", EventKind::JobCancelled);
        assert_eq!(log.flush_to_file(&path).expect("flush"), 1);
        assert!(log.is_empty());

        log.record(
            "dep-1",
            EventKind::DeploymentTransition { status: "booting".to_string() },
        );
        log.flush_to_file(&path).expect("flush");

        let replayed = EventLog::read_from_file(&path).expect("read");
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].subject, "job-1");
        assert_eq!(replayed[1].subject, "dep-1");
    }

    #[test]
    fn flush_empty_is_a_no_op() {
        let td = tempfile::tempdir().expect("tempdir");
        let path = events_path(td.path());
        let log = EventLog::new();
        assert_eq!(log.flush_to_file(&path).expect("flush"), 0);
        assert!(!path.exists());
    }

    #[test]
    fn event_kinds_round_trip() {
        let kinds = vec![
            EventKind::JobQueued { priority: "urgent".to_string() },
            EventKind::JobAssigned { server_id: "srv-1".to_string() },
            EventKind::JobCompleted { duration_ms: 4200, artifact_count: 3 },
            EventKind::JobFailed { message: "make exited 2".to_string() },
            EventKind::JobCancelled,
            EventKind::DeploymentCreated { target_id: "brd-1".to_string() },
            EventKind::DeploymentTransition { status: "verifying".to_string() },
            EventKind::DeploymentRolledBack { replacement_id: "dep-2".to_string() },
            EventKind::PipelineCreated,
            EventKind::StageStarted { stage: "build".to_string(), attempt: 1 },
            EventKind::StageCompleted { stage: "build".to_string() },
            EventKind::StageFailed { stage: "boot".to_string(), message: "timeout".to_string() },
            EventKind::PipelineFinished { status: "completed".to_string() },
        ];
        for kind in kinds {
            let event = FleetEvent {
                timestamp: Utc::now(),
                subject: "x".to_string(),
                kind,
            };
            let json = serde_json::to_string(&event).expect("serialize");
            let parsed: FleetEvent = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed.kind, event.kind);
        }
    }

    #[test]
    fn read_missing_file_is_empty() {
        let td = tempfile::tempdir().expect("tempdir");
        let events = EventLog::read_from_file(&td.path().join("missing.jsonl")).expect("read");
        assert!(events.is_empty());
    }
}
