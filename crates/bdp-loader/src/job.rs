//! Load jobs and the job ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::template::QueryTemplate;

/// Load job lifecycle: `Created → Queued → InProgress → {Committed | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Queued,
    InProgress,
    Committed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Created => "created",
            JobState::Queued => "queued",
            JobState::InProgress => "in_progress",
            JobState::Committed => "committed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Committed | JobState::Failed)
    }

    /// `Created → Failed` covers jobs that were staged but never enqueued
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Created, JobState::Queued)
                | (JobState::Created, JobState::Failed)
                | (JobState::Queued, JobState::InProgress)
                | (JobState::InProgress, JobState::Committed)
                | (JobState::InProgress, JobState::Failed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One serialized stream on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub path: PathBuf,
    pub row_count: usize,
    /// Header columns; empty for placeholder files
    pub columns: Vec<String>,
}

impl StagedFile {
    pub fn is_placeholder(&self) -> bool {
        self.row_count == 0
    }
}

/// A staged file paired with the template that loads it
///
/// Not `Clone`: a job is consumed exactly once.
#[derive(Debug)]
pub struct LoadJob {
    pub id: Uuid,
    pub sequence_no: u64,
    pub subtype: String,
    pub template: Arc<QueryTemplate>,
    pub staged_file: StagedFile,
    pub commit_size: usize,
    pub created_at: DateTime<Utc>,
}

impl LoadJob {
    pub fn new(
        subtype: impl Into<String>,
        template: Arc<QueryTemplate>,
        staged_file: StagedFile,
        sequence_no: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_no,
            subtype: subtype.into(),
            commit_size: template.commit_size(),
            template,
            staged_file,
            created_at: Utc::now(),
        }
    }

    pub fn template_id(&self) -> &str {
        self.template.id()
    }

    /// `ceil(rows / commit_size)`
    pub fn expected_chunks(&self) -> usize {
        self.staged_file.row_count.div_ceil(self.commit_size)
    }
}

/// Ledger view of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobEntry {
    pub id: Uuid,
    pub sequence_no: u64,
    pub subtype: String,
    pub template_id: String,
    pub staged_file: PathBuf,
    pub row_count: usize,
    pub state: JobState,
    pub committed_rows: usize,
    pub chunks_committed: usize,
    pub failed_chunk: Option<usize>,
    pub error: Option<String>,
    pub transitions: Vec<(JobState, DateTime<Utc>)>,
}

/// State history of every job in a run
#[derive(Debug, Default)]
pub struct JobLedger {
    entries: Mutex<HashMap<Uuid, JobEntry>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, JobEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly created job
    pub fn register(&self, job: &LoadJob) {
        let entry = JobEntry {
            id: job.id,
            sequence_no: job.sequence_no,
            subtype: job.subtype.clone(),
            template_id: job.template_id().to_string(),
            staged_file: job.staged_file.path.clone(),
            row_count: job.staged_file.row_count,
            state: JobState::Created,
            committed_rows: 0,
            chunks_committed: 0,
            failed_chunk: None,
            error: None,
            transitions: vec![(JobState::Created, job.created_at)],
        };
        self.entries().insert(job.id, entry);
    }

    /// Move a job to `next`; returns false for unknown jobs or illegal moves
    pub fn transition(&self, id: Uuid, next: JobState) -> bool {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            tracing::warn!(job_id = %id, state = %next, "Transition for unknown job");
            return false;
        };

        if !entry.state.can_transition_to(next) {
            tracing::warn!(
                job_id = %id,
                from = %entry.state,
                to = %next,
                "Illegal job state transition ignored"
            );
            return false;
        }

        entry.state = next;
        entry.transitions.push((next, Utc::now()));
        true
    }

    /// Count one committed chunk
    pub fn record_chunk(&self, id: Uuid, rows: usize) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.chunks_committed += 1;
            entry.committed_rows += rows;
        }
    }

    /// Move a job to `Failed` with its context
    pub fn fail(&self, id: Uuid, chunk_index: Option<usize>, error: impl std::fmt::Display) {
        if self.transition(id, JobState::Failed) {
            if let Some(entry) = self.entries().get_mut(&id) {
                entry.failed_chunk = chunk_index;
                entry.error = Some(error.to_string());
            }
        }
    }

    pub fn get(&self, id: Uuid) -> Option<JobEntry> {
        self.entries().get(&id).cloned()
    }

    /// All jobs ordered by sequence number
    pub fn snapshot(&self) -> Vec<JobEntry> {
        let mut jobs: Vec<JobEntry> = self.entries().values().cloned().collect();
        jobs.sort_by_key(|j| j.sequence_no);
        jobs
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.entries().values().filter(|e| e.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
