//! Run-level summary
//!
//! Aggregates the job ledger and every issue reported by extraction units
//! once all jobs are terminal. Committed jobs are never rolled back; a run
//! fails when any job failed or any stream could not be staged or enqueued.

use bdp_common::checksum::sha256_file;
use chrono::{DateTime, Utc};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::job::{JobEntry, JobState};

/// Job and row counts for one template or subtype
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Jobs created from staged files, placeholders included
    pub staged: usize,
    pub committed: usize,
    pub failed: usize,
    /// Streams that never became a job
    pub stage_failed: usize,
    pub committed_rows: usize,
}

impl Counts {
    fn add_job(&mut self, job: &JobEntry) {
        self.staged += 1;
        self.committed_rows += job.committed_rows;
        match job.state {
            JobState::Committed => self.committed += 1,
            JobState::Failed => self.failed += 1,
            _ => {}
        }
    }
}

/// A job that reached `Failed`, with everything needed to replay it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub sequence_no: u64,
    pub subtype: String,
    pub template_id: String,
    pub staged_file: PathBuf,
    pub row_count: usize,
    pub committed_rows: usize,
    pub failed_chunk: Option<usize>,
    pub error: String,
    /// Digest of the retained file; `None` when it could not be read
    pub sha256: Option<String>,
}

/// Category of an issue raised by an extraction unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Malformed source record, skipped
    Extraction,
    /// Stream rejected for inconsistent or incomplete columns
    SchemaMismatch,
    /// Stream could not be written to the staging directory
    Stage,
    /// Job refused by the dispatch queue
    Queue,
    /// Extraction unit stopped early
    Aborted,
}

impl IssueKind {
    /// Extraction errors are tolerated outside strict mode
    pub fn fails_run(&self) -> bool {
        !matches!(self, IssueKind::Extraction)
    }
}

/// One problem reported by an extraction unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerIssue {
    pub subtype: String,
    pub kind: IssueKind,
    pub template_id: Option<String>,
    pub message: String,
}

impl ProducerIssue {
    pub fn new(subtype: &str, kind: IssueKind, template_id: Option<&str>, message: impl ToString) -> Self {
        Self {
            subtype: subtype.to_string(),
            kind,
            template_id: template_id.map(str::to_string),
            message: message.to_string(),
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub totals: Counts,
    pub per_template: BTreeMap<String, Counts>,
    pub per_subtype: BTreeMap<String, Counts>,
    pub failed_jobs: Vec<FailedJob>,
    pub producer_issues: Vec<ProducerIssue>,
}

impl RunSummary {
    /// Build the summary from the final ledger snapshot
    pub fn build(
        jobs: &[JobEntry],
        producer_issues: Vec<ProducerIssue>,
        started_at: DateTime<Utc>,
        cancelled: bool,
    ) -> Self {
        let mut totals = Counts::default();
        let mut per_template: BTreeMap<String, Counts> = BTreeMap::new();
        let mut per_subtype: BTreeMap<String, Counts> = BTreeMap::new();
        let mut failed_jobs = Vec::new();

        for job in jobs {
            totals.add_job(job);
            per_template.entry(job.template_id.clone()).or_default().add_job(job);
            per_subtype.entry(job.subtype.clone()).or_default().add_job(job);

            if job.state == JobState::Failed {
                failed_jobs.push(FailedJob {
                    sequence_no: job.sequence_no,
                    subtype: job.subtype.clone(),
                    template_id: job.template_id.clone(),
                    staged_file: job.staged_file.clone(),
                    row_count: job.row_count,
                    committed_rows: job.committed_rows,
                    failed_chunk: job.failed_chunk,
                    error: job.error.clone().unwrap_or_default(),
                    sha256: sha256_file(&job.staged_file).ok(),
                });
            } else if !job.state.is_terminal() {
                tracing::warn!(
                    job_id = %job.id,
                    state = %job.state,
                    "Job not terminal when the summary was built"
                );
            }
        }

        for issue in &producer_issues {
            if !matches!(issue.kind, IssueKind::SchemaMismatch | IssueKind::Stage) {
                continue;
            }
            totals.stage_failed += 1;
            per_subtype.entry(issue.subtype.clone()).or_default().stage_failed += 1;
            if let Some(template_id) = &issue.template_id {
                per_template.entry(template_id.clone()).or_default().stage_failed += 1;
            }
        }

        Self {
            started_at,
            finished_at: Utc::now(),
            cancelled,
            totals,
            per_template,
            per_subtype,
            failed_jobs,
            producer_issues,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.failed_jobs.is_empty()
            && self.producer_issues.iter().all(|i| !i.kind.fails_run())
    }

    pub fn extraction_errors(&self) -> usize {
        self.producer_issues
            .iter()
            .filter(|i| i.kind == IssueKind::Extraction)
            .count()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    /// Human-readable report
    pub fn render_table(&self) -> String {
        let mut out = String::new();

        for (title, groups) in [("Template", &self.per_template), ("Subtype", &self.per_subtype)] {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![title, "Staged", "Committed", "Failed", "Stage failed", "Rows"]);
            for (name, counts) in groups {
                table.add_row(vec![
                    name.clone(),
                    counts.staged.to_string(),
                    counts.committed.to_string(),
                    counts.failed.to_string(),
                    counts.stage_failed.to_string(),
                    counts.committed_rows.to_string(),
                ]);
            }
            out.push_str(&table.to_string());
            out.push('\n');
        }

        if !self.failed_jobs.is_empty() {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec!["Seq", "Template", "Chunk", "Staged file", "Error"]);
            for job in &self.failed_jobs {
                table.add_row(vec![
                    job.sequence_no.to_string(),
                    job.template_id.clone(),
                    job.failed_chunk.map_or_else(|| "-".to_string(), |c| c.to_string()),
                    job.staged_file.display().to_string(),
                    job.error.clone(),
                ]);
            }
            out.push_str(&table.to_string());
            out.push('\n');
        }

        let blocking: Vec<&ProducerIssue> = self.producer_issues.iter().filter(|i| i.kind.fails_run()).collect();
        if !blocking.is_empty() {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec!["Subtype", "Issue", "Template", "Message"]);
            for issue in blocking {
                table.add_row(vec![
                    issue.subtype.clone(),
                    format!("{:?}", issue.kind),
                    issue.template_id.clone().unwrap_or_default(),
                    issue.message.clone(),
                ]);
            }
            out.push_str(&table.to_string());
            out.push('\n');
        }

        out.push_str(&format!(
            "{} jobs: {} committed, {} failed, {} rows in {:.1}s; {} malformed records skipped",
            self.totals.staged,
            self.totals.committed,
            self.totals.failed,
            self.totals.committed_rows,
            self.duration().num_milliseconds() as f64 / 1000.0,
            self.extraction_errors(),
        ));
        if self.cancelled {
            out.push_str(" (cancelled)");
        }
        out
    }
}
