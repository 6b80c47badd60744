//! Failure manifest and explicit replay
//!
//! Failed jobs keep their staged file. At the end of a run the failures are
//! written to `failed_jobs.json` in that run's staging directory; `replay`
//! re-runs exactly those files after checking they are unchanged. Chunks that
//! were committed before the failure are applied again, which upserts make
//! safe. The manifest is then rewritten in place with every job that is still
//! unloaded, or removed once none are left.

use bdp_common::checksum::verify_sha256;
use bdp_common::BdpError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::context::PipelineContext;
use crate::job::{LoadJob, StagedFile};
use crate::stager::StagedReader;
use crate::summary::{FailedJob, IssueKind, ProducerIssue, RunSummary};
use crate::supervisor::submit;
use crate::worker::WorkerPool;

/// File name of the manifest inside the staging directory
pub const MANIFEST_FILE: &str = "failed_jobs.json";

/// Retained failures of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureManifest {
    pub created_at: DateTime<Utc>,
    pub jobs: Vec<FailedJob>,
}

impl FailureManifest {
    pub fn from_summary(summary: &RunSummary) -> Self {
        Self {
            created_at: Utc::now(),
            jobs: summary.failed_jobs.clone(),
        }
    }

    /// Atomically write the manifest into `dir`
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<PathBuf, BdpError> {
        let path = dir.as_ref().join(MANIFEST_FILE);
        self.write_to(&path)?;
        Ok(path)
    }

    /// Atomically replace the manifest at `path`
    pub fn write_to(&self, path: &Path) -> Result<(), BdpError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(path).map_err(|e| BdpError::Io(e.error))?;
        Ok(())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self, BdpError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Re-run every job of the manifest at `manifest_path`
///
/// Files whose checksum no longer matches, or whose template is unknown, are
/// reported and skipped. Skipped jobs, jobs left behind by cancellation and
/// jobs that fail again are written back to `manifest_path`.
pub async fn replay(ctx: PipelineContext, manifest_path: impl AsRef<Path>) -> Result<RunSummary, BdpError> {
    let manifest_path = manifest_path.as_ref();
    let manifest = FailureManifest::read(manifest_path)?;
    let started_at = Utc::now();
    let pool = WorkerPool::start(&ctx);
    let mut issues = Vec::new();
    let mut skipped = Vec::new();

    tracing::info!(
        jobs = manifest.jobs.len(),
        manifest = %manifest_path.display(),
        "Replaying failed jobs"
    );

    let mut pending = manifest.jobs.into_iter();
    for failed in pending.by_ref() {
        if ctx.is_cancelled() {
            skipped.push(failed);
            break;
        }

        let Some(template) = ctx.template(&failed.template_id).cloned() else {
            issues.push(ProducerIssue::new(
                &failed.subtype,
                IssueKind::Aborted,
                Some(failed.template_id.as_str()),
                format!("unknown template '{}'", failed.template_id),
            ));
            skipped.push(failed);
            continue;
        };

        let verified = tokio::task::spawn_blocking({
            let failed = failed.clone();
            move || verify_staged(&failed)
        })
        .await;
        let staged = match verified {
            Ok(Ok(staged)) => staged,
            Ok(Err(e)) => {
                tracing::error!(path = %failed.staged_file.display(), error = %e, "Staged file unusable; skipping");
                issues.push(ProducerIssue::new(&failed.subtype, IssueKind::Stage, Some(failed.template_id.as_str()), e));
                skipped.push(failed);
                continue;
            }
            Err(e) => {
                issues.push(ProducerIssue::new(&failed.subtype, IssueKind::Aborted, Some(failed.template_id.as_str()), e));
                skipped.push(failed);
                continue;
            }
        };

        let job = LoadJob::new(&failed.subtype, template, staged, failed.sequence_no);
        if let Err(reason) = submit(&ctx, job).await {
            issues.push(ProducerIssue::new(&failed.subtype, IssueKind::Queue, Some(failed.template_id.as_str()), reason));
        }
    }
    skipped.extend(pending);

    pool.drain().await;
    pool.shutdown().await;

    let summary = RunSummary::build(&ctx.ledger().snapshot(), issues, started_at, ctx.is_cancelled());
    let remaining: Vec<FailedJob> = summary.failed_jobs.iter().cloned().chain(skipped).collect();
    update_manifest(manifest_path, remaining)?;
    ctx.stager().remove_if_empty();
    Ok(summary)
}

/// Rewrite the manifest with the jobs still to load, or remove it
fn update_manifest(path: &Path, remaining: Vec<FailedJob>) -> Result<(), BdpError> {
    if remaining.is_empty() {
        std::fs::remove_file(path)?;
        tracing::info!(manifest = %path.display(), "All failed jobs replayed; manifest removed");
        if let Some(dir) = path.parent() {
            // The run directory is empty once its last retained file loaded
            let _ = std::fs::remove_dir(dir);
        }
        return Ok(());
    }

    tracing::warn!(
        remaining = remaining.len(),
        manifest = %path.display(),
        "Failed jobs still retained for replay"
    );
    FailureManifest {
        created_at: Utc::now(),
        jobs: remaining,
    }
    .write_to(path)
}

fn verify_staged(failed: &FailedJob) -> Result<StagedFile, BdpError> {
    match &failed.sha256 {
        Some(expected) => verify_sha256(&failed.staged_file, expected)?,
        None => tracing::warn!(path = %failed.staged_file.display(), "No checksum recorded; replaying unverified"),
    }

    let columns = StagedReader::open(&failed.staged_file)
        .map(|reader| reader.columns().to_vec())
        .map_err(|e| BdpError::Io(std::io::Error::other(e)))?;

    Ok(StagedFile {
        path: failed.staged_file.clone(),
        row_count: failed.row_count,
        columns,
    })
}
