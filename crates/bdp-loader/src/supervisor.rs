//! Process supervisor
//!
//! Runs one isolated extraction unit per producer. Units share nothing but the
//! staging directory and the dispatch queue held by the [`PipelineContext`].
//! Once every unit has finished producing, the supervisor drains the worker
//! pool and folds the ledger and all unit reports into a [`RunSummary`].

use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::context::PipelineContext;
use crate::error::{QueueError, StageError};
use crate::job::LoadJob;
use crate::producer::RecordProducer;
use crate::queue::Rejected;
use crate::replay::FailureManifest;
use crate::summary::{IssueKind, ProducerIssue, RunSummary};
use crate::worker::WorkerPool;

/// What one extraction unit did
#[derive(Debug, Default)]
pub struct UnitReport {
    pub subtype: String,
    pub batches: usize,
    pub jobs: usize,
    pub issues: Vec<ProducerIssue>,
}

/// Owns a run from first batch to final summary
#[derive(Debug)]
pub struct ProcessSupervisor {
    ctx: PipelineContext,
}

impl ProcessSupervisor {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run every producer to completion and wait for all jobs to be terminal
    pub async fn run(self, producers: Vec<Box<dyn RecordProducer>>) -> RunSummary {
        let started_at = Utc::now();
        let ctx = self.ctx;
        let pool = WorkerPool::start(&ctx);

        tracing::info!(
            run_id = ctx.run_id(),
            units = producers.len(),
            templates = ctx.templates().len(),
            staging_dir = %ctx.stager().staging_dir().display(),
            "Starting extraction units"
        );

        let mut units = JoinSet::new();
        let mut subtypes = HashMap::new();
        for producer in producers {
            let subtype = producer.subtype().to_string();
            let span = tracing::info_span!("extraction_unit", subtype = %subtype);
            let handle = units.spawn(run_unit(ctx.clone(), producer).instrument(span));
            subtypes.insert(handle.id(), subtype);
        }

        let mut issues = Vec::new();
        while let Some(joined) = units.join_next_with_id().await {
            match joined {
                Ok((_, report)) => {
                    tracing::info!(
                        subtype = %report.subtype,
                        batches = report.batches,
                        jobs = report.jobs,
                        issues = report.issues.len(),
                        "Extraction unit finished"
                    );
                    issues.extend(report.issues);
                }
                Err(e) => {
                    let subtype = subtypes.get(&e.id()).cloned().unwrap_or_default();
                    tracing::error!(subtype = %subtype, error = %e, "Extraction unit aborted");
                    issues.push(ProducerIssue::new(&subtype, IssueKind::Aborted, None, e));
                }
            }
        }

        tracing::info!(outstanding = ctx.queue().outstanding(), "All units done; draining workers");
        pool.drain().await;
        pool.shutdown().await;

        let summary = RunSummary::build(&ctx.ledger().snapshot(), issues, started_at, ctx.is_cancelled());
        write_manifest(&ctx, &summary);
        ctx.stager().remove_if_empty();
        summary
    }
}

/// Persist retained failures next to the staged files
pub(crate) fn write_manifest(ctx: &PipelineContext, summary: &RunSummary) {
    if summary.failed_jobs.is_empty() {
        return;
    }
    match FailureManifest::from_summary(summary).write(ctx.stager().staging_dir()) {
        Ok(path) => tracing::warn!(
            failed = summary.failed_jobs.len(),
            manifest = %path.display(),
            "Failed jobs retained for replay"
        ),
        Err(e) => tracing::error!(error = %e, "Could not write failure manifest"),
    }
}

/// Register a job and hand it to the queue
///
/// A refused job is marked `Failed` straight from `Created`; its staged file
/// stays on disk.
pub(crate) async fn submit(ctx: &PipelineContext, job: LoadJob) -> Result<(), QueueError> {
    ctx.ledger().register(&job);
    match ctx.queue().enqueue(job).await {
        Ok(()) => Ok(()),
        Err(Rejected { job, reason }) => {
            tracing::warn!(
                sequence_no = job.sequence_no,
                template = job.template_id(),
                path = %job.staged_file.path.display(),
                error = %reason,
                "Job not enqueued; staged file retained"
            );
            ctx.ledger().fail(job.id, None, &reason);
            Err(reason)
        }
    }
}

/// One extraction unit: produce, stage and enqueue until the producer ends
async fn run_unit(ctx: PipelineContext, producer: Box<dyn RecordProducer>) -> UnitReport {
    let strict = ctx.config().strict;
    let mut report = UnitReport {
        subtype: producer.subtype().to_string(),
        ..Default::default()
    };
    let subtype = report.subtype.clone();
    let mut batches = producer.produce();

    'produce: loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => {
                tracing::info!("Run cancelled; extraction unit stopping");
                break;
            }
            next = batches.next() => next,
        };
        let Some(item) = next else { break };

        let group = match item {
            Ok(group) => group,
            Err(err) => {
                tracing::warn!(stream = %err.stream, line = ?err.line, error = %err.message, "Skipping malformed record");
                report
                    .issues
                    .push(ProducerIssue::new(&subtype, IssueKind::Extraction, Some(err.stream.as_str()), &err));
                if strict {
                    report.issues.push(ProducerIssue::new(
                        &subtype,
                        IssueKind::Aborted,
                        None,
                        format!("strict mode: {}", err),
                    ));
                    break;
                }
                continue;
            }
        };
        report.batches += 1;

        let staged = {
            let stager = ctx.stager().clone();
            let templates = ctx.templates().to_vec();
            let sequence_ctx = ctx.clone();
            let subtype = subtype.clone();
            tokio::task::spawn_blocking(move || {
                stager.stage(&subtype, group, &templates, || sequence_ctx.next_sequence())
            })
            .await
        };

        let outcomes = match staged {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(mismatch)) => {
                tracing::error!(error = %mismatch, "Batch rejected");
                report
                    .issues
                    .push(ProducerIssue::new(&subtype, IssueKind::SchemaMismatch, None, &mismatch));
                if strict {
                    break;
                }
                continue;
            }
            Err(e) => {
                report.issues.push(ProducerIssue::new(&subtype, IssueKind::Aborted, None, e));
                break;
            }
        };

        let mut abort = false;
        for (template, outcome) in ctx.templates().iter().zip(outcomes) {
            match outcome {
                Ok(job) => {
                    report.jobs += 1;
                    match submit(&ctx, job).await {
                        Ok(()) => {}
                        Err(QueueError::CapacityTimeout(limit)) => {
                            report.issues.push(ProducerIssue::new(
                                &subtype,
                                IssueKind::Queue,
                                Some(template.id()),
                                QueueError::CapacityTimeout(limit),
                            ));
                        }
                        Err(reason) => {
                            report
                                .issues
                                .push(ProducerIssue::new(&subtype, IssueKind::Queue, Some(template.id()), reason));
                            abort = true;
                        }
                    }
                }
                Err(StageError::Schema(mismatch)) => {
                    tracing::error!(template = template.id(), error = %mismatch, "Stream rejected");
                    report.issues.push(ProducerIssue::new(
                        &subtype,
                        IssueKind::SchemaMismatch,
                        Some(template.id()),
                        &mismatch,
                    ));
                    abort |= strict;
                }
                Err(err) => {
                    tracing::error!(template = template.id(), error = %err, "Stream could not be staged");
                    report
                        .issues
                        .push(ProducerIssue::new(&subtype, IssueKind::Stage, Some(template.id()), &err));
                }
            }
        }

        if abort {
            if strict && !ctx.is_cancelled() {
                report.issues.push(ProducerIssue::new(
                    &subtype,
                    IssueKind::Aborted,
                    None,
                    "strict mode: stopped after a rejected stream",
                ));
            }
            break 'produce;
        }
    }

    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::error::ExtractionError;
    use crate::job::JobState;
    use crate::producer::IterProducer;
    use crate::record::{BatchGroup, Record};
    use crate::store::MemoryGraphStore;
    use crate::template::{Mutation, QueryTemplate};
    use std::sync::Arc;

    fn context(strict: bool) -> (tempfile::TempDir, PipelineContext, Arc<MemoryGraphStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config = LoaderConfig {
            workers: 2,
            queue_capacity: 4,
            staging_dir: dir.path().to_path_buf(),
            strict,
            ..Default::default()
        };
        let templates = vec![
            Arc::new(QueryTemplate::new("genes", 2, Mutation::merge_node("Gene", "id").unwrap()).unwrap()),
            Arc::new(QueryTemplate::new("proteins", 2, Mutation::merge_node("Protein", "id").unwrap()).unwrap()),
        ];
        let store = Arc::new(MemoryGraphStore::new());
        let ctx = PipelineContext::new(&config, templates, store.clone()).unwrap();
        (dir, ctx, store)
    }

    fn group(genes: &[&str], proteins: &[&str]) -> BatchGroup {
        let stream = |ids: &[&str]| ids.iter().map(|id| Record::new().with("id", *id)).collect();
        BatchGroup::new(vec![stream(genes), stream(proteins)])
    }

    #[tokio::test]
    async fn test_run_two_units() {
        let (_dir, ctx, store) = context(false);
        let producers: Vec<Box<dyn RecordProducer>> = vec![
            Box::new(IterProducer::new("human", vec![group(&["G1", "G2"], &["P1"])])),
            Box::new(IterProducer::new("mouse", vec![group(&["G3"], &[]), group(&["G4"], &["P2"])])),
        ];

        let summary = ProcessSupervisor::new(ctx.clone()).run(producers).await;

        assert!(summary.is_success());
        assert_eq!(summary.totals.staged, 6);
        assert_eq!(summary.totals.committed, 6);
        assert_eq!(summary.totals.committed_rows, 6);
        assert_eq!(summary.per_subtype["mouse"].staged, 4);
        assert_eq!(store.node_count(), 6);
        assert_eq!(ctx.progress().terminal(), 6);
        assert!(ctx.queue().is_empty());
    }

    #[tokio::test]
    async fn test_schema_mismatch_fails_only_the_stream() {
        let (_dir, ctx, store) = context(false);
        let bad = BatchGroup::new(vec![
            vec![Record::new().with("id", "G1"), Record::new().with("name", "x").with("id", "G2")],
            vec![Record::new().with("id", "P1")],
        ]);
        let producers: Vec<Box<dyn RecordProducer>> =
            vec![Box::new(IterProducer::new("human", vec![bad, group(&["G3"], &[])]))];

        let summary = ProcessSupervisor::new(ctx).run(producers).await;

        assert!(!summary.is_success());
        assert_eq!(summary.per_template["genes"].stage_failed, 1);
        assert_eq!(summary.totals.committed, 3);
        assert_eq!(store.node_count(), 2);
    }

    #[tokio::test]
    async fn test_strict_mode_aborts_producer() {
        let (_dir, ctx, _store) = context(true);
        let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(IterProducer::with_items(
            "human",
            vec![
                Ok(group(&["G1"], &["P1"])),
                Err(ExtractionError::new("human", "genes", "not json").at_line(2)),
                Ok(group(&["G2"], &["P2"])),
            ],
        ))];

        let summary = ProcessSupervisor::new(ctx).run(producers).await;

        assert_eq!(summary.totals.staged, 2);
        assert_eq!(summary.extraction_errors(), 1);
        assert!(summary.producer_issues.iter().any(|i| i.kind == IssueKind::Aborted));
        assert!(!summary.is_success());
    }

    #[tokio::test]
    async fn test_lenient_mode_skips_malformed_records() {
        let (_dir, ctx, _store) = context(false);
        let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(IterProducer::with_items(
            "human",
            vec![
                Err(ExtractionError::new("human", "genes", "not json")),
                Ok(group(&["G1"], &["P1"])),
            ],
        ))];

        let summary = ProcessSupervisor::new(ctx).run(producers).await;
        assert!(summary.is_success());
        assert_eq!(summary.extraction_errors(), 1);
        assert_eq!(summary.totals.committed, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (_dir, ctx, _store) = context(false);
        ctx.cancel();
        let producers: Vec<Box<dyn RecordProducer>> =
            vec![Box::new(IterProducer::new("human", vec![group(&["G1"], &["P1"])]))];

        let summary = ProcessSupervisor::new(ctx.clone()).run(producers).await;
        assert!(summary.cancelled);
        assert_eq!(summary.totals.staged, 0);
        assert_eq!(ctx.ledger().count_in(JobState::Queued), 0);
    }
}
