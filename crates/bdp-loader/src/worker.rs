//! Load worker pool
//!
//! Each worker loops: dequeue one job, stream its staged file in
//! `commit_size` chunks, execute the template per chunk and commit per chunk.
//! A failing chunk aborts the rest of its file and fails only that job; the
//! worker moves on to the next one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::context::PipelineContext;
use crate::error::{LoadError, LoadFailure};
use crate::job::{JobState, LoadJob};
use crate::stager::{RowChunk, StagedReader};

/// Whether a worker is between jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

/// Fixed set of persistent load workers
#[derive(Debug)]
pub struct WorkerPool {
    ctx: PipelineContext,
    busy: Arc<[AtomicBool]>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers on the current runtime
    pub fn start(ctx: &PipelineContext) -> Self {
        let size = ctx.config().workers;
        let busy: Arc<[AtomicBool]> = (0..size).map(|_| AtomicBool::new(false)).collect();

        let handles = (0..size)
            .map(|worker_id| {
                let ctx = ctx.clone();
                let busy = busy.clone();
                tokio::spawn(
                    run_worker(worker_id, ctx, busy).instrument(tracing::info_span!("worker", worker_id)),
                )
            })
            .collect();

        tracing::info!(workers = size, store = ctx.store().name(), "Worker pool started");

        Self {
            ctx: ctx.clone(),
            busy,
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.busy
            .iter()
            .map(|b| {
                if b.load(Ordering::SeqCst) {
                    WorkerState::Busy
                } else {
                    WorkerState::Idle
                }
            })
            .collect()
    }

    /// Wait until every job enqueued so far is terminal
    ///
    /// Callers must first make sure no producer will enqueue more work.
    pub async fn drain(&self) {
        self.ctx.queue().wait_idle().await;
    }

    /// Close the queue and wait for every worker to exit
    pub async fn shutdown(self) {
        self.ctx.queue().close();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task ended abnormally");
            }
        }
        tracing::debug!("Worker pool stopped");
    }
}

async fn run_worker(worker_id: usize, ctx: PipelineContext, busy: Arc<[AtomicBool]>) {
    while let Some(job) = ctx.queue().dequeue().await {
        busy[worker_id].store(true, Ordering::SeqCst);

        let job_id = job.id;
        let span = tracing::info_span!(
            "load_job",
            sequence_no = job.sequence_no,
            template = job.template_id(),
            subtype = %job.subtype
        );

        // A panicking store fails the job instead of the worker
        let handle = tokio::spawn(process_job(ctx.clone(), job).instrument(span));
        if let Err(e) = handle.await {
            tracing::error!(job_id = %job_id, error = %e, "Load job aborted");
            ctx.ledger().fail(job_id, None, LoadFailure::Aborted(e.to_string()));
        }

        busy[worker_id].store(false, Ordering::SeqCst);
        ctx.queue().complete();
    }
    tracing::debug!("Queue closed; worker exiting");
}

/// Run one job to a terminal state
pub async fn process_job(ctx: PipelineContext, job: LoadJob) {
    let ledger = ctx.ledger();
    ledger.transition(job.id, JobState::InProgress);
    tracing::debug!(rows = job.staged_file.row_count, chunks = job.expected_chunks(), "Job started");

    match load_file(&ctx, &job).await {
        Ok(rows) => {
            ledger.transition(job.id, JobState::Committed);
            if let Err(e) = tokio::fs::remove_file(&job.staged_file.path).await {
                tracing::warn!(path = %job.staged_file.path.display(), error = %e, "Failed to remove staged file");
            }
            tracing::info!(rows, "Job committed");
        }
        Err(err) => {
            tracing::error!(
                error = %err,
                chunk_index = err.chunk_index,
                path = %err.path.display(),
                "Job failed; staged file retained"
            );
            ledger.fail(job.id, Some(err.chunk_index), &err.kind);
        }
    }
}

/// Stream the staged file through the store; returns committed rows
async fn load_file(ctx: &PipelineContext, job: &LoadJob) -> Result<usize, LoadError> {
    let timeout = ctx.config().job_timeout();
    let deadline = Instant::now() + timeout;
    let fail = |chunk_index: usize, kind: LoadFailure| LoadError {
        template: job.template_id().to_string(),
        path: job.staged_file.path.clone(),
        sequence_no: job.sequence_no,
        chunk_index,
        kind,
    };

    let path = job.staged_file.path.clone();
    let mut reader = tokio::task::spawn_blocking(move || StagedReader::open(path))
        .await
        .map_err(|e| fail(0, LoadFailure::Aborted(e.to_string())))?
        .map_err(|e| fail(0, LoadFailure::Read(e)))?;

    let mut committed = 0usize;
    let mut chunk_index = 0usize;
    loop {
        let (returned, chunk) = read_chunk(reader, job.commit_size)
            .await
            .map_err(|kind| fail(chunk_index, kind))?;
        reader = returned;
        let Some(chunk) = chunk else { break };

        if Instant::now() >= deadline {
            return Err(fail(chunk_index, LoadFailure::Timeout(timeout)));
        }

        let rows = chunk.len();
        tokio::time::timeout_at(deadline, ctx.store().execute(&job.template, &chunk))
            .await
            .map_err(|_| fail(chunk_index, LoadFailure::Timeout(timeout)))?
            .map_err(|e| fail(chunk_index, LoadFailure::Store(e)))?;

        ctx.ledger().record_chunk(job.id, rows);
        committed += rows;
        tracing::debug!(chunk_index, rows, "Chunk committed");
        chunk_index += 1;
    }

    Ok(committed)
}

async fn read_chunk(
    mut reader: StagedReader,
    size: usize,
) -> Result<(StagedReader, Option<RowChunk>), LoadFailure> {
    tokio::task::spawn_blocking(move || {
        let chunk = reader.next_chunk(size)?;
        Ok::<_, LoadFailure>((reader, chunk))
    })
    .await
    .map_err(|e| LoadFailure::Aborted(e.to_string()))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::LoaderConfig;
    use crate::record::Record;
    use crate::store::{GraphStore, MemoryGraphStore};
    use crate::template::{Mutation, QueryTemplate};
    use std::time::Duration;
    use uuid::Uuid;

    fn setup(
        store: Arc<dyn GraphStore>,
        workers: usize,
        timeout_secs: u64,
    ) -> (tempfile::TempDir, PipelineContext, Arc<QueryTemplate>) {
        let dir = tempfile::tempdir().unwrap();
        let config = LoaderConfig {
            workers,
            queue_capacity: 8,
            staging_dir: dir.path().to_path_buf(),
            job_timeout_secs: timeout_secs,
            ..Default::default()
        };
        let template = Arc::new(QueryTemplate::new("genes", 2, Mutation::merge_node("Gene", "id").unwrap()).unwrap());
        let ctx = PipelineContext::new(&config, vec![template.clone()], store).unwrap();
        (dir, ctx, template)
    }

    async fn stage_and_enqueue(ctx: &PipelineContext, template: &QueryTemplate, ids: &[&str]) -> Uuid {
        let records: Vec<Record> = ids.iter().map(|id| Record::new().with("id", *id)).collect();
        let seq = ctx.next_sequence();
        let staged = ctx.stager().stage_stream("human", template, &records, seq).unwrap();
        let job = LoadJob::new("human", ctx.template(template.id()).unwrap().clone(), staged, seq);
        let id = job.id;
        ctx.ledger().register(&job);
        ctx.queue().enqueue(job).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_chunks_and_cleanup() {
        let store = Arc::new(MemoryGraphStore::new());
        let (_dir, ctx, template) = setup(store.clone(), 2, 60);
        let pool = WorkerPool::start(&ctx);
        assert_eq!(pool.size(), 2);

        let id = stage_and_enqueue(&ctx, &template, &["A", "B", "C", "D", "E"]).await;
        pool.drain().await;

        let entry = ctx.ledger().get(id).unwrap();
        assert_eq!(entry.state, JobState::Committed);
        assert_eq!(entry.chunks_committed, 3);
        assert_eq!(entry.committed_rows, 5);
        assert!(!entry.staged_file.exists());
        assert_eq!(store.node_count(), 5);
        assert_eq!(pool.states(), vec![WorkerState::Idle; 2]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_chunk_isolates_job() {
        let store = Arc::new(MemoryGraphStore::new().failing_on("POISON"));
        let (_dir, ctx, template) = setup(store.clone(), 1, 60);
        let pool = WorkerPool::start(&ctx);

        let bad = stage_and_enqueue(&ctx, &template, &["A", "B", "POISON", "C"]).await;
        let good = stage_and_enqueue(&ctx, &template, &["X", "Y"]).await;
        pool.drain().await;

        let failed = ctx.ledger().get(bad).unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.failed_chunk, Some(1));
        assert_eq!(failed.committed_rows, 2);
        assert!(failed.staged_file.exists());
        assert_eq!(ctx.ledger().get(good).unwrap().state, JobState::Committed);
        assert_eq!(ctx.ledger().count_in(JobState::Failed), 1);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout() {
        let store = Arc::new(MemoryGraphStore::new().with_latency(Duration::from_secs(10)));
        let (_dir, ctx, template) = setup(store, 1, 5);
        let pool = WorkerPool::start(&ctx);

        let id = stage_and_enqueue(&ctx, &template, &["A"]).await;
        pool.drain().await;

        let entry = ctx.ledger().get(id).unwrap();
        assert_eq!(entry.state, JobState::Failed);
        assert!(entry.error.unwrap().contains("timeout"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_placeholder_commits_with_no_chunks() {
        let store = Arc::new(MemoryGraphStore::new());
        let (_dir, ctx, template) = setup(store.clone(), 1, 60);
        let pool = WorkerPool::start(&ctx);

        let id = stage_and_enqueue(&ctx, &template, &[]).await;
        pool.drain().await;

        let entry = ctx.ledger().get(id).unwrap();
        assert_eq!(entry.state, JobState::Committed);
        assert_eq!(entry.chunks_committed, 0);
        assert_eq!(store.committed_chunks(), 0);
        pool.shutdown().await;
    }
}
