//! Shared state of one loader run
//!
//! Built once per run and cloned into every extraction unit and worker. There
//! is no process-wide queue or counter.
//!
//! Every run stages into its own `run-<timestamp>-<id>` directory under the
//! configured staging root, so sequence numbers restarting at 1 never reuse
//! the name of a file an earlier run retained for replay.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::LoaderConfig;
use crate::error::ConfigError;
use crate::job::{JobLedger, JobState};
use crate::queue::DispatchQueue;
use crate::stager::BatchStager;
use crate::store::GraphStore;
use crate::template::QueryTemplate;

/// Handle to the queue, ledger, stager and store of a run
#[derive(Clone)]
pub struct PipelineContext {
    inner: Arc<Inner>,
}

struct Inner {
    run_id: String,
    config: LoaderConfig,
    templates: Vec<Arc<QueryTemplate>>,
    store: Arc<dyn GraphStore>,
    stager: BatchStager,
    ledger: Arc<JobLedger>,
    queue: DispatchQueue,
    sequence: AtomicU64,
    cancel: CancellationToken,
}

/// Point-in-time view of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub created: usize,
    pub queued: usize,
    pub in_progress: usize,
    pub committed: usize,
    pub failed: usize,
    /// Jobs currently sitting in the dispatch queue
    pub queue_depth: usize,
}

impl Progress {
    pub fn terminal(&self) -> usize {
        self.committed + self.failed
    }
}

impl PipelineContext {
    pub fn new(
        config: &LoaderConfig,
        templates: Vec<Arc<QueryTemplate>>,
        store: Arc<dyn GraphStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let run_id = new_run_id();
        let run_dir = config.staging_dir.join(&run_id);
        let stager = BatchStager::new(&run_dir).map_err(|source| ConfigError::StagingDir { path: run_dir, source })?;
        let ledger = Arc::new(JobLedger::new());
        let cancel = CancellationToken::new();
        let queue = DispatchQueue::new(
            config.queue_capacity,
            ledger.clone(),
            config.enqueue_timeout(),
            cancel.clone(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                run_id,
                config: config.clone(),
                templates,
                store,
                stager,
                ledger,
                queue,
                sequence: AtomicU64::new(0),
                cancel,
            }),
        })
    }

    /// Name of this run's staging sub-directory
    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    pub fn templates(&self) -> &[Arc<QueryTemplate>] {
        &self.inner.templates
    }

    pub fn template(&self, id: &str) -> Option<&Arc<QueryTemplate>> {
        self.inner.templates.iter().find(|t| t.id() == id)
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.inner.store
    }

    pub fn stager(&self) -> &BatchStager {
        &self.inner.stager
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.inner.ledger
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.inner.queue
    }

    /// Next run-wide sequence number, starting at 1
    pub fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stop further enqueuing; jobs already queued still run
    pub fn cancel(&self) {
        if !self.inner.cancel.is_cancelled() {
            tracing::warn!("Run cancelled; no further jobs will be enqueued");
        }
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn progress(&self) -> Progress {
        let ledger = &self.inner.ledger;
        Progress {
            created: ledger.count_in(JobState::Created),
            queued: ledger.count_in(JobState::Queued),
            in_progress: ledger.count_in(JobState::InProgress),
            committed: ledger.count_in(JobState::Committed),
            failed: ledger.count_in(JobState::Failed),
            queue_depth: self.inner.queue.len(),
        }
    }
}

fn new_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run-{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &id[..8])
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.inner.run_id)
            .field("store", &self.inner.store.name())
            .field("templates", &self.inner.templates.len())
            .field("staging_dir", &self.inner.stager.staging_dir())
            .field("progress", &self.progress())
            .finish()
    }
}
