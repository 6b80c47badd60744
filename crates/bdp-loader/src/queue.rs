//! Bounded dispatch queue between extraction units and load workers
//!
//! Producers suspend in [`DispatchQueue::enqueue`] while the queue is full and
//! workers suspend in [`DispatchQueue::dequeue`] while it is empty. The queue
//! also counts dispatched jobs that have not yet reached a terminal state, which
//! is what [`DispatchQueue::wait_idle`] waits on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::job::{JobLedger, JobState, LoadJob};

/// A job the queue refused, handed back to the caller
#[derive(Debug, Error)]
#[error("load job #{} not enqueued: {reason}", .job.sequence_no)]
pub struct Rejected {
    pub job: LoadJob,
    pub reason: QueueError,
}

/// Multi-producer, multi-consumer FIFO of load jobs
#[derive(Debug)]
pub struct DispatchQueue {
    sender: Mutex<Option<mpsc::Sender<LoadJob>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<LoadJob>>,
    capacity: usize,
    ledger: Arc<JobLedger>,
    queued: AtomicUsize,
    outstanding: AtomicUsize,
    idle: Notify,
    enqueue_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl DispatchQueue {
    pub fn new(
        capacity: usize,
        ledger: Arc<JobLedger>,
        enqueue_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            capacity: capacity.max(1),
            ledger,
            queued: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            enqueue_timeout,
            cancel,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<LoadJob>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hand a job to the workers, waiting while the queue is full
    ///
    /// The job moves to `Queued` in the ledger once a slot is secured. On
    /// cancellation, closure or the optional capacity timeout the job is
    /// returned untouched.
    pub async fn enqueue(&self, job: LoadJob) -> Result<(), Rejected> {
        if self.cancel.is_cancelled() {
            return Err(Rejected {
                job,
                reason: QueueError::Cancelled,
            });
        }
        let Some(sender) = self.sender() else {
            return Err(Rejected {
                job,
                reason: QueueError::Closed,
            });
        };

        let permit = match self.reserve(&sender).await {
            Ok(permit) => permit,
            Err(reason) => return Err(Rejected { job, reason }),
        };

        tracing::debug!(
            job_id = %job.id,
            sequence_no = job.sequence_no,
            template = job.template_id(),
            "Job queued"
        );
        self.ledger.transition(job.id, JobState::Queued);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_add(1, Ordering::SeqCst);
        permit.send(job);
        Ok(())
    }

    async fn reserve<'a>(
        &self,
        sender: &'a mpsc::Sender<LoadJob>,
    ) -> Result<mpsc::Permit<'a, LoadJob>, QueueError> {
        match self.enqueue_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
                reserved = tokio::time::timeout(limit, sender.reserve()) => match reserved {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) => Err(QueueError::Closed),
                    Err(_) => Err(QueueError::CapacityTimeout(limit)),
                },
            },
            None => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
                reserved = sender.reserve() => reserved.map_err(|_| QueueError::Closed),
            },
        }
    }

    /// Next job in FIFO order; `None` once the queue is closed and empty
    pub async fn dequeue(&self) -> Option<LoadJob> {
        let job = self.receiver.lock().await.recv().await;
        if job.is_some() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        job
    }

    /// Report that a dequeued job reached a terminal state
    pub fn complete(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until every enqueued job has been completed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs; workers see `None` after the remaining jobs
    pub fn close(&self) {
        if self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            tracing::debug!("Dispatch queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Jobs waiting to be dequeued
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs enqueued but not yet terminal
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
