//! BDP graph loader
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch-staging and bulk-load engine for bioscience source datasets.
//!
//! # Architecture
//!
//! - **producer**: [`RecordProducer`] yields [`BatchGroup`]s per data subtype
//! - **stager**: [`BatchStager`] writes each stream to an atomically renamed CSV file
//! - **job**: [`LoadJob`] pairs a staged file with its [`QueryTemplate`]; the
//!   [`JobLedger`] tracks every job's state
//! - **queue**: bounded [`DispatchQueue`] giving producers backpressure
//! - **worker**: [`WorkerPool`] applies jobs in `commit_size` chunks through a [`GraphStore`]
//! - **supervisor**: [`ProcessSupervisor`] runs one extraction unit per subtype and
//!   aggregates a [`RunSummary`]
//!
//! # Example
//!
//! ```no_run
//! use bdp_loader::{
//!     config::LoaderConfig, store::MemoryGraphStore, template, JsonLinesProducer,
//!     PipelineContext, ProcessSupervisor, RecordProducer,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LoaderConfig::from_env()?;
//!     let templates = template::load_templates("templates.json")?;
//!     let store = Arc::new(MemoryGraphStore::new());
//!     let ctx = PipelineContext::new(&config, templates.clone(), store)?;
//!
//!     let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(JsonLinesProducer::new(
//!         "human",
//!         "./data/human",
//!         templates,
//!         config.batch_size,
//!     ))];
//!
//!     let summary = ProcessSupervisor::new(ctx).run(producers).await;
//!     println!("{}", summary.render_table());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod producer;
pub mod queue;
pub mod record;
pub mod replay;
pub mod stager;
pub mod store;
pub mod summary;
pub mod supervisor;
pub mod template;
pub mod worker;

pub use context::{PipelineContext, Progress};
pub use error::{
    ConfigError, ExtractionError, LoadError, QueueError, SchemaMismatchError, StageError, StoreError,
    TemplateError,
};
pub use job::{JobLedger, JobState, LoadJob, StagedFile};
pub use producer::{BatchStream, IterProducer, JsonLinesProducer, RecordProducer};
pub use queue::DispatchQueue;
pub use record::{BatchGroup, FieldValue, Record, Schema};
pub use stager::{BatchStager, RowChunk, StagedReader};
pub use store::GraphStore;
pub use summary::{IssueKind, ProducerIssue, RunSummary};
pub use supervisor::ProcessSupervisor;
pub use template::{Mutation, QueryTemplate};
pub use worker::{WorkerPool, WorkerState};
