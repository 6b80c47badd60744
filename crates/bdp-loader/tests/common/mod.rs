//! Shared fixtures for loader integration tests
//!
//! Everything runs against [`MemoryGraphStore`] in a throwaway staging
//! directory, so no database is needed.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use bdp_loader::config::LoaderConfig;
use bdp_loader::store::MemoryGraphStore;
use bdp_loader::{BatchGroup, Mutation, PipelineContext, QueryTemplate, Record};
use std::sync::Arc;
use tempfile::TempDir;

/// A context plus the directory and store it was built on
pub struct TestPipeline {
    pub dir: TempDir,
    pub ctx: PipelineContext,
    pub store: Arc<MemoryGraphStore>,
}

impl TestPipeline {
    pub fn new(config: LoaderConfig, templates: Vec<Arc<QueryTemplate>>, store: MemoryGraphStore) -> Self {
        Self::with_store(config, templates, Arc::new(store))
    }

    /// Build on an existing store; the staging dir in `config` is replaced
    pub fn with_store(
        mut config: LoaderConfig,
        templates: Vec<Arc<QueryTemplate>>,
        store: Arc<MemoryGraphStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.staging_dir = dir.path().to_path_buf();
        let ctx = PipelineContext::new(&config, templates, store.clone()).unwrap();
        Self { dir, ctx, store }
    }
}

pub fn config(workers: usize, queue_capacity: usize) -> LoaderConfig {
    LoaderConfig {
        workers,
        queue_capacity,
        ..Default::default()
    }
}

pub fn gene_template(commit_size: usize) -> Arc<QueryTemplate> {
    Arc::new(QueryTemplate::new("genes", commit_size, Mutation::merge_node("Gene", "id").unwrap()).unwrap())
}

pub fn interaction_template(commit_size: usize) -> Arc<QueryTemplate> {
    Arc::new(
        QueryTemplate::new(
            "interactions",
            commit_size,
            Mutation::merge_edge("INTERACTS_WITH", ("Gene", "id", "source"), ("Gene", "id", "target")).unwrap(),
        )
        .unwrap(),
    )
}

pub fn genes(ids: &[&str]) -> Vec<Record> {
    ids.iter()
        .map(|id| Record::new().with("id", *id).with("symbol", format!("SYM-{}", id)))
        .collect()
}

pub fn interactions(pairs: &[(&str, &str)]) -> Vec<Record> {
    pairs
        .iter()
        .map(|(source, target)| Record::new().with("source", *source).with("target", *target))
        .collect()
}

/// One group per slice, each holding a single gene stream
pub fn gene_groups(batches: &[&[&str]]) -> Vec<BatchGroup> {
    batches.iter().map(|ids| BatchGroup::new(vec![genes(ids)])).collect()
}
