//! End-to-end pipeline tests
//!
//! Drive the supervisor, stager, queue and worker pool together against the
//! in-memory graph store.
//!
//! ```bash
//! cargo test -p bdp-loader --test pipeline_tests
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bdp_loader::replay::{FailureManifest, MANIFEST_FILE};
use bdp_loader::store::memory::NodeKey;
use bdp_loader::store::MemoryGraphStore;
use bdp_loader::{
    BatchGroup, BatchStream, FieldValue, IssueKind, IterProducer, JobState, JsonLinesProducer,
    PipelineContext, ProcessSupervisor, Record, RecordProducer,
};
use common::{config, gene_groups, gene_template, genes, interaction_template, interactions, TestPipeline};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Staged file format
// ============================================================================

#[test]
fn test_staged_file_has_header_and_fixed_width_rows() {
    let pipeline = TestPipeline::new(config(1, 4), vec![gene_template(10)], MemoryGraphStore::new());
    let records = vec![
        Record::new().with("id", "G1").with("note", "plain"),
        Record::new().with("id", "G2").with("note", "has, comma"),
        Record::new().with("id", "G3").with("note", "has \"quotes\"\nand a newline"),
    ];

    let staged = pipeline
        .ctx
        .stager()
        .stage_stream("human", &gene_template(10), &records, 7)
        .unwrap();
    assert_eq!(staged.row_count, 3);
    assert_eq!(staged.path.file_name().unwrap(), "human_genes_00000007.csv");

    let raw = std::fs::read_to_string(&staged.path).unwrap();
    assert!(raw.starts_with("\"id\",\"note\""));

    let mut reader = csv::Reader::from_path(&staged.path).unwrap();
    assert_eq!(reader.headers().unwrap(), vec!["id", "note"]);
    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|row| row.len() == 2));
    assert_eq!(&rows[1][1], "has, comma");
    assert_eq!(&rows[2][1], "has \"quotes\"\nand a newline");
}

// ============================================================================
// Chunking
// ============================================================================

#[tokio::test]
async fn test_two_batches_of_three_with_commit_size_two() {
    let pipeline = TestPipeline::new(config(2, 4), vec![gene_template(2)], MemoryGraphStore::new());
    let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(IterProducer::new(
        "human",
        gene_groups(&[&["G1", "G2", "G3"], &["G4", "G5", "G6"]]),
    ))];

    let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

    assert!(summary.is_success());
    assert_eq!(summary.totals.committed, 2);
    assert_eq!(summary.totals.committed_rows, 6);

    let jobs = pipeline.ctx.ledger().snapshot();
    assert_eq!(jobs.len(), 2);
    for job in &jobs {
        assert_eq!(job.state, JobState::Committed);
        assert_eq!(job.chunks_committed, 2);
        assert_eq!(job.committed_rows, 3);
        assert!(!job.staged_file.exists());
    }
    assert_eq!(pipeline.store.committed_chunks(), 4);
    assert_eq!(pipeline.store.node_count(), 6);
}

#[tokio::test]
async fn test_chunk_count_is_ceiling_of_rows_over_commit_size() {
    for (rows, commit_size, chunks) in [(1, 5, 1), (5, 5, 1), (6, 5, 2), (11, 3, 4)] {
        let pipeline = TestPipeline::new(config(1, 2), vec![gene_template(commit_size)], MemoryGraphStore::new());
        let ids: Vec<String> = (0..rows).map(|i| format!("G{}", i)).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        let producers: Vec<Box<dyn RecordProducer>> =
            vec![Box::new(IterProducer::new("human", gene_groups(&[ids.as_slice()])))];

        let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

        let job = &pipeline.ctx.ledger().snapshot()[0];
        assert_eq!(job.chunks_committed, chunks, "{} rows / commit size {}", rows, commit_size);
        assert_eq!(summary.totals.committed_rows, rows);
    }
}

// ============================================================================
// Failure isolation
// ============================================================================

#[tokio::test]
async fn test_failed_chunk_fails_exactly_one_job() {
    let pipeline = TestPipeline::new(
        config(2, 4),
        vec![gene_template(2)],
        MemoryGraphStore::new().failing_on("POISON"),
    );
    let producers: Vec<Box<dyn RecordProducer>> = vec![
        Box::new(IterProducer::new("human", gene_groups(&[&["G1", "G2"], &["G3", "POISON", "G4"]]))),
        Box::new(IterProducer::new("mouse", gene_groups(&[&["M1"], &["M2", "M3"]]))),
    ];

    let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

    assert!(!summary.is_success());
    assert_eq!(summary.totals.staged, 4);
    assert_eq!(summary.totals.committed, 3);
    assert_eq!(summary.totals.failed, 1);

    let failed = &summary.failed_jobs[0];
    assert_eq!(failed.subtype, "human");
    assert_eq!(failed.failed_chunk, Some(0));
    assert!(failed.staged_file.exists());
    assert!(failed.sha256.is_some());
    assert!(pipeline.ctx.stager().staging_dir().join(MANIFEST_FILE).exists());

    assert_eq!(pipeline.store.node_count(), 5);
    assert!(pipeline.ctx.queue().is_empty());
}

#[tokio::test]
async fn test_unknown_columns_reject_stream_but_not_batch() {
    let pipeline = TestPipeline::new(
        config(1, 4),
        vec![gene_template(10), interaction_template(10)],
        MemoryGraphStore::new(),
    );
    let group = BatchGroup::new(vec![
        genes(&["G1", "G2"]),
        vec![Record::new().with("from", "G1").with("to", "G2")],
    ]);
    let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(IterProducer::new("human", vec![group]))];

    let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

    assert!(!summary.is_success());
    assert_eq!(summary.per_template["genes"].committed, 1);
    assert_eq!(summary.per_template["interactions"].stage_failed, 1);
    assert_eq!(summary.producer_issues[0].kind, IssueKind::SchemaMismatch);
    assert_eq!(pipeline.store.node_count(), 2);
}

#[tokio::test]
async fn test_later_run_keeps_earlier_failures() {
    let pipeline = TestPipeline::new(
        config(1, 4),
        vec![gene_template(2)],
        MemoryGraphStore::new().failing_on("POISON"),
    );
    let producers: Vec<Box<dyn RecordProducer>> =
        vec![Box::new(IterProducer::new("human", gene_groups(&[&["G1", "POISON"]])))];
    let first = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;
    assert_eq!(first.failed_jobs.len(), 1);

    let retained = first.failed_jobs[0].staged_file.clone();
    let manifest_path = pipeline.ctx.stager().staging_dir().join(MANIFEST_FILE);
    let retained_bytes = std::fs::read(&retained).unwrap();

    // Second run on the same staging root, same subtype and template
    let mut second_config = config(1, 4);
    second_config.staging_dir = pipeline.dir.path().to_path_buf();
    let store = Arc::new(MemoryGraphStore::new());
    let ctx = PipelineContext::new(&second_config, vec![gene_template(2)], store.clone()).unwrap();
    let producers: Vec<Box<dyn RecordProducer>> =
        vec![Box::new(IterProducer::new("human", gene_groups(&[&["G2", "G3"]])))];
    let second = ProcessSupervisor::new(ctx.clone()).run(producers).await;

    assert!(second.is_success());
    assert_eq!(ctx.ledger().snapshot()[0].sequence_no, 1);
    assert_ne!(ctx.stager().staging_dir(), pipeline.ctx.stager().staging_dir());
    assert!(!ctx.stager().staging_dir().exists());

    assert_eq!(std::fs::read(&retained).unwrap(), retained_bytes);
    let manifest = FailureManifest::read(&manifest_path).unwrap();
    assert_eq!(manifest.jobs, first.failed_jobs);
    assert_eq!(store.node_count(), 2);
}

#[tokio::test]
async fn test_null_and_empty_text_load_as_null_property() {
    let pipeline = TestPipeline::new(config(1, 4), vec![gene_template(10)], MemoryGraphStore::new());
    let group = BatchGroup::new(vec![vec![
        Record::new().with("id", "G1").with("symbol", FieldValue::Null),
        Record::new().with("id", "G2").with("symbol", ""),
    ]]);
    let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(IterProducer::new("human", vec![group]))];

    let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

    assert!(summary.is_success());
    for id in ["G1", "G2"] {
        let node = pipeline.store.node(&NodeKey::new("Gene", "id", id)).unwrap();
        assert_eq!(node["symbol"], serde_json::Value::Null);
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_loading_twice_leaves_graph_unchanged() {
    let store = Arc::new(MemoryGraphStore::new());
    let templates = vec![gene_template(2), interaction_template(2)];
    let groups = || {
        vec![
            BatchGroup::new(vec![genes(&["G1", "G2", "G3"]), interactions(&[("G1", "G2"), ("G2", "G3")])]),
            BatchGroup::new(vec![genes(&["G4"]), interactions(&[("G3", "G4"), ("G1", "G2")])]),
        ]
    };

    // One worker keeps node jobs ahead of the edge jobs staged after them
    let mut counts = Vec::new();
    for _ in 0..2 {
        let pipeline = TestPipeline::with_store(config(1, 4), templates.clone(), store.clone());
        let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(IterProducer::new("human", groups()))];
        let summary = ProcessSupervisor::new(pipeline.ctx).run(producers).await;
        assert!(summary.is_success());
        counts.push((store.node_count(), store.edge_count()));
    }

    assert_eq!(counts[0], (4, 3));
    assert_eq!(counts[0], counts[1]);
    assert!(store.has_edge(
        "INTERACTS_WITH",
        &NodeKey::new("Gene", "id", "G3"),
        &NodeKey::new("Gene", "id", "G4"),
    ));
    let g1 = store.node(&NodeKey::new("Gene", "id", "G1")).unwrap();
    assert_eq!(g1["symbol"], "SYM-G1");
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_producers_all_jobs_terminal() {
    let pipeline = TestPipeline::new(
        config(3, 20),
        vec![gene_template(3)],
        MemoryGraphStore::new().with_latency(Duration::from_millis(1)),
    );

    let producers: Vec<Box<dyn RecordProducer>> = (0..5)
        .map(|p| {
            let groups = (0..10)
                .map(|b| {
                    let a = format!("P{}B{}a", p, b);
                    let b = format!("P{}B{}b", p, b);
                    BatchGroup::new(vec![genes(&[a.as_str(), b.as_str()])])
                })
                .collect();
            Box::new(IterProducer::new(format!("subtype{}", p), groups)) as Box<dyn RecordProducer>
        })
        .collect();

    let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

    assert!(summary.is_success());
    assert_eq!(summary.totals.staged, 50);
    assert_eq!(summary.totals.committed, 50);
    assert_eq!(summary.per_subtype.len(), 5);
    assert_eq!(pipeline.ctx.progress().terminal(), 50);
    assert!(pipeline.ctx.queue().is_empty());
    assert_eq!(pipeline.ctx.queue().outstanding(), 0);
    assert_eq!(pipeline.store.node_count(), 100);

    let mut sequence: Vec<u64> = pipeline.ctx.ledger().snapshot().iter().map(|j| j.sequence_no).collect();
    sequence.dedup();
    assert_eq!(sequence, (1..=50).collect::<Vec<u64>>());
}

/// Yields the same small batch until the consumer stops polling
struct EndlessProducer;

impl RecordProducer for EndlessProducer {
    fn subtype(&self) -> &str {
        "endless"
    }

    fn produce(self: Box<Self>) -> BatchStream {
        futures::stream::unfold(0u64, |n| async move {
            tokio::task::yield_now().await;
            let id = format!("E{}", n);
            let group = BatchGroup::new(vec![genes(&[id.as_str()])]);
            Some((Ok(group), n + 1))
        })
        .boxed()
    }
}

#[tokio::test]
async fn test_cancellation_leaves_no_job_in_flight() {
    let pipeline = TestPipeline::new(
        config(2, 2),
        vec![gene_template(1)],
        MemoryGraphStore::new().with_latency(Duration::from_millis(2)),
    );
    let ctx = pipeline.ctx.clone();
    let run = tokio::spawn(ProcessSupervisor::new(ctx.clone()).run(vec![Box::new(EndlessProducer)]));

    while ctx.progress().committed < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    ctx.cancel();
    let summary = run.await.unwrap();

    assert!(summary.cancelled);
    assert!(!summary.is_success());
    for state in [JobState::Created, JobState::Queued, JobState::InProgress] {
        assert_eq!(ctx.ledger().count_in(state), 0, "jobs left in {}", state);
    }
    assert_eq!(ctx.queue().outstanding(), 0);
    assert!(summary.totals.committed >= 3);
}

// ============================================================================
// JSON-lines source
// ============================================================================

#[tokio::test]
async fn test_json_lines_source_end_to_end() {
    let templates = vec![gene_template(2), interaction_template(2)];
    let pipeline = TestPipeline::new(config(1, 4), templates.clone(), MemoryGraphStore::new());

    let source = tempfile::tempdir().unwrap();
    std::fs::write(
        source.path().join("genes.jsonl"),
        "{\"id\": \"G1\", \"symbol\": \"BRCA1\"}\n\
         {\"id\": \"G2\", \"symbol\": \"TP53\"}\n\
         not json\n\
         {\"id\": \"G3\", \"symbol\": \"EGFR\"}\n",
    )
    .unwrap();
    std::fs::write(
        source.path().join("interactions.jsonl"),
        "{\"source\": \"G1\", \"target\": \"G2\"}\n",
    )
    .unwrap();

    let producers: Vec<Box<dyn RecordProducer>> = vec![Box::new(JsonLinesProducer::new(
        "human",
        source.path(),
        templates,
        10,
    ))];
    let summary = ProcessSupervisor::new(pipeline.ctx.clone()).run(producers).await;

    assert!(summary.is_success());
    assert_eq!(summary.extraction_errors(), 1);
    assert_eq!(summary.totals.committed_rows, 4);
    assert_eq!(pipeline.store.node_count(), 3);
    assert_eq!(pipeline.store.edge_count(), 1);
}
