//! Batch staging: streams to transfer files and back
//!
//! Each non-empty stream becomes a CSV file whose header is the ordered key set
//! of the stream's first record; every field is quoted. Files are written to a
//! temporary file in the staging directory and renamed into place, so a worker
//! never observes a partially written file.

use csv::{QuoteStyle, ReaderBuilder, StringRecord, WriterBuilder};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::error::{SchemaMismatchError, StageError};
use crate::job::{LoadJob, StagedFile};
use crate::record::{BatchGroup, FieldValue, Record, Schema};
use crate::template::QueryTemplate;

/// Serializes batch streams into the staging directory
#[derive(Debug, Clone)]
pub struct BatchStager {
    staging_dir: PathBuf,
}

impl BatchStager {
    /// Create the stager, creating the staging directory if needed
    pub fn new(staging_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let staging_dir = staging_dir.into();
        std::fs::create_dir_all(&staging_dir)?;
        Ok(Self { staging_dir })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Remove the staging directory once nothing is retained in it
    pub fn remove_if_empty(&self) {
        match std::fs::remove_dir(&self.staging_dir) {
            Ok(()) => tracing::debug!(path = %self.staging_dir.display(), "Removed empty staging directory"),
            Err(e) => tracing::debug!(path = %self.staging_dir.display(), error = %e, "Staging directory kept"),
        }
    }

    /// Stage every stream of `group`, one load job per template
    ///
    /// Streams fail independently: a schema or I/O problem in one stream
    /// leaves the others staged. A group whose stream count differs from the
    /// template count is rejected as a whole.
    pub fn stage(
        &self,
        subtype: &str,
        group: BatchGroup,
        templates: &[Arc<QueryTemplate>],
        mut next_sequence: impl FnMut() -> u64,
    ) -> Result<Vec<Result<LoadJob, StageError>>, SchemaMismatchError> {
        if group.stream_count() != templates.len() {
            return Err(SchemaMismatchError::StreamCount {
                streams: group.stream_count(),
                templates: templates.len(),
            });
        }

        Ok(group
            .into_streams()
            .into_iter()
            .zip(templates)
            .map(|(records, template)| {
                let sequence_no = next_sequence();
                self.stage_stream(subtype, template, &records, sequence_no)
                    .map(|staged| LoadJob::new(subtype, template.clone(), staged, sequence_no))
            })
            .collect())
    }

    /// Write one stream to `{subtype}_{template}_{sequence}`
    pub fn stage_stream(
        &self,
        subtype: &str,
        template: &QueryTemplate,
        records: &[Record],
        sequence_no: u64,
    ) -> Result<StagedFile, StageError> {
        let path = self
            .staging_dir
            .join(template.staged_file_name(subtype, sequence_no));
        let io_err = |source: std::io::Error| StageError::Io {
            path: path.clone(),
            source,
        };

        let mut tmp = NamedTempFile::new_in(&self.staging_dir).map_err(io_err)?;

        let Some(first) = records.first() else {
            // Placeholder: an empty file keeps the stream visible in the ledger
            tmp.persist(&path).map_err(|e| io_err(e.error))?;
            return Ok(StagedFile {
                path,
                row_count: 0,
                columns: Vec::new(),
            });
        };

        let schema = Schema::of(first);
        template.check_columns(&schema)?;

        {
            let csv_err = |source: csv::Error| StageError::Csv {
                path: path.clone(),
                source,
            };
            let mut writer = WriterBuilder::new()
                .quote_style(QuoteStyle::Always)
                .from_writer(tmp.as_file_mut());

            writer.write_record(schema.columns()).map_err(csv_err)?;
            for (row, record) in records.iter().enumerate() {
                if !schema.matches(record) {
                    return Err(SchemaMismatchError::KeyMismatch {
                        template: template.id().to_string(),
                        row,
                        expected: schema.columns().to_vec(),
                        found: record.keys().map(str::to_string).collect(),
                    }
                    .into());
                }
                writer
                    .write_record(record.values().map(FieldValue::to_cell))
                    .map_err(csv_err)?;
            }
            writer.flush().map_err(io_err)?;
        }

        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        Ok(StagedFile {
            path,
            row_count: records.len(),
            columns: schema.columns().to_vec(),
        })
    }
}

/// A slice of staged rows with their header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChunk {
    columns: Arc<[String]>,
    rows: Vec<Vec<String>>,
}

impl RowChunk {
    pub fn new(columns: Arc<[String]>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Streams a staged file back in fixed-size chunks
#[derive(Debug)]
pub struct StagedReader {
    reader: csv::Reader<File>,
    columns: Arc<[String]>,
    rows_read: usize,
}

impl StagedReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, csv::Error> {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let columns = reader.headers()?.iter().map(str::to_string).collect();
        Ok(Self {
            reader,
            columns,
            rows_read: 0,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    /// Next chunk of at most `size` rows; `None` at end of file
    pub fn next_chunk(&mut self, size: usize) -> Result<Option<RowChunk>, csv::Error> {
        let mut rows = Vec::with_capacity(size.min(4096));
        let mut record = StringRecord::new();

        while rows.len() < size && self.reader.read_record(&mut record)? {
            rows.push(record.iter().map(str::to_string).collect());
        }

        self.rows_read += rows.len();
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(RowChunk::new(self.columns.clone(), rows)))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::template::Mutation;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn template(id: &str, commit_size: usize) -> Arc<QueryTemplate> {
        Arc::new(QueryTemplate::new(id, commit_size, Mutation::merge_node("Gene", "id").unwrap()).unwrap())
    }

    fn gene(id: &str, symbol: &str) -> Record {
        Record::new()
            .with("id", id)
            .with("symbol", symbol)
            .with("taxon", 9606)
            .with("synonyms", vec!["a,b", "c\"d"])
    }

    fn read_all(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
        let mut reader = StagedReader::open(path).unwrap();
        let columns = reader.columns().to_vec();
        let mut rows = Vec::new();
        while let Some(chunk) = reader.next_chunk(2).unwrap() {
            rows.extend(chunk.rows().iter().cloned());
        }
        (columns, rows)
    }

    #[test]
    fn test_header_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let records = vec![gene("HGNC:1", "A1BG"), gene("HGNC:2", "line\nbreak")];

        let staged = stager.stage_stream("human", &template("genes", 2), &records, 7).unwrap();
        assert_eq!(staged.row_count, 2);
        assert_eq!(staged.path.file_name().unwrap(), "human_genes_00000007.csv");

        let (columns, rows) = read_all(&staged.path);
        assert_eq!(columns, vec!["id", "symbol", "taxon", "synonyms"]);
        for (row, record) in rows.iter().zip(&records) {
            assert_eq!(row.len(), columns.len());
            let expected: Vec<String> = record.values().map(FieldValue::to_cell).collect();
            assert_eq!(row, &expected);
        }
    }

    #[test]
    fn test_every_field_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let staged = stager
            .stage_stream("human", &template("genes", 2), &[Record::new().with("id", 1)], 1)
            .unwrap();
        let raw = std::fs::read_to_string(&staged.path).unwrap();
        assert_eq!(raw, "\"id\"\n\"1\"\n");
    }

    #[test]
    fn test_schema_mismatch_fails_stream_without_leaving_file() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let records = vec![
            gene("HGNC:1", "A1BG"),
            Record::new().with("symbol", "TP53").with("id", "HGNC:11998"),
        ];

        let err = stager.stage_stream("human", &template("genes", 2), &records, 1).unwrap_err();
        assert!(matches!(
            err,
            StageError::Schema(SchemaMismatchError::KeyMismatch { row: 1, .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_bound_column() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let records = vec![Record::new().with("symbol", "TP53")];
        let err = stager.stage_stream("human", &template("genes", 2), &records, 1).unwrap_err();
        assert!(matches!(err, StageError::Schema(SchemaMismatchError::MissingColumns { .. })));
    }

    #[test]
    fn test_stage_group_with_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let templates = vec![template("genes", 2), template("gene_synonyms", 2)];
        let group = BatchGroup::new(vec![vec![gene("HGNC:1", "A1BG")], vec![]]);
        let sequence = AtomicU64::new(0);

        let jobs = stager
            .stage("human", group, &templates, || sequence.fetch_add(1, Ordering::SeqCst) + 1)
            .unwrap();

        assert_eq!(jobs.len(), 2);
        let first = jobs[0].as_ref().unwrap();
        let placeholder = jobs[1].as_ref().unwrap();
        assert_eq!(first.sequence_no, 1);
        assert_eq!(placeholder.sequence_no, 2);
        assert!(placeholder.staged_file.is_placeholder());
        assert!(placeholder.staged_file.path.exists());

        let mut reader = StagedReader::open(&placeholder.staged_file.path).unwrap();
        assert!(reader.next_chunk(10).unwrap().is_none());
    }

    #[test]
    fn test_stream_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let group = BatchGroup::new(vec![vec![]]);
        let err = stager
            .stage("human", group, &[template("a", 1), template("b", 1)], || 1)
            .unwrap_err();
        assert_eq!(err, SchemaMismatchError::StreamCount { streams: 1, templates: 2 });
    }

    #[test]
    fn test_remove_if_empty_keeps_retained_files() {
        let root = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(root.path().join("run-a")).unwrap();
        let staged = stager
            .stage_stream("human", &template("genes", 2), &[Record::new().with("id", "G1")], 1)
            .unwrap();

        stager.remove_if_empty();
        assert!(staged.path.exists());

        std::fs::remove_file(&staged.path).unwrap();
        stager.remove_if_empty();
        assert!(!stager.staging_dir().exists());
    }

    #[test]
    fn test_null_and_empty_text_share_the_empty_cell() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let records = vec![
            Record::new().with("id", "G1").with("note", FieldValue::Null),
            Record::new().with("id", "G2").with("note", ""),
        ];
        let staged = stager.stage_stream("human", &template("genes", 2), &records, 1).unwrap();

        let (_, rows) = read_all(&staged.path);
        assert_eq!(rows[0][1], "");
        assert_eq!(rows[1][1], "");
    }

    #[test]
    fn test_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let stager = BatchStager::new(dir.path()).unwrap();
        let records: Vec<Record> = (0..5).map(|i| Record::new().with("id", i)).collect();
        let staged = stager.stage_stream("mouse", &template("genes", 2), &records, 3).unwrap();

        let mut reader = StagedReader::open(&staged.path).unwrap();
        let sizes: Vec<usize> = std::iter::from_fn(|| reader.next_chunk(2).unwrap())
            .map(|c| c.len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(reader.rows_read(), 5);
    }
}
