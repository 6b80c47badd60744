//! Record producers
//!
//! A producer yields a lazy, finite sequence of [`BatchGroup`]s for one data
//! subtype, one stream per template in template order. Malformed source
//! records surface as [`ExtractionError`] items in the same sequence and are
//! never part of a group.

use futures::stream::{self, BoxStream, StreamExt};
use serde_jsonlines::JsonLinesReader;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ExtractionError;
use crate::record::{BatchGroup, Record};
use crate::template::QueryTemplate;

/// Sequence of batch groups and extraction errors
pub type BatchStream = BoxStream<'static, Result<BatchGroup, ExtractionError>>;

/// Source of batch groups for one subtype
pub trait RecordProducer: Send {
    fn subtype(&self) -> &str;

    /// Consume the producer; the sequence cannot be restarted
    fn produce(self: Box<Self>) -> BatchStream;
}

/// Producer over groups already in memory
pub struct IterProducer {
    subtype: String,
    items: Vec<Result<BatchGroup, ExtractionError>>,
}

impl IterProducer {
    pub fn new(subtype: impl Into<String>, groups: Vec<BatchGroup>) -> Self {
        Self {
            subtype: subtype.into(),
            items: groups.into_iter().map(Ok).collect(),
        }
    }

    /// Interleave extraction errors with groups
    pub fn with_items(subtype: impl Into<String>, items: Vec<Result<BatchGroup, ExtractionError>>) -> Self {
        Self {
            subtype: subtype.into(),
            items,
        }
    }
}

impl RecordProducer for IterProducer {
    fn subtype(&self) -> &str {
        &self.subtype
    }

    fn produce(self: Box<Self>) -> BatchStream {
        stream::iter(self.items).boxed()
    }
}

/// Reads `<dir>/<template_id>.jsonl`, one JSON object per line
///
/// A missing file yields an empty stream for that template. Groups carry up to
/// `batch_size` records per stream; reading stays at most one group ahead of
/// the consumer.
pub struct JsonLinesProducer {
    subtype: String,
    dir: PathBuf,
    templates: Vec<Arc<QueryTemplate>>,
    batch_size: usize,
    max_batches: Option<usize>,
}

impl JsonLinesProducer {
    pub fn new(
        subtype: impl Into<String>,
        dir: impl Into<PathBuf>,
        templates: Vec<Arc<QueryTemplate>>,
        batch_size: usize,
    ) -> Self {
        Self {
            subtype: subtype.into(),
            dir: dir.into(),
            templates,
            batch_size: batch_size.max(1),
            max_batches: None,
        }
    }

    /// Stop after `max` groups
    pub fn with_max_batches(mut self, max: Option<usize>) -> Self {
        self.max_batches = max;
        self
    }

    fn read_all(self, tx: mpsc::Sender<Result<BatchGroup, ExtractionError>>) {
        let mut sources: Vec<Option<LineSource>> = Vec::with_capacity(self.templates.len());
        for template in &self.templates {
            let path = self.dir.join(format!("{}.jsonl", template.id()));
            match File::open(&path) {
                Ok(file) => sources.push(Some(LineSource {
                    stream: template.id().to_string(),
                    reader: JsonLinesReader::new(BufReader::new(file)),
                    line: 0,
                })),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!(subtype = %self.subtype, path = %path.display(), "No source file; stream is empty");
                    sources.push(None);
                }
                Err(e) => {
                    let err = ExtractionError::new(&self.subtype, template.id(), format!("cannot open {}: {}", path.display(), e));
                    if tx.blocking_send(Err(err)).is_err() {
                        return;
                    }
                    sources.push(None);
                }
            }
        }

        let mut emitted = 0usize;
        loop {
            if self.max_batches.is_some_and(|max| emitted >= max) {
                break;
            }

            let mut streams = vec![Vec::new(); sources.len()];
            let mut exhausted = true;
            for (slot, records) in sources.iter_mut().zip(streams.iter_mut()) {
                let Some(source) = slot else { continue };
                let mut done = false;

                while records.len() < self.batch_size {
                    match source.next(&self.subtype) {
                        Next::Record(record) => records.push(record),
                        Next::Malformed(err) => {
                            if tx.blocking_send(Err(err)).is_err() {
                                return;
                            }
                        }
                        Next::End => {
                            done = true;
                            break;
                        }
                    }
                }

                if done {
                    *slot = None;
                } else {
                    exhausted = false;
                }
            }

            let group = BatchGroup::new(streams);
            if group.record_count() > 0 {
                if tx.blocking_send(Ok(group)).is_err() {
                    return;
                }
                emitted += 1;
            }
            if exhausted {
                break;
            }
        }

        tracing::debug!(subtype = %self.subtype, batches = emitted, "Source files exhausted");
    }
}

impl RecordProducer for JsonLinesProducer {
    fn subtype(&self) -> &str {
        &self.subtype
    }

    /// Must be called within a tokio runtime
    fn produce(self: Box<Self>) -> BatchStream {
        let (tx, rx) = mpsc::channel(1);
        tokio::task::spawn_blocking(move || self.read_all(tx));
        ReceiverStream::new(rx).boxed()
    }
}

struct LineSource {
    stream: String,
    reader: JsonLinesReader<BufReader<File>>,
    line: u64,
}

enum Next {
    Record(Record),
    Malformed(ExtractionError),
    End,
}

impl LineSource {
    fn next(&mut self, subtype: &str) -> Next {
        self.line += 1;
        let malformed = |message: String, line: u64| {
            Next::Malformed(ExtractionError::new(subtype, &self.stream, message).at_line(line))
        };

        match self.reader.read::<serde_json::Value>() {
            Ok(Some(value)) => match Record::from_json(value) {
                Ok(record) => Next::Record(record),
                Err(message) => malformed(message, self.line),
            },
            Ok(None) => Next::End,
            // Truncated and blank lines surface as UnexpectedEof
            Err(e) if matches!(e.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) => {
                malformed(e.to_string(), self.line)
            }
            Err(e) => {
                tracing::warn!(subtype, stream = %self.stream, error = %e, "Stopped reading source file");
                Next::End
            }
        }
    }
}
