//! Graph store adapters
//!
//! A [`GraphStore`] applies a template's mutation to one chunk of staged rows.
//! Every chunk is atomic: either all of its rows are applied or none are.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::stager::RowChunk;
use crate::template::{Identifier, Mutation, QueryTemplate};

pub mod memory;
pub mod postgres;

pub use memory::MemoryGraphStore;
pub use postgres::PgGraphStore;

/// Target of load jobs
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Apply `template` to every row of `chunk` in one transaction
    ///
    /// Returns the number of rows that changed the graph. Rows whose edge
    /// endpoints do not exist are skipped, not rejected.
    async fn execute(&self, template: &QueryTemplate, chunk: &RowChunk) -> Result<u64, StoreError>;
}

/// Which store a run loads into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "postgres" | "postgresql" => Ok(StoreKind::Postgres),
            other => Err(format!("unknown store '{}', expected memory or postgres", other)),
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Memory => f.write_str("memory"),
            StoreKind::Postgres => f.write_str("postgres"),
        }
    }
}

/// Open a store; `pool_size` should equal the worker count
pub async fn connect(
    kind: StoreKind,
    config: &StoreConfig,
    pool_size: u32,
) -> Result<Arc<dyn GraphStore>, StoreError> {
    match kind {
        StoreKind::Memory => Ok(Arc::new(MemoryGraphStore::new())),
        StoreKind::Postgres => Ok(Arc::new(PgGraphStore::connect(config, pool_size).await?)),
    }
}

/// Column positions a mutation reads from each row
#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Node {
        label: String,
        key: String,
        key_col: usize,
        props: Vec<(String, usize)>,
    },
    Edge {
        rel_type: String,
        from: (String, String, usize),
        to: (String, String, usize),
        props: Vec<(String, usize)>,
    },
    Statement {
        text: String,
        params: Vec<usize>,
    },
}

impl Binding {
    /// Resolve `mutation` against the chunk header
    pub(crate) fn resolve(mutation: &Mutation, chunk: &RowChunk) -> Result<Self, StoreError> {
        let col = |name: &Identifier| {
            chunk
                .column_index(name.as_str())
                .ok_or_else(|| StoreError::MissingColumn(name.to_string()))
        };

        match mutation {
            Mutation::MergeNode {
                label,
                key,
                properties,
            } => {
                let key_col = col(key)?;
                Ok(Binding::Node {
                    label: label.to_string(),
                    key: key.to_string(),
                    key_col,
                    props: property_columns(chunk, properties, &[key_col])?,
                })
            }
            Mutation::MergeEdge {
                rel_type,
                from,
                to,
                properties,
            } => {
                let from_col = col(&from.column)?;
                let to_col = col(&to.column)?;
                Ok(Binding::Edge {
                    rel_type: rel_type.to_string(),
                    from: (from.label.to_string(), from.key.to_string(), from_col),
                    to: (to.label.to_string(), to.key.to_string(), to_col),
                    props: property_columns(chunk, properties, &[from_col, to_col])?,
                })
            }
            Mutation::Statement { text, params } => Ok(Binding::Statement {
                text: text.clone(),
                params: params.iter().map(col).collect::<Result<_, _>>()?,
            }),
        }
    }
}

/// Named columns, or every column not in `skip` when none are named
fn property_columns(
    chunk: &RowChunk,
    named: &[Identifier],
    skip: &[usize],
) -> Result<Vec<(String, usize)>, StoreError> {
    if named.is_empty() {
        return Ok(chunk
            .columns()
            .iter()
            .enumerate()
            .filter(|(i, _)| !skip.contains(i))
            .map(|(i, c)| (c.clone(), i))
            .collect());
    }

    named
        .iter()
        .map(|name| {
            chunk
                .column_index(name.as_str())
                .map(|i| (name.to_string(), i))
                .ok_or_else(|| StoreError::MissingColumn(name.to_string()))
        })
        .collect()
}

/// JSON property map for one row; empty cells become `null`
pub(crate) fn row_properties(row: &[String], props: &[(String, usize)]) -> Map<String, Value> {
    props
        .iter()
        .map(|(name, i)| {
            let value = match row.get(*i).map(String::as_str) {
                None | Some("") => Value::Null,
                Some(cell) => Value::String(cell.to_string()),
            };
            (name.clone(), value)
        })
        .collect()
}

/// Bound parameter for one cell; empty cells bind as NULL
pub(crate) fn cell_param(row: &[String], i: usize) -> Option<String> {
    row.get(i).filter(|c| !c.is_empty()).cloned()
}
