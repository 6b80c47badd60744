//! In-process property graph
//!
//! Used for dry runs and tests. Nodes are keyed by `(label, key, value)`,
//! edges by relationship type and both endpoints, so reloading the same rows
//! leaves the graph unchanged.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{row_properties, Binding, GraphStore};
use crate::error::StoreError;
use crate::stager::RowChunk;
use crate::template::QueryTemplate;

/// Identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub label: String,
    pub key: String,
    pub value: String,
}

impl NodeKey {
    pub fn new(label: &str, key: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Identity of an edge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub rel_type: String,
    pub from: NodeKey,
    pub to: NodeKey,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: HashMap<NodeKey, Map<String, Value>>,
    edges: HashMap<EdgeKey, Map<String, Value>>,
}

enum Change {
    Node(NodeKey, Map<String, Value>),
    Edge(EdgeKey, Map<String, Value>),
}

/// Property graph held in memory
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: Mutex<Graph>,
    poison: Option<String>,
    latency: Option<Duration>,
    chunks: AtomicUsize,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any chunk containing a cell equal to `value`
    pub fn failing_on(mut self, value: impl Into<String>) -> Self {
        self.poison = Some(value.into());
        self
    }

    /// Delay every chunk by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_count(&self) -> usize {
        self.graph().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph().edges.len()
    }

    pub fn node(&self, key: &NodeKey) -> Option<Map<String, Value>> {
        self.graph().nodes.get(key).cloned()
    }

    pub fn has_edge(&self, rel_type: &str, from: &NodeKey, to: &NodeKey) -> bool {
        self.graph().edges.contains_key(&EdgeKey {
            rel_type: rel_type.to_string(),
            from: from.clone(),
            to: to.clone(),
        })
    }

    /// Chunks committed so far
    pub fn committed_chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    fn plan(&self, binding: &Binding, chunk: &RowChunk) -> Result<Vec<Change>, StoreError> {
        let mut changes = Vec::with_capacity(chunk.len());
        for (i, row) in chunk.rows().iter().enumerate() {
            if let Some(poison) = &self.poison {
                if row.iter().any(|cell| cell == poison) {
                    return Err(StoreError::Rejected(format!(
                        "row {} contains rejected value '{}'",
                        i, poison
                    )));
                }
            }

            let cell = |col: usize| row.get(col).map(String::as_str).unwrap_or_default();
            match binding {
                Binding::Node {
                    label,
                    key,
                    key_col,
                    props,
                } => {
                    let value = cell(*key_col);
                    if value.is_empty() {
                        return Err(StoreError::Rejected(format!("row {} has an empty '{}' key", i, key)));
                    }
                    changes.push(Change::Node(
                        NodeKey::new(label, key, value),
                        row_properties(row, props),
                    ));
                }
                Binding::Edge {
                    rel_type,
                    from,
                    to,
                    props,
                } => changes.push(Change::Edge(
                    EdgeKey {
                        rel_type: rel_type.clone(),
                        from: NodeKey::new(&from.0, &from.1, cell(from.2)),
                        to: NodeKey::new(&to.0, &to.1, cell(to.2)),
                    },
                    row_properties(row, props),
                )),
                Binding::Statement { .. } => {
                    return Err(StoreError::Rejected(
                        "statement templates require a SQL store".to_string(),
                    ))
                }
            }
        }
        Ok(changes)
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, template: &QueryTemplate, chunk: &RowChunk) -> Result<u64, StoreError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let binding = Binding::resolve(template.mutation(), chunk)?;
        let changes = self.plan(&binding, chunk)?;

        let mut graph = self.graph();
        let mut applied = 0u64;
        for change in changes {
            match change {
                Change::Node(key, props) => {
                    graph.nodes.entry(key).or_default().extend(props);
                    applied += 1;
                }
                Change::Edge(key, props) => {
                    // MATCH semantics: both endpoints must already exist
                    if graph.nodes.contains_key(&key.from) && graph.nodes.contains_key(&key.to) {
                        graph.edges.entry(key).or_default().extend(props);
                        applied += 1;
                    }
                }
            }
        }
        drop(graph);

        self.chunks.fetch_add(1, Ordering::SeqCst);
        Ok(applied)
    }
}
