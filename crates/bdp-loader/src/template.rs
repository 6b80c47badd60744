//! Query template descriptors
//!
//! A template names an idempotent, key-based upsert. Everything that ends up
//! as an identifier on the store side (labels, relationship types, key and
//! property names) is an [`Identifier`] checked against an allow-list pattern
//! when the template is built. Row values are never spliced into statement
//! text; stores bind them as parameters.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use crate::error::{SchemaMismatchError, TemplateError};
use crate::record::Schema;

/// Default staged file name; every placeholder is required for uniqueness
pub const DEFAULT_FILE_PATTERN: &str = "{subtype}_{template}_{sequence}.csv";

#[allow(clippy::expect_used)]
static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("literal pattern"));

#[allow(clippy::expect_used)]
static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("literal pattern"));

/// An allow-listed store identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Result<Self, TemplateError> {
        let value = value.into();
        if IDENTIFIER_PATTERN.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(TemplateError::InvalidIdentifier(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identifier {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identifier::new(value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Endpoint of an edge: the node with `label` whose `key` equals the row's `column`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub label: Identifier,
    pub key: Identifier,
    pub column: Identifier,
}

/// The upsert a template performs for every row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mutation {
    /// Create-or-update the node `label` keyed by column `key`.
    /// An empty `properties` list sets every other column.
    MergeNode {
        label: Identifier,
        key: Identifier,
        #[serde(default)]
        properties: Vec<Identifier>,
    },
    /// Create-or-update a relationship between two existing nodes
    MergeEdge {
        rel_type: Identifier,
        from: NodeRef,
        to: NodeRef,
        #[serde(default)]
        properties: Vec<Identifier>,
    },
    /// Trusted statement text with positional placeholders `$1..$n`,
    /// bound from `params` columns in order
    Statement { text: String, params: Vec<Identifier> },
}

impl Mutation {
    pub fn merge_node(label: &str, key: &str) -> Result<Self, TemplateError> {
        Ok(Mutation::MergeNode {
            label: Identifier::new(label)?,
            key: Identifier::new(key)?,
            properties: Vec::new(),
        })
    }

    /// `from`/`to` are `(label, key, column)` triples
    pub fn merge_edge(
        rel_type: &str,
        from: (&str, &str, &str),
        to: (&str, &str, &str),
    ) -> Result<Self, TemplateError> {
        let node_ref = |(label, key, column): (&str, &str, &str)| -> Result<NodeRef, TemplateError> {
            Ok(NodeRef {
                label: Identifier::new(label)?,
                key: Identifier::new(key)?,
                column: Identifier::new(column)?,
            })
        };

        Ok(Mutation::MergeEdge {
            rel_type: Identifier::new(rel_type)?,
            from: node_ref(from)?,
            to: node_ref(to)?,
            properties: Vec::new(),
        })
    }

    /// Short name used in logs and listings
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::MergeNode { .. } => "merge_node",
            Mutation::MergeEdge { .. } => "merge_edge",
            Mutation::Statement { .. } => "statement",
        }
    }

    /// Columns a staged stream must carry for this mutation
    pub fn required_columns(&self) -> Vec<&str> {
        match self {
            Mutation::MergeNode { key, properties, .. } => std::iter::once(key)
                .chain(properties.iter())
                .map(Identifier::as_str)
                .collect(),
            Mutation::MergeEdge {
                from, to, properties, ..
            } => [&from.column, &to.column]
                .into_iter()
                .chain(properties.iter())
                .map(Identifier::as_str)
                .collect(),
            Mutation::Statement { params, .. } => params.iter().map(Identifier::as_str).collect(),
        }
    }
}

/// A parameterized bulk mutation with its commit size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    id: Identifier,
    commit_size: usize,
    file_pattern: String,
    mutation: Mutation,
}

impl QueryTemplate {
    pub fn new(id: &str, commit_size: usize, mutation: Mutation) -> Result<Self, TemplateError> {
        let id = Identifier::new(id)?;
        if commit_size == 0 {
            return Err(TemplateError::ZeroCommitSize(id.0));
        }

        if let Mutation::Statement { text, params } = &mutation {
            let highest = PLACEHOLDER_PATTERN
                .captures_iter(text)
                .filter_map(|c| c[1].parse::<usize>().ok())
                .max()
                .unwrap_or(0);
            if highest > params.len() {
                return Err(TemplateError::StatementArity {
                    id: id.0,
                    placeholder: highest,
                    params: params.len(),
                });
            }
        }

        Ok(Self {
            id,
            commit_size,
            file_pattern: DEFAULT_FILE_PATTERN.to_string(),
            mutation,
        })
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Result<Self, TemplateError> {
        let pattern = pattern.into();
        let complete = ["{subtype}", "{template}", "{sequence}"]
            .iter()
            .all(|p| pattern.contains(p));
        if !complete || pattern.contains('/') || pattern.contains('\\') {
            return Err(TemplateError::FilePattern {
                id: self.id.0,
                pattern,
            });
        }
        self.file_pattern = pattern;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        self.id.as_str()
    }

    pub fn commit_size(&self) -> usize {
        self.commit_size
    }

    pub fn file_pattern(&self) -> &str {
        &self.file_pattern
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }

    /// File name for one staged stream
    pub fn staged_file_name(&self, subtype: &str, sequence_no: u64) -> String {
        self.file_pattern
            .replace("{subtype}", &sanitize_subtype(subtype))
            .replace("{template}", self.id.as_str())
            .replace("{sequence}", &format!("{:08}", sequence_no))
    }

    /// Fail when the stream schema lacks a column the mutation binds
    pub fn check_columns(&self, schema: &Schema) -> Result<(), SchemaMismatchError> {
        let missing: Vec<String> = self
            .mutation
            .required_columns()
            .into_iter()
            .filter(|c| schema.position(c).is_none())
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaMismatchError::MissingColumns {
                template: self.id.0.clone(),
                missing,
            })
        }
    }
}

fn sanitize_subtype(subtype: &str) -> String {
    subtype
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// On-disk form of a template
#[derive(Debug, Deserialize)]
struct TemplateSpec {
    id: String,
    commit_size: usize,
    #[serde(default)]
    file_pattern: Option<String>,
    mutation: Mutation,
}

/// Load and validate a JSON template manifest
pub fn load_templates(path: impl AsRef<Path>) -> Result<Vec<Arc<QueryTemplate>>, TemplateError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let specs: Vec<TemplateSpec> = serde_json::from_str(&raw).map_err(|source| TemplateError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut seen = HashSet::new();
    let mut templates = Vec::with_capacity(specs.len());
    for spec in specs {
        if !seen.insert(spec.id.clone()) {
            return Err(TemplateError::Duplicate(spec.id));
        }
        let mut template = QueryTemplate::new(&spec.id, spec.commit_size, spec.mutation)?;
        if let Some(pattern) = spec.file_pattern {
            template = template.with_file_pattern(pattern)?;
        }
        templates.push(Arc::new(template));
    }

    Ok(templates)
}
