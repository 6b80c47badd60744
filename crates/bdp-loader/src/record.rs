//! Records, schemas and batch groups
//!
//! Records keep their source key order; a JSON object's keys are taken in the
//! order they appear on the line. Staged cells carry no type: `Null` and an
//! empty `Text` are both written as an empty cell, and stores bind an empty
//! cell as null.

use serde_json::Value;
use std::sync::Arc;

/// A single field value: a scalar or a flat array of scalars
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    /// Text written to a staged file cell
    ///
    /// Scalars use their plain textual form; lists are written as JSON arrays
    /// so elements containing delimiters survive a round trip.
    pub fn to_cell(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(_) => self.to_json().to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => Value::from(*f),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
        }
    }

    /// Convert a JSON value; objects and nested arrays are rejected
    pub fn from_json(value: Value) -> Result<Self, String> {
        Self::from_json_at(value, 0)
    }

    fn from_json_at(value: Value, depth: usize) -> Result<Self, String> {
        match value {
            Value::Null => Ok(FieldValue::Null),
            Value::Bool(b) => Ok(FieldValue::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(FieldValue::Int(i)),
                None => n
                    .as_f64()
                    .map(FieldValue::Float)
                    .ok_or_else(|| format!("number {} is out of range", n)),
            },
            Value::String(s) => Ok(FieldValue::Text(s)),
            Value::Array(_) if depth > 0 => Err("nested arrays are not supported".to_string()),
            Value::Array(items) => items
                .into_iter()
                .map(|item| Self::from_json_at(item, depth + 1))
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::List),
            Value::Object(_) => Err("nested objects are not supported".to_string()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value.into())
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(values: Vec<T>) -> Self {
        FieldValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Ordered mapping of field name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a field; an existing key keeps its position and takes the new value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &FieldValue> {
        self.fields.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Build a record from a JSON object, in the order the map yields its keys
    pub fn from_json(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("expected a JSON object, found {}", json_kind(&value)));
        };

        let mut record = Record::new();
        for (key, value) in map {
            let field = FieldValue::from_json(value).map_err(|e| format!("field '{}': {}", key, e))?;
            record.fields.push((key, field));
        }
        Ok(record)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The ordered column set shared by every record of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Arc<[String]>,
}

impl Schema {
    /// Fix the schema from a stream's first record
    pub fn of(record: &Record) -> Self {
        Self {
            columns: record.keys().map(str::to_string).collect(),
        }
    }

    pub fn from_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Same keys in the same order
    pub fn matches(&self, record: &Record) -> bool {
        record.len() == self.columns.len() && record.keys().zip(self.columns.iter()).all(|(k, c)| k == c)
    }
}

/// One producer-emitted bundle: stream `i` belongs to template `i`
#[derive(Debug, Clone, Default)]
pub struct BatchGroup {
    streams: Vec<Vec<Record>>,
}

impl BatchGroup {
    pub fn new(streams: Vec<Vec<Record>>) -> Self {
        Self { streams }
    }

    pub fn streams(&self) -> &[Vec<Record>] {
        &self.streams
    }

    pub fn into_streams(self) -> Vec<Vec<Record>> {
        self.streams
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn record_count(&self) -> usize {
        self.streams.iter().map(Vec::len).sum()
    }
}
