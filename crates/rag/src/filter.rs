use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

/// Payload fields that can be filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadField {
    DocId,
    DocName,
    ChunkId,
}

impl PayloadField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadField::DocId => "doc_id",
            PayloadField::DocName => "doc_name",
            PayloadField::ChunkId => "chunk_id",
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for PayloadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Exact string equality.
    Match(String),
}

/// A validated payload filter. Construct with [`Filter::new`] or the
/// shorthands; an empty match value is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    field: PayloadField,
    condition: Condition,
}

impl Filter {
    pub fn new(field: PayloadField, condition: Condition) -> Result<Self, IndexError> {
        match &condition {
            Condition::Match(value) if value.trim().is_empty() => {
                return Err(IndexError::InvalidFilter(format!(
                    "empty match value for field '{field}'"
                )))
            }
            Condition::Match(_) => {}
        }
        Ok(Self { field, condition })
    }

    pub fn doc_id(doc_id: &str) -> Result<Self, IndexError> {
        Self::new(PayloadField::DocId, Condition::Match(doc_id.to_string()))
    }

    pub fn field(&self) -> PayloadField {
        self.field
    }

    pub(crate) fn match_value(&self) -> &str {
        match &self.condition {
            Condition::Match(value) => value,
        }
    }
}
