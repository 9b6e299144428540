//! Fault taxonomy shared by every object-data operation.
//!
//! Faults are identified by a `category.subcategory` code such as
//! `invalidArgument.instanceRetyping`. Batch operations attach the index of the
//! offending item (and the document id where one exists) so callers can map a
//! write error back to its input.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level fault category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultCategory {
    InvalidArgument,
    AccessDenied,
    NotFound,
    Conflict,
    UnsupportedOperation,
    /// Internal or collaborator failure.
    Error,
}

impl FaultCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalidArgument",
            Self::AccessDenied => "accessDenied",
            Self::NotFound => "notFound",
            Self::Conflict => "conflict",
            Self::UnsupportedOperation => "unsupportedOperation",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A categorized failure, optionally tagged with its batch position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{category}.{subcategory}{}", describe(.reason, .path))]
pub struct Fault {
    pub category: FaultCategory,
    pub subcategory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

fn describe(reason: &Option<String>, path: &Option<String>) -> String {
    match (reason, path) {
        (Some(reason), Some(path)) => format!(": {} ({})", reason, path),
        (Some(reason), None) => format!(": {}", reason),
        (None, Some(path)) => format!(" ({})", path),
        (None, None) => String::new(),
    }
}

/// Result alias used throughout the crate.
pub type FaultResult<T> = Result<T, Fault>;

impl Fault {
    pub fn new<S: Into<String>>(category: FaultCategory, subcategory: S) -> Self {
        Self {
            category,
            subcategory: subcategory.into(),
            reason: None,
            path: None,
            index: None,
            document_id: None,
        }
    }

    pub fn invalid_argument<S: Into<String>>(subcategory: S) -> Self {
        Self::new(FaultCategory::InvalidArgument, subcategory)
    }

    pub fn access_denied<S: Into<String>>(subcategory: S) -> Self {
        Self::new(FaultCategory::AccessDenied, subcategory)
    }

    pub fn not_found<S: Into<String>>(subcategory: S) -> Self {
        Self::new(FaultCategory::NotFound, subcategory)
    }

    pub fn conflict<S: Into<String>>(subcategory: S) -> Self {
        Self::new(FaultCategory::Conflict, subcategory)
    }

    pub fn unsupported<S: Into<String>>(subcategory: S) -> Self {
        Self::new(FaultCategory::UnsupportedOperation, subcategory)
    }

    pub fn internal<S: Into<String>>(subcategory: S) -> Self {
        Self::new(FaultCategory::Error, subcategory)
    }

    /// Optimistic concurrency failure raised by a sequence-guarded save.
    pub fn sequencing() -> Self {
        Self::conflict("sequencing")
    }

    #[must_use]
    pub fn with_reason<S: Into<String>>(mut self, reason: S) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn at_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    #[must_use]
    pub fn for_document<S: Into<String>>(mut self, id: S) -> Self {
        self.document_id = Some(id.into());
        self
    }

    /// The `category.subcategory` code.
    pub fn code(&self) -> String {
        format!("{}.{}", self.category, self.subcategory)
    }

    pub fn is(&self, category: FaultCategory, subcategory: &str) -> bool {
        self.category == category && self.subcategory == subcategory
    }

    pub fn is_sequencing_conflict(&self) -> bool {
        self.is(FaultCategory::Conflict, "sequencing")
    }
}

impl From<serde_json::Error> for Fault {
    fn from(error: serde_json::Error) -> Self {
        Self::invalid_argument("unspecified").with_reason(error.to_string())
    }
}
