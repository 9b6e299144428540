use crate::error::{Fault, FaultResult};
use crate::permissions::AccessContext;
use serde::{Deserialize, Serialize};

/// A document id with its position in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedId {
    pub index: usize,
    #[serde(rename = "_id")]
    pub id: String,
}

impl IndexedId {
    pub fn new<S: Into<String>>(index: usize, id: S) -> Self {
        Self { index, id: id.into() }
    }
}

/// Outcome of a batch mutation.
///
/// Indices refer to the original batch for creates and to candidate order
/// for patches and deletes.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub matched_count: usize,
    pub inserted_count: usize,
    pub modified_count: usize,
    pub deleted_count: usize,
    pub inserted_ids: Vec<IndexedId>,
    pub updated_ids: Vec<IndexedId>,
    pub deleted_ids: Vec<IndexedId>,
    pub write_errors: Vec<Fault>,
    #[serde(skip)]
    pub access_contexts: Vec<AccessContext>,
    pub has_more: bool,
    /// Set when the batch stopped early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_by: Option<Fault>,
}

impl MutationResult {
    /// Record a per-item fault. Returns true when the batch must stop, which
    /// happens once the error count reaches `max_errors`.
    pub(crate) fn record_error(&mut self, fault: Fault, halt_on_error: bool, max_errors: usize) -> bool {
        self.write_errors.push(fault.clone());
        if halt_on_error {
            self.halted_by = Some(fault);
        } else if self.write_errors.len() >= max_errors {
            log::warn!("halting batch after {} errors", self.write_errors.len());
            self.halted_by = Some(
                Fault::internal("tooManyErrors").with_reason("Too many errors. Check access control arguments."),
            );
        }
        self.halted_by.is_some()
    }

    pub fn is_halted(&self) -> bool {
        self.halted_by.is_some()
    }

    /// Every index reported as a success or a failure, sorted.
    pub fn reported_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .inserted_ids
            .iter()
            .chain(&self.updated_ids)
            .chain(&self.deleted_ids)
            .map(|id| id.index)
            .chain(self.write_errors.iter().filter_map(|fault| fault.index))
            .collect();
        indices.sort_unstable();
        indices
    }

    pub(crate) fn sort_by_index(&mut self) {
        self.inserted_ids.sort_by_key(|id| id.index);
        self.updated_ids.sort_by_key(|id| id.index);
        self.deleted_ids.sort_by_key(|id| id.index);
        self.write_errors.sort_by_key(|fault| fault.index);
        self.access_contexts.sort_by_key(|ac| ac.index());
    }

    /// Fold a sub-batch result in.
    pub(crate) fn merge(&mut self, other: MutationResult) {
        self.matched_count += other.matched_count;
        self.inserted_count += other.inserted_count;
        self.modified_count += other.modified_count;
        self.deleted_count += other.deleted_count;
        self.inserted_ids.extend(other.inserted_ids);
        self.updated_ids.extend(other.updated_ids);
        self.deleted_ids.extend(other.deleted_ids);
        self.write_errors.extend(other.write_errors);
        self.access_contexts.extend(other.access_contexts);
        self.has_more |= other.has_more;
        if self.halted_by.is_none() {
            self.halted_by = other.halted_by;
        }
    }

    /// Single-document wrappers fail with the first fault.
    pub(crate) fn into_single(self) -> FaultResult<Self> {
        if let Some(fault) = self.write_errors.first() {
            return Err(fault.clone());
        }
        match self.halted_by {
            Some(fault) => Err(fault),
            None => Ok(self),
        }
    }
}
