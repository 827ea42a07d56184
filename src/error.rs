use std::fmt;

use crate::unit_of_work::{DocHandle, DocumentState};

/// The operation a cascade walk applies across an object graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Remove,
    Refresh,
    Merge,
    Detach,
}

impl fmt::Display for CascadeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CascadeOp::Persist => "persist",
            CascadeOp::Remove => "remove",
            CascadeOp::Refresh => "refresh",
            CascadeOp::Merge => "merge",
            CascadeOp::Detach => "detach",
        };
        f.write_str(name)
    }
}

/// A document whose batch entry was rejected by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedDocument {
    pub handle: DocHandle,
    pub id: String,
    /// Store error code, e.g. `"conflict"`.
    pub error: String,
    pub reason: Option<String>,
    /// `true` when the rejected entry was a deletion.
    pub deletion: bool,
}

/// Errors raised by the object-document mapper.
#[derive(Debug, thiserror::Error)]
pub enum OdmError {
    // ------------------------------------------------------------------
    // Mapping
    // ------------------------------------------------------------------
    #[error("unknown field type: {0}")]
    UnknownType(String),

    #[error("field type {0} is already registered; use override_type to replace it")]
    DuplicateType(String),

    #[error("class {0} is not mapped")]
    ClassNotMapped(String),

    #[error("field {field} is mapped twice on {class}")]
    DuplicateFieldMapping { class: String, field: String },

    #[error("invalid mapping for {class}: {reason}")]
    InvalidMapping { class: String, reason: String },

    #[error("{class} has no field named {field}")]
    UnknownField { class: String, field: String },

    // ------------------------------------------------------------------
    // Identifiers
    // ------------------------------------------------------------------
    #[error("{class} uses assigned identifiers but none was set before persist")]
    MissingAssignedIdentifier { class: String },

    #[error("identifier {id} is already managed by another object")]
    IdentifierCollision { id: String },

    // ------------------------------------------------------------------
    // Cascades
    // ------------------------------------------------------------------
    #[error(
        "a new {target} was found through {class}::{field}, which does not cascade persist; \
         persist it explicitly or enable cascade persist on the association"
    )]
    UncascadedNewObject {
        class: String,
        field: String,
        target: String,
    },

    #[error("cannot {operation} a document in state {state:?}")]
    InvalidCascadeState {
        operation: CascadeOp,
        state: DocumentState,
    },

    #[error("removed document found through {class}::{field} during flush")]
    RemovedDocumentReferenced { class: String, field: String },

    #[error("detached document passed to {operation}")]
    DetachedDocument { operation: CascadeOp },

    // ------------------------------------------------------------------
    // Embedded documents
    // ------------------------------------------------------------------
    #[error("embedded document in {field} has neither a target class nor a type discriminator")]
    AmbiguousEmbeddedType { field: String },

    // ------------------------------------------------------------------
    // Store interaction
    // ------------------------------------------------------------------
    #[error("document {id} not found")]
    DocumentNotFound { id: String },

    #[error("{} document(s) failed to write: {}", .documents.len(), conflict_ids(.documents))]
    UpdateConflict { documents: Vec<ConflictedDocument> },

    #[error("revision mismatch for {id} (managed {managed:?}, merged {merged:?})")]
    RevisionMismatch {
        id: String,
        managed: Option<String>,
        merged: Option<String>,
    },

    #[error("store request failed with status {status}: {reason}")]
    Transport { status: u16, reason: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),

    // ------------------------------------------------------------------
    // Handles and typed access
    // ------------------------------------------------------------------
    #[error("unknown document handle {0:?}")]
    UnknownHandle(DocHandle),

    #[error("document is not a {expected}")]
    TypeMismatch { expected: &'static str },

    #[error("document {0:?} is currently lent to a lifecycle listener")]
    DocumentBorrowed(DocHandle),

    #[error("document {0:?} is still managed; detach it before forgetting it")]
    StillManaged(DocHandle),

    #[error("cannot convert {value} into {target}")]
    FieldConversion { value: String, target: &'static str },
}

impl OdmError {
    /// Documents rejected by the last flush, if this is an update conflict.
    pub fn conflicts(&self) -> &[ConflictedDocument] {
        match self {
            OdmError::UpdateConflict { documents } => documents,
            _ => &[],
        }
    }
}

fn conflict_ids(documents: &[ConflictedDocument]) -> String {
    documents
        .iter()
        .map(|doc| doc.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, OdmError>;
