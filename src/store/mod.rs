//! Store - The document database seen by the unit of work.
//!
//! [`DocumentStore`] is the seam to the transport layer. Responses carry the
//! store's HTTP-like status codes: `404` for missing or deleted documents,
//! per-entry results for bulk writes and `>= 400` with no results for a
//! request that failed as a whole.
//!
//! ## Example
//!
//! ```ignore
//! let store = Arc::new(InMemoryDocumentStore::new());
//! let response = store.submit_batch(&[BulkEntry::Upsert(json!({"_id": "u1"}))], false)?;
//! assert!(response.results[0].is_ok());
//! ```

mod in_memory;

use serde_json::{json, Value as Json};

use crate::error::{OdmError, Result};

pub use in_memory::{InMemoryDocumentStore, SubmittedBatch};

/// Response to a single-document read.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResponse {
    pub status: u16,
    pub body: Json,
}

impl StoreResponse {
    pub fn ok(body: Json) -> Self {
        Self { status: 200, body }
    }

    pub fn not_found(reason: &str) -> Self {
        Self {
            status: 404,
            body: json!({"error": "not_found", "reason": reason}),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Error reason reported by the store, if any.
    pub fn reason(&self) -> String {
        self.body
            .get("reason")
            .or_else(|| self.body.get("error"))
            .and_then(Json::as_str)
            .unwrap_or("unknown error")
            .to_string()
    }
}

/// One row of a multi-document read. `doc` is `None` for missing documents.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    pub id: String,
    pub doc: Option<Json>,
}

/// Response to a multi-document read.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsResponse {
    pub status: u16,
    pub rows: Vec<StoreRow>,
}

/// One entry of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkEntry {
    /// Full document body, including `_id` and `_rev` when updating.
    Upsert(Json),
    Delete { id: String, rev: String },
}

impl BulkEntry {
    pub fn id(&self) -> Option<&str> {
        match self {
            BulkEntry::Upsert(body) => body.get("_id").and_then(Json::as_str),
            BulkEntry::Delete { id, .. } => Some(id),
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, BulkEntry::Delete { .. })
    }

    /// Wire form of the entry inside a bulk request.
    pub fn to_json(&self) -> Json {
        match self {
            BulkEntry::Upsert(body) => body.clone(),
            BulkEntry::Delete { id, rev } => json!({"_id": id, "_rev": rev, "_deleted": true}),
        }
    }
}

/// Per-entry outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkResult {
    pub id: String,
    pub rev: Option<String>,
    pub error: Option<String>,
    pub reason: Option<String>,
}

impl BulkResult {
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            error: None,
            reason: None,
        }
    }

    pub fn failed(
        id: impl Into<String>,
        error: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            rev: None,
            error: Some(error.into()),
            reason: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Response to a bulk write. `results` are in entry order.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkResponse {
    pub status: u16,
    pub results: Vec<BulkResult>,
}

/// Client of the document database.
pub trait DocumentStore {
    /// Read one document. Missing and deleted documents answer `404`.
    fn find_one(&self, id: &str) -> Result<StoreResponse>;

    /// Read several documents in one round-trip, in `ids` order.
    fn find_many(
        &self,
        ids: &[String],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<RowsResponse>;

    /// Apply a batch of writes. With `all_or_nothing` the store applies
    /// every entry or none of them.
    fn submit_batch(&self, entries: &[BulkEntry], all_or_nothing: bool) -> Result<BulkResponse>;

    /// Fresh document identifiers.
    fn generate_identifiers(&self, count: usize) -> Result<Vec<String>>;

    /// Documents of `class` whose stored `field` holds `id`. Backs inverse
    /// to-many associations.
    fn find_referencing(&self, class: &str, field: &str, id: &str) -> Result<RowsResponse> {
        let _ = (class, field, id);
        Err(OdmError::Unsupported("find_referencing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_entries_use_the_deleted_marker() {
        let entry = BulkEntry::Delete {
            id: "a".into(),
            rev: "1-x".into(),
        };
        assert_eq!(entry.id(), Some("a"));
        assert_eq!(entry.to_json(), json!({"_id": "a", "_rev": "1-x", "_deleted": true}));
    }

    #[test]
    fn responses_expose_reason() {
        let missing = StoreResponse::not_found("deleted");
        assert!(missing.is_not_found());
        assert!(!missing.is_success());
        assert_eq!(missing.reason(), "deleted");
    }
}
