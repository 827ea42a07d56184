use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Map, Value as Json};
use tracing::debug;
use uuid::Uuid;

use super::{
    BulkEntry, BulkResponse, BulkResult, DocumentStore, RowsResponse, StoreResponse, StoreRow,
};
use crate::error::{OdmError, Result};

const ABORTED_REASON: &str = "another entry of the batch failed";

#[derive(Debug, Clone)]
struct StoredDocument {
    seq: u64,
    rev: String,
    body: Map<String, Json>,
    deleted: bool,
}

/// A bulk request as received by [`InMemoryDocumentStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedBatch {
    pub entries: Vec<BulkEntry>,
    pub all_or_nothing: bool,
}

impl SubmittedBatch {
    pub fn upserts(&self) -> impl Iterator<Item = &Json> {
        self.entries.iter().filter_map(|entry| match entry {
            BulkEntry::Upsert(body) => Some(body),
            BulkEntry::Delete { .. } => None,
        })
    }

    pub fn deletes(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|entry| match entry {
            BulkEntry::Delete { id, .. } => Some(id.as_str()),
            BulkEntry::Upsert(_) => None,
        })
    }
}

/// In-memory document database with CouchDB revision semantics.
///
/// Revisions are `N-<hex>` tokens where `N` counts the writes to the
/// document. Every submitted batch is logged for inspection, and the next
/// batch can be made to fail as a whole with [`fail_next_batch`](Self::fail_next_batch).
#[derive(Clone)]
pub struct InMemoryDocumentStore {
    docs: Arc<RwLock<BTreeMap<String, StoredDocument>>>,
    batches: Arc<RwLock<Vec<SubmittedBatch>>>,
    injected_failure: Arc<RwLock<Option<(u16, String)>>>,
    reads: Arc<AtomicUsize>,
    identifier_requests: Arc<AtomicUsize>,
    type_field: String,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_type_field("type")
    }

    /// Store whose `find_referencing` filters on `type_field`.
    pub fn with_type_field(type_field: impl Into<String>) -> Self {
        InMemoryDocumentStore {
            docs: Arc::new(RwLock::new(BTreeMap::new())),
            batches: Arc::new(RwLock::new(Vec::new())),
            injected_failure: Arc::new(RwLock::new(None)),
            reads: Arc::new(AtomicUsize::new(0)),
            identifier_requests: Arc::new(AtomicUsize::new(0)),
            type_field: type_field.into(),
        }
    }

    /// Write a document directly, bypassing revision checks. Returns the new revision.
    pub fn put_raw(&self, body: Json) -> Result<String> {
        let Json::Object(mut body) = body else {
            return Err(OdmError::InvalidDocument("document body is not an object".into()));
        };
        let id = match body.remove("_id") {
            Some(Json::String(id)) => id,
            _ => return Err(OdmError::InvalidDocument("document has no _id".into())),
        };
        body.remove("_rev");
        let mut docs = self
            .docs
            .write()
            .map_err(|_| OdmError::LockPoisoned("put_raw"))?;
        let seq = docs.get(&id).map_or(0, |doc| doc.seq) + 1;
        let rev = new_revision(seq);
        docs.insert(
            id,
            StoredDocument {
                seq,
                rev: rev.clone(),
                body,
                deleted: false,
            },
        );
        Ok(rev)
    }

    /// Current body of a live document, with `_id` and `_rev`.
    pub fn raw(&self, id: &str) -> Result<Option<Json>> {
        let docs = self.docs.read().map_err(|_| OdmError::LockPoisoned("raw"))?;
        Ok(docs
            .get(id)
            .filter(|doc| !doc.deleted)
            .map(|doc| render(id, doc, false)))
    }

    /// Every batch submitted so far, oldest first.
    pub fn batches(&self) -> Result<Vec<SubmittedBatch>> {
        let batches = self
            .batches
            .read()
            .map_err(|_| OdmError::LockPoisoned("batches"))?;
        Ok(batches.clone())
    }

    /// Make the next `submit_batch` fail with `status` and no per-entry results.
    pub fn fail_next_batch(&self, status: u16, reason: impl Into<String>) -> Result<()> {
        let mut failure = self
            .injected_failure
            .write()
            .map_err(|_| OdmError::LockPoisoned("fail_next_batch"))?;
        *failure = Some((status, reason.into()));
        Ok(())
    }

    /// Number of `find_one` calls served.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `generate_identifiers` calls served.
    pub fn identifier_requests(&self) -> usize {
        self.identifier_requests.load(Ordering::SeqCst)
    }

    /// Number of live documents.
    pub fn len(&self) -> Result<usize> {
        let docs = self.docs.read().map_err(|_| OdmError::LockPoisoned("len"))?;
        Ok(docs.values().filter(|doc| !doc.deleted).count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn row(docs: &BTreeMap<String, StoredDocument>, id: &str) -> StoreRow {
        StoreRow {
            id: id.to_string(),
            doc: docs
                .get(id)
                .filter(|doc| !doc.deleted)
                .map(|doc| render(id, doc, true)),
        }
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn find_one(&self, id: &str) -> Result<StoreResponse> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let docs = self
            .docs
            .read()
            .map_err(|_| OdmError::LockPoisoned("find_one"))?;
        Ok(match docs.get(id) {
            Some(doc) if doc.deleted => StoreResponse::not_found("deleted"),
            Some(doc) => StoreResponse::ok(render(id, doc, true)),
            None => StoreResponse::not_found("missing"),
        })
    }

    fn find_many(
        &self,
        ids: &[String],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<RowsResponse> {
        let docs = self
            .docs
            .read()
            .map_err(|_| OdmError::LockPoisoned("find_many"))?;
        let rows = ids
            .iter()
            .skip(offset.unwrap_or(0))
            .take(limit.unwrap_or(usize::MAX))
            .map(|id| Self::row(&docs, id))
            .collect();
        Ok(RowsResponse { status: 200, rows })
    }

    fn submit_batch(&self, entries: &[BulkEntry], all_or_nothing: bool) -> Result<BulkResponse> {
        {
            let mut batches = self
                .batches
                .write()
                .map_err(|_| OdmError::LockPoisoned("batch log"))?;
            batches.push(SubmittedBatch {
                entries: entries.to_vec(),
                all_or_nothing,
            });
        }

        let failure = self
            .injected_failure
            .write()
            .map_err(|_| OdmError::LockPoisoned("fail_next_batch"))?
            .take();
        if let Some((status, reason)) = failure {
            debug!(status, %reason, "rejecting batch");
            return Ok(BulkResponse {
                status,
                results: Vec::new(),
            });
        }

        let mut docs = self
            .docs
            .write()
            .map_err(|_| OdmError::LockPoisoned("submit_batch"))?;
        let mut working = docs.clone();
        let results: Vec<BulkResult> = entries
            .iter()
            .map(|entry| apply(&mut working, entry))
            .collect();

        let failed = results.iter().any(|result| !result.is_ok());
        if all_or_nothing && failed {
            debug!(entries = entries.len(), "all-or-nothing batch aborted");
            let results = results
                .into_iter()
                .map(|result| match result.error {
                    Some(_) => result,
                    None => BulkResult::failed(result.id, "aborted", ABORTED_REASON),
                })
                .collect();
            return Ok(BulkResponse {
                status: 417,
                results,
            });
        }

        *docs = working;
        debug!(entries = entries.len(), failed, "batch applied");
        Ok(BulkResponse {
            status: 201,
            results,
        })
    }

    fn generate_identifiers(&self, count: usize) -> Result<Vec<String>> {
        self.identifier_requests.fetch_add(1, Ordering::SeqCst);
        Ok((0..count)
            .map(|_| Uuid::new_v4().simple().to_string())
            .collect())
    }

    fn find_referencing(&self, class: &str, field: &str, id: &str) -> Result<RowsResponse> {
        let docs = self
            .docs
            .read()
            .map_err(|_| OdmError::LockPoisoned("find_referencing"))?;
        let rows = docs
            .iter()
            .filter(|(_, doc)| !doc.deleted)
            .filter(|(_, doc)| {
                doc.body.get(&self.type_field).and_then(Json::as_str) == Some(class)
                    && doc.body.get(field).and_then(Json::as_str) == Some(id)
            })
            .map(|(doc_id, doc)| StoreRow {
                id: doc_id.clone(),
                doc: Some(render(doc_id, doc, true)),
            })
            .collect();
        Ok(RowsResponse { status: 200, rows })
    }
}

fn new_revision(seq: u64) -> String {
    format!("{seq}-{}", Uuid::new_v4().simple())
}

/// Document body as served to clients. Inline attachments become stubs.
fn render(id: &str, doc: &StoredDocument, stub_attachments: bool) -> Json {
    let mut body = doc.body.clone();
    if stub_attachments {
        if let Some(Json::Object(attachments)) = body.get_mut("_attachments") {
            for attachment in attachments.values_mut() {
                *attachment = stub(attachment, doc.seq);
            }
        }
    }
    body.insert("_id".into(), Json::String(id.to_string()));
    body.insert("_rev".into(), Json::String(doc.rev.clone()));
    Json::Object(body)
}

fn stub(attachment: &Json, seq: u64) -> Json {
    if attachment.get("stub").and_then(Json::as_bool) == Some(true) {
        return attachment.clone();
    }
    let length = attachment
        .get("data")
        .and_then(Json::as_str)
        .map_or(0, |data| (data.len() / 4 * 3).saturating_sub(data.matches('=').count()));
    json!({
        "stub": true,
        "content_type": attachment.get("content_type").cloned().unwrap_or(Json::Null),
        "length": length,
        "revpos": seq,
    })
}

fn apply(docs: &mut BTreeMap<String, StoredDocument>, entry: &BulkEntry) -> BulkResult {
    match entry {
        BulkEntry::Upsert(body) => {
            let Json::Object(body) = body else {
                return BulkResult::failed("", "bad_request", "document body is not an object");
            };
            let Some(id) = body.get("_id").and_then(Json::as_str).map(str::to_string) else {
                return BulkResult::failed("", "bad_request", "document has no _id");
            };
            let rev = body.get("_rev").and_then(Json::as_str);
            let existing = docs.get(&id);

            let accepted = match (existing, rev) {
                (None, None) => true,
                (None, Some(_)) => false,
                (Some(doc), None) => doc.deleted,
                (Some(doc), Some(rev)) => doc.rev == rev,
            };
            if !accepted {
                return BulkResult::failed(id, "conflict", "Document update conflict.");
            }

            let seq = existing.map_or(0, |doc| doc.seq) + 1;
            let mut stored = body.clone();
            stored.remove("_id");
            stored.remove("_rev");
            if let (Some(Json::Object(incoming)), Some(previous)) = (
                stored.get_mut("_attachments"),
                existing.and_then(|doc| doc.body.get("_attachments")),
            ) {
                for (name, attachment) in incoming.iter_mut() {
                    let is_stub = attachment.get("stub").and_then(Json::as_bool) == Some(true);
                    if let (true, Some(kept)) = (is_stub, previous.get(name)) {
                        *attachment = kept.clone();
                    }
                }
            }

            let rev = new_revision(seq);
            docs.insert(
                id.clone(),
                StoredDocument {
                    seq,
                    rev: rev.clone(),
                    body: stored,
                    deleted: false,
                },
            );
            BulkResult::ok(id, rev)
        }
        BulkEntry::Delete { id, rev } => match docs.get_mut(id) {
            Some(doc) if !doc.deleted && doc.rev == *rev => {
                doc.seq += 1;
                doc.rev = new_revision(doc.seq);
                doc.deleted = true;
                doc.body.clear();
                BulkResult::ok(id.clone(), doc.rev.clone())
            }
            Some(doc) if !doc.deleted => {
                BulkResult::failed(id.clone(), "conflict", "Document update conflict.")
            }
            _ => BulkResult::failed(id.clone(), "not_found", "deleted"),
        },
    }
}
