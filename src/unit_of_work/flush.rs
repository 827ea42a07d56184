use std::collections::BTreeSet;
use std::mem;

use serde_json::{json, Map, Value as Json};
use tracing::{debug, info, instrument, warn};

use super::hydrate::{CleanState, HydrationHints};
use super::{DocHandle, DocumentState, UnitOfWork};
use crate::attachment::attachments_to_json;
use crate::collection::PendingLoad;
use crate::error::{ConflictedDocument, OdmError, Result};
use crate::hooks::{ConflictEventArgs, ConflictResolution, LifecycleEvent};
use crate::metadata::AssociationAccess;
use crate::store::{BulkEntry, BulkResult};

impl UnitOfWork {
    /// Write every pending change in a single bulk request.
    ///
    /// Entries the store rejects are returned as [`OdmError::UpdateConflict`]
    /// after every other entry has been processed; the accepted ones stay
    /// written. A request rejected as a whole, or answered for only part of
    /// its entries, leaves the session untouched so the flush can be retried.
    #[instrument(skip(self), fields(managed = self.identity_map.len()))]
    pub fn flush(&mut self) -> Result<()> {
        self.fire(LifecycleEvent::PreFlush, None)?;
        self.compute_change_sets()?;
        self.fire(LifecycleEvent::OnFlush, None)?;

        let mut entries = Vec::new();
        let mut handles = Vec::new();
        let mut clean_states = Vec::new();
        for handle in self.scheduled_removals.clone() {
            let (id, rev) = self.deletion_target(handle)?;
            entries.push(BulkEntry::Delete { id, rev });
            handles.push(handle);
            clean_states.push(None);
        }
        let upserts: BTreeSet<DocHandle> = self
            .scheduled_inserts
            .union(&self.scheduled_updates)
            .copied()
            .collect();
        for handle in upserts {
            if self.identity_map.slot(handle)?.revision.is_some() {
                self.fire(LifecycleEvent::PreUpdate, Some(handle))?;
            }
            let body = self.document_body(handle)?;
            clean_states.push(Some(self.clean_state(handle)?));
            entries.push(BulkEntry::Upsert(body));
            handles.push(handle);
        }

        let mut conflicts = Vec::new();
        if !entries.is_empty() {
            let response = self
                .store
                .submit_batch(&entries, self.config.all_or_nothing_flush)?;
            if response.status >= 400 && response.results.is_empty() {
                return Err(OdmError::Transport {
                    status: response.status,
                    reason: "bulk write rejected".into(),
                });
            }
            if response.results.len() != entries.len() {
                return Err(OdmError::Transport {
                    status: response.status,
                    reason: format!(
                        "bulk write answered {} of {} entries",
                        response.results.len(),
                        entries.len()
                    ),
                });
            }
            info!(
                entries = entries.len(),
                status = response.status,
                "submitted bulk write"
            );

            let answers = handles
                .into_iter()
                .zip(clean_states)
                .zip(&entries)
                .zip(response.results);
            for (((handle, clean), entry), result) in answers {
                let outcome = if result.is_ok() {
                    self.accept(handle, clean, entry, result)
                } else {
                    self.reject(handle, entry, result)
                };
                if let Some(conflict) = outcome? {
                    conflicts.push(conflict);
                }
            }
        }

        for (handle, index) in mem::take(&mut self.visited_collections) {
            if !self.identity_map.contains_handle(handle) {
                continue;
            }
            let meta = self.class_of(handle)?;
            let removed: Vec<String> = match self.collection(handle, &meta, index)? {
                Some(collection) => collection
                    .removed()
                    .iter()
                    .filter_map(|target| self.identifier(*target))
                    .collect(),
                None => Vec::new(),
            };
            if let Some(collection) = self.collection_mut(handle, &meta, index)? {
                collection.prune_pending(&removed);
                collection.take_snapshot();
            }
        }
        self.scheduled_inserts.clear();
        self.scheduled_updates.clear();
        self.scheduled_removals.clear();
        self.fire(LifecycleEvent::PostFlush, None)?;

        if conflicts.is_empty() {
            Ok(())
        } else {
            debug!(conflicts = conflicts.len(), "flush finished with conflicts");
            Err(OdmError::UpdateConflict {
                documents: conflicts,
            })
        }
    }

    /// Bookkeeping for an entry the store accepted.
    fn accept(
        &mut self,
        handle: DocHandle,
        clean: Option<CleanState>,
        entry: &BulkEntry,
        result: BulkResult,
    ) -> Result<Option<ConflictedDocument>> {
        if entry.is_delete() {
            self.record_existence(&result.id, false);
            self.purge(handle)?;
            self.fire(LifecycleEvent::PostRemove, Some(handle))?;
            return Ok(None);
        }

        if let Some(clean) = clean {
            self.install_clean_state(handle, clean)?;
        }
        let slot = self.identity_map.slot_mut(handle)?;
        let previous = mem::replace(&mut slot.revision, result.rev.clone());
        self.write_version(handle, result.rev.as_deref())?;
        self.record_existence(&result.id, true);
        let event = match previous {
            Some(_) => LifecycleEvent::PostUpdate,
            None => LifecycleEvent::PostPersist,
        };
        self.fire(event, Some(handle))?;
        Ok(None)
    }

    /// Bookkeeping for an entry the store rejected. Returns the conflict
    /// unless a resolver handled it, in which case the document is reloaded
    /// from the store and the rejected write is dropped.
    fn reject(
        &mut self,
        handle: DocHandle,
        entry: &BulkEntry,
        result: BulkResult,
    ) -> Result<Option<ConflictedDocument>> {
        let slot = self.identity_map.slot_mut(handle)?;
        if entry.is_delete() {
            slot.state = DocumentState::Managed;
        } else {
            slot.original = None;
        }
        let conflict = ConflictedDocument {
            handle,
            id: result.id,
            error: result.error.unwrap_or_else(|| "unknown".into()),
            reason: result.reason,
            deletion: entry.is_delete(),
        };
        warn!(id = %conflict.id, error = %conflict.error, "store rejected entry");

        self.fire(LifecycleEvent::OnConflict, Some(handle))?;
        let hooks = self.hooks.clone();
        let resolution = hooks.resolve_conflict(&ConflictEventArgs {
            id: &conflict.id,
            handle: Some(handle),
            error: Some(&conflict.error),
            revisions: &[],
            session: &*self,
        });
        match resolution {
            ConflictResolution::Resolved => {
                debug!(id = %conflict.id, "conflict resolved, adopting stored document");
                self.adopt_stored(handle, &conflict.id)?;
                Ok(None)
            }
            ConflictResolution::Unresolved => Ok(Some(conflict)),
        }
    }

    /// Replace a document's state with the stored one. A document that no
    /// longer exists is dropped from the session.
    fn adopt_stored(&mut self, handle: DocHandle, id: &str) -> Result<()> {
        let class = self.class_of(handle)?.name().to_string();
        let response = self.store.find_one(id)?;
        if response.is_not_found() {
            self.warn_vanished(id);
            self.record_existence(id, false);
            return self.purge(handle);
        }
        if !response.is_success() {
            return Err(OdmError::Transport {
                status: response.status,
                reason: response.reason(),
            });
        }
        self.create_document(Some(&class), response.body, HydrationHints::refresh())?;
        Ok(())
    }

    fn record_existence(&mut self, id: &str, exists: bool) {
        if self.config.cache_existence_probes {
            self.existence_probes.insert(id.to_string(), exists);
        }
    }

    /// Identifier and revision for a delete entry. A lazy reference has no
    /// revision yet; it is read from the store.
    fn deletion_target(&mut self, handle: DocHandle) -> Result<(String, String)> {
        let slot = self.identity_map.slot(handle)?;
        let id = slot
            .id
            .clone()
            .ok_or_else(|| OdmError::InvalidDocument(format!("{handle} has no identifier")))?;
        if let Some(rev) = &slot.revision {
            return Ok((id, rev.clone()));
        }

        let response = self.store.find_one(&id)?;
        if response.is_not_found() {
            self.warn_vanished(&id);
            self.purge(handle)?;
            return Err(OdmError::DocumentNotFound { id });
        }
        if !response.is_success() {
            return Err(OdmError::Transport {
                status: response.status,
                reason: response.reason(),
            });
        }
        let rev = response
            .body
            .get("_rev")
            .and_then(Json::as_str)
            .ok_or_else(|| OdmError::InvalidDocument(format!("{id} has no _rev")))?
            .to_string();
        self.identity_map.slot_mut(handle)?.revision = Some(rev.clone());
        Ok((id, rev))
    }

    /// Stored form of a managed document.
    fn document_body(&self, handle: DocHandle) -> Result<Json> {
        let slot = self.identity_map.slot(handle)?;
        let meta = &slot.class;
        let object = self.object(handle)?;
        let id = slot
            .id
            .clone()
            .ok_or_else(|| OdmError::InvalidDocument(format!("{handle} has no identifier")))?;

        let mut body = Map::new();
        body.insert("_id".into(), Json::String(id));
        if let Some(rev) = &slot.revision {
            body.insert("_rev".into(), Json::String(rev.clone()));
        }
        body.insert(
            self.config.type_field.clone(),
            Json::String(meta.name().to_string()),
        );

        for field in &meta.fields {
            let value = field.access.read(object)?;
            if !value.is_null() {
                body.insert(
                    field.json_name.clone(),
                    self.types.to_store(&field.type_name, &value)?,
                );
            }
        }

        let serializer = self.serializer();
        for mapping in &meta.embedded {
            let value = serializer.serialize(mapping, object)?;
            if !value.is_null() {
                body.insert(mapping.json_name.clone(), value);
            }
        }

        let mut associations = Vec::new();
        for assoc in meta.associations.iter().filter(|assoc| assoc.is_owning_side()) {
            match &assoc.access {
                AssociationAccess::One(access) => {
                    let Some(target) = *access.get(object)? else {
                        continue;
                    };
                    body.insert(assoc.json_name.clone(), Json::String(self.target_id(target)?));
                }
                AssociationAccess::Many(access) => {
                    let collection = access.get(object)?;
                    let removed: Vec<String> = collection
                        .removed()
                        .iter()
                        .filter_map(|target| self.identifier(*target))
                        .collect();
                    let mut ids: Vec<String> = match collection.pending() {
                        Some(PendingLoad::Ids(ids)) => ids
                            .iter()
                            .filter(|id| !removed.contains(id))
                            .cloned()
                            .collect(),
                        _ => Vec::new(),
                    };
                    for target in collection.raw_iter() {
                        let id = self.target_id(target)?;
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                    body.insert(assoc.json_name.clone(), json!(ids));
                }
            }
            associations.push(assoc.json_name.clone());
        }
        if self.config.write_association_metadata && !associations.is_empty() {
            body.insert(
                self.config.metadata_field.clone(),
                json!({ "associations": associations }),
            );
        }

        if let Some(access) = &meta.attachments {
            let attachments = access.get(object)?;
            if !attachments.is_empty() {
                body.insert("_attachments".into(), attachments_to_json(attachments));
            }
        }

        for (key, value) in &slot.pass_through {
            if !meta.maps_json_key(key) && !body.contains_key(key) {
                body.insert(key.clone(), value.clone());
            }
        }
        Ok(Json::Object(body))
    }

    fn target_id(&self, target: DocHandle) -> Result<String> {
        self.identifier(target).ok_or_else(|| {
            OdmError::InvalidDocument(format!("referenced document {target} has no identifier"))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metadata::{ClassMetadata, IdStrategy, MetadataRegistry};
    use crate::store::{
        BulkResponse, DocumentStore, InMemoryDocumentStore, RowsResponse, StoreResponse,
    };

    /// Applies every entry but answers only the first one.
    struct FirstAnswerOnly(InMemoryDocumentStore);

    impl DocumentStore for FirstAnswerOnly {
        fn find_one(&self, id: &str) -> Result<StoreResponse> {
            self.0.find_one(id)
        }

        fn find_many(
            &self,
            ids: &[String],
            limit: Option<usize>,
            offset: Option<usize>,
        ) -> Result<RowsResponse> {
            self.0.find_many(ids, limit, offset)
        }

        fn submit_batch(
            &self,
            entries: &[BulkEntry],
            all_or_nothing: bool,
        ) -> Result<BulkResponse> {
            let mut response = self.0.submit_batch(entries, all_or_nothing)?;
            response.results.truncate(1);
            Ok(response)
        }

        fn generate_identifiers(&self, count: usize) -> Result<Vec<String>> {
            self.0.generate_identifiers(count)
        }
    }

    #[derive(Default)]
    struct Note {
        id: Option<String>,
        text: String,
        rev: Option<String>,
    }

    fn session(store: &InMemoryDocumentStore) -> UnitOfWork {
        session_over(Arc::new(store.clone()))
    }

    fn session_over(store: Arc<dyn DocumentStore>) -> UnitOfWork {
        let note = ClassMetadata::document::<Note>("Note")
            .identifier(|n| &n.id, |n| &mut n.id)
            .id_strategy(IdStrategy::Assigned)
            .version(|n| &n.rev, |n| &mut n.rev)
            .field("text", |n| &n.text, |n| &mut n.text)
            .build()
            .unwrap();
        let mut registry = MetadataRegistry::new();
        registry.register(note).unwrap();
        UnitOfWork::new(Arc::new(registry), store)
    }

    fn note(id: &str, text: &str) -> Note {
        Note {
            id: Some(id.into()),
            text: text.into(),
            rev: None,
        }
    }

    #[test]
    fn insert_writes_body_and_records_revision() {
        let store = InMemoryDocumentStore::new();
        let mut uow = session(&store);
        let n = uow.add(note("n1", "hello")).unwrap();
        uow.persist(n).unwrap();
        uow.flush().unwrap();

        let batches = store.batches().unwrap();
        assert_eq!(batches.len(), 1);
        let body = batches[0].entries[0].to_json();
        assert_eq!(body["_id"], "n1");
        assert_eq!(body["type"], "Note");
        assert_eq!(body["text"], "hello");
        assert!(body.get("_rev").is_none());

        let rev = uow.revision(n).unwrap();
        assert!(rev.starts_with("1-"));
        assert_eq!(uow.get::<Note>(n).unwrap().rev.as_deref(), Some(rev.as_str()));
        assert!(!uow.is_scheduled_for_insert(n));
    }

    #[test]
    fn transport_failure_keeps_work_scheduled() {
        let store = InMemoryDocumentStore::new();
        let mut uow = session(&store);
        let n = uow.add(note("n1", "hello")).unwrap();
        uow.persist(n).unwrap();

        store.fail_next_batch(503, "unavailable").unwrap();
        assert!(matches!(
            uow.flush(),
            Err(OdmError::Transport { status: 503, .. })
        ));
        assert!(uow.is_scheduled_for_insert(n));
        assert!(uow.revision(n).is_none());

        uow.flush().unwrap();
        assert!(uow.revision(n).is_some());
        assert!(store.raw("n1").unwrap().is_some());
    }

    #[test]
    fn partial_answers_fail_the_flush() {
        let store = InMemoryDocumentStore::new();
        let mut uow = session_over(Arc::new(FirstAnswerOnly(store.clone())));
        let first = uow.add(note("n1", "one")).unwrap();
        let second = uow.add(note("n2", "two")).unwrap();
        uow.persist(first).unwrap();
        uow.persist(second).unwrap();

        let err = uow.flush().unwrap_err();
        assert!(matches!(err, OdmError::Transport { ref reason, .. } if reason.contains("1 of 2")));
        assert!(uow.is_scheduled_for_insert(first));
        assert!(uow.is_scheduled_for_insert(second));
        assert!(uow.revision(second).is_none());
    }

    #[test]
    fn clean_sessions_submit_nothing() {
        let store = InMemoryDocumentStore::new();
        let mut uow = session(&store);
        uow.flush().unwrap();
        assert!(store.batches().unwrap().is_empty());
    }
}
