use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::{debug, trace};

use super::identity_map::{Slot, Snapshot};
use super::{DocHandle, DocumentState, UnitOfWork};
use crate::attachment::attachments_from_json;
use crate::collection::{PendingLoad, PersistentCollection};
use crate::error::{OdmError, Result};
use crate::hooks::{ConflictEventArgs, LifecycleEvent};
use crate::metadata::{AssociationAccess, ClassMetadata};

/// Field snapshot plus serialized embedded values of a document.
pub(crate) type CleanState = (Snapshot, HashMap<String, Json>);

/// Options for [`UnitOfWork::create_document`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrationHints {
    /// Overwrite an already loaded document with the stored data.
    pub refresh: bool,
}

impl HydrationHints {
    pub fn refresh() -> Self {
        Self { refresh: true }
    }
}

impl UnitOfWork {
    /// Turn a stored document body into a managed object.
    ///
    /// The class comes from the body's type discriminator, else from
    /// `class`. A document already in the identity map is returned as is,
    /// unless it is an unloaded reference or `hints.refresh` is set.
    pub fn create_document(
        &mut self,
        class: Option<&str>,
        body: Json,
        hints: HydrationHints,
    ) -> Result<DocHandle> {
        let Json::Object(mut data) = body else {
            return Err(OdmError::InvalidDocument("document body is not an object".into()));
        };
        let id = match data.remove("_id") {
            Some(Json::String(id)) => id,
            _ => return Err(OdmError::InvalidDocument("document has no _id".into())),
        };
        let revision = match data.remove("_rev") {
            Some(Json::String(rev)) => Some(rev),
            _ => None,
        };
        let meta = self.resolve_document_class(&id, class, &data)?;
        let conflicts: Vec<String> = match data.remove("_conflicts") {
            Some(Json::Array(revs)) => revs
                .into_iter()
                .filter_map(|rev| rev.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        let handle = match self.identity_map.lookup(&id) {
            Some(handle) => {
                let slot = self.identity_map.slot(handle)?;
                if slot.initialized && !hints.refresh {
                    return Ok(handle);
                }
                handle
            }
            None => {
                let object = meta.instantiate();
                let mut slot = Slot::new(Arc::clone(&meta), object, DocumentState::Managed);
                slot.id = Some(id.clone());
                let handle = self.identity_map.insert(slot);
                self.identity_map.register(&id, handle)?;
                handle
            }
        };

        let slot = self.identity_map.slot_mut(handle)?;
        slot.initialized = true;
        slot.revision = revision.clone();
        let current = slot
            .object
            .take()
            .ok_or(OdmError::DocumentBorrowed(handle))?;
        // a refresh starts from a blank object; a reference may turn out to be another class
        let mut object = if hints.refresh || !Arc::ptr_eq(&slot.class, &meta) {
            slot.class = Arc::clone(&meta);
            meta.instantiate()
        } else {
            current
        };
        let populated = self.populate(handle, &meta, &id, &mut *object, data);
        self.identity_map.slot_mut(handle)?.object = Some(object);
        let pass_through = populated?;
        self.identity_map.slot_mut(handle)?.pass_through = pass_through;

        self.write_identifier(handle, &id)?;
        self.write_version(handle, revision.as_deref())?;
        self.take_snapshot(handle)?;
        debug!(%id, class = meta.name(), refresh = hints.refresh, "hydrated document");
        self.fire(LifecycleEvent::PostLoad, Some(handle))?;

        if !conflicts.is_empty() {
            self.notify_read_conflict(handle, &id, &conflicts)?;
        }
        Ok(handle)
    }

    /// Load a document by identifier, consulting the identity map first.
    pub fn find(&mut self, class: &str, id: &str) -> Result<Option<DocHandle>> {
        if let Some(handle) = self.identity_map.lookup(id) {
            self.ensure_initialized(handle)?;
            return Ok(Some(handle));
        }
        self.fetch(Some(class), id)
    }

    /// Load several documents, in `ids` order. Missing documents are skipped.
    pub fn find_many(&mut self, class: &str, ids: &[String]) -> Result<Vec<DocHandle>> {
        self.load_many(Some(class), ids)
    }

    /// A lazy reference to a document. Nothing is read until the document
    /// is accessed through [`get`](Self::get) or [`get_mut`](Self::get_mut).
    pub fn reference(&mut self, class: &str, id: &str) -> Result<DocHandle> {
        if let Some(handle) = self.identity_map.lookup(id) {
            return Ok(handle);
        }
        let meta = self.metadata.metadata_for(class)?;
        let mut slot = Slot::new(Arc::clone(&meta), meta.instantiate(), DocumentState::Managed);
        slot.id = Some(id.to_string());
        slot.initialized = false;
        let handle = self.identity_map.insert(slot);
        self.identity_map.register(id, handle)?;
        self.write_identifier(handle, id)?;
        trace!(%id, class, "created lazy reference");
        Ok(handle)
    }

    /// Load the members of a to-many association.
    pub fn initialize_collection(&mut self, owner: DocHandle, field: &str) -> Result<()> {
        self.ensure_initialized(owner)?;
        let meta = self.class_of(owner)?;
        let index = association_index(&meta, field)?;
        let AssociationAccess::Many(access) = &meta.associations[index].access else {
            return Err(OdmError::InvalidMapping {
                class: meta.name().to_string(),
                reason: format!("{field} is not a to-many association"),
            });
        };
        let Some(pending) = access.get(self.object(owner)?)?.pending().cloned() else {
            return Ok(());
        };

        let target = meta.associations[index].target.clone();
        let loaded = match pending {
            PendingLoad::Ids(ids) => self.load_many(target.as_deref(), &ids)?,
            PendingLoad::Inverse {
                mapped_by,
                owner_id,
            } => {
                let target = target.ok_or_else(|| OdmError::InvalidMapping {
                    class: meta.name().to_string(),
                    reason: format!("inverse association {field} has no target"),
                })?;
                let target_meta = self.metadata.metadata_for(&target)?;
                let stored_field = target_meta
                    .association(&mapped_by)
                    .map_or(mapped_by.as_str(), |assoc| assoc.json_name());
                let response = self
                    .store
                    .find_referencing(&target, stored_field, &owner_id)?;
                if response.status >= 400 {
                    return Err(OdmError::Transport {
                        status: response.status,
                        reason: format!("find_referencing {target}.{mapped_by}"),
                    });
                }
                let mut handles = Vec::with_capacity(response.rows.len());
                for row in response.rows {
                    if let Some(doc) = row.doc {
                        handles.push(self.create_document(
                            Some(&target),
                            doc,
                            HydrationHints::default(),
                        )?);
                    }
                }
                handles
            }
        };

        trace!(field, members = loaded.len(), "initialized collection");
        access
            .get_mut(self.object_mut(owner)?)?
            .complete_load(loaded);
        Ok(())
    }

    /// Members of a to-many association, loading them if needed.
    pub fn collection_items(&mut self, owner: DocHandle, field: &str) -> Result<Vec<DocHandle>> {
        self.initialize_collection(owner, field)?;
        let meta = self.class_of(owner)?;
        let index = association_index(&meta, field)?;
        Ok(self
            .collection(owner, &meta, index)?
            .map(|collection| collection.raw_iter().collect())
            .unwrap_or_default())
    }

    /// Load a lazy reference. Does nothing for loaded documents.
    pub(crate) fn ensure_initialized(&mut self, handle: DocHandle) -> Result<()> {
        let slot = self.identity_map.slot(handle)?;
        if slot.initialized {
            return Ok(());
        }
        let class = slot.class.name().to_string();
        let id = slot
            .id
            .clone()
            .ok_or_else(|| OdmError::InvalidDocument("lazy reference without identifier".into()))?;

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
        self.create_document(Some(&class), response.body, HydrationHints::default())?;
        Ok(())
    }

    /// Record the current values of a document as its clean state.
    pub(crate) fn take_snapshot(&mut self, handle: DocHandle) -> Result<()> {
        let state = self.clean_state(handle)?;
        self.install_clean_state(handle, state)
    }

    /// Current values of a document, in the form kept as its clean state.
    pub(crate) fn clean_state(&self, handle: DocHandle) -> Result<CleanState> {
        let meta = self.class_of(handle)?;
        let object = self.object(handle)?;
        let snapshot = self.capture(&meta, object)?;
        let serializer = self.serializer();
        let mut embedded = HashMap::with_capacity(meta.embedded.len());
        for mapping in &meta.embedded {
            embedded.insert(mapping.name.clone(), serializer.serialize(mapping, object)?);
        }
        Ok((snapshot, embedded))
    }

    pub(crate) fn install_clean_state(
        &mut self,
        handle: DocHandle,
        state: CleanState,
    ) -> Result<()> {
        let (snapshot, embedded) = state;
        let slot = self.identity_map.slot_mut(handle)?;
        slot.original = Some(snapshot);
        slot.embedded_originals = embedded;
        Ok(())
    }

    /// Current field values and references of `object`.
    pub(crate) fn capture(&self, meta: &ClassMetadata, object: &dyn Any) -> Result<Snapshot> {
        let fields = meta
            .fields
            .iter()
            .map(|field| field.access.read(object))
            .collect::<Result<Vec<_>>>()?;
        let references = meta
            .associations
            .iter()
            .map(|assoc| match &assoc.access {
                AssociationAccess::One(access) => access.get(object).map(|target| *target),
                AssociationAccess::Many(_) => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;
        let attachments = match &meta.attachments {
            Some(access) => Some(access.get(object)?.clone()),
            None => None,
        };
        Ok(Snapshot {
            fields,
            references,
            attachments,
        })
    }

    /// The to-many collection at association `index`, if that association is one.
    pub(crate) fn collection(
        &self,
        handle: DocHandle,
        meta: &ClassMetadata,
        index: usize,
    ) -> Result<Option<&PersistentCollection>> {
        match &meta.associations[index].access {
            AssociationAccess::Many(access) => Ok(Some(access.get(self.object(handle)?)?)),
            AssociationAccess::One(_) => Ok(None),
        }
    }

    pub(crate) fn collection_mut(
        &mut self,
        handle: DocHandle,
        meta: &ClassMetadata,
        index: usize,
    ) -> Result<Option<&mut PersistentCollection>> {
        match &meta.associations[index].access {
            AssociationAccess::Many(access) => Ok(Some(access.get_mut(self.object_mut(handle)?)?)),
            AssociationAccess::One(_) => Ok(None),
        }
    }

    pub(super) fn fetch(&mut self, class: Option<&str>, id: &str) -> Result<Option<DocHandle>> {
        let response = self.store.find_one(id)?;
        if response.is_not_found() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(OdmError::Transport {
                status: response.status,
                reason: response.reason(),
            });
        }
        self.create_document(class, response.body, HydrationHints::default())
            .map(Some)
    }

    fn load_many(&mut self, class: Option<&str>, ids: &[String]) -> Result<Vec<DocHandle>> {
        let missing: Vec<String> = ids
            .iter()
            .filter(|id| {
                self.identity_map
                    .lookup(id)
                    .map_or(true, |handle| !self.is_initialized(handle))
            })
            .cloned()
            .collect();

        if !missing.is_empty() {
            let response = self.store.find_many(&missing, None, None)?;
            if response.status >= 400 {
                return Err(OdmError::Transport {
                    status: response.status,
                    reason: "find_many".into(),
                });
            }
            for row in response.rows {
                match row.doc {
                    Some(doc) => {
                        self.create_document(class, doc, HydrationHints::default())?;
                    }
                    None => self.warn_vanished(&row.id),
                }
            }
        }

        Ok(ids
            .iter()
            .filter_map(|id| self.identity_map.lookup(id))
            .filter(|handle| self.is_initialized(*handle))
            .collect())
    }

    fn resolve_document_class(
        &self,
        id: &str,
        requested: Option<&str>,
        data: &Map<String, Json>,
    ) -> Result<Arc<ClassMetadata>> {
        let stored = data.get(&self.config.type_field).and_then(Json::as_str);
        let name = match (stored, requested) {
            (Some(stored), Some(requested)) if stored != requested => {
                return Err(OdmError::InvalidDocument(format!(
                    "requested {requested} but {id} is stored as {stored}"
                )))
            }
            (Some(name), _) | (None, Some(name)) => name,
            (None, None) => {
                return Err(OdmError::InvalidDocument(format!(
                    "cannot determine the class of {id}"
                )))
            }
        };
        self.metadata.metadata_for(name)
    }

    /// Write stored values into `object`. Returns the unmapped keys.
    fn populate(
        &mut self,
        handle: DocHandle,
        meta: &ClassMetadata,
        id: &str,
        object: &mut dyn Any,
        mut data: Map<String, Json>,
    ) -> Result<Map<String, Json>> {
        for field in &meta.fields {
            if let Some(stored) = data.remove(&field.json_name) {
                let value = self.types.to_native(&field.type_name, &stored)?;
                field.access.write(object, value)?;
            }
        }

        for mapping in &meta.embedded {
            if let Some(stored) = data.remove(&mapping.json_name) {
                let value = self.serializer().hydrate(mapping, &stored)?;
                mapping.access.assign(object, value)?;
            }
        }

        for assoc in &meta.associations {
            let stored = match assoc.mapped_by {
                Some(_) => None,
                None => data.remove(&assoc.json_name),
            };
            match &assoc.access {
                AssociationAccess::One(access) => {
                    let target = match stored {
                        Some(Json::String(target_id)) => {
                            Some(self.resolve_reference(assoc.target.as_deref(), &target_id)?)
                        }
                        _ => None,
                    };
                    *access.get_mut(object)? = target;
                }
                AssociationAccess::Many(access) => {
                    let pending = match &assoc.mapped_by {
                        Some(mapped_by) => PendingLoad::Inverse {
                            mapped_by: mapped_by.clone(),
                            owner_id: id.to_string(),
                        },
                        None => PendingLoad::Ids(
                            stored
                                .as_ref()
                                .and_then(Json::as_array)
                                .map(|ids| {
                                    ids.iter()
                                        .filter_map(|id| id.as_str().map(str::to_string))
                                        .collect()
                                })
                                .unwrap_or_default(),
                        ),
                    };
                    *access.get_mut(object)? = PersistentCollection::lazy(pending);
                }
            }
        }

        if let Some(access) = &meta.attachments {
            let stored = data.remove("_attachments").unwrap_or(Json::Null);
            *access.get_mut(object)? = attachments_from_json(&stored)?;
        }

        let type_field = &self.config.type_field;
        let metadata_field = &self.config.metadata_field;
        data.retain(|key, _| !key.starts_with('_') && key != type_field && key != metadata_field);
        if !data.is_empty() {
            trace!(%id, handle = %handle, keys = data.len(), "keeping unmapped keys");
        }
        Ok(data)
    }

    /// Handle of a referenced document: managed instance, lazy reference,
    /// or, for untyped references, the eagerly loaded document.
    fn resolve_reference(&mut self, target: Option<&str>, id: &str) -> Result<DocHandle> {
        if let Some(handle) = self.identity_map.lookup(id) {
            return Ok(handle);
        }
        match target {
            Some(class) => self.reference(class, id),
            None => self
                .fetch(None, id)?
                .ok_or_else(|| OdmError::DocumentNotFound { id: id.to_string() }),
        }
    }

    fn notify_read_conflict(
        &mut self,
        handle: DocHandle,
        id: &str,
        revisions: &[String],
    ) -> Result<()> {
        self.fire(LifecycleEvent::OnConflict, Some(handle))?;
        let hooks = self.hooks.clone();
        let args = ConflictEventArgs {
            id,
            handle: Some(handle),
            error: None,
            revisions,
            session: &*self,
        };
        hooks.resolve_conflict(&args);
        Ok(())
    }
}

pub(super) fn association_index(meta: &ClassMetadata, field: &str) -> Result<usize> {
    meta.associations
        .iter()
        .position(|assoc| assoc.name == field)
        .ok_or_else(|| OdmError::UnknownField {
            class: meta.name().to_string(),
            field: field.to_string(),
        })
}
