use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use super::hydrate::HydrationHints;
use super::identity_map::Slot;
use super::{DocHandle, DocumentState, UnitOfWork};
use crate::error::{CascadeOp, OdmError, Result};
use crate::hooks::LifecycleEvent;
use crate::metadata::{AssociationAccess, ClassMetadata};

impl UnitOfWork {
    // ========================================================================
    // Public operations
    // ========================================================================

    /// Make a document managed. It is inserted on the next flush.
    ///
    /// A removed document becomes managed again and its deletion is
    /// cancelled. Cascades along associations flagged `PERSIST`.
    pub fn persist(&mut self, handle: DocHandle) -> Result<()> {
        self.do_persist(handle, &mut HashSet::new())
    }

    /// Schedule a managed document for deletion on the next flush.
    ///
    /// A document that was never written is dropped right away.
    pub fn remove(&mut self, handle: DocHandle) -> Result<()> {
        self.do_remove(handle, &mut HashSet::new())
    }

    /// Reload a managed document from the store, discarding local changes.
    pub fn refresh(&mut self, handle: DocHandle) -> Result<()> {
        self.do_refresh(handle, &mut HashSet::new())
    }

    /// Stop tracking a document. Later changes are not written.
    ///
    /// The object stays reachable through its handle until
    /// [`forget`](Self::forget) releases it.
    pub fn detach(&mut self, handle: DocHandle) -> Result<()> {
        self.do_detach(handle, &mut HashSet::new())
    }

    /// Copy the state of a new or detached document onto its managed
    /// counterpart and return the managed handle.
    ///
    /// The managed counterpart is looked up by identifier, in the identity
    /// map and then in the store. Without one, a fresh managed document is
    /// created and scheduled for insertion.
    pub fn merge(&mut self, handle: DocHandle) -> Result<DocHandle> {
        self.do_merge(handle, &mut HashMap::new())
    }

    // ========================================================================
    // Walks
    // ========================================================================

    fn do_persist(&mut self, handle: DocHandle, visited: &mut HashSet<DocHandle>) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        match self.document_state(handle)? {
            DocumentState::New => self.persist_new(handle)?,
            DocumentState::Managed => {}
            DocumentState::Removed => {
                self.scheduled_removals.remove(&handle);
                self.identity_map.slot_mut(handle)?.state = DocumentState::Managed;
                trace!(handle = %handle, "cancelled removal");
            }
            DocumentState::Detached => {
                return Err(OdmError::DetachedDocument {
                    operation: CascadeOp::Persist,
                })
            }
        }
        for target in self.cascade_targets(handle, CascadeOp::Persist)? {
            self.do_persist(target, visited)?;
        }
        Ok(())
    }

    fn do_remove(&mut self, handle: DocHandle, visited: &mut HashSet<DocHandle>) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let state = self.document_state(handle)?;
        if state == DocumentState::Detached {
            return Err(OdmError::DetachedDocument {
                operation: CascadeOp::Remove,
            });
        }
        for target in self.cascade_targets(handle, CascadeOp::Remove)? {
            self.do_remove(target, visited)?;
        }
        if state != DocumentState::Managed {
            return Ok(());
        }

        self.fire(LifecycleEvent::PreRemove, Some(handle))?;
        let slot = self.identity_map.slot(handle)?;
        if slot.revision.is_none() && slot.initialized {
            trace!(handle = %handle, "dropping document that was never written");
            self.purge(handle)?;
            self.fire(LifecycleEvent::PostRemove, Some(handle))?;
        } else {
            self.schedule_remove(handle)?;
        }
        Ok(())
    }

    fn do_refresh(&mut self, handle: DocHandle, visited: &mut HashSet<DocHandle>) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let slot = self.identity_map.slot(handle)?;
        if slot.state != DocumentState::Managed {
            return Err(OdmError::InvalidCascadeState {
                operation: CascadeOp::Refresh,
                state: slot.state,
            });
        }
        let class = slot.class.name().to_string();
        let id = self.current_identifier(handle)?.ok_or_else(|| {
            OdmError::InvalidDocument(format!("managed {class} without identifier"))
        })?;

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
        self.create_document(Some(&class), response.body, HydrationHints::refresh())?;
        self.scheduled_updates.remove(&handle);
        debug!(%id, "refreshed document");

        for target in self.cascade_targets(handle, CascadeOp::Refresh)? {
            self.do_refresh(target, visited)?;
        }
        Ok(())
    }

    fn do_detach(&mut self, handle: DocHandle, visited: &mut HashSet<DocHandle>) -> Result<()> {
        if !visited.insert(handle) {
            return Ok(());
        }
        let slot = self.identity_map.slot_mut(handle)?;
        match slot.state {
            DocumentState::Managed | DocumentState::Removed => {
                slot.state = DocumentState::Detached;
                if let Some(id) = slot.id.clone() {
                    if self.identity_map.lookup(&id) == Some(handle) {
                        self.identity_map.unregister(&id);
                    }
                }
                self.scheduled_inserts.remove(&handle);
                self.scheduled_updates.remove(&handle);
                self.scheduled_removals.remove(&handle);
                self.visited_collections.retain(|(owner, _)| *owner != handle);
            }
            DocumentState::New | DocumentState::Detached => return Ok(()),
        }
        for target in self.cascade_targets(handle, CascadeOp::Detach)? {
            self.do_detach(target, visited)?;
        }
        Ok(())
    }

    fn do_merge(
        &mut self,
        handle: DocHandle,
        visited: &mut HashMap<DocHandle, DocHandle>,
    ) -> Result<DocHandle> {
        if let Some(merged) = visited.get(&handle) {
            return Ok(*merged);
        }
        let state = self.document_state(handle)?;
        match state {
            DocumentState::Managed => {
                visited.insert(handle, handle);
                for target in self.cascade_targets(handle, CascadeOp::Merge)? {
                    self.do_merge(target, visited)?;
                }
                Ok(handle)
            }
            DocumentState::Removed => Err(OdmError::InvalidCascadeState {
                operation: CascadeOp::Merge,
                state,
            }),
            DocumentState::New | DocumentState::Detached => {
                let meta = self.class_of(handle)?;
                let id = self.current_identifier(handle)?;
                let existing = match &id {
                    Some(id) => match self.identity_map.lookup(id) {
                        Some(managed) => {
                            self.ensure_initialized(managed)?;
                            Some(managed)
                        }
                        None => self.fetch(Some(meta.name()), id)?,
                    },
                    None => None,
                };

                let (managed, created) = match existing {
                    Some(managed) => {
                        let managed_state = self.identity_map.slot(managed)?.state;
                        if managed_state == DocumentState::Removed {
                            return Err(OdmError::InvalidCascadeState {
                                operation: CascadeOp::Merge,
                                state: managed_state,
                            });
                        }
                        self.check_version(handle, managed, &meta)?;
                        (managed, false)
                    }
                    None => {
                        let managed = self.identity_map.insert(Slot::new(
                            Arc::clone(&meta),
                            meta.instantiate(),
                            DocumentState::New,
                        ));
                        if let Some(id) = &id {
                            self.write_identifier(managed, id)?;
                        }
                        (managed, true)
                    }
                };

                visited.insert(handle, managed);
                self.copy_state(handle, managed, &meta, visited)?;
                if created {
                    self.persist_new(managed)?;
                }
                trace!(source = %handle, managed = %managed, created, "merged document");
                Ok(managed)
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Targets of the associations of `handle` that cascade `op`.
    ///
    /// Lazy references and uninitialized collections are skipped, except for
    /// removal, which loads owned collections so their members are deleted too.
    fn cascade_targets(&mut self, handle: DocHandle, op: CascadeOp) -> Result<Vec<DocHandle>> {
        let meta = self.class_of(handle)?;
        if !meta.associations.iter().any(|assoc| assoc.cascades(op)) {
            return Ok(Vec::new());
        }
        if op == CascadeOp::Remove {
            self.ensure_initialized(handle)?;
        } else if !self.is_initialized(handle) {
            return Ok(Vec::new());
        }

        let mut targets = Vec::new();
        for (index, assoc) in meta.associations.iter().enumerate() {
            if !assoc.cascades(op) {
                continue;
            }
            if op == CascadeOp::Remove {
                let pending = self
                    .collection(handle, &meta, index)?
                    .is_some_and(|collection| !collection.is_initialized());
                if pending {
                    self.initialize_collection(handle, &assoc.name)?;
                }
            }
            targets.extend(
                self.raw_targets(handle, &meta, index)?
                    .into_iter()
                    .filter(|target| op == CascadeOp::Remove || self.is_initialized(*target)),
            );
        }
        Ok(targets)
    }

    /// Current targets of association `index`, without loading anything.
    pub(super) fn raw_targets(
        &self,
        handle: DocHandle,
        meta: &ClassMetadata,
        index: usize,
    ) -> Result<Vec<DocHandle>> {
        let object = self.object(handle)?;
        Ok(match &meta.associations[index].access {
            AssociationAccess::One(access) => access.get(object)?.iter().copied().collect(),
            AssociationAccess::Many(access) => access.get(object)?.raw_iter().collect(),
        })
    }

    fn check_version(
        &self,
        source: DocHandle,
        managed: DocHandle,
        meta: &ClassMetadata,
    ) -> Result<()> {
        let Some(version) = &meta.version else {
            return Ok(());
        };
        let merged = version.get(self.object(source)?)?.clone();
        let current = version.get(self.object(managed)?)?.clone();
        match merged {
            Some(merged) if current.as_deref() != Some(merged.as_str()) => {
                Err(OdmError::RevisionMismatch {
                    id: self.identifier(managed).unwrap_or_default(),
                    managed: current,
                    merged: Some(merged),
                })
            }
            _ => Ok(()),
        }
    }

    /// Copy fields, embedded values, attachments and associations of
    /// `source` onto `target`.
    fn copy_state(
        &mut self,
        source: DocHandle,
        target: DocHandle,
        meta: &ClassMetadata,
        visited: &mut HashMap<DocHandle, DocHandle>,
    ) -> Result<()> {
        for field in &meta.fields {
            let value = field.access.read(self.object(source)?)?;
            field.access.write(self.object_mut(target)?, value)?;
        }

        for mapping in &meta.embedded {
            let value = {
                let serializer = self.serializer();
                let json = serializer.serialize(mapping, self.object(source)?)?;
                serializer.hydrate(mapping, &json)?
            };
            mapping.access.assign(self.object_mut(target)?, value)?;
        }

        if let Some(access) = &meta.attachments {
            let attachments = access.get(self.object(source)?)?.clone();
            *access.get_mut(self.object_mut(target)?)? = attachments;
        }

        for (index, assoc) in meta.associations.iter().enumerate() {
            if !assoc.is_owning_side() {
                continue;
            }
            let cascades = assoc.cascades(CascadeOp::Merge);
            match &assoc.access {
                AssociationAccess::One(access) => {
                    let related = *access.get(self.object(source)?)?;
                    let merged = match related {
                        Some(related) if cascades => Some(self.do_merge(related, visited)?),
                        Some(related) => Some(self.managed_counterpart(related, assoc.target())?),
                        None => None,
                    };
                    *access.get_mut(self.object_mut(target)?)? = merged;
                }
                AssociationAccess::Many(access) => {
                    if !access.get(self.object(source)?)?.is_initialized() {
                        continue;
                    }
                    let mut merged = Vec::new();
                    for related in self.raw_targets(source, meta, index)? {
                        merged.push(if cascades {
                            self.do_merge(related, visited)?
                        } else {
                            self.managed_counterpart(related, assoc.target())?
                        });
                    }
                    let collection = access.get_mut(self.object_mut(target)?)?;
                    collection.clear();
                    for related in merged {
                        collection.push(related);
                    }
                }
            }
        }
        Ok(())
    }

    /// The managed document standing for `related`: itself when managed,
    /// otherwise the managed document or a lazy reference with its identifier.
    fn managed_counterpart(
        &mut self,
        related: DocHandle,
        target: Option<&str>,
    ) -> Result<DocHandle> {
        if self.identity_map.slot(related)?.state == DocumentState::Managed {
            return Ok(related);
        }
        let Some(id) = self.current_identifier(related)? else {
            return Ok(related);
        };
        if let Some(managed) = self.identity_map.lookup(&id) {
            return Ok(managed);
        }
        let class = match target {
            Some(class) => class.to_string(),
            None => self.class_of(related)?.name().to_string(),
        };
        self.reference(&class, &id)
    }
}
