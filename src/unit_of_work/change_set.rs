use tracing::trace;

use super::{DocHandle, DocumentState, UnitOfWork};
use crate::error::{CascadeOp, OdmError, Result};
use crate::metadata::{AssociationAccess, ClassMetadata};

impl UnitOfWork {
    /// Schedule an update for every loaded managed document that changed
    /// since its snapshot, persisting new documents reachable through
    /// cascading associations on the way.
    pub(crate) fn compute_change_sets(&mut self) -> Result<()> {
        for handle in self.identity_map.indexed_handles() {
            let slot = self.identity_map.slot(handle)?;
            if slot.state != DocumentState::Managed || !slot.initialized {
                continue;
            }
            self.compute_change_set(handle)?;
        }
        Ok(())
    }

    fn compute_change_set(&mut self, handle: DocHandle) -> Result<()> {
        let meta = self.class_of(handle)?;
        if self.has_changes(handle, &meta)? && !self.scheduled_inserts.contains(&handle) {
            trace!(handle = %handle, class = meta.name(), "scheduled update");
            self.scheduled_updates.insert(handle);
        }
        for (index, assoc) in meta.associations.iter().enumerate() {
            if assoc.is_owning_side() && matches!(assoc.access, AssociationAccess::Many(_)) {
                self.visited_collections.insert((handle, index));
            }
        }
        self.compute_association_changes(handle, &meta)
    }

    fn has_changes(&self, handle: DocHandle, meta: &ClassMetadata) -> Result<bool> {
        let slot = self.identity_map.slot(handle)?;
        let Some(original) = &slot.original else {
            return Ok(true);
        };
        let object = self.object(handle)?;
        let current = self.capture(meta, object)?;

        if current.fields != original.fields {
            return Ok(true);
        }
        for (index, assoc) in meta.associations.iter().enumerate() {
            if !assoc.is_owning_side() {
                continue;
            }
            let changed = match &assoc.access {
                AssociationAccess::One(_) => {
                    current.references[index] != original.references[index]
                }
                AssociationAccess::Many(access) => access.get(object)?.is_dirty(),
            };
            if changed {
                return Ok(true);
            }
        }
        if current.attachments != original.attachments {
            return Ok(true);
        }

        let serializer = self.serializer();
        for mapping in &meta.embedded {
            let changed = match slot.embedded_originals.get(&mapping.name) {
                Some(original) => serializer.is_changed(mapping, object, original)?,
                None => !serializer.serialize(mapping, object)?.is_null(),
            };
            if changed {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply persistence by reachability to the targets of `handle`'s associations.
    fn compute_association_changes(
        &mut self,
        handle: DocHandle,
        meta: &ClassMetadata,
    ) -> Result<()> {
        for (index, assoc) in meta.associations.iter().enumerate() {
            let cascades = assoc.cascades(CascadeOp::Persist);
            for target in self.raw_targets(handle, meta, index)? {
                match (self.document_state(target)?, assoc.is_owning_side()) {
                    (DocumentState::New, _) if cascades => {
                        self.persist_new(target)?;
                        self.compute_change_set(target)?;
                    }
                    (DocumentState::New, true) => {
                        return Err(OdmError::UncascadedNewObject {
                            class: meta.name().to_string(),
                            field: assoc.name.clone(),
                            target: self.class_name(target).unwrap_or_default().to_string(),
                        })
                    }
                    (DocumentState::Removed, true) => {
                        return Err(OdmError::RemovedDocumentReferenced {
                            class: meta.name().to_string(),
                            field: assoc.name.clone(),
                        })
                    }
                    (DocumentState::Detached, true) if cascades => {
                        return Err(OdmError::InvalidCascadeState {
                            operation: CascadeOp::Persist,
                            state: DocumentState::Detached,
                        })
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::collection::PersistentCollection;
    use crate::metadata::{Cascade, MetadataRegistry, Reference};
    use crate::store::InMemoryDocumentStore;

    #[derive(Default)]
    struct Node {
        id: Option<String>,
        label: String,
        next: Option<DocHandle>,
        children: PersistentCollection,
    }

    fn session(cascade: Cascade) -> UnitOfWork {
        let node = ClassMetadata::document::<Node>("Node")
            .identifier(|n| &n.id, |n| &mut n.id)
            .field("label", |n| &n.label, |n| &mut n.label)
            .reference_one(
                Reference::new("next").target("Node").cascade(cascade),
                |n| &n.next,
                |n| &mut n.next,
            )
            .reference_many(
                Reference::new("children").target("Node").cascade(cascade),
                |n| &n.children,
                |n| &mut n.children,
            )
            .build()
            .unwrap();
        let mut registry = MetadataRegistry::new();
        registry.register(node).unwrap();
        UnitOfWork::new(Arc::new(registry), Arc::new(InMemoryDocumentStore::new()))
    }

    fn node(label: &str) -> Node {
        Node {
            label: label.into(),
            ..Node::default()
        }
    }

    #[test]
    fn unsnapshotted_documents_are_dirty() {
        let mut uow = session(Cascade::NONE);
        let root = uow.add(node("root")).unwrap();
        uow.persist(root).unwrap();

        uow.compute_change_sets().unwrap();
        assert!(uow.is_scheduled_for_insert(root));
        assert!(!uow.is_scheduled_for_update(root));
    }

    #[test]
    fn reachable_new_documents_are_persisted_when_cascading() {
        let mut uow = session(Cascade::PERSIST);
        let child = uow.add(node("child")).unwrap();
        let root = uow.add(node("root")).unwrap();
        uow.persist(root).unwrap();
        uow.get_mut::<Node>(root).unwrap().children.push(child);

        uow.compute_change_sets().unwrap();
        assert!(uow.is_scheduled_for_insert(child));
        assert_eq!(uow.document_state(child).unwrap(), DocumentState::Managed);
    }

    #[test]
    fn reachable_new_documents_without_cascade_are_rejected() {
        let mut uow = session(Cascade::NONE);
        let next = uow.add(node("next")).unwrap();
        let root = uow.add(node("root")).unwrap();
        uow.persist(root).unwrap();
        uow.get_mut::<Node>(root).unwrap().next = Some(next);

        let err = uow.compute_change_sets().unwrap_err();
        assert!(matches!(
            err,
            OdmError::UncascadedNewObject { ref class, ref field, ref target }
                if class == "Node" && field == "next" && target == "Node"
        ));
    }
}
