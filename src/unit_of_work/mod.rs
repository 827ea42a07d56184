//! Unit of Work - Session-scoped tracking of documents and their changes.
//!
//! Every object the session knows about lives in a slot addressed by a
//! [`DocHandle`]. Managed documents are also indexed by identifier, which
//! guarantees one live object per document per session. `flush` detects
//! what changed since the last load or write and submits every insert,
//! update and delete in a single bulk request.
//!
//! ## Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(metadata, store);
//!
//! let ann = uow.add(User { id: Some("u1".into()), name: "Ann".into(), ..Default::default() })?;
//! uow.persist(ann)?;
//! uow.flush()?;
//!
//! assert_eq!(uow.document_state(ann)?, DocumentState::Managed);
//! assert!(uow.revision(ann).is_some());
//! ```

mod cascade;
mod change_set;
mod flush;
mod hydrate;
mod identity_map;

use std::any::{Any, TypeId};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::Configuration;
use crate::embedded::EmbeddedSerializer;
use crate::error::{OdmError, Result};
use crate::hooks::{HookDispatcher, LifecycleEvent, LifecycleEventArgs};
use crate::id_generator::{AssignedIdGenerator, IdGenerator, StoreBatchIdGenerator};
use crate::metadata::access::{downcast, downcast_mut};
use crate::metadata::{ClassMetadata, IdStrategy, MetadataProvider};
use crate::store::DocumentStore;
use crate::types::TypeRegistry;

pub use crate::error::ConflictedDocument;
pub use hydrate::HydrationHints;
pub use identity_map::{DocHandle, DocumentState};

use identity_map::{IdentityMap, Slot};

/// Tracks documents for one logical session and writes their changes.
///
/// Not thread-safe: use one unit of work per request or session.
pub struct UnitOfWork {
    metadata: Arc<dyn MetadataProvider>,
    store: Arc<dyn DocumentStore>,
    types: Arc<TypeRegistry>,
    config: Configuration,
    hooks: HookDispatcher,
    assigned_ids: AssignedIdGenerator,
    batch_ids: StoreBatchIdGenerator,
    identity_map: IdentityMap,
    scheduled_inserts: BTreeSet<DocHandle>,
    scheduled_updates: BTreeSet<DocHandle>,
    scheduled_removals: BTreeSet<DocHandle>,
    /// Owning collections seen by change detection, snapshotted after flush.
    visited_collections: BTreeSet<(DocHandle, usize)>,
    /// Store existence of assigned identifiers, when probes are cached.
    existence_probes: HashMap<String, bool>,
}

impl UnitOfWork {
    pub fn new(metadata: Arc<dyn MetadataProvider>, store: Arc<dyn DocumentStore>) -> Self {
        let config = Configuration::default();
        Self {
            metadata,
            store,
            types: Arc::new(TypeRegistry::with_defaults()),
            batch_ids: StoreBatchIdGenerator::new(config.uuid_batch_size),
            config,
            hooks: HookDispatcher::new(),
            assigned_ids: AssignedIdGenerator,
            identity_map: IdentityMap::default(),
            scheduled_inserts: BTreeSet::new(),
            scheduled_updates: BTreeSet::new(),
            scheduled_removals: BTreeSet::new(),
            visited_collections: BTreeSet::new(),
            existence_probes: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: Configuration) -> Self {
        self.batch_ids = StoreBatchIdGenerator::new(config.uuid_batch_size);
        self.config = config;
        self
    }

    pub fn with_types(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    pub fn with_hooks(mut self, hooks: HookDispatcher) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Hand a new application object to the session. It stays NEW, and
    /// untracked, until persisted.
    ///
    /// The handle keeps its slot until [`forget`](Self::forget) or
    /// [`clear`](Self::clear), even when the object is never persisted.
    pub fn add<T: Any>(&mut self, document: T) -> Result<DocHandle> {
        let class = self.metadata.metadata_for_type(TypeId::of::<T>())?;
        if class.is_embedded() {
            return Err(OdmError::InvalidMapping {
                class: class.name().to_string(),
                reason: "embedded classes cannot be tracked on their own".into(),
            });
        }
        Ok(self
            .identity_map
            .insert(Slot::new(class, Box::new(document), DocumentState::New)))
    }

    /// Whether the document is managed by this session.
    pub fn contains(&self, handle: DocHandle) -> bool {
        self.identity_map
            .slot(handle)
            .is_ok_and(|slot| slot.state == DocumentState::Managed)
    }

    /// The managed document with identifier `id`, if any.
    pub fn try_get_by_id(&self, id: &str) -> Option<DocHandle> {
        self.identity_map.lookup(id)
    }

    /// Number of documents in the identity map.
    pub fn size(&self) -> usize {
        self.identity_map.len()
    }

    /// Lifecycle state of a document.
    ///
    /// An untracked object that carries an identifier is DETACHED when that
    /// identifier is already managed or exists in the store, NEW otherwise.
    pub fn document_state(&mut self, handle: DocHandle) -> Result<DocumentState> {
        let slot = self.identity_map.slot(handle)?;
        if slot.state != DocumentState::New {
            return Ok(slot.state);
        }
        let Some(id) = self.current_identifier(handle)? else {
            return Ok(DocumentState::New);
        };
        if self.identity_map.lookup(&id).is_some() {
            return Ok(DocumentState::Detached);
        }
        if self.config.cache_existence_probes {
            if let Some(exists) = self.existence_probes.get(&id) {
                return Ok(state_for_existence(*exists));
            }
        }

        trace!(%id, "probing store for assigned identifier");
        let response = self.store.find_one(&id)?;
        let exists = match response.status {
            404 => false,
            status if status >= 400 => {
                return Err(OdmError::Transport {
                    status,
                    reason: response.reason(),
                })
            }
            _ => true,
        };
        if self.config.cache_existence_probes {
            self.existence_probes.insert(id, exists);
        }
        Ok(state_for_existence(exists))
    }

    /// Identifier of a document: the managed identifier, or the one set on
    /// the object by the application.
    pub fn identifier(&self, handle: DocHandle) -> Option<String> {
        self.current_identifier(handle).ok().flatten()
    }

    /// Revision token of the last load or write.
    pub fn revision(&self, handle: DocHandle) -> Option<String> {
        self.identity_map
            .slot(handle)
            .ok()
            .and_then(|slot| slot.revision.clone())
    }

    pub fn class_name(&self, handle: DocHandle) -> Option<&str> {
        self.identity_map
            .slot(handle)
            .ok()
            .map(|slot| slot.class.name())
    }

    /// Whether the document's data has been loaded.
    pub fn is_initialized(&self, handle: DocHandle) -> bool {
        self.identity_map
            .slot(handle)
            .is_ok_and(|slot| slot.initialized)
    }

    pub fn is_scheduled_for_insert(&self, handle: DocHandle) -> bool {
        self.scheduled_inserts.contains(&handle)
    }

    pub fn is_scheduled_for_update(&self, handle: DocHandle) -> bool {
        self.scheduled_updates.contains(&handle)
    }

    pub fn is_scheduled_for_removal(&self, handle: DocHandle) -> bool {
        self.scheduled_removals.contains(&handle)
    }

    /// Release the slot of an object the session does not manage: a new,
    /// detached or deleted one. Its handle is unknown afterwards.
    pub fn forget(&mut self, handle: DocHandle) -> Result<()> {
        match self.identity_map.slot(handle)?.state {
            DocumentState::Managed | DocumentState::Removed => Err(OdmError::StillManaged(handle)),
            DocumentState::New | DocumentState::Detached => {
                self.identity_map.remove(handle)?;
                trace!(handle = %handle, "forgot document");
                Ok(())
            }
        }
    }

    /// Forget every document, snapshot and scheduled operation.
    pub fn clear(&mut self) {
        debug!(documents = self.identity_map.len(), "clearing unit of work");
        self.identity_map.clear();
        self.scheduled_inserts.clear();
        self.scheduled_updates.clear();
        self.scheduled_removals.clear();
        self.visited_collections.clear();
        self.existence_probes.clear();
    }

    // ========================================================================
    // Typed access
    // ========================================================================

    /// Shared access to a document, loading a lazy reference first.
    pub fn get<T: Any>(&mut self, handle: DocHandle) -> Result<&T> {
        self.ensure_initialized(handle)?;
        downcast::<T>(self.object(handle)?)
    }

    /// Mutable access to a document, loading a lazy reference first.
    pub fn get_mut<T: Any>(&mut self, handle: DocHandle) -> Result<&mut T> {
        self.ensure_initialized(handle)?;
        downcast_mut::<T>(self.object_mut(handle)?)
    }

    /// Shared access without loading. A lazy reference shows its identifier only.
    pub fn peek<T: Any>(&self, handle: DocHandle) -> Result<&T> {
        downcast::<T>(self.object(handle)?)
    }

    // ========================================================================
    // Internals shared by the submodules
    // ========================================================================

    fn object(&self, handle: DocHandle) -> Result<&dyn Any> {
        self.identity_map
            .slot(handle)?
            .object
            .as_deref()
            .ok_or(OdmError::DocumentBorrowed(handle))
    }

    fn object_mut(&mut self, handle: DocHandle) -> Result<&mut dyn Any> {
        self.identity_map
            .slot_mut(handle)?
            .object
            .as_deref_mut()
            .ok_or(OdmError::DocumentBorrowed(handle))
    }

    fn class_of(&self, handle: DocHandle) -> Result<Arc<ClassMetadata>> {
        Ok(Arc::clone(&self.identity_map.slot(handle)?.class))
    }

    fn serializer(&self) -> EmbeddedSerializer<'_> {
        EmbeddedSerializer::new(&*self.metadata, &self.types, &self.config.type_field)
    }

    fn current_identifier(&self, handle: DocHandle) -> Result<Option<String>> {
        let slot = self.identity_map.slot(handle)?;
        if let Some(id) = &slot.id {
            return Ok(Some(id.clone()));
        }
        let Some(identifier) = &slot.class.identifier else {
            return Ok(None);
        };
        let object = slot
            .object
            .as_deref()
            .ok_or(OdmError::DocumentBorrowed(handle))?;
        Ok(identifier
            .get(object)?
            .clone()
            .filter(|id| !id.is_empty()))
    }

    fn write_identifier(&mut self, handle: DocHandle, id: &str) -> Result<()> {
        let class = self.class_of(handle)?;
        if let Some(identifier) = &class.identifier {
            *identifier.get_mut(self.object_mut(handle)?)? = Some(id.to_string());
        }
        Ok(())
    }

    fn write_version(&mut self, handle: DocHandle, revision: Option<&str>) -> Result<()> {
        let class = self.class_of(handle)?;
        if let Some(version) = &class.version {
            *version.get_mut(self.object_mut(handle)?)? = revision.map(str::to_string);
        }
        Ok(())
    }

    /// Move a NEW document into the managed state.
    fn persist_new(&mut self, handle: DocHandle) -> Result<()> {
        self.fire(LifecycleEvent::PrePersist, Some(handle))?;

        let class = self.class_of(handle)?;
        let current = self.current_identifier(handle)?;
        let id = match class.id_strategy() {
            IdStrategy::Assigned => {
                self.assigned_ids
                    .generate(&class, current.as_deref(), &*self.store)?
            }
            IdStrategy::StoreBatch => {
                self.batch_ids
                    .generate(&class, current.as_deref(), &*self.store)?
            }
        };

        self.identity_map.register(&id, handle)?;
        self.write_identifier(handle, &id)?;
        let slot = self.identity_map.slot_mut(handle)?;
        slot.id = Some(id.clone());
        slot.state = DocumentState::Managed;
        slot.revision = None;
        slot.original = None;
        slot.initialized = true;
        self.scheduled_inserts.insert(handle);
        trace!(%id, class = class.name(), "scheduled insert");
        Ok(())
    }

    /// Move a MANAGED document into the removed state.
    fn schedule_remove(&mut self, handle: DocHandle) -> Result<()> {
        self.scheduled_inserts.remove(&handle);
        self.scheduled_updates.remove(&handle);
        self.scheduled_removals.insert(handle);
        self.identity_map.slot_mut(handle)?.state = DocumentState::Removed;
        Ok(())
    }

    /// Drop a document from the identity map after it was deleted or vanished.
    fn purge(&mut self, handle: DocHandle) -> Result<()> {
        self.scheduled_inserts.remove(&handle);
        self.scheduled_updates.remove(&handle);
        self.scheduled_removals.remove(&handle);
        let slot = self.identity_map.slot_mut(handle)?;
        let id = slot.id.take();
        slot.reset_tracking();
        slot.state = DocumentState::New;
        if let Some(id) = id {
            if self.identity_map.lookup(&id) == Some(handle) {
                self.identity_map.unregister(&id);
            }
        }
        Ok(())
    }

    /// Call the listeners of `event`, lending them the document.
    fn fire(&mut self, event: LifecycleEvent, handle: Option<DocHandle>) -> Result<()> {
        if !self.hooks.has_listeners(event) {
            return Ok(());
        }
        let hooks = self.hooks.clone();
        let mut object = match handle {
            Some(handle) => Some(
                self.identity_map
                    .slot_mut(handle)?
                    .object
                    .take()
                    .ok_or(OdmError::DocumentBorrowed(handle))?,
            ),
            None => None,
        };

        {
            let mut args = LifecycleEventArgs {
                event,
                handle,
                document: object.as_deref_mut(),
                session: &*self,
            };
            hooks.dispatch(&mut args);
        }

        if let (Some(handle), Some(object)) = (handle, object) {
            self.identity_map.slot_mut(handle)?.object = Some(object);
        }
        Ok(())
    }

    fn warn_vanished(&self, id: &str) {
        warn!(%id, "document no longer exists in the store");
    }
}

fn state_for_existence(exists: bool) -> DocumentState {
    if exists {
        DocumentState::Detached
    } else {
        DocumentState::New
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("managed", &self.identity_map.len())
            .field("scheduled_inserts", &self.scheduled_inserts.len())
            .field("scheduled_updates", &self.scheduled_updates.len())
            .field("scheduled_removals", &self.scheduled_removals.len())
            .field("config", &self.config)
            .finish()
    }
}
