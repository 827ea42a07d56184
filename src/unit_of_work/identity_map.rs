use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::attachment::Attachments;
use crate::error::{OdmError, Result};
use crate::metadata::ClassMetadata;
use crate::types::Value;

/// Stable handle of an object known to a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocHandle(pub(crate) u64);

impl fmt::Display for DocHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentState {
    /// Created by the application and not tracked yet.
    New,
    /// Tracked; changes are written on flush.
    Managed,
    /// Scheduled for deletion on the next flush.
    Removed,
    /// Was managed, no longer tracked.
    Detached,
}

/// Field values captured at load or write time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Snapshot {
    /// Parallel to `ClassMetadata::fields`.
    pub(crate) fields: Vec<Value>,
    /// Parallel to `ClassMetadata::associations`; `None` for to-many.
    pub(crate) references: Vec<Option<DocHandle>>,
    pub(crate) attachments: Option<Attachments>,
}

pub(crate) struct Slot {
    pub(crate) class: Arc<ClassMetadata>,
    /// `None` while lent to a lifecycle listener.
    pub(crate) object: Option<Box<dyn Any>>,
    pub(crate) state: DocumentState,
    pub(crate) id: Option<String>,
    pub(crate) revision: Option<String>,
    /// `false` for lazy references that have not been loaded.
    pub(crate) initialized: bool,
    pub(crate) original: Option<Snapshot>,
    /// JSON form of each embedded field, keyed by field name.
    pub(crate) embedded_originals: HashMap<String, Json>,
    /// Unmapped keys of the stored document, written back verbatim.
    pub(crate) pass_through: Map<String, Json>,
}

impl Slot {
    pub(crate) fn new(
        class: Arc<ClassMetadata>,
        object: Box<dyn Any>,
        state: DocumentState,
    ) -> Self {
        Self {
            class,
            object: Some(object),
            state,
            id: None,
            revision: None,
            initialized: true,
            original: None,
            embedded_originals: HashMap::new(),
            pass_through: Map::new(),
        }
    }

    /// Forget everything learned from the store.
    pub(crate) fn reset_tracking(&mut self) {
        self.id = None;
        self.revision = None;
        self.original = None;
        self.embedded_originals.clear();
        self.pass_through.clear();
        self.initialized = true;
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("class", &self.class.name())
            .field("state", &self.state)
            .field("id", &self.id)
            .field("revision", &self.revision)
            .field("initialized", &self.initialized)
            .field("lent", &self.object.is_none())
            .finish()
    }
}

/// Slot table plus the identifier index of managed documents.
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    slots: BTreeMap<DocHandle, Slot>,
    by_id: HashMap<String, DocHandle>,
    next: u64,
}

impl IdentityMap {
    pub(crate) fn insert(&mut self, slot: Slot) -> DocHandle {
        self.next += 1;
        let handle = DocHandle(self.next);
        self.slots.insert(handle, slot);
        handle
    }

    pub(crate) fn slot(&self, handle: DocHandle) -> Result<&Slot> {
        self.slots.get(&handle).ok_or(OdmError::UnknownHandle(handle))
    }

    pub(crate) fn slot_mut(&mut self, handle: DocHandle) -> Result<&mut Slot> {
        self.slots
            .get_mut(&handle)
            .ok_or(OdmError::UnknownHandle(handle))
    }

    pub(crate) fn contains_handle(&self, handle: DocHandle) -> bool {
        self.slots.contains_key(&handle)
    }

    /// Drop a slot. The caller makes sure it is not indexed.
    pub(crate) fn remove(&mut self, handle: DocHandle) -> Result<Slot> {
        self.slots.remove(&handle).ok_or(OdmError::UnknownHandle(handle))
    }

    /// Index `handle` under `id`. Fails if another slot owns the identifier.
    pub(crate) fn register(&mut self, id: &str, handle: DocHandle) -> Result<()> {
        match self.by_id.get(id) {
            Some(existing) if *existing != handle => Err(OdmError::IdentifierCollision {
                id: id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.by_id.insert(id.to_string(), handle);
                Ok(())
            }
        }
    }

    pub(crate) fn unregister(&mut self, id: &str) {
        self.by_id.remove(id);
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<DocHandle> {
        self.by_id.get(id).copied()
    }

    /// Handles of every indexed document, in creation order.
    pub(crate) fn indexed_handles(&self) -> Vec<DocHandle> {
        let mut handles: Vec<DocHandle> = self.by_id.values().copied().collect();
        handles.sort();
        handles
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Drop every slot. Handles are never reused.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.by_id.clear();
    }
}
