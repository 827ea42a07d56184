use crate::unit_of_work::DocHandle;

/// Where a not-yet-initialized collection loads its members from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingLoad {
    /// Owning side: identifiers stored in the owner document.
    Ids(Vec<String>),
    /// Inverse side: documents whose `mapped_by` field references `owner_id`.
    Inverse { mapped_by: String, owner_id: String },
}

/// The to-many association type.
///
/// A collection hydrated from the store starts uninitialized and is filled
/// by the unit of work on first access through
/// [`UnitOfWork::collection_items`](crate::UnitOfWork::collection_items).
/// [`raw_iter`](Self::raw_iter) never loads.
///
/// Before initialization, [`len`](Self::len), [`contains`](Self::contains)
/// and [`is_empty`](Self::is_empty) only see members added in this session.
/// [`clear`](Self::clear) and [`remove`](Self::remove) still apply to the
/// stored members: they are dropped from the written document and from the
/// members loaded later.
///
/// Dirtiness is tracked against the snapshot taken at load or flush time.
/// A collection that was never snapshotted is always dirty.
#[derive(Debug, Clone, Default)]
pub struct PersistentCollection {
    items: Vec<DocHandle>,
    snapshot: Vec<DocHandle>,
    pending: Option<PendingLoad>,
    removed: Vec<DocHandle>,
    tracked: bool,
}

impl PersistentCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection that loads its members on first access.
    pub(crate) fn lazy(pending: PendingLoad) -> Self {
        Self {
            items: Vec::new(),
            snapshot: Vec::new(),
            pending: Some(pending),
            removed: Vec::new(),
            tracked: true,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.pending.is_none()
    }

    /// Members known so far, without loading.
    pub fn raw_iter(&self) -> impl Iterator<Item = DocHandle> + '_ {
        self.items.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, handle: DocHandle) -> bool {
        self.items.contains(&handle)
    }

    pub fn push(&mut self, handle: DocHandle) {
        self.removed.retain(|h| *h != handle);
        self.items.push(handle);
    }

    /// Remove the first occurrence of `handle`. Returns whether it was among
    /// the members seen so far.
    ///
    /// On an uninitialized collection the removal is also remembered, so a
    /// stored member is left out of the next write and of the loaded members.
    pub fn remove(&mut self, handle: DocHandle) -> bool {
        if self.pending.is_some() && !self.removed.contains(&handle) {
            self.removed.push(handle);
        }
        match self.items.iter().position(|h| *h == handle) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Drop every member, including stored ones that were never loaded.
    pub fn clear(&mut self) {
        self.items.clear();
        self.removed.clear();
        if self.pending.take().is_some() {
            self.tracked = false;
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.tracked || !self.removed.is_empty() || self.items != self.snapshot
    }

    /// Mark the current members as the clean state.
    pub fn take_snapshot(&mut self) {
        self.snapshot = self.items.clone();
        self.removed.clear();
        self.tracked = true;
    }

    pub(crate) fn pending(&self) -> Option<&PendingLoad> {
        self.pending.as_ref()
    }

    /// Members removed before initialization.
    pub(crate) fn removed(&self) -> &[DocHandle] {
        &self.removed
    }

    /// Forget stored identifiers whose removal was written.
    pub(crate) fn prune_pending(&mut self, ids: &[String]) {
        if let Some(PendingLoad::Ids(pending)) = &mut self.pending {
            pending.retain(|id| !ids.contains(id));
        }
    }

    /// Merge loaded members in front of members added before initialization.
    /// Members removed before initialization are left out.
    pub(crate) fn complete_load(&mut self, loaded: Vec<DocHandle>) {
        self.pending = None;
        let added = std::mem::take(&mut self.items);
        let removed = std::mem::take(&mut self.removed);
        self.snapshot = loaded.clone();
        self.items = loaded;
        self.items.retain(|h| !removed.contains(h));
        for handle in added {
            if !self.items.contains(&handle) {
                self.items.push(handle);
            }
        }
    }
}

impl From<Vec<DocHandle>> for PersistentCollection {
    fn from(items: Vec<DocHandle>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }
}

impl FromIterator<DocHandle> for PersistentCollection {
    fn from_iter<I: IntoIterator<Item = DocHandle>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_collections_are_dirty_until_snapshotted() {
        let mut coll = PersistentCollection::from(vec![DocHandle(1)]);
        assert!(coll.is_dirty());
        coll.take_snapshot();
        assert!(!coll.is_dirty());

        coll.push(DocHandle(2));
        assert!(coll.is_dirty());
        coll.remove(DocHandle(2));
        assert!(!coll.is_dirty());
    }

    #[test]
    fn lazy_collection_merges_early_additions() {
        let mut coll = PersistentCollection::lazy(PendingLoad::Ids(vec!["a".into()]));
        assert!(!coll.is_initialized());
        assert!(!coll.is_dirty());

        coll.push(DocHandle(9));
        coll.complete_load(vec![DocHandle(3)]);
        assert!(coll.is_initialized());
        assert_eq!(coll.raw_iter().collect::<Vec<_>>(), vec![DocHandle(3), DocHandle(9)]);
        assert!(coll.is_dirty());
    }

    #[test]
    fn clearing_an_unloaded_collection_makes_it_dirty() {
        let mut coll = PersistentCollection::lazy(PendingLoad::Ids(vec!["a".into()]));
        coll.clear();
        assert!(coll.is_initialized());
        assert!(coll.is_dirty());

        coll.take_snapshot();
        assert!(!coll.is_dirty());
    }

    #[test]
    fn removals_before_load_are_applied_on_load() {
        let mut coll = PersistentCollection::lazy(PendingLoad::Ids(vec!["a".into(), "b".into()]));
        assert!(!coll.remove(DocHandle(3)));
        assert!(coll.is_dirty());

        coll.complete_load(vec![DocHandle(3), DocHandle(4)]);
        assert_eq!(coll.raw_iter().collect::<Vec<_>>(), vec![DocHandle(4)]);
        assert!(coll.is_dirty());

        let mut coll = PersistentCollection::lazy(PendingLoad::Ids(vec!["a".into(), "b".into()]));
        coll.remove(DocHandle(3));
        coll.prune_pending(&["a".to_string()]);
        coll.take_snapshot();
        assert!(!coll.is_dirty());
        assert_eq!(coll.pending(), Some(&PendingLoad::Ids(vec!["b".into()])));
    }
}
