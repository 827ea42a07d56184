mod support;

use serde_json::json;
use settee::{CascadeOp, DocumentState, InMemoryDocumentStore, OdmError};
use support::{session, Group, User};

fn seed_article(store: &InMemoryDocumentStore) {
    store
        .put_raw(json!({"_id": "a1", "type": "Article", "title": "Hello"}))
        .unwrap();
    for id in ["c1", "c2"] {
        store
            .put_raw(json!({"_id": id, "type": "Comment", "body": id, "article": "a1"}))
            .unwrap();
    }
}

fn seed_user(store: &InMemoryDocumentStore) {
    store
        .put_raw(json!({"_id": "u1", "type": "User", "name": "Ann", "age": 30}))
        .unwrap();
}

#[test]
fn removal_cascades_to_inverse_collections() {
    let store = InMemoryDocumentStore::new();
    seed_article(&store);
    let mut uow = session(&store);

    let article = uow.find("Article", "a1").unwrap().unwrap();
    uow.remove(article).unwrap();
    assert!(uow.is_scheduled_for_removal(article));
    let c1 = uow.try_get_by_id("c1").unwrap();
    assert_eq!(uow.document_state(c1).unwrap(), DocumentState::Removed);

    uow.flush().unwrap();

    let batches = store.batches().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].deletes().count(), 3);
    assert_eq!(batches[0].upserts().count(), 0);
    assert!(store.is_empty().unwrap());
    assert_eq!(uow.size(), 0);
}

#[test]
fn removing_a_lazy_reference_reads_its_revision_at_flush() {
    let store = InMemoryDocumentStore::new();
    seed_user(&store);
    let mut uow = session(&store);

    let user = uow.reference("User", "u1").unwrap();
    uow.remove(user).unwrap();
    assert_eq!(store.read_count(), 0);

    uow.flush().unwrap();
    assert_eq!(store.read_count(), 1);
    assert_eq!(store.raw("u1").unwrap(), None);
    assert!(!uow.contains(user));
}

#[test]
fn references_to_removed_documents_abort_the_flush() {
    let store = InMemoryDocumentStore::new();
    store
        .put_raw(json!({"_id": "u1", "type": "User", "name": "Ann", "manager": "boss"}))
        .unwrap();
    store
        .put_raw(json!({"_id": "boss", "type": "User", "name": "Bo"}))
        .unwrap();
    let mut uow = session(&store);

    let user = uow.find("User", "u1").unwrap().unwrap();
    let boss = uow.peek::<User>(user).unwrap().manager.unwrap();
    uow.remove(boss).unwrap();

    assert!(matches!(
        uow.flush(),
        Err(OdmError::RemovedDocumentReferenced { ref class, ref field })
            if class == "User" && field == "manager"
    ));
    assert!(store.batches().unwrap().is_empty());
    assert!(store.raw("boss").unwrap().is_some());
}

#[test]
fn refresh_discards_local_changes() {
    let store = InMemoryDocumentStore::new();
    seed_user(&store);
    let mut uow = session(&store);

    let user = uow.find("User", "u1").unwrap().unwrap();
    {
        let ann = uow.get_mut::<User>(user).unwrap();
        ann.name = "Changed".into();
        ann.age = None;
    }
    uow.refresh(user).unwrap();

    let ann = uow.get::<User>(user).unwrap();
    assert_eq!(ann.name, "Ann");
    assert_eq!(ann.age, Some(30));
    uow.flush().unwrap();
    assert!(store.batches().unwrap().is_empty());
}

#[test]
fn refreshing_a_deleted_document_forgets_it() {
    let store = InMemoryDocumentStore::new();
    seed_user(&store);
    let mut uow = session(&store);
    let user = uow.find("User", "u1").unwrap().unwrap();

    let mut other = session(&store);
    let copy = other.find("User", "u1").unwrap().unwrap();
    other.remove(copy).unwrap();
    other.flush().unwrap();

    assert!(matches!(
        uow.refresh(user),
        Err(OdmError::DocumentNotFound { ref id }) if id == "u1"
    ));
    assert_eq!(uow.try_get_by_id("u1"), None);
}

#[test]
fn only_managed_documents_can_be_refreshed() {
    let store = InMemoryDocumentStore::new();
    let mut uow = session(&store);
    let user = uow.add(User::new("u1", "Ann")).unwrap();

    assert!(matches!(
        uow.refresh(user),
        Err(OdmError::InvalidCascadeState {
            operation: CascadeOp::Refresh,
            state: DocumentState::New,
        })
    ));
}

#[test]
fn detached_documents_are_not_written() {
    let store = InMemoryDocumentStore::new();
    seed_user(&store);
    let mut uow = session(&store);

    let user = uow.find("User", "u1").unwrap().unwrap();
    uow.get_mut::<User>(user).unwrap().name = "Changed".into();
    uow.detach(user).unwrap();

    assert!(!uow.contains(user));
    assert_eq!(uow.try_get_by_id("u1"), None);
    uow.flush().unwrap();
    assert!(store.batches().unwrap().is_empty());
    assert_eq!(store.raw("u1").unwrap().unwrap()["name"], "Ann");
}

#[test]
fn merge_copies_detached_state_onto_the_managed_document() {
    let store = InMemoryDocumentStore::new();
    seed_user(&store);
    let mut uow = session(&store);
    let managed = uow.find("User", "u1").unwrap().unwrap();
    let rev = uow.revision(managed).unwrap();

    let mut copy = User::new("u1", "Ann Updated");
    copy.rev = Some(rev);
    copy.age = Some(31);
    let copy = uow.add(copy).unwrap();
    assert_eq!(uow.document_state(copy).unwrap(), DocumentState::Detached);

    let merged = uow.merge(copy).unwrap();
    assert_eq!(merged, managed);
    assert_eq!(uow.get::<User>(managed).unwrap().name, "Ann Updated");

    uow.flush().unwrap();
    let stored = store.raw("u1").unwrap().unwrap();
    assert_eq!(stored["name"], "Ann Updated");
    assert_eq!(stored["age"], 31);
}

#[test]
fn merge_rejects_stale_revisions() {
    let store = InMemoryDocumentStore::new();
    seed_user(&store);
    let mut uow = session(&store);
    uow.find("User", "u1").unwrap().unwrap();

    let mut copy = User::new("u1", "Stale");
    copy.rev = Some("1-bogus".into());
    let copy = uow.add(copy).unwrap();

    assert!(matches!(
        uow.merge(copy),
        Err(OdmError::RevisionMismatch { ref id, .. }) if id == "u1"
    ));
}

#[test]
fn merging_a_new_document_creates_a_managed_copy() {
    let store = InMemoryDocumentStore::new();
    let mut uow = session(&store);

    let draft = uow.add(Group::new("ops")).unwrap();
    let managed = uow.merge(draft).unwrap();

    assert_ne!(managed, draft);
    assert!(uow.is_scheduled_for_insert(managed));
    assert!(!uow.contains(draft));
    assert_eq!(uow.get::<Group>(managed).unwrap().name, "ops");

    uow.flush().unwrap();
    let id = uow.identifier(managed).unwrap();
    assert_eq!(store.raw(&id).unwrap().unwrap()["name"], "ops");
}

#[test]
fn merge_cascades_into_flagged_collections() {
    let store = InMemoryDocumentStore::new();
    let mut uow = session(&store);

    let group = uow.add(Group::new("admins")).unwrap();
    let mut user = User::new("u1", "Ann");
    user.groups.push(group);
    let draft = uow.add(user).unwrap();

    let managed = uow.merge(draft).unwrap();
    let groups: Vec<_> = uow.peek::<User>(managed).unwrap().groups.raw_iter().collect();
    assert_eq!(groups.len(), 1);
    assert_ne!(groups[0], group);
    assert!(uow.is_scheduled_for_insert(groups[0]));

    uow.flush().unwrap();
    assert_eq!(store.len().unwrap(), 2);
}
