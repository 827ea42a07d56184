#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use settee::{
    Attachments, Cascade, ClassMetadata, DocHandle, Embed, Embeddable, HookDispatcher,
    IdStrategy, InMemoryDocumentStore, LifecycleEvent, MetadataRegistry, PersistentCollection,
    Reference, TypeRegistry, UnitOfWork,
};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Address {
    pub street: String,
    pub city: String,
}

impl Embeddable for Address {}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Phone {
    pub number: String,
}

impl Embeddable for Phone {}

/// Assigned identifiers, versioned, with embeds, references and attachments.
#[derive(Default)]
pub struct User {
    pub id: Option<String>,
    pub rev: Option<String>,
    pub name: String,
    pub age: Option<i64>,
    pub address: Option<Address>,
    pub phones: Vec<Phone>,
    pub manager: Option<DocHandle>,
    pub groups: PersistentCollection,
    pub avatar: Attachments,
}

impl User {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Identifiers generated by the store.
#[derive(Default)]
pub struct Group {
    pub id: Option<String>,
    pub name: String,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

/// Self-referencing, cascades everything.
#[derive(Default)]
pub struct Node {
    pub id: Option<String>,
    pub label: String,
    pub next: Option<DocHandle>,
}

impl Node {
    pub fn new(label: &str) -> Self {
        Self {
            id: None,
            label: label.to_string(),
            next: None,
        }
    }
}

/// Owns its comments through the inverse side.
#[derive(Default)]
pub struct Article {
    pub id: Option<String>,
    pub title: String,
    pub comments: PersistentCollection,
}

#[derive(Default)]
pub struct Comment {
    pub id: Option<String>,
    pub body: String,
    pub article: Option<DocHandle>,
}

pub fn metadata() -> MetadataRegistry {
    let mut registry = MetadataRegistry::new();
    let classes = [
        ClassMetadata::embedded::<Address>("Address")
            .field("street", |a| &a.street, |a| &mut a.street)
            .field("city", |a| &a.city, |a| &mut a.city)
            .build(),
        ClassMetadata::embedded::<Phone>("Phone")
            .field("number", |p| &p.number, |p| &mut p.number)
            .build(),
        ClassMetadata::document::<User>("User")
            .identifier(|u| &u.id, |u| &mut u.id)
            .id_strategy(IdStrategy::Assigned)
            .version(|u| &u.rev, |u| &mut u.rev)
            .field("name", |u| &u.name, |u| &mut u.name)
            .field("age", |u| &u.age, |u| &mut u.age)
            .embed(Embed::new("address").target("Address"), |u| &u.address, |u| &mut u.address)
            .embed(Embed::new("phones").target("Phone"), |u| &u.phones, |u| &mut u.phones)
            .reference_one(
                Reference::new("manager").target("User"),
                |u| &u.manager,
                |u| &mut u.manager,
            )
            .reference_many(
                Reference::new("groups")
                    .target("Group")
                    .cascade(Cascade::PERSIST | Cascade::MERGE | Cascade::DETACH),
                |u| &u.groups,
                |u| &mut u.groups,
            )
            .attachments(|u| &u.avatar, |u| &mut u.avatar)
            .build(),
        ClassMetadata::document::<Group>("Group")
            .identifier(|g| &g.id, |g| &mut g.id)
            .field("name", |g| &g.name, |g| &mut g.name)
            .build(),
        ClassMetadata::document::<Node>("Node")
            .identifier(|n| &n.id, |n| &mut n.id)
            .field("label", |n| &n.label, |n| &mut n.label)
            .reference_one(
                Reference::new("next").target("Node").cascade(Cascade::ALL),
                |n| &n.next,
                |n| &mut n.next,
            )
            .build(),
        ClassMetadata::document::<Article>("Article")
            .identifier(|a| &a.id, |a| &mut a.id)
            .id_strategy(IdStrategy::Assigned)
            .field("title", |a| &a.title, |a| &mut a.title)
            .reference_many(
                Reference::new("comments")
                    .target("Comment")
                    .mapped_by("article")
                    .cascade(Cascade::ALL),
                |a| &a.comments,
                |a| &mut a.comments,
            )
            .build(),
        ClassMetadata::document::<Comment>("Comment")
            .identifier(|c| &c.id, |c| &mut c.id)
            .id_strategy(IdStrategy::Assigned)
            .field("body", |c| &c.body, |c| &mut c.body)
            .reference_one(
                Reference::new("article").target("Article"),
                |c| &c.article,
                |c| &mut c.article,
            )
            .build(),
    ];
    for class in classes {
        registry.register(class.expect("valid mapping")).expect("unique class");
    }
    registry
        .validate(&TypeRegistry::with_defaults())
        .expect("consistent mappings");
    registry
}

pub fn session(store: &InMemoryDocumentStore) -> UnitOfWork {
    UnitOfWork::new(Arc::new(metadata()), Arc::new(store.clone()))
}

/// Records the name of every lifecycle event, with the document identifier when there is one.
pub fn record_events(hooks: &HookDispatcher) -> Rc<RefCell<Vec<String>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    for event in LifecycleEvent::ALL {
        let sink = Rc::clone(&seen);
        hooks.on(event, move |args| {
            let entry = match args.handle.and_then(|handle| args.session.identifier(handle)) {
                Some(id) => format!("{}:{id}", event.name()),
                None => event.name().to_string(),
            };
            sink.borrow_mut().push(entry);
        });
    }
    seen
}
