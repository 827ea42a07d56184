//! Object-document mapper core for CouchDB-style document stores.
//!
//! A [`UnitOfWork`] tracks the documents of one session. Loaded documents
//! are unique per identifier, changes are detected against snapshots, and
//! `flush` writes every insert, update and delete in one bulk request.
//! Classes are mapped with [`ClassMetadata`] builders; the store is reached
//! through the [`DocumentStore`] trait.

mod attachment;
mod collection;
mod config;
mod embedded;
mod error;
mod id_generator;

pub mod hooks;
pub mod metadata;
pub mod store;
pub mod types;
pub mod unit_of_work;

pub use attachment::{Attachment, Attachments};
pub use collection::PersistentCollection;
pub use config::Configuration;
pub use embedded::{
    DynEmbedded, EmbedCardinality, EmbedField, Embeddable, EmbeddedSerializer, EmbeddedValue,
    EmbeddedView,
};
pub use error::{CascadeOp, ConflictedDocument, OdmError, Result};
pub use hooks::{
    ConflictEventArgs, ConflictResolution, HookDispatcher, LifecycleEvent, LifecycleEventArgs,
};
pub use id_generator::{AssignedIdGenerator, IdGenerator, StoreBatchIdGenerator};
pub use metadata::{
    AssociationKind, AssociationMapping, Cascade, ClassKind, ClassMetadata, ClassMetadataBuilder,
    Embed, EmbeddedMapping, Field, FieldMapping, IdStrategy, MetadataProvider, MetadataRegistry,
    Reference,
};
pub use store::{
    BulkEntry, BulkResponse, BulkResult, DocumentStore, InMemoryDocumentStore, RowsResponse,
    StoreResponse, StoreRow, SubmittedBatch,
};
pub use types::{ConvertType, FieldType, TypeRegistry, Value};
pub use unit_of_work::{DocHandle, DocumentState, HydrationHints, UnitOfWork};

#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
#[cfg(feature = "emitter")]
pub use hooks::EmitterBridge;
