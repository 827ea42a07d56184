//! Metadata - Static, per-class description of how a Rust struct maps to a document.
//!
//! Metadata is built once per class with [`ClassMetadata::document`] or
//! [`ClassMetadata::embedded`] and registered in a [`MetadataRegistry`].
//! The registry is read-only afterwards and shared between units of work.
//!
//! ## Example
//!
//! ```ignore
//! #[derive(Default)]
//! struct User {
//!     id: Option<String>,
//!     name: String,
//!     manager: Option<DocHandle>,
//! }
//!
//! let user = ClassMetadata::document::<User>("User")
//!     .identifier(|u| &u.id, |u| &mut u.id)
//!     .field("name", |u| &u.name, |u| &mut u.name)
//!     .reference_one(
//!         Reference::new("manager").target("User").cascade(Cascade::PERSIST),
//!         |u| &u.manager,
//!         |u| &mut u.manager,
//!     )
//!     .build()?;
//!
//! let mut registry = MetadataRegistry::new();
//! registry.register(user)?;
//! ```

pub(crate) mod access;
mod builder;
mod registry;

use std::any::{Any, TypeId};
use std::fmt;
use std::ops::BitOr;

use crate::attachment::Attachments;
use crate::collection::PersistentCollection;
use crate::embedded::EmbedCardinality;
use crate::error::CascadeOp;
use crate::unit_of_work::DocHandle;

use access::{Accessor, EmbedAccess, ScalarAccess};

pub use builder::{ClassMetadataBuilder, Embed, Field, Reference};
pub use registry::{MetadataProvider, MetadataRegistry};

/// Whether a class maps a root document or an embedded value object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    Document,
    Embedded,
}

/// How a document receives its identifier on persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdStrategy {
    /// The application sets the identifier before persisting.
    Assigned,
    /// Identifiers are fetched from the store in batches and consumed locally.
    #[default]
    StoreBatch,
}

/// Cascade flags of an association. Combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cascade(u8);

impl Cascade {
    pub const NONE: Cascade = Cascade(0);
    pub const PERSIST: Cascade = Cascade(1);
    pub const REMOVE: Cascade = Cascade(1 << 1);
    pub const MERGE: Cascade = Cascade(1 << 2);
    pub const DETACH: Cascade = Cascade(1 << 3);
    pub const REFRESH: Cascade = Cascade(1 << 4);
    pub const ALL: Cascade = Cascade(0b1_1111);

    pub const fn contains(self, other: Cascade) -> bool {
        self.0 & other.0 == other.0
    }

    /// The flag that enables cascading `op`.
    pub const fn for_op(op: CascadeOp) -> Cascade {
        match op {
            CascadeOp::Persist => Cascade::PERSIST,
            CascadeOp::Remove => Cascade::REMOVE,
            CascadeOp::Merge => Cascade::MERGE,
            CascadeOp::Detach => Cascade::DETACH,
            CascadeOp::Refresh => Cascade::REFRESH,
        }
    }
}

impl BitOr for Cascade {
    type Output = Cascade;

    fn bitor(self, rhs: Cascade) -> Cascade {
        Cascade(self.0 | rhs.0)
    }
}

/// Cardinality of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    ToOne,
    ToMany,
}

/// A mapped scalar field.
pub struct FieldMapping {
    pub(crate) name: String,
    pub(crate) json_name: String,
    pub(crate) type_name: String,
    pub(crate) access: Box<dyn ScalarAccess>,
}

impl FieldMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_name(&self) -> &str {
        &self.json_name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// A field holding one embedded value object or a collection of them.
pub struct EmbeddedMapping {
    pub(crate) name: String,
    pub(crate) json_name: String,
    pub(crate) cardinality: EmbedCardinality,
    pub(crate) target: Option<String>,
    pub(crate) access: Box<dyn EmbedAccess>,
}

impl EmbeddedMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_name(&self) -> &str {
        &self.json_name
    }

    pub fn cardinality(&self) -> EmbedCardinality {
        self.cardinality
    }

    /// Concrete embedded class, if fixed by the mapping.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }
}

pub(crate) enum AssociationAccess {
    One(Box<dyn Accessor<Option<DocHandle>>>),
    Many(Box<dyn Accessor<PersistentCollection>>),
}

/// A reference to other root documents.
pub struct AssociationMapping {
    pub(crate) name: String,
    pub(crate) json_name: String,
    pub(crate) target: Option<String>,
    pub(crate) mapped_by: Option<String>,
    pub(crate) cascade: Cascade,
    pub(crate) access: AssociationAccess,
}

impl AssociationMapping {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn json_name(&self) -> &str {
        &self.json_name
    }

    pub fn kind(&self) -> AssociationKind {
        match self.access {
            AssociationAccess::One(_) => AssociationKind::ToOne,
            AssociationAccess::Many(_) => AssociationKind::ToMany,
        }
    }

    /// Target class. `None` defers to the discriminator stored in the target document.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// The owning-side field on the target class, for inverse associations.
    pub fn mapped_by(&self) -> Option<&str> {
        self.mapped_by.as_deref()
    }

    pub fn is_owning_side(&self) -> bool {
        self.mapped_by.is_none()
    }

    pub fn cascade(&self) -> Cascade {
        self.cascade
    }

    pub fn cascades(&self, op: CascadeOp) -> bool {
        self.cascade.contains(Cascade::for_op(op))
    }
}

/// Field mappings, associations, identifier strategy and accessors of one class.
pub struct ClassMetadata {
    pub(crate) name: String,
    pub(crate) type_id: TypeId,
    pub(crate) rust_type: &'static str,
    pub(crate) kind: ClassKind,
    pub(crate) factory: fn() -> Box<dyn Any>,
    pub(crate) id_strategy: IdStrategy,
    pub(crate) identifier: Option<Box<dyn Accessor<Option<String>>>>,
    pub(crate) version: Option<Box<dyn Accessor<Option<String>>>>,
    pub(crate) fields: Vec<FieldMapping>,
    pub(crate) embedded: Vec<EmbeddedMapping>,
    pub(crate) associations: Vec<AssociationMapping>,
    pub(crate) attachments: Option<Box<dyn Accessor<Attachments>>>,
}

impl ClassMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn rust_type(&self) -> &'static str {
        self.rust_type
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn is_embedded(&self) -> bool {
        self.kind == ClassKind::Embedded
    }

    pub fn id_strategy(&self) -> IdStrategy {
        self.id_strategy
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    pub fn has_attachments(&self) -> bool {
        self.attachments.is_some()
    }

    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    pub fn embedded_fields(&self) -> &[EmbeddedMapping] {
        &self.embedded
    }

    pub fn associations(&self) -> &[AssociationMapping] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|assoc| assoc.name == name)
    }

    /// Whether `json_name` is written by any mapping of this class.
    pub(crate) fn maps_json_key(&self, json_name: &str) -> bool {
        self.fields.iter().any(|f| f.json_name == json_name)
            || self.embedded.iter().any(|e| e.json_name == json_name)
            || self.associations.iter().any(|a| a.json_name == json_name)
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Any> {
        (self.factory)()
    }
}

impl fmt::Debug for ClassMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassMetadata")
            .field("name", &self.name)
            .field("rust_type", &self.rust_type)
            .field("kind", &self.kind)
            .field("id_strategy", &self.id_strategy)
            .field("versioned", &self.is_versioned())
            .field("fields", &self.fields.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field("embedded", &self.embedded.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field(
                "associations",
                &self.associations.iter().map(|m| &m.name).collect::<Vec<_>>(),
            )
            .field("attachments", &self.has_attachments())
            .finish()
    }
}
