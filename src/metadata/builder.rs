use std::any::{type_name, Any, TypeId};
use std::collections::HashSet;
use std::marker::PhantomData;

use super::access::Lens;
use super::{
    AssociationAccess, AssociationMapping, Cascade, ClassKind, ClassMetadata, EmbeddedMapping,
    FieldMapping, IdStrategy,
};
use crate::attachment::Attachments;
use crate::collection::PersistentCollection;
use crate::embedded::EmbedField;
use crate::error::{OdmError, Result};
use crate::types::FieldType;
use crate::unit_of_work::DocHandle;

fn instantiate<T: Any + Default>() -> Box<dyn Any> {
    Box::new(T::default())
}

/// Name, stored key and converter of a scalar field.
#[derive(Debug, Clone)]
pub struct Field {
    name: String,
    json_name: Option<String>,
    type_name: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json_name: None,
            type_name: None,
        }
    }

    /// Key used in the stored document. Defaults to the field name.
    pub fn json_name(mut self, json_name: impl Into<String>) -> Self {
        self.json_name = Some(json_name.into());
        self
    }

    /// Registered converter name. Defaults to the Rust type's natural converter.
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

impl From<&str> for Field {
    fn from(name: &str) -> Self {
        Field::new(name)
    }
}

/// Name, stored key and target class of an embedded field.
#[derive(Debug, Clone)]
pub struct Embed {
    name: String,
    json_name: Option<String>,
    target: Option<String>,
}

impl Embed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json_name: None,
            target: None,
        }
    }

    pub fn json_name(mut self, json_name: impl Into<String>) -> Self {
        self.json_name = Some(json_name.into());
        self
    }

    /// Fix the embedded class instead of reading the stored discriminator.
    pub fn target(mut self, class: impl Into<String>) -> Self {
        self.target = Some(class.into());
        self
    }
}

impl From<&str> for Embed {
    fn from(name: &str) -> Self {
        Embed::new(name)
    }
}

/// Name, target, direction and cascade flags of an association.
#[derive(Debug, Clone)]
pub struct Reference {
    name: String,
    json_name: Option<String>,
    target: Option<String>,
    mapped_by: Option<String>,
    cascade: Cascade,
}

impl Reference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            json_name: None,
            target: None,
            mapped_by: None,
            cascade: Cascade::NONE,
        }
    }

    pub fn json_name(mut self, json_name: impl Into<String>) -> Self {
        self.json_name = Some(json_name.into());
        self
    }

    pub fn target(mut self, class: impl Into<String>) -> Self {
        self.target = Some(class.into());
        self
    }

    /// Make this the inverse side of `field` on the target class.
    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        self.mapped_by = Some(field.into());
        self
    }

    pub fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = self.cascade | cascade;
        self
    }
}

impl From<&str> for Reference {
    fn from(name: &str) -> Self {
        Reference::new(name)
    }
}

/// Typed builder for [`ClassMetadata`].
pub struct ClassMetadataBuilder<T> {
    meta: ClassMetadata,
    problems: Vec<OdmError>,
    names: HashSet<String>,
    json_names: HashSet<String>,
    _owner: PhantomData<fn() -> T>,
}

impl ClassMetadata {
    /// Start mapping a root document class.
    pub fn document<T: Any + Default>(name: impl Into<String>) -> ClassMetadataBuilder<T> {
        ClassMetadataBuilder::new(name.into(), ClassKind::Document)
    }

    /// Start mapping an embedded value-object class.
    pub fn embedded<T: Any + Default>(name: impl Into<String>) -> ClassMetadataBuilder<T> {
        ClassMetadataBuilder::new(name.into(), ClassKind::Embedded)
    }
}

impl<T: Any + Default> ClassMetadataBuilder<T> {
    fn new(name: String, kind: ClassKind) -> Self {
        Self {
            meta: ClassMetadata {
                name,
                type_id: TypeId::of::<T>(),
                rust_type: type_name::<T>(),
                kind,
                factory: instantiate::<T>,
                id_strategy: IdStrategy::default(),
                identifier: None,
                version: None,
                fields: Vec::new(),
                embedded: Vec::new(),
                associations: Vec::new(),
                attachments: None,
            },
            problems: Vec::new(),
            names: HashSet::new(),
            json_names: HashSet::new(),
            _owner: PhantomData,
        }
    }
}

impl<T: Any> ClassMetadataBuilder<T> {
    pub fn identifier(
        mut self,
        get: fn(&T) -> &Option<String>,
        get_mut: fn(&mut T) -> &mut Option<String>,
    ) -> Self {
        self.meta.identifier = Some(Box::new(Lens { get, get_mut }));
        self
    }

    pub fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.meta.id_strategy = strategy;
        self
    }

    /// Field receiving the revision token after every load and write.
    pub fn version(
        mut self,
        get: fn(&T) -> &Option<String>,
        get_mut: fn(&mut T) -> &mut Option<String>,
    ) -> Self {
        self.meta.version = Some(Box::new(Lens { get, get_mut }));
        self
    }

    pub fn field<F: FieldType>(
        mut self,
        field: impl Into<Field>,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> Self {
        let field = field.into();
        let json_name = field.json_name.unwrap_or_else(|| field.name.clone());
        if self.claim(&field.name, &json_name) {
            self.meta.fields.push(FieldMapping {
                name: field.name,
                json_name,
                type_name: field
                    .type_name
                    .unwrap_or_else(|| F::TYPE_NAME.to_string()),
                access: Box::new(Lens { get, get_mut }),
            });
        }
        self
    }

    pub fn embed<F: EmbedField>(
        mut self,
        embed: impl Into<Embed>,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> Self {
        let embed = embed.into();
        let json_name = embed.json_name.unwrap_or_else(|| embed.name.clone());
        if self.claim(&embed.name, &json_name) {
            self.meta.embedded.push(EmbeddedMapping {
                name: embed.name,
                json_name,
                cardinality: F::CARDINALITY,
                target: embed.target,
                access: Box::new(Lens { get, get_mut }),
            });
        }
        self
    }

    pub fn reference_one(
        mut self,
        reference: impl Into<Reference>,
        get: fn(&T) -> &Option<DocHandle>,
        get_mut: fn(&mut T) -> &mut Option<DocHandle>,
    ) -> Self {
        let reference = reference.into();
        if reference.mapped_by.is_some() {
            self.problems.push(self.invalid(format!(
                "to-one association {} cannot be the inverse side",
                reference.name
            )));
            return self;
        }
        self.push_association(reference, AssociationAccess::One(Box::new(Lens { get, get_mut })));
        self
    }

    pub fn reference_many(
        mut self,
        reference: impl Into<Reference>,
        get: fn(&T) -> &PersistentCollection,
        get_mut: fn(&mut T) -> &mut PersistentCollection,
    ) -> Self {
        let reference = reference.into();
        if reference.mapped_by.is_some() && reference.target.is_none() {
            self.problems.push(self.invalid(format!(
                "inverse association {} needs a target class",
                reference.name
            )));
            return self;
        }
        self.push_association(reference, AssociationAccess::Many(Box::new(Lens { get, get_mut })));
        self
    }

    pub fn attachments(
        mut self,
        get: fn(&T) -> &Attachments,
        get_mut: fn(&mut T) -> &mut Attachments,
    ) -> Self {
        self.meta.attachments = Some(Box::new(Lens { get, get_mut }));
        self
    }

    /// Validate and finish the mapping.
    pub fn build(mut self) -> Result<ClassMetadata> {
        if let Some(problem) = self.problems.drain(..).next() {
            return Err(problem);
        }

        match self.meta.kind {
            ClassKind::Document if self.meta.identifier.is_none() => {
                return Err(self.invalid("document classes need an identifier field".into()));
            }
            ClassKind::Embedded => {
                if self.meta.identifier.is_some() || self.meta.version.is_some() {
                    return Err(self.invalid(
                        "embedded classes cannot declare an identifier or version".into(),
                    ));
                }
                if !self.meta.associations.is_empty() || self.meta.attachments.is_some() {
                    return Err(self.invalid(
                        "embedded classes cannot declare associations or attachments".into(),
                    ));
                }
            }
            ClassKind::Document => {}
        }

        Ok(self.meta)
    }

    fn push_association(&mut self, reference: Reference, access: AssociationAccess) {
        let json_name = reference
            .json_name
            .unwrap_or_else(|| reference.name.clone());
        if self.claim(&reference.name, &json_name) {
            self.meta.associations.push(AssociationMapping {
                name: reference.name,
                json_name,
                target: reference.target,
                mapped_by: reference.mapped_by,
                cascade: reference.cascade,
                access,
            });
        }
    }

    /// Reserve a field name and stored key, recording a problem on reuse.
    fn claim(&mut self, name: &str, json_name: &str) -> bool {
        if json_name.starts_with('_') {
            let problem = self.invalid(format!(
                "stored key {json_name} of {name} is reserved by the store"
            ));
            self.problems.push(problem);
            return false;
        }
        if !self.names.insert(name.to_string()) || !self.json_names.insert(json_name.to_string()) {
            self.problems.push(OdmError::DuplicateFieldMapping {
                class: self.meta.name.clone(),
                field: name.to_string(),
            });
            return false;
        }
        true
    }

    fn invalid(&self, reason: String) -> OdmError {
        OdmError::InvalidMapping {
            class: self.meta.name.clone(),
            reason,
        }
    }
}
