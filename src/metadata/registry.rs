use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use super::{AssociationKind, ClassKind, ClassMetadata};
use crate::error::{OdmError, Result};
use crate::types::TypeRegistry;

/// Source of class metadata for the unit of work.
pub trait MetadataProvider {
    /// Metadata for a mapped class name. Fails with `ClassNotMapped`.
    fn metadata_for(&self, class: &str) -> Result<Arc<ClassMetadata>>;

    /// Metadata for the Rust type backing a mapped class.
    fn metadata_for_type(&self, type_id: TypeId) -> Result<Arc<ClassMetadata>>;
}

/// In-memory metadata catalogue, filled once at startup.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    classes: HashMap<String, Arc<ClassMetadata>>,
    by_type: HashMap<TypeId, String>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, metadata: ClassMetadata) -> Result<()> {
        if self.classes.contains_key(&metadata.name) || self.by_type.contains_key(&metadata.type_id)
        {
            return Err(OdmError::InvalidMapping {
                class: metadata.name.clone(),
                reason: format!("{} is mapped more than once", metadata.rust_type),
            });
        }
        self.by_type.insert(metadata.type_id, metadata.name.clone());
        self.classes.insert(metadata.name.clone(), Arc::new(metadata));
        Ok(())
    }

    pub fn get(&self, class: &str) -> Option<&Arc<ClassMetadata>> {
        self.classes.get(class)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Cross-check every mapping against the other registered classes and
    /// the converters available in `types`.
    pub fn validate(&self, types: &TypeRegistry) -> Result<()> {
        for meta in self.classes.values() {
            for field in &meta.fields {
                if !types.has(&field.type_name) {
                    return Err(OdmError::UnknownType(field.type_name.clone()));
                }
            }

            for embed in &meta.embedded {
                if let Some(target) = &embed.target {
                    let target_meta = self.metadata_for(target)?;
                    if target_meta.kind != ClassKind::Embedded {
                        return Err(OdmError::InvalidMapping {
                            class: meta.name.clone(),
                            reason: format!("{} embeds document class {target}", embed.name),
                        });
                    }
                }
            }

            for assoc in &meta.associations {
                let Some(target) = &assoc.target else {
                    continue;
                };
                let target_meta = self.metadata_for(target)?;
                if target_meta.kind != ClassKind::Document {
                    return Err(OdmError::InvalidMapping {
                        class: meta.name.clone(),
                        reason: format!("{} references embedded class {target}", assoc.name),
                    });
                }
                if let Some(mapped_by) = &assoc.mapped_by {
                    let owning = target_meta.association(mapped_by).ok_or_else(|| {
                        OdmError::UnknownField {
                            class: target.clone(),
                            field: mapped_by.clone(),
                        }
                    })?;
                    if !owning.is_owning_side() || owning.kind() != AssociationKind::ToOne {
                        return Err(OdmError::InvalidMapping {
                            class: meta.name.clone(),
                            reason: format!(
                                "{} must be mapped by an owning to-one association",
                                assoc.name
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl MetadataProvider for MetadataRegistry {
    fn metadata_for(&self, class: &str) -> Result<Arc<ClassMetadata>> {
        self.classes
            .get(class)
            .cloned()
            .ok_or_else(|| OdmError::ClassNotMapped(class.to_string()))
    }

    fn metadata_for_type(&self, type_id: TypeId) -> Result<Arc<ClassMetadata>> {
        let name = self
            .by_type
            .get(&type_id)
            .ok_or_else(|| OdmError::ClassNotMapped(format!("{type_id:?}")))?;
        self.metadata_for(name)
    }
}
