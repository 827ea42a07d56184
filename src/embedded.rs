//! Embedded documents - Value objects stored inline in their parent document.
//!
//! Embedded classes have no identifier and no revision. They are written as
//! nested JSON carrying a type discriminator, and dirtiness is established
//! by a structural diff between the live value and the JSON captured at the
//! last load or flush.
//!
//! ## Example
//!
//! ```ignore
//! #[derive(Default)]
//! struct Address { street: String }
//! impl Embeddable for Address {}
//!
//! let serializer = EmbeddedSerializer::new(&registry, &types, "type");
//! let json = serializer.serialize(mapping, &user)?;
//! assert!(!serializer.is_changed(mapping, &user, &json)?);
//! ```

use std::any::{type_name, Any};
use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::trace;

use crate::error::{OdmError, Result};
use crate::metadata::{ClassMetadata, EmbeddedMapping, MetadataProvider};
use crate::types::TypeRegistry;

/// Whether a field embeds one value object or a collection of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedCardinality {
    One,
    Many,
}

/// A struct usable as an embedded value.
///
/// Mapped embedded classes only need an empty impl. [`DynEmbedded`]
/// overrides both methods to hold any mapped embedded class.
pub trait Embeddable: Any + Sized {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn from_any(value: Box<dyn Any>) -> Result<Self> {
        value
            .downcast::<Self>()
            .map(|boxed| *boxed)
            .map_err(|_| OdmError::TypeMismatch {
                expected: type_name::<Self>(),
            })
    }
}

/// An embedded value whose concrete class is decided by the stored discriminator.
pub struct DynEmbedded(Box<dyn Any>);

impl DynEmbedded {
    pub fn new<E: Any>(value: E) -> Self {
        DynEmbedded(Box::new(value))
    }

    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<E: Any>(&mut self) -> Option<&mut E> {
        self.0.downcast_mut()
    }
}

impl Embeddable for DynEmbedded {
    fn as_any(&self) -> &dyn Any {
        &*self.0
    }

    fn from_any(value: Box<dyn Any>) -> Result<Self> {
        Ok(DynEmbedded(value))
    }
}

/// Borrowed view of an embedded field's current value.
pub enum EmbeddedView<'a> {
    None,
    One(&'a dyn Any),
    List(Vec<&'a dyn Any>),
    Map(Vec<(&'a str, &'a dyn Any)>),
}

/// Freshly hydrated value for an embedded field.
pub enum EmbeddedValue {
    None,
    One(Box<dyn Any>),
    List(Vec<Box<dyn Any>>),
    Map(Vec<(String, Box<dyn Any>)>),
}

/// A Rust type that can back an embedded field.
pub trait EmbedField: 'static {
    const CARDINALITY: EmbedCardinality;

    fn view(&self) -> EmbeddedView<'_>;

    fn assign(&mut self, value: EmbeddedValue) -> Result<()>;
}

impl<E: Embeddable> EmbedField for Option<E> {
    const CARDINALITY: EmbedCardinality = EmbedCardinality::One;

    fn view(&self) -> EmbeddedView<'_> {
        match self {
            Some(value) => EmbeddedView::One(value.as_any()),
            None => EmbeddedView::None,
        }
    }

    fn assign(&mut self, value: EmbeddedValue) -> Result<()> {
        *self = match value {
            EmbeddedValue::None => None,
            EmbeddedValue::One(obj) => Some(E::from_any(obj)?),
            EmbeddedValue::List(_) | EmbeddedValue::Map(_) => {
                return Err(OdmError::InvalidDocument(
                    "collection stored in an embed-one field".into(),
                ))
            }
        };
        Ok(())
    }
}

impl<E: Embeddable> EmbedField for Vec<E> {
    const CARDINALITY: EmbedCardinality = EmbedCardinality::Many;

    fn view(&self) -> EmbeddedView<'_> {
        EmbeddedView::List(self.iter().map(Embeddable::as_any).collect())
    }

    fn assign(&mut self, value: EmbeddedValue) -> Result<()> {
        *self = match value {
            EmbeddedValue::None => Vec::new(),
            EmbeddedValue::One(obj) => vec![E::from_any(obj)?],
            EmbeddedValue::List(items) => items
                .into_iter()
                .map(E::from_any)
                .collect::<Result<_>>()?,
            EmbeddedValue::Map(entries) => entries
                .into_iter()
                .map(|(_, obj)| E::from_any(obj))
                .collect::<Result<_>>()?,
        };
        Ok(())
    }
}

impl<E: Embeddable> EmbedField for BTreeMap<String, E> {
    const CARDINALITY: EmbedCardinality = EmbedCardinality::Many;

    fn view(&self) -> EmbeddedView<'_> {
        EmbeddedView::Map(
            self.iter()
                .map(|(key, value)| (key.as_str(), value.as_any()))
                .collect(),
        )
    }

    fn assign(&mut self, value: EmbeddedValue) -> Result<()> {
        *self = match value {
            EmbeddedValue::None => BTreeMap::new(),
            EmbeddedValue::One(obj) => BTreeMap::from([("0".to_string(), E::from_any(obj)?)]),
            EmbeddedValue::List(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, obj)| Ok((i.to_string(), E::from_any(obj)?)))
                .collect::<Result<_>>()?,
            EmbeddedValue::Map(entries) => entries
                .into_iter()
                .map(|(key, obj)| Ok((key, E::from_any(obj)?)))
                .collect::<Result<_>>()?,
        };
        Ok(())
    }
}

/// Serializes, hydrates and diffs embedded values using class metadata.
pub struct EmbeddedSerializer<'a> {
    metadata: &'a dyn MetadataProvider,
    types: &'a TypeRegistry,
    type_field: &'a str,
}

impl<'a> EmbeddedSerializer<'a> {
    pub fn new(
        metadata: &'a dyn MetadataProvider,
        types: &'a TypeRegistry,
        type_field: &'a str,
    ) -> Self {
        Self {
            metadata,
            types,
            type_field,
        }
    }

    /// JSON form of the embedded field `mapping` of `owner`.
    /// Keys of keyed collections are preserved.
    pub fn serialize(&self, mapping: &EmbeddedMapping, owner: &dyn Any) -> Result<Json> {
        self.serialize_view(mapping.access.view(owner)?)
    }

    /// Rebuild an embedded field value from its JSON form.
    pub fn hydrate(&self, mapping: &EmbeddedMapping, json: &Json) -> Result<EmbeddedValue> {
        match (mapping.cardinality, json) {
            (_, Json::Null) => Ok(EmbeddedValue::None),
            (EmbedCardinality::One, Json::Object(_)) => {
                Ok(EmbeddedValue::One(self.hydrate_object(mapping, json)?))
            }
            (EmbedCardinality::Many, Json::Array(items)) => items
                .iter()
                .map(|item| self.hydrate_object(mapping, item))
                .collect::<Result<Vec<_>>>()
                .map(EmbeddedValue::List),
            (EmbedCardinality::Many, Json::Object(entries)) => entries
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.hydrate_object(mapping, item)?)))
                .collect::<Result<Vec<_>>>()
                .map(EmbeddedValue::Map),
            (_, other) => Err(OdmError::InvalidDocument(format!(
                "embedded field {} holds {other}",
                mapping.name
            ))),
        }
    }

    /// Structural diff of the embedded field `mapping` of `owner` against
    /// its JSON snapshot.
    pub fn is_changed(
        &self,
        mapping: &EmbeddedMapping,
        owner: &dyn Any,
        original: &Json,
    ) -> Result<bool> {
        let changed = match (mapping.access.view(owner)?, original) {
            (EmbeddedView::None, original) => !original.is_null(),
            (_, Json::Null) => true,
            (EmbeddedView::One(obj), original) => self.is_object_changed(obj, original)?,
            (EmbeddedView::List(items), original) => {
                let current = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, obj)| (i.to_string(), obj))
                    .collect::<Vec<_>>();
                self.is_collection_changed(current, original)?
            }
            (EmbeddedView::Map(entries), original) => {
                let current = entries
                    .into_iter()
                    .map(|(key, obj)| (key.to_string(), obj))
                    .collect::<Vec<_>>();
                self.is_collection_changed(current, original)?
            }
        };
        if changed {
            trace!(field = %mapping.name, "embedded value changed");
        }
        Ok(changed)
    }

    fn serialize_view(&self, view: EmbeddedView<'_>) -> Result<Json> {
        match view {
            EmbeddedView::None => Ok(Json::Null),
            EmbeddedView::One(obj) => self.serialize_object(obj),
            EmbeddedView::List(items) => items
                .into_iter()
                .map(|obj| self.serialize_object(obj))
                .collect::<Result<Vec<_>>>()
                .map(Json::Array),
            EmbeddedView::Map(entries) => {
                let mut out = Map::with_capacity(entries.len());
                for (key, obj) in entries {
                    out.insert(key.to_string(), self.serialize_object(obj)?);
                }
                Ok(Json::Object(out))
            }
        }
    }

    fn is_collection_changed(
        &self,
        current: Vec<(String, &dyn Any)>,
        original: &Json,
    ) -> Result<bool> {
        let original = keyed(original);
        let Some(original) = original else {
            return Ok(true);
        };
        if original.len() != current.len() {
            return Ok(true);
        }
        for (key, obj) in current {
            match original.get(&key) {
                None => return Ok(true),
                Some(orig) => {
                    if self.is_object_changed(obj, orig)? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn is_object_changed(&self, obj: &dyn Any, original: &Json) -> Result<bool> {
        let Json::Object(original) = original else {
            return Ok(true);
        };
        let meta = self.metadata.metadata_for_type(obj.type_id())?;
        if let Some(Json::String(stored_type)) = original.get(self.type_field) {
            if stored_type != meta.name() {
                return Ok(true);
            }
        }

        for field in meta.fields() {
            let current = field.access.read(obj)?;
            let stored = original.get(&field.json_name).unwrap_or(&Json::Null);
            match (current.is_null(), stored.is_null()) {
                (true, true) => continue,
                (true, false) | (false, true) => return Ok(true),
                (false, false) => {
                    let stored_form = self.types.to_store(&field.type_name, &current)?;
                    let current = self.types.to_native(&field.type_name, &stored_form)?;
                    if current != self.types.to_native(&field.type_name, stored)? {
                        return Ok(true);
                    }
                }
            }
        }

        for nested in meta.embedded_fields() {
            let stored = original.get(&nested.json_name).unwrap_or(&Json::Null);
            if self.is_changed(nested, obj, stored)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn serialize_object(&self, obj: &dyn Any) -> Result<Json> {
        let meta = self.metadata.metadata_for_type(obj.type_id())?;
        let mut out = Map::new();
        out.insert(self.type_field.to_string(), Json::String(meta.name().to_string()));

        for field in meta.fields() {
            let value = field.access.read(obj)?;
            if value.is_null() {
                continue;
            }
            out.insert(
                field.json_name.clone(),
                self.types.to_store(&field.type_name, &value)?,
            );
        }
        for nested in meta.embedded_fields() {
            let json = self.serialize(nested, obj)?;
            if !json.is_null() {
                out.insert(nested.json_name.clone(), json);
            }
        }
        Ok(Json::Object(out))
    }

    fn hydrate_object(&self, mapping: &EmbeddedMapping, json: &Json) -> Result<Box<dyn Any>> {
        let Json::Object(data) = json else {
            return Err(OdmError::InvalidDocument(format!(
                "embedded value in {} is not an object",
                mapping.name
            )));
        };
        let meta = self.resolve_class(mapping, data)?;
        let mut obj = meta.instantiate();

        for field in meta.fields() {
            if let Some(stored) = data.get(&field.json_name) {
                let value = self.types.to_native(&field.type_name, stored)?;
                field.access.write(&mut *obj, value)?;
            }
        }
        for nested in meta.embedded_fields() {
            if let Some(stored) = data.get(&nested.json_name) {
                let value = self.hydrate(nested, stored)?;
                nested.access.assign(&mut *obj, value)?;
            }
        }
        Ok(obj)
    }

    fn resolve_class(
        &self,
        mapping: &EmbeddedMapping,
        data: &Map<String, Json>,
    ) -> Result<Arc<ClassMetadata>> {
        let class = match (data.get(self.type_field), &mapping.target) {
            (Some(Json::String(discriminator)), _) => discriminator.as_str(),
            (_, Some(target)) => target.as_str(),
            _ => {
                return Err(OdmError::AmbiguousEmbeddedType {
                    field: mapping.name.clone(),
                })
            }
        };
        self.metadata.metadata_for(class)
    }
}

/// An embed-many snapshot as a key lookup. Arrays are keyed by position.
fn keyed(original: &Json) -> Option<BTreeMap<String, &Json>> {
    match original {
        Json::Array(items) => Some(
            items
                .iter()
                .enumerate()
                .map(|(i, item)| (i.to_string(), item))
                .collect(),
        ),
        Json::Object(entries) => Some(entries.iter().map(|(k, v)| (k.clone(), v)).collect()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ClassMetadata, Embed, MetadataRegistry};
    use serde_json::json;

    #[derive(Default)]
    struct Phone {
        number: String,
    }
    impl Embeddable for Phone {}

    #[derive(Default)]
    struct Contact {
        name: String,
        age: Option<i64>,
        phones: Vec<Phone>,
    }
    impl Embeddable for Contact {}

    #[derive(Default)]
    struct Badge {
        label: String,
    }
    impl Embeddable for Badge {}

    #[derive(Default)]
    struct Holder {
        contact: Option<Contact>,
        by_kind: BTreeMap<String, Phone>,
        anything: Option<DynEmbedded>,
    }

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry
            .register(
                ClassMetadata::embedded::<Phone>("Phone")
                    .field("number", |p| &p.number, |p| &mut p.number)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ClassMetadata::embedded::<Contact>("Contact")
                    .field("name", |c| &c.name, |c| &mut c.name)
                    .field("age", |c| &c.age, |c| &mut c.age)
                    .embed(Embed::new("phones").target("Phone"), |c| &c.phones, |c| &mut c.phones)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ClassMetadata::embedded::<Badge>("Badge")
                    .field("label", |b| &b.label, |b| &mut b.label)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ClassMetadata::embedded::<Holder>("Holder")
                    .embed(
                        Embed::new("contact").target("Contact"),
                        |h| &h.contact,
                        |h| &mut h.contact,
                    )
                    .embed(
                        Embed::new("by_kind").target("Phone"),
                        |h| &h.by_kind,
                        |h| &mut h.by_kind,
                    )
                    .embed("anything", |h| &h.anything, |h| &mut h.anything)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    fn holder_meta(registry: &MetadataRegistry) -> std::sync::Arc<ClassMetadata> {
        registry.metadata_for("Holder").unwrap()
    }

    fn sample() -> Holder {
        Holder {
            contact: Some(Contact {
                name: "A".into(),
                age: None,
                phones: vec![Phone { number: "1".into() }],
            }),
            ..Holder::default()
        }
    }

    #[test]
    fn serializes_with_discriminator_and_skips_nulls() {
        let registry = registry();
        let types = TypeRegistry::with_defaults();
        let serializer = EmbeddedSerializer::new(&registry, &types, "type");
        let meta = holder_meta(&registry);
        let holder = sample();

        let contact = &meta.embedded_fields()[0];

        let json = serializer.serialize(contact, &holder).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "Contact",
                "name": "A",
                "phones": [{"type": "Phone", "number": "1"}]
            })
        );
    }

    #[test]
    fn diff_detects_scalar_and_collection_changes() {
        let registry = registry();
        let types = TypeRegistry::with_defaults();
        let serializer = EmbeddedSerializer::new(&registry, &types, "type");
        let meta = holder_meta(&registry);
        let contact = &meta.embedded_fields()[0];
        let mut holder = sample();


        let original = serializer.serialize(contact, &holder).unwrap();

        assert!(!serializer.is_changed(contact, &holder, &original).unwrap());

        holder.contact.as_mut().unwrap().name = "B".into();

        assert!(serializer.is_changed(contact, &holder, &original).unwrap());

        holder.contact.as_mut().unwrap().name = "A".into();
        holder.contact.as_mut().unwrap().phones.push(Phone { number: "2".into() });

        assert!(serializer.is_changed(contact, &holder, &original).unwrap());

        holder.contact.as_mut().unwrap().phones.clear();

        assert!(serializer.is_changed(contact, &holder, &original).unwrap());

        holder.contact = None;

        assert!(serializer.is_changed(contact, &holder, &original).unwrap());
    }

    #[test]
    fn diff_compares_converted_values() {
        let registry = registry();
        let types = TypeRegistry::with_defaults();
        let serializer = EmbeddedSerializer::new(&registry, &types, "type");
        let meta = holder_meta(&registry);
        let contact = &meta.embedded_fields()[0];
        let mut holder = sample();
        holder.contact.as_mut().unwrap().age = Some(30);

        let phones = json!([{"number": "1"}]);
        let stored = json!({"type": "Contact", "name": "A", "age": "30", "phones": phones});

        assert!(!serializer.is_changed(contact, &holder, &stored).unwrap());

        let other_type = json!({"type": "Badge", "name": "A", "age": 30, "phones": phones});

        assert!(serializer.is_changed(contact, &holder, &other_type).unwrap());
    }

    #[test]
    fn keyed_collections_compare_by_key() {
        let registry = registry();
        let types = TypeRegistry::with_defaults();
        let serializer = EmbeddedSerializer::new(&registry, &types, "type");
        let meta = holder_meta(&registry);
        let by_kind = &meta.embedded_fields()[1];
        let mut holder = Holder::default();
        holder.by_kind.insert("home".into(), Phone { number: "1".into() });

        let original = serializer.serialize(by_kind, &holder).unwrap();
        assert_eq!(original, json!({"home": {"type": "Phone", "number": "1"}}));

        let phone = holder.by_kind.remove("home").unwrap();
        holder.by_kind.insert("work".into(), phone);

        assert!(serializer.is_changed(by_kind, &holder, &original).unwrap());
    }

    #[test]
    fn hydrate_resolves_class() {
        let registry = registry();
        let types = TypeRegistry::with_defaults();
        let serializer = EmbeddedSerializer::new(&registry, &types, "type");
        let meta = holder_meta(&registry);
        let mut holder: Box<dyn Any> = Box::new(Holder::default());

        let contact = &meta.embedded_fields()[0];
        let value = serializer
            .hydrate(contact, &json!({"name": "Ann", "phones": {"a": {"number": "9"}}}))
            .unwrap();
        contact.access.assign(&mut *holder, value).unwrap();

        let anything = &meta.embedded_fields()[2];
        let value = serializer
            .hydrate(anything, &json!({"type": "Badge", "label": "gold"}))
            .unwrap();
        anything.access.assign(&mut *holder, value).unwrap();

        let holder = holder.downcast_ref::<Holder>().unwrap();
        let contact = holder.contact.as_ref().unwrap();
        assert_eq!(contact.name, "Ann");
        assert_eq!(contact.phones[0].number, "9");
        let badge = holder.anything.as_ref().unwrap().downcast_ref::<Badge>().unwrap();
        assert_eq!(badge.label, "gold");

        let err = serializer
            .hydrate(anything, &json!({"label": "gold"}))
            .err()
            .unwrap();
        assert!(matches!(err, OdmError::AmbiguousEmbeddedType { field } if field == "anything"));
    }
}
