//! Type-erased field accessors.
//!
//! A [`Lens`] pairs the shared and mutable projections of one struct field.
//! The builder erases the owning type behind the accessor traits below so
//! the unit of work can read and write fields of any mapped class through
//! `&dyn Any` without reflection.

use std::any::{type_name, Any};

use crate::embedded::{EmbedField, EmbeddedValue, EmbeddedView};
use crate::error::{OdmError, Result};
use crate::types::{FieldType, Value};

pub(crate) struct Lens<T, F> {
    pub(crate) get: fn(&T) -> &F,
    pub(crate) get_mut: fn(&mut T) -> &mut F,
}

pub(crate) fn downcast<T: Any>(obj: &dyn Any) -> Result<&T> {
    obj.downcast_ref::<T>().ok_or(OdmError::TypeMismatch {
        expected: type_name::<T>(),
    })
}

pub(crate) fn downcast_mut<T: Any>(obj: &mut dyn Any) -> Result<&mut T> {
    obj.downcast_mut::<T>().ok_or(OdmError::TypeMismatch {
        expected: type_name::<T>(),
    })
}

/// Typed access to a field whose Rust type is fixed by the mapping kind
/// (identifier, version, references, collections, attachments).
pub(crate) trait Accessor<F>: Send + Sync {
    fn get<'a>(&self, obj: &'a dyn Any) -> Result<&'a F>;
    fn get_mut<'a>(&self, obj: &'a mut dyn Any) -> Result<&'a mut F>;
}

impl<T: Any, F: 'static> Accessor<F> for Lens<T, F> {
    fn get<'a>(&self, obj: &'a dyn Any) -> Result<&'a F> {
        Ok((self.get)(downcast::<T>(obj)?))
    }

    fn get_mut<'a>(&self, obj: &'a mut dyn Any) -> Result<&'a mut F> {
        Ok((self.get_mut)(downcast_mut::<T>(obj)?))
    }
}

/// Access to a scalar field through its native [`Value`].
pub(crate) trait ScalarAccess: Send + Sync {
    fn read(&self, obj: &dyn Any) -> Result<Value>;
    fn write(&self, obj: &mut dyn Any, value: Value) -> Result<()>;
}

impl<T: Any, F: FieldType> ScalarAccess for Lens<T, F> {
    fn read(&self, obj: &dyn Any) -> Result<Value> {
        Ok((self.get)(downcast::<T>(obj)?).to_value())
    }

    fn write(&self, obj: &mut dyn Any, value: Value) -> Result<()> {
        *(self.get_mut)(downcast_mut::<T>(obj)?) = F::from_value(value)?;
        Ok(())
    }
}

/// Access to an embedded field.
pub(crate) trait EmbedAccess: Send + Sync {
    fn view<'a>(&self, obj: &'a dyn Any) -> Result<EmbeddedView<'a>>;
    fn assign(&self, obj: &mut dyn Any, value: EmbeddedValue) -> Result<()>;
}

impl<T: Any, F: EmbedField> EmbedAccess for Lens<T, F> {
    fn view<'a>(&self, obj: &'a dyn Any) -> Result<EmbeddedView<'a>> {
        Ok((self.get)(downcast::<T>(obj)?).view())
    }

    fn assign(&self, obj: &mut dyn Any, value: EmbeddedValue) -> Result<()> {
        (self.get_mut)(downcast_mut::<T>(obj)?).assign(value)
    }
}
