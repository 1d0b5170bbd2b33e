//! Binder Layer: Rust values <-> wire values
//!
//! A [`Binder`] knows one Rust type's wire signature and how to convert it
//! in both directions. Binders compose: arrays wrap an element binder,
//! structs are built from an explicit member schema.

mod container;
mod primitive;
mod registry;

pub use container::{ArrayBinder, StructBinder, StructBinderBuilder};
pub use primitive::{Bindable, PrimitiveBinder, VariantBinder, WireType};
pub use registry::{BinderFactory, BinderRegistry, ErasedBinder, TypedFactory};

use crate::error::BinderError;
use crate::protocol::{DbusValue, TypeSignature};

pub trait Binder<T>: Send + Sync {
    fn type_signature(&self) -> TypeSignature;

    fn decode(&self, value: &DbusValue) -> Result<T, BinderError>;

    fn encode(&self, value: &T) -> Result<DbusValue, BinderError>;
}

type DecodeFn<T> = Box<dyn Fn(&DbusValue) -> Option<T> + Send + Sync>;
type EncodeFn<T> = Box<dyn Fn(&T) -> DbusValue + Send + Sync>;

/// Binder from a signature and a pair of conversion functions.
pub struct FnBinder<T> {
    signature: TypeSignature,
    decode: DecodeFn<T>,
    encode: EncodeFn<T>,
}

impl<T> FnBinder<T> {
    pub fn new<D, E>(signature: impl Into<TypeSignature>, decode: D, encode: E) -> Self
    where
        D: Fn(&DbusValue) -> Option<T> + Send + Sync + 'static,
        E: Fn(&T) -> DbusValue + Send + Sync + 'static,
    {
        Self {
            signature: signature.into(),
            decode: Box::new(decode),
            encode: Box::new(encode),
        }
    }
}

impl<T> Binder<T> for FnBinder<T> {
    fn type_signature(&self) -> TypeSignature {
        self.signature.clone()
    }

    fn decode(&self, value: &DbusValue) -> Result<T, BinderError> {
        (self.decode)(value).ok_or_else(|| mismatch(&self.signature, value))
    }

    fn encode(&self, value: &T) -> Result<DbusValue, BinderError> {
        let encoded = (self.encode)(value);
        if encoded.signature() != self.signature {
            return Err(mismatch(&self.signature, &encoded));
        }
        Ok(encoded)
    }
}

pub(crate) fn mismatch(expected: &TypeSignature, found: &DbusValue) -> BinderError {
    BinderError::Mismatch {
        expected: expected.serialize(),
        found: found.signature().serialize(),
    }
}
