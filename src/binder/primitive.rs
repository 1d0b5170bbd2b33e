//! Built-in binders for basic types and variants.

use std::marker::PhantomData;
use std::sync::Arc;

use super::{mismatch, ArrayBinder, Binder, BinderRegistry};
use crate::error::BinderError;
use crate::protocol::{BasicType, DbusValue, TypeSignature};

/// Rust type with a one-to-one basic wire type.
pub trait WireType: Sized + Send + Sync + 'static {
    const BASIC: BasicType;

    fn from_value(value: &DbusValue) -> Option<Self>;

    fn to_value(&self) -> DbusValue;
}

macro_rules! wire_type {
    ($ty:ty, $basic:ident, $variant:ident) => {
        impl WireType for $ty {
            const BASIC: BasicType = BasicType::$basic;

            #[inline]
            fn from_value(value: &DbusValue) -> Option<Self> {
                match value {
                    DbusValue::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }

            #[inline]
            fn to_value(&self) -> DbusValue {
                DbusValue::$variant(self.clone())
            }
        }
    };
}

wire_type!(u8, Byte, Byte);
wire_type!(bool, Boolean, Boolean);
wire_type!(i16, Int16, Int16);
wire_type!(u16, Uint16, Uint16);
wire_type!(i32, Int32, Int32);
wire_type!(u32, Uint32, Uint32);
wire_type!(i64, Int64, Int64);
wire_type!(u64, Uint64, Uint64);
wire_type!(f64, Double, Double);
wire_type!(String, String, String);

pub struct PrimitiveBinder<T>(PhantomData<fn() -> T>);

impl<T> Default for PrimitiveBinder<T> {
    fn default() -> Self {
        PrimitiveBinder(PhantomData)
    }
}

impl<T: WireType> Binder<T> for PrimitiveBinder<T> {
    fn type_signature(&self) -> TypeSignature {
        T::BASIC.into()
    }

    fn decode(&self, value: &DbusValue) -> Result<T, BinderError> {
        T::from_value(value.inner()).ok_or_else(|| mismatch(&self.type_signature(), value))
    }

    fn encode(&self, value: &T) -> Result<DbusValue, BinderError> {
        Ok(value.to_value())
    }
}

/// Passes wire values through, wrapped in a variant.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariantBinder;

impl Binder<DbusValue> for VariantBinder {
    fn type_signature(&self) -> TypeSignature {
        BasicType::Variant.into()
    }

    fn decode(&self, value: &DbusValue) -> Result<DbusValue, BinderError> {
        Ok(value.inner().clone())
    }

    fn encode(&self, value: &DbusValue) -> Result<DbusValue, BinderError> {
        Ok(DbusValue::variant(value.clone()))
    }
}

/// Types with a built-in binder, used when no registered factory claims
/// the type.
pub trait Bindable: Sized + 'static {
    fn builtin_binder(registry: &BinderRegistry) -> Result<Arc<dyn Binder<Self>>, BinderError>;
}

macro_rules! bindable_primitive {
    ($($ty:ty),*) => {
        $(
            impl Bindable for $ty {
                fn builtin_binder(_: &BinderRegistry) -> Result<Arc<dyn Binder<Self>>, BinderError> {
                    Ok(Arc::new(PrimitiveBinder::<$ty>::default()))
                }
            }
        )*
    };
}

bindable_primitive!(u8, bool, i16, u16, i32, u32, i64, u64, f64, String);

impl Bindable for DbusValue {
    fn builtin_binder(_: &BinderRegistry) -> Result<Arc<dyn Binder<Self>>, BinderError> {
        Ok(Arc::new(VariantBinder))
    }
}

impl<T: Bindable + Send + Sync> Bindable for Vec<T> {
    fn builtin_binder(registry: &BinderRegistry) -> Result<Arc<dyn Binder<Self>>, BinderError> {
        let element = registry.resolve_uncached::<T>()?;
        Ok(Arc::new(ArrayBinder::new(element)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trip() {
        let b = PrimitiveBinder::<i32>::default();
        assert_eq!(b.type_signature().serialize(), "i");
        let wire = b.encode(&-5).unwrap();
        assert_eq!(wire, DbusValue::Int32(-5));
        assert_eq!(b.decode(&wire).unwrap(), -5);
    }

    #[test]
    fn test_primitive_sees_through_variant() {
        let b = PrimitiveBinder::<String>::default();
        let wire = DbusValue::variant(DbusValue::string("x"));
        assert_eq!(b.decode(&wire).unwrap(), "x");
        assert!(b.decode(&DbusValue::Uint32(1)).is_err());
    }

    #[test]
    fn test_variant_binder_wraps() {
        let wire = VariantBinder.encode(&DbusValue::Byte(3)).unwrap();
        assert_eq!(wire.signature().serialize(), "v");
        assert_eq!(VariantBinder.decode(&wire).unwrap(), DbusValue::Byte(3));
    }
}
