//! Wire values
//!
//! [`DbusValue`] is the decoded form of anything a [`TypeSignature`] can
//! describe. Containers carry their element signatures so that empty arrays
//! and dicts still know their own type.

use crate::error::CodecError;
use crate::protocol::signature::{BasicType, TypeSignature};

#[derive(Debug, Clone, PartialEq)]
pub enum DbusValue {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(Vec<TypeSignature>),
    UnixFd(u32),
    Variant(Box<DbusValue>),
    Array {
        element: TypeSignature,
        items: Vec<DbusValue>,
    },
    Struct(Vec<DbusValue>),
    Dict {
        key: BasicType,
        value: TypeSignature,
        entries: Vec<(DbusValue, DbusValue)>,
    },
}

impl DbusValue {
    pub fn string(s: impl Into<String>) -> Self {
        DbusValue::String(s.into())
    }

    /// Object path, validated.
    pub fn object_path(path: impl Into<String>) -> Result<Self, CodecError> {
        let path = path.into();
        validate_object_path(&path)?;
        Ok(DbusValue::ObjectPath(path))
    }

    pub fn variant(inner: DbusValue) -> Self {
        DbusValue::Variant(Box::new(inner))
    }

    /// Array whose items must all match `element`.
    pub fn array(element: TypeSignature, items: Vec<DbusValue>) -> Result<Self, CodecError> {
        for item in &items {
            item.expect_signature(&element)?;
        }
        Ok(DbusValue::Array { element, items })
    }

    pub fn dict(
        key: BasicType,
        value: TypeSignature,
        entries: Vec<(DbusValue, DbusValue)>,
    ) -> Result<Self, CodecError> {
        let key_sig = TypeSignature::Basic(key);
        for (k, v) in &entries {
            k.expect_signature(&key_sig)?;
            v.expect_signature(&value)?;
        }
        Ok(DbusValue::Dict {
            key,
            value,
            entries,
        })
    }

    pub fn signature(&self) -> TypeSignature {
        match self {
            DbusValue::Byte(_) => BasicType::Byte.into(),
            DbusValue::Boolean(_) => BasicType::Boolean.into(),
            DbusValue::Int16(_) => BasicType::Int16.into(),
            DbusValue::Uint16(_) => BasicType::Uint16.into(),
            DbusValue::Int32(_) => BasicType::Int32.into(),
            DbusValue::Uint32(_) => BasicType::Uint32.into(),
            DbusValue::Int64(_) => BasicType::Int64.into(),
            DbusValue::Uint64(_) => BasicType::Uint64.into(),
            DbusValue::Double(_) => BasicType::Double.into(),
            DbusValue::String(_) => BasicType::String.into(),
            DbusValue::ObjectPath(_) => BasicType::ObjectPath.into(),
            DbusValue::Signature(_) => BasicType::Signature.into(),
            DbusValue::UnixFd(_) => BasicType::UnixFd.into(),
            DbusValue::Variant(_) => BasicType::Variant.into(),
            DbusValue::Array { element, .. } => TypeSignature::array(element.clone()),
            DbusValue::Struct(members) => {
                TypeSignature::Struct(members.iter().map(DbusValue::signature).collect())
            }
            DbusValue::Dict { key, value, .. } => TypeSignature::dict(*key, value.clone()),
        }
    }

    pub(crate) fn expect_signature(&self, expected: &TypeSignature) -> Result<(), CodecError> {
        let found = self.signature();
        if &found == expected {
            Ok(())
        } else {
            Err(CodecError::TypeMismatch {
                expected: expected.serialize(),
                found: found.serialize(),
            })
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbusValue::String(s) | DbusValue::ObjectPath(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            DbusValue::Uint32(v) | DbusValue::UnixFd(v) => Some(*v),
            _ => None,
        }
    }

    /// Unwrap nested variants.
    pub fn inner(&self) -> &DbusValue {
        match self {
            DbusValue::Variant(inner) => inner.inner(),
            other => other,
        }
    }
}

/// `/` or `/seg(/seg)*` with segments of `[A-Za-z0-9_]+`.
pub fn validate_object_path(path: &str) -> Result<(), CodecError> {
    let invalid = || CodecError::InvalidObjectPath(path.to_string());
    if path == "/" {
        return Ok(());
    }
    let rest = path.strip_prefix('/').ok_or_else(invalid)?;
    for segment in rest.split('/') {
        if segment.is_empty()
            || !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(invalid());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_signatures() {
        let v = DbusValue::Struct(vec![DbusValue::Int32(1), DbusValue::string("x")]);
        assert_eq!(v.signature().serialize(), "(is)");

        let d = DbusValue::dict(
            BasicType::String,
            BasicType::Variant.into(),
            vec![(DbusValue::string("k"), DbusValue::variant(DbusValue::Byte(1)))],
        )
        .unwrap();
        assert_eq!(d.signature().serialize(), "a{sv}");
    }

    #[test]
    fn test_array_rejects_mixed_items() {
        let err = DbusValue::array(
            BasicType::Int32.into(),
            vec![DbusValue::Int32(1), DbusValue::Uint32(2)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: "i".into(),
                found: "u".into()
            }
        );
    }

    #[test]
    fn test_object_paths() {
        assert!(validate_object_path("/").is_ok());
        assert!(validate_object_path("/org/freedesktop/DBus").is_ok());
        assert!(validate_object_path("").is_err());
        assert!(validate_object_path("org").is_err());
        assert!(validate_object_path("/org/").is_err());
        assert!(validate_object_path("/org//x").is_err());
        assert!(validate_object_path("/org/free-desktop").is_err());
    }

    #[test]
    fn test_inner_unwraps_variants() {
        let v = DbusValue::variant(DbusValue::variant(DbusValue::Uint32(5)));
        assert_eq!(v.inner().as_u32(), Some(5));
    }
}
