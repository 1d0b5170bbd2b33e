//! Value marshalling through the aligned cursors
//!
//! Layout rules:
//! - Scalars sit on their natural boundary; BOOLEAN is a 0/1 `u32`.
//! - STRING / OBJECT_PATH: `u32` length, UTF-8 bytes, NUL.
//! - SIGNATURE: `u8` length, ASCII bytes, NUL.
//! - VARIANT: SIGNATURE of one complete type, then the value.
//! - ARRAY: `u32` byte length, padding to the element boundary (not
//!   counted in the length), elements.
//! - STRUCT / DICT entry: 8-byte boundary, members in order.

use crate::error::CodecError;
use crate::protocol::cursor::{AlignedDecoder, AlignedEncoder};
use crate::protocol::signature::{BasicType, TypeSignature, MAX_SIGNATURE_LEN};
use crate::protocol::value::{validate_object_path, DbusValue};

/// Largest array body accepted in either direction (64 MiB).
pub const MAX_ARRAY_LEN: usize = 1 << 26;

/// Limit on container nesting when variants are involved.
pub const MAX_VALUE_DEPTH: usize = 64;

/// Boundary a value of this type starts on. A dict is an array on the
/// wire, so its length prefix starts on 4 even though its entries use 8.
#[inline]
fn value_alignment(signature: &TypeSignature) -> usize {
    match signature {
        TypeSignature::Dict(..) => 4,
        other => other.alignment(),
    }
}

pub fn encode_value(enc: &mut AlignedEncoder<'_>, value: &DbusValue) -> Result<(), CodecError> {
    encode_at_depth(enc, value, 0)
}

/// Encode a sequence of values, e.g. a message body.
pub fn encode_values(enc: &mut AlignedEncoder<'_>, values: &[DbusValue]) -> Result<(), CodecError> {
    for value in values {
        encode_value(enc, value)?;
    }
    Ok(())
}

fn encode_at_depth(
    enc: &mut AlignedEncoder<'_>,
    value: &DbusValue,
    depth: usize,
) -> Result<(), CodecError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::LengthTooLarge {
            len: depth,
            max: MAX_VALUE_DEPTH,
        });
    }

    match value {
        DbusValue::Byte(v) => enc.write_u8(*v),
        DbusValue::Boolean(v) => enc.write_u32(u32::from(*v)),
        DbusValue::Int16(v) => enc.write_i16(*v),
        DbusValue::Uint16(v) => enc.write_u16(*v),
        DbusValue::Int32(v) => enc.write_i32(*v),
        DbusValue::Uint32(v) | DbusValue::UnixFd(v) => enc.write_u32(*v),
        DbusValue::Int64(v) => enc.write_i64(*v),
        DbusValue::Uint64(v) => enc.write_u64(*v),
        DbusValue::Double(v) => enc.write_f64(*v),
        DbusValue::String(s) => encode_string(enc, s),
        DbusValue::ObjectPath(p) => {
            validate_object_path(p)?;
            encode_string(enc, p)
        }
        DbusValue::Signature(types) => encode_signature(enc, &TypeSignature::serialize_many(types)),
        DbusValue::Variant(inner) => {
            encode_signature(enc, &inner.signature().serialize())?;
            encode_at_depth(enc, inner, depth + 1)
        }
        DbusValue::Array { element, items } => {
            encode_array(enc, value_alignment(element), |enc| {
                for item in items {
                    item.expect_signature(element)?;
                    encode_at_depth(enc, item, depth + 1)?;
                }
                Ok(())
            })
        }
        DbusValue::Struct(members) => {
            if members.is_empty() {
                return Err(CodecError::TypeMismatch {
                    expected: "struct with members".into(),
                    found: "()".into(),
                });
            }
            enc.align_write(8)?;
            for member in members {
                encode_at_depth(enc, member, depth + 1)?;
            }
            Ok(())
        }
        DbusValue::Dict {
            key,
            value: value_sig,
            entries,
        } => {
            let key_sig = TypeSignature::Basic(*key);
            encode_array(enc, 8, |enc| {
                for (k, v) in entries {
                    k.expect_signature(&key_sig)?;
                    v.expect_signature(value_sig)?;
                    enc.align_write(8)?;
                    encode_at_depth(enc, k, depth + 1)?;
                    encode_at_depth(enc, v, depth + 1)?;
                }
                Ok(())
            })
        }
    }
}

fn encode_array<F>(
    enc: &mut AlignedEncoder<'_>,
    element_alignment: usize,
    body: F,
) -> Result<(), CodecError>
where
    F: FnOnce(&mut AlignedEncoder<'_>) -> Result<(), CodecError>,
{
    enc.write_u32(0)?;
    let length_at = enc.position() - 4;
    enc.align_write(element_alignment)?;
    let start = enc.position();
    body(enc)?;
    let len = enc.position() - start;
    if len > MAX_ARRAY_LEN {
        return Err(CodecError::LengthTooLarge {
            len,
            max: MAX_ARRAY_LEN,
        });
    }
    enc.patch_u32(length_at, len as u32);
    Ok(())
}

fn encode_string(enc: &mut AlignedEncoder<'_>, s: &str) -> Result<(), CodecError> {
    if s.as_bytes().contains(&0) {
        return Err(CodecError::InteriorNul);
    }
    let len = u32::try_from(s.len()).map_err(|_| CodecError::LengthTooLarge {
        len: s.len(),
        max: u32::MAX as usize,
    })?;
    enc.write_u32(len)?;
    enc.write_bytes(s.as_bytes())?;
    enc.write_u8(0)
}

fn encode_signature(enc: &mut AlignedEncoder<'_>, signature: &str) -> Result<(), CodecError> {
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(CodecError::LengthTooLarge {
            len: signature.len(),
            max: MAX_SIGNATURE_LEN,
        });
    }
    enc.write_u8(signature.len() as u8)?;
    enc.write_bytes(signature.as_bytes())?;
    enc.write_u8(0)
}

pub fn decode_value(
    dec: &mut AlignedDecoder<'_>,
    signature: &TypeSignature,
) -> Result<DbusValue, CodecError> {
    decode_at_depth(dec, signature, 0)
}

/// Decode one value per signature, in order.
pub fn decode_values(
    dec: &mut AlignedDecoder<'_>,
    signatures: &[TypeSignature],
) -> Result<Vec<DbusValue>, CodecError> {
    signatures.iter().map(|sig| decode_value(dec, sig)).collect()
}

fn decode_at_depth(
    dec: &mut AlignedDecoder<'_>,
    signature: &TypeSignature,
    depth: usize,
) -> Result<DbusValue, CodecError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(CodecError::LengthTooLarge {
            len: depth,
            max: MAX_VALUE_DEPTH,
        });
    }

    match signature {
        TypeSignature::Basic(basic) => decode_basic(dec, *basic, depth),
        TypeSignature::Array(element) => {
            let alignment = value_alignment(element);
            let end = read_array_bounds(dec, alignment)?;
            let mut items = Vec::new();
            while dec.position() < end {
                items.push(decode_at_depth(dec, element, depth + 1)?);
            }
            if dec.position() > end {
                return Err(CodecError::ArrayOverrun);
            }
            Ok(DbusValue::Array {
                element: (**element).clone(),
                items,
            })
        }
        TypeSignature::Struct(members) => {
            dec.align_read(8)?;
            let values = members
                .iter()
                .map(|m| decode_at_depth(dec, m, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DbusValue::Struct(values))
        }
        TypeSignature::Dict(key, value) => {
            let key_sig = TypeSignature::Basic(*key);
            let end = read_array_bounds(dec, 8)?;
            let mut entries = Vec::new();
            while dec.position() < end {
                dec.align_read(8)?;
                let k = decode_at_depth(dec, &key_sig, depth + 1)?;
                let v = decode_at_depth(dec, value, depth + 1)?;
                entries.push((k, v));
            }
            if dec.position() > end {
                return Err(CodecError::ArrayOverrun);
            }
            Ok(DbusValue::Dict {
                key: *key,
                value: (**value).clone(),
                entries,
            })
        }
    }
}

/// Read an array length and the padding after it; returns the end position.
pub(crate) fn read_array_bounds(
    dec: &mut AlignedDecoder<'_>,
    alignment: usize,
) -> Result<usize, CodecError> {
    let len = dec.read_u32()? as usize;
    if len > MAX_ARRAY_LEN {
        return Err(CodecError::LengthTooLarge {
            len,
            max: MAX_ARRAY_LEN,
        });
    }
    dec.align_read(alignment)?;
    if len > dec.remaining() {
        return Err(CodecError::UnexpectedEof {
            needed: len,
            available: dec.remaining(),
        });
    }
    Ok(dec.position() + len)
}

fn decode_basic(
    dec: &mut AlignedDecoder<'_>,
    basic: BasicType,
    depth: usize,
) -> Result<DbusValue, CodecError> {
    Ok(match basic {
        BasicType::Byte => DbusValue::Byte(dec.read_u8()?),
        BasicType::Boolean => match dec.read_u32()? {
            0 => DbusValue::Boolean(false),
            1 => DbusValue::Boolean(true),
            other => return Err(CodecError::InvalidBoolean(other)),
        },
        BasicType::Int16 => DbusValue::Int16(dec.read_i16()?),
        BasicType::Uint16 => DbusValue::Uint16(dec.read_u16()?),
        BasicType::Int32 => DbusValue::Int32(dec.read_i32()?),
        BasicType::Uint32 => DbusValue::Uint32(dec.read_u32()?),
        BasicType::Int64 => DbusValue::Int64(dec.read_i64()?),
        BasicType::Uint64 => DbusValue::Uint64(dec.read_u64()?),
        BasicType::Double => DbusValue::Double(dec.read_f64()?),
        BasicType::UnixFd => DbusValue::UnixFd(dec.read_u32()?),
        BasicType::String => DbusValue::String(decode_string(dec)?),
        BasicType::ObjectPath => {
            let path = decode_string(dec)?;
            validate_object_path(&path)?;
            DbusValue::ObjectPath(path)
        }
        BasicType::Signature => {
            let text = decode_signature(dec)?;
            DbusValue::Signature(TypeSignature::parse_many(&text)?)
        }
        BasicType::Variant => {
            let text = decode_signature(dec)?;
            let inner_sig =
                TypeSignature::parse(&text).map_err(|_| CodecError::InvalidVariant(text.clone()))?;
            DbusValue::Variant(Box::new(decode_at_depth(dec, &inner_sig, depth + 1)?))
        }
    })
}

fn decode_string(dec: &mut AlignedDecoder<'_>) -> Result<String, CodecError> {
    let len = dec.read_u32()? as usize;
    let bytes = dec.read_bytes(len)?;
    finish_string(dec, bytes)
}

pub(crate) fn decode_signature(dec: &mut AlignedDecoder<'_>) -> Result<String, CodecError> {
    let len = dec.read_u8()? as usize;
    let bytes = dec.read_bytes(len)?;
    finish_string(dec, bytes)
}

fn finish_string(dec: &mut AlignedDecoder<'_>, bytes: &[u8]) -> Result<String, CodecError> {
    if dec.read_u8()? != 0 {
        return Err(CodecError::MissingNul);
    }
    if bytes.contains(&0) {
        return Err(CodecError::InteriorNul);
    }
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &DbusValue) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_value(&mut AlignedEncoder::new(&mut buf), value).unwrap();
        buf
    }

    fn decode(bytes: &[u8], sig: &str) -> Result<DbusValue, CodecError> {
        let sig = TypeSignature::parse(sig).unwrap();
        decode_value(&mut AlignedDecoder::new(bytes), &sig)
    }

    #[test]
    fn test_string_layout() {
        assert_eq!(encode(&DbusValue::string("hi")), [2, 0, 0, 0, b'h', b'i', 0]);
    }

    #[test]
    fn test_array_pads_to_element_boundary() {
        let v = DbusValue::array(BasicType::Uint64.into(), vec![DbusValue::Uint64(7)]).unwrap();
        let bytes = encode(&v);
        assert_eq!(
            bytes,
            [8, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(decode(&bytes, "at").unwrap(), v);
    }

    #[test]
    fn test_empty_array_still_pads() {
        let v = DbusValue::array(BasicType::Uint64.into(), vec![]).unwrap();
        assert_eq!(encode(&v), [0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_variant_layout() {
        let bytes = encode(&DbusValue::variant(DbusValue::Int32(5)));
        assert_eq!(bytes, [1, b'i', 0, 0, 5, 0, 0, 0]);
        assert_eq!(
            decode(&bytes, "v").unwrap(),
            DbusValue::variant(DbusValue::Int32(5))
        );
    }

    #[test]
    fn test_dict_layout() {
        let v = DbusValue::dict(
            BasicType::String,
            BasicType::Byte.into(),
            vec![(DbusValue::string("a"), DbusValue::Byte(1))],
        )
        .unwrap();
        let bytes = encode(&v);
        assert_eq!(
            bytes,
            [7, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, b'a', 0, 1]
        );
        assert_eq!(decode(&bytes, "a{sy}").unwrap(), v);
    }

    #[test]
    fn test_nested_roundtrip() {
        let props = DbusValue::dict(
            BasicType::String,
            BasicType::Variant.into(),
            vec![
                (
                    DbusValue::string("Count"),
                    DbusValue::variant(DbusValue::Uint64(3)),
                ),
                (
                    DbusValue::string("Names"),
                    DbusValue::variant(
                        DbusValue::array(
                            BasicType::String.into(),
                            vec![DbusValue::string("x"), DbusValue::string("yz")],
                        )
                        .unwrap(),
                    ),
                ),
            ],
        )
        .unwrap();
        let value = DbusValue::Struct(vec![
            DbusValue::Byte(9),
            DbusValue::object_path("/a/b").unwrap(),
            props,
            DbusValue::Boolean(true),
            DbusValue::Double(1.5),
        ]);
        let bytes = encode(&value);
        assert_eq!(decode(&bytes, "(yoa{sv}bd)").unwrap(), value);
    }

    #[test]
    fn test_array_of_dicts_aligns_inner_prefix_to_four() {
        let inner = DbusValue::dict(BasicType::Byte, BasicType::Byte.into(), vec![]).unwrap();
        let v = DbusValue::array(inner.signature(), vec![inner]).unwrap();
        let bytes = encode(&v);
        // outer length, then the inner length right after it with no pad
        assert_eq!(bytes, [4, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(decode(&bytes, "aa{yy}").unwrap(), v);
    }

    #[test]
    fn test_decode_rejects_bad_padding() {
        let bytes = [1, b'i', 0, 7, 5, 0, 0, 0];
        assert_eq!(
            decode(&bytes, "v"),
            Err(CodecError::MalformedPadding { position: 3 })
        );
    }

    #[test]
    fn test_decode_rejects_bad_boolean_and_strings() {
        assert_eq!(decode(&[2, 0, 0, 0], "b"), Err(CodecError::InvalidBoolean(2)));
        assert_eq!(
            decode(&[1, 0, 0, 0, b'a', 1], "s"),
            Err(CodecError::MissingNul)
        );
        assert_eq!(
            decode(&[1, 0, 0, 0, 0xFF, 0], "s"),
            Err(CodecError::InvalidUtf8)
        );
        assert!(matches!(
            decode(&[2, 0, 0, 0, b'a', b'b'], "s"),
            Err(CodecError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            decode(&[1, 0, 0, 0, b'x', 0], "o"),
            Err(CodecError::InvalidObjectPath(_))
        ));
    }

    #[test]
    fn test_decode_rejects_array_length_past_buffer() {
        assert!(matches!(
            decode(&[16, 0, 0, 0, 1, 2], "ay"),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_encode_rejects_mismatched_items() {
        let bad = DbusValue::Array {
            element: BasicType::Int32.into(),
            items: vec![DbusValue::Byte(1)],
        };
        let mut buf = Vec::new();
        assert!(matches!(
            encode_value(&mut AlignedEncoder::new(&mut buf), &bad),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_resumed_decode_respects_message_offset() {
        // A u32 at logical offset 4, buffer starts at logical 2 (2 pad bytes).
        let bytes = [0, 0, 42, 0, 0, 0];
        let mut dec = AlignedDecoder::resumed(&bytes, 2, 8);
        assert_eq!(
            decode_value(&mut dec, &BasicType::Uint32.into()).unwrap(),
            DbusValue::Uint32(42)
        );
    }
}
