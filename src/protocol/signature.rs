//! Type signatures
//!
//! Every value on the wire has a shape described by a compact signature
//! string:
//!
//! ```text
//! y byte      b boolean   n int16    q uint16   i int32    u uint32
//! x int64     t uint64    d double   s string   o path     g signature
//! h unix fd   v variant   a<T> array (<T>...) struct     a{<K><V>} dict
//! ```
//!
//! [`TypeSignature`] is the parsed, immutable form. It knows its alignment
//! and, for fixed-size basic types, its byte length.

use std::fmt;
use std::str::FromStr;

use crate::error::SignatureError;

/// Maximum nesting for arrays, and separately for structs/dict entries.
pub const MAX_CONTAINER_DEPTH: usize = 32;

/// Maximum length of a signature on the wire (length is a single byte).
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Leaf types, each with a one-character code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BasicType {
    Byte,
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
}

impl BasicType {
    pub const ALL: [BasicType; 14] = [
        BasicType::Byte,
        BasicType::Boolean,
        BasicType::Int16,
        BasicType::Uint16,
        BasicType::Int32,
        BasicType::Uint32,
        BasicType::Int64,
        BasicType::Uint64,
        BasicType::Double,
        BasicType::String,
        BasicType::ObjectPath,
        BasicType::Signature,
        BasicType::UnixFd,
        BasicType::Variant,
    ];

    #[inline(always)]
    pub const fn code(self) -> char {
        match self {
            BasicType::Byte => 'y',
            BasicType::Boolean => 'b',
            BasicType::Int16 => 'n',
            BasicType::Uint16 => 'q',
            BasicType::Int32 => 'i',
            BasicType::Uint32 => 'u',
            BasicType::Int64 => 'x',
            BasicType::Uint64 => 't',
            BasicType::Double => 'd',
            BasicType::String => 's',
            BasicType::ObjectPath => 'o',
            BasicType::Signature => 'g',
            BasicType::UnixFd => 'h',
            BasicType::Variant => 'v',
        }
    }

    #[inline(always)]
    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Boundary the value (or its length prefix) starts on.
    #[inline(always)]
    pub const fn alignment(self) -> usize {
        match self {
            BasicType::Byte | BasicType::Signature | BasicType::Variant => 1,
            BasicType::Int16 | BasicType::Uint16 => 2,
            BasicType::Boolean
            | BasicType::Int32
            | BasicType::Uint32
            | BasicType::String
            | BasicType::ObjectPath
            | BasicType::UnixFd => 4,
            BasicType::Int64 | BasicType::Uint64 | BasicType::Double => 8,
        }
    }

    /// Encoded size, or `None` for length-prefixed types.
    #[inline(always)]
    pub const fn fixed_length(self) -> Option<usize> {
        match self {
            BasicType::Byte => Some(1),
            BasicType::Int16 | BasicType::Uint16 => Some(2),
            BasicType::Boolean | BasicType::Int32 | BasicType::Uint32 | BasicType::UnixFd => {
                Some(4)
            }
            BasicType::Int64 | BasicType::Uint64 | BasicType::Double => Some(8),
            BasicType::String
            | BasicType::ObjectPath
            | BasicType::Signature
            | BasicType::Variant => None,
        }
    }

    pub fn serialize(self) -> String {
        self.code().to_string()
    }
}

/// Shape of a wire value.
///
/// Structs must have at least one member; build them with
/// [`TypeSignature::structure`] to have that checked. Dict keys are
/// [`BasicType`] by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSignature {
    Basic(BasicType),
    Array(Box<TypeSignature>),
    Struct(Vec<TypeSignature>),
    Dict(BasicType, Box<TypeSignature>),
}

impl From<BasicType> for TypeSignature {
    fn from(basic: BasicType) -> Self {
        TypeSignature::Basic(basic)
    }
}

impl TypeSignature {
    pub fn array(element: impl Into<TypeSignature>) -> Self {
        TypeSignature::Array(Box::new(element.into()))
    }

    pub fn structure(members: Vec<TypeSignature>) -> Result<Self, SignatureError> {
        if members.is_empty() {
            return Err(SignatureError::EmptyStruct { position: 0 });
        }
        Ok(TypeSignature::Struct(members))
    }

    pub fn dict(key: BasicType, value: impl Into<TypeSignature>) -> Self {
        TypeSignature::Dict(key, Box::new(value.into()))
    }

    #[inline]
    pub fn as_basic(&self) -> Option<BasicType> {
        match self {
            TypeSignature::Basic(b) => Some(*b),
            _ => None,
        }
    }

    /// Arrays align their length prefix to 4; structs and dicts report the
    /// dict-entry boundary of 8. A dict's own length prefix still sits on 4.
    #[inline]
    pub fn alignment(&self) -> usize {
        match self {
            TypeSignature::Basic(b) => b.alignment(),
            TypeSignature::Array(_) => 4,
            TypeSignature::Struct(_) | TypeSignature::Dict(..) => 8,
        }
    }

    #[inline]
    pub fn fixed_length(&self) -> Option<usize> {
        self.as_basic().and_then(BasicType::fixed_length)
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out);
        out
    }

    fn write_into(&self, out: &mut String) {
        match self {
            TypeSignature::Basic(b) => out.push(b.code()),
            TypeSignature::Array(element) => {
                out.push('a');
                element.write_into(out);
            }
            TypeSignature::Struct(members) => {
                out.push('(');
                for member in members {
                    member.write_into(out);
                }
                out.push(')');
            }
            TypeSignature::Dict(key, value) => {
                out.push_str("a{");
                out.push(key.code());
                value.write_into(out);
                out.push('}');
            }
        }
    }

    /// Parse exactly one complete type.
    pub fn parse(signature: &str) -> Result<Self, SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Empty);
        }
        check_length(signature)?;

        let mut parser = Parser::new(signature.as_bytes());
        let parsed = parser.parse_one()?;
        if parser.pos != signature.len() {
            return Err(SignatureError::Trailing {
                position: parser.pos,
            });
        }
        Ok(parsed)
    }

    /// Parse a sequence of complete types, e.g. a message body signature.
    /// The empty string is a valid, empty sequence.
    pub fn parse_many(signature: &str) -> Result<Vec<Self>, SignatureError> {
        check_length(signature)?;

        let mut parser = Parser::new(signature.as_bytes());
        let mut types = Vec::new();
        while parser.pos < signature.len() {
            types.push(parser.parse_one()?);
        }
        Ok(types)
    }

    /// Concatenated signature of a sequence of types.
    pub fn serialize_many(types: &[TypeSignature]) -> String {
        let mut out = String::new();
        for t in types {
            t.write_into(&mut out);
        }
        out
    }
}

impl fmt::Display for TypeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl FromStr for TypeSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TypeSignature::parse(s)
    }
}

fn check_length(signature: &str) -> Result<(), SignatureError> {
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(SignatureError::TooLong {
            len: signature.len(),
        });
    }
    Ok(())
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    array_depth: usize,
    struct_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            array_depth: 0,
            struct_depth: 0,
        }
    }

    #[inline(always)]
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_one(&mut self) -> Result<TypeSignature, SignatureError> {
        let position = self.pos;
        let code = self.peek().ok_or(SignatureError::UnexpectedEnd)?;
        self.pos += 1;

        match code {
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_CONTAINER_DEPTH {
                    return Err(SignatureError::TooDeep {
                        max: MAX_CONTAINER_DEPTH,
                    });
                }
                let parsed = if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_body(position + 1)
                } else {
                    self.parse_one().map(TypeSignature::array)
                };
                self.array_depth -= 1;
                parsed
            }
            b'(' => {
                self.enter_struct()?;
                let mut members = Vec::new();
                loop {
                    match self.peek() {
                        None => {
                            return Err(SignatureError::UnmatchedDelimiter {
                                delimiter: '(',
                                position,
                            })
                        }
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => members.push(self.parse_one()?),
                    }
                }
                self.struct_depth -= 1;
                if members.is_empty() {
                    return Err(SignatureError::EmptyStruct { position });
                }
                Ok(TypeSignature::Struct(members))
            }
            b')' | b'}' => Err(SignatureError::UnmatchedDelimiter {
                delimiter: char::from(code),
                position,
            }),
            other => BasicType::from_code(char::from(other))
                .map(TypeSignature::Basic)
                .ok_or(SignatureError::UnknownCode {
                    code: char::from(other),
                    position,
                }),
        }
    }

    fn parse_dict_body(&mut self, open: usize) -> Result<TypeSignature, SignatureError> {
        self.enter_struct()?;
        let mut members = Vec::with_capacity(2);
        loop {
            match self.peek() {
                None => {
                    return Err(SignatureError::UnmatchedDelimiter {
                        delimiter: '{',
                        position: open,
                    })
                }
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => members.push(self.parse_one()?),
            }
        }
        self.struct_depth -= 1;

        let found = members.len();
        let value = members.pop();
        let key = members.pop();
        match (key, value) {
            (Some(TypeSignature::Basic(key)), Some(value)) if found == 2 => {
                Ok(TypeSignature::dict(key, value))
            }
            (Some(key), Some(_)) if found == 2 => {
                Err(SignatureError::DictKeyNotBasic(key.serialize()))
            }
            _ => Err(SignatureError::DictArity { found }),
        }
    }

    fn enter_struct(&mut self) -> Result<(), SignatureError> {
        self.struct_depth += 1;
        if self.struct_depth > MAX_CONTAINER_DEPTH {
            return Err(SignatureError::TooDeep {
                max: MAX_CONTAINER_DEPTH,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn int32() -> TypeSignature {
        TypeSignature::Basic(BasicType::Int32)
    }

    #[test]
    fn test_serialize_literals() {
        assert_eq!(BasicType::Int32.serialize(), "i");
        assert_eq!(TypeSignature::array(BasicType::Int32).serialize(), "ai");
        assert_eq!(
            TypeSignature::structure(vec![int32(), int32()])
                .unwrap()
                .serialize(),
            "(ii)"
        );
        assert_eq!(
            TypeSignature::dict(BasicType::Int32, BasicType::Int32).serialize(),
            "a{ii}"
        );
        assert_eq!(BasicType::Int32.fixed_length(), Some(4));
    }

    #[test]
    fn test_alignment_table() {
        assert_eq!(BasicType::Byte.alignment(), 1);
        assert_eq!(BasicType::Int16.alignment(), 2);
        assert_eq!(BasicType::String.alignment(), 4);
        assert_eq!(BasicType::UnixFd.alignment(), 4);
        assert_eq!(BasicType::Double.alignment(), 8);
        assert_eq!(TypeSignature::array(BasicType::Int64).alignment(), 4);
        assert_eq!(TypeSignature::parse("(y)").unwrap().alignment(), 8);
        assert_eq!(TypeSignature::parse("a{sv}").unwrap().alignment(), 8);
    }

    #[test]
    fn test_fixed_length_absent_for_prefixed() {
        for t in [
            BasicType::String,
            BasicType::ObjectPath,
            BasicType::Signature,
            BasicType::Variant,
        ] {
            assert_eq!(t.fixed_length(), None);
        }
        assert_eq!(TypeSignature::array(BasicType::Byte).fixed_length(), None);
        assert_eq!(TypeSignature::from(BasicType::Double).fixed_length(), Some(8));
    }

    #[test]
    fn test_parse_nested() {
        let sig = TypeSignature::parse("a(sa{sv}as)").unwrap();
        assert_eq!(sig.serialize(), "a(sa{sv}as)");
        match sig {
            TypeSignature::Array(inner) => match *inner {
                TypeSignature::Struct(ref members) => assert_eq!(members.len(), 3),
                ref other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(TypeSignature::parse(""), Err(SignatureError::Empty));
        assert_eq!(
            TypeSignature::parse("z"),
            Err(SignatureError::UnknownCode {
                code: 'z',
                position: 0
            })
        );
        assert_eq!(
            TypeSignature::parse("(ii"),
            Err(SignatureError::UnmatchedDelimiter {
                delimiter: '(',
                position: 0
            })
        );
        assert_eq!(
            TypeSignature::parse("i)"),
            Err(SignatureError::Trailing { position: 1 })
        );
        assert_eq!(
            TypeSignature::parse(")"),
            Err(SignatureError::UnmatchedDelimiter {
                delimiter: ')',
                position: 0
            })
        );
        assert_eq!(
            TypeSignature::parse("a{iii}"),
            Err(SignatureError::DictArity { found: 3 })
        );
        assert_eq!(
            TypeSignature::parse("a{i}"),
            Err(SignatureError::DictArity { found: 1 })
        );
        assert_eq!(
            TypeSignature::parse("a{(i)i}"),
            Err(SignatureError::DictKeyNotBasic("(i)".to_string()))
        );
        assert_eq!(TypeSignature::parse("a"), Err(SignatureError::UnexpectedEnd));
        assert_eq!(
            TypeSignature::parse("()"),
            Err(SignatureError::EmptyStruct { position: 0 })
        );
        assert!(matches!(
            TypeSignature::parse("a{is"),
            Err(SignatureError::UnmatchedDelimiter { delimiter: '{', .. })
        ));
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}i", "a".repeat(MAX_CONTAINER_DEPTH));
        assert!(TypeSignature::parse(&deep).is_ok());
        let too_deep = format!("{}i", "a".repeat(MAX_CONTAINER_DEPTH + 1));
        assert_eq!(
            TypeSignature::parse(&too_deep),
            Err(SignatureError::TooDeep {
                max: MAX_CONTAINER_DEPTH
            })
        );
    }

    #[test]
    fn test_parse_many() {
        assert!(TypeSignature::parse_many("").unwrap().is_empty());
        let types = TypeSignature::parse_many("sa{sv}i").unwrap();
        assert_eq!(types.len(), 3);
        assert_eq!(TypeSignature::serialize_many(&types), "sa{sv}i");
        assert!(TypeSignature::parse_many("s(").is_err());
    }

    fn arb_basic() -> impl Strategy<Value = BasicType> {
        proptest::sample::select(BasicType::ALL.to_vec())
    }

    fn arb_signature() -> impl Strategy<Value = TypeSignature> {
        let leaf = arb_basic().prop_map(TypeSignature::Basic);
        leaf.prop_recursive(4, 24, 4, |inner| {
            prop_oneof![
                inner.clone().prop_map(TypeSignature::array),
                proptest::collection::vec(inner.clone(), 1..4).prop_map(TypeSignature::Struct),
                (arb_basic(), inner).prop_map(|(k, v)| TypeSignature::dict(k, v)),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_parse_inverts_serialize(sig in arb_signature()) {
            let text = sig.serialize();
            prop_assert_eq!(TypeSignature::parse(&text).unwrap(), sig);
        }

        #[test]
        fn prop_serialize_inverts_parse(sig in arb_signature()) {
            let text = sig.serialize();
            let reparsed = TypeSignature::parse(&text).unwrap();
            prop_assert_eq!(reparsed.serialize(), text);
        }
    }
}
