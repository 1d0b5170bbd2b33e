//! Message framing
//!
//! Layout:
//! ┌──────────────────────────────────────────────────────────────┐
//! │ endian(y) type(y) flags(y) version(y) body_len(u) serial(u)  │ 12 bytes
//! ├──────────────────────────────────────────────────────────────┤
//! │ header fields a(yv)                                          │ variable
//! ├──────────────────────────────────────────────────────────────┤
//! │ padding to 8                                                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ body, shaped by the SIGNATURE header field                   │ body_len
//! └──────────────────────────────────────────────────────────────┘
//!
//! The first 16 bytes (fixed part plus the header-field array length) are
//! enough to know the size of the whole frame.

use std::sync::Arc;

use crate::core::MemoizingCache;
use crate::error::CodecError;
use crate::protocol::cursor::{AlignedDecoder, AlignedEncoder, Endianness};
use crate::protocol::marshal::{
    decode_signature, decode_value, decode_values, encode_value, encode_values, read_array_bounds,
};
use crate::protocol::signature::{BasicType, TypeSignature};
use crate::protocol::value::{validate_object_path, DbusValue};

/// Bytes needed before [`frame_length`] can size a frame.
pub const HEADER_PREFIX_SIZE: usize = 16;
pub const PROTOCOL_VERSION: u8 = 1;
/// 128 MiB upper bound for a whole message.
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;

/// Parsed body signatures keyed by their text. Shared across connections.
pub type SignatureCache = MemoizingCache<String, Arc<Vec<TypeSignature>>>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    #[inline(always)]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodReturn),
            3 => Some(Self::Error),
            4 => Some(Self::Signal),
            _ => None,
        }
    }
}

/// Header flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    pub const NO_REPLY_EXPECTED: MessageFlags = MessageFlags(0x1);
    pub const NO_AUTO_START: MessageFlags = MessageFlags(0x2);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: MessageFlags = MessageFlags(0x4);

    #[inline(always)]
    pub const fn from_bits(bits: u8) -> Self {
        MessageFlags(bits)
    }

    #[inline(always)]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline(always)]
    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: MessageFlags) -> Self {
        MessageFlags(self.0 | other.0)
    }
}

/// Header field codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderField {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Path),
            2 => Some(Self::Interface),
            3 => Some(Self::Member),
            4 => Some(Self::ErrorName),
            5 => Some(Self::ReplySerial),
            6 => Some(Self::Destination),
            7 => Some(Self::Sender),
            8 => Some(Self::Signature),
            9 => Some(Self::UnixFds),
            _ => None,
        }
    }

    fn value_type(self) -> BasicType {
        match self {
            HeaderField::Path => BasicType::ObjectPath,
            HeaderField::ReplySerial | HeaderField::UnixFds => BasicType::Uint32,
            HeaderField::Signature => BasicType::Signature,
            _ => BasicType::String,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    /// Body types. Shared with the [`SignatureCache`] when decoded through one.
    pub signature: Arc<Vec<TypeSignature>>,
    pub unix_fds: Option<u32>,
}

impl HeaderFields {
    fn to_value(&self) -> DbusValue {
        let entry = |field: HeaderField, value: DbusValue| {
            DbusValue::Struct(vec![
                DbusValue::Byte(field as u8),
                DbusValue::variant(value),
            ])
        };
        let strings = [
            (HeaderField::Interface, &self.interface),
            (HeaderField::Member, &self.member),
            (HeaderField::ErrorName, &self.error_name),
        ];

        let mut items = Vec::new();
        if let Some(path) = &self.path {
            items.push(entry(HeaderField::Path, DbusValue::ObjectPath(path.clone())));
        }
        for (field, value) in strings {
            if let Some(v) = value {
                items.push(entry(field, DbusValue::String(v.clone())));
            }
        }
        if let Some(serial) = self.reply_serial {
            items.push(entry(HeaderField::ReplySerial, DbusValue::Uint32(serial)));
        }
        if let Some(v) = &self.destination {
            items.push(entry(HeaderField::Destination, DbusValue::String(v.clone())));
        }
        if let Some(v) = &self.sender {
            items.push(entry(HeaderField::Sender, DbusValue::String(v.clone())));
        }
        if !self.signature.is_empty() {
            items.push(entry(
                HeaderField::Signature,
                DbusValue::Signature(self.signature.as_ref().clone()),
            ));
        }
        if let Some(n) = self.unix_fds {
            items.push(entry(HeaderField::UnixFds, DbusValue::Uint32(n)));
        }

        DbusValue::Array {
            element: header_entry_signature(),
            items,
        }
    }

    fn set(&mut self, field: HeaderField, value: DbusValue) -> Result<(), CodecError> {
        let expected = TypeSignature::Basic(field.value_type());
        value.expect_signature(&expected)?;
        match (field, value) {
            (HeaderField::Path, DbusValue::ObjectPath(v)) => self.path = Some(v),
            (HeaderField::Interface, DbusValue::String(v)) => self.interface = Some(v),
            (HeaderField::Member, DbusValue::String(v)) => self.member = Some(v),
            (HeaderField::ErrorName, DbusValue::String(v)) => self.error_name = Some(v),
            (HeaderField::ReplySerial, DbusValue::Uint32(v)) => self.reply_serial = Some(v),
            (HeaderField::Destination, DbusValue::String(v)) => self.destination = Some(v),
            (HeaderField::Sender, DbusValue::String(v)) => self.sender = Some(v),
            (HeaderField::Signature, DbusValue::Signature(v)) => self.signature = Arc::new(v),
            (HeaderField::UnixFds, DbusValue::Uint32(v)) => self.unix_fds = Some(v),
            _ => {}
        }
        Ok(())
    }
}

fn header_entry_signature() -> TypeSignature {
    TypeSignature::Struct(vec![BasicType::Byte.into(), BasicType::Variant.into()])
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: MessageFlags,
    /// Zero until the message has been sent or received.
    pub serial: u32,
    pub fields: HeaderFields,
    pub body: Vec<DbusValue>,
}

impl Message {
    fn new(message_type: MessageType, fields: HeaderFields) -> Self {
        Self {
            message_type,
            flags: MessageFlags::NONE,
            serial: 0,
            fields,
            body: Vec::new(),
        }
    }

    pub fn method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Self, CodecError> {
        validate_object_path(path)?;
        Ok(Self::new(
            MessageType::MethodCall,
            HeaderFields {
                path: Some(path.to_string()),
                interface: interface.map(str::to_string),
                member: Some(member.to_string()),
                destination: destination.map(str::to_string),
                ..HeaderFields::default()
            },
        ))
    }

    pub fn signal(path: &str, interface: &str, member: &str) -> Result<Self, CodecError> {
        validate_object_path(path)?;
        Ok(Self::new(
            MessageType::Signal,
            HeaderFields {
                path: Some(path.to_string()),
                interface: Some(interface.to_string()),
                member: Some(member.to_string()),
                ..HeaderFields::default()
            },
        ))
    }

    pub fn method_return(reply_serial: u32) -> Self {
        Self::new(
            MessageType::MethodReturn,
            HeaderFields {
                reply_serial: Some(reply_serial),
                ..HeaderFields::default()
            },
        )
    }

    pub fn error(reply_serial: u32, error_name: &str) -> Self {
        Self::new(
            MessageType::Error,
            HeaderFields {
                reply_serial: Some(reply_serial),
                error_name: Some(error_name.to_string()),
                ..HeaderFields::default()
            },
        )
    }

    /// Replace the body; the SIGNATURE field follows the values.
    #[must_use]
    pub fn with_body(mut self, body: Vec<DbusValue>) -> Self {
        self.fields.signature = Arc::new(body.iter().map(DbusValue::signature).collect());
        self.body = body;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.fields.destination = Some(destination.to_string());
        self
    }

    /// Check the fields every message of this type must carry.
    pub fn validate(&self) -> Result<(), CodecError> {
        let f = &self.fields;
        let missing = match self.message_type {
            MessageType::MethodCall if f.path.is_none() => Some("PATH"),
            MessageType::MethodCall if f.member.is_none() => Some("MEMBER"),
            MessageType::Signal if f.path.is_none() => Some("PATH"),
            MessageType::Signal if f.interface.is_none() => Some("INTERFACE"),
            MessageType::Signal if f.member.is_none() => Some("MEMBER"),
            MessageType::Error if f.error_name.is_none() => Some("ERROR_NAME"),
            MessageType::Error | MessageType::MethodReturn if f.reply_serial.is_none() => {
                Some("REPLY_SERIAL")
            }
            _ => None,
        };
        match missing {
            Some(name) => Err(CodecError::InvalidMessage(format!(
                "{:?} without {} header field",
                self.message_type, name
            ))),
            None => Ok(()),
        }
    }

    /// Encode with the given serial, little-endian.
    pub fn encode(&self, serial: u32) -> Result<Vec<u8>, CodecError> {
        if serial == 0 {
            return Err(CodecError::InvalidMessage("serial must be non-zero".into()));
        }
        self.validate()?;
        let declared: Vec<TypeSignature> = self.body.iter().map(DbusValue::signature).collect();
        if declared != *self.fields.signature {
            return Err(CodecError::TypeMismatch {
                expected: TypeSignature::serialize_many(&self.fields.signature),
                found: TypeSignature::serialize_many(&declared),
            });
        }

        // The body starts on an 8-byte boundary of the message, so encoding
        // it from offset zero yields the same padding.
        let mut body = Vec::new();
        encode_values(&mut AlignedEncoder::new(&mut body), &self.body)?;

        let mut out = Vec::with_capacity(HEADER_PREFIX_SIZE + 64 + body.len());
        let mut enc = AlignedEncoder::new(&mut out).with_capacity_limit(MAX_MESSAGE_SIZE);
        enc.write_u8(Endianness::Little.marker())?;
        enc.write_u8(self.message_type as u8)?;
        enc.write_u8(self.flags.bits())?;
        enc.write_u8(PROTOCOL_VERSION)?;
        enc.write_u32(body.len() as u32)?;
        enc.write_u32(serial)?;
        encode_value(&mut enc, &self.fields.to_value())?;
        enc.align_write(8)?;
        enc.write_bytes(&body)?;
        Ok(out)
    }

    /// Decode one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        decode_frame(frame, None)
    }

    /// Decode one complete frame, reusing parsed body signatures.
    pub fn decode_cached(frame: &[u8], signatures: &SignatureCache) -> Result<Self, CodecError> {
        decode_frame(frame, Some(signatures))
    }

    pub fn member(&self) -> Option<&str> {
        self.fields.member.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.fields.interface.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.fields.path.as_deref()
    }
}

fn read_fixed_prefix(frame: &[u8]) -> Result<(Endianness, usize, usize), CodecError> {
    if frame.len() < HEADER_PREFIX_SIZE {
        return Err(CodecError::UnexpectedEof {
            needed: HEADER_PREFIX_SIZE,
            available: frame.len(),
        });
    }
    let endianness = Endianness::from_marker(frame[0]).ok_or_else(|| {
        CodecError::InvalidMessage(format!("bad endianness marker 0x{:02x}", frame[0]))
    })?;
    if frame[3] != PROTOCOL_VERSION {
        return Err(CodecError::InvalidMessage(format!(
            "unsupported protocol version {}",
            frame[3]
        )));
    }
    let word = |at: usize| {
        let raw = [frame[at], frame[at + 1], frame[at + 2], frame[at + 3]];
        match endianness {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        }
    };
    Ok((endianness, word(4) as usize, word(12) as usize))
}

/// Total size of the frame at the start of `buffer`, once the first
/// [`HEADER_PREFIX_SIZE`] bytes are present. `Ok(None)` means "need more".
pub fn frame_length(buffer: &[u8]) -> Result<Option<usize>, CodecError> {
    if buffer.len() < HEADER_PREFIX_SIZE {
        return Ok(None);
    }
    let (_, body_len, fields_len) = read_fixed_prefix(buffer)?;
    let header_end = HEADER_PREFIX_SIZE + fields_len;
    let padded = (header_end + 7) & !7;
    let total = padded + body_len;
    if total > MAX_MESSAGE_SIZE {
        return Err(CodecError::LengthTooLarge {
            len: total,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(Some(total))
}

fn decode_frame(frame: &[u8], signatures: Option<&SignatureCache>) -> Result<Message, CodecError> {
    let (endianness, body_len, _) = read_fixed_prefix(frame)?;
    let mut dec = AlignedDecoder::new(frame).with_endianness(endianness);

    dec.read_u8()?;
    let raw_type = dec.read_u8()?;
    let message_type = MessageType::from_u8(raw_type)
        .ok_or_else(|| CodecError::InvalidMessage(format!("unknown message type {raw_type}")))?;
    let flags = MessageFlags::from_bits(dec.read_u8()?);
    dec.read_u8()?;
    dec.read_u32()?;
    let serial = dec.read_u32()?;
    if serial == 0 {
        return Err(CodecError::InvalidMessage("serial must be non-zero".into()));
    }

    let fields = decode_header_fields(&mut dec, signatures)?;
    dec.align_read(8)?;
    let body_bytes = dec.read_bytes(body_len)?;
    if !dec.is_exhausted() {
        return Err(CodecError::InvalidMessage(format!(
            "{} bytes past end of frame",
            dec.remaining()
        )));
    }

    let mut body_dec = AlignedDecoder::new(body_bytes).with_endianness(endianness);
    let body = decode_values(&mut body_dec, &fields.signature)?;
    if !body_dec.is_exhausted() {
        return Err(CodecError::InvalidMessage(
            "body longer than its signature".into(),
        ));
    }

    let message = Message {
        message_type,
        flags,
        serial,
        fields,
        body,
    };
    message.validate()?;
    Ok(message)
}

fn decode_header_fields(
    dec: &mut AlignedDecoder<'_>,
    signatures: Option<&SignatureCache>,
) -> Result<HeaderFields, CodecError> {
    let mut fields = HeaderFields::default();
    let end = read_array_bounds(dec, 8)?;

    while dec.position() < end {
        dec.align_read(8)?;
        let code = dec.read_u8()?;
        let value_type = decode_signature(dec)?;

        // The body signature is looked up by its text, so a hit skips parsing.
        if code == HeaderField::Signature as u8 && value_type == "g" {
            let text = decode_signature(dec)?;
            fields.signature = match signatures {
                Some(cache) => cache.try_compute_if_absent(text, |t| {
                    TypeSignature::parse_many(t).map(Arc::new)
                })?,
                None => Arc::new(TypeSignature::parse_many(&text)?),
            };
            continue;
        }

        let inner = TypeSignature::parse(&value_type)
            .map_err(|_| CodecError::InvalidVariant(value_type.clone()))?;
        let value = decode_value(dec, &inner)?;
        if let Some(field) = HeaderField::from_u8(code) {
            fields.set(field, value)?;
        }
    }
    if dec.position() > end {
        return Err(CodecError::ArrayOverrun);
    }
    Ok(fields)
}

/// Splits a byte stream into complete frames.
///
/// Stops at the first incomplete frame; [`FrameSplitter::consumed`] tells
/// how many bytes were handed out.
pub struct FrameSplitter<'a> {
    buffer: &'a [u8],
    read_pos: usize,
}

impl<'a> FrameSplitter<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            read_pos: 0,
        }
    }

    #[inline(always)]
    pub fn consumed(&self) -> usize {
        self.read_pos
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.read_pos
    }
}

impl<'a> Iterator for FrameSplitter<'a> {
    type Item = Result<&'a [u8], CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buffer[self.read_pos..];
        match frame_length(rest) {
            Ok(Some(total)) if total <= rest.len() => {
                self.read_pos += total;
                Some(Ok(&rest[..total]))
            }
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Message {
        Message::method_call(
            Some("org.freedesktop.DBus"),
            "/org/freedesktop/DBus",
            Some("org.freedesktop.DBus"),
            "Hello",
        )
        .unwrap()
    }

    #[test]
    fn test_encode_fixed_prefix() {
        let bytes = hello().encode(1).unwrap();
        assert_eq!(&bytes[..4], &[b'l', 1, 0, 1]);
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(bytes.len() % 8, 0);
        assert_eq!(frame_length(&bytes).unwrap(), Some(bytes.len()));
    }

    #[test]
    fn test_encode_decode_with_body() {
        let msg = Message::signal("/a", "org.example.Iface", "Changed")
            .unwrap()
            .with_body(vec![DbusValue::string("name"), DbusValue::Uint64(9)]);
        let bytes = msg.encode(7).unwrap();

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.serial, 7);
        assert_eq!(decoded.message_type, MessageType::Signal);
        assert_eq!(decoded.member(), Some("Changed"));
        assert_eq!(decoded.body, msg.body);
        assert_eq!(TypeSignature::serialize_many(&decoded.fields.signature), "st");
    }

    #[test]
    fn test_decode_cached_shares_signatures() {
        let cache = SignatureCache::new();
        let bytes = Message::method_return(3)
            .with_body(vec![DbusValue::string("ok")])
            .encode(4)
            .unwrap();
        let a = Message::decode_cached(&bytes, &cache).unwrap();
        let b = Message::decode_cached(&bytes, &cache).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&a.fields.signature, &b.fields.signature));
    }

    #[test]
    fn test_decode_cached_skips_parse_on_hit() {
        let bytes = Message::method_return(3)
            .with_body(vec![DbusValue::string("ok")])
            .encode(4)
            .unwrap();

        let cache = SignatureCache::new();
        let seeded = Arc::new(TypeSignature::parse_many("s").unwrap());
        cache.compute_if_absent("s".to_string(), |_| Arc::clone(&seeded));
        let decoded = Message::decode_cached(&bytes, &cache).unwrap();
        assert!(Arc::ptr_eq(&decoded.fields.signature, &seeded));

        // a stale entry is trusted as-is; the body no longer lines up
        let wrong = SignatureCache::new();
        wrong.compute_if_absent("s".to_string(), |_| {
            Arc::new(vec![TypeSignature::Basic(BasicType::Uint32)])
        });
        assert!(Message::decode_cached(&bytes, &wrong).is_err());
        assert!(Message::decode(&bytes).is_ok());
    }

    #[test]
    fn test_malformed_signature_not_cached() {
        let mut bytes = Message::method_return(3)
            .with_body(vec![DbusValue::Byte(1)])
            .encode(4)
            .unwrap();
        // the SIGNATURE field value is the only 'y' after its "g" type tag
        let at = bytes.windows(3).position(|w| w == [1, b'y', 0]).unwrap();
        bytes[at + 1] = b'(';

        let cache = SignatureCache::new();
        assert!(Message::decode_cached(&bytes, &cache).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_missing_required_field() {
        let mut msg = Message::method_return(1);
        msg.fields.reply_serial = None;
        assert!(matches!(msg.encode(1), Err(CodecError::InvalidMessage(_))));
    }

    #[test]
    fn test_body_signature_mismatch_rejected() {
        let mut msg = hello().with_body(vec![DbusValue::Int32(1)]);
        msg.body.push(DbusValue::Byte(2));
        assert!(matches!(msg.encode(1), Err(CodecError::TypeMismatch { .. })));
    }

    #[test]
    fn test_frame_length_rejects_bad_prefix() {
        let mut bytes = hello().encode(1).unwrap();
        bytes[0] = b'x';
        assert!(frame_length(&bytes).is_err());
        bytes[0] = b'l';
        bytes[3] = 2;
        assert!(frame_length(&bytes).is_err());
        assert_eq!(frame_length(&bytes[..10]).unwrap(), None);
    }

    #[test]
    fn test_big_endian_frame() {
        // Hand-built big-endian METHOD_RETURN, serial 2, REPLY_SERIAL 1, no body.
        let mut frame = vec![b'B', 2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2];
        frame.extend_from_slice(&[0, 0, 0, 8]); // fields array length
        frame.extend_from_slice(&[5, 1, b'u', 0, 0, 0, 0, 1]);
        let msg = Message::decode(&frame).unwrap();
        assert_eq!(msg.serial, 2);
        assert_eq!(msg.fields.reply_serial, Some(1));
    }

    #[test]
    fn test_frame_splitter_stops_at_partial_frame() {
        let a = hello().encode(1).unwrap();
        let b = hello().encode(2).unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b[..b.len() - 3]);

        let mut splitter = FrameSplitter::new(&stream);
        assert_eq!(splitter.next().unwrap().unwrap(), a.as_slice());
        assert!(splitter.next().is_none());
        assert_eq!(splitter.consumed(), a.len());
        assert_eq!(splitter.remaining(), b.len() - 3);
    }
}
