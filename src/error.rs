//! Error types, one enum per layer.
//!
//! - [`SignatureError`]: malformed type signature text
//! - [`CodecError`]: alignment, padding and value-shape failures on the wire
//! - [`AddressError`]: bad bus address, fails before any I/O
//! - [`BinderError`]: Rust value could not be mapped to or from the wire
//! - [`Error`]: crate-level error returned by connection operations

use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Malformed signature string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("empty signature")]
    Empty,

    #[error("unknown type code {code:?} at position {position}")]
    UnknownCode { code: char, position: usize },

    #[error("signature ended inside a container")]
    UnexpectedEnd,

    #[error("unmatched {delimiter:?} at position {position}")]
    UnmatchedDelimiter { delimiter: char, position: usize },

    #[error("struct has no members (position {position})")]
    EmptyStruct { position: usize },

    #[error("dict entry must have exactly two members, found {found}")]
    DictArity { found: usize },

    #[error("dict key must be a basic type, found {0:?}")]
    DictKeyNotBasic(String),

    #[error("trailing characters after complete type at position {position}")]
    Trailing { position: usize },

    #[error("container nesting exceeds {max}")]
    TooDeep { max: usize },

    #[error("signature is {len} bytes, limit is 255")]
    TooLong { len: usize },
}

/// Failure while encoding or decoding wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("cannot align to boundary {requested}: base boundary is {base}")]
    AlignmentConfig { requested: usize, base: usize },

    #[error("non-null byte in alignment padding at position {position}")]
    MalformedPadding { position: usize },

    #[error("unexpected end of buffer: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("encoder capacity of {capacity} bytes exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("invalid boolean value {0}")]
    InvalidBoolean(u32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("string is missing its NUL terminator")]
    MissingNul,

    #[error("string contains an interior NUL byte")]
    InteriorNul,

    #[error("invalid object path {0:?}")]
    InvalidObjectPath(String),

    #[error("length {len} exceeds limit {max}")]
    LengthTooLarge { len: usize, max: usize },

    #[error("array contents ran past declared length")]
    ArrayOverrun,

    #[error("expected value of type {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("variant signature must hold exactly one type, got {0:?}")]
    InvalidVariant(String),

    #[error("invalid signature on the wire: {0}")]
    Signature(#[from] SignatureError),

    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

/// Bad bus address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty bus address")]
    Empty,

    #[error("unsupported transport {0:?}")]
    UnsupportedTransport(String),

    #[error("invalid bus address: {0}")]
    InvalidAddress(String),
}

/// Mapping between Rust values and wire values failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BinderError {
    #[error("no binder registered for {0}")]
    NoBinder(&'static str),

    #[error("cannot bind {found} as {expected}")]
    Mismatch { expected: String, found: String },

    #[error("struct value has {found} members, binder expects {expected}")]
    MemberCount { expected: usize, found: usize },

    #[error("struct binder needs at least one member")]
    EmptyStruct,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors surfaced by connection-level operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error(transparent)]
    Binder(#[from] BinderError),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authentication timed out")]
    AuthTimeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for errors that terminate the handshake.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Error::AuthenticationFailed(_) | Error::AuthTimeout)
    }
}
