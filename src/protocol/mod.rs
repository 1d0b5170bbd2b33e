//! Protocol Layer: wire format
//!
//! Alignment selalu dihitung relatif terhadap awal pesan, bukan awal buffer.
//! Setiap jalur decode memeriksa batas; input rusak menjadi error, bukan panic.
//!
//! Fitur:
//! - Type signature dengan batas kedalaman
//! - Cursor dengan alignment relatif pesan
//! - Framing pesan dan cache signature body

pub mod cursor;
pub mod marshal;
pub mod message;
pub mod signature;
pub mod value;

pub use cursor::{padding_for, AlignedDecoder, AlignedEncoder, Endianness};
pub use marshal::{decode_value, decode_values, encode_value, encode_values};
pub use message::{
    frame_length, FrameSplitter, HeaderField, HeaderFields, Message, MessageFlags, MessageType,
    SignatureCache, MAX_MESSAGE_SIZE,
};
pub use signature::{BasicType, TypeSignature};
pub use value::DbusValue;
