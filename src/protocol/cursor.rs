//! Alignment-aware cursors
//!
//! Every field on the wire starts on a boundary that is a multiple of its
//! alignment, measured from the start of the *message*, not from the start
//! of whatever buffer currently holds the bytes. A cursor therefore carries:
//!
//! - `message_offset`: logical message position of physical byte zero.
//!   Negative when the buffer begins mid-message (resumed decode).
//! - `base_alignment`: the largest power-of-two boundary guaranteed at
//!   physical byte zero. Aligning to anything that does not divide it is
//!   rejected, because the padding could not be computed reliably.
//!
//! ```text
//!   logical:  0 ......... 13 | 14 15 16 ...
//!   physical:                |  0  1  2 ...      message_offset = 14
//!   align(8) at physical 0  ->  skip 2 zero bytes (logical 14 -> 16)
//! ```
//!
//! [`AlignedDecoder`] reads, [`AlignedEncoder`] writes. One cursor serves one
//! decode or encode pass.

use crate::error::CodecError;

/// Base alignment used when the buffer itself carries no guarantee beyond
/// "physical zero is the message start".
pub const DEFAULT_BASE_ALIGNMENT: usize = 1 << 30;

/// Byte order marker carried in every message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    #[inline(always)]
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'l' => Some(Endianness::Little),
            b'B' => Some(Endianness::Big),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn marker(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }
}

/// Zero bytes needed to move `position` up to the next `alignment`
/// boundary, relative to the logical message start.
#[inline(always)]
pub fn padding_for(message_offset: i64, position: usize, alignment: usize) -> usize {
    let n = alignment as i64;
    let logical = message_offset + position as i64;
    ((n - logical.rem_euclid(n)) % n) as usize
}

#[inline(always)]
fn can_align(base_alignment: usize, alignment: usize) -> bool {
    alignment != 0 && base_alignment % alignment == 0
}

#[inline(always)]
fn check_align(base_alignment: usize, alignment: usize) -> Result<(), CodecError> {
    if can_align(base_alignment, alignment) {
        Ok(())
    } else {
        Err(CodecError::AlignmentConfig {
            requested: alignment,
            base: base_alignment,
        })
    }
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $size:expr) => {
        #[inline]
        pub fn $name(&mut self) -> Result<$ty, CodecError> {
            self.align_read($size)?;
            let bytes = self.read_bytes($size)?;
            let mut raw = [0u8; $size];
            raw.copy_from_slice(bytes);
            Ok(match self.endianness {
                Endianness::Little => <$ty>::from_le_bytes(raw),
                Endianness::Big => <$ty>::from_be_bytes(raw),
            })
        }
    };
}

macro_rules! write_primitive {
    ($name:ident, $ty:ty, $size:expr) => {
        #[inline]
        pub fn $name(&mut self, value: $ty) -> Result<(), CodecError> {
            self.align_write($size)?;
            self.write_bytes(&value.to_le_bytes())
        }
    };
}

/// Read cursor over a borrowed buffer.
#[derive(Debug)]
pub struct AlignedDecoder<'a> {
    buffer: &'a [u8],
    read_pos: usize,
    message_offset: i64,
    base_alignment: usize,
    endianness: Endianness,
}

impl<'a> AlignedDecoder<'a> {
    /// Decoder for a buffer whose first byte is the message start.
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::resumed(buffer, 0, DEFAULT_BASE_ALIGNMENT)
    }

    /// Decoder for a buffer that begins `message_offset` bytes into the
    /// logical message and is only known to be aligned to `base_alignment`.
    pub fn resumed(buffer: &'a [u8], message_offset: i64, base_alignment: usize) -> Self {
        Self {
            buffer,
            read_pos: 0,
            message_offset,
            base_alignment,
            endianness: Endianness::Little,
        }
    }

    #[must_use]
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    #[inline(always)]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.read_pos
    }

    /// Position relative to the message start.
    #[inline(always)]
    pub fn logical_position(&self) -> i64 {
        self.message_offset + self.read_pos as i64
    }

    #[inline(always)]
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    #[inline(always)]
    pub fn is_exhausted(&self) -> bool {
        self.read_pos >= self.buffer.len()
    }

    pub fn can_align_read(&self, alignment: usize) -> bool {
        if !can_align(self.base_alignment, alignment) {
            return false;
        }
        let to_pad = padding_for(self.message_offset, self.read_pos, alignment);
        self.remaining() >= to_pad
    }

    /// Skip padding up to the next `alignment` boundary.
    ///
    /// Nothing is consumed when the alignment is rejected or the padding
    /// runs past the buffer. Padding bytes must be zero.
    pub fn align_read(&mut self, alignment: usize) -> Result<(), CodecError> {
        check_align(self.base_alignment, alignment)?;
        let to_pad = padding_for(self.message_offset, self.read_pos, alignment);
        if to_pad > self.remaining() {
            return Err(CodecError::UnexpectedEof {
                needed: to_pad,
                available: self.remaining(),
            });
        }
        let pad = &self.buffer[self.read_pos..self.read_pos + to_pad];
        if let Some(i) = pad.iter().position(|&b| b != 0) {
            return Err(CodecError::MalformedPadding {
                position: self.read_pos + i,
            });
        }
        self.read_pos += to_pad;
        Ok(())
    }

    /// Take the next `len` bytes without alignment.
    #[inline]
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if len > self.remaining() {
            return Err(CodecError::UnexpectedEof {
                needed: len,
                available: self.remaining(),
            });
        }
        let start = self.read_pos;
        self.read_pos += len;
        Ok(&self.buffer[start..self.read_pos])
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    read_primitive!(read_u16, u16, 2);
    read_primitive!(read_i16, i16, 2);
    read_primitive!(read_u32, u32, 4);
    read_primitive!(read_i32, i32, 4);
    read_primitive!(read_u64, u64, 8);
    read_primitive!(read_i64, i64, 8);
    read_primitive!(read_f64, f64, 8);
}

/// Write cursor appending to a borrowed `Vec`.
///
/// Physical byte zero is `buffer[0]`; the writer position is the current
/// buffer length. Output is always little-endian.
#[derive(Debug)]
pub struct AlignedEncoder<'a> {
    buffer: &'a mut Vec<u8>,
    message_offset: i64,
    base_alignment: usize,
    capacity: usize,
}

impl<'a> AlignedEncoder<'a> {
    /// Encoder for a message that starts at `buffer[0]`.
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self::with_offset(buffer, 0, DEFAULT_BASE_ALIGNMENT)
    }

    /// Encoder over a buffer known to be aligned to `existing_alignment`.
    pub fn from_aligned(buffer: &'a mut Vec<u8>, existing_alignment: usize) -> Self {
        Self::with_offset(buffer, 0, existing_alignment)
    }

    pub fn with_offset(buffer: &'a mut Vec<u8>, message_offset: i64, base_alignment: usize) -> Self {
        Self {
            buffer,
            message_offset,
            base_alignment,
            capacity: usize::MAX,
        }
    }

    /// Cap the total buffer length this encoder may produce.
    #[must_use]
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    #[inline(always)]
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    #[inline(always)]
    pub fn logical_position(&self) -> i64 {
        self.message_offset + self.buffer.len() as i64
    }

    #[inline(always)]
    pub fn writable(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    pub fn can_align_write(&self, alignment: usize) -> bool {
        if !can_align(self.base_alignment, alignment) {
            return false;
        }
        let to_pad = padding_for(self.message_offset, self.buffer.len(), alignment);
        self.writable() >= to_pad
    }

    /// Pad with zero bytes up to the next `alignment` boundary.
    pub fn align_write(&mut self, alignment: usize) -> Result<(), CodecError> {
        check_align(self.base_alignment, alignment)?;
        let to_pad = padding_for(self.message_offset, self.buffer.len(), alignment);
        if to_pad > self.writable() {
            return Err(CodecError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.buffer.resize(self.buffer.len() + to_pad, 0);
        Ok(())
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        if bytes.len() > self.writable() {
            return Err(CodecError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.write_bytes(&[value])
    }

    write_primitive!(write_u16, u16, 2);
    write_primitive!(write_i16, i16, 2);
    write_primitive!(write_u32, u32, 4);
    write_primitive!(write_i32, i32, 4);
    write_primitive!(write_u64, u64, 8);
    write_primitive!(write_i64, i64, 8);
    write_primitive!(write_f64, f64, 8);

    /// Overwrite a previously written little-endian `u32` (length prefixes).
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        self.buffer[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }
}
