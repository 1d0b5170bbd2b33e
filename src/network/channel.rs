//! Buffered channel over a [`Transport`]
//!
//! Inbound bytes collect in a growable buffer until a pipeline stage
//! consumes them; outbound bytes queue until the socket takes them.

use std::io::{self, Read, Write};

use super::transport::Transport;

/// Result of one read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many new bytes were appended.
    Data(usize),
    WouldBlock,
    /// Peer closed its write side.
    Eof,
}

pub struct Channel {
    transport: Transport,
    read_buffer: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    read_limit: usize,
    write_buffer: Vec<u8>,
    /// Inbound delivery gate; off until a stage can take input.
    auto_read: bool,
}

impl Channel {
    pub fn new(transport: Transport, initial_read_size: usize, read_limit: usize) -> Self {
        Self {
            transport,
            read_buffer: vec![0u8; initial_read_size.max(64)],
            read_pos: 0,
            read_len: 0,
            read_limit: read_limit.max(initial_read_size),
            write_buffer: Vec::new(),
            auto_read: false,
        }
    }

    #[inline(always)]
    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    #[inline(always)]
    pub fn set_auto_read(&mut self, enabled: bool) {
        self.auto_read = enabled;
    }

    /// Read once from the socket into the buffer, compacting or growing it
    /// first if there's no room left.
    pub fn fill_read_buffer(&mut self) -> io::Result<ReadStatus> {
        if self.read_pos > 0 {
            self.read_buffer.copy_within(self.read_pos..self.read_len, 0);
            self.read_len -= self.read_pos;
            self.read_pos = 0;
        }
        if self.read_len == self.read_buffer.len() {
            if self.read_buffer.len() >= self.read_limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("inbound buffer exceeds {} bytes", self.read_limit),
                ));
            }
            let grown = (self.read_buffer.len() * 2).min(self.read_limit);
            self.read_buffer.resize(grown, 0);
        }

        loop {
            match self.transport.read(&mut self.read_buffer[self.read_len..]) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => {
                    self.read_len += n;
                    return Ok(ReadStatus::Data(n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::WouldBlock)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Buffered, not yet consumed bytes.
    #[inline(always)]
    pub fn readable(&self) -> &[u8] {
        &self.read_buffer[self.read_pos..self.read_len]
    }

    /// The `n` most recently read bytes.
    #[inline(always)]
    pub fn last_read(&self, n: usize) -> &[u8] {
        &self.read_buffer[self.read_len - n.min(self.read_len)..self.read_len]
    }

    #[inline(always)]
    pub fn consume(&mut self, n: usize) {
        self.read_pos += n.min(self.read_len - self.read_pos);
    }

    #[inline]
    pub fn queue_write(&mut self, data: &[u8]) {
        self.write_buffer.extend_from_slice(data);
    }

    /// Write as much as the socket accepts. `Ok(true)` means everything
    /// queued has been written.
    pub fn flush_write_buffer(&mut self) -> io::Result<bool> {
        let mut written = 0;
        let result = loop {
            if written == self.write_buffer.len() {
                break Ok(true);
            }
            match self.transport.write(&self.write_buffer[written..]) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        self.write_buffer.drain(..written);
        result
    }

    #[inline(always)]
    pub fn write_pending(&self) -> usize {
        self.write_buffer.len()
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    pub fn shutdown(&self) {
        let _ = self.transport.shutdown();
    }
}
