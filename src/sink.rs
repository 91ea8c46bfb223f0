//! Output sinks for OAT emission.
//!
//! Two layers cooperate here:
//!
//! - [`Sink`] wraps any `Write + Seek` target, counts logical bytes written,
//!   and supports a movable *seek reference*: `seek_to(n)` positions the
//!   stream at `reference + n`. Rebasing the reference past a 4096-byte ELF
//!   prologue lets all OAT-writing code address the file as if the OAT body
//!   started at offset zero.
//! - [`ChecksumSink`] takes ownership of a `Sink` and feeds every byte it
//!   writes through an Adler-32 accumulator via a fixed-size staging buffer.
//!   The OAT common header is written through the bare `Sink` *before* the
//!   checksumming layer is attached, which is how its bytes stay out of the
//!   checksum while still occupying the start of the file.

use std::io::{Seek, SeekFrom, Write};

use adler::Adler32;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::Result;

/// Staging buffer capacity for the checksumming layer.
const STAGING_CAPACITY: usize = 50 * 1024;

// =============================================================================
// Counting Sink
// =============================================================================

/// A byte sink with a logical write counter and a movable seek origin.
pub struct Sink<W> {
    inner: W,
    bytes_written: u32,
    seek_reference: u64,
}

impl<W: Write + Seek> Sink<W> {
    /// Wraps `inner` with the seek reference at stream position zero.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            bytes_written: 0,
            seek_reference: 0,
        }
    }

    /// Number of bytes written since construction or the last
    /// [`reset_bytes_written`](Self::reset_bytes_written).
    #[inline]
    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    /// Resets the write counter to zero.
    pub fn reset_bytes_written(&mut self) {
        self.bytes_written = 0;
    }

    /// Writes all of `buf` and counts it.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write_all(buf)?;
        self.bytes_written += buf.len() as u32;
        Ok(())
    }

    /// Writes a little-endian 32-bit word.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_all(&buf)
    }

    /// Writes `count` copies of `byte`.
    pub fn write_padding(&mut self, byte: u8, count: usize) -> Result<()> {
        let chunk = [byte; 4096];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.write_all(&chunk[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Seeks to `offset` relative to the current seek reference.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(self.seek_reference + offset))?;
        Ok(())
    }

    /// Sets the seek reference to an absolute stream position.
    pub fn set_seek_reference(&mut self, offset: u64) {
        self.seek_reference = offset;
    }

    /// Sets the seek reference to the current stream position, so that
    /// subsequent `seek_to(0)` returns here.
    pub fn set_seek_reference_to_position(&mut self) -> Result<()> {
        self.seek_reference = self.inner.stream_position()?;
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

// =============================================================================
// Checksumming Sink
// =============================================================================

/// A sink layered over [`Sink`] that accumulates an Adler-32 checksum of
/// every byte written through it.
///
/// Writes are staged in a fixed-size buffer; each flush feeds the staged
/// bytes into the checksum state before handing them to the underlying sink.
/// The write counter carries on from the wrapped sink, so planned offsets
/// computed against the whole file keep lining up.
pub struct ChecksumSink<W> {
    sink: Sink<W>,
    cksum: Adler32,
    staging: Vec<u8>,
    bytes_written: u32,
}

impl<W: Write + Seek> ChecksumSink<W> {
    /// Takes over `sink`, inheriting its write counter.
    pub fn new(sink: Sink<W>) -> Self {
        let bytes_written = sink.bytes_written();
        Self {
            sink,
            cksum: Adler32::new(),
            staging: Vec::with_capacity(STAGING_CAPACITY),
            bytes_written,
        }
    }

    /// Number of bytes written to the file overall, staged bytes included.
    #[inline]
    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    /// Writes all of `buf` through the staging buffer.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if self.staging.len() + buf.len() > STAGING_CAPACITY {
            self.flush_staging()?;
        }
        if buf.len() >= STAGING_CAPACITY {
            self.cksum.write_slice(buf);
            self.sink.write_all(buf)?;
        } else {
            self.staging.extend_from_slice(buf);
        }
        self.bytes_written += buf.len() as u32;
        Ok(())
    }

    /// Writes a little-endian 32-bit word.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write_all(&buf)
    }

    /// Writes a little-endian 16-bit value.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        let mut buf = [0u8; 2];
        LittleEndian::write_u16(&mut buf, value);
        self.write_all(&buf)
    }

    /// Writes `count` copies of `byte`.
    pub fn write_padding(&mut self, byte: u8, count: usize) -> Result<()> {
        let chunk = [byte; 4096];
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.write_all(&chunk[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    /// Flushes staged bytes and returns the current checksum value.
    pub fn checksum(&mut self) -> Result<u32> {
        self.flush_staging()?;
        Ok(self.cksum.checksum())
    }

    /// Flushes staged bytes and hands back the underlying sink.
    pub fn into_sink(mut self) -> Result<Sink<W>> {
        self.flush_staging()?;
        Ok(self.sink)
    }

    fn flush_staging(&mut self) -> Result<()> {
        if !self.staging.is_empty() {
            self.cksum.write_slice(&self.staging);
            self.sink.write_all(&self.staging)?;
            self.staging.clear();
        }
        Ok(())
    }
}
