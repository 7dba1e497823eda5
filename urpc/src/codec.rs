//! Payload pack/unpack.
//!
//! A command payload is a flat little-endian byte string described by an
//! ordered field list: 32-bit words, 64-bit words, 32-bit paddings, and
//! length-prefixed byte buffers. The packer checks at build time that every
//! 64-bit or buffer field starts on an 8-byte boundary (place `Pad` fields
//! to get there), and rounds the total up to 8 so the next payload starts
//! aligned again. The unpacker mirrors the same walk over a received
//! payload; buffers are returned as zero-copy slices into it, valid until
//! the slot is marked done.

use crate::error::{Error, Result};

/// One payload field.
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    /// 32-bit unsigned value, 4 bytes.
    U32(u32),
    /// 64-bit unsigned value, 8 bytes, must start 8-aligned.
    U64(u64),
    /// 4 bytes of zero padding.
    Pad,
    /// Length-prefixed buffer: the length as a 64-bit word, then the bytes
    /// verbatim. Must start 8-aligned.
    Bytes(&'a [u8]),
}

/// Total payload size for a field list, rounded up to 8.
pub fn packed_size(fields: &[Field<'_>]) -> usize {
    let mut size = 0usize;
    for f in fields {
        size += match f {
            Field::U32(_) | Field::Pad => 4,
            Field::U64(_) => 8,
            Field::Bytes(b) => 8 + b.len(),
        };
    }
    (size + 7) & !7
}

/// Pack a field list into `out`. Returns the number of bytes written
/// (always `packed_size(fields)`); trailing alignment bytes are zeroed.
pub fn pack(fields: &[Field<'_>], out: &mut [u8]) -> Result<usize> {
    let total = packed_size(fields);
    if out.len() < total {
        return Err(Error::Truncated);
    }
    let mut pos = 0usize;
    for f in fields {
        match f {
            Field::U32(v) => {
                out[pos..pos + 4].copy_from_slice(&v.to_le_bytes());
                pos += 4;
            }
            Field::Pad => {
                out[pos..pos + 4].fill(0);
                pos += 4;
            }
            Field::U64(v) => {
                if pos % 8 != 0 {
                    return Err(Error::Misaligned(pos));
                }
                out[pos..pos + 8].copy_from_slice(&v.to_le_bytes());
                pos += 8;
            }
            Field::Bytes(b) => {
                if pos % 8 != 0 {
                    return Err(Error::Misaligned(pos));
                }
                out[pos..pos + 8].copy_from_slice(&(b.len() as u64).to_le_bytes());
                pos += 8;
                out[pos..pos + b.len()].copy_from_slice(b);
                pos += b.len();
            }
        }
    }
    out[pos..total].fill(0);
    Ok(total)
}

/// Cursor over a received payload, mirroring [`pack`].
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Unpacker { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Truncated);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let s = self.take(4)?;
        Ok(u32::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let s = self.take(8)?;
        Ok(u64::from_le_bytes(s.try_into().unwrap()))
    }

    /// Skip one 32-bit padding field.
    pub fn pad(&mut self) -> Result<()> {
        self.take(4).map(|_| ())
    }

    /// Read a length-prefixed buffer. The slice aliases the payload.
    pub fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u64()? as usize;
        self.take(len)
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}
