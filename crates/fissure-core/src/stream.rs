//! Bit-addressable, demand-growable input streams.
//!
//! A [`BitStream`] holds the bytes read so far and an optional backing
//! reader. The cracker never assumes the whole input is present: when a
//! length, offset or token search needs more data it asks the stream to
//! grow with [`BitStream::want_bytes`], and a stream that cannot grow simply
//! reports an unchanged length.
//!
//! Positions are always counted in bits from the start of the stream.

use bytes::{BufMut, Bytes, BytesMut};
use memchr::memmem;
use std::fmt;
use std::io::Read;
use tracing::{trace, warn};

/// Size of a single read from the backing source
const READ_CHUNK: usize = 4096;

/// A seekable bit stream over a growable byte buffer
pub struct BitStream {
    buf: BytesMut,
    /// Length in bits; can be shorter than `buf` for sub-streams that end mid-byte
    bits: u64,
    pos: u64,
    source: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for BitStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitStream")
            .field("len_bits", &self.bits)
            .field("pos", &self.pos)
            .field("growable", &self.source.is_some())
            .finish()
    }
}

impl BitStream {
    /// Creates a fixed stream over the given bytes
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        Self {
            buf: BytesMut::from(data),
            bits: data.len() as u64 * 8,
            pos: 0,
            source: None,
        }
    }

    /// Creates a fixed stream holding exactly `bits` bits of `data`
    pub fn from_bits(data: Bytes, bits: u64) -> Self {
        debug_assert!(bits <= data.len() as u64 * 8);
        Self {
            buf: BytesMut::from(&data[..]),
            bits,
            pos: 0,
            source: None,
        }
    }

    /// Creates an empty stream that grows by pulling from `reader`
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            buf: BytesMut::new(),
            bits: 0,
            pos: 0,
            source: Some(Box::new(reader)),
        }
    }

    /// Current read position in bits
    pub fn tell_bits(&self) -> u64 {
        self.pos
    }

    /// Bits currently available
    pub fn len_bits(&self) -> u64 {
        self.bits
    }

    /// Whole bytes currently available
    pub fn len_bytes(&self) -> u64 {
        self.bits / 8
    }

    /// Bits available after the read position
    pub fn remaining_bits(&self) -> u64 {
        self.bits.saturating_sub(self.pos)
    }

    /// Returns true if the backing source may still produce data
    pub fn is_growable(&self) -> bool {
        self.source.is_some()
    }

    /// The bytes read so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Moves the read position to an absolute bit offset
    pub fn seek_bits(&mut self, pos: u64) -> std::io::Result<()> {
        if pos > self.bits {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("seek to bit {} past end of stream ({} bits)", pos, self.bits),
            ));
        }
        self.pos = pos;
        Ok(())
    }

    /// Asks the source for `count` more bytes.
    ///
    /// Best effort: returns how many bytes were actually added, which is zero
    /// once the source is exhausted. A failing source is dropped and treated
    /// as exhausted.
    pub fn want_bytes(&mut self, count: u64) -> u64 {
        let Some(source) = self.source.as_mut() else {
            return 0;
        };

        let mut added = 0u64;
        let mut chunk = [0u8; READ_CHUNK];

        while added < count {
            let want = ((count - added) as usize).min(READ_CHUNK);
            match source.read(&mut chunk[..want]) {
                Ok(0) => {
                    trace!("Stream source exhausted at {} bytes", self.buf.len());
                    self.source = None;
                    break;
                }
                Ok(n) => {
                    self.buf.put_slice(&chunk[..n]);
                    added += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Stream source failed, treating as exhausted: {}", e);
                    self.source = None;
                    break;
                }
            }
        }

        self.bits = self.buf.len() as u64 * 8;
        added
    }

    /// Grows the stream until at least `bits` bits are available.
    ///
    /// Returns false if the source ran dry first.
    pub fn ensure_bits(&mut self, bits: u64) -> bool {
        while self.bits < bits {
            let missing = (bits - self.bits).div_ceil(8);
            if self.want_bytes(missing) == 0 {
                return false;
            }
        }
        true
    }

    /// Finds `needle` at or after bit `from`, returning the match's bit offset.
    ///
    /// Matches are byte aligned; `from` is rounded up to the next byte.
    pub fn index_of(&self, needle: &[u8], from: u64) -> Option<u64> {
        let start = from.div_ceil(8) as usize;
        let end = self.len_bytes() as usize;
        if start > end {
            return None;
        }
        if needle.is_empty() {
            return Some(start as u64 * 8);
        }
        memmem::find(&self.buf[start..end], needle).map(|i| (start + i) as u64 * 8)
    }

    /// Reads `count` bits without growing the stream.
    ///
    /// The result is packed most-significant bit first and left aligned, so
    /// a 12-bit read yields two bytes with the low nibble of the second one
    /// clear. Returns `None` if fewer than `count` bits remain.
    pub fn read_bits(&mut self, count: u64) -> Option<Bytes> {
        if self.remaining_bits() < count {
            return None;
        }

        let out = if self.pos % 8 == 0 && count % 8 == 0 {
            let start = (self.pos / 8) as usize;
            Bytes::copy_from_slice(&self.buf[start..start + (count / 8) as usize])
        } else {
            let mut out = BytesMut::zeroed(count.div_ceil(8) as usize);
            for i in 0..count {
                if bit_at(&self.buf, self.pos + i) {
                    out[(i / 8) as usize] |= 0x80 >> (i % 8);
                }
            }
            out.freeze()
        };

        self.pos += count;
        Some(out)
    }
}

fn bit_at(buf: &[u8], index: u64) -> bool {
    buf[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
}

/// Packs bit runs back into bytes, most-significant bit first
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: BytesMut,
    bits: u64,
}

impl BitWriter {
    /// Creates an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the first `count` bits of `data` (left aligned)
    pub fn write_bits(&mut self, data: &[u8], count: u64) {
        if self.bits % 8 == 0 && count % 8 == 0 {
            self.buf.put_slice(&data[..(count / 8) as usize]);
            self.bits += count;
            return;
        }

        for i in 0..count {
            if self.bits % 8 == 0 {
                self.buf.put_u8(0);
            }
            if bit_at(data, i) {
                let last = self.buf.len() - 1;
                self.buf[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
        }
    }

    /// Number of bits written
    pub fn len_bits(&self) -> u64 {
        self.bits
    }

    /// Returns the packed bytes, zero padded to a whole byte
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
