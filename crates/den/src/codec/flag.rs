//! Run-length flag codec.
//!
//! An unchanged flag costs one `0` bit. A changed flag costs a `1` followed by
//! the full 32-bit value, which becomes the new reference. The same codec
//! with its own state encodes the `source` field.

use super::bits::{BitReader, BitWriter};
use crate::meas::Flag;

const CHANGED_BITS: usize = 1 + 32;

/// Stateful flag compressor.
#[derive(Debug, Clone)]
pub struct FlagCompressor {
    prev: Flag,
}

impl FlagCompressor {
    /// Creates a compressor whose reference is the chunk's first flag.
    pub fn new(first: Flag) -> Self {
        Self { prev: first }
    }

    /// Number of bits `flag` would take.
    pub fn bits_needed(&self, flag: Flag) -> usize {
        if flag == self.prev {
            1
        } else {
            CHANGED_BITS
        }
    }

    /// Appends `flag`. Returns false without writing if it does not fit.
    pub fn append(&mut self, writer: &mut BitWriter<'_>, flag: Flag) -> bool {
        if writer.free_bits() < self.bits_needed(flag) {
            return false;
        }
        if flag == self.prev {
            writer.write_bit(false);
        } else {
            writer.write_bit(true);
            writer.write_bits(u64::from(flag), 32);
            self.prev = flag;
        }
        true
    }
}

/// Stateful flag decompressor.
#[derive(Debug, Clone)]
pub struct FlagDecompressor {
    prev: Flag,
}

impl FlagDecompressor {
    /// Creates a decompressor whose reference is the chunk's first flag.
    pub fn new(first: Flag) -> Self {
        Self { prev: first }
    }

    /// Reads the next flag. Returns `None` if the stream is exhausted.
    pub fn read(&mut self, reader: &mut BitReader<'_>) -> Option<Flag> {
        if reader.read_bit()? {
            self.prev = reader.read_bits(32)? as Flag;
        }
        Some(self.prev)
    }
}
