//! XOR floating point codec.
//!
//! Each value is XORed with the previous one. An unchanged value costs a single
//! `0`. Otherwise a `1` is followed by either `0` and the significant bits (when
//! the leading/trailing zero counts match the previous window) or `1`, a 5-bit
//! leading count, a 5-bit trailing count and the significant bits.

use super::bits::{BitReader, BitWriter};
use crate::meas::Value;

/// Largest leading/trailing count that fits the 5-bit fields.
const MAX_RUN: u32 = 31;

/// Marks "no window yet" so the first changed value always opens one.
const NO_WINDOW: u32 = u32::MAX;

fn window(xor: u64) -> (u32, u32) {
    (xor.leading_zeros().min(MAX_RUN), xor.trailing_zeros().min(MAX_RUN))
}

/// Stateful value compressor.
#[derive(Debug, Clone)]
pub struct XorCompressor {
    prev_bits: u64,
    prev_lead: u32,
    prev_tail: u32,
}

impl XorCompressor {
    /// Creates a compressor whose reference is the chunk's first value.
    pub fn new(first: Value) -> Self {
        Self {
            prev_bits: first.to_bits(),
            prev_lead: NO_WINDOW,
            prev_tail: NO_WINDOW,
        }
    }

    /// Number of bits `value` would take.
    pub fn bits_needed(&self, value: Value) -> usize {
        let xor = self.prev_bits ^ value.to_bits();
        if xor == 0 {
            return 1;
        }
        let (lead, tail) = window(xor);
        let significant = (64 - lead - tail) as usize;
        if lead == self.prev_lead && tail == self.prev_tail {
            2 + significant
        } else {
            2 + 10 + significant
        }
    }

    /// Appends `value`. Returns false without writing if it does not fit.
    pub fn append(&mut self, writer: &mut BitWriter<'_>, value: Value) -> bool {
        if writer.free_bits() < self.bits_needed(value) {
            return false;
        }
        let bits = value.to_bits();
        let xor = self.prev_bits ^ bits;
        if xor == 0 {
            writer.write_bit(false);
            return true;
        }

        let (lead, tail) = window(xor);
        let significant = 64 - lead - tail;
        if lead == self.prev_lead && tail == self.prev_tail {
            writer.write_bits(0b10, 2);
        } else {
            writer.write_bits(0b11, 2);
            writer.write_bits(u64::from(lead), 5);
            writer.write_bits(u64::from(tail), 5);
            self.prev_lead = lead;
            self.prev_tail = tail;
        }
        writer.write_bits(xor >> tail, significant);
        self.prev_bits = bits;
        true
    }
}

/// Stateful value decompressor.
#[derive(Debug, Clone)]
pub struct XorDecompressor {
    prev_bits: u64,
    prev_lead: u32,
    prev_tail: u32,
}

impl XorDecompressor {
    /// Creates a decompressor whose reference is the chunk's first value.
    pub fn new(first: Value) -> Self {
        Self {
            prev_bits: first.to_bits(),
            prev_lead: NO_WINDOW,
            prev_tail: NO_WINDOW,
        }
    }

    /// Reads the next value. Returns `None` if the stream is exhausted or malformed.
    pub fn read(&mut self, reader: &mut BitReader<'_>) -> Option<Value> {
        if !reader.read_bit()? {
            return Some(Value::from_bits(self.prev_bits));
        }
        if reader.read_bit()? {
            self.prev_lead = reader.read_bits(5)? as u32;
            self.prev_tail = reader.read_bits(5)? as u32;
        }
        if self.prev_lead == NO_WINDOW {
            return None;
        }
        let significant = 64 - self.prev_lead - self.prev_tail;
        let xor = reader.read_bits(significant)? << self.prev_tail;
        self.prev_bits ^= xor;
        Some(Value::from_bits(self.prev_bits))
    }
}
