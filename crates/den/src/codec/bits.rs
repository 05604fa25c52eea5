//! Bit cursor over a byte window.
//!
//! The cursor is consumed from the high end of the window downward: logical bit
//! `n` lives in byte `len - 1 - n / 8`, most significant bit first. Because the
//! first bytes written are the last bytes of the window, the used part of a
//! buffer is always a suffix, and that suffix alone decodes identically to the
//! whole buffer.

use bitvec::prelude::*;

/// Maps a logical bit number to an index into an `Msb0` view of `len_bytes` bytes.
#[inline]
fn physical_index(len_bytes: usize, n: usize) -> usize {
    (len_bytes - 1 - n / 8) * 8 + n % 8
}

/// Returns the number of bytes touched by `bits` logical bits.
pub fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Writes bits into a caller-owned buffer.
pub struct BitWriter<'a> {
    bits: &'a mut BitSlice<u8, Msb0>,
    len_bytes: usize,
    cursor: usize,
}

impl<'a> BitWriter<'a> {
    /// Creates a writer over `buf` that continues after `cursor` already-written bits.
    pub fn new(buf: &'a mut [u8], cursor: usize) -> Self {
        let len_bytes = buf.len();
        Self {
            bits: buf.view_bits_mut::<Msb0>(),
            len_bytes,
            cursor: cursor.min(len_bytes * 8),
        }
    }

    /// Number of bits written so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of bits still available.
    pub fn free_bits(&self) -> usize {
        self.len_bytes * 8 - self.cursor
    }

    /// Writes the low `count` bits of `value`, most significant first.
    ///
    /// Returns false without writing anything if fewer than `count` bits remain.
    pub fn write_bits(&mut self, value: u64, count: u32) -> bool {
        debug_assert!(count <= 64);
        if (count as usize) > self.free_bits() {
            return false;
        }
        for i in (0..count).rev() {
            let idx = physical_index(self.len_bytes, self.cursor);
            self.bits.set(idx, (value >> i) & 1 == 1);
            self.cursor += 1;
        }
        true
    }

    /// Writes a single bit.
    pub fn write_bit(&mut self, bit: bool) -> bool {
        self.write_bits(u64::from(bit), 1)
    }
}

/// Reads bits written by a [`BitWriter`].
pub struct BitReader<'a> {
    bits: &'a BitSlice<u8, Msb0>,
    len_bytes: usize,
    cursor: usize,
}

impl<'a> BitReader<'a> {
    /// Creates a reader positioned at the first written bit of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            bits: buf.view_bits::<Msb0>(),
            len_bytes: buf.len(),
            cursor: 0,
        }
    }

    /// Number of bits consumed so far.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of bits left to read.
    pub fn remaining_bits(&self) -> usize {
        self.len_bytes * 8 - self.cursor
    }

    /// Reads `count` bits into the low end of a `u64`.
    ///
    /// Returns `None` if the window is exhausted.
    pub fn read_bits(&mut self, count: u32) -> Option<u64> {
        debug_assert!(count <= 64);
        if (count as usize) > self.remaining_bits() {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..count {
            let idx = physical_index(self.len_bytes, self.cursor);
            value = (value << 1) | u64::from(self.bits[idx]);
            self.cursor += 1;
        }
        Some(value)
    }

    /// Reads a single bit.
    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }
}
