//! Delta-of-delta timestamp codec.
//!
//! For a new time `t`, `D = (t - prev_time) - prev_delta` is written with a
//! unary prefix selecting the payload width:
//!
//! | condition          | prefix | payload |
//! |--------------------|--------|---------|
//! | `D == 0`           | `0`    | none    |
//! | `-63 < D < 64`     | `10`   | 7 bits  |
//! | `-255 < D < 256`   | `110`  | 9 bits  |
//! | `-2047 < D < 2048` | `1110` | 12 bits |
//! | otherwise          | `1111` | 32 bits |
//!
//! Payloads are two's complement. A `D` that does not fit 32 bits cannot be
//! encoded at all; the compressor reports it the same way as a full buffer.

use super::bits::{BitReader, BitWriter};
use crate::meas::Time;

/// Encoding tier: `(prefix, prefix_len, payload_bits)`.
fn tier(dod: i64) -> (u64, u32, u32) {
    if dod == 0 {
        (0b0, 1, 0)
    } else if -63 < dod && dod < 64 {
        (0b10, 2, 7)
    } else if -255 < dod && dod < 256 {
        (0b110, 3, 9)
    } else if -2047 < dod && dod < 2048 {
        (0b1110, 4, 12)
    } else {
        (0b1111, 4, 32)
    }
}

fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Stateful timestamp compressor.
#[derive(Debug, Clone)]
pub struct DeltaCompressor {
    prev_time: Time,
    prev_delta: i64,
}

impl DeltaCompressor {
    /// Creates a compressor whose reference is the chunk's first time.
    pub fn new(first: Time) -> Self {
        Self {
            prev_time: first,
            prev_delta: 0,
        }
    }

    /// Returns `(delta, delta_of_delta)` or `None` if `t` is out of encodable range.
    fn deltas(&self, t: Time) -> Option<(i64, i64)> {
        let delta = i64::try_from(i128::from(t) - i128::from(self.prev_time)).ok()?;
        let dod = delta.checked_sub(self.prev_delta)?;
        i32::try_from(dod).ok()?;
        Some((delta, dod))
    }

    /// Number of bits `t` would take, or `None` if it cannot be encoded.
    pub fn bits_needed(&self, t: Time) -> Option<usize> {
        let (_, dod) = self.deltas(t)?;
        let (_, prefix_len, payload) = tier(dod);
        Some((prefix_len + payload) as usize)
    }

    /// Appends `t`. Returns false without writing if it does not fit.
    pub fn append(&mut self, writer: &mut BitWriter<'_>, t: Time) -> bool {
        let Some((delta, dod)) = self.deltas(t) else {
            return false;
        };
        let (prefix, prefix_len, payload) = tier(dod);
        if writer.free_bits() < (prefix_len + payload) as usize {
            return false;
        }
        writer.write_bits(prefix, prefix_len);
        if payload > 0 {
            let mask = (1u64 << payload) - 1;
            writer.write_bits(dod as u64 & mask, payload);
        }
        self.prev_delta = delta;
        self.prev_time = t;
        true
    }
}

/// Stateful timestamp decompressor.
#[derive(Debug, Clone)]
pub struct DeltaDecompressor {
    prev_time: Time,
    prev_delta: i64,
}

impl DeltaDecompressor {
    /// Creates a decompressor whose reference is the chunk's first time.
    pub fn new(first: Time) -> Self {
        Self {
            prev_time: first,
            prev_delta: 0,
        }
    }

    /// Reads the next time. Returns `None` if the stream is exhausted.
    pub fn read(&mut self, reader: &mut BitReader<'_>) -> Option<Time> {
        let mut ones = 0u32;
        while ones < 4 {
            if !reader.read_bit()? {
                break;
            }
            ones += 1;
        }
        let dod = match ones {
            0 => 0,
            1 => sign_extend(reader.read_bits(7)?, 7),
            2 => sign_extend(reader.read_bits(9)?, 9),
            3 => sign_extend(reader.read_bits(12)?, 12),
            _ => sign_extend(reader.read_bits(32)?, 32),
        };
        let delta = self.prev_delta.wrapping_add(dod);
        let time = (i128::from(self.prev_time) + i128::from(delta)) as Time;
        self.prev_delta = delta;
        self.prev_time = time;
        Some(time)
    }
}
