//! Bit-level compression codecs for chunk payloads.
//!
//! Three codecs share one [`BitWriter`] over a chunk's buffer:
//!
//! - [`DeltaCompressor`]: delta-of-delta timestamps
//! - [`XorCompressor`]: XOR floating point values
//! - [`FlagCompressor`]: run-length flags (also used for the source field)
//!
//! Every `append` checks the remaining capacity first and writes nothing if the
//! encoded step does not fit, which is how a chunk learns it is full. Readers are
//! forward-only and start from the chunk's first measurement.
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_den::codec::{BitReader, BitWriter, DeltaCompressor, DeltaDecompressor};
//!
//! let mut buf = vec![0u8; 64];
//! let mut writer = BitWriter::new(&mut buf, 0);
//! let mut enc = DeltaCompressor::new(1000);
//! assert!(enc.append(&mut writer, 1010));
//!
//! let mut reader = BitReader::new(&buf);
//! let mut dec = DeltaDecompressor::new(1000);
//! assert_eq!(dec.read(&mut reader), Some(1010));
//! ```

pub mod bits;
pub mod delta;
pub mod flag;
pub mod xor;

pub use bits::{bytes_for_bits, BitReader, BitWriter};
pub use delta::{DeltaCompressor, DeltaDecompressor};
pub use flag::{FlagCompressor, FlagDecompressor};
pub use xor::{XorCompressor, XorDecompressor};
