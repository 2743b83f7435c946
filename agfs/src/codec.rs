//! Deterministic little-endian packing/unpacking of on-disk records.
//!
//! Grounded on `decoder.rs`'s `Config`/`Decoder` split: a fixed
//! [`Config`] wraps `bincode`'s configuration, and free functions give
//! every other module the same four primitives — `pack`, `unpack`,
//! `size_of` and `pad` — without exposing `bincode` itself past this
//! module.

use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{Decode, Encode};
use std::io;

use crate::error::{err, AgfsError};

const CONFIG: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
	.with_little_endian()
	.with_fixed_int_encoding();

/// Pack a structured value into bytes, little-endian, fixed-width integers.
pub fn pack<T: Encode>(value: &T) -> io::Result<Vec<u8>> {
	bincode::encode_to_vec(value, CONFIG).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Unpack bytes into a structured value. Trailing bytes are ignored, as
/// the caller typically hands in a zero-padded whole block.
pub fn unpack<T: Decode<()>>(bytes: &[u8]) -> io::Result<T> {
	bincode::decode_from_slice(bytes, CONFIG)
		.map(|(value, _)| value)
		.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// The packed size of `value`, used to locate a fork that follows a
/// header inside the same block.
pub fn size_of<T: Encode>(value: &T) -> io::Result<usize> {
	Ok(pack(value)?.len())
}

/// Zero-extend `bytes` to exactly `n` bytes. Fails if `bytes` is already
/// longer than `n` — a schema that doesn't fit in its block is a bug,
/// not something to silently truncate.
pub fn pad(mut bytes: Vec<u8>, n: usize) -> io::Result<Vec<u8>> {
	if bytes.len() > n {
		return Err(err(AgfsError::InvalidStructBytes));
	}
	bytes.resize(n, 0);
	Ok(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
	struct Pair {
		a: u32,
		b: u64,
	}

	#[test]
	fn pack_unpack_roundtrip() {
		let v = Pair { a: 7, b: 0x1122_3344_5566_7788 };
		let bytes = pack(&v).unwrap();
		let back: Pair = unpack(&bytes).unwrap();
		assert_eq!(v, back);
	}

	#[test]
	fn pad_extends_to_exact_size() {
		let bytes = pack(&Pair { a: 1, b: 2 }).unwrap();
		let padded = pad(bytes, 512).unwrap();
		assert_eq!(padded.len(), 512);
	}

	#[test]
	fn pad_rejects_oversize() {
		let bytes = vec![0u8; 10];
		assert!(pad(bytes, 4).is_err());
	}

	#[test]
	fn little_endian_layout() {
		let v = Pair { a: 0x0102_0304, b: 0 };
		let bytes = pack(&v).unwrap();
		assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
	}
}
