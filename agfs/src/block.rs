//! Fixed-size block I/O over a regular file.
//!
//! Grounded on `blockdevice.go`'s `FileBlockDevice` (create-or-open,
//! truncate to `blockCount * BlockSize`, whole-block reads/writes that
//! fail on a short transfer) and a positional-I/O style matching
//! `blockreader.rs`. No read-ahead buffer or cache: each call issues
//! exactly one positional I/O to the backing file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::data::BLOCK_SIZE;
use crate::error::{err, AgfsError};

/// A regular file treated as an array of fixed-size blocks.
///
/// `File` is wrapped in a [`Mutex`] so the handle can be shared across
/// the FUSE host's worker threads: every call here is one positional
/// read or write, so the critical section is short.
pub struct BlockDevice {
	file: Mutex<File>,
	block_count: u64,
}

impl BlockDevice {
	/// Open (creating if necessary) `path` and size it to `block_count`
	/// blocks of [`BLOCK_SIZE`] bytes.
	pub fn open(path: &Path, block_count: u64) -> io::Result<Self> {
		let file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.open(path)?;
		file.set_len(block_count * BLOCK_SIZE as u64)?;
		Ok(Self { file: Mutex::new(file), block_count })
	}

	/// Open an already-formatted device, inferring the block count from
	/// the file's current size.
	pub fn open_existing(path: &Path) -> io::Result<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let len = file.metadata()?.len();
		Ok(Self { file: Mutex::new(file), block_count: len / BLOCK_SIZE as u64 })
	}

	pub fn total_block_count(&self) -> u64 {
		self.block_count
	}

	/// Read exactly one whole block. Fails if the device returns fewer
	/// than [`BLOCK_SIZE`] bytes.
	pub fn read_block(&self, blockno: u64) -> io::Result<Vec<u8>> {
		let mut buf = vec![0u8; BLOCK_SIZE];
		let file = self.file.lock().unwrap();
		let n = file.read_at(&mut buf, blockno * BLOCK_SIZE as u64)?;
		if n != BLOCK_SIZE {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
		}
		Ok(buf)
	}

	/// Write exactly one whole block. `data` must be [`BLOCK_SIZE`] bytes.
	pub fn write_block(&self, blockno: u64, data: &[u8]) -> io::Result<()> {
		if data.len() != BLOCK_SIZE {
			return Err(err(AgfsError::Unreachable));
		}
		let file = self.file.lock().unwrap();
		let n = file.write_at(data, blockno * BLOCK_SIZE as u64)?;
		if n != BLOCK_SIZE {
			return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
		}
		Ok(())
	}

	/// Byte-addressed read. A short transfer is treated as an error
	/// rather than silently tolerated.
	pub fn read(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
		let file = self.file.lock().unwrap();
		let n = file.read_at(buf, offset)?;
		if n != buf.len() {
			return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
		}
		Ok(())
	}

	/// Byte-addressed write; see [`Self::read`] for the short-transfer policy.
	pub fn write(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
		let file = self.file.lock().unwrap();
		let n = file.write_at(buf, offset)?;
		if n != buf.len() {
			return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::NamedTempFile;

	fn harness(blocks: u64) -> BlockDevice {
		let f = NamedTempFile::new().unwrap();
		BlockDevice::open(f.path(), blocks).unwrap()
	}

	#[test]
	fn write_then_read_block() {
		let dev = harness(4);
		let mut data = vec![0u8; BLOCK_SIZE];
		data[0] = 0xab;
		data[BLOCK_SIZE - 1] = 0xcd;
		dev.write_block(2, &data).unwrap();
		let back = dev.read_block(2).unwrap();
		assert_eq!(back, data);
	}

	#[test]
	fn blocks_start_zeroed() {
		let dev = harness(2);
		let back = dev.read_block(1).unwrap();
		assert!(back.iter().all(|&b| b == 0));
	}

	#[test]
	fn byte_addressed_roundtrip() {
		let dev = harness(4);
		dev.write(100, b"hello").unwrap();
		let mut buf = [0u8; 5];
		dev.read(100, &mut buf).unwrap();
		assert_eq!(&buf, b"hello");
	}

	#[test]
	fn write_block_rejects_wrong_size() {
		let dev = harness(2);
		assert!(dev.write_block(0, &[0u8; 10]).is_err());
	}

	#[test]
	fn total_block_count_matches_open() {
		let dev = harness(7);
		assert_eq!(dev.total_block_count(), 7);
	}
}
