//! Single-level B-tree: one root block of sorted records, keyed by an
//! unsigned 64-bit integer. Grounded on `btree.go`'s `BtreeContext`.
//!
//! The on-disk format already reserves a `blkNo` field and lets the
//! bno-tree and cnt-tree use distinct root blocks, anticipating a future
//! multi-level variant; this implementation keeps that shape but never
//! splits a block.

use std::io;
use std::sync::Arc;

use crate::block::BlockDevice;
use crate::codec;
use crate::data::{BtreeBlock, BtreeRecord};
use crate::error::{err, AgfsError};

/// A query condition for the generalized `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
	Eq,
	Lt,
	Le,
	Gt,
	Ge,
}

pub struct BtreeContext<R> {
	device: Arc<BlockDevice>,
	root: u64,
	_marker: std::marker::PhantomData<R>,
}

impl<R: BtreeRecord> BtreeContext<R> {
	pub fn new(device: Arc<BlockDevice>, root: u64) -> Self {
		Self { device, root, _marker: std::marker::PhantomData }
	}

	pub fn root_block(&self) -> u64 {
		self.root
	}

	/// Write an empty block with the correct magic at the tree's root.
	pub fn init(&self) -> io::Result<()> {
		self.write_block(&BtreeBlock::empty(self.root))
	}

	/// Read the root block, verifying its magic.
	pub fn load(&self) -> io::Result<BtreeBlock<R>> {
		let bytes = self.device.read_block(self.root)?;
		let block: BtreeBlock<R> = codec::unpack(&bytes)?;
		if block.magic != crate::data::magic::BTREE_BLOCK {
			return Err(err(AgfsError::InvalidStructBytes));
		}
		Ok(block)
	}

	fn write_block(&self, block: &BtreeBlock<R>) -> io::Result<()> {
		let bytes = codec::pad(codec::pack(block)?, crate::data::BLOCK_SIZE)?;
		self.device.write_block(self.root, &bytes)
	}

	/// The record whose key equals `key`, if any.
	pub fn get(&self, key: u64) -> io::Result<Option<R>> {
		let (rec, exact, _idx) = self.get_cond(key, Cond::Eq)?;
		Ok(if exact { rec } else { None })
	}

	/// The first record with key ≥ `key`, with its index.
	pub fn get_first_meet(&self, key: u64) -> io::Result<Option<(R, usize)>> {
		let (rec, _exact, idx) = self.get_cond(key, Cond::Ge)?;
		Ok(rec.map(|r| (r, idx)))
	}

	/// Generalized query: exact match short-circuits for `Eq`/`Le`/`Ge`;
	/// `Lt`/`Le` return the greatest record with key < `key`; `Gt`/`Ge`
	/// return the least record with key > `key`. Records are sorted
	/// ascending, so both searches break on the first qualifying record
	/// in the appropriate direction rather than continuing to overwrite
	/// the result on every later match.
	pub fn get_cond(&self, key: u64, cond: Cond) -> io::Result<(Option<R>, bool, usize)> {
		let block = self.load()?;
		let mut lower: Option<(R, usize)> = None;
		for (i, rec) in block.recs.iter().enumerate() {
			let k = rec.key();
			if k == key {
				match cond {
					Cond::Eq | Cond::Le | Cond::Ge => return Ok((Some(*rec), true, i)),
					Cond::Lt | Cond::Gt => continue,
				}
			} else if k < key {
				if matches!(cond, Cond::Lt | Cond::Le) {
					lower = Some((*rec, i));
				}
			} else {
				// k > key: first such record satisfies Gt/Ge.
				if matches!(cond, Cond::Gt | Cond::Ge) {
					return Ok((Some(*rec), false, i));
				}
				break;
			}
		}
		match cond {
			Cond::Lt | Cond::Le => Ok((lower.map(|(r, _)| r), false, lower.map_or(0, |(_, i)| i))),
			_ => Ok((None, false, 0)),
		}
	}

	/// Linear scan for the first record satisfying `pred`, with its index.
	pub fn find<F: Fn(&R) -> bool>(&self, pred: F) -> io::Result<Option<(R, usize)>> {
		let block = self.load()?;
		Ok(block.recs.iter().enumerate().find(|(_, r)| pred(r)).map(|(i, r)| (*r, i)))
	}

	/// Remove the record at `index` and rewrite the whole block.
	pub fn remove_at(&self, index: usize) -> io::Result<()> {
		let mut block = self.load()?;
		if index >= block.recs.len() {
			return Err(err(AgfsError::OutOfRange));
		}
		block.recs.remove(index);
		self.write_block(&block)
	}

	/// Overwrite record `i` in place and rewrite the whole block.
	pub fn set_by_index(&self, value: R, index: usize) -> io::Result<()> {
		let mut block = self.load()?;
		if index >= block.recs.len() {
			return Err(err(AgfsError::OutOfRange));
		}
		block.recs[index] = value;
		self.write_block(&block)
	}

	/// Insert `value`, keeping `recs` sorted ascending by key. Always
	/// inserts — an equal-keyed record is never replaced (see DESIGN.md
	/// for why: mkfs's own initial split and duplicate free-space extents
	/// of the same size both depend on duplicate keys surviving in the
	/// cnt-tree).
	pub fn set(&self, value: R) -> io::Result<()> {
		let mut block = self.load()?;
		let pos = block
			.recs
			.iter()
			.position(|r| value.less(r))
			.unwrap_or(block.recs.len());
		block.recs.insert(pos, value);
		self.write_block(&block)
	}

	/// Remove the first record with key `key` (`del_all = false`) or
	/// every matching record (`del_all = true`).
	pub fn del(&self, key: u64, del_all: bool) -> io::Result<()> {
		let mut block = self.load()?;
		if del_all {
			block.recs.retain(|r| r.key() != key);
		} else if let Some(pos) = block.recs.iter().position(|r| r.key() == key) {
			block.recs.remove(pos);
		}
		self.write_block(&block)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::{CntRec, FreeSpaceRec};
	use tempfile::NamedTempFile;

	fn harness() -> BtreeContext<CntRec> {
		let f = NamedTempFile::new().unwrap();
		let dev = Arc::new(BlockDevice::open(f.path(), 4).unwrap());
		let ctx = BtreeContext::new(dev, 0);
		ctx.init().unwrap();
		ctx
	}

	fn rec(count: u64, start: u64) -> CntRec {
		CntRec(FreeSpaceRec { block_count: count, start_block: start })
	}

	#[test]
	fn init_load_roundtrip() {
		let ctx = harness();
		let block = ctx.load().unwrap();
		assert_eq!(block.magic, crate::data::magic::BTREE_BLOCK);
		assert!(block.recs.is_empty());
	}

	#[test]
	fn set_keeps_sorted_order() {
		let ctx = harness();
		ctx.set(rec(30, 0)).unwrap();
		ctx.set(rec(10, 30)).unwrap();
		ctx.set(rec(20, 40)).unwrap();
		let block = ctx.load().unwrap();
		let counts: Vec<u64> = block.recs.iter().map(|r| r.0.block_count).collect();
		assert_eq!(counts, vec![10, 20, 30]);
	}

	#[test]
	fn set_allows_duplicate_keys() {
		let ctx = harness();
		for i in 0..3 {
			ctx.set(rec(5, i * 5)).unwrap();
		}
		let block = ctx.load().unwrap();
		assert_eq!(block.recs.len(), 3);
	}

	#[test]
	fn get_exact_match() {
		let ctx = harness();
		ctx.set(rec(10, 0)).unwrap();
		ctx.set(rec(20, 10)).unwrap();
		let found = ctx.get(20).unwrap().unwrap();
		assert_eq!(found.0.start_block, 10);
		assert!(ctx.get(99).unwrap().is_none());
	}

	#[test]
	fn get_first_meet_returns_least_upper_bound() {
		let ctx = harness();
		ctx.set(rec(10, 0)).unwrap();
		ctx.set(rec(20, 10)).unwrap();
		ctx.set(rec(30, 30)).unwrap();
		let (found, idx) = ctx.get_first_meet(15).unwrap().unwrap();
		assert_eq!(found.0.block_count, 20);
		assert_eq!(idx, 1);
	}

	#[test]
	fn del_removes_first_match_only() {
		let ctx = harness();
		ctx.set(rec(10, 0)).unwrap();
		ctx.set(rec(10, 100)).unwrap();
		ctx.del(10, false).unwrap();
		let block = ctx.load().unwrap();
		assert_eq!(block.recs.len(), 1);
	}

	#[test]
	fn del_all_removes_every_match() {
		let ctx = harness();
		ctx.set(rec(10, 0)).unwrap();
		ctx.set(rec(10, 100)).unwrap();
		ctx.set(rec(20, 200)).unwrap();
		ctx.del(10, true).unwrap();
		let block = ctx.load().unwrap();
		assert_eq!(block.recs.len(), 1);
		assert_eq!(block.recs[0].0.block_count, 20);
	}

	#[test]
	fn set_by_index_overwrites() {
		let ctx = harness();
		ctx.set(rec(10, 0)).unwrap();
		ctx.set_by_index(rec(7, 3), 0).unwrap();
		let block = ctx.load().unwrap();
		assert_eq!(block.recs[0].0.block_count, 7);
		assert_eq!(block.recs[0].0.start_block, 3);
	}

	#[test]
	fn set_by_index_rejects_out_of_range() {
		let ctx = harness();
		assert!(ctx.set_by_index(rec(1, 1), 5).is_err());
	}
}
