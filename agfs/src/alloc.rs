//! Block allocator: satisfy "I need N contiguous blocks" requests from
//! an AG's free-space trees, and release ranges back into both
//! free-space trees with neighbor coalescing on the way in.
//!
//! Grounded on `mountpoint.go`'s `AllocBlock`, with two fixes beyond it:
//! an allocation shrinks or removes the matching record in *both* trees
//! (the original only ever touched the cnt-tree, since it never
//! reclaimed), and releases are tracked through the bno-tree so
//! adjacent free ranges merge instead of fragmenting forever.

use std::io;

use crate::btree::BtreeContext;
use crate::data::{BnoRec, CntRec, FreeSpaceRec};
use crate::error::{err, AgfsError};

/// Ask the cnt-tree for the first record with `blockCount >= n`, carve
/// `n` blocks off its front, and return the carved-off base address.
///
/// The bno-tree carries the same extent under the key `start_block`, so
/// it is updated symmetrically here: the stale whole-extent record is
/// removed and, if any of the extent survives the carve, reinserted
/// with the new shrunk bounds. Without this, `free_blocks`' coalescing
/// scan would find a bno record that still advertises blocks this call
/// just handed out as free.
pub fn alloc_blocks(bno: &BtreeContext<BnoRec>, cnt: &BtreeContext<CntRec>, n: u64) -> io::Result<u64> {
	let (rec, idx) = cnt.get_first_meet(n)?.ok_or_else(|| {
		log::warn!("alloc_blocks: no record fits {n} blocks");
		err(AgfsError::NoSpace)
	})?;
	cnt.remove_at(idx)?;

	let start = rec.0.start_block;
	let (_, bno_idx) = bno
		.find(|r| r.0.start_block == start)?
		.ok_or_else(|| err(AgfsError::Unreachable))?;
	bno.remove_at(bno_idx)?;

	let remaining = rec.0.block_count - n;
	if remaining > 0 {
		let rest = FreeSpaceRec { block_count: remaining, start_block: start + n };
		cnt.set(CntRec(rest))?;
		bno.set(BnoRec(rest))?;
	}
	log::debug!("alloc_blocks: {n} blocks from {start}");
	Ok(start)
}

/// Return `[start, start + count)` to the free pool, coalescing with
/// any immediately-adjacent free range found via the bno-tree.
pub fn free_blocks(
	bno: &BtreeContext<BnoRec>,
	cnt: &BtreeContext<CntRec>,
	start: u64,
	count: u64,
) -> io::Result<()> {
	if count == 0 {
		return Ok(());
	}
	let mut start = start;
	let mut count = count;

	if let Some((left, idx)) = bno.find(|r| r.0.start_block + r.0.block_count == start)? {
		bno.remove_at(idx)?;
		remove_cnt_match(cnt, left.0)?;
		start = left.0.start_block;
		count += left.0.block_count;
	}

	if let Some((right, idx)) = bno.find(|r| r.0.start_block == start + count)? {
		bno.remove_at(idx)?;
		remove_cnt_match(cnt, right.0)?;
		count += right.0.block_count;
	}

	bno.set(BnoRec(FreeSpaceRec { block_count: count, start_block: start }))?;
	cnt.set(CntRec(FreeSpaceRec { block_count: count, start_block: start }))?;
	log::debug!("free_blocks: [{start}, {}) back to the pool", start + count);
	Ok(())
}

fn remove_cnt_match(cnt: &BtreeContext<CntRec>, target: FreeSpaceRec) -> io::Result<()> {
	if let Some((_, idx)) = cnt.find(|r| r.0.start_block == target.start_block && r.0.block_count == target.block_count)? {
		cnt.remove_at(idx)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::block::BlockDevice;
	use std::sync::Arc;
	use tempfile::NamedTempFile;

	fn harness() -> (BtreeContext<BnoRec>, BtreeContext<CntRec>) {
		let f = NamedTempFile::new().unwrap();
		let dev = Arc::new(BlockDevice::open(f.path(), 4).unwrap());
		let bno = BtreeContext::<BnoRec>::new(dev.clone(), 0);
		let cnt = BtreeContext::<CntRec>::new(dev, 1);
		bno.init().unwrap();
		cnt.init().unwrap();
		(bno, cnt)
	}

	#[test]
	fn alloc_shrinks_and_advances() {
		let (bno, cnt) = harness();
		cnt.set(CntRec(FreeSpaceRec { block_count: 10, start_block: 100 })).unwrap();
		bno.set(BnoRec(FreeSpaceRec { block_count: 10, start_block: 100 })).unwrap();
		let start = alloc_blocks(&bno, &cnt, 4).unwrap();
		assert_eq!(start, 100);

		let cnt_block = cnt.load().unwrap();
		assert_eq!(cnt_block.recs.len(), 1);
		assert_eq!(cnt_block.recs[0].0.block_count, 6);
		assert_eq!(cnt_block.recs[0].0.start_block, 104);

		let bno_block = bno.load().unwrap();
		assert_eq!(bno_block.recs.len(), 1);
		assert_eq!(bno_block.recs[0].0.block_count, 6);
		assert_eq!(bno_block.recs[0].0.start_block, 104);
	}

	#[test]
	fn alloc_exhausting_a_record_removes_it() {
		let (bno, cnt) = harness();
		cnt.set(CntRec(FreeSpaceRec { block_count: 4, start_block: 100 })).unwrap();
		bno.set(BnoRec(FreeSpaceRec { block_count: 4, start_block: 100 })).unwrap();
		alloc_blocks(&bno, &cnt, 4).unwrap();
		assert!(cnt.load().unwrap().recs.is_empty());
		assert!(bno.load().unwrap().recs.is_empty());
	}

	#[test]
	fn alloc_fails_when_no_record_fits() {
		let (bno, cnt) = harness();
		cnt.set(CntRec(FreeSpaceRec { block_count: 2, start_block: 100 })).unwrap();
		bno.set(BnoRec(FreeSpaceRec { block_count: 2, start_block: 100 })).unwrap();
		assert!(alloc_blocks(&bno, &cnt, 4).is_err());
	}

	#[test]
	fn alloc_then_free_does_not_resurrect_live_blocks() {
		// Regression: extent A [16,79) and B [79,142) fully allocated, then B
		// freed. The freed range must coalesce against bno's true neighbor
		// state, never against a stale pre-allocation record that would hand
		// A's still-live blocks back out.
		let (bno, cnt) = harness();
		cnt.set(CntRec(FreeSpaceRec { block_count: 63, start_block: 16 })).unwrap();
		bno.set(BnoRec(FreeSpaceRec { block_count: 63, start_block: 16 })).unwrap();
		cnt.set(CntRec(FreeSpaceRec { block_count: 63, start_block: 79 })).unwrap();
		bno.set(BnoRec(FreeSpaceRec { block_count: 63, start_block: 79 })).unwrap();

		assert_eq!(alloc_blocks(&bno, &cnt, 63).unwrap(), 16);
		assert_eq!(alloc_blocks(&bno, &cnt, 63).unwrap(), 79);
		assert!(cnt.load().unwrap().recs.is_empty());
		assert!(bno.load().unwrap().recs.is_empty());

		free_blocks(&bno, &cnt, 79, 63).unwrap();

		let start = alloc_blocks(&bno, &cnt, 63).unwrap();
		assert_eq!(start, 79, "allocator must not hand out block 16, which still belongs to A");
	}

	#[test]
	fn free_coalesces_with_left_and_right_neighbor() {
		let (bno, cnt) = harness();
		bno.set(BnoRec(FreeSpaceRec { block_count: 5, start_block: 0 })).unwrap();
		cnt.set(CntRec(FreeSpaceRec { block_count: 5, start_block: 0 })).unwrap();
		bno.set(BnoRec(FreeSpaceRec { block_count: 3, start_block: 10 })).unwrap();
		cnt.set(CntRec(FreeSpaceRec { block_count: 3, start_block: 10 })).unwrap();

		free_blocks(&bno, &cnt, 5, 5).unwrap();

		let bno_block = bno.load().unwrap();
		assert_eq!(bno_block.recs.len(), 1);
		assert_eq!(bno_block.recs[0].0.start_block, 0);
		assert_eq!(bno_block.recs[0].0.block_count, 13);

		let cnt_block = cnt.load().unwrap();
		assert_eq!(cnt_block.recs.len(), 1);
		assert_eq!(cnt_block.recs[0].0.block_count, 13);
	}

	#[test]
	fn free_with_no_neighbors_inserts_standalone_record() {
		let (bno, cnt) = harness();
		free_blocks(&bno, &cnt, 50, 4).unwrap();
		assert_eq!(bno.load().unwrap().recs.len(), 1);
		assert_eq!(cnt.load().unwrap().recs.len(), 1);
	}
}
