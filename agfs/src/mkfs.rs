//! Formatter: lay out a brand-new device as a sequence of Allocation
//! Groups. Grounded on `mkfs.go`'s `Makefs`/`MakeAg`.
//!
//! `mkfs.go` reserves the bno-tree root but never initializes it; this
//! formatter also initializes and seeds it with the same 16-way split
//! as the cnt-tree, since `alloc::free_blocks` actually reads the
//! bno-tree to find coalescing neighbors.

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::block::BlockDevice;
use crate::btree::BtreeContext;
use crate::codec;
use crate::data::{
	ag_layout, magic, mode_bits, BnoRec, CntRec, Agf, Agfl, Agi, BLOCK_SIZE, FreeSpaceRec,
	MIN_AG_DATA_BLOCKS, Superblock, FREE_SPLIT,
};
use crate::error::{err, AgfsError};
use crate::inode::InodeContext;

/// Format `path` as a new device of `total_blocks` blocks divided into
/// `ag_count` Allocation Groups (the last one absorbing the remainder).
pub fn format(path: &Path, ag_count: u32, total_blocks: u64) -> io::Result<()> {
	let device = Arc::new(BlockDevice::open(path, total_blocks)?);
	format_device(&device, ag_count, total_blocks)
}

pub fn format_device(device: &Arc<BlockDevice>, ag_count: u32, total_blocks: u64) -> io::Result<()> {
	log::info!("mkfs: {total_blocks} blocks, {ag_count} AGs");
	let ag_blocks = total_blocks / ag_count as u64;
	let last_ag_blocks = total_blocks % ag_count as u64 + ag_blocks;

	for agno in 0..ag_count {
		let this_ag_blocks = if agno == ag_count - 1 { last_ag_blocks } else { ag_blocks };
		make_ag(device, agno, ag_blocks, this_ag_blocks, ag_count)?;
	}
	Ok(())
}

fn make_ag(
	device: &Arc<BlockDevice>,
	agno: u32,
	ag_blocks: u64,
	this_ag_blocks: u64,
	ag_count: u32,
) -> io::Result<()> {
	let base = agno as u64 * ag_blocks;
	let data_blk = base + ag_layout::DATA;
	if base + this_ag_blocks < data_blk + MIN_AG_DATA_BLOCKS {
		return Err(err(AgfsError::AgTooSmall));
	}

	let sb = Superblock {
		magic: magic::SUPERBLOCK,
		block_size: BLOCK_SIZE as u32,
		seqno: agno,
		ag_blocks: this_ag_blocks,
		ag_count,
	};
	write_struct(device, base + ag_layout::SB, &sb)?;

	let bno_root_blk = base + ag_layout::BNO_ROOT;
	let cnt_root_blk = base + ag_layout::CNT_ROOT;
	let agf = Agf { magic: magic::AGF, seqno: agno, bno_root: bno_root_blk, cnt_root: cnt_root_blk };
	write_struct(device, base + ag_layout::AGF, &agf)?;

	let ino_root_blk = base + ag_layout::ROOT_INODE;
	let free_root_blk = base + ag_layout::FREE_INODE_ROOT;
	let agi = Agi { magic: magic::AGI, seqno: agno, root: ino_root_blk, free_root: free_root_blk };
	write_struct(device, base + ag_layout::AGI, &agi)?;

	let agfl = Agfl { magic: magic::AGFL, seqno: agno };
	write_struct(device, base + ag_layout::AGFL, &agfl)?;

	let cnt = BtreeContext::<CntRec>::new(device.clone(), cnt_root_blk);
	let bno = BtreeContext::<BnoRec>::new(device.clone(), bno_root_blk);
	cnt.init()?;
	bno.init()?;

	let data_blk_rel = data_blk - base;
	let free_data_blocks = this_ag_blocks - data_blk_rel;
	let avg = free_data_blocks / FREE_SPLIT;
	let last = free_data_blocks % FREE_SPLIT + avg;
	for i in 0..FREE_SPLIT {
		let count = if i == FREE_SPLIT - 1 { last } else { avg };
		let start = data_blk + i * avg;
		let rec = FreeSpaceRec { block_count: count, start_block: start };
		cnt.set(CntRec(rec))?;
		bno.set(BnoRec(rec))?;
	}

	let mut root_inode = InodeContext::init(device.clone(), ino_root_blk, mode_bits::S_IFDIR | 0o755, 0)?;
	root_inode.set_parent(ino_root_blk)?;

	Ok(())
}

fn write_struct<T: bincode::Encode>(device: &BlockDevice, block: u64, value: &T) -> io::Result<()> {
	let bytes = codec::pad(codec::pack(value)?, BLOCK_SIZE)?;
	device.write_block(block, &bytes)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ag::AgContext;
	use tempfile::NamedTempFile;

	#[test]
	fn format_initializes_every_ag_magic() {
		let f = NamedTempFile::new().unwrap();
		format(f.path(), 4, 4 * 1024).unwrap();

		let device = Arc::new(BlockDevice::open_existing(f.path()).unwrap());
		for agno in 0..4 {
			AgContext::load(&device, agno, 1024).unwrap();
		}
	}

	#[test]
	fn format_rejects_too_small_ag() {
		let f = NamedTempFile::new().unwrap();
		assert!(format(f.path(), 4, 4 * 20).is_err());
	}

	#[test]
	fn root_inode_is_self_parented_directory() {
		let f = NamedTempFile::new().unwrap();
		format(f.path(), 4, 4 * 1024).unwrap();

		let device = Arc::new(BlockDevice::open_existing(f.path()).unwrap());
		let ag0 = AgContext::load(&device, 0, 1024).unwrap();
		let root = InodeContext::load(device, ag0.root_inode()).unwrap();
		assert!(root.is_dir());
		assert_eq!(root.parent().unwrap(), ag0.root_inode());
	}

	#[test]
	fn cnt_and_bno_trees_agree_on_total_free_space() {
		let f = NamedTempFile::new().unwrap();
		format(f.path(), 4, 4 * 1024).unwrap();

		let device = Arc::new(BlockDevice::open_existing(f.path()).unwrap());
		let ag0 = AgContext::load(&device, 0, 1024).unwrap();
		let cnt = BtreeContext::<CntRec>::new(device.clone(), ag0.cnt_root());
		let bno = BtreeContext::<BnoRec>::new(device, ag0.bno_root());

		let cnt_total: u64 = cnt.load().unwrap().recs.iter().map(|r| r.0.block_count).sum();
		let bno_total: u64 = bno.load().unwrap().recs.iter().map(|r| r.0.block_count).sum();
		assert_eq!(cnt_total, bno_total);
		assert_eq!(cnt_total, 1024 - ag_layout::DATA);
	}
}
