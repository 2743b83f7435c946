//! The whole formatted device: AG 0's superblock plus every AG's context,
//! and the one cross-AG operation the mount point itself performs —
//! satisfying a block-allocation request. Grounded on `mountpoint.go`'s
//! `MountPoint`.

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::ag::AgContext;
use crate::alloc;
use crate::block::BlockDevice;
use crate::codec;
use crate::data::{ag_layout, magic, Superblock};
use crate::data::{BnoRec, CntRec};
use crate::btree::BtreeContext;
use crate::error::{err, AgfsError};

/// A formatted device, opened read-write, with every AG's metadata loaded.
pub struct MountPoint {
	pub device: Arc<BlockDevice>,
	pub sb: Superblock,
	pub ags: Vec<AgContext>,
}

impl MountPoint {
	/// Open `path` as an already-formatted device: read AG 0's superblock
	/// to learn `ag_blocks`/`ag_count`, then load every AG in turn.
	pub fn open(path: &Path) -> io::Result<Self> {
		let device = Arc::new(BlockDevice::open_existing(path)?);
		Self::from_device(device)
	}

	pub fn from_device(device: Arc<BlockDevice>) -> io::Result<Self> {
		let sb_bytes = device.read_block(ag_layout::SB)?;
		let sb: Superblock = codec::unpack(&sb_bytes)?;
		if sb.magic != magic::SUPERBLOCK {
			log::error!("mount: AG 0 superblock has bad magic {:#x}", sb.magic);
			return Err(err(AgfsError::InvalidStructBytes));
		}
		log::debug!("mount: ag_count={} ag_blocks={}", sb.ag_count, sb.ag_blocks);

		let mut ags = Vec::with_capacity(sb.ag_count as usize);
		for agno in 0..sb.ag_count {
			ags.push(AgContext::load(&device, agno, sb.ag_blocks)?);
		}

		Ok(Self { device, sb, ags })
	}

	/// The filesystem's root-directory inode block: AG 0's `agi.root`.
	pub fn root_inode_block(&self) -> u64 {
		self.ags[0].root_inode()
	}

	fn cnt_tree(&self, agno: u32) -> BtreeContext<CntRec> {
		BtreeContext::new(self.device.clone(), self.ags[agno as usize].cnt_root())
	}

	fn bno_tree(&self, agno: u32) -> BtreeContext<BnoRec> {
		BtreeContext::new(self.device.clone(), self.ags[agno as usize].bno_root())
	}

	/// Ask AG `agno`'s free-space trees for `n` contiguous blocks.
	pub fn alloc_block(&self, agno: u32, n: u64) -> io::Result<u64> {
		log::trace!("alloc_block(agno={agno}, n={n})");
		let bno = self.bno_tree(agno);
		let cnt = self.cnt_tree(agno);
		let result = alloc::alloc_blocks(&bno, &cnt, n);
		if let Err(e) = &result {
			log::warn!("alloc_block(agno={agno}, n={n}): {e}");
		}
		result
	}

	/// Return `[start, start + count)` within AG `agno` to the free pool.
	pub fn free_block(&self, agno: u32, start: u64, count: u64) -> io::Result<()> {
		log::trace!("free_block(agno={agno}, start={start}, count={count})");
		let bno = self.bno_tree(agno);
		let cnt = self.cnt_tree(agno);
		alloc::free_blocks(&bno, &cnt, start, count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mkfs;
	use tempfile::NamedTempFile;

	#[test]
	fn open_loads_every_ag() {
		let f = NamedTempFile::new().unwrap();
		mkfs::format(f.path(), 4, 4 * 1024).unwrap();

		let mp = MountPoint::open(f.path()).unwrap();
		assert_eq!(mp.ags.len(), 4);
		assert_eq!(mp.sb.ag_count, 4);
	}

	#[test]
	fn root_inode_block_matches_ag0_agi() {
		let f = NamedTempFile::new().unwrap();
		mkfs::format(f.path(), 4, 4 * 1024).unwrap();

		let mp = MountPoint::open(f.path()).unwrap();
		assert_eq!(mp.root_inode_block(), mp.ags[0].agi.root);
	}

	#[test]
	fn alloc_then_free_round_trips_total_free_space() {
		let f = NamedTempFile::new().unwrap();
		mkfs::format(f.path(), 4, 4 * 1024).unwrap();
		let mp = MountPoint::open(f.path()).unwrap();

		let start = mp.alloc_block(0, 3).unwrap();
		mp.free_block(0, start, 3).unwrap();
	}
}
