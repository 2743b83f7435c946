//! Allocation-Group context: the four per-AG metadata blocks plus the
//! geometry needed to turn a local offset into a device block number.
//! Grounded on `mountpoint.go`'s `AgCtx`.

use std::io;
use std::sync::Arc;

use crate::block::BlockDevice;
use crate::codec;
use crate::data::{ag_layout, magic, Agf, Agfl, Agi, Superblock};
use crate::error::{err, AgfsError};

pub struct AgContext {
	pub agno: u32,
	pub ag_blocks: u64,
	pub sb: Superblock,
	pub agf: Agf,
	pub agi: Agi,
	pub agfl: Agfl,
}

impl AgContext {
	/// The device block number of `local_offset` blocks into this AG.
	pub fn block(&self, local_offset: u64) -> u64 {
		self.agno as u64 * self.ag_blocks + local_offset
	}

	/// Load and magic-verify all four metadata blocks of AG `agno`.
	pub fn load(device: &Arc<BlockDevice>, agno: u32, ag_blocks: u64) -> io::Result<Self> {
		let base = agno as u64 * ag_blocks;

		let sb: Superblock = codec::unpack(&device.read_block(base + ag_layout::SB)?)?;
		if sb.magic != magic::SUPERBLOCK {
			log::error!("ag {agno}: bad superblock magic {:#x}", sb.magic);
			return Err(err(AgfsError::InvalidStructBytes));
		}

		let agf: Agf = codec::unpack(&device.read_block(base + ag_layout::AGF)?)?;
		if agf.magic != magic::AGF {
			log::error!("ag {agno}: bad AGF magic {:#x}", agf.magic);
			return Err(err(AgfsError::InvalidStructBytes));
		}

		let agi: Agi = codec::unpack(&device.read_block(base + ag_layout::AGI)?)?;
		if agi.magic != magic::AGI {
			log::error!("ag {agno}: bad AGI magic {:#x}", agi.magic);
			return Err(err(AgfsError::InvalidStructBytes));
		}

		let agfl: Agfl = codec::unpack(&device.read_block(base + ag_layout::AGFL)?)?;
		if agfl.magic != magic::AGFL {
			log::error!("ag {agno}: bad AGFL magic {:#x}", agfl.magic);
			return Err(err(AgfsError::InvalidStructBytes));
		}

		log::trace!("ag {agno}: loaded, {ag_blocks} blocks");
		Ok(Self { agno, ag_blocks, sb, agf, agi, agfl })
	}

	/// Device block number of the bno-indexed free-space tree root.
	/// Stored as an absolute block number in the AGF, same as `cnt_root`.
	pub fn bno_root(&self) -> u64 {
		self.agf.bno_root
	}

	pub fn cnt_root(&self) -> u64 {
		self.agf.cnt_root
	}

	/// AG 0's root-directory inode block number. `agi.root` is stored as
	/// an absolute device block number, not an AG-local offset.
	pub fn root_inode(&self) -> u64 {
		self.agi.root
	}
}
