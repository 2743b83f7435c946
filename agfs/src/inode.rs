//! Inode engine: create, load, sync, read, write, truncate of one inode,
//! and — for directory-kind inodes — the inline short-form directory
//! fork operations. Grounded on `dinode.go`'s `InoContext`.

use std::io;
use std::sync::Arc;

use crate::block::BlockDevice;
use crate::codec;
use crate::data::{
	mode_bits, magic, BLOCK_SIZE, DirSfEntry, DirSfHdr, EOF_SENTINEL, FORK_OFFSET, InodeFormat,
	InodeHeader,
};
use crate::error::{err, AgfsError};
use crate::util::now_ts;

/// One loaded inode, identified by its own block number.
pub struct InodeContext {
	device: Arc<BlockDevice>,
	pub header: InodeHeader,
	pub dir: Option<DirSfHdr>,
}

fn is_dir_mode(mode: u16) -> bool {
	mode & mode_bits::S_IFMT == mode_bits::S_IFDIR
}

impl InodeContext {
	/// Derive the block-allocation request for a new inode from its
	/// intended `n_loc_blk`: one block for the inode itself plus its
	/// data blocks. `mknod` and `create` used to compute this two
	/// different ways; both callers now go through this helper.
	pub fn alloc_request_for(n_loc_blk: u32) -> u64 {
		1 + n_loc_blk as u64
	}

	/// Populate a brand-new inode at block `ino` with default ownership,
	/// `nlink = 1`, `LOCAL` format, and — for directory-kind modes — an
	/// empty `DirSfHdr`. Writes the result to disk before returning.
	pub fn init(device: Arc<BlockDevice>, ino: u64, mode: u16, n_loc_blk: u32) -> io::Result<Self> {
		let now = now_ts();
		let header = InodeHeader {
			magic: magic::INODE,
			ino,
			mode,
			format: InodeFormat::Local,
			uid: 0,
			gid: 0,
			nlink: 1,
			flags: 0,
			atime: now,
			mtime: now,
			ctime: now,
			crtime: now,
			size: 0,
			n_loc_blk,
			fork_off: FORK_OFFSET as u16,
			changecount: 0,
		};
		let dir = is_dir_mode(mode).then(|| DirSfHdr::empty(ino));
		let mut ctx = Self { device, header, dir };
		ctx.sync()?;
		log::trace!("inode {ino}: initialized mode={mode:#o} n_loc_blk={n_loc_blk}");
		Ok(ctx)
	}

	/// Fill the `n_loc_blk` blocks immediately after this inode with the
	/// `0xFF` in-band EOF sentinel.
	pub fn init_data_block(&self) -> io::Result<()> {
		let sentinel = [EOF_SENTINEL; BLOCK_SIZE];
		for v in 0..self.header.n_loc_blk as u64 {
			let blk = self.header.ino + 1 + v;
			self.device.write_block(blk, &sentinel)?;
		}
		Ok(())
	}

	/// Read the inode block, verify its magic, and decode the header
	/// plus — for directory-kind inodes — the `DirSfHdr` fork at byte
	/// offset 256.
	pub fn load(device: Arc<BlockDevice>, ino: u64) -> io::Result<Self> {
		let bytes = device.read_block(ino)?;
		if !crate::util::check_magic_u16(&bytes, magic::INODE) {
			log::error!("inode {ino}: bad magic");
			return Err(err(AgfsError::InvalidStructBytes));
		}
		let header: InodeHeader = codec::unpack(&bytes)?;
		let dir = if is_dir_mode(header.mode) {
			Some(codec::unpack::<DirSfHdr>(&bytes[FORK_OFFSET..])?)
		} else {
			None
		};
		Ok(Self { device, header, dir })
	}

	pub fn ino(&self) -> u64 {
		self.header.ino
	}

	pub fn is_dir(&self) -> bool {
		is_dir_mode(self.header.mode)
	}

	/// Refresh `ctime`, re-pack header and (for directories) the fork at
	/// offset 256, pad to one block, and write it out.
	pub fn sync(&mut self) -> io::Result<()> {
		self.header.ctime = now_ts();
		let mut bytes = codec::pack(&self.header)?;
		if let Some(dir) = &self.dir {
			bytes = codec::pad(bytes, FORK_OFFSET)?;
			bytes.extend(codec::pack(dir)?);
		}
		let bytes = codec::pad(bytes, BLOCK_SIZE)?;
		self.device.write_block(self.header.ino, &bytes)
	}

	/// `LOCAL` format maps virtual block `v` to `ino + 1 + v`; any other
	/// format is unsupported. Requests past the inode's allocated
	/// `n_loc_blk` are rejected rather than reading/writing into a
	/// neighboring inode's blocks.
	pub fn bmap(&self, v: u64) -> io::Result<u64> {
		if self.header.format != InodeFormat::Local {
			return Err(err(AgfsError::NotImplemented));
		}
		if v >= self.header.n_loc_blk as u64 {
			return Err(err(AgfsError::NoSpace));
		}
		Ok(self.header.ino + 1 + v)
	}

	/// Copy up to `buf.len()` bytes starting at byte offset `off`,
	/// refresh `atime`, sync, and return the number of bytes copied.
	pub fn read(&mut self, off: u64, buf: &mut [u8]) -> io::Result<usize> {
		let avail = self.header.size.saturating_sub(off);
		let n = (buf.len() as u64).min(avail) as usize;
		let mut done = 0usize;
		while done < n {
			let pos = off + done as u64;
			let vblk = pos / BLOCK_SIZE as u64;
			let in_blk = (pos % BLOCK_SIZE as u64) as usize;
			let dev_blk = self.bmap(vblk)?;
			let block = self.device.read_block(dev_blk)?;
			let chunk = (BLOCK_SIZE - in_blk).min(n - done);
			buf[done..done + chunk].copy_from_slice(&block[in_blk..in_blk + chunk]);
			done += chunk;
		}
		self.header.atime = now_ts();
		self.sync()?;
		Ok(done)
	}

	/// Symmetric to [`Self::read`]: read-modify-write each touched block,
	/// grow `size` to cover the written range, refresh `atime`, sync.
	pub fn write(&mut self, off: u64, data: &[u8]) -> io::Result<usize> {
		let mut done = 0usize;
		while done < data.len() {
			let pos = off + done as u64;
			let vblk = pos / BLOCK_SIZE as u64;
			let in_blk = (pos % BLOCK_SIZE as u64) as usize;
			let dev_blk = self.bmap(vblk)?;
			let mut block = self.device.read_block(dev_blk)?;
			let chunk = (BLOCK_SIZE - in_blk).min(data.len() - done);
			block[in_blk..in_blk + chunk].copy_from_slice(&data[done..done + chunk]);
			self.device.write_block(dev_blk, &block)?;
			done += chunk;
		}
		self.header.size = self.header.size.max(off + done as u64);
		self.header.atime = now_ts();
		self.sync()?;
		Ok(done)
	}

	/// Update `size` for a regular file. Returns the trailing
	/// `(start_block, count)` range freed when the new size needs fewer
	/// whole blocks than `n_loc_blk` currently reserves, so the caller
	/// can return it to the allocator — the inode engine doesn't hold a
	/// reference to the free-space tree, so the caller performs the
	/// actual release.
	pub fn truncate(&mut self, size: u64) -> io::Result<Option<(u64, u64)>> {
		if self.header.format != InodeFormat::Local || self.is_dir() {
			return Err(err(AgfsError::NotImplemented));
		}
		let cap = self.header.n_loc_blk as u64 * BLOCK_SIZE as u64;
		if size > cap {
			return Err(err(AgfsError::NoSpace));
		}
		let needed_blocks = size.div_ceil(BLOCK_SIZE as u64) as u32;
		let freed = if needed_blocks < self.header.n_loc_blk {
			let start = self.header.ino + 1 + needed_blocks as u64;
			let count = (self.header.n_loc_blk - needed_blocks) as u64;
			self.header.n_loc_blk = needed_blocks;
			Some((start, count))
		} else {
			None
		};
		self.header.size = size;
		self.sync()?;
		if let Some((start, count)) = freed {
			log::debug!("inode {}: truncate to {size} frees [{start}, {})", self.header.ino, start + count);
		}
		Ok(freed)
	}

	fn dir_mut(&mut self) -> io::Result<&mut DirSfHdr> {
		self.dir.as_mut().ok_or_else(|| err(AgfsError::NotDirectory))
	}

	fn dir_ref(&self) -> io::Result<&DirSfHdr> {
		self.dir.as_ref().ok_or_else(|| err(AgfsError::NotDirectory))
	}

	/// Remove any existing entry with this name, then append `{ino,
	/// name}`. The caller is responsible for calling `sync()` afterwards.
	pub fn add_entry(&mut self, name: &[u8], ino: u64) -> io::Result<()> {
		let dir = self.dir_mut()?;
		dir.entries.retain(|e| e.name != name);
		dir.entries.push(DirSfEntry { ino, name: name.to_vec() });
		Ok(())
	}

	pub fn get_entry(&self, name: &[u8]) -> io::Result<u64> {
		self
			.dir_ref()?
			.entries
			.iter()
			.find(|e| e.name == name)
			.map(|e| e.ino)
			.ok_or_else(|| err(AgfsError::NoEntry))
	}

	/// Remove the first entry with this name and return its inode
	/// number. The caller is responsible for calling `sync()` afterwards.
	pub fn remove_entry(&mut self, name: &[u8]) -> io::Result<u64> {
		let dir = self.dir_mut()?;
		let pos = dir
			.entries
			.iter()
			.position(|e| e.name == name)
			.ok_or_else(|| err(AgfsError::NoEntry))?;
		Ok(dir.entries.remove(pos).ino)
	}

	pub fn get_entries(&self) -> io::Result<&[DirSfEntry]> {
		Ok(&self.dir_ref()?.entries)
	}

	/// Store the parent inode number in the `DirSfHdr` and sync eagerly.
	pub fn set_parent(&mut self, parent: u64) -> io::Result<()> {
		self.dir_mut()?.parent = parent;
		self.sync()
	}

	pub fn parent(&self) -> io::Result<u64> {
		Ok(self.dir_ref()?.parent)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::NamedTempFile;

	fn harness() -> Arc<BlockDevice> {
		let f = NamedTempFile::new().unwrap();
		Arc::new(BlockDevice::open(f.path(), 16).unwrap())
	}

	#[test]
	fn init_load_roundtrip_regular_file() {
		let dev = harness();
		InodeContext::init(dev.clone(), 2, mode_bits::S_IFREG | 0o644, 4).unwrap();
		let loaded = InodeContext::load(dev, 2).unwrap();
		assert_eq!(loaded.header.magic, magic::INODE);
		assert_eq!(loaded.header.n_loc_blk, 4);
		assert!(loaded.dir.is_none());
	}

	#[test]
	fn init_dir_has_empty_fork() {
		let dev = harness();
		let ctx = InodeContext::init(dev.clone(), 2, mode_bits::S_IFDIR | 0o755, 0).unwrap();
		assert!(ctx.is_dir());
		assert_eq!(ctx.get_entries().unwrap().len(), 0);
	}

	#[test]
	fn write_then_read_roundtrip() {
		let dev = harness();
		let mut ctx = InodeContext::init(dev, 2, mode_bits::S_IFREG | 0o644, 4).unwrap();
		ctx.init_data_block().unwrap();
		let n = ctx.write(0, b"hello world").unwrap();
		assert_eq!(n, 11);
		assert_eq!(ctx.header.size, 11);

		let mut buf = [0u8; 11];
		let n = ctx.read(0, &mut buf).unwrap();
		assert_eq!(n, 11);
		assert_eq!(&buf, b"hello world");
	}

	#[test]
	fn write_across_blocks() {
		let dev = harness();
		let mut ctx = InodeContext::init(dev, 2, mode_bits::S_IFREG | 0o644, 8).unwrap();
		ctx.init_data_block().unwrap();
		let data: Vec<u8> = (0..1024u32).map(|i| (1 + i % 254) as u8).collect();
		let n = ctx.write(33, &data).unwrap();
		assert_eq!(n, 1024);
		assert_eq!(ctx.header.size, 1057);

		let mut buf = vec![0u8; 1024];
		ctx.read(33, &mut buf).unwrap();
		assert_eq!(buf, data);
	}

	#[test]
	fn data_blocks_start_as_eof_sentinel() {
		let dev = harness();
		let ctx = InodeContext::init(dev.clone(), 2, mode_bits::S_IFREG | 0o644, 2).unwrap();
		ctx.init_data_block().unwrap();
		let block = dev.read_block(3).unwrap();
		assert!(block.iter().all(|&b| b == EOF_SENTINEL));
	}

	#[test]
	fn add_entry_replaces_same_name() {
		let dev = harness();
		let mut ctx = InodeContext::init(dev, 2, mode_bits::S_IFDIR | 0o755, 0).unwrap();
		ctx.add_entry(b"a", 10).unwrap();
		ctx.add_entry(b"a", 20).unwrap();
		assert_eq!(ctx.get_entries().unwrap().len(), 1);
		assert_eq!(ctx.get_entry(b"a").unwrap(), 20);
	}

	#[test]
	fn remove_entry_then_lookup_fails() {
		let dev = harness();
		let mut ctx = InodeContext::init(dev, 2, mode_bits::S_IFDIR | 0o755, 0).unwrap();
		ctx.add_entry(b"a", 10).unwrap();
		ctx.remove_entry(b"a").unwrap();
		assert!(ctx.get_entry(b"a").is_err());
	}

	#[test]
	fn bmap_rejects_out_of_range() {
		let dev = harness();
		let ctx = InodeContext::init(dev, 2, mode_bits::S_IFREG | 0o644, 2).unwrap();
		assert!(ctx.bmap(2).is_err());
	}

	#[test]
	fn truncate_shrink_reports_freed_range() {
		let dev = harness();
		let mut ctx = InodeContext::init(dev, 2, mode_bits::S_IFREG | 0o644, 4).unwrap();
		ctx.init_data_block().unwrap();
		ctx.write(0, &[1u8; 2000]).unwrap();
		let freed = ctx.truncate(10).unwrap();
		assert_eq!(freed, Some((3 + 1, 3)));
		assert_eq!(ctx.header.n_loc_blk, 1);
	}
}
