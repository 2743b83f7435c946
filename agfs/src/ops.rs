//! Filesystem-operations layer: translates protocol-shaped calls (lookup,
//! getattr, read, write, mkdir, ...) into inode-engine and mount-point
//! calls. Grounded on `fs.go`'s `PoundFS` methods, with the open-file
//! table and generation counter modeled on `fs_handle.go`'s
//! `OpenfileMap`/`NextGen` — split here into two independent counters,
//! one for handles and one for lookup generations.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::data::{mode_bits, BLOCK_SIZE};
use crate::error::{err, AgfsError};
use crate::inode::InodeContext;
use crate::lock_table::LockTable;
use crate::mount::MountPoint;

/// All blocks are allocated from AG 0, regardless of which AG the
/// requesting inode lives in.
const ALLOC_AG: u32 = 0;
/// `create`'s data-block count: `4096 / 512`.
const CREATE_DATA_BLOCKS: u32 = 4096 / BLOCK_SIZE as u32;
/// `mknod`'s data-block count: a fixed 5-block allocation (`1 + 4`).
const MKNOD_DATA_BLOCKS: u32 = 4;

/// A cheap, cloneable cancellation flag checked between block transfers
/// in `read`/`write`. Never set by the `fuser` bridge today, since
/// `fuser` offers no cancellation signal of its own.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::Relaxed);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}
}

struct OpenFile {
	ino: u64,
	flags: i32,
}

/// Attributes projected from an on-disk inode to the shape every external
/// caller wants (a `fuser::FileAttr` when the `fuser` feature is on).
#[derive(Debug, Clone, Copy)]
pub struct Attr {
	pub ino: u64,
	pub size: u64,
	pub blocks: u64,
	pub atime: i64,
	pub mtime: i64,
	pub ctime: i64,
	pub crtime: i64,
	pub kind: u16,
	pub perm: u16,
	pub nlink: u32,
	pub uid: u32,
	pub gid: u32,
}

/// A directory entry as returned by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub name: Vec<u8>,
	pub ino: u64,
	pub kind: u16,
}

/// A directory entry as returned by `readdirplus`: includes the full
/// attributes and generation a `lookup` would have produced.
#[derive(Debug, Clone)]
pub struct DirEntryPlus {
	pub name: Vec<u8>,
	pub attr: Attr,
	pub generation: u64,
}

/// Fields to apply in `setattr`; `None` leaves the field untouched,
/// mirroring the protocol's valid-mask bitfield as typed `Option`s
/// instead of a bitmask callers would have to decode by hand.
#[derive(Debug, Clone, Default)]
pub struct SetattrRequest {
	pub mode: Option<u16>,
	pub uid: Option<u32>,
	pub gid: Option<u32>,
	pub size: Option<u64>,
	pub atime: Option<i64>,
	pub mtime: Option<i64>,
	pub ctime: Option<i64>,
}

/// The kernel's reserved root node ID, remapped to the real root inode
/// block before every operation that takes an inode number.
pub const ROOT_NODE_ID: u64 = 1;

pub struct Fs {
	mount: MountPoint,
	open_files: Mutex<HashMap<u64, OpenFile>>,
	next_handle: AtomicU64,
	next_generation: AtomicU64,
	xattrs: Mutex<HashMap<u64, HashMap<Vec<u8>, Vec<u8>>>>,
	locks: LockTable,
}

impl Fs {
	pub fn open(path: &Path) -> io::Result<Self> {
		Ok(Self::from_mount(MountPoint::open(path)?))
	}

	pub fn from_mount(mount: MountPoint) -> Self {
		Self {
			mount,
			open_files: Mutex::new(HashMap::new()),
			next_handle: AtomicU64::new(1),
			next_generation: AtomicU64::new(1),
			xattrs: Mutex::new(HashMap::new()),
			locks: LockTable::new(),
		}
	}

	fn next_handle(&self) -> u64 {
		self.next_handle.fetch_add(1, Ordering::SeqCst)
	}

	fn next_generation(&self) -> u64 {
		self.next_generation.fetch_add(1, Ordering::SeqCst)
	}

	/// Node ID 1 is the kernel's reserved root; everywhere else resolves
	/// to the device block number of the inode itself.
	fn remap(&self, ino: u64) -> u64 {
		if ino == ROOT_NODE_ID {
			self.mount.root_inode_block()
		} else {
			ino
		}
	}

	/// Inverse of [`Self::remap`], applied to every `Attr`/entry ino this
	/// layer hands back to a caller.
	fn externalize(&self, block: u64) -> u64 {
		if block == self.mount.root_inode_block() {
			ROOT_NODE_ID
		} else {
			block
		}
	}

	fn to_attr(&self, ctx: &InodeContext) -> Attr {
		let h = &ctx.header;
		Attr {
			ino: self.externalize(h.ino),
			size: h.size,
			blocks: h.n_loc_blk as u64,
			atime: h.atime,
			mtime: h.mtime,
			ctime: h.ctime,
			crtime: h.crtime,
			kind: h.mode & mode_bits::S_IFMT,
			perm: h.mode & 0o7777,
			nlink: h.nlink,
			uid: h.uid,
			gid: h.gid,
		}
	}

	fn load(&self, block: u64) -> io::Result<InodeContext> {
		InodeContext::load(self.mount.device.clone(), block)
	}

	/// Allocate `1 + n_loc_blk` contiguous blocks from AG 0 and initialize
	/// a fresh inode over them; the data blocks follow the inode block
	/// exactly as `InodeContext::bmap`'s `LOCAL` layout expects.
	fn alloc_inode(&self, mode: u16, n_loc_blk: u32) -> io::Result<InodeContext> {
		let start = self.mount.alloc_block(ALLOC_AG, InodeContext::alloc_request_for(n_loc_blk))?;
		InodeContext::init(self.mount.device.clone(), start, mode, n_loc_blk)
	}

	pub fn lookup(&self, parent: u64, name: &[u8]) -> io::Result<(Attr, u64)> {
		let parent = self.remap(parent);
		log::trace!("lookup(parent={parent}, name={:?})", String::from_utf8_lossy(name));
		let parent_ctx = self.locks.with_lock(parent, || self.load(parent))?;
		if !parent_ctx.is_dir() {
			return Err(err(AgfsError::NotDirectory));
		}
		let child = parent_ctx.get_entry(name)?;
		let child_ctx = self.locks.with_lock(child, || self.load(child))?;
		Ok((self.to_attr(&child_ctx), self.next_generation()))
	}

	pub fn getattr(&self, ino: u64) -> io::Result<Attr> {
		let block = self.remap(ino);
		let ctx = self.locks.with_lock(block, || self.load(block))?;
		if ctx.header.nlink == 0 {
			return Err(err(AgfsError::NoEntry));
		}
		Ok(self.to_attr(&ctx))
	}

	pub fn setattr(&self, ino: u64, req: &SetattrRequest) -> io::Result<Attr> {
		let block = self.remap(ino);
		self.locks.with_lock(block, || {
			let mut ctx = self.load(block)?;
			if let Some(mode) = req.mode {
				ctx.header.mode = (ctx.header.mode & mode_bits::S_IFMT) | (mode & !mode_bits::S_IFMT);
			}
			if let Some(uid) = req.uid {
				ctx.header.uid = uid;
			}
			if let Some(gid) = req.gid {
				ctx.header.gid = gid;
			}
			if let Some(size) = req.size {
				if let Some((start, count)) = ctx.truncate(size)? {
					self.mount.free_block(ALLOC_AG, start, count)?;
				}
			}
			if let Some(atime) = req.atime {
				ctx.header.atime = atime;
			}
			if let Some(mtime) = req.mtime {
				ctx.header.mtime = mtime;
			}
			if let Some(ctime) = req.ctime {
				ctx.header.ctime = ctime;
			}
			ctx.sync()?;
			Ok(self.to_attr(&ctx))
		})
	}

	fn create_child(
		&self,
		parent: u64,
		name: &[u8],
		mode: u16,
		uid: u32,
		gid: u32,
		flags: u32,
		n_loc_blk: u32,
		init_data: bool,
	) -> io::Result<InodeContext> {
		let parent = self.remap(parent);
		log::debug!("create_child(parent={parent}, name={:?}, mode={mode:#o})", String::from_utf8_lossy(name));
		self.locks.with_locks(&[parent], || {
			let mut parent_ctx = self.load(parent)?;
			if !parent_ctx.is_dir() {
				return Err(err(AgfsError::NotDirectory));
			}

			let mut child = self.alloc_inode(mode, n_loc_blk)?;
			child.header.uid = uid;
			child.header.gid = gid;
			child.header.flags = flags;
			if init_data {
				child.init_data_block()?;
			}
			child.sync()?;

			parent_ctx.add_entry(name, child.ino())?;
			parent_ctx.sync()?;

			Ok(child)
		})
	}

	pub fn create(
		&self,
		parent: u64,
		name: &[u8],
		mode: u16,
		uid: u32,
		gid: u32,
		flags: u32,
	) -> io::Result<(Attr, u64, u64)> {
		let child = self.create_child(
			parent,
			name,
			mode,
			uid,
			gid,
			flags,
			CREATE_DATA_BLOCKS,
			true,
		)?;
		let handle = self.register_open(child.ino(), flags as i32);
		Ok((self.to_attr(&child), handle, self.next_generation()))
	}

	pub fn mknod(&self, parent: u64, name: &[u8], mode: u16, uid: u32, gid: u32) -> io::Result<(Attr, u64)> {
		let child = self.create_child(parent, name, mode, uid, gid, 0, MKNOD_DATA_BLOCKS, true)?;
		Ok((self.to_attr(&child), self.next_generation()))
	}

	pub fn mkdir(&self, parent: u64, name: &[u8], mode: u16, uid: u32, gid: u32) -> io::Result<(Attr, u64)> {
		let child = self.create_child(
			parent,
			name,
			mode_bits::S_IFDIR | mode,
			uid,
			gid,
			0,
			0,
			false,
		)?;
		Ok((self.to_attr(&child), self.next_generation()))
	}

	pub fn unlink(&self, parent: u64, name: &[u8]) -> io::Result<()> {
		let parent = self.remap(parent);
		log::debug!("unlink(parent={parent}, name={:?})", String::from_utf8_lossy(name));

		// child_block's relation to parent isn't known in advance, so a single
		// with_lock(parent, ...) can't be widened to cover it up front. Peek it
		// under parent's lock alone, then take both locks together (ascending
		// order, same as rename) for the actual mutation; re-resolve the entry
		// inside that section in case it changed between the peek and the lock.
		let child_block = self.locks.with_lock(parent, || {
			let parent_ctx = self.load(parent)?;
			parent_ctx.get_entry(name)
		})?;

		self.locks.with_locks(&[parent, child_block], || {
			let mut parent_ctx = self.load(parent)?;
			let child_block = parent_ctx.get_entry(name)?;
			parent_ctx.remove_entry(name)?;
			parent_ctx.sync()?;

			let mut child_ctx = self.load(child_block)?;
			child_ctx.header.nlink = child_ctx.header.nlink.saturating_sub(1);
			if child_ctx.header.nlink == 0 {
				if let Some((start, count)) = child_ctx.truncate(0)? {
					self.mount.free_block(ALLOC_AG, start, count)?;
				}
			}
			child_ctx.sync()
		})
	}

	pub fn rename(&self, old_parent: u64, old_name: &[u8], new_parent: u64, new_name: &[u8]) -> io::Result<()> {
		let old_parent = self.remap(old_parent);
		let new_parent = self.remap(new_parent);
		log::debug!(
			"rename(old_parent={old_parent}, old_name={:?}, new_parent={new_parent}, new_name={:?})",
			String::from_utf8_lossy(old_name),
			String::from_utf8_lossy(new_name),
		);
		self.locks.with_locks(&[old_parent, new_parent], || {
			let mut old_ctx = self.load(old_parent)?;
			let ino = old_ctx.get_entry(old_name)?;
			old_ctx.remove_entry(old_name)?;

			if old_parent == new_parent {
				old_ctx.add_entry(new_name, ino)?;
				old_ctx.sync()?;
			} else {
				let mut new_ctx = self.load(new_parent)?;
				new_ctx.add_entry(new_name, ino)?;
				old_ctx.sync()?;
				new_ctx.sync()?;
			}
			Ok(())
		})
	}

	fn register_open(&self, ino: u64, flags: i32) -> u64 {
		let fh = self.next_handle();
		self.open_files.lock().unwrap().insert(fh, OpenFile { ino, flags });
		fh
	}

	pub fn open(&self, ino: u64, flags: i32) -> io::Result<u64> {
		Ok(self.register_open(self.remap(ino), flags))
	}

	pub fn opendir(&self, ino: u64, flags: i32) -> io::Result<u64> {
		Ok(self.register_open(self.remap(ino), flags))
	}

	pub fn release(&self, fh: u64) {
		self.open_files.lock().unwrap().remove(&fh);
	}

	pub fn releasedir(&self, fh: u64) {
		self.open_files.lock().unwrap().remove(&fh);
	}

	pub fn read(&self, ino: u64, off: u64, buf: &mut [u8], cancel: &Cancel) -> io::Result<usize> {
		let block = self.remap(ino);
		self.locks.with_lock(block, || {
			let mut ctx = self.load(block)?;
			let mut done = 0;
			while done < buf.len() {
				if cancel.is_cancelled() {
					return Err(err(AgfsError::Cancelled));
				}
				let chunk = (buf.len() - done).min(BLOCK_SIZE);
				let n = ctx.read(off + done as u64, &mut buf[done..done + chunk])?;
				done += n;
				if n < chunk {
					break;
				}
			}
			Ok(done)
		})
	}

	pub fn write(&self, ino: u64, off: u64, data: &[u8], cancel: &Cancel) -> io::Result<usize> {
		let block = self.remap(ino);
		self.locks.with_lock(block, || {
			let mut ctx = self.load(block)?;
			let mut done = 0;
			while done < data.len() {
				if cancel.is_cancelled() {
					return Err(err(AgfsError::Cancelled));
				}
				let chunk = (data.len() - done).min(BLOCK_SIZE);
				done += ctx.write(off + done as u64, &data[done..done + chunk])?;
			}
			Ok(done)
		})
	}

	pub fn readdir(&self, ino: u64, offset: i64) -> io::Result<Vec<DirEntry>> {
		if offset > 0 {
			return Ok(Vec::new());
		}
		let block = self.remap(ino);
		let ctx = self.locks.with_lock(block, || self.load(block))?;
		ctx
			.get_entries()?
			.iter()
			.map(|e| {
				let child = self.locks.with_lock(e.ino, || self.load(e.ino))?;
				Ok(DirEntry { name: e.name.clone(), ino: self.externalize(e.ino), kind: child.header.mode & mode_bits::S_IFMT })
			})
			.collect()
	}

	pub fn readdirplus(&self, ino: u64, offset: i64) -> io::Result<Vec<DirEntryPlus>> {
		if offset > 0 {
			return Ok(Vec::new());
		}
		let block = self.remap(ino);
		let ctx = self.locks.with_lock(block, || self.load(block))?;

		let mut out = vec![
			DirEntryPlus { name: b".".to_vec(), attr: self.to_attr(&ctx), generation: self.next_generation() },
			DirEntryPlus {
				name: b"..".to_vec(),
				attr: {
					let parent = ctx.parent()?;
					let parent_ctx = self.locks.with_lock(parent, || self.load(parent))?;
					self.to_attr(&parent_ctx)
				},
				generation: self.next_generation(),
			},
		];

		for e in ctx.get_entries()? {
			let (attr, generation) = self.lookup(self.externalize(block), &e.name)?;
			out.push(DirEntryPlus { name: e.name.clone(), attr, generation });
		}
		Ok(out)
	}

	pub fn flush(&self, _fh: u64) -> io::Result<()> {
		Ok(())
	}

	pub fn fsync(&self, _ino: u64) -> io::Result<()> {
		Ok(())
	}

	pub fn access(&self, _ino: u64, _mask: i32) -> io::Result<()> {
		Ok(())
	}

	pub fn lock(&self, _ino: u64) -> io::Result<()> {
		Ok(())
	}

	pub fn getxattr(&self, ino: u64, name: &[u8]) -> io::Result<Vec<u8>> {
		let block = self.remap(ino);
		self
			.xattrs
			.lock()
			.unwrap()
			.get(&block)
			.and_then(|m| m.get(name))
			.cloned()
			.ok_or_else(|| err(AgfsError::NoEntry))
	}

	/// Caches the value — but still reports "not implemented" to the
	/// caller. Kept intentionally: `set` caches despite returning
	/// not-implemented.
	pub fn setxattr(&self, ino: u64, name: &[u8], value: &[u8]) -> io::Result<()> {
		let block = self.remap(ino);
		self
			.xattrs
			.lock()
			.unwrap()
			.entry(block)
			.or_default()
			.insert(name.to_vec(), value.to_vec());
		Err(err(AgfsError::NotImplemented))
	}

	pub fn listxattr(&self, _ino: u64) -> io::Result<Vec<u8>> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn removexattr(&self, _ino: u64, _name: &[u8]) -> io::Result<()> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn statfs(&self) -> io::Result<()> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn readlink(&self, _ino: u64) -> io::Result<Vec<u8>> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn rmdir(&self, _parent: u64, _name: &[u8]) -> io::Result<()> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn symlink(&self, _parent: u64, _name: &[u8], _target: &[u8]) -> io::Result<(Attr, u64)> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn link(&self, _ino: u64, _new_parent: u64, _new_name: &[u8]) -> io::Result<(Attr, u64)> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn fallocate(&self, _ino: u64, _offset: i64, _length: i64, _mode: i32) -> io::Result<()> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn copy_file_range(
		&self,
		_ino_in: u64,
		_off_in: i64,
		_ino_out: u64,
		_off_out: i64,
		_len: u64,
	) -> io::Result<u64> {
		Err(err(AgfsError::NotImplemented))
	}

	pub fn lseek(&self, _ino: u64, _offset: i64, _whence: i32) -> io::Result<i64> {
		Err(err(AgfsError::NotImplemented))
	}
}

#[cfg(feature = "fuser")]
mod fuser_glue {
	use fuser::{FileAttr, FileType};

	use super::Attr;
	use crate::data::mode_bits;
	use crate::util::time_to_system;

	fn kind_to_filetype(kind: u16) -> FileType {
		match kind {
			mode_bits::S_IFDIR => FileType::Directory,
			mode_bits::S_IFLNK => FileType::Symlink,
			mode_bits::S_IFCHR => FileType::CharDevice,
			mode_bits::S_IFBLK => FileType::BlockDevice,
			mode_bits::S_IFIFO => FileType::NamedPipe,
			mode_bits::S_IFSOCK => FileType::Socket,
			_ => FileType::RegularFile,
		}
	}

	impl From<Attr> for FileAttr {
		fn from(a: Attr) -> Self {
			Self {
				ino: a.ino,
				size: a.size,
				blocks: a.blocks,
				atime: time_to_system(a.atime),
				mtime: time_to_system(a.mtime),
				ctime: time_to_system(a.ctime),
				crtime: time_to_system(a.crtime),
				kind: kind_to_filetype(a.kind),
				perm: a.perm,
				nlink: a.nlink,
				uid: a.uid,
				gid: a.gid,
				rdev: 0,
				blksize: crate::data::BLOCK_SIZE as u32,
				flags: 0,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::mode_bits;
	use crate::mkfs;
	use tempfile::NamedTempFile;

	fn harness() -> Fs {
		let f = NamedTempFile::new().unwrap();
		mkfs::format(f.path(), 4, 4 * 1024).unwrap();
		Fs::open(f.path()).unwrap()
	}

	#[test]
	fn getattr_root_succeeds_via_remap() {
		let fs = harness();
		let attr = fs.getattr(ROOT_NODE_ID).unwrap();
		assert_eq!(attr.ino, ROOT_NODE_ID);
		assert_eq!(attr.kind, mode_bits::S_IFDIR);
	}

	#[test]
	fn create_then_lookup_then_read_write_roundtrip() {
		let fs = harness();
		let (attr, fh, _gen) = fs.create(ROOT_NODE_ID, b"hello.txt", mode_bits::S_IFREG | 0o644, 0, 0, 0).unwrap();
		assert_eq!(attr.perm, 0o644);

		let cancel = Cancel::new();
		let n = fs.write(attr.ino, 0, b"hi there", &cancel).unwrap();
		assert_eq!(n, 8);

		let mut buf = [0u8; 8];
		let n = fs.read(attr.ino, 0, &mut buf, &cancel).unwrap();
		assert_eq!(n, 8);
		assert_eq!(&buf, b"hi there");

		let (looked_up, _gen2) = fs.lookup(ROOT_NODE_ID, b"hello.txt").unwrap();
		assert_eq!(looked_up.ino, attr.ino);

		fs.release(fh);
	}

	#[test]
	fn mkdir_then_readdir_sees_entry() {
		let fs = harness();
		fs.mkdir(ROOT_NODE_ID, b"sub", 0o755, 0, 0).unwrap();
		let entries = fs.readdir(ROOT_NODE_ID, 0).unwrap();
		assert!(entries.iter().any(|e| e.name == b"sub"));
	}

	#[test]
	fn unlink_drops_nlink_and_removes_entry() {
		let fs = harness();
		let (attr, _fh, _gen) = fs.create(ROOT_NODE_ID, b"f", mode_bits::S_IFREG | 0o644, 0, 0, 0).unwrap();
		fs.unlink(ROOT_NODE_ID, b"f").unwrap();
		assert!(fs.lookup(ROOT_NODE_ID, b"f").is_err());
		assert!(fs.getattr(attr.ino).is_err());
	}

	#[test]
	fn rename_moves_entry_between_directories() {
		let fs = harness();
		fs.create(ROOT_NODE_ID, b"a", mode_bits::S_IFREG | 0o644, 0, 0, 0).unwrap();
		let (dir, _gen) = fs.mkdir(ROOT_NODE_ID, b"d", 0o755, 0, 0).unwrap();

		fs.rename(ROOT_NODE_ID, b"a", dir.ino, b"b").unwrap();

		assert!(fs.lookup(ROOT_NODE_ID, b"a").is_err());
		assert!(fs.lookup(dir.ino, b"b").is_ok());
	}

	#[test]
	fn setattr_size_shrink_frees_blocks_without_error() {
		let fs = harness();
		let (attr, _fh, _gen) = fs.create(ROOT_NODE_ID, b"f", mode_bits::S_IFREG | 0o644, 0, 0, 0).unwrap();
		let cancel = Cancel::new();
		fs.write(attr.ino, 0, &[1u8; 2000], &cancel).unwrap();

		let req = SetattrRequest { size: Some(10), ..Default::default() };
		let shrunk = fs.setattr(attr.ino, &req).unwrap();
		assert_eq!(shrunk.size, 10);
	}

	#[test]
	fn xattr_set_caches_but_reports_not_implemented() {
		let fs = harness();
		let (attr, _fh, _gen) = fs.create(ROOT_NODE_ID, b"f", mode_bits::S_IFREG | 0o644, 0, 0, 0).unwrap();
		assert!(fs.setxattr(attr.ino, b"user.k", b"v").is_err());
		assert_eq!(fs.getxattr(attr.ino, b"user.k").unwrap(), b"v");
	}
}
