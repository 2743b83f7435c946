use std::ffi::{c_int, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agfs::{Attr, Cancel, Fs, SetattrRequest};
use fuser::{
	FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
	ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, ReplyXattr, Request,
	TimeOrNow,
};

const MAX_CACHE: Duration = Duration::ZERO;

fn run<T>(f: impl FnOnce() -> std::io::Result<T>) -> Result<T, c_int> {
	f().map_err(|e| {
		if e.raw_os_error() != Some(libc::ENOENT) {
			log::error!("agfs error: {e}");
		}
		e.raw_os_error().unwrap_or(libc::EIO)
	})
}

fn system_to_ts(t: SystemTime) -> i64 {
	match t.duration_since(UNIX_EPOCH) {
		Ok(d) => d.as_nanos() as i64,
		Err(e) => -(e.duration().as_nanos() as i64),
	}
}

fn time_or_now(t: TimeOrNow) -> i64 {
	match t {
		TimeOrNow::SpecificTime(t) => system_to_ts(t),
		TimeOrNow::Now => system_to_ts(SystemTime::now()),
	}
}

/// FUSE's kernel driver serves requests on multiple worker threads but
/// never hands us a way to cancel one in flight; this host never sets
/// the flag, but `agfs::ops::Fs` still checks it between block transfers
/// so any future caller that does have a cancellation signal can reuse
/// the same read/write path.
pub struct FuseFs {
	fs: Fs,
}

impl FuseFs {
	pub fn new(fs: Fs) -> Self {
		Self { fs }
	}
}

impl Filesystem for FuseFs {
	fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
		Ok(())
	}

	fn destroy(&mut self) {}

	fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
		match run(|| self.fs.lookup(parent, name.as_bytes())) {
			Ok((attr, gen)) => reply.entry(&MAX_CACHE, &attr.into(), gen),
			Err(e) => reply.error(e),
		}
	}

	fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
		match run(|| self.fs.getattr(ino)) {
			Ok(attr) => reply.attr(&MAX_CACHE, &attr.into()),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn setattr(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		mode: Option<u32>,
		uid: Option<u32>,
		gid: Option<u32>,
		size: Option<u64>,
		atime: Option<TimeOrNow>,
		mtime: Option<TimeOrNow>,
		ctime: Option<SystemTime>,
		_fh: Option<u64>,
		_crtime: Option<SystemTime>,
		_chgtime: Option<SystemTime>,
		_bkuptime: Option<SystemTime>,
		_flags: Option<u32>,
		reply: ReplyAttr,
	) {
		let req = SetattrRequest {
			mode: mode.map(|m| m as u16),
			uid,
			gid,
			size,
			atime: atime.map(time_or_now),
			mtime: mtime.map(time_or_now),
			ctime: ctime.map(system_to_ts),
		};
		match run(|| self.fs.setattr(ino, &req)) {
			Ok(attr) => reply.attr(&MAX_CACHE, &attr.into()),
			Err(e) => reply.error(e),
		}
	}

	fn mknod(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		_rdev: u32,
		reply: ReplyEntry,
	) {
		let f = || self.fs.mknod(parent, name.as_bytes(), mode as u16, req.uid(), req.gid());
		match run(f) {
			Ok((attr, gen)) => reply.entry(&MAX_CACHE, &attr.into(), gen),
			Err(e) => reply.error(e),
		}
	}

	fn mkdir(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		reply: ReplyEntry,
	) {
		let f = || self.fs.mkdir(parent, name.as_bytes(), mode as u16, req.uid(), req.gid());
		match run(f) {
			Ok((attr, gen)) => reply.entry(&MAX_CACHE, &attr.into(), gen),
			Err(e) => reply.error(e),
		}
	}

	fn create(
		&mut self,
		req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		mode: u32,
		_umask: u32,
		flags: i32,
		reply: ReplyCreate,
	) {
		let f = || {
			self
				.fs
				.create(parent, name.as_bytes(), mode as u16, req.uid(), req.gid(), flags as u32)
		};
		match run(f) {
			Ok((attr, fh, gen)) => reply.created(&MAX_CACHE, &attr.into(), gen, fh, flags as u32),
			Err(e) => reply.error(e),
		}
	}

	fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
		match run(|| self.fs.unlink(parent, name.as_bytes())) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn rename(
		&mut self,
		_req: &Request<'_>,
		parent: u64,
		name: &OsStr,
		newparent: u64,
		newname: &OsStr,
		_flags: u32,
		reply: ReplyEmpty,
	) {
		let f = || self.fs.rename(parent, name.as_bytes(), newparent, newname.as_bytes());
		match run(f) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
		match run(|| self.fs.open(ino, flags)) {
			Ok(fh) => reply.opened(fh, 0),
			Err(e) => reply.error(e),
		}
	}

	fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
		match run(|| self.fs.opendir(ino, flags)) {
			Ok(fh) => reply.opened(fh, 0),
			Err(e) => reply.error(e),
		}
	}

	fn release(
		&mut self,
		_req: &Request<'_>,
		_ino: u64,
		fh: u64,
		_flags: i32,
		_lock_owner: Option<u64>,
		_flush: bool,
		reply: ReplyEmpty,
	) {
		self.fs.release(fh);
		reply.ok();
	}

	fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
		self.fs.releasedir(fh);
		reply.ok();
	}

	#[allow(clippy::too_many_arguments)]
	fn read(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		size: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyData,
	) {
		let cancel = Cancel::new();
		let f = || {
			let mut buf = vec![0u8; size as usize];
			let n = self.fs.read(ino, offset as u64, &mut buf, &cancel)?;
			buf.truncate(n);
			Ok(buf)
		};
		match run(f) {
			Ok(buf) => reply.data(&buf),
			Err(e) => reply.error(e),
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn write(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		data: &[u8],
		_write_flags: u32,
		_flags: i32,
		_lock_owner: Option<u64>,
		reply: ReplyWrite,
	) {
		let cancel = Cancel::new();
		match run(|| self.fs.write(ino, offset as u64, data, &cancel)) {
			Ok(n) => reply.written(n as u32),
			Err(e) => reply.error(e),
		}
	}

	fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
		let f = || self.fs.readdir(ino, offset);
		match run(f) {
			Ok(entries) => {
				for (i, e) in entries.iter().enumerate() {
					let kind = kind_to_filetype(e.kind);
					if reply.add(e.ino, offset + i as i64 + 1, kind, OsStr::from_bytes(&e.name)) {
						break;
					}
				}
				reply.ok();
			}
			Err(e) => reply.error(e),
		}
	}

	fn readdirplus(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		_fh: u64,
		offset: i64,
		mut reply: ReplyDirectoryPlus,
	) {
		let f = || self.fs.readdirplus(ino, offset);
		match run(f) {
			Ok(entries) => {
				for (i, e) in entries.iter().enumerate() {
					let attr: FileAttr = e.attr.into();
					let full = reply.add(
						attr.ino,
						offset + i as i64 + 1,
						OsStr::from_bytes(&e.name),
						&MAX_CACHE,
						&attr,
						e.generation,
					);
					if full {
						break;
					}
				}
				reply.ok();
			}
			Err(e) => reply.error(e),
		}
	}

	fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
		match run(|| self.fs.flush(fh)) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
		match run(|| self.fs.fsync(ino)) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
		match run(|| self.fs.access(ino, mask)) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}

	fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
		match run(|| self.fs.getxattr(ino, name.as_bytes())) {
			Ok(data) if size == 0 => reply.size(data.len() as u32),
			Ok(data) if (size as usize) < data.len() => reply.error(libc::ERANGE),
			Ok(data) => reply.data(&data),
			Err(e) => reply.error(e),
		}
	}

	fn setxattr(
		&mut self,
		_req: &Request<'_>,
		ino: u64,
		name: &OsStr,
		value: &[u8],
		_flags: i32,
		_position: u32,
		reply: ReplyEmpty,
	) {
		match run(|| self.fs.setxattr(ino, name.as_bytes(), value)) {
			Ok(()) => reply.ok(),
			Err(e) => reply.error(e),
		}
	}
}

fn kind_to_filetype(kind: u16) -> fuser::FileType {
	use agfs::mode_bits::*;
	use fuser::FileType;
	match kind {
		S_IFDIR => FileType::Directory,
		S_IFLNK => FileType::Symlink,
		S_IFCHR => FileType::CharDevice,
		S_IFBLK => FileType::BlockDevice,
		S_IFIFO => FileType::NamedPipe,
		S_IFSOCK => FileType::Socket,
		_ => FileType::RegularFile,
	}
}
