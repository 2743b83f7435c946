//! Error kinds for the allocation-group filesystem core.
//!
//! Mirrors `error.go`'s eight named error kinds, but gives `entryExists`
//! and `noEntry` distinct codes instead of sharing one.

use std::fmt;
use std::io;

/// A core-level error, convertible to [`io::Error`] at any call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgfsError {
	/// AG geometry would yield fewer than 32 data blocks.
	AgTooSmall,
	/// An internal invariant was violated.
	Unreachable,
	/// A directory operation was requested on a non-directory inode.
	NotDirectory,
	/// `addEntry` would collide with an existing name where uniqueness is required.
	EntryExists,
	/// A directory-entry lookup found nothing under that name.
	NoEntry,
	/// A decoded block's magic number didn't match what was expected.
	InvalidStructBytes,
	/// The operation is defined but not supported by this implementation.
	NotImplemented,
	/// The allocator could not satisfy a block request.
	NoSpace,
	/// A B-tree index was out of bounds.
	OutOfRange,
	/// An in-flight operation was cancelled.
	Cancelled,
}

impl AgfsError {
	/// The error's stable numeric code. `NoEntry` is 9, not 4.
	pub const fn code(self) -> u32 {
		match self {
			Self::AgTooSmall => 1,
			Self::Unreachable => 2,
			Self::NotDirectory => 3,
			Self::EntryExists => 4,
			Self::InvalidStructBytes => 5,
			Self::NotImplemented => 6,
			Self::NoSpace => 7,
			Self::OutOfRange => 8,
			Self::NoEntry => 9,
			Self::Cancelled => 10,
		}
	}
}

impl fmt::Display for AgfsError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Self::AgTooSmall => "allocation group too small",
			Self::Unreachable => "unreachable state",
			Self::NotDirectory => "not a directory",
			Self::EntryExists => "directory entry already exists",
			Self::NoEntry => "no such entry",
			Self::InvalidStructBytes => "invalid on-disk structure",
			Self::NotImplemented => "not implemented",
			Self::NoSpace => "no space left on device",
			Self::OutOfRange => "index out of range",
			Self::Cancelled => "operation cancelled",
		};
		write!(f, "{msg} (code {})", self.code())
	}
}

impl std::error::Error for AgfsError {}

impl From<AgfsError> for io::Error {
	/// Built from a raw errno rather than an [`io::ErrorKind`], so callers
	/// at the FUSE boundary can recover it with `raw_os_error()` instead
	/// of hand-mapping `ErrorKind`s back to numbers.
	fn from(e: AgfsError) -> Self {
		let errno = match e {
			AgfsError::AgTooSmall => libc::EINVAL,
			AgfsError::Unreachable => libc::EIO,
			AgfsError::NotDirectory => libc::ENOTDIR,
			AgfsError::EntryExists => libc::EEXIST,
			AgfsError::NoEntry => libc::ENOENT,
			AgfsError::InvalidStructBytes => libc::EINVAL,
			AgfsError::NotImplemented => libc::ENOSYS,
			AgfsError::NoSpace => libc::ENOSPC,
			AgfsError::OutOfRange => libc::EINVAL,
			AgfsError::Cancelled => libc::ECANCELED,
		};
		io::Error::from_raw_os_error(errno)
	}
}

/// Result alias used throughout the core; the device, codec, B-tree and
/// inode-engine layers all return `io::Error` so callers can match on
/// `.kind()` without unwrapping a second error type.
pub type Result<T> = io::Result<T>;

/// Build an `io::Error` from an [`AgfsError`] in one call, in the spirit
/// of `mountpoint.go`'s `err!` macro.
pub fn err(kind: AgfsError) -> io::Error {
	kind.into()
}
