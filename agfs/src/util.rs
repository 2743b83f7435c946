//! Small stateless helpers shared across the core: timestamp conversion,
//! a magic-number check and mode-string rendering.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Render the on-disk nanosecond counter as a [`SystemTime`].
pub fn time_to_system(ts: i64) -> SystemTime {
	if ts >= 0 {
		UNIX_EPOCH + Duration::from_nanos(ts as u64)
	} else {
		UNIX_EPOCH - Duration::from_nanos((-ts) as u64)
	}
}

/// The current time as the on-disk nanosecond counter.
pub fn now_ts() -> i64 {
	let d = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default();
	d.as_nanos() as i64
}

/// Verify that `bytes` begins with `magic` encoded little-endian, without
/// requiring the caller to slice and convert by hand.
pub fn check_magic_u16(bytes: &[u8], magic: u16) -> bool {
	bytes.len() >= 2 && u16::from_le_bytes(bytes[0..2].try_into().unwrap()) == magic
}

/// Render a POSIX-style mode word as the familiar `drwxr-xr-x` form.
pub fn mode_string(mode: u16) -> String {
	use crate::data::mode_bits::*;

	let kind = match mode & S_IFMT {
		S_IFDIR => 'd',
		S_IFLNK => 'l',
		S_IFCHR => 'c',
		S_IFBLK => 'b',
		S_IFIFO => 'p',
		S_IFSOCK => 's',
		_ => '-',
	};

	let bit = |perm: u16, ch: char| if mode & perm != 0 { ch } else { '-' };

	let mut s = String::with_capacity(10);
	s.push(kind);
	s.push(bit(0o400, 'r'));
	s.push(bit(0o200, 'w'));
	s.push(bit(0o100, 'x'));
	s.push(bit(0o040, 'r'));
	s.push(bit(0o020, 'w'));
	s.push(bit(0o010, 'x'));
	s.push(bit(0o004, 'r'));
	s.push(bit(0o002, 'w'));
	s.push(bit(0o001, 'x'));
	s
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mode_string_dir() {
		assert_eq!(mode_string(crate::data::mode_bits::S_IFDIR | 0o755), "drwxr-xr-x");
	}

	#[test]
	fn mode_string_reg() {
		assert_eq!(mode_string(crate::data::mode_bits::S_IFREG | 0o644), "-rw-r--r--");
	}
}
