//! On-disk record types: superblock, the three remaining per-AG metadata
//! blocks, the generic B-tree block, free-space records and the inode.
//!
//! Fixed-shape records derive `bincode::Encode`/`Decode` directly.
//! Records whose wire shape has a named field sizing a following array
//! ([`BtreeBlock`], [`DirSfHdr`], [`DirSfEntry`]) get a hand-written impl,
//! in the same spirit as `inode.rs`'s manual `impl Decode for Inode`.

use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};

pub mod magic {
	pub const SUPERBLOCK: u32 = 0x7366_6470;
	pub const BTREE_BLOCK: u32 = 0x4246_5442;
	pub const INODE: u16 = 0x4e49;
	pub const AGF: u32 = u32::from_le_bytes(*b"AGF\0");
	pub const AGI: u32 = u32::from_le_bytes(*b"AGI\0");
	pub const AGFL: u32 = u32::from_le_bytes(*b"AGFL");
}

pub mod mode_bits {
	pub const S_IFMT: u16 = 0o170000;
	pub const S_IFSOCK: u16 = 0o140000;
	pub const S_IFLNK: u16 = 0o120000;
	pub const S_IFREG: u16 = 0o100000;
	pub const S_IFBLK: u16 = 0o060000;
	pub const S_IFDIR: u16 = 0o040000;
	pub const S_IFCHR: u16 = 0o020000;
	pub const S_IFIFO: u16 = 0o010000;
}

/// Block offsets relative to the start of an AG.
pub mod ag_layout {
	pub const SB: u64 = 0;
	pub const AGF: u64 = 1;
	pub const AGI: u64 = 2;
	pub const AGFL: u64 = 3;
	pub const FREELIST: u64 = 4;
	pub const BNO_ROOT: u64 = 5;
	pub const CNT_ROOT: u64 = 6;
	pub const ROOT_INODE: u64 = 7;
	pub const FREE_INODE_ROOT: u64 = 8;
	pub const DATA: u64 = 16;
}

pub const BLOCK_SIZE: usize = 512;
pub const FORK_OFFSET: usize = 256;
pub const DEFAULT_AG_COUNT: u32 = 4;
pub const FREE_SPLIT: u64 = 16;
pub const MIN_AG_DATA_BLOCKS: u64 = 32;
pub const EOF_SENTINEL: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Superblock {
	pub magic: u32,
	pub block_size: u32,
	pub seqno: u32,
	pub ag_blocks: u64,
	pub ag_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Agf {
	pub magic: u32,
	pub seqno: u32,
	pub bno_root: u64,
	pub cnt_root: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Agi {
	pub magic: u32,
	pub seqno: u32,
	pub root: u64,
	pub free_root: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Agfl {
	pub magic: u32,
	pub seqno: u32,
}

/// A single contiguous extent of unallocated blocks within one AG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpaceRec {
	pub block_count: u64,
	pub start_block: u64,
}

impl Encode for FreeSpaceRec {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.block_count.encode(e)?;
		self.start_block.encode(e)
	}
}

impl<C> Decode<C> for FreeSpaceRec {
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			block_count: Decode::decode(d)?,
			start_block: Decode::decode(d)?,
		})
	}
}

/// Something storable in a [`BtreeBlock`]: a sort key and an ordering.
pub trait BtreeRecord: Encode + Decode<()> + Clone + Copy {
	fn key(&self) -> u64;
	fn less(&self, other: &Self) -> bool {
		self.key() < other.key()
	}
}

/// `FreeSpaceRec` keyed by extent length — the cnt-tree's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CntRec(pub FreeSpaceRec);

impl Encode for CntRec {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.0.encode(e)
	}
}
impl<C> Decode<C> for CntRec {
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self(Decode::decode(d)?))
	}
}
impl BtreeRecord for CntRec {
	fn key(&self) -> u64 {
		self.0.block_count
	}
}

/// `FreeSpaceRec` keyed by start address — the bno-tree's view, used for
/// neighbor coalescing on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BnoRec(pub FreeSpaceRec);

impl Encode for BnoRec {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.0.encode(e)
	}
}
impl<C> Decode<C> for BnoRec {
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self(Decode::decode(d)?))
	}
}
impl BtreeRecord for BnoRec {
	fn key(&self) -> u64 {
		self.0.start_block
	}
}

/// One block of a single-level B-tree: `{magic, numRecs, blkNo, recs}`.
/// `numRecs` is a named field sizing `recs`, so the derive macro (which
/// would always length-prefix a `Vec` with its own count) doesn't match
/// the wire format; this impl writes/reads the fields in on-disk field
/// order and reconstructs `recs` from the declared count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeBlock<R> {
	pub magic: u32,
	pub blk_no: u64,
	pub recs: Vec<R>,
}

impl<R: BtreeRecord> BtreeBlock<R> {
	pub fn empty(blk_no: u64) -> Self {
		Self { magic: magic::BTREE_BLOCK, blk_no, recs: Vec::new() }
	}
}

impl<R: Encode> Encode for BtreeBlock<R> {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.magic.encode(e)?;
		(self.recs.len() as u32).encode(e)?;
		self.blk_no.encode(e)?;
		for rec in &self.recs {
			rec.encode(e)?;
		}
		Ok(())
	}
}

impl<C, R> Decode<C> for BtreeBlock<R>
where
	R: Decode<C>,
{
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		let magic = u32::decode(d)?;
		let num_recs = u32::decode(d)? as usize;
		let blk_no = u64::decode(d)?;
		let mut recs = Vec::with_capacity(num_recs);
		for _ in 0..num_recs {
			recs.push(R::decode(d)?);
		}
		Ok(Self { magic, blk_no, recs })
	}
}

/// `format` discriminant of an inode header. Only `Local` is supported;
/// the others round-trip on disk but every operation on them fails with
/// `NotImplemented`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeFormat {
	Local,
	Extents,
	Btree,
	Dev,
}

impl InodeFormat {
	pub const fn as_u8(self) -> u8 {
		match self {
			Self::Local => 0,
			Self::Extents => 1,
			Self::Btree => 2,
			Self::Dev => 3,
		}
	}

	pub const fn from_u8(v: u8) -> Self {
		match v {
			0 => Self::Local,
			1 => Self::Extents,
			2 => Self::Btree,
			_ => Self::Dev,
		}
	}
}

/// Fixed-shape inode header, occupying the first bytes of an inode block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeHeader {
	pub magic: u16,
	pub ino: u64,
	pub mode: u16,
	pub format: InodeFormat,
	pub uid: u32,
	pub gid: u32,
	pub nlink: u32,
	pub flags: u32,
	pub atime: i64,
	pub mtime: i64,
	pub ctime: i64,
	pub crtime: i64,
	pub size: u64,
	pub n_loc_blk: u32,
	pub fork_off: u16,
	pub changecount: u64,
}

impl Encode for InodeHeader {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.magic.encode(e)?;
		self.ino.encode(e)?;
		self.mode.encode(e)?;
		self.format.as_u8().encode(e)?;
		self.uid.encode(e)?;
		self.gid.encode(e)?;
		self.nlink.encode(e)?;
		self.flags.encode(e)?;
		self.atime.encode(e)?;
		self.mtime.encode(e)?;
		self.ctime.encode(e)?;
		self.crtime.encode(e)?;
		self.size.encode(e)?;
		self.n_loc_blk.encode(e)?;
		self.fork_off.encode(e)?;
		self.changecount.encode(e)
	}
}

impl<C> Decode<C> for InodeHeader {
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		Ok(Self {
			magic: Decode::decode(d)?,
			ino: Decode::decode(d)?,
			mode: Decode::decode(d)?,
			format: InodeFormat::from_u8(Decode::decode(d)?),
			uid: Decode::decode(d)?,
			gid: Decode::decode(d)?,
			nlink: Decode::decode(d)?,
			flags: Decode::decode(d)?,
			atime: Decode::decode(d)?,
			mtime: Decode::decode(d)?,
			ctime: Decode::decode(d)?,
			crtime: Decode::decode(d)?,
			size: Decode::decode(d)?,
			n_loc_blk: Decode::decode(d)?,
			fork_off: Decode::decode(d)?,
			changecount: Decode::decode(d)?,
		})
	}
}

/// One entry of a short-form directory fork: `{ino, namelen, name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSfEntry {
	pub ino: u64,
	pub name: Vec<u8>,
}

impl Encode for DirSfEntry {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		self.ino.encode(e)?;
		(self.name.len() as u8).encode(e)?;
		for &b in &self.name {
			b.encode(e)?;
		}
		Ok(())
	}
}

impl<C> Decode<C> for DirSfEntry {
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		let ino = u64::decode(d)?;
		let namelen = u8::decode(d)? as usize;
		let mut name = Vec::with_capacity(namelen);
		for _ in 0..namelen {
			name.push(u8::decode(d)?);
		}
		Ok(Self { ino, name })
	}
}

/// Short-form directory fork: `{count, parent, entries[count]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSfHdr {
	pub parent: u64,
	pub entries: Vec<DirSfEntry>,
}

impl DirSfHdr {
	pub fn empty(parent: u64) -> Self {
		Self { parent, entries: Vec::new() }
	}
}

impl Encode for DirSfHdr {
	fn encode<E: Encoder>(&self, e: &mut E) -> Result<(), EncodeError> {
		(self.entries.len() as u8).encode(e)?;
		self.parent.encode(e)?;
		for entry in &self.entries {
			entry.encode(e)?;
		}
		Ok(())
	}
}

impl<C> Decode<C> for DirSfHdr {
	fn decode<D: Decoder<Context = C>>(d: &mut D) -> Result<Self, DecodeError> {
		let count = u8::decode(d)? as usize;
		let parent = u64::decode(d)?;
		let mut entries = Vec::with_capacity(count);
		for _ in 0..count {
			entries.push(DirSfEntry::decode(d)?);
		}
		Ok(Self { parent, entries })
	}
}
