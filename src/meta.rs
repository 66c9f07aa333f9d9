//! Meta pages and named-database descriptors.
//!
//! Pages 0 and 1 each hold a copy of [`Meta`] right after the page header.
//! A commit rewrites the copy belonging to `txnid % 2`, so the two pages
//! always differ by at most one committed transaction and a torn write
//! leaves the other copy intact.

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::page::{PageFlags, PageMut, PAGEHDRSZ};
use crate::{PageNo, TxnId, P_INVALID};

/// Format identifier; also catches byte-order mismatches.
pub const MAGIC: u32 = 0xBEEF_C0DE;
/// On-disk format version.
pub const VERSION: u32 = 1;
/// Number of meta pages at the head of the file.
pub const NUM_METAS: usize = 2;

/// Built-in handle of the freelist tree.
pub const FREE_DBI: usize = 0;
/// Built-in handle of the default key space.
pub const MAIN_DBI: usize = 1;
/// Handles below this are built-in.
pub const CORE_DBS: usize = 2;

/// Per-tree descriptor: the two built-in slots live in the meta page,
/// named sub-databases store theirs as a record value in the main tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DbInfo {
    /// Key size for fixed-size-key leaves, else 0.
    pub key_size: u32,
    /// Persistent `DbFlags` bits.
    pub flags: u16,
    /// Tree depth; 0 when empty.
    pub depth: u16,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
    /// Root page, or `P_INVALID` when the tree is empty.
    pub root: PageNo,
}

impl DbInfo {
    pub fn new(flags: u16) -> Self {
        Self {
            key_size: 0,
            flags,
            depth: 0,
            branch_pages: 0,
            leaf_pages: 0,
            overflow_pages: 0,
            entries: 0,
            root: P_INVALID,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == P_INVALID
    }

    /// Decode from a record value; node data is only 2-aligned.
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != std::mem::size_of::<DbInfo>() {
            return Err(Error::Corrupted);
        }
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    pub fn write(&self) -> [u8; std::mem::size_of::<DbInfo>()] {
        let mut out = [0u8; std::mem::size_of::<DbInfo>()];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }
}

/// The meta block proper, stored at offset [`PAGEHDRSZ`] of pages 0 and 1.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Meta {
    pub magic: u32,
    pub version: u32,
    /// Address the map was created at, for fixed-map mode. 0 otherwise.
    pub map_addr: u64,
    pub map_size: u64,
    /// `[FREE_DBI]` is the freelist tree, `[MAIN_DBI]` the default tree.
    pub dbs: [DbInfo; CORE_DBS],
    /// Highest page number in use.
    pub last_pgno: PageNo,
    pub txnid: TxnId,
}

pub const META_SIZE: usize = std::mem::size_of::<Meta>();

impl Meta {
    /// A fresh environment's meta: both built-in trees empty, the two meta
    /// pages the only ones allocated.
    pub fn new_env(psize: usize, map_size: u64) -> Self {
        let mut dbs = [DbInfo::new(0); CORE_DBS];
        // The freelist tree uses integer keys, and its key_size field
        // doubles as the environment page size.
        dbs[FREE_DBI].flags = crate::db::DbFlags::INTEGER_KEY.bits() as u16;
        dbs[FREE_DBI].key_size = psize as u32;
        Meta {
            magic: MAGIC,
            version: VERSION,
            map_addr: 0,
            map_size,
            dbs,
            last_pgno: (NUM_METAS - 1) as PageNo,
            txnid: 0,
        }
    }

    /// Page size the environment was created with.
    #[inline]
    pub fn psize(&self) -> usize {
        self.dbs[FREE_DBI].key_size as usize
    }

    /// Parse and validate the meta block of one meta page.
    pub fn read(page: &[u8]) -> Result<Self> {
        let bytes = page
            .get(PAGEHDRSZ..PAGEHDRSZ + META_SIZE)
            .ok_or(Error::Invalid)?;
        let meta: Meta = bytemuck::pod_read_unaligned(bytes);
        if meta.magic != MAGIC {
            return Err(Error::Invalid);
        }
        if meta.version != VERSION {
            return Err(Error::VersionMismatch);
        }
        Ok(meta)
    }

    /// Serialize into a meta page buffer, stamping the page header too.
    pub fn write_page(&self, page: &mut [u8], which: usize) {
        let mut p = PageMut::new(page);
        p.init(which as PageNo, PageFlags::META);
        page[PAGEHDRSZ..PAGEHDRSZ + META_SIZE].copy_from_slice(bytemuck::bytes_of(self));
    }

    /// Which meta page a commit of this txnid must overwrite.
    #[inline]
    pub fn toggle(txnid: TxnId) -> usize {
        (txnid & 1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<DbInfo>(), 48);
        assert_eq!(META_SIZE, 136);
    }

    #[test]
    fn meta_round_trip_and_validation() {
        let mut page = vec![0u8; 4096];
        let mut meta = Meta::new_env(4096, 1 << 20);
        meta.txnid = 5;
        meta.last_pgno = 17;
        meta.write_page(&mut page, 1);

        let back = Meta::read(&page).unwrap();
        assert_eq!(back.txnid, 5);
        assert_eq!(back.last_pgno, 17);
        assert_eq!(back.dbs[MAIN_DBI].root, P_INVALID);

        // Breaking the magic makes it invalid, not merely stale.
        page[PAGEHDRSZ] ^= 0xFF;
        assert!(matches!(Meta::read(&page), Err(Error::Invalid)));
    }

    #[test]
    fn version_mismatch_detected() {
        let mut page = vec![0u8; 4096];
        let mut meta = Meta::new_env(4096, 1 << 20);
        meta.version = VERSION + 1;
        meta.write_page(&mut page, 0);
        assert!(matches!(Meta::read(&page), Err(Error::VersionMismatch)));
    }

    #[test]
    fn toggle_alternates() {
        assert_eq!(Meta::toggle(1), 1);
        assert_eq!(Meta::toggle(2), 0);
        assert_eq!(Meta::toggle(3), 1);
    }

    #[test]
    fn dbinfo_record_round_trip() {
        let mut info = DbInfo::new(0x0004);
        info.root = 99;
        info.entries = 12;
        info.depth = 2;
        let bytes = info.write();
        // Descriptors ride inside node values, which are 2-aligned at
        // best, so decoding must tolerate that.
        let mut shifted = vec![0u8; bytes.len() + 2];
        shifted[2..].copy_from_slice(&bytes);
        assert_eq!(DbInfo::read(&shifted[2..]).unwrap(), info);
    }
}
