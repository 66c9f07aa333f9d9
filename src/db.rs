//! Named sub-database handles, flags, and key ordering.

use std::cmp::Ordering;

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Error, Result};
use crate::meta::{DbInfo, CORE_DBS};

/// Handle to an open (sub-)database. Index into the environment registry;
/// 0 is the freelist tree, 1 the default key space.
pub type Dbi = u32;

bitflags::bitflags! {
    /// Sub-database behavior flags. The low 16 bits persist in the
    /// database descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Compare keys back-to-front.
        const REVERSE_KEY = 0x02;
        /// Allow multiple sorted values per key.
        const DUP_SORT    = 0x04;
        /// Keys are native unsigned integers (4 or 8 bytes).
        const INTEGER_KEY = 0x08;
        /// With DUP_SORT: all values the same size, packed leaves.
        const DUP_FIXED   = 0x10;
        /// With DUP_SORT: values are native unsigned integers.
        const INTEGER_DUP = 0x20;
        /// With DUP_SORT: compare values back-to-front.
        const REVERSE_DUP = 0x40;
        /// Create the named database if it doesn't exist.
        const CREATE      = 0x4_0000;
    }
}

impl DbFlags {
    /// The bits stored on disk.
    pub const PERSISTENT: DbFlags = DbFlags::from_bits_truncate(0xffff);

    pub fn persistent_bits(self) -> u16 {
        (self & Self::PERSISTENT).bits() as u16
    }
}

bitflags::bitflags! {
    /// Per-transaction state of one DB slot.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TxnDbFlags: u8 {
        /// Descriptor changed in this txn; flush it at commit.
        const DIRTY = 0x01;
        /// Named record may have moved; re-resolve before use.
        const STALE = 0x02;
        /// Created in this txn.
        const NEW   = 0x04;
        /// Handle usable in this txn.
        const VALID = 0x08;
    }
}

/// Statistics for one tree, as reported by `stat` utilities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbStat {
    pub page_size: usize,
    pub depth: usize,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
}

impl DbStat {
    pub(crate) fn from_info(psize: usize, info: &DbInfo) -> Self {
        DbStat {
            page_size: psize,
            depth: info.depth as usize,
            branch_pages: info.branch_pages,
            leaf_pages: info.leaf_pages,
            overflow_pages: info.overflow_pages,
            entries: info.entries,
        }
    }
}

/// Key/value ordering function.
pub type Cmp = fn(&[u8], &[u8]) -> Ordering;

/// Plain lexicographic byte order.
pub fn cmp_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Back-to-front lexicographic order.
pub fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    a.iter().rev().cmp(b.iter().rev())
}

/// Host-native unsigned integer order; widths must match the stored
/// width (4 or 8 bytes). Branch pages hand this their empty "less than
/// all" key, which falls through to byte order.
pub fn cmp_int(a: &[u8], b: &[u8]) -> Ordering {
    if a.len() == b.len() {
        match a.len() {
            4 => return NativeEndian::read_u32(a).cmp(&NativeEndian::read_u32(b)),
            8 => return NativeEndian::read_u64(a).cmp(&NativeEndian::read_u64(b)),
            _ => {}
        }
    }
    a.cmp(b)
}

/// Pick the key comparator for a DB.
pub fn key_cmp(flags: DbFlags) -> Cmp {
    if flags.contains(DbFlags::INTEGER_KEY) {
        cmp_int
    } else if flags.contains(DbFlags::REVERSE_KEY) {
        cmp_reverse
    } else {
        cmp_bytes
    }
}

/// Pick the duplicate-value comparator for a DUP_SORT DB.
pub fn data_cmp(flags: DbFlags) -> Cmp {
    if flags.contains(DbFlags::INTEGER_DUP) {
        cmp_int
    } else if flags.contains(DbFlags::REVERSE_DUP) {
        cmp_reverse
    } else {
        cmp_bytes
    }
}

/// Accepted width of an integer key or integer dup value.
pub fn valid_int_size(len: usize) -> bool {
    len == 4 || len == 8
}

/// One registry slot in the environment.
#[derive(Debug, Clone)]
pub(crate) struct DbSlot {
    pub name: Option<String>,
    pub flags: DbFlags,
    pub valid: bool,
}

/// The environment's table of open database handles.
#[derive(Debug)]
pub(crate) struct DbRegistry {
    slots: Vec<DbSlot>,
    max_dbs: usize,
}

impl DbRegistry {
    pub fn new(max_dbs: usize) -> Self {
        let mut slots = Vec::with_capacity(CORE_DBS + max_dbs);
        slots.push(DbSlot {
            name: None,
            flags: DbFlags::INTEGER_KEY,
            valid: true,
        });
        slots.push(DbSlot {
            name: None,
            flags: DbFlags::empty(),
            valid: true,
        });
        Self { slots, max_dbs }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, dbi: Dbi) -> Result<&DbSlot> {
        self.slots
            .get(dbi as usize)
            .filter(|s| s.valid)
            .ok_or(Error::BadDbi)
    }

    pub fn find(&self, name: &str) -> Option<(Dbi, &DbSlot)> {
        self.slots
            .iter()
            .enumerate()
            .find(|(_, s)| s.valid && s.name.as_deref() == Some(name))
            .map(|(i, s)| (i as Dbi, s))
    }

    /// Register a named handle, reusing a closed slot when one exists.
    pub fn claim(&mut self, name: &str, flags: DbFlags) -> Result<Dbi> {
        if let Some((i, _)) = self
            .slots
            .iter()
            .enumerate()
            .skip(CORE_DBS)
            .find(|(_, s)| !s.valid)
        {
            let slot = &mut self.slots[i];
            slot.name = Some(name.to_owned());
            slot.flags = flags;
            slot.valid = true;
            return Ok(i as Dbi);
        }
        if self.slots.len() >= CORE_DBS + self.max_dbs {
            return Err(Error::DbsFull);
        }
        self.slots.push(DbSlot {
            name: Some(name.to_owned()),
            flags,
            valid: true,
        });
        Ok((self.slots.len() - 1) as Dbi)
    }

    pub fn close(&mut self, dbi: Dbi) {
        if let Some(slot) = self.slots.get_mut(dbi as usize) {
            if (dbi as usize) >= CORE_DBS && slot.valid {
                slot.valid = false;
                slot.name = None;
            }
        }
    }
}

/// Check requested open flags against a descriptor loaded from disk.
pub(crate) fn check_open_flags(requested: DbFlags, stored: u16) -> Result<DbFlags> {
    let stored_flags = DbFlags::from_bits_truncate(stored as u32);
    let requested_persist = requested & DbFlags::PERSISTENT;
    if !requested_persist.is_empty() && requested_persist != stored_flags {
        return Err(Error::Incompatible);
    }
    Ok(stored_flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_compare_orders_by_suffix() {
        assert_eq!(cmp_reverse(b"xa", b"yb"), Ordering::Less);
        assert_eq!(cmp_reverse(b"za", b"yb"), Ordering::Less);
        assert_eq!(cmp_reverse(b"az", b"by"), Ordering::Greater);
        assert_eq!(cmp_reverse(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn int_compare_is_numeric_not_lexicographic() {
        let a = 5u64.to_ne_bytes();
        let b = 300u64.to_ne_bytes();
        assert_eq!(cmp_int(&a, &b), Ordering::Less);
        let a = 5u32.to_ne_bytes();
        let b = 300u32.to_ne_bytes();
        assert_eq!(cmp_int(&a, &b), Ordering::Less);
    }

    #[test]
    fn registry_claims_and_reuses_slots() {
        let mut reg = DbRegistry::new(2);
        let a = reg.claim("alpha", DbFlags::DUP_SORT).unwrap();
        let b = reg.claim("beta", DbFlags::empty()).unwrap();
        assert_eq!((a, b), (2, 3));
        assert!(matches!(reg.claim("gamma", DbFlags::empty()), Err(Error::DbsFull)));
        assert_eq!(reg.find("alpha").unwrap().0, 2);
        reg.close(a);
        assert!(reg.slot(a).is_err());
        let c = reg.claim("gamma", DbFlags::empty()).unwrap();
        assert_eq!(c, 2);
    }

    #[test]
    fn open_flag_mismatch_is_incompatible() {
        let stored = DbFlags::DUP_SORT.persistent_bits();
        assert!(check_open_flags(DbFlags::DUP_SORT, stored).is_ok());
        assert!(check_open_flags(DbFlags::empty(), stored).is_ok());
        assert!(matches!(
            check_open_flags(DbFlags::INTEGER_KEY, stored),
            Err(Error::Incompatible)
        ));
    }
}
