//! On-disk page and node layout.
//!
//! A page is a fixed-size byte blob with a 16-byte header and two edges
//! growing toward each other: `lower` walks down as node offset slots are
//! appended, `upper` walks up as node payloads are written. Sub-pages (the
//! miniature leaves embedded in a dup-sort node's value area) reuse the
//! same layout with offsets relative to the sub-page base, so every
//! accessor here reads through [`byteorder`] instead of casting structs;
//! a sub-page is only guaranteed 2-byte alignment.

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Error, Result};
use crate::PageNo;

/// Size of the page header.
pub const PAGEHDRSZ: usize = 16;
/// Size of a node header.
pub const NODESZ: usize = 8;
/// Minimum number of keys a page must be able to hold.
pub const MIN_KEYS: usize = 2;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 256;
/// Largest supported page size. Node offsets are 16-bit.
pub const MAX_PAGE_SIZE: usize = 0x8000;
/// Rebalance when a page's used space falls below this fraction.
pub const FILL_THRESHOLD_PCT: usize = 25;

bitflags::bitflags! {
    /// Page kind and residency bits, stored in the header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const BRANCH   = 0x01;
        const LEAF     = 0x02;
        const OVERFLOW = 0x04;
        const META     = 0x08;
        /// Dirty in the current write transaction. Memory-resident only.
        const DIRTY    = 0x10;
        /// Fixed-size keys packed contiguously, no nodes.
        const LEAF2    = 0x20;
        /// Leaf laid out inside a parent leaf node's value area.
        const SUBP     = 0x40;
        /// Freed in this txn and re-allocatable before commit.
        const LOOSE    = 0x4000;
        /// Spilled; keep until the current operation completes.
        const KEEP     = 0x8000;
    }
}

bitflags::bitflags! {
    /// Per-node bits in a leaf node header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        /// Value is the head page number of an overflow run.
        const BIGDATA = 0x01;
        /// Value is a sub-database descriptor.
        const SUBDATA = 0x02;
        /// Value holds sorted duplicates: a sub-page, or with SUBDATA a
        /// sub-tree descriptor.
        const DUPDATA = 0x04;
    }
}

/// Payload handed to node insertion.
pub enum NodeData<'a> {
    /// Inline value bytes.
    Data(&'a [u8]),
    /// Value of `usize` bytes lives in an overflow run headed at the page.
    Overflow(PageNo, usize),
}

impl NodeData<'_> {
    fn size(&self) -> usize {
        match self {
            NodeData::Data(d) => d.len(),
            NodeData::Overflow(..) => std::mem::size_of::<PageNo>(),
        }
    }

    fn logical_size(&self) -> usize {
        match self {
            NodeData::Data(d) => d.len(),
            NodeData::Overflow(_, dsize) => *dsize,
        }
    }
}

/// Space a leaf node occupies, including its offset slot.
pub fn leaf_size(key: &[u8], data_len: usize) -> usize {
    let sz = NODESZ + key.len() + data_len;
    (sz + 1) & !1
}

/// Space a branch node occupies, including its offset slot.
pub fn branch_size(key: &[u8]) -> usize {
    let sz = NODESZ + key.len();
    (sz + 1) & !1
}

/// Largest node payload that stays inline on a leaf for this page size;
/// anything bigger moves to an overflow run.
pub fn node_max(psize: usize) -> usize {
    ((psize - PAGEHDRSZ) / MIN_KEYS) & !1
}

/// Number of pages an overflow value of `len` bytes needs. Only the head
/// page carries a header; the value then runs contiguously.
pub fn overflow_pages(psize: usize, len: usize) -> usize {
    (len + PAGEHDRSZ - 1) / psize + 1
}

/// Immutable view of a page (or sub-page).
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    data: &'a [u8],
}

/// Mutable view of a page (or sub-page).
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

macro_rules! header_accessors {
    ($t:ident) => {
        impl<'a> $t<'a> {
            #[allow(dead_code)]
            #[inline]
            pub fn pgno(&self) -> PageNo {
                NativeEndian::read_u64(&self.data[0..8])
            }

            #[inline]
            pub fn flags(&self) -> PageFlags {
                PageFlags::from_bits_retain(NativeEndian::read_u16(&self.data[10..12]))
            }

            #[inline]
            pub fn lower(&self) -> usize {
                NativeEndian::read_u16(&self.data[12..14]) as usize
            }

            #[inline]
            pub fn upper(&self) -> usize {
                NativeEndian::read_u16(&self.data[14..16]) as usize
            }

            /// Run length of an overflow page, in pages.
            #[allow(dead_code)]
            #[inline]
            pub fn overflow_count(&self) -> usize {
                NativeEndian::read_u32(&self.data[12..16]) as usize
            }

            #[inline]
            pub fn is_leaf(&self) -> bool {
                self.flags().contains(PageFlags::LEAF)
            }

            #[inline]
            pub fn is_branch(&self) -> bool {
                self.flags().contains(PageFlags::BRANCH)
            }

            #[inline]
            pub fn is_leaf2(&self) -> bool {
                self.flags().contains(PageFlags::LEAF2)
            }

            #[inline]
            pub fn num_keys(&self) -> usize {
                (self.lower() - PAGEHDRSZ) >> 1
            }

            /// Unused bytes between the two edges.
            #[inline]
            pub fn free_size(&self) -> usize {
                self.upper() - self.lower()
            }

            /// Bytes in use, header included.
            #[allow(dead_code)]
            #[inline]
            pub fn used_size(&self) -> usize {
                self.size() - self.free_size()
            }

            /// Total size of this view in bytes.
            #[inline]
            pub fn size(&self) -> usize {
                self.data.len()
            }

            #[inline]
            fn node_offset(&self, i: usize) -> usize {
                NativeEndian::read_u16(&self.data[PAGEHDRSZ + 2 * i..PAGEHDRSZ + 2 * i + 2])
                    as usize
            }
        }
    };
}

header_accessors!(PageRef);
header_accessors!(PageMut);

impl<'a> PageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        debug_assert!(data.len() >= PAGEHDRSZ);
        Self { data }
    }

    /// Typed view of node `i`.
    pub fn node(&self, i: usize) -> Result<NodeRef<'a>> {
        if i >= self.num_keys() {
            return Err(Error::Corrupted);
        }
        let off = self.node_offset(i);
        if off + NODESZ > self.data.len() {
            return Err(Error::Corrupted);
        }
        Ok(NodeRef {
            data: self.data,
            off,
        })
    }

    /// Key `i` of a fixed-size-key leaf.
    pub fn leaf2_key(&self, i: usize, ksize: usize) -> Result<&'a [u8]> {
        let start = PAGEHDRSZ + i * ksize;
        self.data.get(start..start + ksize).ok_or(Error::Corrupted)
    }

    /// Offset and length of leaf node `i`'s value region within this
    /// view.
    pub fn node_data_region(&self, i: usize) -> Result<(usize, usize)> {
        let node = self.node(i)?;
        let off = node.off + NODESZ + node.ksize();
        Ok((off, node.data_size()))
    }

    /// Body of an overflow run: the value bytes start right after the head
    /// page's header.
    pub fn overflow_data(&self, len: usize) -> Result<&'a [u8]> {
        self.data
            .get(PAGEHDRSZ..PAGEHDRSZ + len)
            .ok_or(Error::Corrupted)
    }
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        debug_assert!(data.len() >= PAGEHDRSZ);
        Self { data }
    }

    pub fn as_ref(&self) -> PageRef<'_> {
        PageRef { data: self.data }
    }

    /// Stamp a fresh header. `upper` starts at the view size.
    pub fn init(&mut self, pgno: PageNo, flags: PageFlags) {
        let size = self.data.len();
        debug_assert!(size <= MAX_PAGE_SIZE);
        NativeEndian::write_u64(&mut self.data[0..8], pgno);
        NativeEndian::write_u16(&mut self.data[8..10], 0);
        NativeEndian::write_u16(&mut self.data[10..12], flags.bits());
        NativeEndian::write_u16(&mut self.data[12..14], PAGEHDRSZ as u16);
        NativeEndian::write_u16(&mut self.data[14..16], size as u16);
    }

    pub fn set_pgno(&mut self, pgno: PageNo) {
        NativeEndian::write_u64(&mut self.data[0..8], pgno);
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        NativeEndian::write_u16(&mut self.data[10..12], flags.bits());
    }

    pub fn set_lower(&mut self, lower: usize) {
        NativeEndian::write_u16(&mut self.data[12..14], lower as u16);
    }

    pub fn set_upper(&mut self, upper: usize) {
        NativeEndian::write_u16(&mut self.data[14..16], upper as u16);
    }

    pub fn set_overflow_count(&mut self, pages: usize) {
        NativeEndian::write_u32(&mut self.data[12..16], pages as u32);
    }

    fn set_node_offset(&mut self, i: usize, off: usize) {
        NativeEndian::write_u16(
            &mut self.data[PAGEHDRSZ + 2 * i..PAGEHDRSZ + 2 * i + 2],
            off as u16,
        );
    }

    /// Mutable value area of leaf node `i`.
    pub fn node_data_mut(&mut self, i: usize) -> Result<&mut [u8]> {
        let node = self.as_ref().node(i)?;
        let off = node.off;
        let ksize = node.ksize();
        let dsize = node.data_size();
        let start = off + NODESZ + ksize;
        self.data
            .get_mut(start..start + dsize)
            .ok_or(Error::Corrupted)
    }

    /// Overwrite the child pointer of branch node `i`.
    pub fn set_child(&mut self, i: usize, pgno: PageNo) -> Result<()> {
        let off = self.as_ref().node(i)?.off;
        NativeEndian::write_u16(&mut self.data[off..off + 2], (pgno & 0xffff) as u16);
        NativeEndian::write_u16(
            &mut self.data[off + 2..off + 4],
            ((pgno >> 16) & 0xffff) as u16,
        );
        NativeEndian::write_u16(
            &mut self.data[off + 4..off + 6],
            ((pgno >> 32) & 0xffff) as u16,
        );
        Ok(())
    }

    /// Overwrite the flags of leaf node `i`.
    pub fn set_node_flags(&mut self, i: usize, flags: NodeFlags) -> Result<()> {
        let off = self.as_ref().node(i)?.off;
        NativeEndian::write_u16(&mut self.data[off + 4..off + 6], flags.bits());
        Ok(())
    }

    /// Overwrite the stored value size of leaf node `i`; used when a
    /// value is rewritten in place (same inline room, or the same
    /// overflow run).
    pub fn set_node_data_size(&mut self, i: usize, len: usize) -> Result<()> {
        let off = self.as_ref().node(i)?.off;
        NativeEndian::write_u16(&mut self.data[off..off + 2], (len & 0xffff) as u16);
        NativeEndian::write_u16(&mut self.data[off + 2..off + 4], (len >> 16) as u16);
        Ok(())
    }

    /// Insert a node at index `i`, shifting later offset slots right.
    ///
    /// For a branch node pass the child page number; for a leaf pass the
    /// value payload. Fails with [`Error::PageFull`] when the two edges
    /// would collide - the caller splits and retries.
    pub fn insert_node(
        &mut self,
        i: usize,
        key: &[u8],
        data: Option<NodeData<'_>>,
        child: Option<PageNo>,
        flags: NodeFlags,
    ) -> Result<()> {
        let num = self.num_keys();
        debug_assert!(i <= num);
        let node_sz = match (&data, child) {
            (Some(d), None) => leaf_size(key, d.size()),
            (None, Some(_)) => branch_size(key),
            _ => return Err(Error::InvalidArg),
        };
        // The offset slot itself costs 2 more bytes.
        if node_sz + 2 > self.free_size() {
            return Err(Error::PageFull);
        }

        let upper = self.upper();
        let lower = self.lower();
        let new_off = upper - node_sz;

        // Shift offset slots after i.
        let mut j = num;
        while j > i {
            let off = self.node_offset(j - 1);
            self.set_node_offset(j, off);
            j -= 1;
        }
        self.set_node_offset(i, new_off);
        self.set_lower(lower + 2);
        self.set_upper(new_off);

        // Node header.
        match child {
            Some(pgno) => {
                NativeEndian::write_u16(&mut self.data[new_off..], (pgno & 0xffff) as u16);
                NativeEndian::write_u16(&mut self.data[new_off + 2..], ((pgno >> 16) & 0xffff) as u16);
                NativeEndian::write_u16(&mut self.data[new_off + 4..], ((pgno >> 32) & 0xffff) as u16);
            }
            None => {
                let data = data.as_ref().unwrap();
                let logical = data.logical_size();
                NativeEndian::write_u16(&mut self.data[new_off..], (logical & 0xffff) as u16);
                NativeEndian::write_u16(&mut self.data[new_off + 2..], (logical >> 16) as u16);
                let mut f = flags;
                if matches!(data, NodeData::Overflow(..)) {
                    f |= NodeFlags::BIGDATA;
                }
                NativeEndian::write_u16(&mut self.data[new_off + 4..], f.bits());
            }
        }
        NativeEndian::write_u16(&mut self.data[new_off + 6..], key.len() as u16);

        // Key, then payload.
        let key_at = new_off + NODESZ;
        self.data[key_at..key_at + key.len()].copy_from_slice(key);
        if let Some(data) = data {
            let data_at = key_at + key.len();
            match data {
                NodeData::Data(d) => self.data[data_at..data_at + d.len()].copy_from_slice(d),
                NodeData::Overflow(pgno, _) => {
                    NativeEndian::write_u64(&mut self.data[data_at..data_at + 8], pgno)
                }
            }
        }
        Ok(())
    }

    /// Remove node `i`, compacting the payload area.
    pub fn delete_node(&mut self, i: usize) -> Result<()> {
        let num = self.num_keys();
        if i >= num {
            return Err(Error::Corrupted);
        }
        let (off, sz) = {
            let node = self.as_ref().node(i)?;
            (node.off, node.page_size())
        };

        // Every node stored below the deleted one slides up by its size.
        for j in 0..num {
            if j == i {
                continue;
            }
            let o = self.node_offset(j);
            let dst = j - (j > i) as usize;
            self.set_node_offset(dst, if o < off { o + sz } else { o });
        }
        let upper = self.upper();
        self.data.copy_within(upper..off, upper + sz);
        self.set_lower(self.lower() - 2);
        self.set_upper(upper + sz);
        Ok(())
    }

    /// Remove key `i` of a fixed-size-key leaf.
    pub fn leaf2_delete(&mut self, i: usize, ksize: usize) -> Result<()> {
        let num = self.num_keys();
        if i >= num {
            return Err(Error::Corrupted);
        }
        let start = PAGEHDRSZ + i * ksize;
        let end = PAGEHDRSZ + num * ksize;
        self.data.copy_within(start + ksize..end, start);
        self.set_lower(self.lower() - 2);
        let upper = self.upper() as isize + ksize as isize - 2;
        self.set_upper(upper as usize);
        Ok(())
    }

    /// Insert a key at index `i` of a fixed-size-key leaf. A LEAF2 page has
    /// no offset slots; the slot area doubles as key storage, so a key
    /// costs exactly `ksize` bytes of free space.
    pub fn leaf2_insert(&mut self, i: usize, key: &[u8]) -> Result<()> {
        let ksize = key.len();
        if self.free_size() < ksize {
            return Err(Error::PageFull);
        }
        let num = self.num_keys();
        debug_assert!(i <= num);
        let start = PAGEHDRSZ + i * ksize;
        let end = PAGEHDRSZ + num * ksize;
        self.data.copy_within(start..end, start + ksize);
        self.data[start..start + ksize].copy_from_slice(key);
        self.set_lower(self.lower() + 2);
        let upper = self.upper() as isize - (ksize as isize - 2);
        self.set_upper(upper as usize);
        Ok(())
    }

    /// Replace the key of node `i` with one of identical length.
    pub fn replace_key_same_len(&mut self, i: usize, key: &[u8]) -> Result<()> {
        let (ksize, off) = {
            let node = self.as_ref().node(i)?;
            (node.ksize(), node.off)
        };
        if ksize != key.len() {
            return Err(Error::InvalidArg);
        }
        let at = off + NODESZ;
        self.data[at..at + key.len()].copy_from_slice(key);
        Ok(())
    }

    /// Wipe the node area, keeping the header identity.
    pub fn truncate(&mut self) {
        let size = self.data.len();
        self.set_lower(PAGEHDRSZ);
        self.set_upper(size);
    }

    /// Whole view as raw bytes.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.data
    }
}

/// View of a single node inside a page.
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> NodeRef<'a> {
    #[inline]
    fn lo(&self) -> usize {
        NativeEndian::read_u16(&self.data[self.off..self.off + 2]) as usize
    }

    #[inline]
    fn hi(&self) -> usize {
        NativeEndian::read_u16(&self.data[self.off + 2..self.off + 4]) as usize
    }

    #[inline]
    pub fn raw_flags(&self) -> u16 {
        NativeEndian::read_u16(&self.data[self.off + 4..self.off + 6])
    }

    #[inline]
    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_retain(self.raw_flags())
    }

    #[inline]
    pub fn ksize(&self) -> usize {
        NativeEndian::read_u16(&self.data[self.off + 6..self.off + 8]) as usize
    }

    pub fn key(&self) -> &'a [u8] {
        &self.data[self.off + NODESZ..self.off + NODESZ + self.ksize()]
    }

    /// Value size of a leaf node. For BIGDATA this is the overflow value's
    /// logical size, not the 8 bytes stored inline.
    #[inline]
    pub fn data_size(&self) -> usize {
        if self.flags().contains(NodeFlags::BIGDATA) {
            std::mem::size_of::<PageNo>()
        } else {
            self.logical_data_size()
        }
    }

    /// Stored size field: for BIGDATA, the overflow value's byte length.
    #[inline]
    pub fn logical_data_size(&self) -> usize {
        self.lo() | (self.hi() << 16)
    }

    /// Child page of a branch node (48-bit).
    #[inline]
    pub fn child_pgno(&self) -> PageNo {
        (self.lo() as PageNo)
            | ((self.hi() as PageNo) << 16)
            | ((self.raw_flags() as PageNo) << 32)
    }

    /// Inline value bytes of a leaf node.
    pub fn data(&self) -> Result<&'a [u8]> {
        let start = self.off + NODESZ + self.ksize();
        self.data
            .get(start..start + self.data_size())
            .ok_or(Error::Corrupted)
    }

    /// Head page number of a BIGDATA node's overflow run.
    pub fn overflow_pgno(&self) -> Result<PageNo> {
        let d = self.data()?;
        Ok(NativeEndian::read_u64(&d[0..8]))
    }

    /// Bytes this node occupies in the page, offset slot excluded.
    pub fn page_size(&self) -> usize {
        let sz = NODESZ + self.ksize() + self.data_size();
        (sz + 1) & !1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_leaf(buf: &mut [u8]) -> PageMut<'_> {
        let mut p = PageMut::new(buf);
        p.init(7, PageFlags::LEAF);
        p
    }

    #[test]
    fn header_round_trip() {
        let mut buf = vec![0u8; 4096];
        let p = fresh_leaf(&mut buf);
        assert_eq!(p.pgno(), 7);
        assert!(p.is_leaf());
        assert_eq!(p.num_keys(), 0);
        assert_eq!(p.free_size(), 4096 - PAGEHDRSZ);
    }

    #[test]
    fn insert_and_read_leaf_nodes() {
        let mut buf = vec![0u8; 4096];
        let mut p = fresh_leaf(&mut buf);
        p.insert_node(0, b"banana", Some(NodeData::Data(b"yellow")), None, NodeFlags::empty())
            .unwrap();
        p.insert_node(0, b"apple", Some(NodeData::Data(b"red")), None, NodeFlags::empty())
            .unwrap();
        p.insert_node(2, b"cherry", Some(NodeData::Data(b"dark")), None, NodeFlags::empty())
            .unwrap();
        assert_eq!(p.num_keys(), 3);
        let r = p.as_ref();
        assert_eq!(r.node(0).unwrap().key(), b"apple");
        assert_eq!(r.node(0).unwrap().data().unwrap(), b"red");
        assert_eq!(r.node(1).unwrap().key(), b"banana");
        assert_eq!(r.node(2).unwrap().key(), b"cherry");
        assert_eq!(r.node(2).unwrap().data().unwrap(), b"dark");
    }

    #[test]
    fn delete_compacts_payload_area() {
        let mut buf = vec![0u8; 4096];
        let mut p = fresh_leaf(&mut buf);
        for (i, (k, v)) in [("a", "1"), ("b", "22"), ("c", "333")].iter().enumerate() {
            p.insert_node(i, k.as_bytes(), Some(NodeData::Data(v.as_bytes())), None, NodeFlags::empty())
                .unwrap();
        }
        let free_before = p.free_size();
        p.delete_node(1).unwrap();
        assert_eq!(p.num_keys(), 2);
        assert_eq!(p.as_ref().node(0).unwrap().key(), b"a");
        assert_eq!(p.as_ref().node(1).unwrap().key(), b"c");
        assert_eq!(p.as_ref().node(1).unwrap().data().unwrap(), b"333");
        assert_eq!(p.free_size(), free_before + leaf_size(b"b", 2) + 2);
    }

    #[test]
    fn branch_child_pointers() {
        let mut buf = vec![0u8; 4096];
        let mut p = PageMut::new(&mut buf);
        p.init(3, PageFlags::BRANCH);
        p.insert_node(0, b"", None, Some(42), NodeFlags::empty()).unwrap();
        p.insert_node(1, b"m", None, Some(0x1_0000_2345), NodeFlags::empty())
            .unwrap();
        assert_eq!(p.as_ref().node(0).unwrap().child_pgno(), 42);
        assert_eq!(p.as_ref().node(1).unwrap().child_pgno(), 0x1_0000_2345);
        p.set_child(0, 99).unwrap();
        assert_eq!(p.as_ref().node(0).unwrap().child_pgno(), 99);
    }

    #[test]
    fn page_full_reported() {
        let mut buf = vec![0u8; 256];
        let mut p = fresh_leaf(&mut buf);
        let big = vec![0xAAu8; 300];
        assert!(matches!(
            p.insert_node(0, b"k", Some(NodeData::Data(&big)), None, NodeFlags::empty()),
            Err(Error::PageFull)
        ));
    }

    #[test]
    fn leaf2_pack_and_delete() {
        let mut buf = vec![0u8; 4096];
        let mut p = PageMut::new(&mut buf);
        p.init(9, PageFlags::LEAF | PageFlags::LEAF2);
        p.leaf2_insert(0, b"bbbb").unwrap();
        p.leaf2_insert(0, b"aaaa").unwrap();
        p.leaf2_insert(2, b"cccc").unwrap();
        assert_eq!(p.num_keys(), 3);
        assert_eq!(p.as_ref().leaf2_key(1, 4).unwrap(), b"bbbb");
        p.leaf2_delete(1, 4).unwrap();
        assert_eq!(p.num_keys(), 2);
        assert_eq!(p.as_ref().leaf2_key(1, 4).unwrap(), b"cccc");
    }

    #[test]
    fn overflow_node_sizes() {
        // A node bigger than node_max must go to overflow; the inline part
        // is just the 8-byte head page number.
        let psize = 4096;
        assert!(node_max(psize) < 2100);
        let mut buf = vec![0u8; psize];
        let mut p = fresh_leaf(&mut buf);
        p.insert_node(0, b"big", Some(NodeData::Overflow(77, 200_000)), None, NodeFlags::empty())
            .unwrap();
        let r = p.as_ref();
        let n = r.node(0).unwrap();
        assert!(n.flags().contains(NodeFlags::BIGDATA));
        assert_eq!(n.logical_data_size(), 200_000);
        assert_eq!(n.overflow_pgno().unwrap(), 77);
        assert_eq!(overflow_pages(psize, 200 * 1024), 51);
    }
}
