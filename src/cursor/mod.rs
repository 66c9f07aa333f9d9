//! Cursors: stateful positions inside one tree.
//!
//! A cursor is a stack of `(page number, index)` frames from the root to
//! the current node, plus an optional sub-cursor when the database holds
//! sorted duplicates. Frames store page numbers, not pointers; every
//! access re-resolves through the transaction, which serves pages from
//! the dirty list, the spill set, or the map as appropriate.
//!
//! Cursors opened on a write transaction register in a tracking list so
//! that splits, merges, and deletes can patch every open cursor's frames
//! in one place.

mod read;
mod write;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::db::{data_cmp, key_cmp, Cmp, DbFlags, Dbi, TxnDbFlags};
use crate::error::{Error, Result};
use crate::meta::{DbInfo, CORE_DBS, MAIN_DBI};
use crate::page::{NodeFlags, PageFlags, PageRef};
use crate::txn::{ReadTxn, TxnRead, WriteTxn};
use crate::{PageNo, P_INVALID};

pub(crate) use read::{seek_range_owned, txn_get};
pub(crate) use write::flush_named_dbs;

/// Deepest tree a cursor can track.
pub const CURSOR_STACK: usize = 32;

/// The empty value returned for keys of fixed-size-key leaves.
pub(crate) const NO_DATA: &[u8] = &[];

static CURSOR_IDS: AtomicU64 = AtomicU64::new(1);

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub(crate) struct CursorFlags: u16 {
        /// Has a valid position.
        const INITIALIZED = 0x01;
        /// Ran off the end of the tree.
        const EOF         = 0x02;
        /// Last operation was a delete; the current slot already holds
        /// the following entry.
        const DEL         = 0x04;
    }
}

bitflags::bitflags! {
    /// Behavior flags for put operations.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` instead of overwriting.
        const NO_OVERWRITE = 0x10;
        /// Dup-sort: fail with `KeyExist` if this exact pair exists.
        const NO_DUP_DATA  = 0x20;
        /// Replace the value at the cursor's current position.
        const CURRENT      = 0x40;
        /// Allocate space, let the caller fill it. Not for dup-sort:
        /// duplicate values are ordered by content, which a later fill
        /// would invalidate. With `NO_MEM_INIT` the reserved bytes may
        /// hold stale page content until written.
        const RESERVE      = 0x1_0000;
        /// Keys arrive in order; append without searching.
        const APPEND       = 0x2_0000;
        /// Dup values arrive in order; append within the dup set.
        const APPEND_DUP   = 0x4_0000;
        /// Bulk-load several fixed-size dup values at once.
        const MULTIPLE     = 0x8_0000;
    }
}

/// Position within one key's duplicate set.
#[derive(Clone, Debug)]
pub(crate) enum DupPos {
    /// Duplicates live in a sub-page inside the parent leaf node.
    Page { ki: usize },
    /// Duplicates live in their own sub-tree.
    Tree(Box<CursorInner>),
}

/// Sub-cursor state for dup-sort traversal.
#[derive(Clone, Debug)]
pub(crate) struct SubCursor {
    pub pos: DupPos,
    /// Descriptor of the dup container. Synthetic for sub-pages.
    pub db: DbInfo,
    pub active: bool,
}

/// The raw cursor state. Public cursors wrap this in `Rc<RefCell>` so the
/// write path can patch every open cursor after a structural change.
#[derive(Clone, Debug)]
pub(crate) struct CursorInner {
    pub cursor_id: u64,
    pub dbi: Dbi,
    /// Serial of the owning txn; ops on a different txn are rejected.
    pub serial: u64,
    /// Number of valid frames; the leaf frame is `snum - 1`.
    pub snum: usize,
    pub pg: [PageNo; CURSOR_STACK],
    pub ki: [u16; CURSOR_STACK],
    pub flags: CursorFlags,
    pub sub: Option<Box<SubCursor>>,
}

impl CursorInner {
    pub(crate) fn new(dbi: Dbi, serial: u64, dupsort: bool) -> Self {
        CursorInner {
            cursor_id: CURSOR_IDS.fetch_add(1, Ordering::Relaxed),
            dbi,
            serial,
            snum: 0,
            pg: [P_INVALID; CURSOR_STACK],
            ki: [0; CURSOR_STACK],
            flags: CursorFlags::empty(),
            sub: if dupsort {
                Some(Box::new(SubCursor {
                    pos: DupPos::Page { ki: 0 },
                    db: DbInfo::new(0),
                    active: false,
                }))
            } else {
                None
            },
        }
    }

    #[inline]
    pub(crate) fn leaf_pg(&self) -> PageNo {
        self.pg[self.snum - 1]
    }

    #[inline]
    pub(crate) fn leaf_ki(&self) -> usize {
        self.ki[self.snum - 1] as usize
    }

    pub(crate) fn clear_pos(&mut self) {
        self.snum = 0;
        self.flags = CursorFlags::empty();
        if let Some(sub) = &mut self.sub {
            sub.active = false;
        }
    }

    pub(crate) fn initialized(&self) -> bool {
        self.flags.contains(CursorFlags::INITIALIZED)
    }

    /// Every page number this cursor (and its sub-cursor) references.
    pub(crate) fn collect_pages(&self, out: &mut Vec<PageNo>) {
        out.extend_from_slice(&self.pg[..self.snum]);
        if let Some(sub) = &self.sub {
            if let DupPos::Tree(t) = &sub.pos {
                out.extend_from_slice(&t.pg[..t.snum]);
            }
        }
    }
}

/// A cursor over one database within a transaction.
///
/// Operations take the transaction explicitly: read operators borrow it
/// shared, mutators need the write transaction exclusively. A cursor is
/// only valid with the transaction it was opened on.
pub struct Cursor {
    pub(crate) inner: Rc<RefCell<CursorInner>>,
    pub(crate) dbi: Dbi,
}

impl Cursor {
    /// Open without registering in the txn tracker; read-only txns have
    /// no structural changes to track.
    pub(crate) fn new_untracked<T: TxnRead>(txn: &T, dbi: Dbi) -> Result<Cursor> {
        let (_, flags, state) = txn.db_snapshot(dbi)?;
        if !state.contains(TxnDbFlags::VALID) {
            return Err(Error::BadDbi);
        }
        let inner = CursorInner::new(dbi, txn.serial(), flags.contains(DbFlags::DUP_SORT));
        Ok(Cursor {
            inner: Rc::new(RefCell::new(inner)),
            dbi,
        })
    }

    pub(crate) fn new_tracked(txn: &mut WriteTxn<'_>, dbi: Dbi) -> Result<Cursor> {
        let c = Self::new_untracked(txn, dbi)?;
        txn.track_cursor(&c.inner);
        Ok(c)
    }

    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    /// Re-bind to `txn` after a reset/renew cycle, dropping any position.
    pub fn renew<T: TxnRead>(&mut self, txn: &T) -> Result<()> {
        let (_, _, state) = txn.db_snapshot(self.dbi)?;
        if !state.contains(TxnDbFlags::VALID) {
            return Err(Error::BadDbi);
        }
        let mut inner = self.inner.borrow_mut();
        inner.serial = txn.serial();
        inner.clear_pos();
        Ok(())
    }
}

/// Comparators and layout facts for one tree, fetched per operation so
/// cursors always see the txn's current descriptor.
#[derive(Clone, Copy)]
pub(crate) struct TreeCtx {
    pub root: PageNo,
    pub cmp: Cmp,
    pub dcmp: Cmp,
    pub flags: DbFlags,
    /// Fixed key size for LEAF2 trees, else 0.
    pub leaf2_ksize: usize,
    pub depth: usize,
}

pub(crate) fn tree_ctx<T: TxnRead>(txn: &T, dbi: Dbi) -> Result<TreeCtx> {
    let (info, flags, state) = txn.db_snapshot(dbi)?;
    if !state.contains(TxnDbFlags::VALID) {
        return Err(Error::BadDbi);
    }
    Ok(TreeCtx {
        root: info.root,
        cmp: key_cmp(flags),
        dcmp: data_cmp(flags),
        flags,
        leaf2_ksize: info.key_size as usize,
        depth: info.depth as usize,
    })
}

/// Context for a dup sub-tree: dup values are the keys, data is empty.
pub(crate) fn sub_tree_ctx(parent_flags: DbFlags, sub: &SubCursor) -> TreeCtx {
    TreeCtx {
        root: sub.db.root,
        cmp: data_cmp(parent_flags),
        dcmp: data_cmp(parent_flags),
        flags: parent_flags,
        leaf2_ksize: sub.db.key_size as usize,
        depth: sub.db.depth as usize,
    }
}

/// Check that a node is usable as a named-database record.
pub(crate) fn node_is_subdb(node_flags: NodeFlags) -> bool {
    node_flags.contains(NodeFlags::SUBDATA) && !node_flags.contains(NodeFlags::DUPDATA)
}

/// Resolve the stale named-DB descriptors a fresh txn snapshot carries.
/// Runs once per txn; afterwards cursor operations never mutate the
/// descriptor table behind the txn's back.
pub(crate) fn resolve_stale_read(txn: &mut ReadTxn) -> Result<()> {
    let names: Vec<(Dbi, Option<String>)> = {
        let reg = txn.env.inner.dbs.read().unwrap();
        (CORE_DBS..txn.dbs.len())
            .map(|i| {
                (
                    i as Dbi,
                    reg.slot(i as Dbi).ok().and_then(|s| s.name.clone()),
                )
            })
            .collect()
    };
    for (dbi, name) in names {
        let d = &txn.dbs[dbi as usize];
        if !d.state.contains(TxnDbFlags::STALE) || !d.state.contains(TxnDbFlags::VALID) {
            continue;
        }
        let Some(name) = name else {
            txn.dbs[dbi as usize].state = TxnDbFlags::empty();
            continue;
        };
        match read::find_named_db(txn, &name)? {
            Some(info) => {
                let d = &mut txn.dbs[dbi as usize];
                d.info = info;
                d.state = TxnDbFlags::VALID;
            }
            None => {
                txn.dbs[dbi as usize].state = TxnDbFlags::empty();
            }
        }
    }
    Ok(())
}

/// Same as [`resolve_stale_read`] for the write transaction.
pub(crate) fn resolve_stale_write(txn: &mut WriteTxn<'_>) -> Result<()> {
    let names: Vec<(Dbi, Option<String>)> = {
        let reg = txn.env.inner.dbs.read().unwrap();
        (CORE_DBS..txn.top().dbs.len())
            .map(|i| {
                (
                    i as Dbi,
                    reg.slot(i as Dbi).ok().and_then(|s| s.name.clone()),
                )
            })
            .collect()
    };
    for (dbi, name) in names {
        let d = &txn.top().dbs[dbi as usize];
        if !d.state.contains(TxnDbFlags::STALE) || !d.state.contains(TxnDbFlags::VALID) {
            continue;
        }
        let Some(name) = name else {
            txn.top_mut().dbs[dbi as usize].state = TxnDbFlags::empty();
            continue;
        };
        match read::find_named_db(txn, &name)? {
            Some(info) => {
                let d = &mut txn.top_mut().dbs[dbi as usize];
                d.info = info;
                d.state = TxnDbFlags::VALID;
            }
            None => {
                txn.top_mut().dbs[dbi as usize].state = TxnDbFlags::empty();
            }
        }
    }
    Ok(())
}

/// Open a named database from a read transaction (no creation).
pub(crate) fn open_db_read(txn: &mut ReadTxn, name: Option<&str>) -> Result<Dbi> {
    let Some(name) = name else {
        return Ok(MAIN_DBI as Dbi);
    };
    if name.len() > crate::MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    // Already registered: hand the existing slot out.
    let existing = {
        let reg = txn.env.inner.dbs.read().unwrap();
        reg.find(name).map(|(dbi, slot)| (dbi, slot.flags))
    };
    if let Some((dbi, flags)) = existing {
        if (dbi as usize) < txn.dbs.len() {
            let d = &txn.dbs[dbi as usize];
            if d.state.contains(TxnDbFlags::VALID) {
                return Ok(dbi);
            }
            return Err(Error::BadDbi);
        }
        // Registered after this txn began; resolve against our snapshot.
        let info = read::find_named_db(txn, name)?.ok_or(Error::NotFound)?;
        grow_read_txn_dbs(txn, dbi, info, flags);
        return Ok(dbi);
    }
    // Not registered anywhere: find it in this snapshot and claim a slot.
    let info = read::find_named_db(txn, name)?.ok_or(Error::NotFound)?;
    let stored = crate::db::check_open_flags(DbFlags::empty(), info.flags)?;
    let dbi = {
        let mut reg = txn.env.inner.dbs.write().unwrap();
        match reg.find(name) {
            Some((dbi, _)) => dbi,
            None => reg.claim(name, stored)?,
        }
    };
    grow_read_txn_dbs(txn, dbi, info, stored);
    Ok(dbi)
}

fn grow_read_txn_dbs(txn: &mut ReadTxn, dbi: Dbi, info: DbInfo, flags: DbFlags) {
    while txn.dbs.len() <= dbi as usize {
        txn.dbs.push(crate::txn::TxnDb {
            info: DbInfo::new(0),
            flags: DbFlags::empty(),
            state: TxnDbFlags::empty(),
        });
    }
    let d = &mut txn.dbs[dbi as usize];
    d.info = info;
    d.flags = flags;
    d.state = TxnDbFlags::VALID;
}

/// Read a leaf node's value, following overflow indirection.
pub(crate) fn leaf_value<'t, T: TxnRead>(
    txn: &'t T,
    node: crate::page::NodeRef<'t>,
) -> Result<&'t [u8]> {
    if node.flags().contains(NodeFlags::BIGDATA) {
        let opg = node.overflow_pgno()?;
        let run = txn.page_bytes(opg)?;
        let pr = PageRef::new(run);
        if !pr.flags().contains(PageFlags::OVERFLOW) {
            return Err(Error::Corrupted);
        }
        pr.overflow_data(node.logical_data_size())
    } else {
        node.data()
    }
}
