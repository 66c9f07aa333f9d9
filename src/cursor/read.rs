//! Cursor navigation: positioning, iteration, and lookups.

use crate::db::{Cmp, DbFlags, Dbi};
use crate::error::{Error, Result};
use crate::meta::{DbInfo, MAIN_DBI};
use crate::page::{NodeFlags, PageRef};
use crate::txn::TxnRead;

use super::{
    leaf_value, node_is_subdb, sub_tree_ctx, tree_ctx, Cursor, CursorFlags, CursorInner, DupPos,
    TreeCtx, CURSOR_STACK, NO_DATA,
};

/// Where a descent should land.
#[derive(Clone, Copy)]
pub(crate) enum Seek<'a> {
    First,
    Last,
    Key(&'a [u8]),
}

/// Binary search for the first entry whose key is >= `key`.
pub(crate) fn node_search(
    page: PageRef<'_>,
    key: &[u8],
    cmp: Cmp,
    leaf2_ksize: usize,
) -> Result<(usize, bool)> {
    let n = page.num_keys();
    let mut lo = 0usize;
    let mut hi = n;
    let mut exact = false;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let mk = if page.is_leaf2() {
            page.leaf2_key(mid, leaf2_ksize)?
        } else {
            page.node(mid)?.key()
        };
        match cmp(mk, key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Equal => {
                exact = true;
                hi = mid;
            }
            std::cmp::Ordering::Greater => hi = mid,
        }
    }
    Ok((lo, exact))
}

/// Child index a branch page routes `key` to.
fn branch_route(page: PageRef<'_>, key: &[u8], cmp: Cmp) -> Result<usize> {
    let (idx, exact) = node_search(page, key, cmp, 0)?;
    // Slot 0 carries the empty "less than all" key, so a non-exact hit
    // belongs to the slot on its left.
    if exact {
        Ok(idx)
    } else {
        Ok(idx.saturating_sub(1))
    }
}

impl CursorInner {
    /// Walk from the root to a leaf. For `Seek::Key` the leaf position is
    /// returned as `(index, exact)` without being written to the stack's
    /// leaf index; `First`/`Last` set it directly.
    pub(crate) fn descend<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        ctx: &TreeCtx,
        seek: Seek<'_>,
    ) -> Result<(PageRef<'t>, usize, bool)> {
        if ctx.root == crate::P_INVALID {
            self.clear_pos();
            return Err(Error::NotFound);
        }
        self.snum = 0;
        self.flags &= !(CursorFlags::EOF | CursorFlags::DEL);
        let mut pgno = ctx.root;
        loop {
            if self.snum >= CURSOR_STACK {
                return Err(Error::CursorFull);
            }
            let bytes = txn.page_bytes(pgno)?;
            let page = PageRef::new(bytes);
            self.pg[self.snum] = pgno;
            self.ki[self.snum] = 0;
            self.snum += 1;
            if page.is_leaf() {
                let (idx, exact) = match seek {
                    Seek::First => {
                        self.ki[self.snum - 1] = 0;
                        (0, true)
                    }
                    Seek::Last => {
                        let n = page.num_keys();
                        let idx = n.saturating_sub(1);
                        self.ki[self.snum - 1] = idx as u16;
                        (idx, true)
                    }
                    Seek::Key(key) => node_search(page, key, ctx.cmp, ctx.leaf2_ksize)?,
                };
                self.flags |= CursorFlags::INITIALIZED;
                return Ok((page, idx, exact));
            }
            if !page.is_branch() {
                return Err(Error::Corrupted);
            }
            let idx = match seek {
                Seek::First => 0,
                Seek::Last => page.num_keys() - 1,
                Seek::Key(key) => branch_route(page, key, ctx.cmp)?,
            };
            self.ki[self.snum - 1] = idx as u16;
            pgno = page.node(idx)?.child_pgno();
        }
    }

    /// Move the leaf frame to the adjacent leaf. Returns false at the
    /// tree's edge, leaving the stack unchanged.
    pub(crate) fn sibling<T: TxnRead>(
        &mut self,
        txn: &T,
        next: bool,
    ) -> Result<bool> {
        if self.snum < 2 {
            return Ok(false);
        }
        // Find the lowest ancestor able to step over.
        let mut level = self.snum - 1;
        loop {
            if level == 0 {
                return Ok(false);
            }
            level -= 1;
            let page = PageRef::new(txn.page_bytes(self.pg[level])?);
            let ki = self.ki[level] as usize;
            let can = if next {
                ki + 1 < page.num_keys()
            } else {
                ki > 0
            };
            if can {
                self.ki[level] = if next { ki as u16 + 1 } else { ki as u16 - 1 };
                break;
            }
        }
        // Rebuild the stack below that ancestor, hugging the near edge.
        self.snum = level + 1;
        loop {
            let page = PageRef::new(txn.page_bytes(self.pg[self.snum - 1])?);
            if page.is_leaf() {
                self.ki[self.snum - 1] = if next {
                    0
                } else {
                    page.num_keys().saturating_sub(1) as u16
                };
                return Ok(true);
            }
            if !page.is_branch() {
                return Err(Error::Corrupted);
            }
            let child = page.node(self.ki[self.snum - 1] as usize)?.child_pgno();
            if self.snum >= CURSOR_STACK {
                return Err(Error::CursorFull);
            }
            let cpage = PageRef::new(txn.page_bytes(child)?);
            self.pg[self.snum] = child;
            self.ki[self.snum] = if next {
                0
            } else {
                cpage.num_keys().saturating_sub(1) as u16
            };
            self.snum += 1;
        }
    }

    /// The leaf page currently under the cursor.
    pub(crate) fn leaf_page<'t, T: TxnRead>(&self, txn: &'t T) -> Result<PageRef<'t>> {
        if !self.initialized() || self.snum == 0 {
            return Err(Error::NotFound);
        }
        let page = PageRef::new(txn.page_bytes(self.leaf_pg())?);
        if !page.is_leaf() {
            return Err(Error::Corrupted);
        }
        Ok(page)
    }

    // --------------------------------------------------------------
    // Sub-cursor (duplicate set) handling

    /// Initialize the sub-cursor for the dup node under the main cursor.
    /// `place` positions it at the first or last duplicate.
    pub(crate) fn sub_init<T: TxnRead>(
        &mut self,
        txn: &T,
        ctx: &TreeCtx,
        last: bool,
    ) -> Result<()> {
        let page = self.leaf_page(txn)?;
        if page.is_leaf2() {
            if let Some(sub) = &mut self.sub {
                sub.active = false;
            }
            return Ok(());
        }
        let node = page.node(self.leaf_ki())?;
        let nf = node.flags();
        let Some(sub) = self.sub.as_mut() else {
            return Ok(());
        };
        if !nf.contains(NodeFlags::DUPDATA) {
            sub.active = false;
            return Ok(());
        }
        if nf.contains(NodeFlags::SUBDATA) {
            // Real sub-tree; its descriptor rides in the node value.
            let info = DbInfo::read(node.data()?)?;
            sub.db = info;
            let mut t = CursorInner::new(self.dbi, self.serial, false);
            let sctx = sub_tree_ctx(ctx.flags, sub);
            t.descend(txn, &sctx, if last { Seek::Last } else { Seek::First })?;
            sub.pos = DupPos::Tree(Box::new(t));
            sub.active = true;
        } else {
            let sp = PageRef::new(node.data()?);
            let n = sp.num_keys();
            if n == 0 {
                return Err(Error::Corrupted);
            }
            // Synthetic descriptor so count() and friends work the same.
            // A DUP_FIXED tree records its duplicate size in the parent
            // descriptor's key-size field.
            sub.db = DbInfo::new(0);
            sub.db.entries = n as u64;
            sub.db.depth = 1;
            sub.db.leaf_pages = 1;
            sub.db.key_size = if sp.is_leaf2() {
                ctx.leaf2_ksize as u32
            } else {
                0
            };
            sub.pos = DupPos::Page {
                ki: if last { n - 1 } else { 0 },
            };
            sub.active = true;
        }
        Ok(())
    }

    /// Current duplicate value; only valid while the sub-cursor is
    /// active.
    pub(crate) fn sub_current<'t, T: TxnRead>(&self, txn: &'t T) -> Result<&'t [u8]> {
        let sub = self.sub.as_ref().ok_or(Error::Incompatible)?;
        if !sub.active {
            return Err(Error::NotFound);
        }
        match &sub.pos {
            DupPos::Page { ki } => {
                let page = self.leaf_page(txn)?;
                let node = page.node(self.leaf_ki())?;
                let sp = PageRef::new(node.data()?);
                sub_page_key(sp, *ki, sub.db.key_size as usize)
            }
            DupPos::Tree(t) => {
                let page = t.leaf_page(txn)?;
                if page.is_leaf2() {
                    page.leaf2_key(t.leaf_ki(), sub.db.key_size as usize)
                } else {
                    Ok(page.node(t.leaf_ki())?.key())
                }
            }
        }
    }

    /// Step within the dup set. Returns false at its edge.
    pub(crate) fn sub_step<T: TxnRead>(
        &mut self,
        txn: &T,
        next: bool,
    ) -> Result<bool> {
        let leaf_ki = self.leaf_ki();
        let leaf_pg = self.leaf_pg();
        let Some(sub) = self.sub.as_mut() else {
            return Ok(false);
        };
        if !sub.active {
            return Ok(false);
        }
        match &mut sub.pos {
            DupPos::Page { ki } => {
                let page = PageRef::new(txn.page_bytes(leaf_pg)?);
                let node = page.node(leaf_ki)?;
                let sp = PageRef::new(node.data()?);
                let n = sp.num_keys();
                if next {
                    if *ki + 1 < n {
                        *ki += 1;
                        return Ok(true);
                    }
                } else if *ki > 0 {
                    *ki -= 1;
                    return Ok(true);
                }
                Ok(false)
            }
            DupPos::Tree(t) => {
                let page = t.leaf_page(txn)?;
                let n = page.num_keys();
                let ki = t.leaf_ki();
                if next {
                    if ki + 1 < n {
                        t.ki[t.snum - 1] += 1;
                        return Ok(true);
                    }
                } else if ki > 0 {
                    t.ki[t.snum - 1] -= 1;
                    return Ok(true);
                }
                t.sibling(txn, next)
            }
        }
    }

    /// Position inside the dup set at `data` (or the first value >= it).
    pub(crate) fn sub_seek<T: TxnRead>(
        &mut self,
        txn: &T,
        ctx: &TreeCtx,
        data: &[u8],
        range: bool,
    ) -> Result<bool> {
        let leaf_ki = self.leaf_ki();
        let page = self.leaf_page(txn)?;
        let node = page.node(leaf_ki)?;
        let nf = node.flags();
        if !nf.contains(NodeFlags::DUPDATA) {
            // Single value: compare directly.
            let v = leaf_value(txn, node)?;
            return Ok(match (ctx.dcmp)(v, data) {
                std::cmp::Ordering::Equal => true,
                std::cmp::Ordering::Greater if range => true,
                _ => false,
            });
        }
        let dcmp = ctx.dcmp;
        let Some(sub) = self.sub.as_mut() else {
            return Err(Error::Incompatible);
        };
        if nf.contains(NodeFlags::SUBDATA) {
            let sctx = sub_tree_ctx(ctx.flags, sub);
            let DupPos::Tree(t) = &mut sub.pos else {
                return Err(Error::Corrupted);
            };
            let (leaf, idx, exact) = t.descend(txn, &sctx, Seek::Key(data))?;
            if exact || (range && idx < leaf.num_keys()) {
                t.ki[t.snum - 1] = idx as u16;
                return Ok(true);
            }
            if range && t.sibling_from(txn, idx, leaf.num_keys())? {
                return Ok(true);
            }
            Ok(false)
        } else {
            let sp = PageRef::new(node.data()?);
            let (idx, exact) = node_search(sp, data, dcmp, sub.db.key_size as usize)?;
            if exact || (range && idx < sp.num_keys()) {
                sub.pos = DupPos::Page { ki: idx };
                return Ok(true);
            }
            Ok(false)
        }
    }

    /// After a key search landed one past the leaf's end, move to the
    /// next leaf's first entry.
    fn sibling_from<T: TxnRead>(&mut self, txn: &T, idx: usize, nkeys: usize) -> Result<bool> {
        if idx < nkeys {
            self.ki[self.snum - 1] = idx as u16;
            return Ok(true);
        }
        self.sibling(txn, true)
    }

    /// Duplicate count at the current position.
    pub(crate) fn dup_count<T: TxnRead>(&self, txn: &T) -> Result<usize> {
        let page = self.leaf_page(txn)?;
        if page.is_leaf2() {
            return Ok(1);
        }
        let node = page.node(self.leaf_ki())?;
        if !node.flags().contains(NodeFlags::DUPDATA) {
            return Ok(1);
        }
        if node.flags().contains(NodeFlags::SUBDATA) {
            Ok(DbInfo::read(node.data()?)?.entries as usize)
        } else {
            Ok(PageRef::new(node.data()?).num_keys())
        }
    }

    /// Key bytes at the current leaf position.
    pub(crate) fn current_key<'t, T: TxnRead>(
        &self,
        txn: &'t T,
        ctx: &TreeCtx,
    ) -> Result<&'t [u8]> {
        let page = self.leaf_page(txn)?;
        let ki = self.leaf_ki();
        if ki >= page.num_keys() {
            return Err(Error::NotFound);
        }
        if page.is_leaf2() {
            page.leaf2_key(ki, ctx.leaf2_ksize)
        } else {
            Ok(page.node(ki)?.key())
        }
    }

    /// Value bytes at the current position (the active duplicate for
    /// dup-sort trees).
    pub(crate) fn current_value<'t, T: TxnRead>(
        &self,
        txn: &'t T,
        ctx: &TreeCtx,
    ) -> Result<&'t [u8]> {
        let page = self.leaf_page(txn)?;
        let ki = self.leaf_ki();
        if ki >= page.num_keys() {
            return Err(Error::NotFound);
        }
        if page.is_leaf2() {
            return Ok(NO_DATA);
        }
        let node = page.node(ki)?;
        if node.flags().contains(NodeFlags::DUPDATA) {
            self.sub_current(txn)
        } else {
            let _ = ctx;
            leaf_value(txn, node)
        }
    }
}

fn sub_page_key<'t>(sp: PageRef<'t>, ki: usize, ksize: usize) -> Result<&'t [u8]> {
    if ki >= sp.num_keys() {
        return Err(Error::NotFound);
    }
    if sp.is_leaf2() {
        sp.leaf2_key(ki, ksize)
    } else {
        Ok(sp.node(ki)?.key())
    }
}

fn check_serial<T: TxnRead>(inner: &CursorInner, txn: &T) -> Result<()> {
    if inner.serial != txn.serial() {
        return Err(Error::BadTxn);
    }
    Ok(())
}

impl Cursor {
    /// Position at the first key.
    pub fn first<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        inner.descend(txn, &ctx, Seek::First)?;
        inner.sub_init(txn, &ctx, false)?;
        Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?))
    }

    /// Position at the last key (and its last duplicate).
    pub fn last<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        inner.descend(txn, &ctx, Seek::Last)?;
        inner.sub_init(txn, &ctx, true)?;
        Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?))
    }

    /// Read the entry under the cursor without moving.
    pub fn get_current<'t, T: TxnRead>(&self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        let inner = self.inner.borrow();
        check_serial(&inner, txn)?;
        if inner.flags.contains(CursorFlags::DEL) || inner.flags.contains(CursorFlags::EOF) {
            return Err(Error::NotFound);
        }
        let ctx = tree_ctx(txn, self.dbi)?;
        Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?))
    }

    /// Advance. Within a dup set this walks duplicates before moving to
    /// the next key.
    pub fn next<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        self.step(txn, true, DupStep::Within)
    }

    /// Step back; mirror image of [`next`](Self::next).
    pub fn prev<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        self.step(txn, false, DupStep::Within)
    }

    /// Next duplicate of the current key only.
    pub fn next_dup<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        self.step(txn, true, DupStep::Only)
    }

    pub fn prev_dup<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        self.step(txn, false, DupStep::Only)
    }

    /// Skip the rest of the dup set and land on the next key.
    pub fn next_nodup<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        self.step(txn, true, DupStep::Skip)
    }

    pub fn prev_nodup<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<(&'t [u8], &'t [u8])> {
        self.step(txn, false, DupStep::Skip)
    }

    fn step<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        next: bool,
        dup: DupStep,
    ) -> Result<(&'t [u8], &'t [u8])> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        if !inner.initialized() {
            drop(inner);
            return if next { self.first(txn) } else { self.last(txn) };
        }
        if inner.flags.contains(CursorFlags::EOF) {
            if next {
                return Err(Error::NotFound);
            }
            // Coming back from past-the-end lands on the last entry.
            inner.flags &= !CursorFlags::EOF;
            inner.sub_init(txn, &ctx, true)?;
            return Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?));
        }
        // A delete left the cursor already pointing at the successor.
        if inner.flags.contains(CursorFlags::DEL) {
            inner.flags &= !CursorFlags::DEL;
            if next {
                let page = inner.leaf_page(txn)?;
                if inner.leaf_ki() < page.num_keys() {
                    inner.sub_init(txn, &ctx, false)?;
                    return Ok((
                        inner.current_key(txn, &ctx)?,
                        inner.current_value(txn, &ctx)?,
                    ));
                }
                if !inner.sibling(txn, true)? {
                    inner.flags |= CursorFlags::EOF;
                    return Err(Error::NotFound);
                }
                inner.sub_init(txn, &ctx, false)?;
                return Ok((
                    inner.current_key(txn, &ctx)?,
                    inner.current_value(txn, &ctx)?,
                ));
            }
        }

        // Dup movement first.
        if matches!(dup, DupStep::Within | DupStep::Only)
            && inner.sub.as_ref().map(|s| s.active).unwrap_or(false)
            && inner.sub_step(txn, next)?
        {
            return Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?));
        }
        if matches!(dup, DupStep::Only) {
            return Err(Error::NotFound);
        }

        // Key movement.
        let page = inner.leaf_page(txn)?;
        let n = page.num_keys();
        let ki = inner.leaf_ki();
        let moved = if next {
            if ki + 1 < n {
                let snum = inner.snum;
                inner.ki[snum - 1] += 1;
                true
            } else {
                inner.sibling(txn, true)?
            }
        } else if ki > 0 {
            let snum = inner.snum;
            inner.ki[snum - 1] -= 1;
            true
        } else {
            inner.sibling(txn, false)?
        };
        if !moved {
            if next {
                inner.flags |= CursorFlags::EOF;
            }
            return Err(Error::NotFound);
        }
        inner.sub_init(txn, &ctx, !next)?;
        Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?))
    }

    /// Position at exactly `key`.
    pub fn set<'t, T: TxnRead>(&mut self, txn: &'t T, key: &[u8]) -> Result<&'t [u8]> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        let (_, idx, exact) = inner.descend(txn, &ctx, Seek::Key(key))?;
        if !exact {
            inner.flags &= !CursorFlags::INITIALIZED;
            return Err(Error::NotFound);
        }
        let snum = inner.snum;
        inner.ki[snum - 1] = idx as u16;
        inner.sub_init(txn, &ctx, false)?;
        inner.current_value(txn, &ctx)
    }

    /// As [`set`](Self::set), also returning the stored key bytes.
    pub fn set_key<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        key: &[u8],
    ) -> Result<(&'t [u8], &'t [u8])> {
        let data = self.set(txn, key)?;
        let inner = self.inner.borrow();
        let ctx = tree_ctx(txn, self.dbi)?;
        Ok((inner.current_key(txn, &ctx)?, data))
    }

    /// Position at the first key >= `key`.
    pub fn set_range<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        key: &[u8],
    ) -> Result<(&'t [u8], &'t [u8])> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        let (leaf, idx, _) = inner.descend(txn, &ctx, Seek::Key(key))?;
        let nkeys = leaf.num_keys();
        if !inner.sibling_from(txn, idx, nkeys)? {
            inner.flags |= CursorFlags::EOF;
            return Err(Error::NotFound);
        }
        inner.sub_init(txn, &ctx, false)?;
        Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?))
    }

    /// Dup-sort: position at exactly `(key, data)`.
    pub fn get_both<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        key: &[u8],
        data: &[u8],
    ) -> Result<(&'t [u8], &'t [u8])> {
        self.get_both_inner(txn, key, data, false)
    }

    /// Dup-sort: position at `key` and its first duplicate >= `data`.
    pub fn get_both_range<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        key: &[u8],
        data: &[u8],
    ) -> Result<(&'t [u8], &'t [u8])> {
        self.get_both_inner(txn, key, data, true)
    }

    fn get_both_inner<'t, T: TxnRead>(
        &mut self,
        txn: &'t T,
        key: &[u8],
        data: &[u8],
        range: bool,
    ) -> Result<(&'t [u8], &'t [u8])> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        if !ctx.flags.contains(DbFlags::DUP_SORT) {
            return Err(Error::Incompatible);
        }
        let (_, idx, exact) = inner.descend(txn, &ctx, Seek::Key(key))?;
        if !exact {
            return Err(Error::NotFound);
        }
        let snum = inner.snum;
        inner.ki[snum - 1] = idx as u16;
        inner.sub_init(txn, &ctx, false)?;
        if !inner.sub_seek(txn, &ctx, data, range)? {
            return Err(Error::NotFound);
        }
        Ok((inner.current_key(txn, &ctx)?, inner.current_value(txn, &ctx)?))
    }

    /// First duplicate of the current key.
    pub fn first_dup<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<&'t [u8]> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        if !inner.initialized() {
            return Err(Error::NotFound);
        }
        let ctx = tree_ctx(txn, self.dbi)?;
        inner.sub_init(txn, &ctx, false)?;
        inner.current_value(txn, &ctx)
    }

    /// Last duplicate of the current key.
    pub fn last_dup<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<&'t [u8]> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        if !inner.initialized() {
            return Err(Error::NotFound);
        }
        let ctx = tree_ctx(txn, self.dbi)?;
        inner.sub_init(txn, &ctx, true)?;
        inner.current_value(txn, &ctx)
    }

    /// Whether the entry under the cursor is a named-database record
    /// rather than plain data. Dump utilities skip these.
    pub fn current_is_db_record<T: TxnRead>(&self, txn: &T) -> Result<bool> {
        let inner = self.inner.borrow();
        check_serial(&inner, txn)?;
        let page = inner.leaf_page(txn)?;
        if page.is_leaf2() {
            return Ok(false);
        }
        let node = page.node(inner.leaf_ki())?;
        Ok(node_is_subdb(node.flags()))
    }

    /// Number of duplicates at the current key.
    pub fn count<T: TxnRead>(&self, txn: &T) -> Result<usize> {
        let inner = self.inner.borrow();
        check_serial(&inner, txn)?;
        if !inner.initialized() {
            return Err(Error::InvalidArg);
        }
        inner.dup_count(txn)
    }

    /// Fixed-size duplicates: the packed run of values at the current
    /// position, as one slice. Positions the sub-cursor at the last value
    /// returned.
    pub fn get_multiple<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<&'t [u8]> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        if !ctx.flags.contains(DbFlags::DUP_FIXED) {
            return Err(Error::Incompatible);
        }
        if !inner.initialized() {
            return Err(Error::NotFound);
        }
        inner.multiple_run(txn, false)
    }

    /// Fixed-size duplicates: advance to the next packed run.
    pub fn next_multiple<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<&'t [u8]> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        if !ctx.flags.contains(DbFlags::DUP_FIXED) {
            return Err(Error::Incompatible);
        }
        inner.multiple_step(txn, true)
    }

    /// Fixed-size duplicates: step back to the previous packed run.
    pub fn prev_multiple<'t, T: TxnRead>(&mut self, txn: &'t T) -> Result<&'t [u8]> {
        let mut inner = self.inner.borrow_mut();
        check_serial(&inner, txn)?;
        let ctx = tree_ctx(txn, self.dbi)?;
        if !ctx.flags.contains(DbFlags::DUP_FIXED) {
            return Err(Error::Incompatible);
        }
        inner.multiple_step(txn, false)
    }
}

#[derive(Clone, Copy)]
enum DupStep {
    /// Walk duplicates, then keys.
    Within,
    /// Stay inside the current dup set.
    Only,
    /// Jump over the rest of the dup set.
    Skip,
}

impl CursorInner {
    /// The rest of the packed dup-value run at the sub-cursor position.
    fn multiple_run<'t, T: TxnRead>(&mut self, txn: &'t T, _from_start: bool) -> Result<&'t [u8]> {
        let leaf_ki = self.leaf_ki();
        let page = self.leaf_page(txn)?;
        let node = page.node(leaf_ki)?;
        if !node.flags().contains(NodeFlags::DUPDATA) {
            // A lone value is a run of one.
            return leaf_value(txn, node);
        }
        let sub = self.sub.as_mut().ok_or(Error::Incompatible)?;
        if !sub.active {
            return Err(Error::NotFound);
        }
        let ksize = sub.db.key_size as usize;
        if ksize == 0 {
            return Err(Error::Incompatible);
        }
        match &mut sub.pos {
            DupPos::Page { ki } => {
                let sp = PageRef::new(node.data()?);
                if !sp.is_leaf2() {
                    return Err(Error::Incompatible);
                }
                let n = sp.num_keys();
                let start = *ki;
                let first = sp.leaf2_key(start, ksize)?;
                let run_len = (n - start) * ksize;
                *ki = n - 1;
                let base = first.as_ptr();
                // Safety: LEAF2 keys are contiguous from `start` to `n`.
                Ok(unsafe { std::slice::from_raw_parts(base, run_len) })
            }
            DupPos::Tree(t) => {
                let leaf = t.leaf_page(txn)?;
                if !leaf.is_leaf2() {
                    return Err(Error::Incompatible);
                }
                let n = leaf.num_keys();
                let start = t.leaf_ki();
                let first = leaf.leaf2_key(start, ksize)?;
                let run_len = (n - start) * ksize;
                t.ki[t.snum - 1] = (n - 1) as u16;
                let base = first.as_ptr();
                // Safety: LEAF2 keys are contiguous from `start` to `n`.
                Ok(unsafe { std::slice::from_raw_parts(base, run_len) })
            }
        }
    }

    fn multiple_step<'t, T: TxnRead>(&mut self, txn: &'t T, next: bool) -> Result<&'t [u8]> {
        if !self.initialized() {
            return Err(Error::NotFound);
        }
        // The run cursor sits at the run's edge; one step crosses into
        // the adjacent run (the next sub-tree leaf, usually).
        if !self.sub_step(txn, next)? {
            return Err(Error::NotFound);
        }
        if !next {
            // Walk back to the start of that run's leaf.
            if let Some(sub) = self.sub.as_mut() {
                if let DupPos::Tree(t) = &mut sub.pos {
                    t.ki[t.snum - 1] = 0;
                } else if let DupPos::Page { ki } = &mut sub.pos {
                    *ki = 0;
                }
            }
        }
        self.multiple_run(txn, false)
    }
}

/// Find a named database's descriptor record in the main tree.
pub(crate) fn find_named_db<T: TxnRead>(txn: &T, name: &str) -> Result<Option<DbInfo>> {
    let ctx = tree_ctx(txn, MAIN_DBI as Dbi)?;
    let mut mc = CursorInner::new(MAIN_DBI as Dbi, txn.serial(), false);
    let (leaf, idx, exact) = match mc.descend(txn, &ctx, Seek::Key(name.as_bytes())) {
        Ok(r) => r,
        Err(Error::NotFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    if !exact {
        return Ok(None);
    }
    let node = leaf.node(idx)?;
    if !node_is_subdb(node.flags()) {
        return Err(Error::Incompatible);
    }
    Ok(Some(DbInfo::read(node.data()?)?))
}

/// Single-key lookup used by `txn.get`. Dup-sort keys yield their first
/// duplicate.
pub(crate) fn txn_get<'t, T: TxnRead>(txn: &'t T, dbi: Dbi, key: &[u8]) -> Result<&'t [u8]> {
    if key.is_empty() || key.len() > crate::MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    let ctx = tree_ctx(txn, dbi)?;
    let mut mc = CursorInner::new(dbi, txn.serial(), ctx.flags.contains(DbFlags::DUP_SORT));
    let (leaf, idx, exact) = mc.descend(txn, &ctx, Seek::Key(key))?;
    if !exact {
        return Err(Error::NotFound);
    }
    mc.ki[mc.snum - 1] = idx as u16;
    if leaf.is_leaf2() {
        return Ok(NO_DATA);
    }
    let node = leaf.node(idx)?;
    if node.flags().contains(NodeFlags::DUPDATA) {
        mc.sub_init(txn, &ctx, false)?;
        mc.sub_current(txn)
    } else {
        leaf_value(txn, node)
    }
}

/// Owned `(key, value)` of the first entry with key >= `key`; used by the
/// allocator's freelist walk.
pub(crate) fn seek_range_owned<T: TxnRead>(
    txn: &T,
    dbi: Dbi,
    key: &[u8],
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let ctx = tree_ctx(txn, dbi)?;
    let mut mc = CursorInner::new(dbi, txn.serial(), false);
    let (leaf, idx, _) = match mc.descend(txn, &ctx, Seek::Key(key)) {
        Ok(r) => r,
        Err(Error::NotFound) => return Ok(None),
        Err(e) => return Err(e),
    };
    let nkeys = leaf.num_keys();
    mc.ki[mc.snum - 1] = idx as u16;
    if idx >= nkeys && !mc.sibling(txn, true)? {
        return Ok(None);
    }
    let leaf = mc.leaf_page(txn)?;
    let node = leaf.node(mc.leaf_ki())?;
    let value = leaf_value(txn, node)?;
    Ok(Some((node.key().to_vec(), value.to_vec())))
}
