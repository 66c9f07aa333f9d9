//! Cursor mutation: put/del, copy-on-write touching, page splits,
//! rebalancing, and the duplicate-set representation changes.
//!
//! Every structural change funnels its cursor fixups through
//! [`patch_cursors`], which visits the acting cursor and every tracked
//! cursor (main stacks and dup sub-tree stacks alike). Frames are matched
//! by page number, so one patch primitive serves main trees and dup
//! sub-trees both.

use crate::db::{DbFlags, Dbi, TxnDbFlags};
use crate::error::{Error, Result};
use crate::meta::{DbInfo, CORE_DBS, MAIN_DBI};
use crate::page::{
    branch_size, leaf_size, node_max, overflow_pages, NodeData, NodeFlags, PageFlags, PageMut,
    PageRef, PAGEHDRSZ,
};
use crate::txn::{TxnRead, WriteTxn};
use crate::{PageNo, P_INVALID};

use super::read::{node_search, Seek};
use super::{
    leaf_value, sub_tree_ctx, tree_ctx, Cursor, CursorFlags, CursorInner, DupPos, TreeCtx,
    WriteFlags, CURSOR_STACK,
};

/// Mid-operation faults leave the tree partially rewritten; flag the txn
/// so later operations are refused until abort. Misses and bad input
/// never get that far.
fn mark_on_error(txn: &mut WriteTxn<'_>, e: Error) -> Error {
    match e {
        Error::KeyExist
        | Error::NotFound
        | Error::BadValSize
        | Error::Incompatible
        | Error::InvalidArg
        | Error::BadDbi
        | Error::BadTxn => e,
        other => {
            txn.errored = true;
            other
        }
    }
}

/// Which tree a structural operation is updating.
#[derive(Clone, Copy)]
enum Target {
    /// A database tree; root/depth/counters live in the txn's table.
    Db(Dbi),
    /// A duplicate sub-tree; root/counters live in the acting cursor's
    /// sub descriptor and are written back into the parent node after.
    Sub,
}

/// An owned copy of one node, used to redistribute pages during splits
/// and merges.
#[derive(Clone)]
struct OwnedNode {
    key: Vec<u8>,
    body: OwnedBody,
    flags: NodeFlags,
}

#[derive(Clone)]
enum OwnedBody {
    /// LEAF2 key-only entry.
    None,
    Data(Vec<u8>),
    Child(PageNo),
    /// Overflow head page and logical size.
    Overflow(PageNo, usize),
}

impl OwnedNode {
    fn page_cost(&self, leaf2: usize) -> usize {
        match &self.body {
            OwnedBody::None => leaf2,
            OwnedBody::Data(d) => leaf_size(&self.key, d.len()) + 2,
            OwnedBody::Child(_) => branch_size(&self.key) + 2,
            OwnedBody::Overflow(..) => leaf_size(&self.key, 8) + 2,
        }
    }
}

fn extract_nodes(page: PageRef<'_>, leaf2: usize) -> Result<Vec<OwnedNode>> {
    let n = page.num_keys();
    let mut out = Vec::with_capacity(n + 1);
    for i in 0..n {
        if page.is_leaf2() {
            out.push(OwnedNode {
                key: page.leaf2_key(i, leaf2)?.to_vec(),
                body: OwnedBody::None,
                flags: NodeFlags::empty(),
            });
            continue;
        }
        let node = page.node(i)?;
        let nf = node.flags();
        let body = if page.is_branch() {
            OwnedBody::Child(node.child_pgno())
        } else if nf.contains(NodeFlags::BIGDATA) {
            OwnedBody::Overflow(node.overflow_pgno()?, node.logical_data_size())
        } else {
            OwnedBody::Data(node.data()?.to_vec())
        };
        out.push(OwnedNode {
            key: node.key().to_vec(),
            body,
            flags: nf & (NodeFlags::DUPDATA | NodeFlags::SUBDATA),
        });
    }
    Ok(out)
}

fn write_nodes(pm: &mut PageMut<'_>, nodes: &[OwnedNode]) -> Result<()> {
    pm.truncate();
    for (i, node) in nodes.iter().enumerate() {
        match &node.body {
            OwnedBody::None => pm.leaf2_insert(i, &node.key)?,
            OwnedBody::Data(d) => {
                pm.insert_node(i, &node.key, Some(NodeData::Data(d)), None, node.flags)?
            }
            OwnedBody::Child(c) => pm.insert_node(i, &node.key, None, Some(*c), node.flags)?,
            OwnedBody::Overflow(pgno, size) => pm.insert_node(
                i,
                &node.key,
                Some(NodeData::Overflow(*pgno, *size)),
                None,
                node.flags,
            )?,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Cursor patch primitives

fn patch_cursors(txn: &mut WriteTxn<'_>, mc: &mut CursorInner, f: &dyn Fn(&mut CursorInner)) {
    f(mc);
    if let Some(sub) = &mut mc.sub {
        if let DupPos::Tree(t) = &mut sub.pos {
            f(t);
        }
    }
    let id = mc.cursor_id;
    txn.for_each_cursor(id, |c| {
        f(c);
        if let Some(sub) = &mut c.sub {
            if let DupPos::Tree(t) = &mut sub.pos {
                f(t);
            }
        }
    });
}

fn frame_replace(c: &mut CursorInner, old: PageNo, new: PageNo) {
    for d in 0..c.snum {
        if c.pg[d] == old {
            c.pg[d] = new;
        }
    }
}

/// How an insertion maps other cursors' indexes on the same page.
#[derive(Clone, Copy, PartialEq)]
enum InsMode {
    /// A genuinely new node: entries at and after `idx` shift right.
    Insert,
    /// A delete-then-reinsert at the same index: coordinates are
    /// unchanged.
    Replace,
}

fn frame_insert(c: &mut CursorInner, pg: PageNo, idx: usize) {
    for d in 0..c.snum {
        if c.pg[d] == pg && c.ki[d] as usize >= idx {
            c.ki[d] += 1;
        }
    }
}

fn frame_delete(c: &mut CursorInner, pg: PageNo, idx: usize) {
    for d in 0..c.snum {
        if c.pg[d] == pg {
            let ki = c.ki[d] as usize;
            if ki > idx {
                c.ki[d] -= 1;
            } else if ki == idx && d == c.snum - 1 {
                c.flags |= CursorFlags::DEL;
                if let Some(sub) = &mut c.sub {
                    sub.active = false;
                }
            }
        }
    }
}

fn frame_split(
    c: &mut CursorInner,
    left: PageNo,
    right: PageNo,
    ins_idx: usize,
    split_idx: usize,
    mode: InsMode,
) {
    for d in 0..c.snum {
        if c.pg[d] == left {
            let ki = c.ki[d] as usize;
            let pos = match mode {
                InsMode::Insert => ki + (ki >= ins_idx) as usize,
                InsMode::Replace => ki,
            };
            if pos >= split_idx {
                c.pg[d] = right;
                c.ki[d] = (pos - split_idx) as u16;
            } else {
                c.ki[d] = pos as u16;
            }
        }
    }
}

fn frame_merge(c: &mut CursorInner, src: PageNo, dst: PageNo, dst_n: usize) {
    for d in 0..c.snum {
        if c.pg[d] == src {
            c.pg[d] = dst;
            c.ki[d] += dst_n as u16;
        }
    }
}

fn frame_root_grow(c: &mut CursorInner, left: PageNo, right: PageNo, new_root: PageNo) {
    if c.snum == 0 || (c.pg[0] != left && c.pg[0] != right) {
        return;
    }
    if c.snum >= CURSOR_STACK {
        return;
    }
    for d in (0..c.snum).rev() {
        c.pg[d + 1] = c.pg[d];
        c.ki[d + 1] = c.ki[d];
    }
    c.snum += 1;
    c.pg[0] = new_root;
    c.ki[0] = if c.pg[1] == right { 1 } else { 0 };
}

fn frame_root_shrink(c: &mut CursorInner, old_root: PageNo) {
    if c.snum < 2 || c.pg[0] != old_root {
        return;
    }
    for d in 1..c.snum {
        c.pg[d - 1] = c.pg[d];
        c.ki[d - 1] = c.ki[d];
    }
    c.snum -= 1;
}

// ---------------------------------------------------------------------
// Tree bookkeeping helpers

impl WriteTxn<'_> {
    fn db_info_mut(&mut self, dbi: Dbi) -> &mut DbInfo {
        let d = &mut self.top_mut().dbs[dbi as usize];
        if dbi as usize >= CORE_DBS {
            d.state |= TxnDbFlags::DIRTY;
        }
        &mut d.info
    }
}

/// Update the root (and friends) for whichever tree the cursor operates
/// on.
fn set_root(txn: &mut WriteTxn<'_>, mc: &mut CursorInner, target: Target, root: PageNo) {
    match target {
        Target::Db(dbi) => txn.db_info_mut(dbi).root = root,
        Target::Sub => {
            if let Some(sub) = &mut mc.sub {
                sub.db.root = root;
            }
        }
    }
}

fn info_of<'a>(
    txn: &'a mut WriteTxn<'_>,
    mc: &'a mut CursorInner,
    target: Target,
) -> &'a mut DbInfo {
    match target {
        Target::Db(dbi) => txn.db_info_mut(dbi),
        Target::Sub => &mut mc.sub.as_mut().expect("sub target has sub cursor").db,
    }
}

// ---------------------------------------------------------------------
// Touch: make the cursor's path writable

/// COW every page on `stack`'s path, updating parent pointers, the tree
/// root, and all tracked cursors.
fn touch_stack(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    use_sub_stack: bool,
) -> Result<()> {
    let snum = if use_sub_stack {
        match &mc.sub {
            Some(s) => match &s.pos {
                DupPos::Tree(t) => t.snum,
                DupPos::Page { .. } => 0,
            },
            None => 0,
        }
    } else {
        mc.snum
    };
    for d in 0..snum {
        let old = if use_sub_stack {
            match &mc.sub {
                Some(s) => match &s.pos {
                    DupPos::Tree(t) => t.pg[d],
                    _ => unreachable!(),
                },
                None => unreachable!(),
            }
        } else {
            mc.pg[d]
        };
        let new = txn.cow_page(old)?;
        if new == old {
            continue;
        }
        if d == 0 {
            set_root(txn, mc, target, new);
        } else {
            let parent = if use_sub_stack {
                match &mc.sub {
                    Some(s) => match &s.pos {
                        DupPos::Tree(t) => (t.pg[d - 1], t.ki[d - 1] as usize),
                        _ => unreachable!(),
                    },
                    None => unreachable!(),
                }
            } else {
                (mc.pg[d - 1], mc.ki[d - 1] as usize)
            };
            let bytes = txn.page_mut(parent.0)?;
            PageMut::new(bytes).set_child(parent.1, new)?;
        }
        patch_cursors(txn, mc, &|c| frame_replace(c, old, new));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Node insertion with split

/// Insert an owned node into the page at `level` of the stack, splitting
/// as needed. Returns the final `(page, index)` of the inserted node.
///
/// Pages on the stack must already be dirty.
fn insert_at_level(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    stack: &mut StackRef,
    level: usize,
    idx: usize,
    item: OwnedNode,
    leaf2: usize,
    mode: InsMode,
) -> Result<(PageNo, usize)> {
    let pgno = stack.pg(mc, level);

    // Fast path: it fits.
    let fit = {
        let bytes = txn.page_mut(pgno)?;
        let mut pm = PageMut::new(bytes);
        try_insert(&mut pm, idx, &item)
    };
    match fit {
        Ok(()) => {
            if mode == InsMode::Insert {
                patch_cursors(txn, mc, &|c| frame_insert(c, pgno, idx));
            }
            return Ok((pgno, idx));
        }
        Err(Error::PageFull) => {}
        Err(e) => return Err(e),
    }

    // Split. Collect every node plus the new one, pick a cut, rebuild.
    let psize = txn.psize();
    let is_branch;
    let mut nodes = {
        let bytes = txn.page_bytes(pgno)?;
        let page = PageRef::new(bytes);
        is_branch = page.is_branch();
        extract_nodes(page, leaf2)?
    };
    nodes.insert(idx, item);

    let split_idx = choose_split(&nodes, idx, psize, leaf2);
    let right_nodes: Vec<OwnedNode> = nodes.split_off(split_idx);
    let left_nodes = nodes;
    let mut right_nodes = right_nodes;

    // The separator that will route to the right page.
    let sep_key = right_nodes[0].key.clone();
    if is_branch {
        // A branch's first slot is its "less than all" slot.
        right_nodes[0].key.clear();
    }

    let flags = {
        let bytes = txn.page_bytes(pgno)?;
        PageRef::new(bytes).flags() & !PageFlags::DIRTY
    };
    let rpg = txn.alloc_pages(1)?;
    {
        let bytes = txn.page_mut(rpg)?;
        let mut pm = PageMut::new(bytes);
        pm.init(rpg, flags);
        write_nodes(&mut pm, &right_nodes)?;
    }
    {
        let bytes = txn.page_mut(pgno)?;
        let mut pm = PageMut::new(bytes);
        write_nodes(&mut pm, &left_nodes)?;
    }
    {
        let info = info_of(txn, mc, target);
        if is_branch {
            info.branch_pages += 1;
        } else {
            info.leaf_pages += 1;
        }
    }

    // Wire the new page into the level above.
    let sep = OwnedNode {
        key: sep_key,
        body: OwnedBody::Child(rpg),
        flags: NodeFlags::empty(),
    };
    if level == 0 {
        // Grow a new root above the two halves.
        let root = txn.alloc_pages(1)?;
        {
            let bytes = txn.page_mut(root)?;
            let mut pm = PageMut::new(bytes);
            pm.init(root, PageFlags::BRANCH);
            pm.insert_node(0, b"", None, Some(pgno), NodeFlags::empty())?;
            pm.insert_node(1, &sep.key, None, Some(rpg), NodeFlags::empty())?;
        }
        {
            let info = info_of(txn, mc, target);
            info.branch_pages += 1;
            info.depth += 1;
        }
        set_root(txn, mc, target, root);
        patch_cursors(txn, mc, &|c| {
            frame_split(c, pgno, rpg, idx, split_idx, mode);
            frame_root_grow(c, pgno, rpg, root);
        });
    } else {
        let pki = stack.ki(mc, level - 1);
        patch_cursors(txn, mc, &|c| frame_split(c, pgno, rpg, idx, split_idx, mode));
        let (sep_pg, sep_idx) = insert_at_level(
            txn,
            mc,
            target,
            stack,
            level - 1,
            pki + 1,
            sep,
            0,
            InsMode::Insert,
        )?;
        // Cursors that landed on the right half must route through the
        // separator node upstairs.
        patch_cursors(txn, mc, &|c| {
            for d in 1..c.snum {
                if c.pg[d] == rpg {
                    c.pg[d - 1] = sep_pg;
                    c.ki[d - 1] = sep_idx as u16;
                }
            }
        });
    }

    // Report where the inserted node ended up.
    let at = idx;
    if at >= split_idx {
        Ok((rpg, at - split_idx))
    } else {
        Ok((pgno, at))
    }
}

fn try_insert(pm: &mut PageMut<'_>, idx: usize, item: &OwnedNode) -> Result<()> {
    match &item.body {
        OwnedBody::None => pm.leaf2_insert(idx, &item.key),
        OwnedBody::Data(d) => pm.insert_node(idx, &item.key, Some(NodeData::Data(d)), None, item.flags),
        OwnedBody::Child(c) => pm.insert_node(idx, &item.key, None, Some(*c), item.flags),
        OwnedBody::Overflow(pgno, size) => pm.insert_node(
            idx,
            &item.key,
            Some(NodeData::Overflow(*pgno, *size)),
            None,
            item.flags,
        ),
    }
}

/// Split index: median by cumulative size, biased so a node appended at
/// the end leaves the new right page nearly empty for sequential loads.
fn choose_split(nodes: &[OwnedNode], ins_idx: usize, psize: usize, leaf2: usize) -> usize {
    let n = nodes.len();
    debug_assert!(n >= 2);
    if ins_idx == n - 1 {
        return n - 1;
    }
    if leaf2 > 0 {
        return n / 2;
    }
    let budget = (psize - PAGEHDRSZ) / 2;
    let mut acc = 0usize;
    for (i, node) in nodes.iter().enumerate() {
        acc += node.page_cost(leaf2);
        if acc > budget {
            // Never leave either side empty.
            return i.clamp(1, n - 1);
        }
    }
    n / 2
}

/// Indirection so the same machinery works on the main stack and a dup
/// sub-tree stack.
#[derive(Clone, Copy)]
enum StackRef {
    Main,
    Sub,
}

impl StackRef {
    fn pg(&self, mc: &CursorInner, level: usize) -> PageNo {
        match self {
            StackRef::Main => mc.pg[level],
            StackRef::Sub => match &mc.sub.as_ref().unwrap().pos {
                DupPos::Tree(t) => t.pg[level],
                _ => unreachable!("sub stack requires a tree sub-cursor"),
            },
        }
    }

    fn ki(&self, mc: &CursorInner, level: usize) -> usize {
        match self {
            StackRef::Main => mc.ki[level] as usize,
            StackRef::Sub => match &mc.sub.as_ref().unwrap().pos {
                DupPos::Tree(t) => t.ki[level] as usize,
                _ => unreachable!("sub stack requires a tree sub-cursor"),
            },
        }
    }

}

// ---------------------------------------------------------------------
// Deletion and rebalance

/// Remove the node at `(level, idx)` of the stack and rebalance.
fn delete_at_level(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    stack: StackRef,
    level: usize,
    idx: usize,
    leaf2: usize,
) -> Result<()> {
    let pgno = stack.pg(mc, level);
    {
        let bytes = txn.page_mut(pgno)?;
        let mut pm = PageMut::new(bytes);
        if pm.is_leaf2() {
            pm.leaf2_delete(idx, leaf2)?;
        } else {
            pm.delete_node(idx)?;
        }
    }
    patch_cursors(txn, mc, &|c| frame_delete(c, pgno, idx));
    rebalance(txn, mc, target, stack, level, leaf2)
}

fn page_underfull(page: PageRef<'_>, psize: usize) -> bool {
    let min_keys = if page.is_branch() { 2 } else { 1 };
    page.num_keys() < min_keys
        || page.used_size() * 100 < psize * crate::page::FILL_THRESHOLD_PCT
}

fn rebalance(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    stack: StackRef,
    level: usize,
    leaf2: usize,
) -> Result<()> {
    let psize = txn.psize();
    let pgno = stack.pg(mc, level);
    {
        let bytes = txn.page_bytes(pgno)?;
        let page = PageRef::new(bytes);
        if !page_underfull(page, psize) {
            return Ok(());
        }
    }

    if level == 0 {
        let (is_leaf, nkeys, only_child) = {
            let bytes = txn.page_bytes(pgno)?;
            let page = PageRef::new(bytes);
            let only = if page.is_branch() && page.num_keys() == 1 {
                Some(page.node(0)?.child_pgno())
            } else {
                None
            };
            (page.is_leaf(), page.num_keys(), only)
        };
        if is_leaf && nkeys == 0 {
            // The tree is empty now.
            txn.free_page_run(pgno, 1)?;
            {
                let info = info_of(txn, mc, target);
                info.root = P_INVALID;
                info.depth = 0;
                info.leaf_pages -= 1;
            }
            patch_cursors(txn, mc, &|c| {
                if c.snum > 0 && c.pg[0] == pgno {
                    c.snum = 0;
                    c.flags &= !CursorFlags::INITIALIZED;
                }
            });
            return Ok(());
        }
        if let Some(child) = only_child {
            // Collapse a single-child root.
            txn.free_page_run(pgno, 1)?;
            {
                let info = info_of(txn, mc, target);
                info.root = child;
                info.depth -= 1;
                info.branch_pages -= 1;
            }
            set_root(txn, mc, target, child);
            patch_cursors(txn, mc, &|c| frame_root_shrink(c, pgno));
        }
        return Ok(());
    }

    // Pick a sibling through the parent; prefer the left one.
    let parent_pg = stack.pg(mc, level - 1);
    let pki = stack.ki(mc, level - 1);
    let (sib_idx, sib_is_left) = if pki > 0 {
        (pki - 1, true)
    } else {
        (pki + 1, false)
    };
    let sib_pg_old = {
        let bytes = txn.page_bytes(parent_pg)?;
        PageRef::new(bytes).node(sib_idx)?.child_pgno()
    };
    // The sibling joins the dirty set either way.
    let sib_pg = txn.cow_page(sib_pg_old)?;
    if sib_pg != sib_pg_old {
        let bytes = txn.page_mut(parent_pg)?;
        PageMut::new(bytes).set_child(sib_idx, sib_pg)?;
        patch_cursors(txn, mc, &|c| frame_replace(c, sib_pg_old, sib_pg));
    }

    let (sib_rich, sib_n, combined_fits) = {
        let bytes = txn.page_bytes(sib_pg)?;
        let sib = PageRef::new(bytes);
        let our = PageRef::new(txn.page_bytes(pgno)?);
        let min_keys = if sib.is_branch() { 2 } else { 1 };
        let rich = !page_underfull(sib, psize) && sib.num_keys() > min_keys;
        // Merging a branch re-materializes one implicit first key, so
        // leave room for a maximal separator.
        let slack = crate::MAX_KEY_SIZE + 16;
        let fits = sib.used_size() + our.used_size() + slack <= psize + PAGEHDRSZ;
        (rich, sib.num_keys(), fits)
    };

    if sib_rich || !combined_fits {
        let min_keys = 2;
        if !sib_rich && sib_n <= min_keys {
            // Nothing safe to do; an underfull page is still a valid one.
            return Ok(());
        }
        move_edge_node(
            txn, mc, target, stack, level, pgno, sib_pg, sib_idx, sib_is_left, sib_n, leaf2,
            parent_pg, pki,
        )
    } else {
        merge_pages(
            txn, mc, target, stack, level, pgno, sib_pg, sib_idx, sib_is_left, leaf2, parent_pg,
            pki,
        )
    }
}

/// Borrow one node from the edge of a rich sibling.
#[allow(clippy::too_many_arguments)]
fn move_edge_node(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    stack: StackRef,
    level: usize,
    pgno: PageNo,
    sib_pg: PageNo,
    sib_idx: usize,
    sib_is_left: bool,
    sib_n: usize,
    leaf2: usize,
    parent_pg: PageNo,
    pki: usize,
) -> Result<()> {
    let is_branch = {
        let bytes = txn.page_bytes(pgno)?;
        PageRef::new(bytes).is_branch()
    };

    // Take the node nearest to us from the sibling.
    let take_idx = if sib_is_left { sib_n - 1 } else { 0 };
    let mut moved = {
        let bytes = txn.page_bytes(sib_pg)?;
        let page = PageRef::new(bytes);
        let all = extract_nodes(page, leaf2)?;
        all[take_idx].clone()
    };

    // Branch slot-0 keys are implicit; real keys come from the parent
    // separators.
    let parent_sep_ours = {
        let bytes = txn.page_bytes(parent_pg)?;
        PageRef::new(bytes).node(pki)?.key().to_vec()
    };
    let parent_sep_sib = {
        let bytes = txn.page_bytes(parent_pg)?;
        PageRef::new(bytes).node(sib_idx)?.key().to_vec()
    };

    if sib_is_left {
        // Moved node becomes our first entry.
        let new_sep = moved.key.clone();
        if is_branch {
            // Our old first node gains its separator key back, the moved
            // node's key empties.
            let old_first_key = parent_sep_ours.clone();
            let mut nodes = {
                let bytes = txn.page_bytes(pgno)?;
                extract_nodes(PageRef::new(bytes), leaf2)?
            };
            if !nodes.is_empty() && leaf2 == 0 {
                nodes[0].key = old_first_key;
            }
            moved.key = Vec::new();
            nodes.insert(0, moved);
            let bytes = txn.page_mut(pgno)?;
            write_nodes(&mut PageMut::new(bytes), &nodes)?;
        } else {
            let bytes = txn.page_mut(pgno)?;
            let mut pm = PageMut::new(bytes);
            try_insert(&mut pm, 0, &moved).map_err(|_| Error::PageFull)?;
        }
        {
            let bytes = txn.page_mut(sib_pg)?;
            let mut pm = PageMut::new(bytes);
            if pm.is_leaf2() {
                pm.leaf2_delete(take_idx, leaf2)?;
            } else {
                pm.delete_node(take_idx)?;
            }
        }
        patch_cursors(txn, mc, &|c| {
            // The donor's last slot became our slot 0.
            for d in 0..c.snum {
                if c.pg[d] == sib_pg && c.ki[d] as usize == take_idx {
                    c.pg[d] = pgno;
                    c.ki[d] = 0;
                } else if c.pg[d] == pgno {
                    c.ki[d] += 1;
                }
            }
        });
        // Our separator now names the moved key.
        update_parent_sep(txn, mc, target, &stack, level - 1, pki, &new_sep)?;
    } else {
        // Moved node appends after our last entry.
        let our_n = {
            let bytes = txn.page_bytes(pgno)?;
            PageRef::new(bytes).num_keys()
        };
        let sib_second_key = {
            let bytes = txn.page_bytes(sib_pg)?;
            let page = PageRef::new(bytes);
            if page.is_leaf2() {
                page.leaf2_key(1, leaf2)?.to_vec()
            } else {
                page.node(1)?.key().to_vec()
            }
        };
        if is_branch {
            moved.key = parent_sep_sib.clone();
        }
        {
            let bytes = txn.page_mut(pgno)?;
            let mut pm = PageMut::new(bytes);
            try_insert(&mut pm, our_n, &moved).map_err(|_| Error::PageFull)?;
        }
        {
            let bytes = txn.page_mut(sib_pg)?;
            let mut pm = PageMut::new(bytes);
            if pm.is_leaf2() {
                pm.leaf2_delete(0, leaf2)?;
            } else {
                pm.delete_node(0)?;
            }
        }
        if is_branch {
            // The sibling's new first node key becomes implicit.
            let mut nodes = {
                let bytes = txn.page_bytes(sib_pg)?;
                extract_nodes(PageRef::new(bytes), leaf2)?
            };
            if !nodes.is_empty() && leaf2 == 0 {
                nodes[0].key = Vec::new();
                let bytes = txn.page_mut(sib_pg)?;
                write_nodes(&mut PageMut::new(bytes), &nodes)?;
            }
        }
        patch_cursors(txn, mc, &|c| {
            for d in 0..c.snum {
                if c.pg[d] == sib_pg {
                    let ki = c.ki[d] as usize;
                    if ki == 0 {
                        c.pg[d] = pgno;
                        c.ki[d] = our_n as u16;
                    } else {
                        c.ki[d] -= 1;
                    }
                }
            }
        });
        // The sibling's separator must now name its new first key.
        update_parent_sep(txn, mc, target, &stack, level - 1, sib_idx, &sib_second_key)?;
    }
    Ok(())
}

/// Replace the key of the parent entry at `idx`, splitting the parent if
/// the longer key doesn't fit.
fn update_parent_sep(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    stack: &StackRef,
    level: usize,
    idx: usize,
    new_key: &[u8],
) -> Result<()> {
    let pgno = stack.pg(mc, level);
    let (child, same_len) = {
        let bytes = txn.page_bytes(pgno)?;
        let node = PageRef::new(bytes).node(idx)?;
        (node.child_pgno(), node.ksize() == new_key.len())
    };
    if same_len {
        let bytes = txn.page_mut(pgno)?;
        PageMut::new(bytes).replace_key_same_len(idx, new_key)?;
        return Ok(());
    }
    {
        let bytes = txn.page_mut(pgno)?;
        PageMut::new(bytes).delete_node(idx)?;
    }
    let item = OwnedNode {
        key: new_key.to_vec(),
        body: OwnedBody::Child(child),
        flags: NodeFlags::empty(),
    };
    let mut stack_copy = *stack;
    insert_at_level(txn, mc, target, &mut stack_copy, level, idx, item, 0, InsMode::Replace)?;
    Ok(())
}

/// Fold the right page of a pair into the left one.
#[allow(clippy::too_many_arguments)]
fn merge_pages(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    target: Target,
    stack: StackRef,
    level: usize,
    pgno: PageNo,
    sib_pg: PageNo,
    sib_idx: usize,
    sib_is_left: bool,
    leaf2: usize,
    parent_pg: PageNo,
    pki: usize,
) -> Result<()> {
    let (dst, src, src_parent_idx, dst_parent_idx) = if sib_is_left {
        (sib_pg, pgno, pki, sib_idx)
    } else {
        (pgno, sib_pg, sib_idx, pki)
    };

    let is_branch = {
        let bytes = txn.page_bytes(dst)?;
        PageRef::new(bytes).is_branch()
    };
    let mut src_nodes = {
        let bytes = txn.page_bytes(src)?;
        extract_nodes(PageRef::new(bytes), leaf2)?
    };
    if is_branch && leaf2 == 0 && !src_nodes.is_empty() {
        // The implicit first key becomes explicit on the move.
        let sep = {
            let bytes = txn.page_bytes(parent_pg)?;
            PageRef::new(bytes).node(src_parent_idx)?.key().to_vec()
        };
        src_nodes[0].key = sep;
    }

    let dst_n = {
        let bytes = txn.page_bytes(dst)?;
        PageRef::new(bytes).num_keys()
    };
    {
        let bytes = txn.page_mut(dst)?;
        let mut pm = PageMut::new(bytes);
        for (i, node) in src_nodes.iter().enumerate() {
            try_insert(&mut pm, dst_n + i, node)?;
        }
    }
    txn.free_page_run(src, 1)?;
    {
        let info = info_of(txn, mc, target);
        if is_branch {
            info.branch_pages -= 1;
        } else {
            info.leaf_pages -= 1;
        }
    }
    patch_cursors(txn, mc, &|c| {
        frame_merge(c, src, dst, dst_n);
        // Branch frames that routed through the vanished entry now route
        // through the survivor's.
        for d in 0..c.snum {
            if c.pg[d] == parent_pg && c.ki[d] as usize == src_parent_idx {
                c.ki[d] = dst_parent_idx as u16;
            }
        }
    });

    // Drop the parent entry routing to the vanished page, then let the
    // parent rebalance in turn.
    delete_at_level(txn, mc, target, stack, level - 1, src_parent_idx, 0)?;
    Ok(())
}

// ---------------------------------------------------------------------
// The put operation

const MAX_DATA_SIZE: usize = 0xffff_ffff;

impl Cursor {
    /// Insert or update `key`. See [`WriteFlags`] for the modes.
    pub fn put(
        &mut self,
        txn: &mut WriteTxn<'_>,
        key: &[u8],
        data: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        let inner = self.inner.clone();
        let mut mc = inner.borrow_mut();
        if mc.serial != txn.serial() {
            return Err(Error::BadTxn);
        }
        txn.check_ok()?;
        if flags.contains(WriteFlags::MULTIPLE) {
            return Err(Error::InvalidArg);
        }
        cursor_put(txn, &mut mc, self.dbi, key, data, flags)
            .map(|_| ())
            .map_err(|e| mark_on_error(txn, e))
    }

    /// Insert `key`, reserving `len` bytes for the caller to fill before
    /// the transaction commits. Returns the writable value region.
    pub fn put_reserve<'a>(
        &mut self,
        txn: &'a mut WriteTxn<'_>,
        key: &[u8],
        len: usize,
        flags: WriteFlags,
    ) -> Result<&'a mut [u8]> {
        let inner = self.inner.clone();
        let (pg, idx) = {
            let mut mc = inner.borrow_mut();
            if mc.serial != txn.serial() {
                return Err(Error::BadTxn);
            }
            txn.check_ok()?;
            let ctx = tree_ctx(txn, self.dbi)?;
            if ctx.flags.contains(DbFlags::DUP_SORT) {
                return Err(Error::Incompatible);
            }
            let zeros = vec![0u8; len];
            cursor_put(txn, &mut mc, self.dbi, key, &zeros, flags | WriteFlags::RESERVE)
                .map_err(|e| mark_on_error(txn, e))?
        };
        // Hand out the value region: inline bytes, or the overflow run.
        let (target_pg, off) = {
            let bytes = txn.page_bytes(pg)?;
            let page = PageRef::new(bytes);
            let node = page.node(idx)?;
            if node.flags().contains(NodeFlags::BIGDATA) {
                (node.overflow_pgno()?, PAGEHDRSZ)
            } else {
                let (o, _) = page.node_data_region(idx)?;
                (pg, o)
            }
        };
        let bytes = txn.page_mut(target_pg)?;
        Ok(&mut bytes[off..off + len])
    }

    /// Bulk-insert `count` fixed-size duplicate values packed in `data`.
    /// Returns how many were stored.
    pub fn put_multiple(
        &mut self,
        txn: &mut WriteTxn<'_>,
        key: &[u8],
        data: &[u8],
        size: usize,
        count: usize,
    ) -> Result<usize> {
        let ctx = tree_ctx(txn, self.dbi)?;
        if !ctx.flags.contains(DbFlags::DUP_FIXED) {
            return Err(Error::Incompatible);
        }
        if size == 0 || data.len() < size * count {
            return Err(Error::BadValSize);
        }
        let mut stored = 0;
        for i in 0..count {
            let chunk = &data[i * size..(i + 1) * size];
            match self.put(txn, key, chunk, WriteFlags::empty()) {
                Ok(()) => stored += 1,
                Err(Error::KeyExist) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(stored)
    }

    /// Delete the entry under the cursor. With
    /// [`WriteFlags::NO_DUP_DATA`], delete every duplicate of the key.
    pub fn del(&mut self, txn: &mut WriteTxn<'_>, flags: WriteFlags) -> Result<()> {
        let inner = self.inner.clone();
        let mut mc = inner.borrow_mut();
        if mc.serial != txn.serial() {
            return Err(Error::BadTxn);
        }
        txn.check_ok()?;
        cursor_del(txn, &mut mc, self.dbi, flags).map_err(|e| mark_on_error(txn, e))
    }
}

// The main put engine. Returns the final (leaf page, index) of the key's
// node.
fn cursor_put(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<(PageNo, usize)> {
    let mut flags = flags;
    let ctx = tree_ctx(txn, dbi)?;
    let dupsort = ctx.flags.contains(DbFlags::DUP_SORT);

    if key.is_empty() || key.len() > crate::MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    if data.len() > MAX_DATA_SIZE || (dupsort && data.len() > crate::MAX_KEY_SIZE) {
        return Err(Error::BadValSize);
    }
    if ctx.flags.contains(DbFlags::INTEGER_KEY) && !crate::db::valid_int_size(key.len()) {
        return Err(Error::BadValSize);
    }
    if ctx.flags.contains(DbFlags::INTEGER_DUP) && !crate::db::valid_int_size(data.len()) {
        return Err(Error::BadValSize);
    }
    if flags.contains(WriteFlags::RESERVE) && dupsort {
        return Err(Error::Incompatible);
    }
    if ctx.flags.contains(DbFlags::DUP_FIXED) {
        if ctx.leaf2_ksize != 0 && data.len() != ctx.leaf2_ksize {
            return Err(Error::BadValSize);
        }
        if ctx.leaf2_ksize == 0 {
            // First value of a DUP_FIXED tree fixes the duplicate size.
            if data.is_empty() {
                return Err(Error::BadValSize);
            }
            txn.db_info_mut(dbi).key_size = data.len() as u32;
        }
    }

    txn.spill(txn.op_need(ctx.depth, key.len() + data.len()))?;
    let mut ctx = tree_ctx(txn, dbi)?;

    // CURRENT on a dup-sort tree replaces the active duplicate: same
    // size, delete-then-reinsert.
    if flags.contains(WriteFlags::CURRENT) && dupsort {
        if !mc.initialized() {
            return Err(Error::InvalidArg);
        }
        let cur = mc.current_value(txn, &ctx)?.to_vec();
        if cur.len() != data.len() {
            return Err(Error::BadValSize);
        }
        if (ctx.dcmp)(&cur, data) == std::cmp::Ordering::Equal {
            return Ok((mc.leaf_pg(), mc.leaf_ki()));
        }
        cursor_del(txn, mc, dbi, WriteFlags::empty())?;
        flags &= !WriteFlags::CURRENT;
        // The delete may have rebalanced; the root must be re-read.
        ctx = tree_ctx(txn, dbi)?;
    }

    // Empty tree: plant the first leaf.
    if ctx.root == P_INVALID {
        let root = txn.alloc_pages(1)?;
        {
            let bytes = txn.page_mut(root)?;
            let mut pm = PageMut::new(bytes);
            pm.init(root, PageFlags::LEAF);
        }
        {
            let info = txn.db_info_mut(dbi);
            info.root = root;
            info.depth = 1;
            info.leaf_pages = 1;
        }
        mc.snum = 1;
        mc.pg[0] = root;
        mc.ki[0] = 0;
        mc.flags = CursorFlags::INITIALIZED;
        let item = build_leaf_item(txn, dbi, key, data, flags)?;
        let mut stack = StackRef::Main;
        let pos = insert_at_level(txn, mc, Target::Db(dbi), &mut stack, 0, 0, item, 0, InsMode::Insert)?;
        txn.db_info_mut(dbi).entries += 1;
        mc.ki[mc.snum - 1] = 0;
        return Ok(pos);
    }

    // Position.
    let (idx, exact) = if flags.contains(WriteFlags::CURRENT) {
        if !mc.initialized() {
            return Err(Error::InvalidArg);
        }
        (mc.leaf_ki(), true)
    } else if flags.contains(WriteFlags::APPEND) {
        let (leaf, _, _) = mc.descend(txn, &ctx, Seek::Last)?;
        let n = leaf.num_keys();
        if n > 0 {
            let last_key = if leaf.is_leaf2() {
                leaf.leaf2_key(n - 1, ctx.leaf2_ksize)?
            } else {
                leaf.node(n - 1)?.key()
            };
            match (ctx.cmp)(key, last_key) {
                std::cmp::Ordering::Greater => {}
                std::cmp::Ordering::Equal if dupsort => {
                    // Same key: fall through into the dup handling.
                    mc.ki[mc.snum - 1] = (n - 1) as u16;
                    return put_existing(txn, mc, dbi, &ctx, n - 1, key, data, flags);
                }
                _ => return Err(Error::KeyExist),
            }
        }
        (n, false)
    } else {
        let (_, idx, exact) = mc.descend(txn, &ctx, Seek::Key(key))?;
        (idx, exact)
    };

    if exact {
        mc.ki[mc.snum - 1] = idx as u16;
        return put_existing(txn, mc, dbi, &ctx, idx, key, data, flags);
    }

    // Brand-new key.
    touch_stack(txn, mc, Target::Db(dbi), false)?;
    let item = build_leaf_item(txn, dbi, key, data, flags)?;
    let mut stack = StackRef::Main;
    let level = mc.snum - 1;
    insert_at_level(txn, mc, Target::Db(dbi), &mut stack, level, idx, item, 0, InsMode::Insert)?;
    txn.db_info_mut(dbi).entries += 1;
    // Leave the cursor on the new entry.
    let pos = reseat(txn, mc, dbi, key)?;
    if let Some(sub) = &mut mc.sub {
        sub.active = false;
    }
    Ok(pos)
}

fn set_leaf_pos(mc: &mut CursorInner, pos: (PageNo, usize)) {
    let top = mc.snum - 1;
    mc.pg[top] = pos.0;
    mc.ki[top] = pos.1 as u16;
}

/// Rebuild the acting cursor's stack after a structural change by
/// walking to `key` again. The incremental patches keep every *other*
/// cursor exact, but the actor's own leaf index is in flux during its
/// operation, so a fresh descent is the reliable way to land on the
/// final position.
fn reseat(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    key: &[u8],
) -> Result<(PageNo, usize)> {
    let ctx = tree_ctx(txn, dbi)?;
    let (_, idx, exact) = mc.descend(txn, &ctx, Seek::Key(key))?;
    if !exact {
        return Err(Error::Corrupted);
    }
    mc.ki[mc.snum - 1] = idx as u16;
    mc.flags |= CursorFlags::INITIALIZED;
    mc.flags &= !(CursorFlags::EOF | CursorFlags::DEL);
    Ok((mc.leaf_pg(), idx))
}

/// Build the stored form of a fresh leaf value: inline, or an overflow
/// run for big values.
fn build_leaf_item(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<OwnedNode> {
    let psize = txn.psize();
    if leaf_size(key, data.len()) > node_max(psize) {
        let npages = overflow_pages(psize, data.len());
        let head = txn.alloc_pages(npages)?;
        {
            let bytes = txn.page_mut(head)?;
            let mut pm = PageMut::new(bytes);
            pm.init(head, PageFlags::OVERFLOW);
            pm.set_overflow_count(npages);
            let raw = pm.raw_mut();
            if !flags.contains(WriteFlags::RESERVE) {
                raw[PAGEHDRSZ..PAGEHDRSZ + data.len()].copy_from_slice(data);
            }
        }
        txn.db_info_mut(dbi).overflow_pages += npages as u64;
        return Ok(OwnedNode {
            key: key.to_vec(),
            body: OwnedBody::Overflow(head, data.len()),
            flags: NodeFlags::empty(),
        });
    }
    Ok(OwnedNode {
        key: key.to_vec(),
        body: OwnedBody::Data(data.to_vec()),
        flags: NodeFlags::empty(),
    })
}

/// Put over an existing key: plain replace, or the dup-sort insert path
/// with its representation upgrades.
#[allow(clippy::too_many_arguments)]
fn put_existing(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    ctx: &TreeCtx,
    idx: usize,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<(PageNo, usize)> {
    let dupsort = ctx.flags.contains(DbFlags::DUP_SORT);

    if !dupsort {
        if flags.contains(WriteFlags::NO_OVERWRITE) {
            return Err(Error::KeyExist);
        }
        touch_stack(txn, mc, Target::Db(dbi), false)?;
        let pgno = mc.leaf_pg();
        let old_overflow = {
            let bytes = txn.page_bytes(pgno)?;
            let node = PageRef::new(bytes).node(idx)?;
            if node.flags().contains(NodeFlags::BIGDATA) {
                Some((node.overflow_pgno()?, node.logical_data_size()))
            } else {
                None
            }
        };

        // Same-shape values rewrite in place: no node movement, no page
        // churn. The freelist writer depends on this to converge when it
        // rewrites its own records.
        if let Some((head, old_size)) = old_overflow {
            let psize = txn.psize();
            let npages = overflow_pages(psize, old_size);
            if overflow_pages(psize, data.len()) == npages && txn.dirty_top(head) {
                {
                    let run = txn.page_mut(head)?;
                    if !flags.contains(WriteFlags::RESERVE) {
                        run[PAGEHDRSZ..PAGEHDRSZ + data.len()].copy_from_slice(data);
                    }
                }
                let bytes = txn.page_mut(pgno)?;
                PageMut::new(bytes).set_node_data_size(idx, data.len())?;
                set_leaf_pos(mc, (pgno, idx));
                return Ok((pgno, idx));
            }
        } else {
            let same_len = {
                let bytes = txn.page_bytes(pgno)?;
                PageRef::new(bytes).node(idx)?.data_size() == data.len()
            };
            if same_len {
                let bytes = txn.page_mut(pgno)?;
                let mut pm = PageMut::new(bytes);
                let region = pm.node_data_mut(idx)?;
                if !flags.contains(WriteFlags::RESERVE) {
                    region.copy_from_slice(data);
                }
                set_leaf_pos(mc, (pgno, idx));
                return Ok((pgno, idx));
            }
        }

        // Shape changed: free an old run, then delete and reinsert.
        if let Some((head, size)) = old_overflow {
            let npages = overflow_pages(txn.psize(), size);
            txn.free_page_run(head, npages)?;
            txn.db_info_mut(dbi).overflow_pages -= npages as u64;
        }
        {
            let bytes = txn.page_mut(pgno)?;
            PageMut::new(bytes).delete_node(idx)?;
        }
        let item = build_leaf_item(txn, dbi, key, data, flags)?;
        let mut stack = StackRef::Main;
        let level = mc.snum - 1;
        insert_at_level(txn, mc, Target::Db(dbi), &mut stack, level, idx, item, 0, InsMode::Replace)?;
        return reseat(txn, mc, dbi, key);
    }

    // Dup-sort. Decide by the node's current representation.
    if flags.contains(WriteFlags::NO_OVERWRITE) {
        return Err(Error::KeyExist);
    }
    touch_stack(txn, mc, Target::Db(dbi), false)?;
    let pgno = mc.leaf_pg();
    let (nf, old_value, subinfo) = {
        let bytes = txn.page_bytes(pgno)?;
        let node = PageRef::new(bytes).node(idx)?;
        let nf = node.flags();
        if nf.contains(NodeFlags::SUBDATA) {
            (nf, Vec::new(), Some(DbInfo::read(node.data()?)?))
        } else if nf.contains(NodeFlags::DUPDATA) {
            (nf, node.data()?.to_vec(), None)
        } else {
            (nf, leaf_value(txn, node)?.to_vec(), None)
        }
    };

    if !nf.contains(NodeFlags::DUPDATA) {
        // Single inline value so far.
        match (ctx.dcmp)(data, &old_value) {
            std::cmp::Ordering::Equal => {
                return Err(Error::KeyExist);
            }
            _ => {}
        }
        if flags.contains(WriteFlags::APPEND_DUP)
            && (ctx.dcmp)(data, &old_value) != std::cmp::Ordering::Greater
        {
            return Err(Error::KeyExist);
        }
        // Two values now: build a sub-page (or go straight to a
        // sub-tree when they don't fit inline).
        let mut vals = vec![old_value.clone(), data.to_vec()];
        vals.sort_by(|a, b| (ctx.dcmp)(a, b));
        return rebuild_dup_node(txn, mc, dbi, ctx, idx, key, vals, data);
    }

    if nf.contains(NodeFlags::SUBDATA) {
        // Established sub-tree.
        let info = subinfo.expect("SUBDATA nodes carry a descriptor");
        return sub_tree_put(txn, mc, dbi, ctx, idx, info, data, flags);
    }

    // Sub-page of duplicates.
    let sp = PageRef::new(&old_value);
    let ksize = if sp.is_leaf2() { ctx.leaf2_ksize } else { 0 };
    let (dup_idx, dup_exact) = node_search(sp, data, ctx.dcmp, ksize)?;
    if dup_exact {
        return Err(Error::KeyExist);
    }
    if flags.contains(WriteFlags::APPEND_DUP) && dup_idx != sp.num_keys() {
        return Err(Error::KeyExist);
    }
    let mut vals = Vec::with_capacity(sp.num_keys() + 1);
    for i in 0..sp.num_keys() {
        vals.push(if sp.is_leaf2() {
            sp.leaf2_key(i, ksize)?.to_vec()
        } else {
            sp.node(i)?.key().to_vec()
        });
    }
    vals.insert(dup_idx, data.to_vec());
    rebuild_dup_node(txn, mc, dbi, ctx, idx, key, vals, data)
}

/// The sub-page size ceiling: half the inline node budget, so dup sets
/// convert to a real sub-tree before crowding out neighbors.
fn subpage_budget(psize: usize) -> usize {
    node_max(psize) / 2
}

/// Serialize `vals` as a sub-page (LEAF2 when they share one size and
/// the DB is DUP_FIXED).
fn build_subpage(vals: &[Vec<u8>], dupfixed: bool) -> Vec<u8> {
    let fixed = dupfixed
        && !vals.is_empty()
        && vals.iter().all(|v| v.len() == vals[0].len())
        && !vals[0].is_empty();
    let size = if fixed {
        PAGEHDRSZ + vals.iter().map(|v| v.len()).sum::<usize>()
    } else {
        PAGEHDRSZ
            + vals
                .iter()
                .map(|v| leaf_size(v, 0) + 2)
                .sum::<usize>()
    };
    let size = (size + 1) & !1;
    let mut buf = vec![0u8; size];
    let mut pm = PageMut::new(&mut buf);
    let flags = if fixed {
        PageFlags::LEAF | PageFlags::SUBP | PageFlags::LEAF2
    } else {
        PageFlags::LEAF | PageFlags::SUBP
    };
    pm.init(0, flags);
    for (i, v) in vals.iter().enumerate() {
        if fixed {
            pm.leaf2_insert(i, v).expect("sized for exactly these keys");
        } else {
            pm.insert_node(i, v, Some(NodeData::Data(&[])), None, NodeFlags::empty())
                .expect("sized for exactly these keys");
        }
    }
    buf
}

/// Re-store a dup set for `key`: as a sub-page if it fits the budget,
/// otherwise as a dedicated sub-tree.
#[allow(clippy::too_many_arguments)]
fn rebuild_dup_node(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    ctx: &TreeCtx,
    idx: usize,
    key: &[u8],
    vals: Vec<Vec<u8>>,
    inserted: &[u8],
) -> Result<(PageNo, usize)> {
    let psize = txn.psize();
    let dupfixed = ctx.flags.contains(DbFlags::DUP_FIXED);
    let subpage = build_subpage(&vals, dupfixed);

    if leaf_size(key, subpage.len()) <= subpage_budget(psize) {
        // Stay inline.
        {
            let pgno = mc.leaf_pg();
            let bytes = txn.page_mut(pgno)?;
            PageMut::new(bytes).delete_node(idx)?;
        }
        let item = OwnedNode {
            key: key.to_vec(),
            body: OwnedBody::Data(subpage),
            flags: NodeFlags::DUPDATA,
        };
        let mut stack = StackRef::Main;
        let level = mc.snum - 1;
        insert_at_level(txn, mc, Target::Db(dbi), &mut stack, level, idx, item, 0, InsMode::Replace)?;
        txn.db_info_mut(dbi).entries += 1;
        let pos = reseat(txn, mc, dbi, key)?;
        mc.sub_init(txn, ctx, false)?;
        mc.sub_seek(txn, ctx, inserted, false)?;
        return Ok(pos);
    }

    // Promote to a sub-tree.
    let fixed = dupfixed && vals.iter().all(|v| v.len() == vals[0].len());
    let root = txn.alloc_pages(1)?;
    {
        let bytes = txn.page_mut(root)?;
        let mut pm = PageMut::new(bytes);
        let flags = if fixed {
            PageFlags::LEAF | PageFlags::LEAF2
        } else {
            PageFlags::LEAF
        };
        pm.init(root, flags);
        for (i, v) in vals.iter().enumerate() {
            if fixed {
                pm.leaf2_insert(i, v)?;
            } else {
                pm.insert_node(i, v, Some(NodeData::Data(&[])), None, NodeFlags::empty())?;
            }
        }
    }
    let mut info = DbInfo::new(
        (ctx.flags & DbFlags::PERSISTENT).persistent_bits(),
    );
    info.root = root;
    info.depth = 1;
    info.leaf_pages = 1;
    info.entries = vals.len() as u64;
    info.key_size = if fixed { vals[0].len() as u32 } else { 0 };

    {
        let pgno = mc.leaf_pg();
        let bytes = txn.page_mut(pgno)?;
        PageMut::new(bytes).delete_node(idx)?;
    }
    let item = OwnedNode {
        key: key.to_vec(),
        body: OwnedBody::Data(info.write().to_vec()),
        flags: NodeFlags::DUPDATA | NodeFlags::SUBDATA,
    };
    let mut stack = StackRef::Main;
    let level = mc.snum - 1;
    insert_at_level(txn, mc, Target::Db(dbi), &mut stack, level, idx, item, 0, InsMode::Replace)?;
    txn.db_info_mut(dbi).entries += 1;
    let pos = reseat(txn, mc, dbi, key)?;
    mc.sub_init(txn, ctx, false)?;
    mc.sub_seek(txn, ctx, inserted, false)?;
    Ok(pos)
}

/// Insert a duplicate into an established sub-tree, then write the
/// updated descriptor back into the parent node.
#[allow(clippy::too_many_arguments)]
fn sub_tree_put(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    ctx: &TreeCtx,
    idx: usize,
    info: DbInfo,
    data: &[u8],
    flags: WriteFlags,
) -> Result<(PageNo, usize)> {
    let pgno = mc.leaf_pg();
    {
        let sub = mc.sub.as_mut().ok_or(Error::Incompatible)?;
        sub.db = info;
        sub.active = true;
        if !matches!(sub.pos, DupPos::Tree(_)) {
            sub.pos = DupPos::Tree(Box::new(CursorInner::new(mc.dbi, mc.serial, false)));
        }
    }
    let sctx = sub_tree_ctx(ctx.flags, mc.sub.as_ref().unwrap());
    if sctx.leaf2_ksize != 0 && data.len() != sctx.leaf2_ksize {
        return Err(Error::BadValSize);
    }

    // Position inside the sub-tree.
    let (dup_idx, dup_exact) = if flags.contains(WriteFlags::APPEND_DUP) {
        // Caller promises order: land on the end and verify.
        let sub = mc.sub.as_mut().unwrap();
        let DupPos::Tree(t) = &mut sub.pos else {
            unreachable!()
        };
        let (leaf, _, _) = t.descend(txn, &sctx, Seek::Last)?;
        let n = leaf.num_keys();
        if n > 0 {
            let last = if leaf.is_leaf2() {
                leaf.leaf2_key(n - 1, sctx.leaf2_ksize)?
            } else {
                leaf.node(n - 1)?.key()
            };
            if (sctx.cmp)(data, last) != std::cmp::Ordering::Greater {
                return Err(Error::KeyExist);
            }
        }
        (n, false)
    } else {
        let sub = mc.sub.as_mut().unwrap();
        let DupPos::Tree(t) = &mut sub.pos else {
            unreachable!()
        };
        let (_, i, e) = t.descend(txn, &sctx, Seek::Key(data))?;
        t.ki[t.snum - 1] = i as u16;
        (i, e)
    };
    if dup_exact {
        return Err(Error::KeyExist);
    }

    touch_stack(txn, mc, Target::Sub, true)?;
    let item = OwnedNode {
        key: data.to_vec(),
        body: if sctx.leaf2_ksize != 0 {
            OwnedBody::None
        } else {
            OwnedBody::Data(Vec::new())
        },
        flags: NodeFlags::empty(),
    };
    let (level, ins_idx) = {
        let sub = mc.sub.as_ref().unwrap();
        let DupPos::Tree(t) = &sub.pos else { unreachable!() };
        (t.snum - 1, dup_idx)
    };
    let mut stack = StackRef::Sub;
    insert_at_level(
        txn,
        mc,
        Target::Sub,
        &mut stack,
        level,
        ins_idx,
        item,
        sctx.leaf2_ksize,
        InsMode::Insert,
    )?;
    {
        let sub = mc.sub.as_mut().unwrap();
        sub.db.entries += 1;
    }
    // Land the sub-cursor on the freshly inserted value; a fresh descent
    // sidesteps any in-flux frame state in the acting cursor.
    let sctx2 = sub_tree_ctx(ctx.flags, mc.sub.as_ref().unwrap());
    {
        let sub = mc.sub.as_mut().unwrap();
        let DupPos::Tree(t) = &mut sub.pos else { unreachable!() };
        let (_, i2, exact) = t.descend(txn, &sctx2, Seek::Key(data))?;
        if !exact {
            return Err(Error::Corrupted);
        }
        t.ki[t.snum - 1] = i2 as u16;
        sub.active = true;
    }
    txn.db_info_mut(dbi).entries += 1;
    write_back_sub_info(txn, mc, idx)?;
    Ok((pgno, idx))
}

/// Persist the sub descriptor into the parent leaf node's value bytes.
fn write_back_sub_info(txn: &mut WriteTxn<'_>, mc: &mut CursorInner, idx: usize) -> Result<()> {
    let info = mc.sub.as_ref().map(|s| s.db).ok_or(Error::Incompatible)?;
    let pgno = mc.leaf_pg();
    let bytes = txn.page_mut(pgno)?;
    let mut pm = PageMut::new(bytes);
    let region = pm.node_data_mut(idx)?;
    if region.len() != std::mem::size_of::<DbInfo>() {
        return Err(Error::Corrupted);
    }
    region.copy_from_slice(bytemuck::bytes_of(&info));
    Ok(())
}

// ---------------------------------------------------------------------
// Delete

fn cursor_del(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    flags: WriteFlags,
) -> Result<()> {
    let ctx = tree_ctx(txn, dbi)?;
    if !mc.initialized() || mc.flags.contains(CursorFlags::DEL) {
        return Err(Error::NotFound);
    }
    txn.spill(txn.op_need(ctx.depth, 0))?;
    touch_stack(txn, mc, Target::Db(dbi), false)?;

    let pgno = mc.leaf_pg();
    let idx = mc.leaf_ki();
    let (is_leaf2, nf) = {
        let bytes = txn.page_bytes(pgno)?;
        let page = PageRef::new(bytes);
        if idx >= page.num_keys() {
            return Err(Error::NotFound);
        }
        if page.is_leaf2() {
            (true, NodeFlags::empty())
        } else {
            (false, page.node(idx)?.flags())
        }
    };

    let dupsort = ctx.flags.contains(DbFlags::DUP_SORT);
    if dupsort && nf.contains(NodeFlags::DUPDATA) && !flags.contains(WriteFlags::NO_DUP_DATA) {
        return del_one_dup(txn, mc, dbi, &ctx, idx);
    }

    // Delete the whole entry, releasing whatever it owns.
    let removed: u64 = if nf.contains(NodeFlags::BIGDATA) {
        let (head, size) = {
            let bytes = txn.page_bytes(pgno)?;
            let node = PageRef::new(bytes).node(idx)?;
            (node.overflow_pgno()?, node.logical_data_size())
        };
        let npages = overflow_pages(txn.psize(), size);
        txn.free_page_run(head, npages)?;
        txn.db_info_mut(dbi).overflow_pages -= npages as u64;
        1
    } else if nf.contains(NodeFlags::SUBDATA) && nf.contains(NodeFlags::DUPDATA) {
        let info = {
            let bytes = txn.page_bytes(pgno)?;
            DbInfo::read(PageRef::new(bytes).node(idx)?.data()?)?
        };
        free_tree(txn, info.root)?;
        info.entries
    } else if nf.contains(NodeFlags::DUPDATA) {
        let bytes = txn.page_bytes(pgno)?;
        PageRef::new(PageRef::new(bytes).node(idx)?.data()?).num_keys() as u64
    } else {
        1
    };

    let leaf2 = if is_leaf2 { ctx.leaf2_ksize } else { 0 };
    let level = mc.snum - 1;
    delete_at_level(txn, mc, Target::Db(dbi), StackRef::Main, level, idx, leaf2)?;
    txn.db_info_mut(dbi).entries -= removed;
    mc.flags |= CursorFlags::DEL;
    if let Some(sub) = &mut mc.sub {
        sub.active = false;
    }
    Ok(())
}

/// Delete the single duplicate under the sub-cursor.
fn del_one_dup(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    ctx: &TreeCtx,
    idx: usize,
) -> Result<()> {
    let pgno = mc.leaf_pg();
    let key = {
        let bytes = txn.page_bytes(pgno)?;
        PageRef::new(bytes).node(idx)?.key().to_vec()
    };
    let sub_active = mc.sub.as_ref().map(|s| s.active).unwrap_or(false);
    if !sub_active {
        mc.sub_init(txn, ctx, false)?;
    }

    let is_tree = matches!(
        mc.sub.as_ref().map(|s| &s.pos),
        Some(DupPos::Tree(_))
    );
    if !is_tree {
        // Sub-page: rebuild the node without the current value.
        let (vals, ki) = {
            let sub = mc.sub.as_ref().ok_or(Error::Incompatible)?;
            let DupPos::Page { ki } = &sub.pos else {
                unreachable!()
            };
            let bytes = txn.page_bytes(pgno)?;
            let node = PageRef::new(bytes).node(idx)?;
            let sp = PageRef::new(node.data()?);
            let ksize = if sp.is_leaf2() { ctx.leaf2_ksize } else { 0 };
            let mut vals = Vec::with_capacity(sp.num_keys());
            for i in 0..sp.num_keys() {
                vals.push(if sp.is_leaf2() {
                    sp.leaf2_key(i, ksize)?.to_vec()
                } else {
                    sp.node(i)?.key().to_vec()
                });
            }
            (vals, *ki)
        };
        let mut vals = vals;
        if ki >= vals.len() {
            return Err(Error::Corrupted);
        }
        vals.remove(ki);
        txn.db_info_mut(dbi).entries -= 1;
        if vals.is_empty() {
            let level = mc.snum - 1;
            delete_at_level(txn, mc, Target::Db(dbi), StackRef::Main, level, idx, 0)?;
            mc.flags |= CursorFlags::DEL;
            if let Some(sub) = &mut mc.sub {
                sub.active = false;
            }
            return Ok(());
        }
        let (node_flags, body) = if vals.len() == 1 {
            // One left: demote to a plain inline value.
            (NodeFlags::empty(), OwnedBody::Data(vals.pop().unwrap()))
        } else {
            let dupfixed = ctx.flags.contains(DbFlags::DUP_FIXED);
            (
                NodeFlags::DUPDATA,
                OwnedBody::Data(build_subpage(&vals, dupfixed)),
            )
        };
        {
            let bytes = txn.page_mut(pgno)?;
            PageMut::new(bytes).delete_node(idx)?;
        }
        let item = OwnedNode {
            key: key.clone(),
            body,
            flags: node_flags,
        };
        let mut stack = StackRef::Main;
        let level = mc.snum - 1;
        insert_at_level(txn, mc, Target::Db(dbi), &mut stack, level, idx, item, 0, InsMode::Replace)?;
        reseat(txn, mc, dbi, &key)?;
        mc.sub_init(txn, ctx, false)?;
        if let Some(sub) = &mut mc.sub {
            if let DupPos::Page { ki: k } = &mut sub.pos {
                *k = ki.min(vals.len().saturating_sub(1));
            }
        }
        return Ok(());
    }

    // Sub-tree: delete through the sub stack, then shrink or demote.
    touch_stack(txn, mc, Target::Sub, true)?;
    {
        let (level, sidx) = {
            let sub = mc.sub.as_ref().unwrap();
            let DupPos::Tree(t) = &sub.pos else { unreachable!() };
            if !t.initialized() {
                return Err(Error::NotFound);
            }
            (t.snum - 1, t.leaf_ki())
        };
        let sctx = sub_tree_ctx(ctx.flags, mc.sub.as_ref().unwrap());
        delete_sub_level(txn, mc, level, sidx, sctx.leaf2_ksize)?;
    }
    {
        let sub = mc.sub.as_mut().unwrap();
        sub.db.entries -= 1;
    }
    txn.db_info_mut(dbi).entries -= 1;

    let entries = mc.sub.as_ref().unwrap().db.entries;
    if entries == 0 {
        // The dup set is gone; free its remaining root and the node.
        let root = mc.sub.as_ref().unwrap().db.root;
        if root != P_INVALID {
            free_tree(txn, root)?;
        }
        let level = mc.snum - 1;
        delete_at_level(txn, mc, Target::Db(dbi), StackRef::Main, level, idx, 0)?;
        mc.flags |= CursorFlags::DEL;
        if let Some(sub) = &mut mc.sub {
            sub.active = false;
        }
        return Ok(());
    }

    // Try to demote a now-small sub-tree back to an inline sub-page.
    maybe_demote_subtree(txn, mc, dbi, ctx, idx, &key)?;
    write_back_if_subtree(txn, mc)
}

fn delete_sub_level(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    level: usize,
    idx: usize,
    leaf2: usize,
) -> Result<()> {
    delete_at_level(txn, mc, Target::Sub, StackRef::Sub, level, idx, leaf2)
}

fn write_back_if_subtree(txn: &mut WriteTxn<'_>, mc: &mut CursorInner) -> Result<()> {
    // A demotion may have moved the node; trust the cursor's position.
    let idx = mc.leaf_ki();
    let still_tree = {
        let bytes = txn.page_bytes(mc.leaf_pg())?;
        let node = PageRef::new(bytes).node(idx)?;
        node.flags().contains(NodeFlags::SUBDATA)
    };
    if still_tree {
        write_back_sub_info(txn, mc, idx)?;
    }
    Ok(())
}

/// If a one-leaf sub-tree fits the sub-page budget again, pull it back
/// inline.
fn maybe_demote_subtree(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    dbi: Dbi,
    ctx: &TreeCtx,
    idx: usize,
    key: &[u8],
) -> Result<()> {
    let sub = mc.sub.as_ref().unwrap();
    let info = sub.db;
    if info.depth != 1 || info.root == P_INVALID {
        return Ok(());
    }
    let vals: Vec<Vec<u8>> = {
        let bytes = txn.page_bytes(info.root)?;
        let page = PageRef::new(bytes);
        let ksize = info.key_size as usize;
        let mut vals = Vec::with_capacity(page.num_keys());
        for i in 0..page.num_keys() {
            vals.push(if page.is_leaf2() {
                page.leaf2_key(i, ksize)?.to_vec()
            } else {
                page.node(i)?.key().to_vec()
            });
        }
        vals
    };
    let dupfixed = ctx.flags.contains(DbFlags::DUP_FIXED);
    let subpage = build_subpage(&vals, dupfixed);
    if leaf_size(key, subpage.len()) > subpage_budget(txn.psize()) {
        return Ok(());
    }

    free_tree(txn, info.root)?;
    {
        let pgno = mc.leaf_pg();
        let bytes = txn.page_mut(pgno)?;
        PageMut::new(bytes).delete_node(idx)?;
    }
    let item = OwnedNode {
        key: key.to_vec(),
        body: OwnedBody::Data(subpage),
        flags: NodeFlags::DUPDATA,
    };
    let mut stack = StackRef::Main;
    let level = mc.snum - 1;
    insert_at_level(txn, mc, Target::Db(dbi), &mut stack, level, idx, item, 0, InsMode::Replace)?;
    reseat(txn, mc, dbi, key)?;
    mc.sub_init(txn, ctx, false)?;
    Ok(())
}

/// Free every page reachable from `root`: child pages, overflow runs,
/// and nested dup sub-trees.
fn free_tree(txn: &mut WriteTxn<'_>, root: PageNo) -> Result<()> {
    if root == P_INVALID {
        return Ok(());
    }
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        let (children, overflows, subroots) = {
            let bytes = txn.page_bytes(pgno)?;
            let page = PageRef::new(bytes);
            let mut children = Vec::new();
            let mut overflows = Vec::new();
            let mut subroots = Vec::new();
            if page.is_branch() {
                for i in 0..page.num_keys() {
                    children.push(page.node(i)?.child_pgno());
                }
            } else if !page.is_leaf2() {
                for i in 0..page.num_keys() {
                    let node = page.node(i)?;
                    let nf = node.flags();
                    if nf.contains(NodeFlags::BIGDATA) {
                        overflows.push((node.overflow_pgno()?, node.logical_data_size()));
                    } else if nf.contains(NodeFlags::SUBDATA) {
                        subroots.push(DbInfo::read(node.data()?)?.root);
                    }
                }
            }
            (children, overflows, subroots)
        };
        stack.extend(children);
        stack.extend(subroots.into_iter().filter(|r| *r != P_INVALID));
        for (head, size) in overflows {
            let npages = overflow_pages(txn.psize(), size);
            txn.free_page_run(head, npages)?;
        }
        txn.free_page_run(pgno, 1)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Named database management and the WriteTxn data API

impl<'env> WriteTxn<'env> {
    /// Open (or with [`DbFlags::CREATE`] create) a named database.
    /// `None` opens the default key space.
    pub fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Dbi> {
        open_db_write(self, name, flags)
    }

    /// Open a cursor. It stays patched through every structural change
    /// this transaction makes.
    pub fn cursor(&mut self, db: Dbi) -> Result<Cursor> {
        Cursor::new_tracked(self, db)
    }

    /// Shorthand single put through a scratch cursor.
    pub fn put(&mut self, db: Dbi, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let mut c = Cursor::new_tracked(self, db)?;
        c.put(self, key, data, flags)
    }

    /// Look up `key`.
    pub fn get(&self, db: Dbi, key: &[u8]) -> Result<&[u8]> {
        super::read::txn_get(self, db, key)
    }

    /// Delete `key` (with `data`: that one duplicate).
    pub fn del(&mut self, db: Dbi, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        let mut c = Cursor::new_tracked(self, db)?;
        match data {
            Some(d) => {
                c.get_both(self, key, d)?;
                c.del(self, WriteFlags::empty())
            }
            None => {
                c.set(self, key)?;
                c.del(self, WriteFlags::NO_DUP_DATA)
            }
        }
    }

    pub fn db_stat(&self, db: Dbi) -> Result<crate::db::DbStat> {
        let (info, _, state) = self.db_snapshot(db)?;
        if !state.contains(TxnDbFlags::VALID) {
            return Err(Error::BadDbi);
        }
        Ok(crate::db::DbStat::from_info(self.psize(), &info))
    }

    pub fn db_flags_of(&self, db: Dbi) -> Result<DbFlags> {
        let (_, flags, state) = self.db_snapshot(db)?;
        if !state.contains(TxnDbFlags::VALID) {
            return Err(Error::BadDbi);
        }
        Ok(flags)
    }

    /// Delete every entry of `db`. With `delete`, also remove the named
    /// database itself and close its handle.
    pub fn drop_db(&mut self, db: Dbi, delete: bool) -> Result<()> {
        self.check_ok()?;
        let (info, _, state) = self.db_snapshot(db)?;
        if !state.contains(TxnDbFlags::VALID) {
            return Err(Error::BadDbi);
        }
        if delete && (db as usize) < CORE_DBS {
            return Err(Error::Incompatible);
        }
        free_tree(self, info.root)?;
        {
            let info = self.db_info_mut(db);
            let flags = info.flags;
            let ksize = info.key_size;
            *info = DbInfo::new(flags);
            info.key_size = ksize;
        }
        if delete {
            let name = {
                let reg = self.env.inner.dbs.read().unwrap();
                reg.slot(db)?.name.clone().ok_or(Error::BadDbi)?
            };
            // Remove the record naming this tree from the main DB.
            let mut c = Cursor::new_tracked(self, MAIN_DBI as Dbi)?;
            c.set(self, name.as_bytes())?;
            {
                let inner = c.inner.clone();
                let mut mc = inner.borrow_mut();
                cursor_del_plain_record(self, &mut mc)?;
            }
            self.top_mut().dbs[db as usize].state = TxnDbFlags::empty();
            self.env.inner.dbs.write().unwrap().close(db);
        }
        Ok(())
    }
}

/// Delete the record under the cursor without any dup handling; used for
/// named-DB records in the main tree.
fn cursor_del_plain_record(txn: &mut WriteTxn<'_>, mc: &mut CursorInner) -> Result<()> {
    touch_stack(txn, mc, Target::Db(MAIN_DBI as Dbi), false)?;
    let idx = mc.leaf_ki();
    let level = mc.snum - 1;
    delete_at_level(txn, mc, Target::Db(MAIN_DBI as Dbi), StackRef::Main, level, idx, 0)?;
    txn.db_info_mut(MAIN_DBI as Dbi).entries -= 1;
    Ok(())
}

/// Open or create a named database in a write transaction.
pub(crate) fn open_db_write(
    txn: &mut WriteTxn<'_>,
    name: Option<&str>,
    flags: DbFlags,
) -> Result<Dbi> {
    txn.check_ok()?;
    let Some(name) = name else {
        return Ok(MAIN_DBI as Dbi);
    };
    if name.is_empty() || name.len() > crate::MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    let valid_combo = !(flags.contains(DbFlags::INTEGER_KEY) && flags.contains(DbFlags::REVERSE_KEY));
    if !valid_combo {
        return Err(Error::Incompatible);
    }

    // Fast path: handle already exists.
    let existing = {
        let reg = txn.env.inner.dbs.read().unwrap();
        reg.find(name).map(|(dbi, slot)| (dbi, slot.flags))
    };
    if let Some((dbi, stored_flags)) = existing {
        if (dbi as usize) < txn.top().dbs.len() {
            let d = &txn.top().dbs[dbi as usize];
            if d.state.contains(TxnDbFlags::VALID) {
                crate::db::check_open_flags(flags, stored_flags.persistent_bits())?;
                return Ok(dbi);
            }
        }
    }

    // Resolve against this snapshot.
    match super::read::find_named_db(txn, name)? {
        Some(info) => {
            let stored = crate::db::check_open_flags(flags, info.flags)?;
            let dbi = {
                let mut reg = txn.env.inner.dbs.write().unwrap();
                match reg.find(name) {
                    Some((dbi, _)) => dbi,
                    None => reg.claim(name, stored)?,
                }
            };
            grow_write_txn_dbs(txn, dbi, info, stored, TxnDbFlags::VALID);
            Ok(dbi)
        }
        None if flags.contains(DbFlags::CREATE) => {
            let persist = flags & DbFlags::PERSISTENT;
            let info = DbInfo::new(persist.persistent_bits());
            // The record is a SUBDATA node in the main tree.
            let mut c = Cursor::new_tracked(txn, MAIN_DBI as Dbi)?;
            {
                let inner = c.inner.clone();
                let mut mc = inner.borrow_mut();
                put_subdb_record(txn, &mut mc, name.as_bytes(), &info)?;
            }
            drop(c);
            let dbi = {
                let mut reg = txn.env.inner.dbs.write().unwrap();
                reg.claim(name, persist)?
            };
            grow_write_txn_dbs(
                txn,
                dbi,
                info,
                persist,
                TxnDbFlags::VALID | TxnDbFlags::NEW | TxnDbFlags::DIRTY,
            );
            log::debug!("txn {}: created db '{}'", txn.id(), name);
            Ok(dbi)
        }
        None => Err(Error::NotFound),
    }
}

fn grow_write_txn_dbs(
    txn: &mut WriteTxn<'_>,
    dbi: Dbi,
    info: DbInfo,
    flags: DbFlags,
    state: TxnDbFlags,
) {
    let dbs = &mut txn.top_mut().dbs;
    while dbs.len() <= dbi as usize {
        dbs.push(crate::txn::TxnDb {
            info: DbInfo::new(0),
            flags: DbFlags::empty(),
            state: TxnDbFlags::empty(),
        });
    }
    let d = &mut dbs[dbi as usize];
    d.info = info;
    d.flags = flags;
    d.state = state;
}

/// Upsert a named-DB record (`SUBDATA` node) in the main tree.
fn put_subdb_record(
    txn: &mut WriteTxn<'_>,
    mc: &mut CursorInner,
    name: &[u8],
    info: &DbInfo,
) -> Result<()> {
    let ctx = tree_ctx(txn, MAIN_DBI as Dbi)?;
    txn.spill(txn.op_need(ctx.depth, name.len() + 64))?;

    if ctx.root == P_INVALID {
        let root = txn.alloc_pages(1)?;
        {
            let bytes = txn.page_mut(root)?;
            PageMut::new(bytes).init(root, PageFlags::LEAF);
        }
        {
            let i = txn.db_info_mut(MAIN_DBI as Dbi);
            i.root = root;
            i.depth = 1;
            i.leaf_pages = 1;
        }
        mc.snum = 1;
        mc.pg[0] = root;
        mc.ki[0] = 0;
        mc.flags = CursorFlags::INITIALIZED;
        let item = OwnedNode {
            key: name.to_vec(),
            body: OwnedBody::Data(info.write().to_vec()),
            flags: NodeFlags::SUBDATA,
        };
        let mut stack = StackRef::Main;
        insert_at_level(txn, mc, Target::Db(MAIN_DBI as Dbi), &mut stack, 0, 0, item, 0, InsMode::Insert)?;
        txn.db_info_mut(MAIN_DBI as Dbi).entries += 1;
        return Ok(());
    }

    let (_, idx, exact) = mc.descend(txn, &ctx, Seek::Key(name))?;
    touch_stack(txn, mc, Target::Db(MAIN_DBI as Dbi), false)?;
    if exact {
        mc.ki[mc.snum - 1] = idx as u16;
        let ok = {
            let bytes = txn.page_bytes(mc.leaf_pg())?;
            let node = PageRef::new(bytes).node(idx)?;
            super::node_is_subdb(node.flags())
        };
        if !ok {
            return Err(Error::Incompatible);
        }
        let pgno = mc.leaf_pg();
        let bytes = txn.page_mut(pgno)?;
        let mut pm = PageMut::new(bytes);
        let region = pm.node_data_mut(idx)?;
        if region.len() != std::mem::size_of::<DbInfo>() {
            return Err(Error::Corrupted);
        }
        region.copy_from_slice(bytemuck::bytes_of(info));
        return Ok(());
    }
    let item = OwnedNode {
        key: name.to_vec(),
        body: OwnedBody::Data(info.write().to_vec()),
        flags: NodeFlags::SUBDATA,
    };
    let mut stack = StackRef::Main;
    let level = mc.snum - 1;
    insert_at_level(txn, mc, Target::Db(MAIN_DBI as Dbi), &mut stack, level, idx, item, 0, InsMode::Insert)?;
    txn.db_info_mut(MAIN_DBI as Dbi).entries += 1;
    Ok(())
}

/// Write every changed named-DB descriptor back into the main tree;
/// runs as the first step of commit.
pub(crate) fn flush_named_dbs(txn: &mut WriteTxn<'_>) -> Result<()> {
    let count = txn.top().dbs.len();
    for dbi in CORE_DBS..count {
        let (dirty, valid) = {
            let d = &txn.top().dbs[dbi];
            (
                d.state.contains(TxnDbFlags::DIRTY),
                d.state.contains(TxnDbFlags::VALID),
            )
        };
        if !dirty || !valid {
            continue;
        }
        let name = {
            let reg = txn.env.inner.dbs.read().unwrap();
            match reg.slot(dbi as Dbi).ok().and_then(|s| s.name.clone()) {
                Some(n) => n,
                None => continue,
            }
        };
        let info = txn.top().dbs[dbi].info;
        let mut c = Cursor::new_tracked(txn, MAIN_DBI as Dbi)?;
        {
            let inner = c.inner.clone();
            let mut mc = inner.borrow_mut();
            put_subdb_record(txn, &mut mc, name.as_bytes(), &info)?;
        }
        drop(c);
        txn.top_mut().dbs[dbi].state &= !TxnDbFlags::DIRTY;
    }
    Ok(())
}
