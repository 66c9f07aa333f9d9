//! Transactions: snapshots, the dirty/spill machinery, commit and abort.
//!
//! A read transaction pins a snapshot by publishing its txnid in a reader
//! slot and never blocks a writer. The write transaction is exclusive
//! (in-process mutex plus the cross-process writer lock) and builds its
//! next tree version out of copy-on-write pages collected on a dirty
//! list. Nested write transactions are frames stacked inside the one
//! `WriteTxn`: a child frame shadows dirty pages by page number and is
//! merged down or discarded, which makes "parent and child never overlap
//! in time" structural rather than a runtime rule.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

use crate::cursor::{Cursor, CursorInner};
use crate::db::{DbFlags, DbStat, Dbi, TxnDbFlags};
use crate::env::{Env, EnvFlags, EnvInner, WriterScratch};
use crate::error::{Error, Result};
use crate::idl::{Id2Insert, Id2List, IdList, IDL_UM_MAX};
use crate::lock::{current_tid, TXNID_UNSET};
use crate::meta::{DbInfo, Meta, CORE_DBS, FREE_DBI, MAIN_DBI};
use crate::page::{PageFlags, PageRef, PAGEHDRSZ};
use crate::{PageNo, TxnId, P_INVALID};

/// One database's state inside a transaction.
#[derive(Clone, Debug)]
pub(crate) struct TxnDb {
    pub info: DbInfo,
    pub flags: DbFlags,
    pub state: TxnDbFlags,
}

/// A page owned by the write transaction.
pub(crate) struct DirtyPage {
    /// Heap image of the page run; `None` when WRITE_MAP mutates the map
    /// directly.
    pub buf: Option<Box<[u64]>>,
    /// Pages in the run (>1 for overflow).
    pub npages: usize,
    /// Pinned by the current operation; the spiller must skip it.
    pub keep: bool,
}

impl DirtyPage {
    pub fn bytes(&self) -> Option<&[u8]> {
        self.buf.as_deref().map(bytemuck::cast_slice)
    }
}

/// One nesting level of the write transaction.
pub(crate) struct TxnFrame {
    pub dirty: Id2List<DirtyPage>,
    /// Spilled page numbers, shifted left one bit; low bit = unspilled
    /// again ("reclaimed"), entry to be dropped lazily.
    pub spill: Vec<u64>,
    /// Pages freed against the committed snapshot; keyed by this txnid
    /// in the freelist tree at commit.
    pub free_pgs: IdList,
    /// Pages allocated and freed inside this txn, reusable immediately.
    pub loose: Vec<PageNo>,
    pub dirty_room: usize,
    pub next_pgno: PageNo,
    pub dbs: Vec<TxnDb>,
    /// Tracked-cursor states at frame creation, for abort restore.
    shadow: Vec<(u64, CursorInner)>,
    /// Reclaim-accumulator state at frame creation.
    acc_snapshot: Option<(IdList, TxnId, usize)>,
}

impl TxnFrame {
    fn spill_contains(&self, pgno: PageNo) -> bool {
        let key = pgno << 1;
        self.spill
            .binary_search_by(|probe| (probe & !1).cmp(&key))
            .map(|i| self.spill[i] & 1 == 0)
            .unwrap_or(false)
    }
}

/// A read-only transaction: a consistent snapshot of the environment.
pub struct ReadTxn {
    pub(crate) env: Env,
    pub(crate) id: TxnId,
    pub(crate) serial: u64,
    pub(crate) dbs: Vec<TxnDb>,
    /// Highest page of the pinned snapshot, for the copy utilities.
    last_pgno: PageNo,
    slot: Option<usize>,
    finished: bool,
}

/// The write transaction. At most one exists per environment.
pub struct WriteTxn<'env> {
    pub(crate) env: &'env Env,
    pub(crate) id: TxnId,
    pub(crate) serial: u64,
    pub(crate) frames: Vec<TxnFrame>,
    pub(crate) scratch: MutexGuard<'env, WriterScratch>,
    /// Freelist record keys consumed into the accumulator this txn.
    pub(crate) consumed: Vec<TxnId>,
    /// Cached oldest-reader bound; recomputed lazily once per txn.
    pub(crate) oldest: Option<TxnId>,
    /// Set while the freelist is being persisted: allocation must not
    /// touch the freelist tree or the accumulator.
    pub(crate) saving_freelist: bool,
    pub(crate) errored: bool,
    pub(crate) cursors: Vec<Weak<RefCell<CursorInner>>>,
    committed: bool,
}

pub(crate) mod sealed {
    pub trait Sealed {}
    impl Sealed for super::ReadTxn {}
    impl Sealed for super::WriteTxn<'_> {}
}

/// Read-side view shared by both transaction kinds. Cursor navigation is
/// generic over it; the hidden methods are implementation plumbing.
pub trait TxnRead: sealed::Sealed {
    /// The snapshot's transaction id.
    fn id(&self) -> TxnId;

    #[doc(hidden)]
    fn env_handle(&self) -> &Env;

    #[doc(hidden)]
    fn serial(&self) -> u64;

    /// Bytes of the page run starting at `pgno` (one page, or a whole
    /// overflow run).
    #[doc(hidden)]
    fn page_bytes(&self, pgno: PageNo) -> Result<&[u8]>;

    #[doc(hidden)]
    fn db_snapshot(&self, dbi: Dbi) -> Result<(DbInfo, DbFlags, TxnDbFlags)>;

    #[doc(hidden)]
    fn is_writer(&self) -> bool;
}

fn map_page_run<'a>(env: &'a EnvInner, pgno: PageNo) -> Result<&'a [u8]> {
    let psize = env.psize;
    let one = env.map_bytes(pgno as usize * psize, psize)?;
    let pr = PageRef::new(one);
    if pr.flags().contains(PageFlags::OVERFLOW) {
        let n = pr.overflow_count();
        if n > 1 {
            return env.map_bytes(pgno as usize * psize, n * psize);
        }
    }
    Ok(one)
}

impl TxnRead for ReadTxn {
    fn id(&self) -> TxnId {
        self.id
    }

    fn env_handle(&self) -> &Env {
        &self.env
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn page_bytes(&self, pgno: PageNo) -> Result<&[u8]> {
        if self.finished {
            return Err(Error::BadTxn);
        }
        map_page_run(&self.env.inner, pgno)
    }

    fn db_snapshot(&self, dbi: Dbi) -> Result<(DbInfo, DbFlags, TxnDbFlags)> {
        let d = self.dbs.get(dbi as usize).ok_or(Error::BadDbi)?;
        Ok((d.info, d.flags, d.state))
    }

    fn is_writer(&self) -> bool {
        false
    }
}

impl TxnRead for WriteTxn<'_> {
    fn id(&self) -> TxnId {
        self.id
    }

    fn env_handle(&self) -> &Env {
        self.env
    }

    fn serial(&self) -> u64 {
        self.serial
    }

    fn page_bytes(&self, pgno: PageNo) -> Result<&[u8]> {
        // Newest frame wins: a child's shadow hides the parent's image.
        for frame in self.frames.iter().rev() {
            if let Some(dp) = frame.dirty.get(pgno) {
                match dp.bytes() {
                    Some(b) => return Ok(b),
                    None => break, // WRITE_MAP: image lives in the map
                }
            }
        }
        map_page_run(&self.env.inner, pgno)
    }

    fn db_snapshot(&self, dbi: Dbi) -> Result<(DbInfo, DbFlags, TxnDbFlags)> {
        let d = self.top().dbs.get(dbi as usize).ok_or(Error::BadDbi)?;
        Ok((d.info, d.flags, d.state))
    }

    fn is_writer(&self) -> bool {
        true
    }
}

fn snapshot_dbs(env: &Env, meta: &Meta) -> Vec<TxnDb> {
    let reg = env.inner.dbs.read().unwrap();
    let mut dbs = Vec::with_capacity(reg.len());
    for i in 0..reg.len() {
        let slot = reg.slot(i as Dbi).ok();
        let (flags, valid) = match slot {
            Some(s) => (s.flags, true),
            None => (DbFlags::empty(), false),
        };
        let (info, state) = if i < CORE_DBS {
            (meta.dbs[i], TxnDbFlags::VALID)
        } else if valid {
            // Named trees re-resolve their descriptor on first use.
            (
                DbInfo::new(flags.persistent_bits()),
                TxnDbFlags::VALID | TxnDbFlags::STALE,
            )
        } else {
            (DbInfo::new(0), TxnDbFlags::empty())
        };
        dbs.push(TxnDb {
            info,
            flags: match i {
                0 => DbFlags::INTEGER_KEY,
                _ => flags,
            },
            state,
        });
    }
    dbs
}

impl ReadTxn {
    pub(crate) fn begin(env: &Env) -> Result<ReadTxn> {
        let inner = &env.inner;
        if inner.fatal.load(Ordering::SeqCst) {
            return Err(Error::Panic);
        }
        let slot = match &inner.readers {
            Some(table) => {
                let _guard = inner.reader_alloc.lock().unwrap();
                let mut slot = table.claim_slot(std::process::id(), current_tid());
                if matches!(slot, Err(Error::ReadersFull)) && table.check_stale()? > 0 {
                    slot = table.claim_slot(std::process::id(), current_tid());
                }
                Some(slot?)
            }
            None => None,
        };
        // Counted before construction: Drop always decrements.
        inner.live_txns.fetch_add(1, Ordering::SeqCst);
        let mut txn = ReadTxn {
            env: env.clone(),
            id: 0,
            serial: inner.txn_serial.fetch_add(1, Ordering::SeqCst),
            dbs: Vec::new(),
            last_pgno: 0,
            slot,
            finished: true,
        };
        txn.pin_snapshot()?;
        crate::cursor::resolve_stale_read(&mut txn)?;
        Ok(txn)
    }

    /// Publish our txnid and take the matching snapshot. Loops until the
    /// published claim and the meta agree, so a concurrent commit can't
    /// slip a snapshot out from under the claim.
    fn pin_snapshot(&mut self) -> Result<()> {
        let inner = &self.env.inner;
        let meta = loop {
            let meta = inner.pick_meta()?;
            if let (Some(slot), Some(table)) = (self.slot, inner.readers.as_ref()) {
                table.set_slot_txnid(slot, meta.txnid);
                let again = inner.pick_meta()?;
                if again.txnid != meta.txnid {
                    continue;
                }
                break again;
            }
            break meta;
        };
        if (meta.last_pgno + 1) > inner.map_pages() {
            if let (Some(slot), Some(table)) = (self.slot, inner.readers.as_ref()) {
                table.set_slot_txnid(slot, TXNID_UNSET);
            }
            return Err(Error::MapResized);
        }
        self.id = meta.txnid;
        self.last_pgno = meta.last_pgno;
        self.dbs = snapshot_dbs(&self.env, &meta);
        self.finished = false;
        Ok(())
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub(crate) fn snapshot_last_pgno(&self) -> PageNo {
        self.last_pgno
    }

    /// Release the snapshot claim but keep the reader slot for a cheap
    /// [`renew`](Self::renew).
    pub fn reset(&mut self) {
        if !self.finished {
            if let (Some(slot), Some(table)) = (self.slot, self.env.inner.readers.as_ref()) {
                table.set_slot_txnid(slot, TXNID_UNSET);
            }
            self.finished = true;
        }
    }

    /// Re-pin the newest snapshot after a [`reset`](Self::reset).
    pub fn renew(&mut self) -> Result<()> {
        if !self.finished {
            return Err(Error::BadTxn);
        }
        self.serial = self
            .env
            .inner
            .txn_serial
            .fetch_add(1, Ordering::SeqCst);
        self.pin_snapshot()?;
        crate::cursor::resolve_stale_read(self)
    }

    /// Open a named database. The handle stays valid for the
    /// environment's lifetime.
    pub fn open_db(&mut self, name: Option<&str>) -> Result<Dbi> {
        crate::cursor::open_db_read(self, name)
    }

    /// Look up `key` in `db`.
    pub fn get(&self, db: Dbi, key: &[u8]) -> Result<&[u8]> {
        crate::cursor::txn_get(self, db, key)
    }

    /// Open a cursor over `db`.
    pub fn cursor(&self, db: Dbi) -> Result<Cursor> {
        Cursor::new_untracked(self, db)
    }

    pub fn db_stat(&self, db: Dbi) -> Result<DbStat> {
        let d = self.dbs.get(db as usize).ok_or(Error::BadDbi)?;
        if !d.state.contains(TxnDbFlags::VALID) {
            return Err(Error::BadDbi);
        }
        Ok(DbStat::from_info(self.env.inner.psize, &d.info))
    }

    pub fn db_flags(&self, db: Dbi) -> Result<DbFlags> {
        Ok(self.dbs.get(db as usize).ok_or(Error::BadDbi)?.flags)
    }

    /// Finish the transaction. Equivalent to dropping it.
    pub fn abort(self) {}
}

impl Drop for ReadTxn {
    fn drop(&mut self) {
        self.reset();
        if let (Some(slot), Some(table)) = (self.slot, self.env.inner.readers.as_ref()) {
            table.release_slot(slot);
        }
        self.env.inner.live_txns.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'env> WriteTxn<'env> {
    pub(crate) fn begin(env: &'env Env) -> Result<WriteTxn<'env>> {
        let inner = &env.inner;
        if inner.fatal.load(Ordering::SeqCst) {
            return Err(Error::Panic);
        }
        if inner.flags.contains(EnvFlags::READ_ONLY) {
            return Err(Error::InvalidArg);
        }
        // In-process exclusion first, then the cross-process byte.
        let mut scratch = inner.writer.lock().unwrap();
        // The reclaim accumulator is per-txn state; each writer reads the
        // freelist tree afresh.
        scratch.free_acc.clear();
        scratch.last_reclaimed = 0;
        if let Some(table) = &inner.readers {
            table.writer_lock()?;
        }
        let meta = match inner.pick_meta() {
            Ok(m) => m,
            Err(e) => {
                if let Some(table) = &inner.readers {
                    let _ = table.writer_unlock();
                }
                return Err(e);
            }
        };
        let id = meta.txnid + 1;
        let frame = TxnFrame {
            dirty: Id2List::new(),
            spill: Vec::new(),
            free_pgs: IdList::new(),
            loose: Vec::new(),
            dirty_room: IDL_UM_MAX,
            next_pgno: meta.last_pgno + 1,
            dbs: snapshot_dbs(env, &meta),
            shadow: Vec::new(),
            acc_snapshot: None,
        };
        inner.live_txns.fetch_add(1, Ordering::SeqCst);
        log::debug!("write txn {} begins at pgno {}", id, frame.next_pgno);
        let mut txn = WriteTxn {
            env,
            id,
            serial: inner.txn_serial.fetch_add(1, Ordering::SeqCst),
            frames: vec![frame],
            scratch,
            consumed: Vec::new(),
            oldest: None,
            saving_freelist: false,
            errored: false,
            cursors: Vec::new(),
            committed: false,
        };
        crate::cursor::resolve_stale_write(&mut txn)?;
        Ok(txn)
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    #[inline]
    pub(crate) fn top(&self) -> &TxnFrame {
        self.frames.last().expect("txn has at least one frame")
    }

    #[inline]
    pub(crate) fn top_mut(&mut self) -> &mut TxnFrame {
        self.frames.last_mut().expect("txn has at least one frame")
    }

    pub(crate) fn check_ok(&self) -> Result<()> {
        if self.errored {
            Err(Error::BadTxn)
        } else {
            Ok(())
        }
    }

    /// The environment page size.
    pub(crate) fn psize(&self) -> usize {
        self.env.inner.psize
    }

    // ------------------------------------------------------------------
    // Page access

    /// Is this page dirty in any frame?
    pub(crate) fn dirty_anywhere(&self, pgno: PageNo) -> bool {
        self.frames.iter().any(|f| f.dirty.get(pgno).is_some())
    }

    /// Is this page dirty in the newest frame (and thus writable)?
    pub(crate) fn dirty_top(&self, pgno: PageNo) -> bool {
        self.top().dirty.get(pgno).is_some()
    }

    /// Mutable image of a page that is dirty in the top frame.
    pub(crate) fn page_mut(&mut self, pgno: PageNo) -> Result<&mut [u8]> {
        let env = self.env;
        let writemap = env.inner.flags.contains(EnvFlags::WRITE_MAP);
        let psize = env.inner.psize;
        let frame = self.frames.last_mut().unwrap();
        let Some(dp) = frame.dirty.get_mut(pgno) else {
            return Err(Error::PageNotFound);
        };
        match (&mut dp.buf, writemap) {
            (Some(buf), _) => Ok(bytemuck::cast_slice_mut(&mut buf[..])),
            (None, true) => {
                let len = dp.npages * psize;
                env.inner.map_bytes_mut(pgno as usize * psize, len)
            }
            (None, false) => Err(Error::Corrupted),
        }
    }

    /// Allocate a zeroed (unless NO_MEM_INIT) buffer for `npages`.
    pub(crate) fn new_page_buf(&mut self, npages: usize) -> Box<[u64]> {
        let words = npages * self.env.inner.psize / 8;
        let meminit = !self.env.inner.flags.contains(EnvFlags::NO_MEM_INIT);
        if let Some(mut buf) = self.scratch.buf_pool.pop() {
            if buf.len() == words {
                if meminit {
                    buf.fill(0);
                } else {
                    // Recycled image: stale bytes are prior page content.
                    buf[..PAGEHDRSZ / 8].fill(0);
                }
                return buf;
            }
        }
        vec![0u64; words].into_boxed_slice()
    }

    pub(crate) fn pool_buf(&mut self, buf: Box<[u64]>) {
        if buf.len() == self.env.inner.psize / 8 && self.scratch.buf_pool.len() < 256 {
            self.scratch.buf_pool.push(buf);
        }
    }

    /// Register a fresh page run as dirty in the top frame.
    pub(crate) fn add_dirty(&mut self, pgno: PageNo, npages: usize) -> Result<()> {
        let writemap = self.env.inner.flags.contains(EnvFlags::WRITE_MAP);
        let buf = if writemap {
            None
        } else {
            Some(self.new_page_buf(npages))
        };
        let frame = self.frames.last_mut().unwrap();
        if frame.dirty_room == 0 {
            return Err(Error::TxnFull);
        }
        match frame.dirty.insert(
            pgno,
            DirtyPage {
                buf,
                npages,
                keep: false,
            },
            IDL_UM_MAX,
        ) {
            Id2Insert::Inserted => {
                frame.dirty_room -= 1;
                Ok(())
            }
            Id2Insert::Duplicate => Err(Error::Corrupted),
            Id2Insert::Full => Err(Error::TxnFull),
        }
    }

    // ------------------------------------------------------------------
    // Copy-on-write

    /// Make `pgno` writable in the top frame, returning the page number
    /// the caller must now use (a new one when the page was COWed).
    ///
    /// The caller patches parent pointers and cursor stacks.
    pub(crate) fn cow_page(&mut self, pgno: PageNo) -> Result<PageNo> {
        if self.dirty_top(pgno) {
            return Ok(pgno);
        }

        // Unspill: the page was written out earlier in this txn.
        if self.top().spill_contains(pgno) {
            self.unspill(pgno)?;
            return Ok(pgno);
        }

        // Shadow a page that's dirty in an ancestor frame: same number,
        // fresh image in the child.
        if self.frames.len() > 1 && self.dirty_anywhere(pgno) {
            let src = self.page_bytes(pgno)?.to_vec();
            self.add_dirty(pgno, src.len() / self.psize())?;
            self.page_mut(pgno)?.copy_from_slice(&src);
            return Ok(pgno);
        }

        // Clean page: true COW. The old page returns to the free pool.
        let src = self.page_bytes(pgno)?.to_vec();
        let npages = src.len() / self.psize();
        let newp = self.alloc_pages(npages)?;
        {
            let dst = self.page_mut(newp)?;
            dst.copy_from_slice(&src);
            let mut pm = crate::page::PageMut::new(dst);
            pm.set_pgno(newp);
        }
        self.free_page_run(pgno, npages)?;
        log::trace!("txn {}: cow {} -> {}", self.id, pgno, newp);
        Ok(newp)
    }

    /// Bring a spilled page back onto the dirty list, flagging its spill
    /// entry for lazy removal.
    fn unspill(&mut self, pgno: PageNo) -> Result<()> {
        let src = self.page_bytes(pgno)?.to_vec();
        let npages = src.len() / self.psize();
        self.add_dirty(pgno, npages)?;
        self.page_mut(pgno)?.copy_from_slice(&src);
        let frame = self.frames.last_mut().unwrap();
        if let Ok(i) = frame
            .spill
            .binary_search_by(|probe| (probe & !1).cmp(&(pgno << 1)))
        {
            frame.spill[i] |= 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Freeing

    /// Free a page run belonging to the current tree version.
    pub(crate) fn free_page_run(&mut self, pgno: PageNo, npages: usize) -> Result<()> {
        let in_ancestor = self.frames[..self.frames.len() - 1]
            .iter()
            .any(|f| f.dirty.get(pgno).is_some() || f.spill_contains(pgno));
        let dirty_here = self.dirty_top(pgno);

        if dirty_here && !in_ancestor {
            // This txn made the page; nobody else can reference it.
            let frame = self.frames.last_mut().unwrap();
            let dp = frame.dirty.remove(pgno).unwrap();
            frame.dirty_room += 1;
            if let Some(buf) = dp.buf {
                self.pool_buf(buf);
            }
            if npages == 1 {
                let frame = self.frames.last_mut().unwrap();
                frame.loose.push(pgno);
                log::trace!("txn {}: loose page {}", self.id, pgno);
                return Ok(());
            }
            // Multi-page runs skip the loose list; park them for commit.
            let frame = self.frames.last_mut().unwrap();
            frame.free_pgs.need(npages);
            frame.free_pgs.append_range(pgno, npages);
            frame.free_pgs.sort();
            return Ok(());
        }

        let frame = self.frames.last_mut().unwrap();
        frame.free_pgs.need(npages);
        frame.free_pgs.append_range(pgno, npages);
        frame.free_pgs.sort();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spilling

    /// Estimate-then-spill: called before an operation that will touch
    /// `need` pages. Writes out roughly an eighth of the dirty list when
    /// room runs short.
    pub(crate) fn spill(&mut self, need: usize) -> Result<()> {
        if self.env.inner.flags.contains(EnvFlags::WRITE_MAP) {
            return Ok(());
        }
        if self.top().dirty_room > need {
            return Ok(());
        }
        // Pages under any cursor, and every DB root, must stay resident.
        let mut keep: Vec<PageNo> = Vec::new();
        for db in &self.top().dbs {
            if db.info.root != P_INVALID {
                keep.push(db.info.root);
            }
        }
        for weak in &self.cursors {
            if let Some(rc) = weak.upgrade() {
                let c = rc.borrow();
                c.collect_pages(&mut keep);
            }
        }
        keep.sort_unstable();

        let want = (self.top().dirty.len() / 8).max(need).max(1);
        let mut spilled = 0usize;
        let mut victims: Vec<PageNo> = Vec::new();
        {
            let frame = self.top();
            for (pgno, dp) in frame.dirty.iter().rev() {
                if spilled >= want {
                    break;
                }
                if dp.keep || dp.buf.is_none() {
                    continue;
                }
                if keep.binary_search(pgno).is_ok() {
                    continue;
                }
                if frame.loose.contains(pgno) {
                    continue;
                }
                // Pages an ancestor already spilled stay where they are.
                if self.frames[..self.frames.len() - 1]
                    .iter()
                    .any(|f| f.spill_contains(*pgno))
                {
                    continue;
                }
                victims.push(*pgno);
                spilled += 1;
            }
        }
        for pgno in victims {
            let frame = self.frames.last_mut().unwrap();
            let dp = frame.dirty.remove(pgno).unwrap();
            frame.dirty_room += 1;
            let buf = dp.buf.expect("writemap pages are never spill victims");
            let bytes: &[u8] = bytemuck::cast_slice(&buf);
            self.env.inner.write_page_at(pgno, bytes)?;
            let frame = self.frames.last_mut().unwrap();
            let key = pgno << 1;
            let pos = frame
                .spill
                .binary_search_by(|probe| (probe & !1).cmp(&key))
                .unwrap_or_else(|i| i);
            frame.spill.insert(pos, key);
            self.pool_buf(buf);
            log::trace!("txn {}: spilled page {}", self.id, pgno);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursor tracking

    pub(crate) fn track_cursor(&mut self, c: &Rc<RefCell<CursorInner>>) {
        self.cursors.push(Rc::downgrade(c));
    }

    /// Run `f` over every live tracked cursor except `skip`.
    pub(crate) fn for_each_cursor(&mut self, skip: u64, mut f: impl FnMut(&mut CursorInner)) {
        self.cursors.retain(|w| w.strong_count() > 0);
        for weak in &self.cursors {
            if let Some(rc) = weak.upgrade() {
                if let Ok(mut inner) = rc.try_borrow_mut() {
                    if inner.cursor_id != skip {
                        f(&mut inner);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Nested transactions

    /// Start a child transaction. Until [`commit_child`](Self::commit_child)
    /// or [`abort_child`](Self::abort_child), all work happens in the
    /// child.
    pub fn begin_child(&mut self) -> Result<()> {
        self.check_ok()?;
        let acc_snapshot = Some((
            self.scratch.free_acc.clone(),
            self.scratch.last_reclaimed,
            self.consumed.len(),
        ));
        let mut shadow = Vec::new();
        self.cursors.retain(|w| w.strong_count() > 0);
        for weak in &self.cursors {
            if let Some(rc) = weak.upgrade() {
                let c = rc.borrow();
                shadow.push((c.cursor_id, c.clone()));
            }
        }
        let top = self.top();
        let frame = TxnFrame {
            dirty: Id2List::new(),
            spill: Vec::new(),
            free_pgs: IdList::new(),
            loose: Vec::new(),
            dirty_room: top.dirty_room,
            next_pgno: top.next_pgno,
            dbs: top.dbs.clone(),
            shadow,
            acc_snapshot,
        };
        self.frames.push(frame);
        log::debug!("txn {}: child frame {} begins", self.id, self.frames.len());
        Ok(())
    }

    /// Merge the innermost child frame into its parent.
    pub fn commit_child(&mut self) -> Result<()> {
        self.check_ok()?;
        if self.frames.len() < 2 {
            return Err(Error::BadTxn);
        }
        let child = self.frames.pop().unwrap();
        let parent = self.frames.last_mut().unwrap();

        let mut child = child;
        parent.next_pgno = child.next_pgno;
        parent.dbs = std::mem::take(&mut child.dbs);
        parent.free_pgs.merge(&child.free_pgs);
        parent.loose.append(&mut child.loose);

        // A child shadow replaces the parent's image outright.
        let mut displaced = Vec::new();
        for (pgno, dp) in child.dirty.drain() {
            if let Some(old) = parent.dirty.remove(pgno) {
                if let Some(buf) = old.buf {
                    displaced.push(buf);
                }
            } else {
                parent.dirty_room = parent.dirty_room.saturating_sub(1);
            }
            let _ = parent.dirty.insert(pgno, dp, usize::MAX);
        }

        // Pages the child spilled left the dirty list; the parent must
        // remember they're on disk.
        for ent in child.spill {
            if ent & 1 == 1 {
                continue;
            }
            let pos = parent
                .spill
                .binary_search_by(|probe| (probe & !1).cmp(&(ent & !1)))
                .unwrap_or_else(|i| i);
            if parent.spill.get(pos).map(|p| p & !1) != Some(ent & !1) {
                parent.spill.insert(pos, ent);
            }
        }
        for buf in displaced {
            self.pool_buf(buf);
        }
        log::debug!("txn {}: child frame merged", self.id);
        Ok(())
    }

    /// Throw the innermost child frame away, restoring cursors and the
    /// reclaim accumulator.
    pub fn abort_child(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(Error::BadTxn);
        }
        let TxnFrame {
            mut dirty,
            shadow,
            acc_snapshot,
            ..
        } = self.frames.pop().unwrap();
        if let Some((acc, last, consumed_len)) = acc_snapshot {
            self.scratch.free_acc = acc;
            self.scratch.last_reclaimed = last;
            self.consumed.truncate(consumed_len);
        }
        self.cursors.retain(|w| w.strong_count() > 0);
        for (id, saved) in shadow {
            for weak in &self.cursors {
                if let Some(rc) = weak.upgrade() {
                    let mut c = rc.borrow_mut();
                    if c.cursor_id == id {
                        *c = saved.clone();
                    }
                }
            }
        }
        let mut bufs = Vec::new();
        for (_, dp) in dirty.drain() {
            if let Some(buf) = dp.buf {
                bufs.push(buf);
            }
        }
        for buf in bufs {
            self.pool_buf(buf);
        }
        log::debug!("txn {}: child frame aborted", self.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit / abort

    /// Commit everything. Consumes the transaction.
    pub fn commit(mut self) -> Result<()> {
        self.check_ok()?;
        if self.frames.len() != 1 {
            self.errored = true;
            return Err(Error::BadTxn);
        }
        let res = self.commit_inner();
        if res.is_ok() {
            self.committed = true;
        }
        res
    }

    fn commit_inner(&mut self) -> Result<()> {
        // Nothing written: nothing to publish.
        let untouched = self.top().dirty.is_empty()
            && self.top().spill.is_empty()
            && self.top().free_pgs.is_empty()
            && self.top().loose.is_empty()
            && !self
                .top()
                .dbs
                .iter()
                .any(|d| d.state.contains(TxnDbFlags::DIRTY));
        if untouched {
            return Ok(());
        }

        // Flush changed named-DB descriptors into the main tree.
        crate::cursor::flush_named_dbs(self)?;

        // Leftover loose pages join the freed set.
        let loose = std::mem::take(&mut self.top_mut().loose);
        let mut bufs = Vec::new();
        {
            let frame = self.frames.last_mut().unwrap();
            for pgno in loose {
                if let Some(dp) = frame.dirty.remove(pgno) {
                    frame.dirty_room += 1;
                    if let Some(buf) = dp.buf {
                        bufs.push(buf);
                    }
                }
                frame.free_pgs.append(pgno);
            }
            frame.free_pgs.sort();
        }
        for buf in bufs {
            self.pool_buf(buf);
        }

        // Persist the freelist, then flush data pages.
        crate::freelist::save(self)?;
        self.flush_dirty()?;

        let inner = &self.env.inner;
        let flags = inner.flags;
        if !flags.contains(EnvFlags::NO_SYNC) {
            // sync_data honors WRITE_MAP / MAP_ASYNC on its own.
            inner.sync_data()?;
        }

        // Publish the new root by rewriting the alternate meta page.
        let mut meta = inner.pick_meta()?;
        meta.txnid = self.id;
        meta.last_pgno = self.top().next_pgno - 1;
        meta.map_size = inner.map_len.load(Ordering::SeqCst) as u64;
        meta.dbs[FREE_DBI] = self.top().dbs[FREE_DBI].info;
        meta.dbs[MAIN_DBI] = self.top().dbs[MAIN_DBI].info;
        meta.dbs[FREE_DBI].key_size = inner.psize as u32;
        let sync_meta =
            !flags.contains(EnvFlags::NO_SYNC) && !flags.contains(EnvFlags::NO_META_SYNC);
        inner.write_meta(&meta, sync_meta)?;

        if let Some(table) = &inner.readers {
            table.set_txnid(self.id);
        }
        log::debug!(
            "txn {} committed: last_pgno {}, {} freed",
            self.id,
            meta.last_pgno,
            self.top().free_pgs.len()
        );
        Ok(())
    }

    /// Write every dirty page at its offset. Consecutive runs coalesce
    /// into scatter-gather writes where the platform has them.
    fn flush_dirty(&mut self) -> Result<()> {
        let env = self.env;
        if env.inner.flags.contains(EnvFlags::WRITE_MAP) {
            // The map is the data; commit only needs flag hygiene.
            self.top_mut().dirty = Id2List::new();
            return Ok(());
        }
        let psize = env.inner.psize;
        let mut dirty = std::mem::replace(&mut self.top_mut().dirty, Id2List::new());
        let pool = &mut self.scratch.buf_pool;
        let mut batch: Vec<(PageNo, Box<[u64]>)> = Vec::new();
        fn flush_batch(
            env: &Env,
            psize: usize,
            batch: &mut Vec<(PageNo, Box<[u64]>)>,
            pool: &mut Vec<Box<[u64]>>,
        ) -> Result<()> {
            if batch.is_empty() {
                return Ok(());
            }
            let start = batch[0].0;
            write_vectored(&env.inner.file, start * psize as u64, batch)?;
            for (_, buf) in batch.drain(..) {
                if pool.len() < 256 && buf.len() == psize / 8 {
                    pool.push(buf);
                }
            }
            Ok(())
        }
        for (pgno, dp) in dirty.drain() {
            let buf = dp.buf.expect("non-writemap dirty pages own buffers");
            let contiguous = batch
                .last()
                .map(|(last, b)| last + (b.len() as u64 * 8 / psize as u64) == pgno)
                .unwrap_or(true);
            if !contiguous || batch.len() >= 64 {
                flush_batch(env, psize, &mut batch, pool)?;
            }
            batch.push((pgno, buf));
        }
        flush_batch(env, psize, &mut batch, pool)?;
        self.top_mut().dirty_room = IDL_UM_MAX;
        Ok(())
    }

    /// Abort everything. Equivalent to dropping the transaction.
    pub fn abort(self) {}

    fn abort_inner(&mut self) {
        while self.frames.len() > 1 {
            let _ = self.abort_child();
        }
        let frame = self.frames.last_mut().unwrap();
        let mut bufs = Vec::new();
        for (_, dp) in frame.dirty.drain() {
            if let Some(buf) = dp.buf {
                bufs.push(buf);
            }
        }
        for buf in bufs {
            self.pool_buf(buf);
        }
        // An aborted txn never deleted the records backing its reclaimed
        // pages, so the accumulator is just forgotten.
        self.scratch.free_acc.clear();
        self.scratch.last_reclaimed = 0;
        self.consumed.clear();
        log::debug!("txn {} aborted", self.id);
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.abort_inner();
        } else {
            // Commit already flushed state; recycle remaining buffers.
            let frame = self.frames.last_mut().unwrap();
            let mut bufs = Vec::new();
            for (_, dp) in frame.dirty.drain() {
                if let Some(buf) = dp.buf {
                    bufs.push(buf);
                }
            }
            for buf in bufs {
                self.pool_buf(buf);
            }
        }
        if let Some(table) = &self.env.inner.readers {
            let _ = table.writer_unlock();
        }
        self.env.inner.live_txns.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(unix)]
fn write_vectored(file: &std::fs::File, off: u64, batch: &[(PageNo, Box<[u64]>)]) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let iov: Vec<libc::iovec> = batch
        .iter()
        .map(|(_, buf)| libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len() * 8,
        })
        .collect();
    let total: usize = batch.iter().map(|(_, b)| b.len() * 8).sum();
    let n = unsafe {
        libc::pwritev(
            file.as_raw_fd(),
            iov.as_ptr(),
            iov.len() as libc::c_int,
            off as libc::off_t,
        )
    };
    if n < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if n as usize != total {
        // Partial write: fall back to per-page writes for the rest.
        let mut pos = off;
        for (_, buf) in batch {
            let bytes: &[u8] = bytemuck::cast_slice(buf);
            crate::env::write_page_fallback(file, bytes, pos)?;
            pos += bytes.len() as u64;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn write_vectored(file: &std::fs::File, off: u64, batch: &[(PageNo, Box<[u64]>)]) -> Result<()> {
    let mut pos = off;
    for (_, buf) in batch {
        let bytes: &[u8] = bytemuck::cast_slice(buf);
        crate::env::write_page_fallback(file, bytes, pos)?;
        pos += bytes.len() as u64;
    }
    Ok(())
}
