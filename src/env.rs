//! Environment lifecycle: files, the data map, meta rotation, growth.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fs4::fs_std::FileExt;
use memmap2::{MmapOptions, MmapRaw};

use crate::db::{DbRegistry, DbStat};
use crate::error::{Error, Result};
use crate::idl::IdList;
use crate::lock::{ReaderInfo, ReaderTable};
use crate::meta::{Meta, MAIN_DBI, META_SIZE};
use crate::page::{MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGEHDRSZ};
use crate::txn::{ReadTxn, WriteTxn};
use crate::{PageNo, TxnId, MAX_KEY_SIZE};

/// Default data map size when the builder doesn't set one.
pub const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;
/// Default cap on concurrent readers.
pub const DEFAULT_MAX_READERS: usize = 126;

/// Name of the data file inside an environment directory.
pub const DATA_NAME: &str = "data.mdb";
/// Name of the lock file inside an environment directory.
pub const LOCK_NAME: &str = "lock.mdb";
/// Lock-file suffix in `NO_SUBDIR` mode.
pub const LOCK_SUFFIX: &str = "-lock";

bitflags::bitflags! {
    /// Environment-wide behavior flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Map at the address recorded in the meta page.
        const FIXED_MAP    = 0x01;
        /// `path` is the data file itself, not a directory.
        const NO_SUBDIR    = 0x4000;
        /// Don't fsync after commit.
        const NO_SYNC      = 0x1_0000;
        /// Open everything read-only.
        const READ_ONLY    = 0x2_0000;
        /// Fsync data but let the meta page ride on the next commit.
        const NO_META_SYNC = 0x4_0000;
        /// Mutate pages directly in a writable map.
        const WRITE_MAP    = 0x8_0000;
        /// With WRITE_MAP: use asynchronous msync.
        const MAP_ASYNC    = 0x10_0000;
        /// Tie reader slots to txn objects, not threads. This is the
        /// native behavior of this implementation; the flag is accepted
        /// for compatibility.
        const NO_TLS       = 0x20_0000;
        /// No lock file: caller serializes all access.
        const NO_LOCK      = 0x40_0000;
        /// Advise the OS against read-ahead on the data map.
        const NO_READ_AHEAD = 0x80_0000;
        /// Don't wipe recycled page buffers before reuse. The stale
        /// bytes are always previously-committed database content, but
        /// a `RESERVE` put will expose them until the caller overwrites
        /// the reservation.
        const NO_MEM_INIT  = 0x100_0000;
    }
}

/// Runtime information about an open environment.
#[derive(Clone, Copy, Debug)]
pub struct EnvInfo {
    pub map_size: usize,
    pub last_pgno: PageNo,
    pub last_txnid: TxnId,
    pub max_readers: usize,
    pub num_readers: usize,
}

/// Builder for opening an [`Env`].
#[derive(Clone, Debug)]
pub struct EnvBuilder {
    map_size: usize,
    max_readers: usize,
    max_dbs: usize,
    flags: EnvFlags,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self {
            map_size: DEFAULT_MAP_SIZE,
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: 0,
            flags: EnvFlags::empty(),
        }
    }
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the data map. Rounded up to a page multiple. A value
    /// smaller than the current file keeps the file's size: shrinking is
    /// not supported.
    pub fn map_size(mut self, size: usize) -> Self {
        self.map_size = size;
        self
    }

    pub fn max_readers(mut self, n: usize) -> Self {
        self.max_readers = n;
        self
    }

    /// How many named sub-databases may be opened.
    pub fn max_dbs(mut self, n: usize) -> Self {
        self.max_dbs = n;
        self
    }

    pub fn flags(mut self, flags: EnvFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Env> {
        Env::open_inner(path.as_ref(), self)
    }
}

/// A database environment: one data file, one lock file, one map.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Env {
    pub(crate) inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("path", &self.inner.path).finish()
    }
}

pub(crate) struct EnvInner {
    pub(crate) flags: EnvFlags,
    pub(crate) psize: usize,
    pub(crate) max_readers: usize,
    pub(crate) path: PathBuf,
    /// Handle used for ordinary data writes.
    pub(crate) file: File,
    /// Separate handle for meta writes, synced when durability asks.
    pub(crate) meta_file: File,
    /// Current map base and length, updated only while no txn is live.
    map_ptr: AtomicPtr<u8>,
    pub(crate) map_len: AtomicUsize,
    /// Keeps the mapping alive; replaced on growth.
    map: Mutex<Option<MmapRaw>>,
    pub(crate) readers: Option<ReaderTable>,
    /// In-process writer exclusion; the guard rides inside a WriteTxn.
    pub(crate) writer: Mutex<WriterScratch>,
    /// In-process reader-slot allocation guard.
    pub(crate) reader_alloc: Mutex<()>,
    pub(crate) dbs: RwLock<DbRegistry>,
    /// Set after an unrecoverable meta-write failure.
    pub(crate) fatal: AtomicBool,
    /// Live transactions in this process, for safe remapping.
    pub(crate) live_txns: AtomicUsize,
    /// Serial handed to each txn so stray cursors can be rejected.
    pub(crate) txn_serial: AtomicU64,
}

/// Per-environment writer scratch: survives across write txns.
pub(crate) struct WriterScratch {
    /// Pages reclaimed from the freelist tree, not yet reused.
    pub free_acc: IdList,
    /// Last freelist record key consumed into `free_acc`.
    pub last_reclaimed: TxnId,
    /// Recycled dirty-page buffers.
    pub buf_pool: Vec<Box<[u64]>>,
}

impl Env {
    /// Open with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Env> {
        EnvBuilder::default().open(path)
    }

    pub fn builder() -> EnvBuilder {
        EnvBuilder::default()
    }

    fn open_inner(path: &Path, b: EnvBuilder) -> Result<Env> {
        let readonly = b.flags.contains(EnvFlags::READ_ONLY);
        let (data_path, lock_path) = if b.flags.contains(EnvFlags::NO_SUBDIR) {
            let mut lock = path.as_os_str().to_owned();
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            (path.join(DATA_NAME), path.join(LOCK_NAME))
        };

        let readers = if b.flags.contains(EnvFlags::NO_LOCK) {
            None
        } else {
            Some(ReaderTable::open(&lock_path, b.max_readers, readonly)?)
        };

        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .open(&data_path)
            .map_err(Error::Open)?;
        // Hold a shared lock for the life of the env so a destructive
        // utility can tell the file is busy by trying an exclusive one.
        file.lock_shared().map_err(Error::Lock)?;
        let meta_file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(&data_path)
            .map_err(Error::Open)?;

        let file_len = file.metadata().map_err(Error::Open)?.len() as usize;
        let (meta, psize, is_new) = if file_len == 0 {
            if readonly {
                return Err(Error::Invalid);
            }
            let psize = page_size::get().clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);
            let meta = Meta::new_env(psize, b.map_size as u64);
            write_initial_metas(&file, &meta, psize)?;
            (meta, psize, true)
        } else {
            if file_len < MIN_PAGE_SIZE + PAGEHDRSZ + META_SIZE {
                return Err(Error::Invalid);
            }
            let meta = read_newest_meta_from_file(&file)?;
            let psize = meta.psize();
            if psize < MIN_PAGE_SIZE || psize > MAX_PAGE_SIZE || !psize.is_power_of_two() {
                return Err(Error::Invalid);
            }
            (meta, psize, false)
        };

        // The map covers max(requested, stored, file) and is a whole
        // number of pages.
        let mut map_size = b.map_size.max(meta.map_size as usize).max(file_len);
        map_size = (map_size + psize - 1) & !(psize - 1);

        // Stores through a writable map must never land past EOF.
        if b.flags.contains(EnvFlags::WRITE_MAP) && !readonly && file_len < map_size {
            file.set_len(map_size as u64).map_err(Error::Open)?;
        }

        // FIXED_MAP is best effort: the address recorded in the meta is
        // a hint, and nothing in the format depends on honoring it.
        let mut opts = MmapOptions::new();
        opts.len(map_size);
        let map = opts.map_raw(&file).map_err(|e| Error::MapFailed {
            requested: map_size,
            source: e,
        })?;
        #[cfg(unix)]
        if b.flags.contains(EnvFlags::NO_READ_AHEAD) {
            let _ = map.advise(memmap2::Advice::Random);
        }

        let inner = EnvInner {
            flags: b.flags,
            psize,
            max_readers: b.max_readers,
            path: path.to_path_buf(),
            file,
            meta_file,
            map_ptr: AtomicPtr::new(map.as_mut_ptr()),
            map_len: AtomicUsize::new(map_size),
            map: Mutex::new(Some(map)),
            readers,
            writer: Mutex::new(WriterScratch {
                free_acc: IdList::new(),
                last_reclaimed: 0,
                buf_pool: Vec::new(),
            }),
            reader_alloc: Mutex::new(()),
            dbs: RwLock::new(DbRegistry::new(b.max_dbs)),
            fatal: AtomicBool::new(false),
            live_txns: AtomicUsize::new(0),
            txn_serial: AtomicU64::new(1),
        };

        if is_new && !b.flags.contains(EnvFlags::NO_SYNC) {
            inner.file.sync_all().map_err(Error::Sync)?;
        }
        if let Some(rt) = &inner.readers {
            if rt.txnid() < meta.txnid {
                rt.set_txnid(meta.txnid);
            }
        }
        log::debug!(
            "opened env at {:?}: psize {}, mapsize {}, txnid {}",
            path,
            psize,
            map_size,
            meta.txnid
        );
        Ok(Env { inner: Arc::new(inner) })
    }

    /// Begin a read-only transaction pinned to the newest committed
    /// snapshot.
    pub fn read_txn(&self) -> Result<ReadTxn> {
        ReadTxn::begin(self)
    }

    /// Begin the write transaction. Blocks while another writer (in any
    /// process) is active.
    pub fn write_txn(&self) -> Result<WriteTxn<'_>> {
        WriteTxn::begin(self)
    }

    /// OS page size this environment was created with.
    pub fn page_size(&self) -> usize {
        self.inner.psize
    }

    /// Longest permitted key (and dup-sort value).
    pub fn max_key_size(&self) -> usize {
        MAX_KEY_SIZE
    }

    pub fn flags(&self) -> EnvFlags {
        self.inner.flags
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Statistics of the main tree at the newest committed snapshot.
    pub fn stat(&self) -> Result<DbStat> {
        let meta = self.inner.pick_meta()?;
        Ok(DbStat::from_info(self.inner.psize, &meta.dbs[MAIN_DBI]))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.inner.pick_meta()?;
        Ok(EnvInfo {
            map_size: self.inner.map_len.load(Ordering::SeqCst),
            last_pgno: meta.last_pgno,
            last_txnid: meta.txnid,
            max_readers: self.inner.max_readers,
            num_readers: self
                .inner
                .readers
                .as_ref()
                .map(|r| r.num_readers())
                .unwrap_or(0),
        })
    }

    /// Snapshot of the reader table.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.inner
            .readers
            .as_ref()
            .map(|r| r.list())
            .unwrap_or_default()
    }

    /// Clear reader slots owned by dead processes. Returns slots cleared.
    pub fn reader_check(&self) -> Result<usize> {
        match &self.inner.readers {
            Some(r) => r.check_stale(),
            None => Ok(0),
        }
    }

    /// Flush buffered writes. With `force`, syncs even when the
    /// environment runs `NO_SYNC` or `MAP_ASYNC`.
    pub fn sync(&self, force: bool) -> Result<()> {
        let f = self.inner.flags;
        if f.contains(EnvFlags::READ_ONLY) {
            return Err(Error::InvalidArg);
        }
        if force || !(f.contains(EnvFlags::NO_SYNC) || f.contains(EnvFlags::MAP_ASYNC)) {
            self.inner.sync_data()?;
        }
        Ok(())
    }

    /// Grow (or with `0`, re-adopt) the map size. Fails when this process
    /// has live transactions.
    pub fn set_mapsize(&self, size: usize) -> Result<()> {
        if self.inner.live_txns.load(Ordering::SeqCst) != 0 {
            return Err(Error::InvalidArg);
        }
        let meta = self.inner.pick_meta()?;
        let psize = self.inner.psize;
        let mut want = if size == 0 {
            meta.map_size as usize
        } else {
            size
        };
        let min = ((meta.last_pgno + 1) as usize) * psize;
        want = want.max(min);
        want = (want + psize - 1) & !(psize - 1);

        let mut guard = self.inner.map.lock().unwrap();
        let cur = self.inner.map_len.load(Ordering::SeqCst);
        if want <= cur {
            // Shrinking is not supported; the map only ever grows.
            return Ok(());
        }
        if self.inner.flags.contains(EnvFlags::WRITE_MAP) {
            let file_len = self.inner.file.metadata().map_err(Error::Open)?.len();
            if (file_len as usize) < want {
                self.inner.file.set_len(want as u64).map_err(Error::Open)?;
            }
        }
        let map = MmapOptions::new()
            .len(want)
            .map_raw(&self.inner.file)
            .map_err(|e| Error::MapFailed {
                requested: want,
                source: e,
            })?;
        self.inner.map_ptr.store(map.as_mut_ptr(), Ordering::SeqCst);
        self.inner.map_len.store(want, Ordering::SeqCst);
        *guard = Some(map);
        log::debug!("remapped env to {} bytes", want);
        Ok(())
    }

    /// Copy the environment to `path`. With `compact`, rewrites the tree
    /// with densely renumbered pages and omits the freelist.
    pub fn copy_to<P: AsRef<Path>>(&self, path: P, compact: bool) -> Result<()> {
        crate::copy::copy_env(self, path.as_ref(), compact)
    }

    /// Stream a raw copy of the current snapshot to `out` (for piping).
    pub fn copy_to_writer(&self, out: &mut dyn std::io::Write) -> Result<()> {
        crate::copy::copy_env_to_writer(self, out)
    }
}

impl EnvInner {
    /// Read the newer of the two meta pages out of the live map.
    pub(crate) fn pick_meta(&self) -> Result<Meta> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(Error::Panic);
        }
        let m0 = Meta::read(self.map_bytes(0, self.psize)?);
        let m1 = Meta::read(self.map_bytes(self.psize, self.psize)?);
        match (m0, m1) {
            (Ok(a), Ok(b)) => Ok(if a.txnid >= b.txnid { a } else { b }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }

    /// Borrow `len` bytes of the map starting at byte `off`.
    ///
    /// The returned slice lives as long as the mapping. Callers must not
    /// hold it across `set_mapsize`, which is enforced by the live-txn
    /// counter.
    pub(crate) fn map_bytes(&self, off: usize, len: usize) -> Result<&[u8]> {
        let size = self.map_len.load(Ordering::SeqCst);
        if off + len > size {
            return Err(Error::PageNotFound);
        }
        let ptr = self.map_ptr.load(Ordering::SeqCst);
        // Safety: bounds checked above; the mapping outlives every txn.
        unsafe { Ok(std::slice::from_raw_parts(ptr.add(off), len)) }
    }

    /// Mutable map access for WRITE_MAP mode.
    pub(crate) fn map_bytes_mut(&self, off: usize, len: usize) -> Result<&mut [u8]> {
        let size = self.map_len.load(Ordering::SeqCst);
        if off + len > size {
            return Err(Error::PageNotFound);
        }
        let ptr = self.map_ptr.load(Ordering::SeqCst);
        // Safety: bounds checked; single-writer discipline makes the
        // aliasing exclusive for the pages a write txn touches.
        unsafe { Ok(std::slice::from_raw_parts_mut(ptr.add(off), len)) }
    }

    pub(crate) fn map_pages(&self) -> PageNo {
        (self.map_len.load(Ordering::SeqCst) / self.psize) as PageNo
    }

    /// Flush the data map / file.
    pub(crate) fn sync_data(&self) -> Result<()> {
        if self.flags.contains(EnvFlags::WRITE_MAP) {
            let guard = self.map.lock().unwrap();
            if let Some(map) = guard.as_ref() {
                if self.flags.contains(EnvFlags::MAP_ASYNC) {
                    map.flush_async().map_err(Error::Sync)?;
                } else {
                    map.flush().map_err(Error::Sync)?;
                }
            }
            Ok(())
        } else {
            self.file.sync_data().map_err(Error::Sync)
        }
    }

    /// Write a page image at its file offset through the data handle.
    pub(crate) fn write_page_at(&self, pgno: PageNo, data: &[u8]) -> Result<()> {
        write_all_at(&self.file, data, pgno * self.psize as u64)
    }

    /// Publish `meta` into its alternate slot. On failure the old image
    /// is rewritten so the page cache can't hold a torn meta.
    pub(crate) fn write_meta(&self, meta: &Meta, sync_meta: bool) -> Result<()> {
        let which = Meta::toggle(meta.txnid);
        let off = (which * self.psize) as u64;
        let mut page = vec![0u8; self.psize];
        meta.write_page(&mut page, which);

        if self.flags.contains(EnvFlags::WRITE_MAP) {
            let dst = self.map_bytes_mut(which * self.psize, self.psize)?;
            dst.copy_from_slice(&page);
            if sync_meta {
                let guard = self.map.lock().unwrap();
                if let Some(map) = guard.as_ref() {
                    map.flush_range(which * self.psize, self.psize)
                        .map_err(Error::Sync)?;
                }
            }
            return Ok(());
        }

        let res = write_all_at(&self.meta_file, &page, off).and_then(|()| {
            if sync_meta {
                self.meta_file.sync_data().map_err(Error::Sync)
            } else {
                Ok(())
            }
        });
        if let Err(e) = res {
            // Poison the OS cache with the previous image rather than
            // leave a half-written meta visible.
            if let Ok(old) = self.map_bytes(which * self.psize, self.psize) {
                let old = old.to_vec();
                let _ = write_all_at(&self.meta_file, &old, off);
            }
            self.fatal.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn oldest_reader(&self, floor: TxnId) -> TxnId {
        match &self.readers {
            Some(r) => r.oldest(floor),
            None => floor,
        }
    }
}

/// Per-page write used when scatter-gather isn't available or fell short.
pub(crate) fn write_page_fallback(file: &File, data: &[u8], off: u64) -> Result<()> {
    write_all_at(file, data, off)
}

fn write_all_at(file: &File, data: &[u8], off: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt as UnixFileExt;
        file.write_all_at(data, off).map_err(Error::Io)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = file;
        f.seek(SeekFrom::Start(off)).map_err(Error::Io)?;
        f.write_all(data).map_err(Error::Io)
    }
}

fn read_exact_at(file: &File, buf: &mut [u8], off: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt as UnixFileExt;
        file.read_exact_at(buf, off).map_err(Error::Io)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Read, Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::Start(off)).map_err(Error::Io)?;
        f.read_exact(buf).map_err(Error::Io)
    }
}

/// Initialize pages 0 and 1 of a fresh data file.
fn write_initial_metas(file: &File, meta: &Meta, psize: usize) -> Result<()> {
    let mut page = vec![0u8; psize];
    meta.write_page(&mut page, 0);
    write_all_at(file, &page, 0)?;
    let mut page = vec![0u8; psize];
    meta.write_page(&mut page, 1);
    write_all_at(file, &page, psize as u64)?;
    Ok(())
}

/// Before the map exists: probe both meta pages straight from the file.
///
/// The stored page size isn't known yet, so the second meta is searched
/// at every power-of-two offset a supported page size allows.
fn read_newest_meta_from_file(file: &File) -> Result<Meta> {
    let mut best: Option<Meta> = None;
    let mut probe = vec![0u8; MIN_PAGE_SIZE];
    if read_exact_at(file, &mut probe, 0).is_ok() {
        if let Ok(m) = Meta::read(&probe) {
            best = Some(m);
        }
    }
    // A valid page 0 names the real page size; otherwise scan.
    let candidates: Vec<usize> = match &best {
        Some(m) => vec![m.psize()],
        None => {
            let mut v = Vec::new();
            let mut p = MIN_PAGE_SIZE;
            while p <= MAX_PAGE_SIZE {
                v.push(p);
                p <<= 1;
            }
            v
        }
    };
    for psize in candidates {
        let mut page = vec![0u8; MIN_PAGE_SIZE];
        if read_exact_at(file, &mut page, psize as u64).is_err() {
            continue;
        }
        if let Ok(m) = Meta::read(&page) {
            if m.psize() == psize {
                best = Some(match best {
                    Some(b) if b.txnid >= m.txnid => b,
                    _ => m,
                });
            }
        }
    }
    best.ok_or(Error::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let env = Env::builder().map_size(1 << 20).open(dir.path()).unwrap();
            assert!(env.page_size().is_power_of_two());
            let info = env.info().unwrap();
            assert_eq!(info.last_txnid, 0);
            assert_eq!(info.last_pgno, 1);
        }
        // Reopen sees the same format.
        let env = Env::open(dir.path()).unwrap();
        assert_eq!(env.info().unwrap().last_txnid, 0);
        assert!(dir.path().join(DATA_NAME).exists());
        assert!(dir.path().join(LOCK_NAME).exists());
    }

    #[test]
    fn no_subdir_uses_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("solo.mdb");
        let env = Env::builder()
            .flags(EnvFlags::NO_SUBDIR)
            .open(&path)
            .unwrap();
        drop(env);
        assert!(path.exists());
        assert!(dir.path().join("solo.mdb-lock").exists());
    }

    #[test]
    fn garbage_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0xA5u8; 8192]).unwrap();
        let err = Env::builder()
            .flags(EnvFlags::NO_SUBDIR)
            .open(&path)
            .unwrap_err();
        assert!(matches!(err, Error::Invalid));
    }
}
