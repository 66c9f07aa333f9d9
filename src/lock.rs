//! The lock file: a shared reader table plus the byte-range locks that
//! coordinate processes.
//!
//! Layout: a 64-byte header, then one cache-line-sized slot per reader.
//! Readers publish `(pid, tid, txnid)` into their slot with plain atomic
//! stores; the writer scans the table without locking, which is safe
//! because a stale read only under-estimates how far reclamation may go.
//!
//! Byte-range `fcntl` locks play three roles, all on this one file:
//! offset 0 is held exclusively while the first opener initializes the
//! table and shared afterwards; offset 2 is the writer mutex; offset 3
//! guards reader-slot allocation; offset `pid` is held for the life of
//! each process and probed by the stale-reader sweep. A file lock dies
//! with its holder, so a crashed writer never wedges the environment.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapRaw;

use crate::error::{Error, Result};
use crate::TxnId;

/// Identifies a lock file of this format.
pub const LOCK_MAGIC: u32 = 0xBEEF_C0DE;
/// Bumped when the table layout changes.
pub const LOCK_FORMAT: u32 = 1;

/// A slot's txnid when its reader has no snapshot pinned.
pub const TXNID_UNSET: TxnId = TxnId::MAX;

const HEADER_SIZE: usize = 64;
const SLOT_SIZE: usize = 64;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 4;
const OFF_TXNID: usize = 8;
const OFF_NUM_READERS: usize = 16;

const SLOT_TXNID: usize = 0;
const SLOT_PID: usize = 8;
const SLOT_TID: usize = 16;

const LOCK_BYTE_INIT: u64 = 0;
const LOCK_BYTE_WRITER: u64 = 2;
const LOCK_BYTE_RALLOC: u64 = 3;

/// One row of [`ReaderTable::list`].
#[derive(Clone, Copy, Debug)]
pub struct ReaderInfo {
    pub slot: usize,
    pub pid: u32,
    pub tid: u64,
    /// `None` when the slot is claimed but idle.
    pub txnid: Option<TxnId>,
}

pub(crate) struct ReaderTable {
    map: MmapRaw,
    file: File,
    max_readers: usize,
}

impl ReaderTable {
    pub fn size_for(max_readers: usize) -> usize {
        HEADER_SIZE + max_readers * SLOT_SIZE
    }

    /// Open or create the lock file and map the reader table.
    pub fn open(path: &Path, max_readers: usize, readonly: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(!readonly)
            .open(path)
            .map_err(Error::Open)?;

        // First opener gets the exclusive init byte and formats the table.
        let have_init = try_lock_byte(&file, LOCK_BYTE_INIT, true)?;
        let size = Self::size_for(max_readers);
        let cur = file.metadata().map_err(Error::Open)?.len() as usize;
        if have_init {
            if cur < size {
                if readonly {
                    return Err(Error::Invalid);
                }
                file.set_len(size as u64).map_err(Error::Open)?;
            }
        } else if cur < HEADER_SIZE {
            return Err(Error::Invalid);
        }
        let map = MmapRaw::map_raw(&file).map_err(|e| Error::MapFailed {
            requested: size.max(cur),
            source: e,
        })?;

        let table = Self {
            map,
            file,
            max_readers,
        };

        if have_init {
            unsafe {
                table.u32_at(OFF_MAGIC).store(LOCK_MAGIC, Ordering::SeqCst);
                table.u32_at(OFF_FORMAT).store(LOCK_FORMAT, Ordering::SeqCst);
                table.u32_at(OFF_NUM_READERS).store(0, Ordering::SeqCst);
            }
            // Keep holding the byte, but shared, so late joiners can
            // tell the table is live. fcntl converts atomically.
            lock_byte_shared(&table.file, LOCK_BYTE_INIT)?;
        } else {
            lock_byte_shared(&table.file, LOCK_BYTE_INIT)?;
            unsafe {
                if table.u32_at(OFF_MAGIC).load(Ordering::SeqCst) != LOCK_MAGIC {
                    return Err(Error::Invalid);
                }
                if table.u32_at(OFF_FORMAT).load(Ordering::SeqCst) != LOCK_FORMAT {
                    return Err(Error::VersionMismatch);
                }
            }
        }

        // Announce this process for liveness probing.
        if !readonly {
            let _ = try_lock_byte(&table.file, std::process::id() as u64, true);
        }
        Ok(table)
    }

    /// # Safety
    /// `off` must be within the map and 4-aligned.
    unsafe fn u32_at(&self, off: usize) -> &AtomicU32 {
        &*(self.map.as_ptr().add(off) as *const AtomicU32)
    }

    /// # Safety
    /// `off` must be within the map and 8-aligned.
    unsafe fn u64_at(&self, off: usize) -> &AtomicU64 {
        &*(self.map.as_ptr().add(off) as *const AtomicU64)
    }

    fn slot_off(&self, i: usize) -> usize {
        HEADER_SIZE + i * SLOT_SIZE
    }

    /// Last committed transaction id, as published by writers.
    pub fn txnid(&self) -> TxnId {
        unsafe { self.u64_at(OFF_TXNID).load(Ordering::SeqCst) }
    }

    pub fn set_txnid(&self, id: TxnId) {
        unsafe { self.u64_at(OFF_TXNID).store(id, Ordering::SeqCst) }
    }

    /// High-water count of slots ever claimed.
    pub fn num_readers(&self) -> usize {
        unsafe { self.u32_at(OFF_NUM_READERS).load(Ordering::SeqCst) as usize }
    }

    pub fn slot_pid(&self, i: usize) -> u32 {
        unsafe { self.u32_at(self.slot_off(i) + SLOT_PID).load(Ordering::SeqCst) }
    }

    pub fn slot_txnid(&self, i: usize) -> TxnId {
        unsafe { self.u64_at(self.slot_off(i) + SLOT_TXNID).load(Ordering::SeqCst) }
    }

    pub fn set_slot_txnid(&self, i: usize, id: TxnId) {
        unsafe { self.u64_at(self.slot_off(i) + SLOT_TXNID).store(id, Ordering::SeqCst) }
    }

    /// Claim a free slot for `(pid, tid)`. Caller holds the in-process
    /// reader mutex; this additionally takes the cross-process one.
    pub fn claim_slot(&self, pid: u32, tid: u64) -> Result<usize> {
        lock_byte_blocking(&self.file, LOCK_BYTE_RALLOC)?;
        let res = (|| {
            let high = self.num_readers();
            let mut idx = None;
            for i in 0..high {
                if self.slot_pid(i) == 0 {
                    idx = Some(i);
                    break;
                }
            }
            let i = match idx {
                Some(i) => i,
                None if high < self.max_readers => {
                    unsafe {
                        self.u32_at(OFF_NUM_READERS)
                            .store(high as u32 + 1, Ordering::SeqCst);
                    }
                    high
                }
                None => return Err(Error::ReadersFull),
            };
            let off = self.slot_off(i);
            unsafe {
                self.u64_at(off + SLOT_TXNID).store(TXNID_UNSET, Ordering::SeqCst);
                self.u64_at(off + SLOT_TID).store(tid, Ordering::SeqCst);
                self.u32_at(off + SLOT_PID).store(pid, Ordering::SeqCst);
            }
            Ok(i)
        })();
        unlock_byte(&self.file, LOCK_BYTE_RALLOC)?;
        res
    }

    /// Release a slot entirely (pid goes to zero).
    pub fn release_slot(&self, i: usize) {
        let off = self.slot_off(i);
        unsafe {
            self.u64_at(off + SLOT_TXNID).store(TXNID_UNSET, Ordering::SeqCst);
            self.u32_at(off + SLOT_PID).store(0, Ordering::SeqCst);
        }
    }

    /// Lower bound for the oldest live reader. `floor` is the current
    /// head txnid; slots idle or empty don't constrain it.
    pub fn oldest(&self, floor: TxnId) -> TxnId {
        let mut oldest = floor;
        for i in 0..self.num_readers() {
            if self.slot_pid(i) != 0 {
                let id = self.slot_txnid(i);
                if id != TXNID_UNSET && id < oldest {
                    oldest = id;
                }
            }
        }
        oldest
    }

    /// Snapshot of every claimed slot.
    pub fn list(&self) -> Vec<ReaderInfo> {
        let mut out = Vec::new();
        for i in 0..self.num_readers() {
            let pid = self.slot_pid(i);
            if pid == 0 {
                continue;
            }
            let txnid = self.slot_txnid(i);
            let tid = unsafe { self.u64_at(self.slot_off(i) + SLOT_TID).load(Ordering::SeqCst) };
            out.push(ReaderInfo {
                slot: i,
                pid,
                tid,
                txnid: (txnid != TXNID_UNSET).then_some(txnid),
            });
        }
        out
    }

    /// Clear slots whose owning process is gone. Returns slots cleared.
    pub fn check_stale(&self) -> Result<usize> {
        let me = std::process::id();
        let mut cleared = 0;
        let mut dead_checked: Vec<u32> = Vec::new();
        for i in 0..self.num_readers() {
            let pid = self.slot_pid(i);
            if pid == 0 || pid == me {
                continue;
            }
            let dead = if dead_checked.contains(&pid) {
                true
            } else if pid_alive(&self.file, pid)? {
                false
            } else {
                dead_checked.push(pid);
                true
            };
            if dead {
                log::warn!("clearing stale reader slot {} (pid {})", i, pid);
                self.release_slot(i);
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    /// Take the cross-process writer lock. Blocks until available.
    pub fn writer_lock(&self) -> Result<()> {
        lock_byte_blocking(&self.file, LOCK_BYTE_WRITER)
    }

    pub fn writer_unlock(&self) -> Result<()> {
        unlock_byte(&self.file, LOCK_BYTE_WRITER)
    }

}

/// Probe whether any process still holds the liveness byte for `pid`.
#[cfg(unix)]
fn pid_alive(file: &File, pid: u32) -> Result<bool> {
    use std::os::unix::io::AsRawFd;
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = pid as libc::off_t;
    fl.l_len = 1;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl) };
    if rc != 0 {
        return Err(Error::Lock(std::io::Error::last_os_error()));
    }
    Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
}

#[cfg(not(unix))]
fn pid_alive(_file: &File, _pid: u32) -> Result<bool> {
    // No byte-range probe available; err on the side of liveness.
    Ok(true)
}

#[cfg(unix)]
fn fcntl_lock(file: &File, off: u64, typ: libc::c_short, wait: bool) -> Result<bool> {
    use std::os::unix::io::AsRawFd;
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = typ;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = off as libc::off_t;
    fl.l_len = 1;
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) if !wait => Ok(false),
        _ => Err(Error::Lock(err)),
    }
}

#[cfg(unix)]
fn try_lock_byte(file: &File, off: u64, exclusive: bool) -> Result<bool> {
    let typ = if exclusive { libc::F_WRLCK } else { libc::F_RDLCK };
    fcntl_lock(file, off, typ as libc::c_short, false)
}

#[cfg(unix)]
fn lock_byte_shared(file: &File, off: u64) -> Result<()> {
    fcntl_lock(file, off, libc::F_RDLCK as libc::c_short, true).map(|_| ())
}

#[cfg(unix)]
fn lock_byte_blocking(file: &File, off: u64) -> Result<()> {
    fcntl_lock(file, off, libc::F_WRLCK as libc::c_short, true).map(|_| ())
}

#[cfg(unix)]
fn unlock_byte(file: &File, off: u64) -> Result<()> {
    fcntl_lock(file, off, libc::F_UNLCK as libc::c_short, true).map(|_| ())
}

// Without fcntl range locks the cross-process guarantees degrade to
// in-process ones; the in-process mutexes in Env still apply.
#[cfg(not(unix))]
fn try_lock_byte(_file: &File, _off: u64, _exclusive: bool) -> Result<bool> {
    Ok(true)
}

#[cfg(not(unix))]
fn lock_byte_shared(_file: &File, _off: u64) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn lock_byte_blocking(_file: &File, _off: u64) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock_byte(_file: &File, _off: u64) -> Result<()> {
    Ok(())
}

/// Identify the current thread for the reader table.
pub(crate) fn current_tid() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut h);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_table(dir: &tempfile::TempDir) -> ReaderTable {
        ReaderTable::open(&dir.path().join("lock.mdb"), 8, false).unwrap()
    }

    #[test]
    fn claim_publish_release() {
        let dir = tempfile::tempdir().unwrap();
        let t = open_table(&dir);
        let slot = t.claim_slot(1234, 1).unwrap();
        assert_eq!(t.slot_pid(slot), 1234);
        assert_eq!(t.slot_txnid(slot), TXNID_UNSET);

        t.set_slot_txnid(slot, 7);
        assert_eq!(t.oldest(100), 7);
        assert_eq!(t.list().len(), 1);

        t.set_slot_txnid(slot, TXNID_UNSET);
        assert_eq!(t.oldest(100), 100);

        t.release_slot(slot);
        assert!(t.list().is_empty());
        // Slot is reusable.
        assert_eq!(t.claim_slot(99, 2).unwrap(), slot);
    }

    #[test]
    fn readers_full_after_max_claims() {
        let dir = tempfile::tempdir().unwrap();
        let t = open_table(&dir);
        for i in 0..8 {
            assert_eq!(t.claim_slot(100 + i, 0).unwrap(), i as usize);
        }
        assert!(matches!(t.claim_slot(999, 0), Err(Error::ReadersFull)));
    }

    #[test]
    fn stale_slots_of_dead_pids_are_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let t = open_table(&dir);
        let live = t.claim_slot(std::process::id(), 0).unwrap();
        // No process holds the liveness byte for this fake pid.
        let stale = t.claim_slot(0x7fff_fff0, 0).unwrap();
        assert_eq!(t.check_stale().unwrap(), 1);
        assert_eq!(t.slot_pid(stale), 0);
        assert_eq!(t.slot_pid(live), std::process::id());
    }

    #[test]
    fn header_txnid_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let t = open_table(&dir);
        assert_eq!(t.txnid(), 0);
        t.set_txnid(42);
        assert_eq!(t.txnid(), 42);
    }
}
