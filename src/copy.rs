//! Environment backup: raw page copy and compacting copy.
//!
//! The compacting path renumbers live pages densely from 2 upward while
//! walking the snapshot, so the destination file contains exactly the
//! reachable pages and an empty freelist. Page images flow through a
//! bounded channel to a dedicated writer thread: the walker fills one
//! buffer while the writer drains another.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::cursor::tree_ctx;
use crate::db::Dbi;
use crate::env::{Env, EnvFlags, DATA_NAME};
use crate::error::{Error, Result};
use crate::meta::{DbInfo, Meta, FREE_DBI, MAIN_DBI, NUM_METAS};
use crate::page::{NodeFlags, PageMut, PageRef};
use crate::txn::TxnRead;
use crate::{PageNo, P_INVALID};

/// Number of page images a buffer batch carries to the writer thread.
const BATCH_PAGES: usize = 64;

pub(crate) fn copy_env(env: &Env, dst: &Path, compact: bool) -> Result<()> {
    let dst_file = open_destination(env, dst)?;
    let txn = env.read_txn()?;
    if compact {
        copy_compact(env, &txn, dst_file)
    } else {
        copy_raw(env, &txn, dst_file)
    }
}

/// Stream a raw (non-compacting) copy of the current snapshot to any
/// writer; page order is file order, so the output is a valid data file.
pub(crate) fn copy_env_to_writer(env: &Env, out: &mut dyn std::io::Write) -> Result<()> {
    let txn = env.read_txn()?;
    let psize = env.page_size();
    let meta = snapshot_meta(env, &txn)?;
    for which in 0..NUM_METAS {
        let mut page = vec![0u8; psize];
        meta.write_page(&mut page, which);
        out.write_all(&page).map_err(Error::Io)?;
    }
    let last = meta.last_pgno;
    let mut pgno = NUM_METAS as PageNo;
    while pgno <= last {
        let chunk = ((last - pgno + 1) as usize).min(256);
        let bytes = env.inner.map_bytes(pgno as usize * psize, chunk * psize)?;
        out.write_all(bytes).map_err(Error::Io)?;
        pgno += chunk as PageNo;
    }
    out.flush().map_err(Error::Io)
}

fn open_destination(env: &Env, dst: &Path) -> Result<File> {
    let data_path: PathBuf = if env.flags().contains(EnvFlags::NO_SUBDIR) {
        dst.to_path_buf()
    } else {
        dst.join(DATA_NAME)
    };
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&data_path)
        .map_err(Error::Open)
}

fn write_at(file: &File, data: &[u8], off: u64) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
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

/// Verbatim copy of the snapshot: synthesized meta pages, then every
/// page up to the snapshot's last page straight out of the map.
fn copy_raw(env: &Env, txn: &crate::txn::ReadTxn, dst: File) -> Result<()> {
    let psize = env.page_size();
    let inner = &env.inner;
    let meta = snapshot_meta(env, txn)?;
    write_metas(&dst, &meta, psize)?;

    let last = meta.last_pgno;
    let mut pgno = NUM_METAS as PageNo;
    while pgno <= last {
        let chunk = ((last - pgno + 1) as usize).min(256);
        let bytes = inner.map_bytes(pgno as usize * psize, chunk * psize)?;
        write_at(&dst, bytes, pgno * psize as u64)?;
        pgno += chunk as PageNo;
    }
    dst.sync_all().map_err(Error::Sync)?;
    Ok(())
}

fn snapshot_meta(env: &Env, txn: &crate::txn::ReadTxn) -> Result<Meta> {
    let mut meta = env.inner.pick_meta()?;
    if meta.txnid != txn.id() {
        // The writer moved on since our snapshot pinned; rebuild the
        // meta from the snapshot's own descriptor table.
        meta.txnid = txn.id();
        meta.last_pgno = txn.snapshot_last_pgno();
        let (free, _, _) = txn.db_snapshot(FREE_DBI as Dbi)?;
        let (main, _, _) = txn.db_snapshot(MAIN_DBI as Dbi)?;
        meta.dbs[FREE_DBI] = free;
        meta.dbs[MAIN_DBI] = main;
        meta.dbs[FREE_DBI].key_size = env.page_size() as u32;
    }
    Ok(meta)
}

fn write_metas(dst: &File, meta: &Meta, psize: usize) -> Result<()> {
    // Both copies carry the same txnid; the next writer alternates from
    // there.
    for which in 0..NUM_METAS {
        let mut page = vec![0u8; psize];
        meta.write_page(&mut page, which);
        write_at(dst, &page, (which * psize) as u64)?;
    }
    Ok(())
}

/// A batch of renumbered page images on their way to the writer thread.
struct Batch {
    first_pgno: PageNo,
    data: Vec<u8>,
}

struct Compactor<'a> {
    txn: &'a crate::txn::ReadTxn,
    psize: usize,
    next_pgno: PageNo,
    batch: Vec<u8>,
    batch_first: PageNo,
    tx: mpsc::SyncSender<Batch>,
}

impl<'a> Compactor<'a> {
    /// Emit one already-renumbered page image; `buf` must be
    /// `npages * psize` long.
    fn emit(&mut self, buf: &[u8]) -> Result<()> {
        if self.batch.is_empty() {
            self.batch_first = self.next_pgno;
        }
        self.batch.extend_from_slice(buf);
        self.next_pgno += (buf.len() / self.psize) as PageNo;
        if self.batch.len() >= BATCH_PAGES * self.psize {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.batch);
        self.tx
            .send(Batch {
                first_pgno: self.batch_first,
                data,
            })
            .map_err(|_| Error::Panic)?;
        Ok(())
    }

    /// Copy the tree under `root`, returning its new root page number.
    fn walk(&mut self, root: PageNo) -> Result<PageNo> {
        if root == P_INVALID {
            return Ok(P_INVALID);
        }
        let bytes = self.txn.page_bytes(root)?.to_vec();
        let page = PageRef::new(&bytes);

        if page.is_branch() {
            // Children first, so their new numbers are known here.
            let n = page.num_keys();
            let mut children = Vec::with_capacity(n);
            for i in 0..n {
                children.push(self.walk(page.node(i)?.child_pgno())?);
            }
            let mut image = bytes.clone();
            {
                let mut pm = PageMut::new(&mut image);
                pm.set_pgno(self.next_pgno);
                for (i, child) in children.iter().enumerate() {
                    pm.set_child(i, *child)?;
                }
            }
            return self.emit_image(image);
        }

        if !page.is_leaf() {
            return Err(Error::Corrupted);
        }
        let mut image = bytes.clone();
        if !page.is_leaf2() {
            for i in 0..page.num_keys() {
                let node = page.node(i)?;
                let nf = node.flags();
                if nf.contains(NodeFlags::BIGDATA) {
                    let new_head = self.copy_overflow(node.overflow_pgno()?)?;
                    let (off, _) = page.node_data_region(i)?;
                    image[off..off + 8].copy_from_slice(&new_head.to_ne_bytes());
                } else if nf.contains(NodeFlags::SUBDATA) {
                    let mut info = DbInfo::read(node.data()?)?;
                    info.root = self.walk(info.root)?;
                    let (off, len) = page.node_data_region(i)?;
                    image[off..off + len].copy_from_slice(bytemuck::bytes_of(&info));
                }
            }
        }
        {
            let mut pm = PageMut::new(&mut image);
            pm.set_pgno(self.next_pgno);
        }
        self.emit_image(image)
    }

    fn emit_image(&mut self, image: Vec<u8>) -> Result<PageNo> {
        let pgno = self.next_pgno;
        self.emit(&image)?;
        Ok(pgno)
    }

    fn copy_overflow(&mut self, head: PageNo) -> Result<PageNo> {
        let run = self.txn.page_bytes(head)?.to_vec();
        let mut image = run;
        {
            let mut pm = PageMut::new(&mut image);
            pm.set_pgno(self.next_pgno);
        }
        self.emit_image(image)
    }
}

/// Walk the live trees, renumbering pages densely; the destination gets
/// an empty freelist.
fn copy_compact(env: &Env, txn: &crate::txn::ReadTxn, dst: File) -> Result<()> {
    let psize = env.page_size();
    let (tx, rx) = mpsc::sync_channel::<Batch>(2);

    let psize_w = psize;
    let writer = std::thread::spawn(move || -> Result<File> {
        while let Ok(batch) = rx.recv() {
            write_at(&dst, &batch.data, batch.first_pgno * psize_w as u64)?;
        }
        Ok(dst)
    });

    let main_ctx = tree_ctx(txn, MAIN_DBI as Dbi)?;
    let mut comp = Compactor {
        txn,
        psize,
        next_pgno: NUM_METAS as PageNo,
        batch: Vec::with_capacity(BATCH_PAGES * psize),
        batch_first: 0,
        tx,
    };
    let walk_res = comp
        .walk(main_ctx.root)
        .and_then(|root| comp.flush().map(|()| root));
    let last_pgno = comp.next_pgno - 1;
    drop(comp); // closes the channel; the writer sees EOF

    let dst = writer.join().map_err(|_| Error::Panic)??;
    let new_root = walk_res?;

    let mut meta = snapshot_meta(env, txn)?;
    meta.dbs[FREE_DBI] = DbInfo::new(meta.dbs[FREE_DBI].flags);
    meta.dbs[FREE_DBI].key_size = psize as u32;
    meta.dbs[MAIN_DBI].root = new_root;
    meta.last_pgno = last_pgno.max((NUM_METAS - 1) as PageNo);
    write_metas(&dst, &meta, psize)?;
    dst.sync_all().map_err(Error::Sync)?;
    log::debug!(
        "compacting copy done: {} pages, root {}",
        last_pgno + 1,
        new_root
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::WriteFlags;

    #[test]
    fn compact_copy_preserves_contents() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let env = Env::builder().map_size(4 << 20).open(src.path()).unwrap();
        {
            let mut txn = env.write_txn().unwrap();
            let db = txn.open_db(None, Default::default()).unwrap();
            for i in 0..200u32 {
                let k = format!("key-{i:05}");
                let v = vec![i as u8; 300];
                txn.put(db, k.as_bytes(), &v, WriteFlags::empty()).unwrap();
            }
            // Churn so the freelist is non-trivial.
            for i in (0..200u32).step_by(3) {
                let k = format!("key-{i:05}");
                txn.del(db, k.as_bytes(), None).unwrap();
            }
            txn.commit().unwrap();
        }
        env.copy_to(dst.path(), true).unwrap();

        let copy = Env::builder().map_size(4 << 20).open(dst.path()).unwrap();
        let src_txn = env.read_txn().unwrap();
        let dst_txn = copy.read_txn().unwrap();
        let sdb = MAIN_DBI as Dbi;
        for i in 0..200u32 {
            let k = format!("key-{i:05}");
            let expect = src_txn.get(sdb, k.as_bytes());
            let got = dst_txn.get(sdb, k.as_bytes());
            match (expect, got) {
                (Ok(a), Ok(b)) => assert_eq!(a, b),
                (Err(Error::NotFound), Err(Error::NotFound)) => {}
                other => panic!("mismatch at {k}: {other:?}"),
            }
        }
        // The copy is dense: no free pages at all.
        let stat = dst_txn.db_stat(FREE_DBI as Dbi).unwrap();
        assert_eq!(stat.entries, 0);
    }

    #[test]
    fn raw_copy_opens_identically() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let env = Env::builder().map_size(4 << 20).open(src.path()).unwrap();
        {
            let mut txn = env.write_txn().unwrap();
            let db = txn.open_db(None, Default::default()).unwrap();
            txn.put(db, b"alpha", b"1", WriteFlags::empty()).unwrap();
            txn.put(db, b"beta", b"2", WriteFlags::empty()).unwrap();
            txn.commit().unwrap();
        }
        env.copy_to(dst.path(), false).unwrap();
        let copy = Env::builder().map_size(4 << 20).open(dst.path()).unwrap();
        let txn = copy.read_txn().unwrap();
        assert_eq!(txn.get(MAIN_DBI as Dbi, b"alpha").unwrap(), b"1");
        assert_eq!(txn.get(MAIN_DBI as Dbi, b"beta").unwrap(), b"2");
    }
}
