//! Transaction semantics: snapshots, nesting, recovery, reclamation.

use warren_db::{DbStat, Env, Error, WriteFlags, FREE_DBI, MAIN_DBI};

fn open_env(dir: &tempfile::TempDir) -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    Env::builder()
        .map_size(16 << 20)
        .max_dbs(4)
        .open(dir.path())
        .unwrap()
}

const DB: u32 = MAIN_DBI as u32;

#[test]
fn readers_see_their_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"k", b"v1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let r1 = env.read_txn().unwrap();
    assert_eq!(r1.get(DB, b"k").unwrap(), b"v1");

    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"k", b"v2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    // The old reader still sees v1; a fresh reader sees v2.
    assert_eq!(r1.get(DB, b"k").unwrap(), b"v1");
    let r2 = env.read_txn().unwrap();
    assert_eq!(r2.get(DB, b"k").unwrap(), b"v2");
    assert!(r2.id() > r1.id());
}

#[test]
fn reset_renew_rebinds_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"a", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    let mut r = env.read_txn().unwrap();
    let first_id = r.id();
    r.reset();
    // While reset, the slot pins nothing and reads are rejected.
    assert!(matches!(r.get(DB, b"a"), Err(Error::BadTxn)));

    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"a", b"2", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    r.renew().unwrap();
    assert!(r.id() > first_id);
    assert_eq!(r.get(DB, b"a").unwrap(), b"2");
}

#[test]
fn abort_discards_everything() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"kept", b"1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"dropped", b"x", WriteFlags::empty()).unwrap();
        txn.del(DB, b"kept", None).unwrap();
        txn.abort();
    }
    let r = env.read_txn().unwrap();
    assert_eq!(r.get(DB, b"kept").unwrap(), b"1");
    assert!(matches!(r.get(DB, b"dropped"), Err(Error::NotFound)));
}

#[test]
fn nested_txn_commit_and_abort() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.write_txn().unwrap();
    txn.put(DB, b"base", b"b", WriteFlags::empty()).unwrap();

    // A committed child folds into the parent.
    txn.begin_child().unwrap();
    txn.put(DB, b"child1", b"c1", WriteFlags::empty()).unwrap();
    txn.commit_child().unwrap();

    // An aborted child disappears, including overwrites of parent data.
    txn.begin_child().unwrap();
    txn.put(DB, b"child2", b"c2", WriteFlags::empty()).unwrap();
    txn.put(DB, b"base", b"overwritten", WriteFlags::empty()).unwrap();
    txn.abort_child().unwrap();

    assert_eq!(txn.get(DB, b"base").unwrap(), b"b");
    assert_eq!(txn.get(DB, b"child1").unwrap(), b"c1");
    assert!(matches!(txn.get(DB, b"child2"), Err(Error::NotFound)));
    txn.commit().unwrap();

    let r = env.read_txn().unwrap();
    assert_eq!(r.get(DB, b"base").unwrap(), b"b");
    assert_eq!(r.get(DB, b"child1").unwrap(), b"c1");
    assert!(matches!(r.get(DB, b"child2"), Err(Error::NotFound)));
}

#[test]
fn nested_txn_shadows_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.write_txn().unwrap();
    for k in [b"a", b"b", b"c"] {
        txn.put(DB, k, b"v", WriteFlags::empty()).unwrap();
    }
    let mut c = txn.cursor(DB).unwrap();
    c.set(&txn, b"b").unwrap();

    // The child reshapes the tree around the parked cursor, then aborts.
    txn.begin_child().unwrap();
    for i in 0..300u32 {
        let key = format!("fill{i:04}");
        txn.put(DB, key.as_bytes(), &[1u8; 100], WriteFlags::empty()).unwrap();
    }
    txn.abort_child().unwrap();

    // The cursor is back where it was.
    let (k, _) = c.get_current(&txn).unwrap();
    assert_eq!(k, b"b");
    assert_eq!(c.next(&txn).unwrap().0, b"c");
    txn.commit().unwrap();
}

fn tree_pages(stat: &DbStat) -> u64 {
    stat.branch_pages + stat.leaf_pages + stat.overflow_pages
}

/// Pages in the freelist tree records, by summing the stored counts.
fn free_record_pages(env: &Env) -> u64 {
    let txn = env.read_txn().unwrap();
    let mut cursor = txn.cursor(FREE_DBI as u32).unwrap();
    let mut total = 0u64;
    let mut next = cursor.first(&txn);
    while let Ok((_, value)) = next {
        let mut count = [0u8; 8];
        count.copy_from_slice(&value[0..8]);
        total += u64::from_ne_bytes(count);
        next = cursor.next(&txn);
    }
    total
}

#[test]
fn freelist_conserves_every_page() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    // Churn across several commits so pages are freed and reclaimed.
    for round in 0..6u32 {
        let mut txn = env.write_txn().unwrap();
        for i in 0..120u32 {
            let key = format!("r{round}k{i:04}");
            txn.put(DB, key.as_bytes(), &[round as u8; 333], WriteFlags::empty())
                .unwrap();
        }
        if round > 0 {
            let prev = round - 1;
            for i in (0..120u32).step_by(2) {
                let key = format!("r{prev}k{i:04}");
                txn.del(DB, key.as_bytes(), None).unwrap();
            }
        }
        txn.commit().unwrap();

        // Conservation: freelist + reachable trees + metas == all pages.
        let txn = env.read_txn().unwrap();
        let main = txn.db_stat(DB).unwrap();
        let free = txn.db_stat(FREE_DBI as u32).unwrap();
        let info = env.info().unwrap();
        drop(txn);
        let accounted =
            free_record_pages(&env) + tree_pages(&main) + tree_pages(&free) + 2;
        assert_eq!(
            accounted,
            info.last_pgno + 1,
            "round {round}: {} freelisted, {} main, {} freeDB",
            free_record_pages(&env),
            tree_pages(&main),
            tree_pages(&free)
        );
    }

    // Reclamation works: many more rounds shouldn't balloon the file.
    let before = env.info().unwrap().last_pgno;
    for round in 6..16u32 {
        let mut txn = env.write_txn().unwrap();
        for i in 0..120u32 {
            let key = format!("r{round}k{i:04}");
            txn.put(DB, key.as_bytes(), &[round as u8; 333], WriteFlags::empty())
                .unwrap();
        }
        let prev = round - 1;
        for i in 0..120u32 {
            let key = format!("r{prev}k{i:04}");
            let _ = txn.del(DB, key.as_bytes(), None);
        }
        txn.commit().unwrap();
    }
    let after = env.info().unwrap().last_pgno;
    assert!(
        after < before * 4,
        "file grew {before} -> {after}; reclamation is not happening"
    );
}

#[test]
fn crash_recovery_falls_back_to_older_meta() {
    let dir = tempfile::tempdir().unwrap();
    let psize;
    let second_meta_slot;
    {
        let env = open_env(&dir);
        psize = env.page_size();
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"stable", b"one", WriteFlags::empty()).unwrap();
        txn.commit().unwrap(); // txn 1 -> meta slot 1

        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"stable", b"two", WriteFlags::empty()).unwrap();
        txn.put(DB, b"extra", b"x", WriteFlags::empty()).unwrap();
        txn.commit().unwrap(); // txn 2 -> meta slot 0
        second_meta_slot = 0usize;
    }

    // Simulate a torn write of the newer meta page.
    let data_path = dir.path().join(warren_db::DATA_NAME);
    let mut bytes = std::fs::read(&data_path).unwrap();
    let off = second_meta_slot * psize;
    for b in &mut bytes[off + 16..off + 64] {
        *b = 0xFF;
    }
    std::fs::write(&data_path, &bytes).unwrap();

    // Reopen: the env falls back to the txn-1 state.
    let env = open_env(&dir);
    let txn = env.read_txn().unwrap();
    assert_eq!(txn.id(), 1);
    assert_eq!(txn.get(DB, b"stable").unwrap(), b"one");
    assert!(matches!(txn.get(DB, b"extra"), Err(Error::NotFound)));
    drop(txn);

    // And the env keeps working from there.
    let mut txn = env.write_txn().unwrap();
    txn.put(DB, b"stable", b"three", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
    let txn = env.read_txn().unwrap();
    assert_eq!(txn.get(DB, b"stable").unwrap(), b"three");
}

#[cfg(unix)]
#[test]
fn stale_reader_slots_are_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    {
        let mut txn = env.write_txn().unwrap();
        txn.put(DB, b"pin", b"v1", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    // A child process opens a read txn and dies without cleanup.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0);
    if pid == 0 {
        let txn = env.read_txn().unwrap();
        std::mem::forget(txn);
        unsafe { libc::_exit(0) };
    }
    let mut status = 0;
    unsafe { libc::waitpid(pid, &mut status, 0) };

    // The dead reader's slot is visible, then swept.
    let seen: Vec<u32> = env.reader_list().iter().map(|r| r.pid).collect();
    assert!(
        seen.contains(&(pid as u32)),
        "dead reader not in table: {seen:?}"
    );
    let cleared = env.reader_check().unwrap();
    assert!(cleared >= 1);
    assert!(!env.reader_list().iter().any(|r| r.pid == pid as u32));

    // Writers can commit and reclaim again afterwards.
    let mut txn = env.write_txn().unwrap();
    txn.put(DB, b"pin", b"v2", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn map_full_surfaces_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let _ = env_logger::builder().is_test(true).try_init();
    // A deliberately tiny map.
    let env = Env::builder().map_size(256 * 1024).open(dir.path()).unwrap();
    let mut txn = env.write_txn().unwrap();
    let mut hit_full = false;
    for i in 0..10_000u32 {
        let key = format!("k{i:06}");
        match txn.put(DB, key.as_bytes(), &[0u8; 500], WriteFlags::empty()) {
            Ok(()) => {}
            Err(Error::MapFull) => {
                hit_full = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(hit_full, "map never filled");
    // The txn is still abortable without poisoning the env.
    txn.abort();
    let mut txn = env.write_txn().unwrap();
    txn.put(DB, b"ok", b"1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();
}

#[test]
fn no_overwrite_and_current_flags() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.write_txn().unwrap();
    txn.put(DB, b"k", b"first", WriteFlags::empty()).unwrap();
    assert!(matches!(
        txn.put(DB, b"k", b"second", WriteFlags::NO_OVERWRITE),
        Err(Error::KeyExist)
    ));
    assert_eq!(txn.get(DB, b"k").unwrap(), b"first");

    let mut c = txn.cursor(DB).unwrap();
    c.set(&txn, b"k").unwrap();
    c.put(&mut txn, b"k", b"newer", WriteFlags::CURRENT).unwrap();
    assert_eq!(txn.get(DB, b"k").unwrap(), b"newer");
    txn.commit().unwrap();
}

#[test]
fn named_dbs_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let env = open_env(&dir);
        let mut txn = env.write_txn().unwrap();
        let animals = txn
            .open_db(Some("animals"), warren_db::DbFlags::CREATE)
            .unwrap();
        let colors = txn
            .open_db(Some("colors"), warren_db::DbFlags::CREATE)
            .unwrap();
        txn.put(animals, b"otter", b"lutra", WriteFlags::empty()).unwrap();
        txn.put(colors, b"teal", b"#008080", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    {
        let env = open_env(&dir);
        let mut txn = env.read_txn().unwrap();
        let animals = txn.open_db(Some("animals")).unwrap();
        let colors = txn.open_db(Some("colors")).unwrap();
        assert_eq!(txn.get(animals, b"otter").unwrap(), b"lutra");
        assert_eq!(txn.get(colors, b"teal").unwrap(), b"#008080");
        assert!(matches!(txn.open_db(Some("missing")), Err(Error::NotFound)));
    }
    // drop_db removes the record and its pages.
    {
        let env = open_env(&dir);
        let mut txn = env.write_txn().unwrap();
        let animals = txn
            .open_db(Some("animals"), warren_db::DbFlags::empty())
            .unwrap();
        txn.drop_db(animals, true).unwrap();
        txn.commit().unwrap();

        let mut txn = env.read_txn().unwrap();
        assert!(matches!(txn.open_db(Some("animals")), Err(Error::NotFound)));
        let colors = txn.open_db(Some("colors")).unwrap();
        assert_eq!(txn.get(colors, b"teal").unwrap(), b"#008080");
    }
}

#[test]
fn parked_reclaim_splits_into_page_sized_records() {
    let dir = tempfile::tempdir().unwrap();
    let _ = env_logger::builder().is_test(true).try_init();
    let env = Env::builder().map_size(32 << 20).open(dir.path()).unwrap();

    // Build a wide tree, pad the txnid space with small commits, then
    // drop the whole tree so one commit frees many hundreds of pages
    // into a single freelist record.
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..1400u32 {
            let key = format!("wide{i:05}");
            txn.put(DB, key.as_bytes(), &[7u8; 1500], WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
    }
    for i in 0..8u32 {
        let mut txn = env.write_txn().unwrap();
        let key = format!("pad{i}");
        txn.put(DB, key.as_bytes(), b"x", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..1400u32 {
            let key = format!("wide{i:05}");
            txn.del(DB, key.as_bytes(), None).unwrap();
        }
        txn.commit().unwrap();
    }

    // Two more small writes: the first moves the oldest-reader bound
    // past the big record, the second reclaims it, uses a page or two,
    // and must park the rest. The parked pages may not ride in one
    // oversized record: every freelist value has to stay inside a
    // single leaf node, spread over several txnid-keyed slots.
    for i in 8..10u32 {
        let mut txn = env.write_txn().unwrap();
        let key = format!("pad{i}");
        txn.put(DB, key.as_bytes(), b"x", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }

    let psize = env.page_size();
    let txn = env.read_txn().unwrap();
    let mut cursor = txn.cursor(FREE_DBI as u32).unwrap();
    let mut records = 0usize;
    let mut next = cursor.first(&txn);
    while let Ok((_, value)) = next {
        records += 1;
        assert!(
            value.len() <= psize / 2,
            "freelist record of {} bytes would need an overflow run",
            value.len()
        );
        next = cursor.next(&txn);
    }
    assert!(
        records >= 3,
        "expected the parked pages split across slots, got {records} records"
    );

    // Conservation still holds across the split records.
    let main = txn.db_stat(DB).unwrap();
    let free = txn.db_stat(FREE_DBI as u32).unwrap();
    let info = env.info().unwrap();
    drop(txn);
    let accounted = free_record_pages(&env) + tree_pages(&main) + tree_pages(&free) + 2;
    assert_eq!(accounted, info.last_pgno + 1);

    // And the parked pages are really reclaimable: rebuilding a tree of
    // the same shape must come almost entirely out of them.
    let before = env.info().unwrap().last_pgno;
    {
        let mut txn = env.write_txn().unwrap();
        for i in 0..700u32 {
            let key = format!("reuse{i:05}");
            txn.put(DB, key.as_bytes(), &[9u8; 1500], WriteFlags::empty())
                .unwrap();
        }
        txn.commit().unwrap();
    }
    let after = env.info().unwrap().last_pgno;
    assert!(
        after <= before + 16,
        "reuse grew the file {before} -> {after} instead of draining parked pages"
    );
}
