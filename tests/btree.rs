//! Tree-shape scenarios: splits, merges, duplicate sets, overflow values.

use warren_db::{DbFlags, Env, Error, WriteFlags, MAIN_DBI};

fn open_env(dir: &tempfile::TempDir) -> Env {
    let _ = env_logger::builder().is_test(true).try_init();
    Env::builder()
        .map_size(16 << 20)
        .max_dbs(4)
        .open(dir.path())
        .unwrap()
}

#[test]
fn split_then_merge_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);

    // Two dozen 1000-byte values force several leaf splits.
    {
        let mut txn = env.write_txn().unwrap();
        let db = MAIN_DBI as u32;
        for i in 0..24u32 {
            let key = format!("k{i:03}");
            let val = vec![b'v'; 1000];
            txn.put(db, key.as_bytes(), &val, WriteFlags::empty()).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let txn = env.read_txn().unwrap();
        let stat = txn.db_stat(MAIN_DBI as u32).unwrap();
        assert!(stat.depth >= 2, "expected a split, depth {}", stat.depth);
        assert_eq!(stat.entries, 24);

        let mut cursor = txn.cursor(MAIN_DBI as u32).unwrap();
        let mut keys = Vec::new();
        let mut next = cursor.first(&txn);
        while let Ok((k, v)) = next {
            assert_eq!(v.len(), 1000);
            keys.push(String::from_utf8(k.to_vec()).unwrap());
            next = cursor.next(&txn);
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 24);
    }

    // Deleting every other key shrinks the tree again.
    {
        let mut txn = env.write_txn().unwrap();
        for i in (0..24u32).step_by(2) {
            let key = format!("k{i:03}");
            txn.del(MAIN_DBI as u32, key.as_bytes(), None).unwrap();
        }
        txn.commit().unwrap();
    }
    {
        let txn = env.read_txn().unwrap();
        let stat = txn.db_stat(MAIN_DBI as u32).unwrap();
        assert_eq!(stat.entries, 12);
        let mut cursor = txn.cursor(MAIN_DBI as u32).unwrap();
        let mut count = 0;
        let mut last = None;
        let mut next = cursor.first(&txn);
        while let Ok((k, _)) = next {
            let k = k.to_vec();
            if let Some(prev) = &last {
                assert!(*prev < k);
            }
            last = Some(k);
            count += 1;
            next = cursor.next(&txn);
        }
        assert_eq!(count, 12);
    }
}

#[test]
fn dup_sort_promotes_and_demotes() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.write_txn().unwrap();
    let db = txn.open_db(Some("dups"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();

    // Grow one key's dup set well past the inline threshold.
    let values: Vec<Vec<u8>> = (0..40u8).map(|i| vec![i; 120]).collect();
    for v in &values {
        txn.put(db, b"k", v, WriteFlags::empty()).unwrap();
    }
    {
        let mut cursor = txn.cursor(db).unwrap();
        cursor.set(&txn, b"k").unwrap();
        assert_eq!(cursor.count(&txn).unwrap(), 40);
    }

    // The pairs come back in value order, regardless of representation.
    {
        let mut cursor = txn.cursor(db).unwrap();
        let mut got = Vec::new();
        let mut next = cursor.first(&txn);
        while let Ok((k, v)) = next {
            assert_eq!(k, b"k");
            got.push(v.to_vec());
            next = cursor.next(&txn);
        }
        assert_eq!(got, values);
    }

    // Exact duplicate pairs are rejected.
    assert!(matches!(
        txn.put(db, b"k", &values[7], WriteFlags::empty()),
        Err(Error::KeyExist)
    ));

    // Shrink back down; the set must survive the representation change.
    for v in values.iter().take(37) {
        txn.del(db, b"k", Some(v)).unwrap();
    }
    {
        let mut cursor = txn.cursor(db).unwrap();
        cursor.set(&txn, b"k").unwrap();
        assert_eq!(cursor.count(&txn).unwrap(), 3);
    }
    for v in values.iter().skip(37) {
        txn.del(db, b"k", Some(v)).unwrap();
    }
    assert!(matches!(txn.get(db, b"k"), Err(Error::NotFound)));
    txn.commit().unwrap();
}

#[test]
fn dup_cursor_operators() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.write_txn().unwrap();
    let db = txn.open_db(Some("d"), DbFlags::DUP_SORT | DbFlags::CREATE).unwrap();

    for key in [b"a", b"b", b"c"] {
        for val in [b"x1", b"x2", b"x3"] {
            txn.put(db, key, val, WriteFlags::empty()).unwrap();
        }
    }

    let mut c = txn.cursor(db).unwrap();
    // get_both positions on an exact pair.
    let (k, v) = c.get_both(&txn, b"b", b"x2").unwrap();
    assert_eq!((k, v), (&b"b"[..], &b"x2"[..]));
    // get_both_range rounds up within the dup set.
    let (_, v) = c.get_both_range(&txn, b"b", b"x2a").unwrap();
    assert_eq!(v, b"x3");

    // next_dup stays on the key, next_nodup leaves it.
    c.set(&txn, b"a").unwrap();
    assert_eq!(c.next_dup(&txn).unwrap().1, b"x2");
    let (k, v) = c.next_nodup(&txn).unwrap();
    assert_eq!((k, v), (&b"b"[..], &b"x1"[..]));
    // last_dup of the current key.
    assert_eq!(c.last_dup(&txn).unwrap(), b"x3");
    // prev from (b, x3) walks back within the dup set first.
    assert_eq!(c.prev(&txn).unwrap().1, b"x2");

    // Full pair ordering sweep.
    let mut pairs = Vec::new();
    let mut next = c.first(&txn);
    while let Ok((k, v)) = next {
        pairs.push((k.to_vec(), v.to_vec()));
        next = c.next(&txn);
    }
    let mut sorted = pairs.clone();
    sorted.sort();
    assert_eq!(pairs, sorted);
    assert_eq!(pairs.len(), 9);
    txn.commit().unwrap();
}

#[test]
fn dup_fixed_get_multiple() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let mut txn = env.write_txn().unwrap();
    let db = txn
        .open_db(
            Some("fixed"),
            DbFlags::DUP_SORT | DbFlags::DUP_FIXED | DbFlags::CREATE,
        )
        .unwrap();

    let mut packed = Vec::new();
    for i in 0..100u32 {
        packed.extend_from_slice(&i.to_ne_bytes());
    }
    {
        let mut c = txn.cursor(db).unwrap();
        let stored = c.put_multiple(&mut txn, b"k", &packed, 4, 100).unwrap();
        assert_eq!(stored, 100);
        c.set(&mut txn, b"k").unwrap();
        assert_eq!(c.count(&txn).unwrap(), 100);

        // One call returns a whole page's worth of packed values.
        c.first(&txn).unwrap();
        let run = c.get_multiple(&txn).unwrap();
        assert!(run.len() >= 4 && run.len() % 4 == 0);
        assert_eq!(&run[0..4], &0u32.to_ne_bytes());
        let mut total = run.len() / 4;
        while let Ok(run) = c.next_multiple(&txn) {
            assert_eq!(run.len() % 4, 0);
            total += run.len() / 4;
        }
        assert_eq!(total, 100);
    }
    // Wrong-size values are rejected outright.
    assert!(matches!(
        txn.put(db, b"k", b"12345", WriteFlags::empty()),
        Err(Error::BadValSize)
    ));
    txn.commit().unwrap();
}

#[test]
fn overflow_values_round_trip_and_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let psize = env.page_size();
    let value: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();

    {
        let mut txn = env.write_txn().unwrap();
        txn.put(MAIN_DBI as u32, b"big", &value, WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
    }
    {
        let txn = env.read_txn().unwrap();
        let stat = txn.db_stat(MAIN_DBI as u32).unwrap();
        let expect = (value.len() + 16 - 1) / psize + 1;
        assert_eq!(stat.overflow_pages, expect as u64);
        assert_eq!(txn.get(MAIN_DBI as u32, b"big").unwrap(), &value[..]);
    }
    {
        let mut txn = env.write_txn().unwrap();
        txn.del(MAIN_DBI as u32, b"big", None).unwrap();
        txn.commit().unwrap();
    }
    // The run's pages land in the freelist tree.
    {
        let txn = env.read_txn().unwrap();
        assert_eq!(txn.db_stat(MAIN_DBI as u32).unwrap().overflow_pages, 0);
        let free = txn.db_stat(warren_db::FREE_DBI as u32).unwrap();
        assert!(free.entries >= 1);
    }
}

#[test]
fn append_mode_packs_and_rejects_disorder() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let psize = env.page_size();
    let mut txn = env.write_txn().unwrap();
    let db = MAIN_DBI as u32;

    let n = 1000u32;
    for i in 0..n {
        let key = format!("{i:08}");
        txn.put(db, key.as_bytes(), b"0123456789abcdef", WriteFlags::APPEND)
            .unwrap();
    }
    // Out of order: already past this key.
    assert!(matches!(
        txn.put(db, b"00000001", b"x", WriteFlags::APPEND),
        Err(Error::KeyExist)
    ));

    let stat = txn.db_stat(db).unwrap();
    assert_eq!(stat.entries, n as u64);
    // Appended leaves should be nearly full: within 2x of the minimum.
    let node = 2 + 8 + 8 + 16; // slot + header + key + value
    let per_page = (psize - 16) / node;
    let min_leaves = (n as usize + per_page - 1) / per_page;
    assert!(
        (stat.leaf_pages as usize) < min_leaves * 2,
        "{} leaves for a minimum of {}",
        stat.leaf_pages,
        min_leaves
    );
    txn.commit().unwrap();
}

#[test]
fn random_churn_matches_model() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let db = MAIN_DBI as u32;
    let mut model = std::collections::BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xdb);

    for round in 0..10 {
        let mut txn = env.write_txn().unwrap();
        for _ in 0..400 {
            let key = format!("key{:04}", rng.gen_range(0..800u32));
            if rng.gen_bool(0.3) && model.contains_key(&key) {
                txn.del(db, key.as_bytes(), None).unwrap();
                model.remove(&key);
            } else {
                let len = rng.gen_range(1..400usize);
                let val = vec![rng.gen::<u8>(); len];
                txn.put(db, key.as_bytes(), &val, WriteFlags::empty()).unwrap();
                model.insert(key, val);
            }
        }
        txn.commit().unwrap();

        // Every round, the whole tree matches the model in both content
        // and order.
        let txn = env.read_txn().unwrap();
        let mut cursor = txn.cursor(db).unwrap();
        let mut iter = model.iter();
        let mut next = cursor.first(&txn);
        while let Ok((k, v)) = next {
            let (mk, mv) = iter.next().unwrap_or_else(|| {
                panic!("round {round}: extra key {:?}", String::from_utf8_lossy(k))
            });
            assert_eq!(k, mk.as_bytes());
            assert_eq!(v, &mv[..]);
            next = cursor.next(&txn);
        }
        assert!(iter.next().is_none(), "round {round}: missing keys");
    }

    // Survives a full reopen.
    drop(env);
    let env = Env::builder().map_size(16 << 20).open(dir.path()).unwrap();
    let txn = env.read_txn().unwrap();
    assert_eq!(txn.db_stat(db).unwrap().entries, model.len() as u64);
    for (k, v) in &model {
        assert_eq!(txn.get(db, k.as_bytes()).unwrap(), &v[..]);
    }
}

#[test]
fn set_range_and_reverse_iteration() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let db = MAIN_DBI as u32;
    let mut txn = env.write_txn().unwrap();
    for k in ["apple", "banana", "cherry", "damson"] {
        txn.put(db, k.as_bytes(), k.as_bytes(), WriteFlags::empty()).unwrap();
    }

    let mut c = txn.cursor(db).unwrap();
    let (k, _) = c.set_range(&txn, b"b").unwrap();
    assert_eq!(k, b"banana");
    assert!(matches!(c.set_range(&txn, b"zzz"), Err(Error::NotFound)));
    assert!(matches!(c.set(&txn, b"berry"), Err(Error::NotFound)));

    let (k, _) = c.last(&txn).unwrap();
    assert_eq!(k, b"damson");
    assert_eq!(c.prev(&txn).unwrap().0, b"cherry");
    assert_eq!(c.prev(&txn).unwrap().0, b"banana");
    assert_eq!(c.prev(&txn).unwrap().0, b"apple");
    assert!(matches!(c.prev(&txn), Err(Error::NotFound)));
    txn.commit().unwrap();
}

#[test]
fn reserve_returns_writable_region() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let db = MAIN_DBI as u32;
    let mut txn = env.write_txn().unwrap();
    {
        let mut c = txn.cursor(db).unwrap();
        let region = c
            .put_reserve(&mut txn, b"filled-later", 32, WriteFlags::empty())
            .unwrap();
        assert_eq!(region.len(), 32);
        region.copy_from_slice(&[7u8; 32]);
    }
    assert_eq!(txn.get(db, b"filled-later").unwrap(), &[7u8; 32]);
    txn.commit().unwrap();

    let txn = env.read_txn().unwrap();
    assert_eq!(txn.get(db, b"filled-later").unwrap(), &[7u8; 32]);
}

#[test]
fn tracked_cursors_survive_splits() {
    let dir = tempfile::tempdir().unwrap();
    let env = open_env(&dir);
    let db = MAIN_DBI as u32;
    let mut txn = env.write_txn().unwrap();

    // Park a cursor on a key, then force the leaf it sits on to split.
    txn.put(db, b"park", b"here", WriteFlags::empty()).unwrap();
    let mut parked = txn.cursor(db).unwrap();
    parked.set(&txn, b"park").unwrap();

    for i in 0..200u32 {
        let key = format!("n{i:04}");
        txn.put(db, key.as_bytes(), &[0u8; 200], WriteFlags::empty()).unwrap();
    }

    // The parked cursor still reads its entry and iterates correctly.
    let (k, v) = parked.get_current(&txn).unwrap();
    assert_eq!((k, v), (&b"park"[..], &b"here"[..]));
    txn.commit().unwrap();
}
