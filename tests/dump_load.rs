//! The interoperability utilities: dump/load round trips, stat, copy.

use std::process::Command;

use warren_db::{DbFlags, Env, WriteFlags, MAIN_DBI};

fn dump_bin() -> &'static str {
    env!("CARGO_BIN_EXE_warren-dump")
}

fn load_bin() -> &'static str {
    env!("CARGO_BIN_EXE_warren-load")
}

fn stat_bin() -> &'static str {
    env!("CARGO_BIN_EXE_warren-stat")
}

fn copy_bin() -> &'static str {
    env!("CARGO_BIN_EXE_warren-copy")
}

fn seed_env(dir: &tempfile::TempDir) -> Env {
    let env = Env::builder()
        .map_size(8 << 20)
        .max_dbs(8)
        .open(dir.path())
        .unwrap();
    let mut txn = env.write_txn().unwrap();
    let main = MAIN_DBI as u32;
    for i in 0..50u32 {
        let key = format!("key{i:03}");
        let mut val = format!("value-{i}\x01").into_bytes();
        val.push(0xfe);
        txn.put(main, key.as_bytes(), &val, WriteFlags::empty())
            .unwrap();
    }
    let dups = txn
        .open_db(Some("dups"), DbFlags::DUP_SORT | DbFlags::CREATE)
        .unwrap();
    for i in 0..10u32 {
        for j in 0..5u32 {
            txn.put(
                dups,
                format!("dk{i}").as_bytes(),
                format!("dv{j}").as_bytes(),
                WriteFlags::empty(),
            )
            .unwrap();
        }
    }
    txn.commit().unwrap();
    env
}

#[test]
fn dump_load_round_trip_is_canonical() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let env = seed_env(&src);
    drop(env);

    let dump1 = Command::new(dump_bin())
        .args(["-a", src.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert!(
        dump1.status.success(),
        "dump failed: {}",
        String::from_utf8_lossy(&dump1.stderr)
    );
    assert!(!dump1.stdout.is_empty());

    // Feed the dump into a fresh environment.
    let mut load = Command::new(load_bin())
        .arg(dst.path().to_str().unwrap())
        .stdin(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    use std::io::Write;
    load.stdin
        .as_mut()
        .unwrap()
        .write_all(&dump1.stdout)
        .unwrap();
    let load_out = load.wait_with_output().unwrap();
    assert!(
        load_out.status.success(),
        "load failed: {}",
        String::from_utf8_lossy(&load_out.stderr)
    );

    // Dumping the copy reproduces the bytes exactly.
    let dump2 = Command::new(dump_bin())
        .args(["-a", dst.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert!(dump2.status.success());
    assert_eq!(
        String::from_utf8_lossy(&dump1.stdout),
        String::from_utf8_lossy(&dump2.stdout)
    );
}

#[test]
fn dump_printable_escapes_round_trip() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    {
        let env = Env::builder().map_size(4 << 20).open(src.path()).unwrap();
        let mut txn = env.write_txn().unwrap();
        txn.put(
            MAIN_DBI as u32,
            b"bin\x00key\\x",
            b"\x7f\x80value",
            WriteFlags::empty(),
        )
        .unwrap();
        txn.commit().unwrap();
    }

    let dump = Command::new(dump_bin())
        .args(["-p", src.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert!(dump.status.success());
    let text = String::from_utf8(dump.stdout.clone()).unwrap();
    assert!(text.contains("format=print"));
    assert!(text.contains("\\00"), "NUL should be escaped: {text}");
    assert!(text.contains("\\\\"), "backslash should be doubled");

    let mut load = Command::new(load_bin())
        .arg(dst.path().to_str().unwrap())
        .stdin(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    use std::io::Write;
    load.stdin.as_mut().unwrap().write_all(&dump.stdout).unwrap();
    assert!(load.wait().unwrap().success());

    let env = Env::builder().map_size(4 << 20).open(dst.path()).unwrap();
    let txn = env.read_txn().unwrap();
    assert_eq!(
        txn.get(MAIN_DBI as u32, b"bin\x00key\\x").unwrap(),
        b"\x7f\x80value"
    );
}

#[test]
fn stat_reports_environment_and_readers() {
    let dir = tempfile::tempdir().unwrap();
    let env = seed_env(&dir);
    // Hold a reader open so the table shows something.
    let txn = env.read_txn().unwrap();

    let out = Command::new(stat_bin())
        .args(["-e", "-r", "-a", dir.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stat failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.contains("Environment Info"));
    assert!(text.contains("Last transaction ID: 1"));
    assert!(text.contains("Reader Table Status"));
    assert!(text.contains("Status of Main DB"));
    assert!(text.contains("Status of dups"));
    assert!(text.contains("Entries: 50"));
    drop(txn);
}

#[test]
fn copy_utility_produces_openable_env() {
    let src = tempfile::tempdir().unwrap();
    let dst_raw = tempfile::tempdir().unwrap();
    let dst_compact = tempfile::tempdir().unwrap();
    let env = seed_env(&src);
    drop(env);

    for (dst, flag) in [(&dst_raw, None), (&dst_compact, Some("-c"))] {
        let mut cmd = Command::new(copy_bin());
        if let Some(f) = flag {
            cmd.arg(f);
        }
        let out = cmd
            .args([src.path().to_str().unwrap(), dst.path().to_str().unwrap()])
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "copy failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        let env = Env::builder()
            .map_size(8 << 20)
            .max_dbs(8)
            .open(dst.path())
            .unwrap();
        let txn = env.read_txn().unwrap();
        assert_eq!(txn.get(MAIN_DBI as u32, b"key007").unwrap(), b"value-7\x01\xfe");
        assert_eq!(txn.db_stat(MAIN_DBI as u32).unwrap().entries, 50 + 1);
    }

    // A compacting copy dumps byte-identically to its source.
    let dump_src = Command::new(dump_bin())
        .args(["-a", src.path().to_str().unwrap()])
        .output()
        .unwrap();
    let dump_cpy = Command::new(dump_bin())
        .args(["-a", dst_compact.path().to_str().unwrap()])
        .output()
        .unwrap();
    assert!(dump_src.status.success() && dump_cpy.status.success());
    assert_eq!(
        String::from_utf8_lossy(&dump_src.stdout),
        String::from_utf8_lossy(&dump_cpy.stdout)
    );
}
