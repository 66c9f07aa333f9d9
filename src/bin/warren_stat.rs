//! Print environment, freelist, reader, and per-database statistics.

use std::process::ExitCode;

use byteorder::{ByteOrder, NativeEndian};
use warren_db::{DbStat, Dbi, Env, EnvFlags, Error, FREE_DBI, MAIN_DBI};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Opts {
    all: bool,
    env_info: bool,
    freelist: u8,
    readers: u8,
    no_subdir: bool,
    subdb: Option<String>,
    path: String,
}

fn usage() -> ! {
    eprintln!("usage: warren-stat [-V] [-a|-s subdb] [-e] [-f[f[f]]] [-n] [-r[r]] dbpath");
    std::process::exit(2);
}

fn parse_args() -> Opts {
    let mut opts = Opts {
        all: false,
        env_info: false,
        freelist: 0,
        readers: 0,
        no_subdir: false,
        subdb: None,
        path: String::new(),
    };
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" => {
                println!("warren-stat {VERSION}");
                std::process::exit(0);
            }
            "-a" => opts.all = true,
            "-e" => opts.env_info = true,
            "-f" => opts.freelist = opts.freelist.max(1),
            "-ff" => opts.freelist = opts.freelist.max(2),
            "-fff" => opts.freelist = 3,
            "-n" => opts.no_subdir = true,
            "-r" => opts.readers = opts.readers.max(1),
            "-rr" => opts.readers = 2,
            "-s" => opts.subdb = Some(args.next().unwrap_or_else(|| usage())),
            s if s.starts_with('-') => usage(),
            _ => {
                if path.is_some() {
                    usage();
                }
                path = Some(arg);
            }
        }
    }
    if opts.all && opts.subdb.is_some() {
        usage();
    }
    opts.path = path.unwrap_or_else(|| usage());
    opts
}

fn print_stat(label: &str, stat: &DbStat) {
    println!("Status of {label}");
    println!("  Tree depth: {}", stat.depth);
    println!("  Branch pages: {}", stat.branch_pages);
    println!("  Leaf pages: {}", stat.leaf_pages);
    println!("  Overflow pages: {}", stat.overflow_pages);
    println!("  Entries: {}", stat.entries);
}

fn run(opts: &Opts) -> Result<(), Error> {
    let mut flags = EnvFlags::READ_ONLY;
    if opts.no_subdir {
        flags |= EnvFlags::NO_SUBDIR;
    }
    let env = Env::builder().max_dbs(128).flags(flags).open(&opts.path)?;

    if opts.env_info {
        let info = env.info()?;
        println!("Environment Info");
        println!("  Map size: {}", info.map_size);
        println!("  Page size: {}", env.page_size());
        println!("  Max pages: {}", info.map_size / env.page_size());
        println!("  Number of pages used: {}", info.last_pgno + 1);
        println!("  Last transaction ID: {}", info.last_txnid);
        println!("  Max readers: {}", info.max_readers);
        println!("  Number of readers used: {}", info.num_readers);
    }

    if opts.readers > 0 {
        if opts.readers > 1 {
            let cleared = env.reader_check()?;
            if cleared > 0 {
                println!("{cleared} stale readers cleared");
            }
        }
        println!("Reader Table Status");
        let readers = env.reader_list();
        if readers.is_empty() {
            println!("  (no active readers)");
        } else {
            println!("  {:>10} {:>18} {:>12}", "pid", "thread", "txnid");
            for r in readers {
                let txnid = r
                    .txnid
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("  {:>10} {:>18x} {:>12}", r.pid, r.tid, txnid);
            }
        }
    }

    let txn = env.read_txn()?;

    if opts.freelist > 0 {
        let stat = txn.db_stat(FREE_DBI as Dbi)?;
        let mut pages = 0u64;
        let mut cursor = txn.cursor(FREE_DBI as Dbi)?;
        let mut next = cursor.first(&txn);
        while let Ok((key, value)) = next {
            let txnid = NativeEndian::read_u64(key);
            let count = NativeEndian::read_u64(&value[0..8]);
            pages += count;
            if opts.freelist > 1 {
                println!("    Transaction {txnid}, {count} pages");
                if opts.freelist > 2 {
                    for chunk in value[8..].chunks(8) {
                        println!("      {}", NativeEndian::read_u64(chunk));
                    }
                }
            }
            next = cursor.next(&txn);
        }
        println!("Freelist Status");
        print_stat("Freelist", &stat);
        println!("  Free pages: {pages}");
    }

    if opts.all {
        print_stat("Main DB", &txn.db_stat(MAIN_DBI as Dbi)?);
        let mut names = Vec::new();
        let mut cursor = txn.cursor(MAIN_DBI as Dbi)?;
        let mut next = cursor.first(&txn);
        while let Ok((key, _)) = next {
            if cursor.current_is_db_record(&txn)? {
                if let Ok(name) = std::str::from_utf8(key) {
                    names.push(name.to_owned());
                }
            }
            next = cursor.next(&txn);
        }
        drop(cursor);
        for name in names {
            let mut sub_txn = env.read_txn()?;
            match sub_txn.open_db(Some(&name)) {
                Ok(db) => print_stat(&name, &sub_txn.db_stat(db)?),
                Err(Error::Incompatible) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
    } else if let Some(name) = &opts.subdb {
        let mut txn = env.read_txn()?;
        let db = txn.open_db(Some(name))?;
        print_stat(name, &txn.db_stat(db)?);
    } else {
        print_stat("Main DB", &txn.db_stat(MAIN_DBI as Dbi)?);
    }
    Ok(())
}

fn main() -> ExitCode {
    let opts = parse_args();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("warren-stat: {}: {e}", opts.path);
            ExitCode::FAILURE
        }
    }
}
