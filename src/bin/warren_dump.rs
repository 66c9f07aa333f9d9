//! Dump the contents of an environment in a loadable textual format.

use std::io::Write;
use std::process::ExitCode;

use warren_db::{DbFlags, Dbi, Env, EnvFlags, Error, MAIN_DBI};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Opts {
    file: Option<String>,
    subdb: Option<String>,
    all: bool,
    list: bool,
    no_subdir: bool,
    printable: bool,
    path: String,
}

fn usage() -> ! {
    eprintln!("usage: warren-dump [-V] [-f output] [-l] [-n] [-p] [-a|-s subdb] dbpath");
    std::process::exit(2);
}

fn parse_args() -> Opts {
    let mut opts = Opts {
        file: None,
        subdb: None,
        all: false,
        list: false,
        no_subdir: false,
        printable: false,
        path: String::new(),
    };
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" => {
                println!("warren-dump {VERSION}");
                std::process::exit(0);
            }
            "-f" => opts.file = Some(args.next().unwrap_or_else(|| usage())),
            "-s" => opts.subdb = Some(args.next().unwrap_or_else(|| usage())),
            "-a" => opts.all = true,
            "-l" => opts.list = true,
            "-n" => opts.no_subdir = true,
            "-p" => opts.printable = true,
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

fn escape_printable(out: &mut dyn Write, data: &[u8]) -> std::io::Result<()> {
    for &b in data {
        if b == b'\\' {
            out.write_all(b"\\\\")?;
        } else if (32..127).contains(&b) {
            out.write_all(&[b])?;
        } else {
            write!(out, "\\{b:02x}")?;
        }
    }
    Ok(())
}

fn write_hex(out: &mut dyn Write, data: &[u8]) -> std::io::Result<()> {
    for &b in data {
        write!(out, "{b:02x}")?;
    }
    Ok(())
}

fn dump_db(
    out: &mut dyn Write,
    env: &Env,
    txn: &warren_db::ReadTxn,
    db: Dbi,
    name: Option<&str>,
    printable: bool,
) -> Result<(), Error> {
    let info = env.info()?;
    let stat = txn.db_stat(db)?;
    let flags = txn.db_flags(db)?;

    writeln!(out, "VERSION=3").map_err(Error::Io)?;
    writeln!(
        out,
        "format={}",
        if printable { "print" } else { "bytevalue" }
    )
    .map_err(Error::Io)?;
    if let Some(name) = name {
        writeln!(out, "database={name}").map_err(Error::Io)?;
    }
    writeln!(out, "type=btree").map_err(Error::Io)?;
    writeln!(out, "mapsize={}", info.map_size).map_err(Error::Io)?;
    writeln!(out, "maxreaders={}", info.max_readers).map_err(Error::Io)?;
    for (bit, label) in [
        (DbFlags::REVERSE_KEY, "reversekey"),
        (DbFlags::DUP_SORT, "duplicates"),
        (DbFlags::INTEGER_KEY, "integerkey"),
        (DbFlags::DUP_FIXED, "dupfixed"),
        (DbFlags::INTEGER_DUP, "integerdup"),
        (DbFlags::REVERSE_DUP, "reversedup"),
    ] {
        if flags.contains(bit) {
            writeln!(out, "{label}=1").map_err(Error::Io)?;
        }
    }
    writeln!(out, "db_pagesize={}", stat.page_size).map_err(Error::Io)?;
    writeln!(out, "HEADER=END").map_err(Error::Io)?;

    let mut cursor = txn.cursor(db)?;
    let mut next = cursor.first(txn);
    loop {
        let (key, data) = match next {
            Ok(kv) => kv,
            Err(Error::NotFound) => break,
            Err(e) => return Err(e),
        };
        // Sub-database descriptor records are structure, not data.
        if name.is_none() && cursor.current_is_db_record(txn)? {
            next = cursor.next(txn);
            continue;
        }
        let emit = |out: &mut dyn Write, bytes: &[u8]| -> std::io::Result<()> {
            out.write_all(b" ")?;
            if printable {
                escape_printable(out, bytes)?;
            } else {
                write_hex(out, bytes)?;
            }
            out.write_all(b"\n")
        };
        emit(out, key).map_err(Error::Io)?;
        emit(out, data).map_err(Error::Io)?;
        next = cursor.next(txn);
    }
    writeln!(out, "DATA=END").map_err(Error::Io)?;
    Ok(())
}

/// Names of the sub-databases recorded in the main tree.
fn list_subdbs(txn: &warren_db::ReadTxn) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    let mut cursor = txn.cursor(MAIN_DBI as Dbi)?;
    let mut next = cursor.first(txn);
    loop {
        let (key, _) = match next {
            Ok(kv) => kv,
            Err(Error::NotFound) => break,
            Err(e) => return Err(e),
        };
        if cursor.current_is_db_record(txn)? {
            if let Ok(name) = std::str::from_utf8(key) {
                names.push(name.to_owned());
            }
        }
        next = cursor.next(txn);
    }
    Ok(names)
}

fn run(opts: &Opts) -> Result<(), Error> {
    let mut flags = EnvFlags::READ_ONLY;
    if opts.no_subdir {
        flags |= EnvFlags::NO_SUBDIR;
    }
    let env = Env::builder().max_dbs(128).flags(flags).open(&opts.path)?;
    let mut txn = env.read_txn()?;

    let stdout = std::io::stdout();
    let mut file_out;
    let mut stdout_lock;
    let out: &mut dyn Write = match &opts.file {
        Some(path) => {
            file_out = std::fs::File::create(path).map_err(Error::Open)?;
            &mut file_out
        }
        None => {
            stdout_lock = stdout.lock();
            &mut stdout_lock
        }
    };

    if opts.list {
        for name in list_subdbs(&txn)? {
            writeln!(out, "{name}").map_err(Error::Io)?;
        }
        return Ok(());
    }

    if opts.all {
        // The default key space first, then every named database.
        dump_db(out, &env, &txn, MAIN_DBI as Dbi, None, opts.printable)?;
        for name in list_subdbs(&txn)? {
            let db = match txn.open_db(Some(&name)) {
                Ok(db) => db,
                Err(Error::Incompatible) | Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            };
            dump_db(out, &env, &txn, db, Some(&name), opts.printable)?;
        }
        Ok(())
    } else if let Some(name) = &opts.subdb {
        let db = txn.open_db(Some(name))?;
        dump_db(out, &env, &txn, db, Some(name), opts.printable)
    } else {
        dump_db(out, &env, &txn, MAIN_DBI as Dbi, None, opts.printable)
    }
}

fn main() -> ExitCode {
    let opts = parse_args();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("warren-dump: {}: {e}", opts.path);
            ExitCode::FAILURE
        }
    }
}
