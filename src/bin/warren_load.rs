//! Load records produced by warren-dump into an environment.

use std::io::{BufRead, BufReader, Read};
use std::process::ExitCode;

use warren_db::{DbFlags, Env, EnvFlags, Error, WriteFlags};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Opts {
    file: Option<String>,
    subdb: Option<String>,
    append: bool,
    no_overwrite: bool,
    no_subdir: bool,
    plain_text: bool,
    all: bool,
    path: String,
}

fn usage() -> ! {
    eprintln!("usage: warren-load [-V] [-a] [-f input] [-n] [-s subdb] [-N] [-T] dbpath");
    std::process::exit(2);
}

fn parse_args() -> Opts {
    let mut opts = Opts {
        file: None,
        subdb: None,
        append: false,
        no_overwrite: false,
        no_subdir: false,
        plain_text: false,
        all: false,
        path: String::new(),
    };
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-V" => {
                println!("warren-load {VERSION}");
                std::process::exit(0);
            }
            "-f" => opts.file = Some(args.next().unwrap_or_else(|| usage())),
            "-s" => opts.subdb = Some(args.next().unwrap_or_else(|| usage())),
            "-a" => opts.append = true,
            "-N" => opts.no_overwrite = true,
            "-n" => opts.no_subdir = true,
            "-T" => opts.plain_text = true,
            s if s.starts_with('-') => usage(),
            _ => {
                if path.is_some() {
                    usage();
                }
                path = Some(arg);
            }
        }
    }
    opts.all = opts.subdb.is_none();
    opts.path = path.unwrap_or_else(|| usage());
    opts
}

#[derive(Default)]
struct Header {
    database: Option<String>,
    mapsize: Option<usize>,
    flags: DbFlags,
}

fn unescape_printable(line: &str) -> Result<Vec<u8>, String> {
    let bytes = line.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\\' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'\\' {
                out.push(b'\\');
                i += 2;
            } else if i + 2 < bytes.len() {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(|| format!("bad escape at column {i}"))?;
                out.push(hex);
                i += 3;
            } else {
                return Err("truncated escape".into());
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    Ok(out)
}

fn unhex(line: &str) -> Result<Vec<u8>, String> {
    let s = line.trim_end();
    if s.len() % 2 != 0 {
        return Err("odd-length hex line".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn read_header(lines: &mut impl Iterator<Item = std::io::Result<String>>) -> Result<Option<(Header, bool)>, Error> {
    let mut header = Header::default();
    let mut printable = false;
    let mut saw_any = false;
    for line in lines {
        let line = line.map_err(Error::Io)?;
        saw_any = true;
        let line = line.trim_end();
        if line == "HEADER=END" {
            return Ok(Some((header, printable)));
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "VERSION" => {}
            "format" => printable = v == "print",
            "database" => header.database = Some(v.to_owned()),
            "type" => {
                if v != "btree" {
                    eprintln!("warren-load: unsupported type {v}");
                    return Err(Error::Incompatible);
                }
            }
            "mapsize" => header.mapsize = v.parse().ok(),
            "maxreaders" | "db_pagesize" | "mapaddr" => {}
            "reversekey" => header.flags |= DbFlags::REVERSE_KEY,
            "duplicates" => header.flags |= DbFlags::DUP_SORT,
            "integerkey" => header.flags |= DbFlags::INTEGER_KEY,
            "dupfixed" => header.flags |= DbFlags::DUP_FIXED,
            "integerdup" => header.flags |= DbFlags::INTEGER_DUP,
            "reversedup" => header.flags |= DbFlags::REVERSE_DUP,
            _ => eprintln!("warren-load: ignoring unknown header {k}"),
        }
    }
    if saw_any {
        Err(Error::Incompatible)
    } else {
        Ok(None)
    }
}

fn run(opts: &Opts) -> Result<(), Error> {
    let input: Box<dyn Read> = match &opts.file {
        Some(path) => Box::new(std::fs::File::open(path).map_err(Error::Open)?),
        None => Box::new(std::io::stdin()),
    };
    let reader = BufReader::new(input);
    let mut lines = reader.lines().peekable();

    // The first header names the map size the data came from; sizing the
    // new environment identically keeps dump -> load -> dump canonical.
    let mut pending: Option<(Header, bool)> = if opts.plain_text {
        None
    } else {
        match read_header(&mut lines)? {
            Some(h) => Some(h),
            None => return Ok(()),
        }
    };

    let mut flags = EnvFlags::empty();
    if opts.no_subdir {
        flags |= EnvFlags::NO_SUBDIR;
    }
    let mut builder = Env::builder().max_dbs(128).flags(flags);
    if let Some((h, _)) = &pending {
        if let Some(ms) = h.mapsize {
            builder = builder.map_size(ms);
        }
    }
    let env = builder.open(&opts.path)?;

    loop {
        let (header, printable) = if let Some(h) = pending.take() {
            h
        } else if opts.plain_text {
            if lines.peek().is_none() {
                break;
            }
            (Header::default(), true)
        } else {
            match read_header(&mut lines)? {
                Some(h) => h,
                None => break,
            }
        };
        if let Some(ms) = header.mapsize {
            // Later blocks may name a bigger map; growth is cheap here.
            env.set_mapsize(ms)?;
        }

        let mut txn = env.write_txn()?;
        let name = opts.subdb.clone().or(header.database);
        let db_flags = header.flags | DbFlags::CREATE;
        let db = txn.open_db(name.as_deref(), db_flags)?;
        let dupsort = header.flags.contains(DbFlags::DUP_SORT);

        let mut put_flags = WriteFlags::empty();
        if opts.append {
            put_flags |= if dupsort {
                WriteFlags::APPEND_DUP
            } else {
                WriteFlags::APPEND
            };
        }
        if opts.no_overwrite {
            put_flags |= WriteFlags::NO_OVERWRITE;
        }

        let mut count = 0u64;
        loop {
            let Some(key_line) = lines.next() else {
                if !opts.plain_text {
                    eprintln!("warren-load: unexpected EOF before DATA=END");
                }
                break;
            };
            let key_line = key_line.map_err(Error::Io)?;
            if key_line.trim_end() == "DATA=END" {
                break;
            }
            let Some(data_line) = lines.next() else {
                eprintln!("warren-load: odd number of data lines");
                return Err(Error::Incompatible);
            };
            let data_line = data_line.map_err(Error::Io)?;

            let decode = |line: &str| -> Result<Vec<u8>, Error> {
                let body = line.strip_prefix(' ').unwrap_or(line);
                let decoded = if printable {
                    unescape_printable(body)
                } else {
                    unhex(body)
                };
                decoded.map_err(|e| {
                    eprintln!("warren-load: {e}");
                    Error::Incompatible
                })
            };
            let key = decode(&key_line)?;
            let data = decode(&data_line)?;
            match txn.put(db, &key, &data, put_flags) {
                Ok(()) => count += 1,
                Err(Error::KeyExist) if opts.no_overwrite => {
                    eprintln!("warren-load: skipping existing key");
                }
                Err(e) => return Err(e),
            }
        }
        txn.commit()?;
        eprintln!(
            "warren-load: loaded {count} records into {}",
            name.as_deref().unwrap_or("[main]")
        );
        if opts.plain_text {
            break;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let opts = parse_args();
    match run(&opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("warren-load: {}: {e}", opts.path);
            ExitCode::FAILURE
        }
    }
}
