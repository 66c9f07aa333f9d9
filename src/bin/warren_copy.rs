//! Copy an environment, optionally compacting it.

use std::process::ExitCode;

use warren_db::{Env, EnvFlags, Error};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn usage() -> ! {
    eprintln!("usage: warren-copy [-V] [-c] [-n] srcpath [dstpath]");
    std::process::exit(2);
}

fn main() -> ExitCode {
    let mut compact = false;
    let mut no_subdir = false;
    let mut paths: Vec<String> = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-V" => {
                println!("warren-copy {VERSION}");
                return ExitCode::SUCCESS;
            }
            "-c" => compact = true,
            "-n" => no_subdir = true,
            s if s.starts_with('-') => usage(),
            _ => paths.push(arg),
        }
    }
    let (src, dst) = match paths.len() {
        1 => (paths[0].clone(), None),
        2 => (paths[0].clone(), Some(paths[1].clone())),
        _ => usage(),
    };
    if dst.is_none() && compact {
        eprintln!("warren-copy: compacting copy requires a destination path");
        return ExitCode::FAILURE;
    }

    let mut flags = EnvFlags::READ_ONLY;
    if no_subdir {
        flags |= EnvFlags::NO_SUBDIR;
    }
    let res: Result<(), Error> = (|| {
        let env = Env::builder().flags(flags).open(&src)?;
        match &dst {
            Some(dst) => env.copy_to(dst, compact),
            None => env.copy_to_writer(&mut std::io::stdout().lock()),
        }
    })();
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("warren-copy: {src}: {e}");
            ExitCode::FAILURE
        }
    }
}
