//! warren-db: an embedded key/value store over a single memory-mapped
//! file.
//!
//! The engine is a copy-on-write B+tree with two rotating meta pages:
//! one writer at a time builds the next tree version on freshly
//! allocated pages, then publishes it by rewriting the older meta page.
//! Readers pin a snapshot through a shared lock-file table and never
//! block the writer; crash recovery is simply "open the newer valid
//! meta". There is no write-ahead log.
//!
//! ```no_run
//! use warren_db::{Env, WriteFlags};
//!
//! let env = Env::builder().map_size(10 << 20).open("./db")?;
//! let mut txn = env.write_txn()?;
//! let db = txn.open_db(None, Default::default())?;
//! txn.put(db, b"hello", b"world", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let rtxn = env.read_txn()?;
//! assert_eq!(rtxn.get(db, b"hello")?, b"world");
//! # Ok::<(), warren_db::Error>(())
//! ```

// The on-disk layout fixes page numbers and sizes at 64 bits.
const _: () = assert!(std::mem::size_of::<usize>() == 8);

/// A page number. `P_INVALID` is the "no page" sentinel.
pub type PageNo = u64;
/// Transaction id; advanced only by committed write transactions.
pub type TxnId = u64;
/// The invalid page number, used for empty tree roots.
pub const P_INVALID: PageNo = PageNo::MAX;
/// Longest permitted key (and dup-sort value).
pub const MAX_KEY_SIZE: usize = 511;

mod alloc;
mod copy;
mod cursor;
mod db;
mod env;
mod error;
mod freelist;
mod idl;
mod lock;
mod meta;
mod page;
mod txn;

pub use cursor::{Cursor, WriteFlags, CURSOR_STACK};
pub use db::{DbFlags, DbStat, Dbi};
#[doc(hidden)]
pub use db::TxnDbFlags;
pub use env::{Env, EnvBuilder, EnvFlags, EnvInfo, DATA_NAME, LOCK_NAME, LOCK_SUFFIX};
pub use error::{Error, Result};
pub use lock::ReaderInfo;
pub use meta::{DbInfo, FREE_DBI, MAIN_DBI};
pub use txn::{ReadTxn, TxnRead, WriteTxn};
