//! Commit-time freelist persistence.
//!
//! The freelist tree maps a committing txnid to the pages that commit
//! released. Saving it is self-referential: writing the records touches
//! freelist pages, which frees more pages, which belong in the record
//! being written. The loop below rewrites until a full pass changes
//! nothing; the in-place rewrite path for same-shape values guarantees
//! that happens after the record's page footprint stabilizes.
//!
//! Unused reclaimed pages are parked back into the tree split across
//! several records, each sized to stay inline in a leaf node. A single
//! oversized record would need an overflow run, and allocating overflow
//! pages while the freelist is being written is the one allocation this
//! code must never ask for.
//!
//! While the save runs, the allocator is barred from the freelist tree
//! and the reclaim accumulator (`saving_freelist`), so every page it
//! hands out comes fresh off the map.

use byteorder::{ByteOrder, NativeEndian};

use crate::cursor::WriteFlags;
use crate::db::Dbi;
use crate::error::Result;
use crate::idl::IdList;
use crate::meta::FREE_DBI;
use crate::page::{node_max, NODESZ};
use crate::txn::WriteTxn;
use crate::TxnId;

fn key_bytes(id: TxnId) -> [u8; 8] {
    let mut k = [0u8; 8];
    NativeEndian::write_u64(&mut k, id);
    k
}

/// Most page numbers one parked record may carry while its value still
/// fits inline in a leaf node: an 8-byte key, the count word, then the
/// ids themselves, all inside the inline node budget.
fn ids_per_slot(psize: usize) -> usize {
    (node_max(psize) - NODESZ - 8) / 8 - 1
}

/// Persist this transaction's freed pages (and any unused reclaimed
/// pages) into the freelist tree. Runs between the descriptor flush and
/// the dirty-page flush of commit.
pub(crate) fn save(txn: &mut WriteTxn<'_>) -> Result<()> {
    txn.saving_freelist = true;
    let res = save_inner(txn);
    txn.saving_freelist = false;
    res
}

fn save_inner(txn: &mut WriteTxn<'_>) -> Result<()> {
    let free_dbi = FREE_DBI as Dbi;

    // Records whose pages we pulled into the accumulator are spent;
    // delete them before anything else so they can't be reclaimed twice.
    let consumed = std::mem::take(&mut txn.consumed);
    for key in &consumed {
        txn.del(free_dbi, &key_bytes(*key), None)?;
    }

    // Unused reclaimed pages go back under the spent keys, one page-sized
    // slice per key. Those keys sit below the oldest-reader bound, so the
    // parked pages stay reclaimable, and scanning consumes existing keys
    // smallest-first, so everything under the smallest spent key is free
    // for synthesized slots when the spent ones run out.
    let parked: Vec<u64> = txn.scratch.free_acc.as_slice().to_vec();
    debug_assert!(parked.is_empty() || !consumed.is_empty());
    let slot_cap = ids_per_slot(txn.psize());
    let mut park_keys: Vec<TxnId> = consumed;
    park_keys.sort_unstable();
    if !parked.is_empty() && !park_keys.is_empty() {
        let need = (parked.len() + slot_cap - 1) / slot_cap;
        let mut next_below = park_keys[0];
        while park_keys.len() < need && next_below > 1 {
            next_below -= 1;
            park_keys.push(next_below);
        }
    }

    loop {
        let before = (txn.top().free_pgs.len(), txn.scratch.free_acc.len());

        if !parked.is_empty() {
            // All slots carry `slot_cap` ids except the last, which
            // absorbs any remainder if the key space ran dry.
            let slots = park_keys.len().min((parked.len() + slot_cap - 1) / slot_cap);
            for (i, key) in park_keys.iter().take(slots).enumerate() {
                let start = i * slot_cap;
                let end = if i + 1 == slots {
                    parked.len()
                } else {
                    (start + slot_cap).min(parked.len())
                };
                let chunk = IdList::from_slice(&parked[start..end]);
                let val = crate::alloc::encode_idl(&chunk);
                txn.put(free_dbi, &key_bytes(*key), &val, WriteFlags::empty())?;
            }
        }

        if !txn.top().free_pgs.is_empty() {
            let val = crate::alloc::encode_idl(&txn.top().free_pgs);
            txn.put(free_dbi, &key_bytes(txn.id()), &val, WriteFlags::empty())?;
        }

        let after = (txn.top().free_pgs.len(), txn.scratch.free_acc.len());
        if after == before {
            break;
        }
    }

    log::trace!(
        "txn {}: freelist saved, {} freed, {} parked",
        txn.id(),
        txn.top().free_pgs.len(),
        parked.len()
    );
    // The accumulator's pages now live in the tree; the next writer
    // rediscovers them with a fresh scan.
    txn.scratch.free_acc.clear();
    txn.scratch.last_reclaimed = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::leaf_size;

    #[test]
    fn slot_capacity_keeps_records_inline() {
        for psize in [256usize, 4096, 32768] {
            let cap = ids_per_slot(psize);
            assert!(cap >= 2, "page size {psize} leaves no slot room");
            // A full slot's record (8-byte key, count word, ids) must
            // stay under the inline node budget, never an overflow run.
            let value_bytes = (cap + 1) * 8;
            assert!(
                leaf_size(&[0u8; 8], value_bytes) <= node_max(psize),
                "page size {psize}: slot of {cap} ids would overflow"
            );
        }
    }
}
