//! Page allocation for the write transaction.
//!
//! Priority order: the loose list (pages freed and re-allocatable within
//! this txn), then the environment's reclaim accumulator, then freelist
//! records old enough that no live reader can still see the pages, and
//! only then fresh pages off the end of the map.

use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Error, Result};
use crate::idl::IdList;
use crate::meta::FREE_DBI;
use crate::txn::WriteTxn;
use crate::{PageNo, TxnId};

/// Decode a freelist record value: native u64 count, then that many
/// descending page numbers.
pub(crate) fn decode_idl(value: &[u8]) -> Result<IdList> {
    if value.len() < 8 || value.len() % 8 != 0 {
        return Err(Error::Corrupted);
    }
    let count = NativeEndian::read_u64(&value[0..8]) as usize;
    if value.len() != (count + 1) * 8 {
        return Err(Error::Corrupted);
    }
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(NativeEndian::read_u64(&value[8 * (i + 1)..8 * (i + 2)]));
    }
    Ok(IdList::from_slice(&ids))
}

/// Serialize an [`IdList`] into freelist record form.
pub(crate) fn encode_idl(idl: &IdList) -> Vec<u8> {
    let mut out = vec![0u8; (idl.len() + 1) * 8];
    NativeEndian::write_u64(&mut out[0..8], idl.len() as u64);
    for (i, id) in idl.iter().enumerate() {
        NativeEndian::write_u64(&mut out[8 * (i + 1)..8 * (i + 2)], id);
    }
    out
}

impl WriteTxn<'_> {
    /// Allocate `num` contiguous pages, registered dirty in the top
    /// frame. Returns the first page number of the run.
    pub(crate) fn alloc_pages(&mut self, num: usize) -> Result<PageNo> {
        debug_assert!(num >= 1);

        // Loose pages are singles made by this txn; cheapest of all.
        if num == 1 {
            if let Some(pgno) = self.top_mut().loose.pop() {
                self.add_dirty(pgno, 1)?;
                log::trace!("txn {}: reused loose page {}", self.id, pgno);
                return Ok(pgno);
            }
        }

        if self.top().dirty_room == 0 {
            return Err(Error::TxnFull);
        }

        if !self.saving_freelist {
            loop {
                if let Some(pgno) = self.scratch.free_acc.take_run(num) {
                    self.add_dirty(pgno, num)?;
                    return Ok(pgno);
                }
                if !self.pull_freelist_record()? {
                    break;
                }
            }
        }

        // Fresh pages off the end of the map.
        let next = self.top().next_pgno;
        if next + num as PageNo <= self.env.inner.map_pages() {
            self.top_mut().next_pgno = next + num as PageNo;
            self.add_dirty(next, num)?;
            return Ok(next);
        }
        log::debug!(
            "txn {}: map full at pgno {} wanting {} pages",
            self.id,
            next,
            num
        );
        Err(Error::MapFull)
    }

    /// Merge the next reclaimable freelist record into the accumulator.
    /// Returns false when none qualifies.
    fn pull_freelist_record(&mut self) -> Result<bool> {
        // The bound is derived once per txn; a stale value only delays
        // reclamation.
        let oldest = match self.oldest {
            Some(o) => o,
            None => {
                let o = self.env.inner.oldest_reader(self.id - 1);
                self.oldest = Some(o);
                o
            }
        };
        let after: TxnId = self.scratch.last_reclaimed;
        let mut seek = [0u8; 8];
        NativeEndian::write_u64(&mut seek, after + 1);
        let Some((key, value)) =
            crate::cursor::seek_range_owned(self, FREE_DBI as u32, &seek)?
        else {
            return Ok(false);
        };
        if key.len() != 8 {
            return Err(Error::Corrupted);
        }
        let key_id = NativeEndian::read_u64(&key);
        if key_id >= oldest {
            return Ok(false);
        }
        let idl = decode_idl(&value)?;
        log::trace!(
            "txn {}: reclaimed {} pages freed by txn {}",
            self.id,
            idl.len(),
            key_id
        );
        self.scratch.free_acc.merge(&idl);
        self.scratch.last_reclaimed = key_id;
        self.consumed.push(key_id);
        Ok(true)
    }

    /// Pages an operation of this shape may dirty: the tree path plus a
    /// little slack, plus the value's overflow run for puts.
    pub(crate) fn op_need(&self, depth: usize, extra_bytes: usize) -> usize {
        let psize = self.env.inner.psize;
        depth + 3 + (extra_bytes + psize - 1) / psize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idl_codec_round_trip() {
        let idl = IdList::from_slice(&[40, 22, 21, 20, 7]);
        let bytes = encode_idl(&idl);
        assert_eq!(bytes.len(), 48);
        let back = decode_idl(&bytes).unwrap();
        assert_eq!(back.as_slice(), idl.as_slice());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let idl = IdList::from_slice(&[9, 8]);
        let mut bytes = encode_idl(&idl);
        bytes.truncate(16);
        assert!(matches!(decode_idl(&bytes), Err(Error::Corrupted)));
    }
}
