//! Bulk operations on record list segments: copy, delete and move
//! between pages, and page reorganization.

use crate::buffer::{BufBlock, PageBuf};
use crate::dict::Index;
use crate::error::{Error, Result};
use crate::lock::LockSys;
use crate::mtr::{LogMode, Mtr, RedoBody};
use crate::page::{
    self, PAGE_FREE, PAGE_GARBAGE, PAGE_INFIMUM, PAGE_LAST_INSERT, PAGE_N_DIR_SLOTS, PAGE_N_RECS,
    PAGE_SUPREMUM, cur, dir,
};
use crate::rec::{self, EncodedRec, Offsets};
use std::sync::Arc;

/// Total byte size and record count of the sublist `from..supremum`.
fn measure_list_end(frame: &PageBuf, from: u16) -> (usize, usize) {
    let mut size = 0usize;
    let mut n_recs = 0usize;
    let mut rec = from;
    while !page::rec_is_supremum(rec) {
        let offsets = Offsets::compute(frame, rec);
        size += offsets.size();
        n_recs += 1;
        rec = rec::next_offs(frame, rec);
    }
    (size, n_recs)
}

fn encoded_from_page(frame: &PageBuf, off: u16) -> EncodedRec {
    let offsets = Offsets::compute(frame, off);
    EncodedRec {
        bytes: frame[offsets.start() as usize..offsets.end() as usize].to_vec(),
        extra: offsets.extra_size(),
    }
}

/// Copy records one at a time at the cursor position after the last
/// existing record of the destination. An insert failure past the
/// capacity precheck means the destination is corrupt.
fn copy_rec_list_end_no_locks(
    new_block: &Arc<BufBlock>,
    block: &Arc<BufBlock>,
    rec_off: u16,
    index: &Index,
    mtr: &mut Mtr,
) {
    let mut cur1 = rec_off;
    if page::rec_is_infimum(cur1) {
        cur1 = rec::next_offs(block.frame(), cur1);
    }
    // the destination's own records are all greater than the copied
    // ones, so the cursor starts right after the infimum
    let mut cur2 = PAGE_INFIMUM;
    while !page::rec_is_supremum(cur1) {
        let ins = encoded_from_page(block.frame(), cur1);
        match cur::insert_rec(new_block, index, cur2, &ins, mtr) {
            Some(ins_rec) => cur2 = ins_rec,
            None => {
                page::print_diag(new_block.frame(), "destination of failed record list copy");
                page::print_diag(block.frame(), "source of failed record list copy");
                tracing::error!(
                    rec = rec_off,
                    cur1,
                    cur2,
                    "record list copy ran out of space past the precheck"
                );
                page::corruption_abort(new_block.frame(), "insert failed during list copy");
            }
        }
        cur1 = rec::next_offs(block.frame(), cur1);
    }
}

/// Copy every record from `rec_off` (inclusive) to the supremum of
/// `block` onto the end of `new_block`.
///
/// Returns the offset of the first record on the destination after the
/// copy (a user record or the supremum). A destination that cannot hold
/// the records even after reorganizing yields `Overflow` with the
/// destination untouched.
pub fn copy_rec_list_end(
    new_block: &Arc<BufBlock>,
    block: &Arc<BufBlock>,
    rec_off: u16,
    index: &Index,
    lock_sys: &dyn LockSys,
    mtr: &mut Mtr,
) -> Result<u16> {
    let mut from = rec_off;
    if page::rec_is_infimum(from) {
        from = rec::next_offs(block.frame(), from);
    }
    let (size, n_recs) = measure_list_end(block.frame(), from);
    if size + n_recs * rec::REC_HEADER_SIZE
        > page::max_insert_size_after_reorganize(new_block.frame(), n_recs)
        && size > 0
    {
        return Err(Error::Overflow);
    }

    if page::n_heap(new_block.frame()) == page::PAGE_HEAP_NO_USER_LOW {
        cur::copy_end_to_created_page(new_block, block.frame(), from, index, mtr);
    } else {
        copy_rec_list_end_no_locks(new_block, block, rec_off, index, mtr);
    }

    // a secondary leaf inherits the larger max trx id
    if !index.is_clustered() {
        page::update_max_trx_id(new_block, page::max_trx_id(block.frame()), mtr);
    }

    lock_sys.move_rec_list_end(new_block, block, rec_off);

    Ok(rec::next_offs(new_block.frame(), PAGE_INFIMUM))
}

/// Copy the records before `rec_off` onto the end of `new_block`.
/// Returns the offset of the record after which the copied ones landed.
pub fn copy_rec_list_start(
    new_block: &Arc<BufBlock>,
    block: &Arc<BufBlock>,
    rec_off: u16,
    index: &Index,
    lock_sys: &dyn LockSys,
    mtr: &mut Mtr,
) -> Result<u16> {
    let ret = page::rec_prev(new_block.frame(), PAGE_SUPREMUM);
    if page::rec_is_infimum(rec_off) {
        return Ok(ret);
    }

    // size precheck over the copied prefix
    {
        let mut size = 0usize;
        let mut n = 0usize;
        let mut r = rec::next_offs(block.frame(), PAGE_INFIMUM);
        while r != rec_off {
            size += Offsets::compute(block.frame(), r).size();
            n += 1;
            r = rec::next_offs(block.frame(), r);
        }
        if n > 0
            && size + n * rec::REC_HEADER_SIZE
                > page::max_insert_size_after_reorganize(new_block.frame(), n)
        {
            return Err(Error::Overflow);
        }
    }

    let mut cur1 = rec::next_offs(block.frame(), PAGE_INFIMUM);
    let mut cur2 = ret;
    while cur1 != rec_off {
        let ins = encoded_from_page(block.frame(), cur1);
        match cur::insert_rec(new_block, index, cur2, &ins, mtr) {
            Some(ins_rec) => cur2 = ins_rec,
            None => {
                page::print_diag(new_block.frame(), "destination of failed record list copy");
                page::print_diag(block.frame(), "source of failed record list copy");
                page::corruption_abort(new_block.frame(), "insert failed during list copy");
            }
        }
        cur1 = rec::next_offs(block.frame(), cur1);
    }

    if !index.is_clustered() {
        page::update_max_trx_id(new_block, page::max_trx_id(block.frame()), mtr);
    }

    lock_sys.move_rec_list_start(new_block, block, rec_off, ret);
    Ok(ret)
}

/// Delete records from `rec_off` (inclusive) to the supremum: one
/// logical redo record, the sublist detached onto the free list and the
/// directory tail handed to the supremum.
///
/// `n_recs`/`size` may be passed when the caller knows them; otherwise
/// the sublist is walked once to compute both.
pub fn delete_rec_list_end(
    block: &Arc<BufBlock>,
    mut rec_off: u16,
    index: &Index,
    n_recs: Option<usize>,
    size: Option<usize>,
    mtr: &mut Mtr,
) {
    let _ = index;
    if page::rec_is_infimum(rec_off) {
        rec_off = rec::next_offs(block.frame(), rec_off);
    }
    if page::rec_is_supremum(rec_off) {
        return;
    }

    // the page becomes invalid for optimistic searches
    block.modify_clock_inc();
    page::header_set(block.frame_mut(), PAGE_LAST_INSERT, 0);

    mtr.log(block, RedoBody::ListEndDelete { off: rec_off });

    let frame = block.frame_mut();
    let prev_rec = page::rec_prev(frame, rec_off);
    let last_rec = page::rec_prev(frame, PAGE_SUPREMUM);

    let (size, n_removed) = match (size, n_recs) {
        (Some(size), Some(n)) => (size, n),
        _ => measure_list_end(frame, rec_off),
    };
    debug_assert!(size < crate::buffer::PAGE_SIZE);

    // reassign ownership: the first owner at or after the head of the
    // deleted chain donates the survivors of its group to the supremum;
    // the supremum may own fewer than the usual minimum
    let mut rec2 = rec_off;
    let mut count = 0usize;
    while rec::n_owned(frame, rec2) == 0 {
        count += 1;
        rec2 = rec::next_offs(frame, rec2);
    }
    debug_assert!(rec::n_owned(frame, rec2) as usize > count);
    let n_owned = rec::n_owned(frame, rec2) as usize - count;
    let slot_index = dir::find_owner_slot(frame, rec2);

    dir::set_slot_rec(frame, slot_index, PAGE_SUPREMUM);
    dir::set_slot_n_owned(frame, slot_index, n_owned);
    page::header_set(frame, PAGE_N_DIR_SLOTS, slot_index as u16 + 1);

    // detach the chain and catenate it onto the free list
    rec::set_next_offs(frame, prev_rec, PAGE_SUPREMUM);
    let free_head = page::free_head(frame);
    rec::set_next_offs(frame, last_rec, free_head);
    page::header_set(frame, PAGE_FREE, rec_off);

    page::header_set(frame, PAGE_GARBAGE, (page::garbage_bytes(frame) + size) as u16);
    let n = page::n_recs(frame);
    debug_assert!(n >= n_removed);
    page::header_set(frame, PAGE_N_RECS, (n - n_removed) as u16);
}

/// Delete the records before `rec_off`, one at a time with per-record
/// logging suppressed; only the bracketing logical record is emitted.
pub fn delete_rec_list_start(block: &Arc<BufBlock>, rec_off: u16, index: &Index, mtr: &mut Mtr) {
    if page::rec_is_infimum(rec_off) {
        return;
    }

    mtr.log(block, RedoBody::ListStartDelete { off: rec_off });

    let log_mode = mtr.set_log_mode(LogMode::None);
    let mut cur1 = rec::next_offs(block.frame(), PAGE_INFIMUM);
    while cur1 != rec_off {
        let next = rec::next_offs(block.frame(), cur1);
        cur::delete_rec(block, index, cur1, mtr);
        cur1 = next;
    }
    let old_mode = mtr.set_log_mode(log_mode);
    debug_assert_eq!(old_mode, LogMode::None);
}

/// Move the records from `split_off` to the supremum onto `new_block`.
/// Returns false when the destination cannot take them; the caller
/// discards the destination page.
pub fn move_rec_list_end(
    new_block: &Arc<BufBlock>,
    block: &Arc<BufBlock>,
    split_off: u16,
    index: &Index,
    lock_sys: &dyn LockSys,
    mtr: &mut Mtr,
) -> Result<bool> {
    let old_data_size = page::data_size(new_block.frame());
    let old_n_recs = page::n_recs(new_block.frame());

    match copy_rec_list_end(new_block, block, split_off, index, lock_sys, mtr) {
        Ok(_) => {}
        Err(Error::Overflow) => return Ok(false),
        Err(err) => return Err(err),
    }

    let new_data_size = page::data_size(new_block.frame());
    let new_n_recs = page::n_recs(new_block.frame());
    debug_assert!(new_data_size >= old_data_size);

    delete_rec_list_end(
        block,
        split_off,
        index,
        Some(new_n_recs - old_n_recs),
        Some(new_data_size - old_data_size),
        mtr,
    );
    Ok(true)
}

/// Move the records before `split_off` onto `new_block`.
pub fn move_rec_list_start(
    new_block: &Arc<BufBlock>,
    block: &Arc<BufBlock>,
    split_off: u16,
    index: &Index,
    lock_sys: &dyn LockSys,
    mtr: &mut Mtr,
) -> Result<bool> {
    match copy_rec_list_start(new_block, block, split_off, index, lock_sys, mtr) {
        Ok(_) => {}
        Err(Error::Overflow) => return Ok(false),
        Err(err) => return Err(err),
    }
    delete_rec_list_start(block, split_off, index, mtr);
    Ok(true)
}

/// Re-apply a logged list delete to a page, as redo replay would: the
/// body carries only the 2-byte offset of the first record to delete.
pub fn apply_list_delete_log(
    body: &crate::mtr::RedoBody,
    block: &Arc<BufBlock>,
    index: &Index,
    mtr: &mut Mtr,
) -> Result<()> {
    match body {
        crate::mtr::RedoBody::ListEndDelete { off } => {
            delete_rec_list_end(block, *off, index, None, None, mtr);
            Ok(())
        }
        crate::mtr::RedoBody::ListStartDelete { off } => {
            delete_rec_list_start(block, *off, index, mtr);
            Ok(())
        }
        _ => Err(Error::InvalidArgument),
    }
}

/// Rebuild the page compactly: records keep their order, garbage and the
/// free list disappear. Logged as a single logical record; recovery
/// replays the reorganize instead of the byte moves.
pub fn reorganize(block: &Arc<BufBlock>, index: &Index, mtr: &mut Mtr) {
    block.modify_clock_inc();
    mtr.log(block, RedoBody::PageReorganize);
    let log_mode = mtr.set_log_mode(LogMode::None);

    let max_trx_id = page::max_trx_id(block.frame());

    let temp = BufBlock::new(block.space(), block.page_no());
    mtr.x_latch(&temp);
    page::create(index, &temp, mtr);
    let first = rec::next_offs(block.frame(), PAGE_INFIMUM);
    cur::copy_end_to_created_page(&temp, block.frame(), first, index, mtr);

    page::create(index, block, mtr);
    let first = rec::next_offs(temp.frame(), PAGE_INFIMUM);
    cur::copy_end_to_created_page(block, temp.frame(), first, index, mtr);

    page::set_max_trx_id(block, max_trx_id, None);

    let old_mode = mtr.set_log_mode(log_mode);
    debug_assert_eq!(old_mode, LogMode::None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoopLockSys;
    use crate::mtr::MLogType;
    use crate::page::cur::tests::{fill_page, key_tuple};
    use crate::page::tests::created_block;

    #[test]
    fn test_delete_rec_list_end() {
        let (block, mut mtr, log, index) = created_block();
        // 20 records and 5 directory slots
        let offs = fill_page(&block, &index, 1..=20, &mut mtr);
        assert_eq!(page::n_dir_slots(block.frame()), 6);

        delete_rec_list_end(&block, offs[10], &index, None, None, &mut mtr);

        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 10);
        assert_eq!(page::free_head(frame), offs[10]);
        assert_eq!(page::garbage_bytes(frame), 10 * 20);
        assert!(page::validate(frame, &index));
        mtr.commit();
        assert_eq!(log.count_of(MLogType::ListEndDelete), 1);
        // the per-record deletes are not logged individually
        assert_eq!(log.count_of(MLogType::RecDelete), 0);
    }

    #[test]
    fn test_delete_rec_list_end_with_infimum_start_clears_page() {
        let (block, mut mtr, _log, index) = created_block();
        fill_page(&block, &index, 1..=9, &mut mtr);
        delete_rec_list_end(&block, PAGE_INFIMUM, &index, None, None, &mut mtr);
        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 0);
        assert_eq!(page::n_dir_slots(frame), 2);
        assert!(page::validate(frame, &index));
        mtr.commit();
    }

    #[test]
    fn test_delete_rec_list_start_suppresses_per_rec_logs() {
        let (block, mut mtr, log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=12, &mut mtr);
        delete_rec_list_start(&block, offs[4], &index, &mut mtr);
        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 8);
        assert!(page::validate(frame, &index));
        mtr.commit();
        assert_eq!(log.count_of(MLogType::ListStartDelete), 1);
        assert_eq!(log.count_of(MLogType::RecDelete), 0);
    }

    #[test]
    fn test_move_rec_list_end() {
        let (block, mut mtr, _log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=10, &mut mtr);
        let dst = BufBlock::new(0, 50);
        mtr.x_latch(&dst);
        page::create(&index, &dst, &mut mtr);

        let lock_sys = NoopLockSys::new();
        let moved =
            move_rec_list_end(&dst, &block, offs[5], &index, lock_sys.as_ref(), &mut mtr).unwrap();
        assert!(moved);
        assert_eq!(page::n_recs(block.frame()), 5);
        assert_eq!(page::n_recs(dst.frame()), 5);
        assert!(page::validate(block.frame(), &index));
        assert!(page::validate(dst.frame(), &index));
        assert_eq!(lock_sys.end_moves(), 1);
        mtr.commit();
    }

    #[test]
    fn test_move_rec_list_start() {
        let (block, mut mtr, _log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=10, &mut mtr);
        let dst = BufBlock::new(0, 51);
        mtr.x_latch(&dst);
        page::create(&index, &dst, &mut mtr);

        let lock_sys = NoopLockSys::new();
        let moved =
            move_rec_list_start(&dst, &block, offs[4], &index, lock_sys.as_ref(), &mut mtr)
                .unwrap();
        assert!(moved);
        assert_eq!(page::n_recs(block.frame()), 6);
        assert_eq!(page::n_recs(dst.frame()), 4);
        assert!(page::validate(block.frame(), &index));
        assert!(page::validate(dst.frame(), &index));
        assert_eq!(lock_sys.start_moves(), 1);
        mtr.commit();
    }

    #[test]
    fn test_copy_into_nonempty_page_keeps_order() {
        let (block, mut mtr, _log, index) = created_block();
        fill_page(&block, &index, 1..=6, &mut mtr);
        // destination already holds greater keys, forcing the
        // one-at-a-time path instead of the bulk rebuild
        let dst = BufBlock::new(0, 52);
        mtr.x_latch(&dst);
        page::create(&index, &dst, &mut mtr);
        fill_page(&dst, &index, 10..=12, &mut mtr);

        let lock_sys = NoopLockSys::new();
        let first = rec::next_offs(block.frame(), PAGE_INFIMUM);
        copy_rec_list_end(&dst, &block, first, &index, lock_sys.as_ref(), &mut mtr).unwrap();
        // the source is untouched by a copy
        assert_eq!(page::n_recs(block.frame()), 6);
        assert_eq!(page::n_recs(dst.frame()), 9);
        assert!(page::validate(block.frame(), &index));
        assert!(page::validate(dst.frame(), &index));
        mtr.commit();
    }

    #[test]
    fn test_apply_list_delete_log() {
        let (block, mut mtr, _log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=8, &mut mtr);
        let body = crate::mtr::RedoBody::ListEndDelete { off: offs[4] };
        apply_list_delete_log(&body, &block, &index, &mut mtr).unwrap();
        assert_eq!(page::n_recs(block.frame()), 4);
        assert!(page::validate(block.frame(), &index));
        let bad = crate::mtr::RedoBody::PageCreate;
        assert!(apply_list_delete_log(&bad, &block, &index, &mut mtr).is_err());
        mtr.commit();
    }

    #[test]
    fn test_reorganize_compacts_garbage() {
        let (block, mut mtr, _log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=10, &mut mtr);
        for off in &offs[2..6] {
            cur::delete_rec(&block, &index, *off, &mut mtr);
        }
        page::set_max_trx_id(&block, 77, None);
        assert!(page::garbage_bytes(block.frame()) > 0);

        reorganize(&block, &index, &mut mtr);

        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 6);
        assert_eq!(page::garbage_bytes(frame), 0);
        assert_eq!(page::free_head(frame), 0);
        assert_eq!(page::max_trx_id(frame), 77);
        assert!(page::validate(frame, &index));
        // keys survive in order
        let (found, exact) = cur::search(frame, &index.collations(), &key_tuple(8));
        assert!(exact);
        assert!(page::rec_is_user_rec(found));
        mtr.commit();
    }
}
