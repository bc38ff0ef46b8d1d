//! The page directory: a sparse array of 2-byte slots over the record
//! list, growing downward from the page end.

use crate::buffer::{PAGE_SIZE, PageBuf};
use crate::mach;
use crate::page::{
    self, PAGE_DIR, PAGE_DIR_SLOT_MAX_N_OWNED, PAGE_DIR_SLOT_MIN_N_OWNED, PAGE_DIR_SLOT_SIZE,
    PAGE_N_DIR_SLOTS,
};
use crate::rec;

/// Byte offset of slot `n`. Slot 0 sits highest; later slots extend
/// toward lower addresses.
#[inline]
pub fn slot_off(n: usize) -> usize {
    PAGE_SIZE - PAGE_DIR - PAGE_DIR_SLOT_SIZE * (n + 1)
}

/// Origin offset of the record slot `n` points to.
#[inline]
pub fn slot_rec(frame: &PageBuf, n: usize) -> u16 {
    mach::read_2(frame, slot_off(n))
}

#[inline]
pub fn set_slot_rec(frame: &mut PageBuf, n: usize, rec_off: u16) {
    mach::write_2(frame, slot_off(n), rec_off);
}

#[inline]
pub fn slot_n_owned(frame: &PageBuf, n: usize) -> usize {
    rec::n_owned(frame, slot_rec(frame, n)) as usize
}

#[inline]
pub fn set_slot_n_owned(frame: &mut PageBuf, n: usize, owned: usize) {
    let rec_off = slot_rec(frame, n);
    rec::set_n_owned(frame, rec_off, owned as u8);
}

/// Find the directory slot owning `rec_off`: walk forward to the next
/// owner, then search the slot array from the last slot toward slot 0.
///
/// A record whose owner appears in no slot means the directory lost a
/// slot. The page is already inconsistent on disk, so dump and abort.
pub fn find_owner_slot(frame: &PageBuf, rec_off: u16) -> usize {
    let mut r = rec_off;
    while rec::n_owned(frame, r) == 0 {
        r = rec::next_offs(frame, r);
        debug_assert!(r >= page::PAGE_SUPREMUM || page::rec_is_user_rec(r));
        debug_assert!((r as usize) < PAGE_SIZE - PAGE_DIR);
    }

    let mut slot = page::n_dir_slots(frame) - 1;
    loop {
        if slot_rec(frame, slot) == r {
            return slot;
        }
        if slot == 0 {
            tracing::error!(
                rec = rec_off,
                owner = r,
                slot0_rec = slot_rec(frame, 0),
                "cannot find the dir slot for record"
            );
            page::corruption_abort(frame, "probable data corruption: lost directory slot");
        }
        slot -= 1;
    }
}

/// Add a slot above `start`. Record pointers and owned counts of the new
/// slot are the caller's responsibility. The table expands toward low
/// addresses; every slot above `start` shifts down by one slot width.
pub(crate) fn add_slot(frame: &mut PageBuf, start: usize) {
    let n_slots = page::n_dir_slots(frame);
    debug_assert!(start < n_slots - 1);

    page::header_set(frame, PAGE_N_DIR_SLOTS, n_slots as u16 + 1);

    let src_lo = slot_off(n_slots - 1);
    let src_hi = slot_off(start + 1) + PAGE_DIR_SLOT_SIZE;
    frame.copy_within(src_lo..src_hi, src_lo - PAGE_DIR_SLOT_SIZE);
}

/// Delete slot `slot_no`: its records are inherited by the next slot,
/// higher slots compact down one width, the vacated tail is zeroed.
pub fn delete_slot(frame: &mut PageBuf, slot_no: usize) {
    let n_slots = page::n_dir_slots(frame);
    debug_assert!(slot_no > 0);
    debug_assert!(slot_no + 1 < n_slots);

    let n_owned = slot_n_owned(frame, slot_no);
    set_slot_n_owned(frame, slot_no, 0);
    let inherited = n_owned + slot_n_owned(frame, slot_no + 1);
    set_slot_n_owned(frame, slot_no + 1, inherited);

    for i in slot_no + 1..n_slots {
        let rec_off = slot_rec(frame, i);
        set_slot_rec(frame, i - 1, rec_off);
    }
    mach::write_2(frame, slot_off(n_slots - 1), 0);
    page::header_set(frame, PAGE_N_DIR_SLOTS, n_slots as u16 - 1);
}

/// Split a slot whose owned count has grown past the maximum. A new slot
/// is inserted immediately below, owning the first half of the group.
pub fn split_slot(frame: &mut PageBuf, slot_no: usize) {
    debug_assert!(slot_no > 0);
    let n_owned = slot_n_owned(frame, slot_no);
    debug_assert_eq!(n_owned, PAGE_DIR_SLOT_MAX_N_OWNED + 1);

    // 1. find the record in the middle of the owned group
    let mut rec = slot_rec(frame, slot_no - 1);
    for _ in 0..n_owned / 2 {
        rec = rec::next_offs(frame, rec);
    }
    debug_assert!(n_owned / 2 >= PAGE_DIR_SLOT_MIN_N_OWNED);

    // 2. add a directory slot immediately below the one to split; the
    // old slot is now number slot_no + 1
    add_slot(frame, slot_no - 1);

    // 3. the new slot takes the lower half
    set_slot_rec(frame, slot_no, rec);
    set_slot_n_owned(frame, slot_no, n_owned / 2);

    // 4. the old slot keeps the rest
    set_slot_n_owned(frame, slot_no + 1, n_owned - n_owned / 2);
}

/// Rebalance a slot whose owned count fell below the minimum: either
/// take one record from the upper neighbour or merge into it.
pub fn balance_slot(frame: &mut PageBuf, slot_no: usize) {
    debug_assert!(slot_no > 0);

    // the last slot has no upper neighbour and tolerates any count
    if slot_no == page::n_dir_slots(frame) - 1 {
        return;
    }

    let n_owned = slot_n_owned(frame, slot_no);
    let up_n_owned = slot_n_owned(frame, slot_no + 1);
    debug_assert_eq!(n_owned, PAGE_DIR_SLOT_MIN_N_OWNED - 1);
    const _: () =
        assert!(2 * PAGE_DIR_SLOT_MIN_N_OWNED - 1 <= PAGE_DIR_SLOT_MAX_N_OWNED);

    if up_n_owned > PAGE_DIR_SLOT_MIN_N_OWNED {
        // transfer one record from the upper group
        let old_rec = slot_rec(frame, slot_no);
        let new_rec = rec::next_offs(frame, old_rec);
        rec::set_n_owned(frame, old_rec, 0);
        rec::set_n_owned(frame, new_rec, n_owned as u8 + 1);
        set_slot_rec(frame, slot_no, new_rec);
        set_slot_n_owned(frame, slot_no + 1, up_n_owned - 1);
    } else {
        delete_slot(frame, slot_no);
    }
}
