//! The index page.
//!
//! An index page holds records in a heap, linked into one singly linked
//! list in ascending key order. Just below the page end lives the sparse
//! directory: an array of 2-byte slots, each pointing to a record that
//! "owns" the group of records between the previous slot's record
//! (exclusive) and itself (inclusive). The owned count is kept between 4
//! and 8, except that the infimum always owns exactly itself and the
//! supremum group may shrink to 1.
//!
//! ```text
//! +--------------------------------------+ 0
//! | fil header (space, page no, type)    |
//! +--------------------------------------+ PAGE_HEADER
//! | page header                          |
//! +--------------------------------------+ PAGE_DATA
//! | infimum record                       |
//! | supremum record                      |
//! +--------------------------------------+ PAGE_SUPREMUM_END
//! | record heap, grows upward            |
//! |              ... free ...            |
//! | directory slots, grow downward       |
//! +--------------------------------------+ PAGE_SIZE - PAGE_DIR
//! | reserved trailer                     |
//! +--------------------------------------+ PAGE_SIZE
//! ```

pub mod cur;
pub mod dir;
pub mod list;

use crate::buffer::{BufBlock, PAGE_SIZE, PageBuf};
use crate::dict::Index;
use crate::mach;
use crate::mtr::{Mtr, RedoBody, mlog_write_u32, mlog_write_u64};
use crate::rec::{self, Offsets, RecStatus};
use crate::value::{Field, Tuple};
use std::fmt::Write as _;

pub const FIL_PAGE_SPACE_ID: usize = 0;
pub const FIL_PAGE_NO: usize = 4;
pub const FIL_PAGE_TYPE: usize = 8;
pub const FIL_PAGE_LSN: usize = 10;
pub const FIL_PAGE_DATA: usize = 18;

pub const FIL_PAGE_TYPE_ALLOCATED: u16 = 0;
pub const FIL_PAGE_TYPE_INDEX: u16 = 17855;

// page header fields, offsets relative to PAGE_HEADER
pub const PAGE_HEADER: usize = FIL_PAGE_DATA;
pub const PAGE_N_DIR_SLOTS: usize = 0;
pub const PAGE_HEAP_TOP: usize = 2;
pub const PAGE_N_HEAP: usize = 4;
pub const PAGE_FREE: usize = 6;
pub const PAGE_GARBAGE: usize = 8;
pub const PAGE_LAST_INSERT: usize = 10;
pub const PAGE_DIRECTION: usize = 12;
pub const PAGE_N_DIRECTION: usize = 14;
pub const PAGE_N_RECS: usize = 16;
pub const PAGE_MAX_TRX_ID: usize = 18;
pub const PAGE_HEADER_SIZE: usize = 26;

pub const PAGE_DATA: usize = PAGE_HEADER + PAGE_HEADER_SIZE;

// the infimum and supremum are one-field records built by the codec;
// their origins are fixed by construction
pub const PAGE_INFIMUM: u16 = (PAGE_DATA + rec::REC_HEADER_SIZE + 2) as u16;
pub const PAGE_SUPREMUM: u16 = PAGE_INFIMUM + 8 + (rec::REC_HEADER_SIZE + 2) as u16;
pub const PAGE_SUPREMUM_END: u16 = PAGE_SUPREMUM + 9;

pub const PAGE_HEAP_NO_INFIMUM: u16 = 0;
pub const PAGE_HEAP_NO_SUPREMUM: u16 = 1;
pub const PAGE_HEAP_NO_USER_LOW: u16 = 2;

pub const PAGE_LEFT: u16 = 1;
pub const PAGE_RIGHT: u16 = 2;
pub const PAGE_NO_DIRECTION: u16 = 5;

// reserved bytes at the very end of the page
pub const PAGE_DIR: usize = 8;
pub const PAGE_DIR_SLOT_SIZE: usize = 2;
pub const PAGE_DIR_SLOT_MAX_N_OWNED: usize = 8;
pub const PAGE_DIR_SLOT_MIN_N_OWNED: usize = 4;

#[inline]
pub fn header_get(frame: &PageBuf, field: usize) -> u16 {
    mach::read_2(frame, PAGE_HEADER + field)
}

#[inline]
pub fn header_set(frame: &mut PageBuf, field: usize, val: u16) {
    mach::write_2(frame, PAGE_HEADER + field, val);
}

#[inline]
pub fn space_id(frame: &PageBuf) -> u32 {
    mach::read_4(frame, FIL_PAGE_SPACE_ID)
}

#[inline]
pub fn page_no(frame: &PageBuf) -> u32 {
    mach::read_4(frame, FIL_PAGE_NO)
}

#[inline]
pub fn n_dir_slots(frame: &PageBuf) -> usize {
    header_get(frame, PAGE_N_DIR_SLOTS) as usize
}

#[inline]
pub fn heap_top(frame: &PageBuf) -> u16 {
    header_get(frame, PAGE_HEAP_TOP)
}

#[inline]
pub fn n_heap(frame: &PageBuf) -> u16 {
    header_get(frame, PAGE_N_HEAP)
}

#[inline]
pub fn free_head(frame: &PageBuf) -> u16 {
    header_get(frame, PAGE_FREE)
}

#[inline]
pub fn garbage_bytes(frame: &PageBuf) -> usize {
    header_get(frame, PAGE_GARBAGE) as usize
}

#[inline]
pub fn n_recs(frame: &PageBuf) -> usize {
    header_get(frame, PAGE_N_RECS) as usize
}

#[inline]
pub fn max_trx_id(frame: &PageBuf) -> u64 {
    mach::read_8(frame, PAGE_HEADER + PAGE_MAX_TRX_ID)
}

#[inline]
pub fn is_empty(frame: &PageBuf) -> bool {
    n_recs(frame) == 0
}

#[inline]
pub fn rec_is_infimum(off: u16) -> bool {
    off == PAGE_INFIMUM
}

#[inline]
pub fn rec_is_supremum(off: u16) -> bool {
    off == PAGE_SUPREMUM
}

#[inline]
pub fn rec_is_user_rec(off: u16) -> bool {
    !rec_is_infimum(off) && !rec_is_supremum(off)
}

/// Next record in the list, `None` past the supremum.
#[inline]
pub fn rec_next(frame: &PageBuf, off: u16) -> Option<u16> {
    let next = rec::next_offs(frame, off);
    if next == 0 { None } else { Some(next) }
}

/// Previous record in the list. Walks forward from the previous slot's
/// owner, so the cost is bounded by the maximum owned count.
pub fn rec_prev(frame: &PageBuf, off: u16) -> u16 {
    debug_assert!(!rec_is_infimum(off));
    let slot_no = dir::find_owner_slot(frame, off);
    debug_assert!(slot_no > 0);
    let mut prev = dir::slot_rec(frame, slot_no - 1);
    loop {
        match rec_next(frame, prev) {
            Some(next) if next == off => return prev,
            Some(next) => prev = next,
            None => corruption_abort(frame, "record list ends while seeking prev"),
        }
    }
}

/// Data size of the page: heap minus sentinels minus garbage.
#[inline]
pub fn data_size(frame: &PageBuf) -> usize {
    heap_top(frame) as usize - PAGE_SUPREMUM_END as usize - garbage_bytes(frame)
}

#[inline]
fn dir_reserved_space(n_recs: usize) -> usize {
    (PAGE_DIR_SLOT_SIZE * n_recs + PAGE_DIR_SLOT_MIN_N_OWNED - 1) / PAGE_DIR_SLOT_MIN_N_OWNED
}

/// Maximum size of a record that can still be inserted after `n_recs`
/// more inserts, without reorganizing the page.
#[inline]
pub fn max_insert_size(frame: &PageBuf, n_recs: usize) -> usize {
    let dir_low = dir::slot_off(n_dir_slots(frame) - 1);
    let reserved = dir_reserved_space(n_recs + n_heap(frame) as usize - 2);
    let top = heap_top(frame) as usize;
    dir_low.saturating_sub(top).saturating_sub(reserved)
}

/// Maximum insert size assuming the garbage is first reclaimed by a
/// reorganize.
#[inline]
pub fn max_insert_size_after_reorganize(frame: &PageBuf, n_recs: usize) -> usize {
    max_insert_size(frame, n_recs) + garbage_bytes(frame)
}

fn infimum_tuple() -> Tuple {
    Tuple::new(vec![Field::Data(b"infimum\0".to_vec())])
}

fn supremum_tuple() -> Tuple {
    Tuple::new(vec![Field::Data(b"supremum\0".to_vec())])
}

/// Create an index page in `block`: stamp the page type, build the
/// infimum and supremum through the record codec, initialize the header,
/// seed the two directory slots and zero-fill the free area.
pub fn create(index: &Index, block: &BufBlock, mtr: &mut Mtr) {
    let _ = index;
    mtr.log(block, RedoBody::PageCreate);

    // the page becomes invalid for optimistic cursors
    block.modify_clock_inc();

    let frame = block.frame_mut();
    mach::write_4(frame, FIL_PAGE_SPACE_ID, block.space());
    mach::write_4(frame, FIL_PAGE_NO, block.page_no());
    mach::write_2(frame, FIL_PAGE_TYPE, FIL_PAGE_TYPE_INDEX);

    let inf = rec::encode_tuple(&infimum_tuple(), RecStatus::Infimum, 0)
        .expect("infimum encoding is static");
    debug_assert_eq!(inf.extra as u16 + PAGE_DATA as u16, PAGE_INFIMUM);
    let start = PAGE_DATA;
    frame[start..start + inf.bytes.len()].copy_from_slice(&inf.bytes);
    rec::set_n_owned(frame, PAGE_INFIMUM, 1);
    rec::set_heap_no(frame, PAGE_INFIMUM, PAGE_HEAP_NO_INFIMUM);

    let sup = rec::encode_tuple(&supremum_tuple(), RecStatus::Supremum, 0)
        .expect("supremum encoding is static");
    let start = PAGE_INFIMUM as usize + 8;
    frame[start..start + sup.bytes.len()].copy_from_slice(&sup.bytes);
    debug_assert_eq!(start + sup.extra, PAGE_SUPREMUM as usize);
    debug_assert_eq!(PAGE_SUPREMUM as usize + sup.data_size(), PAGE_SUPREMUM_END as usize);
    rec::set_n_owned(frame, PAGE_SUPREMUM, 1);
    rec::set_heap_no(frame, PAGE_SUPREMUM, PAGE_HEAP_NO_SUPREMUM);

    header_set(frame, PAGE_N_DIR_SLOTS, 2);
    header_set(frame, PAGE_HEAP_TOP, PAGE_SUPREMUM_END);
    header_set(frame, PAGE_N_HEAP, PAGE_HEAP_NO_USER_LOW);
    header_set(frame, PAGE_FREE, 0);
    header_set(frame, PAGE_GARBAGE, 0);
    header_set(frame, PAGE_LAST_INSERT, 0);
    header_set(frame, PAGE_DIRECTION, PAGE_NO_DIRECTION);
    header_set(frame, PAGE_N_DIRECTION, 0);
    header_set(frame, PAGE_N_RECS, 0);
    set_max_trx_id(block, 0, None);

    let frame = block.frame_mut();
    frame[PAGE_SUPREMUM_END as usize..dir::slot_off(1)].fill(0);

    dir::set_slot_rec(frame, 0, PAGE_INFIMUM);
    dir::set_slot_rec(frame, 1, PAGE_SUPREMUM);

    rec::set_next_offs(frame, PAGE_INFIMUM, PAGE_SUPREMUM);
    rec::set_next_offs(frame, PAGE_SUPREMUM, 0);
}

/// Allocate `need` bytes from the heap. Returns the offset of the block
/// and the heap number assigned to it.
pub fn alloc_heap(frame: &mut PageBuf, need: usize) -> Option<(u16, u16)> {
    if max_insert_size(frame, 1) < need {
        return None;
    }
    let top = heap_top(frame);
    let heap_no = n_heap(frame);
    header_set(frame, PAGE_HEAP_TOP, top + need as u16);
    header_set(frame, PAGE_N_HEAP, heap_no + 1);
    Some((top, heap_no))
}

/// Record `trx_id` in the page header. With a mini-transaction the
/// update goes through the redo log; without one it is an unlogged
/// initialization write.
pub fn set_max_trx_id(block: &BufBlock, trx_id: u64, mtr: Option<&mut Mtr>) {
    match mtr {
        Some(mtr) => {
            debug_assert!(mtr.is_active());
            mlog_write_u64(block, PAGE_HEADER + PAGE_MAX_TRX_ID, trx_id, mtr);
        }
        None => mach::write_8(block.frame_mut(), PAGE_HEADER + PAGE_MAX_TRX_ID, trx_id),
    }
}

/// Raise the page max trx id if `trx_id` exceeds it.
pub fn update_max_trx_id(block: &BufBlock, trx_id: u64, mtr: &mut Mtr) {
    if max_trx_id(block.frame()) < trx_id {
        set_max_trx_id(block, trx_id, Some(mtr));
    }
}

/// Rewrite a 4-byte field of a record in place through the redo log.
/// Used on dictionary rows that store index root page numbers.
pub fn rec_write_index_page_no(
    block: &BufBlock,
    rec_off: u16,
    field_no: usize,
    page_no: u32,
    mtr: &mut Mtr,
) {
    let offsets = Offsets::compute(block.frame(), rec_off);
    let (start, end) = {
        let f = offsets
            .nth_field(block.frame(), field_no)
            .expect("page number field is not null");
        debug_assert_eq!(f.len(), 4);
        let start = f.as_ptr() as usize - block.frame().as_ptr() as usize;
        (start, start + 4)
    };
    debug_assert!(end <= PAGE_SIZE);
    mlog_write_u32(block, start, page_no, mtr);
}

/// Number of records preceding `off` in list order, the infimum
/// counting as one. Uses the directory to skip whole groups.
pub fn rec_n_recs_before(frame: &PageBuf, off: u16) -> usize {
    let mut n: isize = 0;
    let mut r = off;
    while rec::n_owned(frame, r) == 0 {
        r = rec::next_offs(frame, r);
        n -= 1;
    }
    for i in 0..n_dir_slots(frame) {
        let slot_rec = dir::slot_rec(frame, i);
        n += rec::n_owned(frame, slot_rec) as isize;
        if slot_rec == r {
            break;
        }
    }
    debug_assert!(n >= 1);
    (n - 1) as usize
}

/// The middle user record of the page, located through the directory.
pub fn get_middle_rec(frame: &PageBuf) -> u16 {
    let middle = (n_recs(frame) + PAGE_HEAP_NO_USER_LOW as usize) / 2;
    let mut count = 0usize;
    let mut slot_no = 0usize;
    loop {
        let owned = rec::n_owned(frame, dir::slot_rec(frame, slot_no)) as usize;
        if count + owned > middle {
            break;
        }
        count += owned;
        slot_no += 1;
    }
    debug_assert!(slot_no > 0);
    let mut rec = dir::slot_rec(frame, slot_no - 1);
    for _ in 0..=(middle - count) {
        rec = rec::next_offs(frame, rec);
    }
    rec
}

/// Linear lookup of a record by heap number.
pub fn find_rec_with_heap_no(frame: &PageBuf, heap_no: u16) -> Option<u16> {
    let mut rec = PAGE_INFIMUM;
    loop {
        let h = rec::heap_no(frame, rec);
        if h == heap_no {
            return Some(rec);
        }
        if h == PAGE_HEAP_NO_SUPREMUM {
            return None;
        }
        rec = rec::next_offs(frame, rec);
    }
}

pub fn header_to_string(frame: &PageBuf) -> String {
    format!(
        "space {} page {}: n_recs {}, n_dir_slots {}, heap_top {}, n_heap {}, \
         free {}, garbage {}, last_insert {}, direction {}, n_direction {}, max_trx_id {}",
        space_id(frame),
        page_no(frame),
        n_recs(frame),
        n_dir_slots(frame),
        heap_top(frame),
        n_heap(frame),
        free_head(frame),
        garbage_bytes(frame),
        header_get(frame, PAGE_LAST_INSERT),
        header_get(frame, PAGE_DIRECTION),
        header_get(frame, PAGE_N_DIRECTION),
        max_trx_id(frame),
    )
}

fn dir_to_string(frame: &PageBuf) -> String {
    let mut out = String::new();
    for i in 0..n_dir_slots(frame) {
        let rec = dir::slot_rec(frame, i);
        let _ = writeln!(
            out,
            "slot {}: rec offs {}, n_owned {}",
            i,
            rec,
            rec::n_owned(frame, rec)
        );
    }
    out
}

fn hex_dump(frame: &PageBuf) -> String {
    let mut out = String::with_capacity(PAGE_SIZE * 3);
    for (i, chunk) in frame.chunks(32).enumerate() {
        let _ = write!(out, "{:05x}:", i * 32);
        for b in chunk {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
    out
}

/// Emit the full diagnostic dump of a page.
pub fn print_diag(frame: &PageBuf, reason: &str) {
    tracing::error!(
        space = space_id(frame),
        page_no = page_no(frame),
        header = %header_to_string(frame),
        directory = %dir_to_string(frame),
        dump = %hex_dump(frame),
        "{reason}"
    );
}

/// Structural corruption was detected: dump the page and abort. The data
/// on disk is already inconsistent; restart recovery owns what follows.
#[cold]
#[inline(never)]
pub fn corruption_abort(frame: &PageBuf, reason: &str) -> ! {
    print_diag(frame, reason);
    panic!(
        "page corruption on space {} page {}: {}",
        space_id(frame),
        page_no(frame),
        reason
    );
}

/// Cheap structural check: directory/heap disjointness, list/directory
/// consistency, record counts, free list sanity. Does not look at keys.
pub fn simple_validate(frame: &PageBuf) -> bool {
    let n_slots = n_dir_slots(frame);
    if n_slots < 2 || n_slots > PAGE_SIZE / 4 {
        tracing::error!(n_slots, "nonsensical number of dir slots");
        return false;
    }
    let top = heap_top(frame) as usize;
    if top > dir::slot_off(n_slots - 1) {
        tracing::error!(heap_top = top, "record heap and dir overlap");
        return false;
    }

    let mut count = 0usize;
    let mut own_count = 1usize;
    let mut slot_no = 0usize;
    let mut rec = PAGE_INFIMUM;
    loop {
        if rec as usize > top && !rec_is_supremum(rec) && !rec_is_infimum(rec) {
            tracing::error!(rec, top, "record above heap top");
            return false;
        }
        let owned = rec::n_owned(frame, rec) as usize;
        if owned != 0 {
            if owned != own_count {
                tracing::error!(rec, owned, own_count, "wrong owned count");
                return false;
            }
            if dir::slot_rec(frame, slot_no) != rec {
                tracing::error!(rec, slot_no, "dir slot does not point to owner");
                return false;
            }
            own_count = 0;
            if !rec_is_supremum(rec) {
                slot_no += 1;
            }
        }
        if rec_is_supremum(rec) {
            break;
        }
        let next = rec::next_offs(frame, rec);
        if (next as usize) < FIL_PAGE_DATA || next as usize >= PAGE_SIZE {
            tracing::error!(rec, next, "next record offset nonsensical");
            return false;
        }
        count += 1;
        if count > PAGE_SIZE {
            tracing::error!("record list appears to be circular");
            return false;
        }
        rec = next;
        own_count += 1;
    }

    if rec::n_owned(frame, rec) == 0 {
        tracing::error!("n owned is zero in the supremum");
        return false;
    }
    if slot_no != n_slots - 1 {
        tracing::error!(slot_no, n_slots, "wrong slot count");
        return false;
    }
    if n_recs(frame) + PAGE_HEAP_NO_USER_LOW as usize != count + 1 {
        tracing::error!(n_recs = n_recs(frame), count, "n_recs wrong");
        return false;
    }

    // free list
    let mut free = free_head(frame);
    while free != 0 {
        if (free as usize) < FIL_PAGE_DATA || free as usize >= PAGE_SIZE {
            tracing::error!(free, "free list record offset nonsensical");
            return false;
        }
        if free as usize > top {
            tracing::error!(free, top, "free list record above heap top");
            return false;
        }
        count += 1;
        if count > PAGE_SIZE {
            tracing::error!("free list appears to be circular");
            return false;
        }
        free = rec::next_offs(frame, free);
    }
    if n_heap(frame) as usize != count + 1 {
        tracing::error!(n_heap = n_heap(frame), count, "n_heap wrong");
        return false;
    }
    true
}

/// Exhaustive validation: the structural check plus key order, owner
/// count bounds, a byte-overlap bitmap over live and free records, and
/// the data size equation. Dumps a diagnostic on any violation.
pub fn validate(frame: &PageBuf, index: &Index) -> bool {
    if !simple_validate(frame) {
        print_diag(frame, "apparent corruption (structural)");
        return false;
    }

    let collations = index.collations();
    let mut painted = vec![false; PAGE_SIZE];
    let mut paint = |offsets: &Offsets, what: &str| -> bool {
        let start = offsets.start() as usize;
        let end = offsets.end() as usize;
        if end > PAGE_SIZE {
            tracing::error!(start, end, "record offset out of bounds");
            return false;
        }
        for slot in &mut painted[start..end] {
            if *slot {
                tracing::error!(start, end, what, "record overlaps another");
                return false;
            }
            *slot = true;
        }
        true
    };

    let mut count = 0usize;
    let mut data = 0usize;
    let mut rec = PAGE_INFIMUM;
    let mut old: Option<Offsets> = None;
    loop {
        let offsets = Offsets::compute(frame, rec);
        let owned = rec::n_owned(frame, rec) as usize;
        if owned > PAGE_DIR_SLOT_MAX_N_OWNED {
            tracing::error!(rec, owned, "n owned too big");
            print_diag(frame, "apparent corruption (n_owned)");
            return false;
        }
        if rec::heap_no(frame, rec) >= n_heap(frame) {
            tracing::error!(rec, heap_no = rec::heap_no(frame, rec), "heap no too big");
            print_diag(frame, "apparent corruption (heap_no)");
            return false;
        }
        if owned != 0 && rec_is_user_rec(rec) {
            let slot_no = dir::find_owner_slot(frame, rec);
            if slot_no != 0
                && slot_no != n_dir_slots(frame) - 1
                && !(PAGE_DIR_SLOT_MIN_N_OWNED..=PAGE_DIR_SLOT_MAX_N_OWNED).contains(&owned)
            {
                tracing::error!(rec, owned, slot_no, "owner count out of bounds");
                print_diag(frame, "apparent corruption (owner bounds)");
                return false;
            }
        }
        if count >= PAGE_HEAP_NO_USER_LOW as usize && !rec_is_supremum(rec) {
            // adjacent records must ascend strictly
            if let Some(old_offsets) = &old {
                if rec::cmp_rec_rec(frame, &offsets, frame, old_offsets, &collations)
                    != std::cmp::Ordering::Greater
                {
                    tracing::error!(rec, prev = old_offsets.origin, "records in wrong order");
                    print_diag(frame, "apparent corruption (key order)");
                    return false;
                }
            }
        }
        if rec_is_user_rec(rec) {
            data += offsets.size();
        }
        if !paint(&offsets, "live list") {
            print_diag(frame, "apparent corruption (overlap)");
            return false;
        }
        if rec_is_supremum(rec) {
            break;
        }
        count += 1;
        old = Some(offsets);
        rec = rec::next_offs(frame, rec);
    }

    if data != data_size(frame) {
        tracing::error!(summed = data, header = data_size(frame), "data size mismatch");
        print_diag(frame, "apparent corruption (data size)");
        return false;
    }

    let mut free = free_head(frame);
    while free != 0 {
        let offsets = Offsets::compute(frame, free);
        if !paint(&offsets, "free list") {
            print_diag(frame, "apparent corruption (free overlap)");
            return false;
        }
        free = rec::next_offs(frame, free);
    }
    true
}
