//! Page cursor: positioning by key and single-record insert/delete.

use crate::buffer::{BufBlock, PageBuf};
use crate::dict::Index;
use crate::mtr::{LogMode, Mtr, RedoBody};
use crate::page::{
    self, PAGE_DIR_SLOT_MAX_N_OWNED, PAGE_DIR_SLOT_MIN_N_OWNED, PAGE_DIRECTION, PAGE_FREE,
    PAGE_GARBAGE, PAGE_INFIMUM, PAGE_LAST_INSERT, PAGE_LEFT, PAGE_N_DIRECTION, PAGE_N_RECS,
    PAGE_NO_DIRECTION, PAGE_RIGHT, PAGE_SUPREMUM, dir,
};
use crate::rec::{self, EncodedRec, Offsets};
use crate::value::Tuple;
use rookdb_catalog::Collation;
use std::cmp::Ordering;

/// Position a cursor on the last record that compares less than or
/// equal to `tuple`. Returns the record offset (possibly the infimum)
/// and whether it matches `tuple` exactly on the compared fields.
pub fn search(frame: &PageBuf, collations: &[Collation], tuple: &Tuple) -> (u16, bool) {
    let n_slots = page::n_dir_slots(frame);
    let mut low = 0usize;
    let mut high = n_slots - 1;
    while high - low > 1 {
        let mid = (low + high) / 2;
        let mid_rec = dir::slot_rec(frame, mid);
        let offsets = Offsets::compute(frame, mid_rec);
        match rec::cmp_tuple_rec(tuple, frame, &offsets, collations) {
            Ordering::Less => high = mid,
            _ => low = mid,
        }
    }

    // short linear walk through the localized group
    let mut cur = dir::slot_rec(frame, low);
    loop {
        let next = rec::next_offs(frame, cur);
        if next == 0 {
            break;
        }
        let offsets = Offsets::compute(frame, next);
        match rec::cmp_tuple_rec(tuple, frame, &offsets, collations) {
            Ordering::Less => break,
            _ => cur = next,
        }
    }

    let exact = page::rec_is_user_rec(cur) && {
        let offsets = Offsets::compute(frame, cur);
        rec::cmp_tuple_rec(tuple, frame, &offsets, collations) == Ordering::Equal
    };
    (cur, exact)
}

fn update_direction(frame: &mut PageBuf, cur_off: u16, ins_off: u16) {
    let last = page::header_get(frame, PAGE_LAST_INSERT);
    let direction = page::header_get(frame, PAGE_DIRECTION);
    let next = rec::next_offs(frame, ins_off);
    if last == cur_off && last != 0 && direction != PAGE_LEFT {
        page::header_set(frame, PAGE_DIRECTION, PAGE_RIGHT);
        let n = page::header_get(frame, PAGE_N_DIRECTION);
        page::header_set(frame, PAGE_N_DIRECTION, n + 1);
    } else if last != 0 && next == last && direction != PAGE_RIGHT {
        page::header_set(frame, PAGE_DIRECTION, PAGE_LEFT);
        let n = page::header_get(frame, PAGE_N_DIRECTION);
        page::header_set(frame, PAGE_N_DIRECTION, n + 1);
    } else {
        page::header_set(frame, PAGE_DIRECTION, PAGE_NO_DIRECTION);
        page::header_set(frame, PAGE_N_DIRECTION, 0);
    }
    page::header_set(frame, PAGE_LAST_INSERT, ins_off);
}

/// Insert an encoded record after `cur_off`. Returns the origin of the
/// new record, or `None` if the page has no room.
pub fn insert_rec(
    block: &BufBlock,
    index: &Index,
    cur_off: u16,
    ins: &EncodedRec,
    mtr: &mut Mtr,
) -> Option<u16> {
    let _ = index;
    debug_assert!(!page::rec_is_supremum(cur_off));
    let need = ins.size();
    let frame = block.frame_mut();

    // 1. claim space: the free list head if it is large enough,
    // otherwise the heap
    let free = page::free_head(frame);
    let (start, heap_no) = if free != 0 {
        let foffsets = Offsets::compute(frame, free);
        if foffsets.size() >= need {
            let next_free = rec::next_offs(frame, free);
            let heap_no = rec::heap_no(frame, free);
            page::header_set(frame, PAGE_FREE, next_free);
            let garbage = page::garbage_bytes(frame) - need;
            page::header_set(frame, PAGE_GARBAGE, garbage as u16);
            (foffsets.start(), heap_no)
        } else {
            page::alloc_heap(frame, need)?
        }
    } else {
        page::alloc_heap(frame, need)?
    };

    // 2. place the bytes
    let origin = start + ins.extra as u16;
    frame[start as usize..start as usize + need].copy_from_slice(&ins.bytes);
    rec::set_heap_no(frame, origin, heap_no);
    rec::set_n_owned(frame, origin, 0);

    // 3. link into the list
    let next = rec::next_offs(frame, cur_off);
    rec::set_next_offs(frame, origin, next);
    rec::set_next_offs(frame, cur_off, origin);

    let n_recs = page::n_recs(frame);
    page::header_set(frame, PAGE_N_RECS, n_recs as u16 + 1);

    // 4. insert direction statistics
    update_direction(frame, cur_off, origin);

    // 5. ownership: the next owner gains one record; split when the
    // group outgrows the maximum
    let mut owner = origin;
    while rec::n_owned(frame, owner) == 0 {
        owner = rec::next_offs(frame, owner);
    }
    let owned = rec::n_owned(frame, owner) as usize + 1;
    rec::set_n_owned(frame, owner, owned as u8);
    if owned == PAGE_DIR_SLOT_MAX_N_OWNED + 1 {
        let slot_no = dir::find_owner_slot(frame, owner);
        dir::split_slot(frame, slot_no);
    }

    mtr.log(
        block,
        RedoBody::RecInsert {
            prev_off: cur_off,
            rec: ins.bytes.clone(),
        },
    );
    Some(origin)
}

/// Unlink a record, put it on the free list and fix the ownership group.
pub fn delete_rec(block: &BufBlock, index: &Index, off: u16, mtr: &mut Mtr) {
    let _ = index;
    debug_assert!(page::rec_is_user_rec(off));

    block.modify_clock_inc();
    mtr.log(block, RedoBody::RecDelete { off });

    let frame = block.frame_mut();
    let slot_no = dir::find_owner_slot(frame, off);
    let cur_n_owned = dir::slot_n_owned(frame, slot_no);
    debug_assert!(cur_n_owned > 0);
    let prev = page::rec_prev(frame, off);
    let next = rec::next_offs(frame, off);

    rec::set_next_offs(frame, prev, next);
    if dir::slot_rec(frame, slot_no) == off {
        rec::set_n_owned(frame, off, 0);
        dir::set_slot_rec(frame, slot_no, prev);
    }
    dir::set_slot_n_owned(frame, slot_no, cur_n_owned - 1);

    let size = Offsets::compute(frame, off).size();
    let free_head = page::free_head(frame);
    rec::set_next_offs(frame, off, free_head);
    page::header_set(frame, PAGE_FREE, off);
    page::header_set(frame, PAGE_GARBAGE, (page::garbage_bytes(frame) + size) as u16);
    let n_recs = page::n_recs(frame);
    debug_assert!(n_recs > 0);
    page::header_set(frame, PAGE_N_RECS, n_recs as u16 - 1);

    if cur_n_owned - 1 < PAGE_DIR_SLOT_MIN_N_OWNED && slot_no != page::n_dir_slots(frame) - 1 {
        dir::balance_slot(frame, slot_no);
    }
}

/// Bulk-copy records from `from_off` (inclusive) to the supremum of the
/// source frame into a freshly created page, rebuilding the directory in
/// one pass instead of splitting slot by slot.
pub fn copy_end_to_created_page(
    new_block: &BufBlock,
    src_frame: &PageBuf,
    from_off: u16,
    index: &Index,
    mtr: &mut Mtr,
) {
    debug_assert_eq!(page::n_heap(new_block.frame()), page::PAGE_HEAP_NO_USER_LOW);

    mtr.log(new_block, RedoBody::ListEndCopyCreated { off: from_off });
    // individual inserts are logged compactly, unless the caller already
    // suppressed logging altogether
    let prev_mode = mtr.log_mode();
    if prev_mode != LogMode::None {
        mtr.set_log_mode(LogMode::ShortInserts);
    }

    let mut src = from_off;
    if page::rec_is_infimum(src) {
        src = rec::next_offs(src_frame, src);
    }

    let mut owners: Vec<u16> = vec![];
    let mut count = 0usize;
    let mut n_recs = 0usize;
    let mut prev_target = PAGE_INFIMUM;
    while !page::rec_is_supremum(src) {
        let offsets = Offsets::compute(src_frame, src);
        let ins = EncodedRec {
            bytes: src_frame[offsets.start() as usize..offsets.end() as usize].to_vec(),
            extra: offsets.extra_size(),
        };
        let frame = new_block.frame_mut();
        let Some((start, heap_no)) = page::alloc_heap(frame, ins.size()) else {
            page::print_diag(src_frame, "source page of failed bulk copy");
            page::corruption_abort(new_block.frame(), "record does not fit freshly created page");
        };
        let origin = start + ins.extra as u16;
        frame[start as usize..start as usize + ins.size()].copy_from_slice(&ins.bytes);
        rec::set_heap_no(frame, origin, heap_no);
        rec::set_n_owned(frame, origin, 0);
        rec::set_next_offs(frame, prev_target, origin);
        rec::set_next_offs(frame, origin, PAGE_SUPREMUM);

        mtr.log(
            new_block,
            RedoBody::RecInsert {
                prev_off: prev_target,
                rec: ins.bytes,
            },
        );

        count += 1;
        n_recs += 1;
        if count == (PAGE_DIR_SLOT_MAX_N_OWNED + 1) / 2 {
            rec::set_n_owned(frame, origin, count as u8);
            owners.push(origin);
            count = 0;
        }
        prev_target = origin;
        src = rec::next_offs(src_frame, src);
    }

    // the supremum owns the remainder of the last group
    let frame = new_block.frame_mut();
    rec::set_n_owned(frame, PAGE_SUPREMUM, count as u8 + 1);

    let n_slots = 2 + owners.len();
    page::header_set(frame, page::PAGE_N_DIR_SLOTS, n_slots as u16);
    dir::set_slot_rec(frame, 0, PAGE_INFIMUM);
    for (i, owner) in owners.iter().enumerate() {
        dir::set_slot_rec(frame, i + 1, *owner);
    }
    dir::set_slot_rec(frame, n_slots - 1, PAGE_SUPREMUM);

    page::header_set(frame, PAGE_N_RECS, n_recs as u16);
    page::header_set(frame, PAGE_LAST_INSERT, 0);
    page::header_set(frame, PAGE_DIRECTION, PAGE_NO_DIRECTION);
    page::header_set(frame, PAGE_N_DIRECTION, 0);
    debug_assert!(
        (1..=PAGE_DIR_SLOT_MAX_N_OWNED).contains(&(rec::n_owned(frame, PAGE_SUPREMUM) as usize))
    );
    let _ = index;

    let restored = mtr.set_log_mode(prev_mode);
    debug_assert!(restored == LogMode::ShortInserts || restored == LogMode::None);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dict::tests::test_index;
    use crate::mtr::{LogSys, MLogType};
    use crate::page::tests::created_block;
    use crate::rec::RecStatus;
    use crate::value::Field;
    use std::sync::Arc;

    /// Fixed-format clustered tuple (k, trx_id, roll_ptr, v) whose
    /// record encodes to 20 bytes with a 3-byte key and 1-byte value.
    pub(crate) fn rec_20(k: u8) -> EncodedRec {
        let tuple = Tuple::new(vec![
            Field::Data(vec![b'k', 0, k]),
            Field::Data(vec![0; 1]),
            Field::Data(vec![0; 1]),
            Field::Data(vec![k]),
        ]);
        let rec = rec::encode_tuple(&tuple, RecStatus::Ordinary, 0).unwrap();
        assert_eq!(rec.size(), 20);
        rec
    }

    pub(crate) fn key_tuple(k: u8) -> Tuple {
        Tuple::new(vec![Field::Data(vec![b'k', 0, k])])
    }

    /// Insert keys in order, returning the record offsets.
    pub(crate) fn fill_page(
        block: &Arc<crate::buffer::BufBlock>,
        index: &Index,
        keys: impl IntoIterator<Item = u8>,
        mtr: &mut Mtr,
    ) -> Vec<u16> {
        let collations = index.collations();
        keys.into_iter()
            .map(|k| {
                let (cur, exact) = search(block.frame(), &collations, &key_tuple(k));
                assert!(!exact);
                insert_rec(block, index, cur, &rec_20(k), mtr).expect("page has room")
            })
            .collect()
    }

    #[test]
    fn test_insert_and_search() {
        let (block, mut mtr, log, index) = created_block();
        let offs = fill_page(&block, &index, [3, 1, 2], &mut mtr);
        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 3);
        // list order follows keys, not insertion order
        assert_eq!(rec::next_offs(frame, PAGE_INFIMUM), offs[1]);
        assert_eq!(rec::next_offs(frame, offs[1]), offs[2]);
        assert_eq!(rec::next_offs(frame, offs[2]), offs[0]);
        let (found, exact) = search(frame, &index.collations(), &key_tuple(2));
        assert!(exact);
        assert_eq!(found, offs[2]);
        let (found, exact) = search(frame, &index.collations(), &key_tuple(9));
        assert!(!exact);
        assert_eq!(found, offs[0]);
        assert!(page::validate(frame, &index));
        mtr.commit();
        assert_eq!(log.count_of(MLogType::RecInsert), 3);
    }

    #[test]
    fn test_directory_split_after_ninth_insert() {
        let (block, mut mtr, _log, index) = created_block();
        // keys 1..=7: supremum owns 8, still one slot pair
        fill_page(&block, &index, 1..=7, &mut mtr);
        assert_eq!(page::n_dir_slots(block.frame()), 2);
        assert_eq!(rec::n_owned(block.frame(), PAGE_SUPREMUM), 8);
        // the 8th insert pushes the owned count to 9 and splits
        fill_page(&block, &index, [8], &mut mtr);
        let frame = block.frame();
        assert_eq!(page::n_dir_slots(frame), 3);
        assert_eq!(dir::slot_n_owned(frame, 1), 4);
        // after the 9th insert exactly one split has occurred
        fill_page(&block, &index, [9], &mut mtr);
        let frame = block.frame();
        assert_eq!(page::n_dir_slots(frame), 3);
        assert_eq!(dir::slot_n_owned(frame, 1), 4);
        assert!(page::validate(frame, &index));
        mtr.commit();
    }

    #[test]
    fn test_delete_rec_reuses_space() {
        let (block, mut mtr, _log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=5, &mut mtr);
        let top_before = page::heap_top(block.frame());
        delete_rec(&block, &index, offs[2], &mut mtr);
        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 4);
        assert_eq!(page::free_head(frame), offs[2]);
        assert_eq!(page::garbage_bytes(frame), 20);
        assert!(page::validate(frame, &index));
        // reinsert lands on the free list slot, not the heap
        let ins = fill_page(&block, &index, [3], &mut mtr);
        assert_eq!(ins[0], offs[2]);
        let frame = block.frame();
        assert_eq!(page::heap_top(frame), top_before);
        assert_eq!(page::garbage_bytes(frame), 0);
        assert_eq!(page::free_head(frame), 0);
        assert!(page::validate(frame, &index));
        mtr.commit();
    }

    #[test]
    fn test_delete_balances_directory() {
        let (block, mut mtr, _log, index) = created_block();
        let offs = fill_page(&block, &index, 1..=12, &mut mtr);
        assert_eq!(page::n_dir_slots(block.frame()), 4);
        // shrink the middle group below the minimum
        for off in &offs[..2] {
            delete_rec(&block, &index, *off, &mut mtr);
        }
        assert!(page::validate(block.frame(), &index));
        for off in &offs[2..8] {
            delete_rec(&block, &index, *off, &mut mtr);
        }
        let frame = block.frame();
        assert_eq!(page::n_recs(frame), 4);
        assert!(page::validate(frame, &index));
        mtr.commit();
    }

    #[test]
    fn test_copy_end_to_created_page() {
        let (block, mut mtr, log, index) = created_block();
        fill_page(&block, &index, 1..=11, &mut mtr);
        let dst = crate::buffer::BufBlock::new(0, 99);
        mtr.x_latch(&dst);
        page::create(&index, &dst, &mut mtr);
        copy_end_to_created_page(
            &dst,
            block.frame(),
            rec::next_offs(block.frame(), PAGE_INFIMUM),
            &index,
            &mut mtr,
        );
        let frame = dst.frame();
        assert_eq!(page::n_recs(frame), 11);
        // 2 groups of 4 plus supremum owning the tail
        assert_eq!(page::n_dir_slots(frame), 4);
        assert_eq!(rec::n_owned(frame, PAGE_SUPREMUM), 4);
        assert!(page::validate(frame, &index));
        mtr.commit();
        assert_eq!(log.count_of(MLogType::ListEndCopyCreated), 1);
    }

    #[test]
    fn test_insert_direction_stats() {
        let (block, mut mtr, _log, index) = created_block();
        fill_page(&block, &index, 1..=4, &mut mtr);
        let frame = block.frame();
        assert_eq!(page::header_get(frame, PAGE_DIRECTION), PAGE_RIGHT);
        assert_eq!(page::header_get(frame, PAGE_N_DIRECTION), 3);
        // descending inserts flip to no-direction first, then left
        fill_page(&block, &index, [0], &mut mtr);
        let frame = block.frame();
        assert_ne!(page::header_get(frame, PAGE_DIRECTION), PAGE_RIGHT);
        mtr.commit();
    }

    #[test]
    fn test_random_insert_delete_keeps_invariants() {
        use rand::prelude::*;

        let mut rng = StdRng::seed_from_u64(0x5eed);
        let (block, mut mtr, _log, index) = created_block();
        let collations = index.collations();
        let mut live: Vec<u8> = vec![];
        for _ in 0..400 {
            let grow = live.is_empty() || (live.len() < 60 && rng.r#gen::<bool>());
            if grow {
                let k = rng.gen_range(0..=u8::MAX);
                if live.contains(&k) {
                    continue;
                }
                let (cur, exact) = search(block.frame(), &collations, &key_tuple(k));
                assert!(!exact);
                insert_rec(&block, &index, cur, &rec_20(k), &mut mtr).expect("page has room");
                live.push(k);
            } else {
                let k = live.swap_remove(rng.gen_range(0..live.len()));
                let (off, exact) = search(block.frame(), &collations, &key_tuple(k));
                assert!(exact);
                delete_rec(&block, &index, off, &mut mtr);
            }
            assert!(page::validate(block.frame(), &index));
            assert_eq!(page::n_recs(block.frame()), live.len());
            // the heap never runs into the directory
            let frame = block.frame();
            assert!(
                (page::heap_top(frame) as usize)
                    <= crate::page::dir::slot_off(page::n_dir_slots(frame) - 1)
            );
        }
        mtr.commit();
    }

    #[test]
    fn test_search_lands_on_last_equal_key() {
        let log = LogSys::new();
        let block = crate::buffer::BufBlock::new(0, 1);
        let index = test_index();
        let mut mtr = Mtr::start(log);
        mtr.x_latch(&block);
        page::create(&index, &block, &mut mtr);
        let collations = index.collations();
        // two records with collation-equal keys, binary-distinct
        for key in [b"aBc".to_vec(), b"abc".to_vec()] {
            let tuple = Tuple::new(vec![Field::Data(key)]);
            let rec = rec::encode_tuple(&tuple, RecStatus::Ordinary, 0).unwrap();
            let (cur, _) = search(block.frame(), &collations, &tuple);
            insert_rec(&block, &index, cur, &rec, &mut mtr).unwrap();
        }
        let (found, exact) = search(
            block.frame(),
            &[rookdb_catalog::Collation::AsciiCi],
            &Tuple::new(vec![Field::Data(b"abc".to_vec())]),
        );
        assert!(exact);
        let offsets = Offsets::compute(block.frame(), found);
        assert_eq!(offsets.nth_field(block.frame(), 0), Some(&b"abc"[..]));
        mtr.commit();
    }
}
