//! B-tree cursors over index pages.
//!
//! Each index is a tree of record pages; this core keeps every index in
//! a single leaf (the root), which is exactly the shape the page and
//! undo layers exercise. The cursor surface mirrors what rollback
//! needs: optimistic leaf operations that signal `Fail` when the page
//! cannot absorb the change, and pessimistic variants that may reshape
//! the page and consult the file-space allocator.

use crate::buffer::{BufBlock, BufPool};
use crate::dict::Index;
use crate::error::{Error, Result};
use crate::lock::LockSys;
use crate::mtr::{LogSys, Mtr, RedoBody};
use crate::page::{self, cur, list};
use crate::rec::{self, Offsets, RecStatus};
use crate::value::{Tuple, Update};
use std::sync::Arc;

/// Latch mode of a cursor descent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    // optimistic: X-latch the leaf only
    ModifyLeaf,
    // pessimistic: the operation may reshape the tree
    ModifyTree,
    // read positioning
    SearchLeaf,
}

/// File-space allocator consulted by pessimistic operations.
pub trait FileSpace: Send + Sync {
    /// Reserve `n` free pages for an operation that may grow the tree.
    fn reserve_free_extents(&self, n: usize) -> Result<()>;
}

/// Allocator over plain heap memory: reservations always succeed.
#[derive(Default)]
pub struct HeapFileSpace;

impl HeapFileSpace {
    #[inline]
    pub fn new() -> Arc<HeapFileSpace> {
        Arc::new(HeapFileSpace)
    }
}

impl FileSpace for HeapFileSpace {
    #[inline]
    fn reserve_free_extents(&self, _n: usize) -> Result<()> {
        Ok(())
    }
}

/// Shared collaborators of every tree.
pub struct BtreeSys {
    pub pool: Arc<BufPool>,
    pub space: Arc<dyn FileSpace>,
    pub lock_sys: Arc<dyn LockSys>,
    pub log_sys: Arc<LogSys>,
}

impl BtreeSys {
    #[inline]
    pub fn new(
        pool: Arc<BufPool>,
        space: Arc<dyn FileSpace>,
        lock_sys: Arc<dyn LockSys>,
        log_sys: Arc<LogSys>,
    ) -> Arc<BtreeSys> {
        Arc::new(BtreeSys {
            pool,
            space,
            lock_sys,
            log_sys,
        })
    }

    #[inline]
    pub fn mtr(&self) -> Mtr {
        Mtr::start(Arc::clone(&self.log_sys))
    }
}

pub struct Tree {
    pub index: Arc<Index>,
    pub root: Arc<BufBlock>,
    pub sys: Arc<BtreeSys>,
}

/// A cursor positioned on one record of a latched page.
#[derive(Clone)]
pub struct Cursor {
    pub block: Arc<BufBlock>,
    pub rec: u16,
}

impl Tree {
    /// Allocate and initialize the root page of a new index.
    pub fn create(index: Arc<Index>, sys: &Arc<BtreeSys>) -> Result<Arc<Tree>> {
        let root = sys.pool.alloc_block(0);
        let mut mtr = sys.mtr();
        mtr.x_latch(&root);
        page::create(&index, &root, &mut mtr);
        mtr.commit();
        Ok(Arc::new(Tree {
            index,
            root,
            sys: Arc::clone(sys),
        }))
    }

    /// Latch the leaf per `mode` and position on the last record less
    /// than or equal to `tuple`. Returns the cursor and exact-match flag.
    pub fn search_to_leaf(&self, tuple: &Tuple, mode: LatchMode, mtr: &mut Mtr) -> (Cursor, bool) {
        match mode {
            LatchMode::SearchLeaf => mtr.s_latch(&self.root),
            LatchMode::ModifyLeaf | LatchMode::ModifyTree => mtr.x_latch(&self.root),
        }
        let (rec, exact) = cur::search(self.root.frame(), &self.index.collations(), tuple);
        (
            Cursor {
                block: Arc::clone(&self.root),
                rec,
            },
            exact,
        )
    }

    /// Insert an index entry, reorganizing the page if the heap is
    /// fragmented. A record that does not fit even then is an
    /// out-of-space condition for this tree.
    pub fn insert(&self, entry: &Tuple, info_bits: u8, mtr: &mut Mtr) -> Result<u16> {
        mtr.x_latch(&self.root);
        let encoded = rec::encode_tuple(entry, RecStatus::Ordinary, info_bits)?;
        let (cur_rec, _) = cur::search(self.root.frame(), &self.index.collations(), entry);
        if let Some(origin) = cur::insert_rec(&self.root, &self.index, cur_rec, &encoded, mtr) {
            return Ok(origin);
        }
        if page::max_insert_size_after_reorganize(self.root.frame(), 1) < encoded.size() {
            self.sys.space.reserve_free_extents(1)?;
            return Err(Error::OutOfFileSpace);
        }
        list::reorganize(&self.root, &self.index, mtr);
        let (cur_rec, _) = cur::search(self.root.frame(), &self.index.collations(), entry);
        cur::insert_rec(&self.root, &self.index, cur_rec, &encoded, mtr)
            .ok_or(Error::OutOfFileSpace)
    }

    /// Optimistic delete of the cursor record. Refuses records carrying
    /// externally stored fields, which require a pessimistic descent.
    pub fn optimistic_delete(&self, cursor: &Cursor, mtr: &mut Mtr) -> bool {
        debug_assert!(mtr.memo_contains(&cursor.block, crate::mtr::LatchKind::X));
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        if offsets.any_extern() {
            return false;
        }
        cur::delete_rec(&cursor.block, &self.index, cursor.rec, mtr);
        true
    }

    /// Pessimistic delete: reserves file space, then removes the record
    /// together with any externally stored parts.
    pub fn pessimistic_delete(&self, cursor: &Cursor, mtr: &mut Mtr) -> Result<()> {
        self.sys.space.reserve_free_extents(1)?;
        // overflow page chains of extern fields would be freed here
        cur::delete_rec(&cursor.block, &self.index, cursor.rec, mtr);
        Ok(())
    }

    /// Set or clear the delete mark on a secondary index record.
    pub fn del_mark_set_sec_rec(&self, cursor: &Cursor, marked: bool, mtr: &mut Mtr) {
        debug_assert!(!self.index.is_clustered());
        rec::set_delete_mark(cursor.block.frame_mut(), cursor.rec, marked);
        mtr.log(
            &cursor.block,
            RedoBody::RecSecDeleteMark {
                off: cursor.rec,
                marked,
            },
        );
    }

    /// Set or clear the delete mark on a clustered index record.
    pub fn del_mark_set_clust_rec(&self, cursor: &Cursor, marked: bool, mtr: &mut Mtr) {
        debug_assert!(self.index.is_clustered());
        rec::set_delete_mark(cursor.block.frame_mut(), cursor.rec, marked);
        mtr.log(
            &cursor.block,
            RedoBody::RecClustDeleteMark {
                off: cursor.rec,
                marked,
            },
        );
    }

    fn apply_update(&self, old: &Tuple, update: &Update) -> Tuple {
        let mut tuple = old.clone();
        for uf in &update.fields {
            tuple.fields[uf.field_no as usize] = uf.new_val.clone();
        }
        tuple
    }

    fn replace_rec(
        &self,
        cursor: &mut Cursor,
        new_tuple: &Tuple,
        info_bits: u8,
        old_offsets: &Offsets,
        mtr: &mut Mtr,
    ) -> Result<()> {
        let encoded = rec::encode_tuple(new_tuple, RecStatus::Ordinary, info_bits)?;
        let frame = cursor.block.frame_mut();

        if encoded.size() == old_offsets.size() && encoded.extra == old_offsets.extra_size() {
            // same footprint: overwrite in place, keeping the list linkage
            let owned = rec::n_owned(frame, cursor.rec);
            let heap_no = rec::heap_no(frame, cursor.rec);
            let next = rec::next_offs(frame, cursor.rec);
            let start = old_offsets.start() as usize;
            frame[start..start + encoded.size()].copy_from_slice(&encoded.bytes);
            rec::set_n_owned(frame, cursor.rec, owned);
            rec::set_heap_no(frame, cursor.rec, heap_no);
            rec::set_next_offs(frame, cursor.rec, next);
            mtr.log(
                &cursor.block,
                RedoBody::RecUpdateInPlace {
                    off: cursor.rec,
                    rec: encoded.bytes,
                },
            );
            return Ok(());
        }

        // different footprint: the record moves, so delete and reinsert
        if encoded.size() > old_offsets.size()
            && page::max_insert_size(frame, 1) < encoded.size()
        {
            return Err(Error::Overflow);
        }
        let prev = page::rec_prev(frame, cursor.rec);
        cur::delete_rec(&cursor.block, &self.index, cursor.rec, mtr);
        match cur::insert_rec(&cursor.block, &self.index, prev, &encoded, mtr) {
            Some(origin) => {
                cursor.rec = origin;
                Ok(())
            }
            None => Err(Error::Overflow),
        }
    }

    /// Optimistic update: apply `update` to the cursor record keeping
    /// all changes within the page. Size bounds surface as `Overflow`
    /// or `Underflow` for the caller to escalate.
    pub fn optimistic_update(
        &self,
        cursor: &mut Cursor,
        update: &Update,
        mtr: &mut Mtr,
    ) -> Result<()> {
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        let old_tuple = offsets.to_tuple(cursor.block.frame());
        let new_tuple = self.apply_update(&old_tuple, update);
        self.replace_rec(cursor, &new_tuple, update.info_bits, &offsets, mtr)
    }

    /// Pessimistic update: reorganize the page to reclaim garbage, then
    /// apply the update. Exhausting even the reorganized page consults
    /// the allocator and surfaces out-of-space.
    pub fn pessimistic_update(
        &self,
        cursor: &mut Cursor,
        update: &Update,
        mtr: &mut Mtr,
    ) -> Result<()> {
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        let old_tuple = offsets.to_tuple(cursor.block.frame());
        let new_tuple = self.apply_update(&old_tuple, update);

        list::reorganize(&cursor.block, &self.index, mtr);
        // the reorganize moved every record; re-find by full key
        let (rec, exact) =
            cur::search(cursor.block.frame(), &self.index.collations(), &old_tuple);
        debug_assert!(exact);
        cursor.rec = rec;

        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        match self.replace_rec(cursor, &new_tuple, update.info_bits, &offsets, mtr) {
            Ok(()) => Ok(()),
            Err(Error::Overflow) | Err(Error::Underflow) => {
                self.sys.space.reserve_free_extents(1)?;
                Err(Error::OutOfFileSpace)
            }
            Err(err) => Err(err),
        }
    }
}

/// Stored position of a persistent cursor.
struct StoredPos {
    key: Tuple,
    modify_clock: u64,
    rec: u16,
}

/// A persistent cursor: can release its page latch and later reacquire
/// it, preserving the logical position. Between `restore_position` and
/// `commit_specify_mtr` it owns the latched page reference.
pub struct Pcur {
    pub tree: Arc<Tree>,
    cursor: Option<Cursor>,
    stored: Option<StoredPos>,
}

impl Pcur {
    #[inline]
    pub fn new(tree: Arc<Tree>) -> Pcur {
        Pcur {
            tree,
            cursor: None,
            stored: None,
        }
    }

    /// Open the cursor on `tuple`. Returns whether an exact match was
    /// found.
    pub fn open(&mut self, tuple: &Tuple, mode: LatchMode, mtr: &mut Mtr) -> bool {
        let (cursor, exact) = self.tree.search_to_leaf(tuple, mode, mtr);
        self.cursor = Some(cursor);
        exact
    }

    #[inline]
    pub fn cursor(&self) -> &Cursor {
        self.cursor.as_ref().expect("pcur is positioned")
    }

    #[inline]
    pub fn cursor_mut(&mut self) -> &mut Cursor {
        self.cursor.as_mut().expect("pcur is positioned")
    }

    #[inline]
    pub fn rec(&self) -> u16 {
        self.cursor().rec
    }

    #[inline]
    pub fn block(&self) -> Arc<BufBlock> {
        Arc::clone(&self.cursor().block)
    }

    /// Remember the current position so the latch can be released.
    pub fn store_position(&mut self) {
        let cursor = self.cursor.as_ref().expect("pcur is positioned");
        debug_assert!(page::rec_is_user_rec(cursor.rec));
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        self.stored = Some(StoredPos {
            key: offsets.to_tuple(cursor.block.frame()),
            modify_clock: cursor.block.modify_clock(),
            rec: cursor.rec,
        });
    }

    /// Store the position and commit the given mini-transaction,
    /// releasing the page latch.
    pub fn commit_specify_mtr(&mut self, mtr: &mut Mtr) {
        if let Some(cursor) = &self.cursor {
            if page::rec_is_user_rec(cursor.rec) {
                self.store_position();
            }
        }
        self.cursor = None;
        mtr.commit();
    }

    /// Re-latch the page and restore the stored position. If the page
    /// was not modified meanwhile the stored offset is still valid;
    /// otherwise the stored record is searched again. Returns whether
    /// the record was found.
    pub fn restore_position(&mut self, mode: LatchMode, mtr: &mut Mtr) -> bool {
        let stored = self.stored.as_ref().expect("pcur has a stored position");
        let root = Arc::clone(&self.tree.root);
        match mode {
            LatchMode::SearchLeaf => mtr.s_latch(&root),
            LatchMode::ModifyLeaf | LatchMode::ModifyTree => mtr.x_latch(&root),
        }
        if root.modify_clock() == stored.modify_clock {
            self.cursor = Some(Cursor {
                block: root,
                rec: stored.rec,
            });
            return true;
        }
        let (rec, exact) = cur::search(root.frame(), &self.tree.index.collations(), &stored.key);
        self.cursor = Some(Cursor { block: root, rec });
        exact
    }

    #[inline]
    pub fn close(&mut self) {
        self.cursor = None;
        self.stored = None;
    }
}

/// Search an index for an entry, positioning `pcur` on it.
pub fn row_search_index_entry(
    tree: &Arc<Tree>,
    entry: &Tuple,
    mode: LatchMode,
    pcur: &mut Pcur,
    mtr: &mut Mtr,
) -> bool {
    debug_assert!(Arc::ptr_eq(&pcur.tree, tree));
    pcur.open(entry, mode, mtr)
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::FileSpace;
    use crate::error::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Allocator that fails the first `fail_n` reservations.
    pub(crate) struct FailSpace {
        fail_n: usize,
        attempts: AtomicUsize,
    }

    impl FailSpace {
        pub(crate) fn new(fail_n: usize) -> std::sync::Arc<FailSpace> {
            std::sync::Arc::new(FailSpace {
                fail_n,
                attempts: AtomicUsize::new(0),
            })
        }

        pub(crate) fn attempts(&self) -> usize {
            self.attempts.load(Ordering::Relaxed)
        }
    }

    impl FileSpace for FailSpace {
        fn reserve_free_extents(&self, _n: usize) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::Relaxed);
            if n < self.fail_n {
                Err(Error::OutOfFileSpace)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::tests::test_index;
    use crate::lock::NoopLockSys;
    use crate::value::{Field, UpdField};

    pub(crate) fn test_sys() -> Arc<BtreeSys> {
        BtreeSys::new(
            BufPool::new(),
            HeapFileSpace::new(),
            NoopLockSys::new(),
            LogSys::new(),
        )
    }

    fn clust_tuple(k: u8, v: &[u8]) -> Tuple {
        Tuple::new(vec![
            Field::Data(vec![b'k', k]),
            Field::Data(vec![0; 8]),
            Field::Data(vec![0; 8]),
            Field::Data(v.to_vec()),
        ])
    }

    fn key(k: u8) -> Tuple {
        Tuple::new(vec![Field::Data(vec![b'k', k])])
    }

    #[test]
    fn test_insert_and_search_to_leaf() {
        let sys = test_sys();
        let tree = Tree::create(test_index(), &sys).unwrap();
        let mut mtr = sys.mtr();
        for k in [3u8, 1, 2] {
            tree.insert(&clust_tuple(k, b"v"), 0, &mut mtr).unwrap();
        }
        let (cursor, exact) = tree.search_to_leaf(&key(2), LatchMode::SearchLeaf, &mut mtr);
        assert!(exact);
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        assert_eq!(offsets.nth_field(cursor.block.frame(), 0), Some(&[b'k', 2][..]));
        mtr.commit();
    }

    #[test]
    fn test_optimistic_delete_refuses_extern() {
        let sys = test_sys();
        let tree = Tree::create(test_index(), &sys).unwrap();
        let mut mtr = sys.mtr();
        let mut tuple = clust_tuple(5, b"v");
        tuple.fields[3] = Field::Extern(b"local-prefix".to_vec());
        tree.insert(&tuple, 0, &mut mtr).unwrap();
        let (cursor, exact) = tree.search_to_leaf(&key(5), LatchMode::ModifyLeaf, &mut mtr);
        assert!(exact);
        assert!(!tree.optimistic_delete(&cursor, &mut mtr));
        // pessimistic descent removes it
        tree.pessimistic_delete(&cursor, &mut mtr).unwrap();
        assert_eq!(page::n_recs(cursor.block.frame()), 0);
        mtr.commit();
    }

    #[test]
    fn test_optimistic_update_in_place_and_resize() {
        let sys = test_sys();
        let tree = Tree::create(test_index(), &sys).unwrap();
        let mut mtr = sys.mtr();
        tree.insert(&clust_tuple(1, b"aaa"), 0, &mut mtr).unwrap();

        // same size: in place
        let update = Update {
            fields: vec![UpdField {
                field_no: 3,
                new_val: Field::Data(b"bbb".to_vec()),
            }],
            info_bits: 0,
        };
        let (mut cursor, exact) = tree.search_to_leaf(&key(1), LatchMode::ModifyLeaf, &mut mtr);
        assert!(exact);
        let rec_before = cursor.rec;
        tree.optimistic_update(&mut cursor, &update, &mut mtr).unwrap();
        assert_eq!(cursor.rec, rec_before);

        // larger: delete + reinsert within the page
        let update = Update {
            fields: vec![UpdField {
                field_no: 3,
                new_val: Field::Data(b"cccccccc".to_vec()),
            }],
            info_bits: 0,
        };
        tree.optimistic_update(&mut cursor, &update, &mut mtr).unwrap();
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        assert_eq!(
            offsets.nth_field(cursor.block.frame(), 3),
            Some(&b"cccccccc"[..])
        );
        assert!(page::validate(cursor.block.frame(), &tree.index));
        mtr.commit();
    }

    #[test]
    fn test_pessimistic_update_reclaims_garbage() {
        let sys = test_sys();
        let tree = Tree::create(test_index(), &sys).unwrap();
        let mut mtr = sys.mtr();
        for k in 1..=6u8 {
            tree.insert(&clust_tuple(k, b"value"), 0, &mut mtr).unwrap();
        }
        let (cursor, _) = tree.search_to_leaf(&key(3), LatchMode::ModifyLeaf, &mut mtr);
        tree.optimistic_delete(&cursor, &mut mtr);
        assert!(page::garbage_bytes(tree.root.frame()) > 0);

        let update = Update {
            fields: vec![UpdField {
                field_no: 3,
                new_val: Field::Data(b"longer-value".to_vec()),
            }],
            info_bits: 0,
        };
        let (mut cursor, exact) = tree.search_to_leaf(&key(4), LatchMode::ModifyTree, &mut mtr);
        assert!(exact);
        tree.pessimistic_update(&mut cursor, &update, &mut mtr).unwrap();
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        assert_eq!(
            offsets.nth_field(cursor.block.frame(), 3),
            Some(&b"longer-value"[..])
        );
        assert!(page::validate(tree.root.frame(), &tree.index));
        mtr.commit();
    }

    #[test]
    fn test_pcur_store_restore() {
        let sys = test_sys();
        let tree = Tree::create(test_index(), &sys).unwrap();
        let mut mtr = sys.mtr();
        for k in 1..=4u8 {
            tree.insert(&clust_tuple(k, b"v"), 0, &mut mtr).unwrap();
        }
        mtr.commit();

        let mut pcur = Pcur::new(Arc::clone(&tree));
        let mut mtr = sys.mtr();
        assert!(pcur.open(&key(2), LatchMode::ModifyLeaf, &mut mtr));
        pcur.commit_specify_mtr(&mut mtr);

        // unchanged page: restore by modify clock
        mtr.restart();
        assert!(pcur.restore_position(LatchMode::ModifyLeaf, &mut mtr));
        pcur.commit_specify_mtr(&mut mtr);

        // reorganize invalidates the clock; restore re-searches
        mtr.restart();
        mtr.x_latch(&tree.root);
        list::reorganize(&tree.root, &tree.index, &mut mtr);
        mtr.commit();
        mtr.restart();
        assert!(pcur.restore_position(LatchMode::ModifyLeaf, &mut mtr));
        let offsets = Offsets::compute(pcur.block().frame(), pcur.rec());
        assert_eq!(
            offsets.nth_field(pcur.block().frame(), 0),
            Some(&[b'k', 2][..])
        );
        pcur.commit_specify_mtr(&mut mtr);

        // delete the record; restore reports it missing
        mtr.restart();
        let (cursor, exact) = tree.search_to_leaf(&key(2), LatchMode::ModifyLeaf, &mut mtr);
        assert!(exact);
        assert!(tree.optimistic_delete(&cursor, &mut mtr));
        mtr.commit();
        mtr.restart();
        assert!(!pcur.restore_position(LatchMode::ModifyLeaf, &mut mtr));
        pcur.commit_specify_mtr(&mut mtr);
    }

    #[test]
    fn test_insert_out_of_space() {
        let sys = test_sys();
        let tree = Tree::create(test_index(), &sys).unwrap();
        let mut mtr = sys.mtr();
        let mut k = 0u16;
        // fill the page with large values until it refuses
        loop {
            let tuple = Tuple::new(vec![
                Field::Data(k.to_be_bytes().to_vec()),
                Field::Data(vec![0; 8]),
                Field::Data(vec![0; 8]),
                Field::Data(vec![b'x'; 512]),
            ]);
            match tree.insert(&tuple, 0, &mut mtr) {
                Ok(_) => k += 1,
                Err(Error::OutOfFileSpace) => break,
                Err(err) => panic!("unexpected error {err:?}"),
            }
            assert!(k < 100, "page never filled up");
        }
        assert!(page::validate(tree.root.frame(), &tree.index));
        mtr.commit();
    }
}
