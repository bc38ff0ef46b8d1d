//! Transactions and the transaction system.
//!
//! Only the slice the undo core depends on lives here: identifiers,
//! per-transaction undo record bookkeeping with the reserve/release
//! protocol serializing rollback work, and the system-wide undo record
//! store addressed by roll pointers.

pub mod undo;

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub type TrxID = u64;
pub type UndoNo = u64;
pub type RollPtr = u64;

pub const ROLL_PTR_NULL: RollPtr = 0;
pub const ROLL_PTR_INSERT_FLAG: RollPtr = 1 << 63;

#[inline]
pub fn roll_ptr_is_insert(roll_ptr: RollPtr) -> bool {
    roll_ptr & ROLL_PTR_INSERT_FLAG != 0
}

#[inline]
fn roll_ptr_pos(roll_ptr: RollPtr) -> Option<usize> {
    let pos = roll_ptr & !ROLL_PTR_INSERT_FLAG;
    if pos == 0 { None } else { Some(pos as usize - 1) }
}

/// The transaction system: id assignment, the undo record store and the
/// oldest read view, which decides what delete-marked versions must be
/// preserved.
pub struct TrxSys {
    next_trx_id: AtomicU64,
    undo_store: Mutex<Vec<Arc<[u8]>>>,
    oldest_view_ts: AtomicU64,
}

impl Default for TrxSys {
    #[inline]
    fn default() -> Self {
        TrxSys {
            next_trx_id: AtomicU64::new(16),
            undo_store: Mutex::new(vec![]),
            oldest_view_ts: AtomicU64::new(u64::MAX),
        }
    }
}

impl TrxSys {
    #[inline]
    pub fn new() -> Arc<TrxSys> {
        Arc::new(TrxSys::default())
    }

    #[inline]
    pub fn begin(self: &Arc<TrxSys>) -> Arc<Trx> {
        self.begin_with(false)
    }

    /// A transaction resurrected by crash recovery; its rollback may
    /// encounter partially installed changes.
    #[inline]
    pub fn begin_recovered(self: &Arc<TrxSys>) -> Arc<Trx> {
        self.begin_with(true)
    }

    fn begin_with(self: &Arc<TrxSys>, recv: bool) -> Arc<Trx> {
        let id = self.next_trx_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Trx {
            id,
            sys: Arc::clone(self),
            recv,
            undo: Mutex::new(vec![]),
            undo_no_arr: Mutex::new(HashSet::new()),
            roll_limit: AtomicU64::new(0),
            dict_operation_x_latch: AtomicBool::new(false),
        })
    }

    /// Store an undo record, returning the roll pointer addressing it.
    pub fn store_undo_rec(&self, bytes: Vec<u8>, is_insert: bool) -> RollPtr {
        let mut store = self.undo_store.lock();
        store.push(Arc::from(bytes.into_boxed_slice()));
        let ptr = store.len() as RollPtr;
        if is_insert {
            ptr | ROLL_PTR_INSERT_FLAG
        } else {
            ptr
        }
    }

    /// Fetch an undo record by roll pointer. `None` for the null pointer
    /// or a record already discarded by purge.
    pub fn undo_rec(&self, roll_ptr: RollPtr) -> Option<Arc<[u8]>> {
        let pos = roll_ptr_pos(roll_ptr)?;
        self.undo_store.lock().get(pos).cloned()
    }

    /// Lower the oldest read view timestamp. Versions created by
    /// transactions at or past it must be preserved for readers.
    #[inline]
    pub fn set_oldest_view_ts(&self, ts: TrxID) {
        self.oldest_view_ts.store(ts, Ordering::Relaxed);
    }

    #[inline]
    pub fn oldest_view_ts(&self) -> TrxID {
        self.oldest_view_ts.load(Ordering::Relaxed)
    }
}

pub struct Trx {
    pub id: TrxID,
    pub sys: Arc<TrxSys>,
    recv: bool,
    // (undo_no, roll_ptr) of this transaction's undo records, ascending
    undo: Mutex<Vec<(UndoNo, RollPtr)>>,
    // undo numbers reserved by an ongoing rollback
    undo_no_arr: Mutex<HashSet<UndoNo>>,
    roll_limit: AtomicU64,
    dict_operation_x_latch: AtomicBool,
}

impl Trx {
    #[inline]
    pub fn is_recv(&self) -> bool {
        self.recv
    }

    #[inline]
    pub fn next_undo_no(&self) -> UndoNo {
        self.undo.lock().len() as UndoNo
    }

    /// Append an undo record, assigning it the next undo number.
    pub fn append_undo_rec(&self, bytes: Vec<u8>, is_insert: bool) -> (UndoNo, RollPtr) {
        let roll_ptr = self.sys.store_undo_rec(bytes, is_insert);
        let mut undo = self.undo.lock();
        let undo_no = undo.len() as UndoNo;
        undo.push((undo_no, roll_ptr));
        (undo_no, roll_ptr)
    }

    /// Roll pointer of the latest undo record, null if none.
    #[inline]
    pub fn last_roll_ptr(&self) -> RollPtr {
        self.undo.lock().last().map(|(_, rp)| *rp).unwrap_or(ROLL_PTR_NULL)
    }

    /// Pop the topmost undo record whose number is within the rollback
    /// range.
    pub fn pop_undo_rec(&self, limit: UndoNo) -> Option<(UndoNo, RollPtr)> {
        let mut undo = self.undo.lock();
        match undo.last() {
            Some((no, _)) if *no >= limit => undo.pop(),
            _ => None,
        }
    }

    /// Reserve an undo number for rollback. Returns false if some other
    /// rollback work already holds it.
    pub fn undo_rec_reserve(&self, undo_no: UndoNo) -> bool {
        self.undo_no_arr.lock().insert(undo_no)
    }

    pub fn undo_rec_release(&self, undo_no: UndoNo) {
        self.undo_no_arr.lock().remove(&undo_no);
    }

    #[inline]
    pub fn set_roll_limit(&self, limit: UndoNo) {
        self.roll_limit.store(limit, Ordering::Relaxed);
    }

    #[inline]
    pub fn roll_limit(&self) -> UndoNo {
        self.roll_limit.load(Ordering::Relaxed)
    }

    /// Whether the transaction holds the dictionary X-latch, required
    /// when rolling back rows of the dictionary's own tables.
    #[inline]
    pub fn set_dict_operation_x_latch(&self, held: bool) {
        self.dict_operation_x_latch.store(held, Ordering::Relaxed);
    }

    #[inline]
    pub fn holds_dict_operation_x_latch(&self) -> bool {
        self.dict_operation_x_latch.load(Ordering::Relaxed)
    }
}
