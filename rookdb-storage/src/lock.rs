//! Lock system interface.
//!
//! Record lock management lives outside the core; the page bulk
//! operations only notify it when record lists move between pages, and
//! the notification happens inside the same mini-transaction bracket as
//! the move itself.

use crate::buffer::BufBlock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub trait LockSys: Send + Sync {
    /// Records from `rec_off` to the supremum moved from `block` to the
    /// end of `new_block`.
    fn move_rec_list_end(&self, new_block: &Arc<BufBlock>, block: &Arc<BufBlock>, rec_off: u16);

    /// Records before `rec_off` moved from `block` to `new_block`,
    /// landing after `old_end` there.
    fn move_rec_list_start(
        &self,
        new_block: &Arc<BufBlock>,
        block: &Arc<BufBlock>,
        rec_off: u16,
        old_end: u16,
    );
}

/// Stand-in used when no lock manager is attached. Counts notifications
/// so tests can assert the bracket fired.
#[derive(Default)]
pub struct NoopLockSys {
    end_moves: AtomicUsize,
    start_moves: AtomicUsize,
}

impl NoopLockSys {
    #[inline]
    pub fn new() -> Arc<NoopLockSys> {
        Arc::new(NoopLockSys::default())
    }

    #[inline]
    pub fn end_moves(&self) -> usize {
        self.end_moves.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn start_moves(&self) -> usize {
        self.start_moves.load(Ordering::Relaxed)
    }
}

impl LockSys for NoopLockSys {
    fn move_rec_list_end(&self, _new_block: &Arc<BufBlock>, _block: &Arc<BufBlock>, _rec_off: u16) {
        self.end_moves.fetch_add(1, Ordering::Relaxed);
    }

    fn move_rec_list_start(
        &self,
        _new_block: &Arc<BufBlock>,
        _block: &Arc<BufBlock>,
        _rec_off: u16,
        _old_end: u16,
    ) {
        self.start_moves.fetch_add(1, Ordering::Relaxed);
    }
}
