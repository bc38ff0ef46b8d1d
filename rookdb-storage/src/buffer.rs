//! Buffer blocks and page latches.
//!
//! The buffer pool proper (eviction, disk IO) is an external collaborator;
//! this module provides the block handle the page core works against: a
//! fixed-size frame, a modify clock for optimistic cursor invalidation and
//! a rw-latch that mini-transactions acquire and release as a set.

use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub const PAGE_SIZE: usize = 16 * 1024;

pub type PageBuf = [u8; PAGE_SIZE];
pub type PageNo = u32;
pub type SpaceID = u32;

/// Block rw-latch. Guards are intentionally not used: a mini-transaction
/// memo owns the latches and releases them in reverse acquisition order
/// at commit, which does not fit lexically scoped guards.
pub struct PageLatch {
    raw: RawRwLock,
}

impl Default for PageLatch {
    #[inline]
    fn default() -> Self {
        PageLatch {
            raw: RawRwLockApi::INIT,
        }
    }
}

impl PageLatch {
    #[inline]
    pub fn x_lock(&self) {
        self.raw.lock_exclusive();
    }

    /// The caller must hold the exclusive latch.
    #[inline]
    pub fn x_unlock(&self) {
        debug_assert!(self.raw.is_locked_exclusive());
        unsafe { self.raw.unlock_exclusive() }
    }

    #[inline]
    pub fn s_lock(&self) {
        self.raw.lock_shared();
    }

    /// The caller must hold a shared latch.
    #[inline]
    pub fn s_unlock(&self) {
        debug_assert!(self.raw.is_locked());
        unsafe { self.raw.unlock_shared() }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    #[inline]
    pub fn is_x_locked(&self) -> bool {
        self.raw.is_locked_exclusive()
    }
}

/// A latched page frame handle.
pub struct BufBlock {
    space: SpaceID,
    page_no: PageNo,
    frame: UnsafeCell<Box<PageBuf>>,
    modify_clock: AtomicU64,
    pub latch: PageLatch,
}

// Frame access is guarded by the latch; the block itself is shared freely.
unsafe impl Send for BufBlock {}
unsafe impl Sync for BufBlock {}

impl BufBlock {
    #[inline]
    pub fn new(space: SpaceID, page_no: PageNo) -> Arc<BufBlock> {
        Arc::new(BufBlock {
            space,
            page_no,
            frame: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
            modify_clock: AtomicU64::new(0),
            latch: PageLatch::default(),
        })
    }

    #[inline]
    pub fn space(&self) -> SpaceID {
        self.space
    }

    #[inline]
    pub fn page_no(&self) -> PageNo {
        self.page_no
    }

    /// Read access to the frame. The caller must hold the latch in any
    /// mode, which the mini-transaction memo guarantees.
    #[inline]
    pub fn frame(&self) -> &PageBuf {
        debug_assert!(self.latch.is_locked());
        unsafe { &**self.frame.get() }
    }

    /// Write access to the frame. The caller must hold the X latch.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn frame_mut(&self) -> &mut PageBuf {
        debug_assert!(self.latch.is_x_locked());
        unsafe { &mut **self.frame.get() }
    }

    #[inline]
    pub fn modify_clock(&self) -> u64 {
        self.modify_clock.load(Ordering::Acquire)
    }

    /// Invalidate optimistic cursor positions on this block. Called
    /// before any mutation that changes record placement.
    #[inline]
    pub fn modify_clock_inc(&self) {
        debug_assert!(self.latch.is_x_locked());
        self.modify_clock.fetch_add(1, Ordering::AcqRel);
    }
}

/// Minimal in-memory pool: allocation and lookup only. Eviction and disk
/// IO stay outside the core.
pub struct BufPool {
    blocks: Mutex<HashMap<(SpaceID, PageNo), Arc<BufBlock>>>,
    next_page_no: AtomicU32,
}

impl Default for BufPool {
    #[inline]
    fn default() -> Self {
        BufPool {
            blocks: Mutex::new(HashMap::new()),
            next_page_no: AtomicU32::new(1),
        }
    }
}

impl BufPool {
    #[inline]
    pub fn new() -> Arc<BufPool> {
        Arc::new(BufPool::default())
    }

    /// Allocate a fresh zeroed block in `space`.
    #[inline]
    pub fn alloc_block(&self, space: SpaceID) -> Arc<BufBlock> {
        let page_no = self.next_page_no.fetch_add(1, Ordering::Relaxed);
        let block = BufBlock::new(space, page_no);
        self.blocks.lock().insert((space, page_no), Arc::clone(&block));
        block
    }

    #[inline]
    pub fn get(&self, space: SpaceID, page_no: PageNo) -> Option<Arc<BufBlock>> {
        self.blocks.lock().get(&(space, page_no)).cloned()
    }
}
