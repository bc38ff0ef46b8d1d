//! Mini-transactions.
//!
//! A mini-transaction groups page mutations so they are atomically logged
//! and their latches released together. Every content mutation of a
//! latched page emits exactly one logical record (list deletes bracket a
//! group of suppressed per-record deletes), and the block modify clock is
//! incremented before the mutation so optimistic cursors notice.

use crate::buffer::{BufBlock, PageNo, SpaceID};
use crate::mach;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Redo log record types. The numeric values are part of the on-disk
/// log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MLogType {
    Write1 = 1,
    Write2 = 2,
    Write4 = 4,
    Write8 = 8,
    RecInsert = 9,
    RecClustDeleteMark = 10,
    RecSecDeleteMark = 11,
    RecUpdateInPlace = 13,
    RecDelete = 14,
    ListEndDelete = 15,
    ListStartDelete = 16,
    ListEndCopyCreated = 17,
    PageReorganize = 18,
    PageCreate = 19,
}

/// Body of a logical redo record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoBody {
    // body empty
    PageCreate,
    // record bytes inserted after the record at `prev_off`
    RecInsert { prev_off: u16, rec: Vec<u8> },
    RecDelete { off: u16 },
    RecClustDeleteMark { off: u16, marked: bool },
    RecSecDeleteMark { off: u16, marked: bool },
    RecUpdateInPlace { off: u16, rec: Vec<u8> },
    // 2-byte offset of the first record to delete
    ListEndDelete { off: u16 },
    ListStartDelete { off: u16 },
    ListEndCopyCreated { off: u16 },
    PageReorganize,
    Write4 { off: u16, val: u32 },
    Write8 { off: u16, val: u64 },
}

impl RedoBody {
    #[inline]
    pub fn mlog_type(&self) -> MLogType {
        match self {
            RedoBody::PageCreate => MLogType::PageCreate,
            RedoBody::RecInsert { .. } => MLogType::RecInsert,
            RedoBody::RecDelete { .. } => MLogType::RecDelete,
            RedoBody::RecClustDeleteMark { .. } => MLogType::RecClustDeleteMark,
            RedoBody::RecSecDeleteMark { .. } => MLogType::RecSecDeleteMark,
            RedoBody::RecUpdateInPlace { .. } => MLogType::RecUpdateInPlace,
            RedoBody::ListEndDelete { .. } => MLogType::ListEndDelete,
            RedoBody::ListStartDelete { .. } => MLogType::ListStartDelete,
            RedoBody::ListEndCopyCreated { .. } => MLogType::ListEndCopyCreated,
            RedoBody::PageReorganize => MLogType::PageReorganize,
            RedoBody::Write4 { .. } => MLogType::Write4,
            RedoBody::Write8 { .. } => MLogType::Write8,
        }
    }

    /// Wire encoding of the body. Offsets are big-endian 2-byte values.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            RedoBody::PageCreate | RedoBody::PageReorganize => vec![],
            RedoBody::RecInsert { prev_off, rec } => {
                let mut out = mach::encode_2(*prev_off).to_vec();
                out.extend_from_slice(rec);
                out
            }
            RedoBody::RecDelete { off }
            | RedoBody::ListEndDelete { off }
            | RedoBody::ListStartDelete { off }
            | RedoBody::ListEndCopyCreated { off } => mach::encode_2(*off).to_vec(),
            RedoBody::RecClustDeleteMark { off, marked }
            | RedoBody::RecSecDeleteMark { off, marked } => {
                let mut out = mach::encode_2(*off).to_vec();
                out.push(*marked as u8);
                out
            }
            RedoBody::RecUpdateInPlace { off, rec } => {
                let mut out = mach::encode_2(*off).to_vec();
                out.extend_from_slice(rec);
                out
            }
            RedoBody::Write4 { off, val } => {
                let mut out = mach::encode_2(*off).to_vec();
                out.extend_from_slice(&val.to_be_bytes());
                out
            }
            RedoBody::Write8 { off, val } => {
                let mut out = mach::encode_2(*off).to_vec();
                out.extend_from_slice(&val.to_be_bytes());
                out
            }
        }
    }
}

/// One logical redo record, addressed to a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoRec {
    pub space: SpaceID,
    pub page_no: PageNo,
    pub body: RedoBody,
}

/// The redo log writer. Mini-transactions append their record batches at
/// commit; the LSN orders batches totally across mini-transactions.
pub struct LogSys {
    buf: Mutex<Vec<RedoRec>>,
    lsn: AtomicU64,
}

impl Default for LogSys {
    #[inline]
    fn default() -> Self {
        LogSys {
            buf: Mutex::new(vec![]),
            lsn: AtomicU64::new(1),
        }
    }
}

impl LogSys {
    #[inline]
    pub fn new() -> Arc<LogSys> {
        Arc::new(LogSys::default())
    }

    /// Must be called before a mutating operation whose redo may be
    /// large, so the log buffer has headroom when the records arrive.
    #[inline]
    pub fn free_check(&self) {
        let mut buf = self.buf.lock();
        let len = buf.len();
        buf.reserve(len.max(64));
    }

    /// Append a committed batch and return the LSN assigned past it.
    #[inline]
    pub fn append_batch(&self, recs: Vec<RedoRec>) -> u64 {
        let n = recs.len() as u64;
        let mut buf = self.buf.lock();
        buf.extend(recs);
        self.lsn.fetch_add(n, Ordering::AcqRel) + n
    }

    #[inline]
    pub fn lsn(&self) -> u64 {
        self.lsn.load(Ordering::Acquire)
    }

    /// Snapshot of all records written so far.
    #[inline]
    pub fn records(&self) -> Vec<RedoRec> {
        self.buf.lock().clone()
    }

    /// Count records of one type, for tests and diagnostics.
    #[inline]
    pub fn count_of(&self, ty: MLogType) -> usize {
        self.buf
            .lock()
            .iter()
            .filter(|r| r.body.mlog_type() == ty)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Full,
    None,
    ShortInserts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchKind {
    S,
    X,
}

pub struct Mtr {
    log_sys: Arc<LogSys>,
    memo: Vec<(Arc<BufBlock>, LatchKind)>,
    log: Vec<RedoRec>,
    mode: LogMode,
    active: bool,
}

impl Mtr {
    #[inline]
    pub fn start(log_sys: Arc<LogSys>) -> Mtr {
        Mtr {
            log_sys,
            memo: vec![],
            log: vec![],
            mode: LogMode::Full,
            active: true,
        }
    }

    /// Begin the next mini-transaction on the same handle.
    #[inline]
    pub fn restart(&mut self) {
        debug_assert!(!self.active);
        debug_assert!(self.memo.is_empty());
        self.mode = LogMode::Full;
        self.active = true;
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[inline]
    pub fn log_sys(&self) -> &Arc<LogSys> {
        &self.log_sys
    }

    /// Switch the log mode, returning the previous one.
    #[inline]
    pub fn set_log_mode(&mut self, mode: LogMode) -> LogMode {
        std::mem::replace(&mut self.mode, mode)
    }

    #[inline]
    pub fn log_mode(&self) -> LogMode {
        self.mode
    }

    /// X-latch a block and remember it in the memo. Latching the same
    /// block twice within one mini-transaction is a no-op.
    #[inline]
    pub fn x_latch(&mut self, block: &Arc<BufBlock>) {
        debug_assert!(self.active);
        if self.memo_contains(block, LatchKind::X) {
            return;
        }
        debug_assert!(!self.memo_contains(block, LatchKind::S));
        block.latch.x_lock();
        self.memo.push((Arc::clone(block), LatchKind::X));
    }

    #[inline]
    pub fn s_latch(&mut self, block: &Arc<BufBlock>) {
        debug_assert!(self.active);
        if self.memo_contains(block, LatchKind::S) || self.memo_contains(block, LatchKind::X) {
            return;
        }
        block.latch.s_lock();
        self.memo.push((Arc::clone(block), LatchKind::S));
    }

    #[inline]
    pub fn memo_contains(&self, block: &Arc<BufBlock>, kind: LatchKind) -> bool {
        self.memo
            .iter()
            .any(|(b, k)| Arc::ptr_eq(b, block) && *k == kind)
    }

    /// Append a logical record for a mutation of `block`, subject to the
    /// current log mode.
    #[inline]
    pub fn log(&mut self, block: &BufBlock, body: RedoBody) {
        debug_assert!(self.active);
        match self.mode {
            LogMode::None => {}
            LogMode::Full | LogMode::ShortInserts => self.log.push(RedoRec {
                space: block.space(),
                page_no: block.page_no(),
                body,
            }),
        }
    }

    /// Number of records buffered so far in this mini-transaction.
    #[inline]
    pub fn n_log_recs(&self) -> usize {
        self.log.len()
    }

    /// Flush the buffered records to the log and release all latches in
    /// reverse acquisition order.
    #[inline]
    pub fn commit(&mut self) {
        debug_assert!(self.active);
        self.active = false;
        let recs = std::mem::take(&mut self.log);
        if !recs.is_empty() {
            self.log_sys.append_batch(recs);
        }
        while let Some((block, kind)) = self.memo.pop() {
            match kind {
                LatchKind::X => block.latch.x_unlock(),
                LatchKind::S => block.latch.s_unlock(),
            }
        }
    }
}

impl Drop for Mtr {
    #[inline]
    fn drop(&mut self) {
        // a panic may unwind through an active mtr; release the latches
        // so the poisoned state stays observable instead of deadlocking
        while let Some((block, kind)) = self.memo.pop() {
            match kind {
                LatchKind::X => block.latch.x_unlock(),
                LatchKind::S => block.latch.s_unlock(),
            }
        }
    }
}

/// Write a 32-bit field through the redo log.
#[inline]
pub fn mlog_write_u32(block: &BufBlock, off: usize, val: u32, mtr: &mut Mtr) {
    mach::write_4(block.frame_mut(), off, val);
    mtr.log(block, RedoBody::Write4 { off: off as u16, val });
}

/// Write a 64-bit field through the redo log.
#[inline]
pub fn mlog_write_u64(block: &BufBlock, off: usize, val: u64, mtr: &mut Mtr) {
    mach::write_8(block.frame_mut(), off, val);
    mtr.log(block, RedoBody::Write8 { off: off as u16, val });
}
