//! Undo records and the rollback driver.
//!
//! An undo record is a compact buffer describing how to reverse one
//! row-level mutation. Insert records carry only the row reference;
//! modify records add the previous system columns and an update vector
//! holding the old field values.

pub mod ins;
pub mod modify;
#[cfg(test)]
mod rollback_tests;

use crate::btree::{LatchMode, Pcur};
use crate::buffer::PAGE_SIZE;
use crate::config::EngineConfig;
use crate::dict::{DictSys, Index, Table};
use crate::error::{Error, Result};
use crate::mach;
use crate::mtr::LogSys;
use crate::rec::Offsets;
use crate::row::{apply_update, row_roll_ptr, row_trx_id};
use crate::trx::{RollPtr, Trx, TrxID, TrxSys, UndoNo};
use crate::value::{CmplInfo, Field, Tuple, UpdField, Update};
use rookdb_catalog::TableID;
use std::collections::HashSet;
use std::sync::Arc;

pub const TRX_UNDO_INSERT_REC: u8 = 11;
pub const TRX_UNDO_UPD_EXIST_REC: u8 = 12;
pub const TRX_UNDO_UPD_DEL_REC: u8 = 13;
pub const TRX_UNDO_DEL_MARK_REC: u8 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoRecType {
    Insert,
    UpdExist,
    UpdDel,
    DelMark,
}

impl UndoRecType {
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            UndoRecType::Insert => TRX_UNDO_INSERT_REC,
            UndoRecType::UpdExist => TRX_UNDO_UPD_EXIST_REC,
            UndoRecType::UpdDel => TRX_UNDO_UPD_DEL_REC,
            UndoRecType::DelMark => TRX_UNDO_DEL_MARK_REC,
        }
    }
}

impl TryFrom<u8> for UndoRecType {
    type Error = Error;

    #[inline]
    fn try_from(code: u8) -> Result<UndoRecType> {
        match code {
            TRX_UNDO_INSERT_REC => Ok(UndoRecType::Insert),
            TRX_UNDO_UPD_EXIST_REC => Ok(UndoRecType::UpdExist),
            TRX_UNDO_UPD_DEL_REC => Ok(UndoRecType::UpdDel),
            TRX_UNDO_DEL_MARK_REC => Ok(UndoRecType::DelMark),
            _ => Err(Error::InvalidFormat),
        }
    }
}

fn push_field(out: &mut Vec<u8>, field: &Field) {
    mach::push_compressed(out, field.stored_len());
    out.extend_from_slice(field.local_bytes());
}

fn read_field(buf: &[u8], pos: usize) -> Result<(Field, usize)> {
    let (len, pos) = mach::read_compressed(buf, pos);
    let local_len = if len == crate::value::SQL_NULL {
        0
    } else if len >= crate::value::EXTERN_STORAGE_FIELD {
        (len - crate::value::EXTERN_STORAGE_FIELD) as usize
    } else {
        len as usize
    };
    if pos + local_len > buf.len() || local_len > PAGE_SIZE {
        return Err(Error::InvalidFormat);
    }
    let field = Field::from_stored(len, &buf[pos..pos + local_len]);
    Ok((field, pos + local_len))
}

fn push_tuple(out: &mut Vec<u8>, tuple: &Tuple) {
    mach::push_compressed(out, tuple.n_fields() as u32);
    for f in &tuple.fields {
        push_field(out, f);
    }
}

fn read_tuple(buf: &[u8], pos: usize) -> Result<(Tuple, usize)> {
    let (n, mut pos) = mach::read_compressed(buf, pos);
    if n as usize > crate::rec::REC_MAX_N_FIELDS {
        return Err(Error::InvalidFormat);
    }
    let mut fields = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (f, next) = read_field(buf, pos)?;
        fields.push(f);
        pos = next;
    }
    Ok((Tuple::new(fields), pos))
}

/// Encode a fresh-insert undo record.
pub fn encode_insert_rec(undo_no: UndoNo, table_id: TableID, row_ref: &Tuple) -> Vec<u8> {
    let mut out = vec![TRX_UNDO_INSERT_REC];
    mach::push_compressed_u64(&mut out, undo_no);
    mach::push_compressed_u64(&mut out, table_id);
    push_tuple(&mut out, row_ref);
    out
}

/// Encode a modify undo record: previous system columns, the row
/// reference and the update vector of old field values.
#[allow(clippy::too_many_arguments)]
pub fn encode_modify_rec(
    rec_type: UndoRecType,
    cmpl_info: CmplInfo,
    undo_no: UndoNo,
    table_id: TableID,
    info_bits: u8,
    trx_id: TrxID,
    roll_ptr: RollPtr,
    row_ref: &Tuple,
    upd_fields: &[UpdField],
) -> Vec<u8> {
    debug_assert!(rec_type != UndoRecType::Insert);
    let mut out = vec![rec_type.code(), cmpl_info.bits()];
    mach::push_compressed_u64(&mut out, undo_no);
    mach::push_compressed_u64(&mut out, table_id);
    out.push(info_bits);
    mach::push_compressed_u64(&mut out, trx_id);
    mach::push_compressed_u64(&mut out, roll_ptr);
    push_tuple(&mut out, row_ref);
    mach::push_compressed(&mut out, upd_fields.len() as u32);
    for uf in upd_fields {
        mach::push_compressed(&mut out, uf.field_no as u32);
        push_field(&mut out, &uf.new_val);
    }
    out
}

/// Header common to all undo records.
#[derive(Debug)]
pub struct ParsedUndoHdr {
    pub rec_type: UndoRecType,
    pub cmpl_info: CmplInfo,
    pub undo_no: UndoNo,
    pub table_id: TableID,
    pub pos: usize,
}

pub fn parse_hdr(buf: &[u8]) -> Result<ParsedUndoHdr> {
    if buf.is_empty() {
        return Err(Error::InvalidFormat);
    }
    let rec_type = UndoRecType::try_from(buf[0])?;
    let (cmpl_info, mut pos) = if rec_type == UndoRecType::Insert {
        (CmplInfo::empty(), 1)
    } else {
        (CmplInfo::from_bits_truncate(buf[1]), 2)
    };
    let (undo_no, next) = mach::read_compressed_u64(buf, pos);
    pos = next;
    let (table_id, next) = mach::read_compressed_u64(buf, pos);
    pos = next;
    Ok(ParsedUndoHdr {
        rec_type,
        cmpl_info,
        undo_no,
        table_id,
        pos,
    })
}

/// Previous system columns of a modify record.
pub fn parse_sys_cols(buf: &[u8], pos: usize) -> Result<(u8, TrxID, RollPtr, usize)> {
    if pos >= buf.len() {
        return Err(Error::InvalidFormat);
    }
    let info_bits = buf[pos];
    let (trx_id, pos) = mach::read_compressed_u64(buf, pos + 1);
    let (roll_ptr, pos) = mach::read_compressed_u64(buf, pos);
    Ok((info_bits, trx_id, roll_ptr, pos))
}

pub fn parse_row_ref(buf: &[u8], pos: usize) -> Result<(Tuple, usize)> {
    read_tuple(buf, pos)
}

/// Parse the update vector of a modify record, appending the previous
/// system columns so applying the update restores them too.
pub fn parse_update(
    buf: &[u8],
    pos: usize,
    info_bits: u8,
    trx_id: TrxID,
    roll_ptr: RollPtr,
    clust: &Index,
) -> Result<Update> {
    let (n, mut pos) = mach::read_compressed(buf, pos);
    let mut fields = Vec::with_capacity(n as usize + 2);
    for _ in 0..n {
        let (field_no, next) = mach::read_compressed(buf, pos);
        let (val, next) = read_field(buf, next)?;
        fields.push(UpdField {
            field_no: field_no as u16,
            new_val: val,
        });
        pos = next;
    }
    fields.push(UpdField {
        field_no: clust.trx_id_pos() as u16,
        new_val: crate::row::sys_field(trx_id),
    });
    fields.push(UpdField {
        field_no: clust.roll_ptr_pos() as u16,
        new_val: crate::row::sys_field(roll_ptr),
    });
    Ok(Update { fields, info_bits })
}

/// Parse a modify record into the update restoring the prior version,
/// for version chain walks.
pub fn parse_modify_for_vers(buf: &[u8], clust: &Index) -> Result<Update> {
    let hdr = parse_hdr(buf)?;
    if hdr.rec_type == UndoRecType::Insert {
        return Err(Error::InvalidFormat);
    }
    let (info_bits, trx_id, roll_ptr, pos) = parse_sys_cols(buf, hdr.pos)?;
    let (_ref, pos) = parse_row_ref(buf, pos)?;
    parse_update(buf, pos, info_bits, trx_id, roll_ptr, clust)
}

/// State of an undo node as the driver advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoState {
    Insert,
    Modify,
    FetchNext,
    PrevVers,
}

/// Per-record rollback state: one row being undone.
pub struct UndoNode {
    pub state: UndoState,
    pub trx: Arc<Trx>,
    pub undo_rec: Arc<[u8]>,
    pub undo_no: UndoNo,
    pub roll_ptr: RollPtr,
    pub rec_type: UndoRecType,
    pub cmpl_info: CmplInfo,
    pub table: Option<Arc<Table>>,
    pub pcur: Option<Pcur>,
    pub ref_key: Tuple,
    pub update: Update,
    // the clustered record as currently stored, in record field order
    pub row: Option<Tuple>,
    // the prior version, reconstructed by applying the update
    pub undo_row: Option<Tuple>,
    pub new_trx_id: TrxID,
    pub new_roll_ptr: RollPtr,
}

impl UndoNode {
    pub fn new(
        trx: Arc<Trx>,
        undo_rec: Arc<[u8]>,
        undo_no: UndoNo,
        roll_ptr: RollPtr,
        state: UndoState,
    ) -> UndoNode {
        UndoNode {
            state,
            trx,
            undo_rec,
            undo_no,
            roll_ptr,
            rec_type: UndoRecType::Insert,
            cmpl_info: CmplInfo::empty(),
            table: None,
            pcur: None,
            ref_key: Tuple::default(),
            update: Update::default(),
            row: None,
            undo_row: None,
            new_trx_id: 0,
            new_roll_ptr: 0,
        }
    }
}

/// Everything the undo entry points consult from the outside: the
/// dictionary cache, the transaction system, the engine configuration
/// and the redo log handle. Passed by value instead of living in a
/// process-wide singleton.
#[derive(Clone)]
pub struct UndoEnv {
    pub dict: Arc<dyn DictSys>,
    pub trx_sys: Arc<TrxSys>,
    pub cfg: EngineConfig,
    pub log_sys: Arc<LogSys>,
}

/// Position the node's persistent cursor on the clustered record named
/// by the parsed row reference and capture the row. Returns false when
/// the record is gone or no longer the version this undo record made,
/// which means the work is already done.
pub fn undo_search_clust_to_pcur(node: &mut UndoNode) -> bool {
    let table = node.table.as_ref().expect("table resolved by parse");
    let clust = table.clust();
    let mut mtr = clust.sys.mtr();
    let mut pcur = Pcur::new(Arc::clone(clust));

    let found = pcur.open(&node.ref_key, LatchMode::SearchLeaf, &mut mtr);
    if !found {
        pcur.close();
        mtr.commit();
        return false;
    }

    let block = pcur.block();
    let offsets = Offsets::compute(block.frame(), pcur.rec());
    let row = offsets.to_tuple(block.frame());

    let is_current_version = match node.rec_type {
        // a fresh insert is undone only while still owned by this trx
        UndoRecType::Insert => row_trx_id(&row, &clust.index) == node.trx.id,
        // a modify is undone only if the record still points at this
        // undo record
        _ => row_roll_ptr(&row, &clust.index) == node.roll_ptr,
    };
    if !is_current_version {
        pcur.close();
        mtr.commit();
        return false;
    }

    if node.rec_type == UndoRecType::UpdExist {
        let mut undo_row = row.clone();
        apply_update(&mut undo_row, &node.update);
        node.undo_row = Some(undo_row);
    }
    node.row = Some(row);

    pcur.commit_specify_mtr(&mut mtr);
    node.pcur = Some(pcur);
    true
}

/// Roll back every undo record of `trx` down to undo number `limit`.
///
/// The driver pops records newest first, builds an undo node per record
/// and dispatches on its type. A node that discovers the same row's
/// prior version inside the rollback range comes back in `PrevVers`
/// state and the prior record is processed out of turn.
pub fn rollback_to(trx: &Arc<Trx>, limit: UndoNo, env: &UndoEnv) -> Result<()> {
    trx.set_roll_limit(limit);
    let mut done: HashSet<UndoNo> = HashSet::new();
    let mut prev_vers: Option<RollPtr> = None;

    loop {
        let (undo_no, roll_ptr, undo_rec, state) = if let Some(rp) = prev_vers.take() {
            let rec = env
                .trx_sys
                .undo_rec(rp)
                .expect("reserved prior undo record exists");
            let hdr = parse_hdr(&rec)?;
            done.insert(hdr.undo_no);
            (hdr.undo_no, rp, rec, UndoState::Modify)
        } else {
            let Some((undo_no, roll_ptr)) = trx.pop_undo_rec(limit) else {
                break;
            };
            if done.contains(&undo_no) {
                continue;
            }
            if !trx.undo_rec_reserve(undo_no) {
                // another rollback thread owns this record
                continue;
            }
            let rec = env.trx_sys.undo_rec(roll_ptr).expect("undo record exists");
            let state = if UndoRecType::try_from(rec[0])? == UndoRecType::Insert {
                UndoState::Insert
            } else {
                UndoState::Modify
            };
            (undo_no, roll_ptr, rec, state)
        };

        let mut node = UndoNode::new(Arc::clone(trx), undo_rec, undo_no, roll_ptr, state);
        let res = match node.state {
            UndoState::Insert => ins::row_undo_ins(&mut node, env),
            UndoState::Modify => modify::row_undo_mod(&mut node, env),
            _ => unreachable!("driver dispatches only insert or modify"),
        };
        if let Some(table) = node.table.take() {
            env.dict.decrement_handle_count(&table);
        }
        res?;
        if node.state == UndoState::PrevVers {
            prev_vers = Some(node.new_roll_ptr);
        }
    }
    Ok(())
}

/// Roll the whole transaction back.
#[inline]
pub fn rollback(trx: &Arc<Trx>, env: &UndoEnv) -> Result<()> {
    rollback_to(trx, 0, env)
}
