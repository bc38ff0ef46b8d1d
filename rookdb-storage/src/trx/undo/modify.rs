//! Undo modify of a row.
//!
//! Considerations on undoing a modify operation:
//!
//! 1. Undoing a delete marking: all index records should be found, but
//!    some may already carry a cleared mark if the operation stopped
//!    underway or the rollback was cut short by a crash.
//! 2. Undoing an update of a delete-unmarked record: the newer version
//!    of an updated secondary entry is removed if no prior version of
//!    the clustered record requires its existence, else delete-marked.
//! 3. Undoing an update of a delete-marked record: the record was
//!    delete-unmarked and possibly changed; the delete-marked version
//!    may have become obsolete by the time the undo starts.

use crate::btree::{LatchMode, Pcur, Tree, row_search_index_entry};
use crate::dict::Index;
use crate::error::{Error, Result};
use crate::rec::Offsets;
use crate::row::{build_index_entry, sec_rec_difference, vers};
use crate::trx::UndoNo;
use crate::trx::undo::{
    UndoEnv, UndoNode, UndoRecType, UndoState, parse_hdr, parse_row_ref, parse_sys_cols,
    parse_update, undo_search_clust_to_pcur,
};
use crate::value::{CmplInfo, Tuple};
use std::sync::Arc;

/// Checks whether the previous version of the clustered record was also
/// written by this transaction with an undo number inside the rollback
/// range. Returns that undo number if so.
fn undo_also_prev_vers(node: &UndoNode, env: &UndoEnv) -> Option<UndoNo> {
    if node.new_trx_id != node.trx.id {
        return None;
    }
    let undo_rec = env.trx_sys.undo_rec(node.new_roll_ptr)?;
    let undo_no = parse_hdr(&undo_rec).ok()?.undo_no;
    (node.trx.roll_limit() <= undo_no).then_some(undo_no)
}

/// One descent applying the inverse update to the clustered record.
fn clust_low(
    node: &UndoNode,
    pcur: &mut Pcur,
    clust: &Arc<Tree>,
    mode: LatchMode,
    mtr: &mut crate::mtr::Mtr,
) -> Result<()> {
    let success = pcur.restore_position(mode, mtr);
    assert!(success);

    match mode {
        LatchMode::ModifyLeaf => clust
            .optimistic_update(pcur.cursor_mut(), &node.update, mtr)
            .map_err(Error::demote_to_fail),
        LatchMode::ModifyTree => clust.pessimistic_update(pcur.cursor_mut(), &node.update, mtr),
        LatchMode::SearchLeaf => unreachable!("update needs a modify latch"),
    }
}

/// One descent removing the clustered record after an `UpdDel` undo, if
/// no reader still needs the delete-marked version.
fn remove_clust_low(
    node: &UndoNode,
    pcur: &mut Pcur,
    clust: &Arc<Tree>,
    env: &UndoEnv,
    mode: LatchMode,
    mtr: &mut crate::mtr::Mtr,
) -> Result<()> {
    debug_assert_eq!(node.rec_type, UndoRecType::UpdDel);

    if !pcur.restore_position(mode, mtr) {
        return Ok(());
    }
    if vers::must_preserve_del_marked(&env.trx_sys, node.new_trx_id) {
        return Ok(());
    }

    match mode {
        LatchMode::ModifyLeaf => {
            if clust.optimistic_delete(pcur.cursor(), mtr) {
                Ok(())
            } else {
                Err(Error::Fail)
            }
        }
        // analogous to purge: inherited externally stored fields may be
        // freed as well
        LatchMode::ModifyTree => clust.pessimistic_delete(pcur.cursor(), mtr),
        LatchMode::SearchLeaf => unreachable!("removal needs a modify latch"),
    }
}

/// Undoes the modify in the clustered index and sets the node state for
/// the next round of undo.
fn undo_mod_clust(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    // check first whether the previous version of this record should be
    // undone in this same rollback
    let more_vers = undo_also_prev_vers(node, env);

    let table = Arc::clone(node.table.as_ref().expect("table resolved"));
    let clust = Arc::clone(table.clust());
    let mut pcur = node.pcur.take().expect("cursor positioned on the record");
    let mut mtr = clust.sys.mtr();

    // optimistic processing first, keeping changes within the page
    let mut err = clust_low(node, &mut pcur, &clust, LatchMode::ModifyLeaf, &mut mtr);
    if err.is_err() {
        pcur.commit_specify_mtr(&mut mtr);
        mtr.restart();
        err = clust_low(node, &mut pcur, &clust, LatchMode::ModifyTree, &mut mtr);
    }
    pcur.commit_specify_mtr(&mut mtr);

    if err.is_ok() && node.rec_type == UndoRecType::UpdDel {
        mtr.restart();
        err = remove_clust_low(node, &mut pcur, &clust, env, LatchMode::ModifyLeaf, &mut mtr);
        if err.is_err() {
            pcur.commit_specify_mtr(&mut mtr);
            mtr.restart();
            err = remove_clust_low(node, &mut pcur, &clust, env, LatchMode::ModifyTree, &mut mtr);
        }
        pcur.commit_specify_mtr(&mut mtr);
    }

    node.state = UndoState::FetchNext;
    node.trx.undo_rec_release(node.undo_no);

    if let (Some(new_undo_no), Ok(())) = (more_vers, &err) {
        // reserve the prior undo record after committing the mtr, per
        // the latch order between page latches and the undo bookkeeping
        if node.trx.undo_rec_reserve(new_undo_no) {
            node.state = UndoState::PrevVers;
        }
    }

    err
}

/// Delete-marks or removes one secondary index entry, with the given
/// descent mode.
fn del_mark_or_remove_sec_low(
    node: &mut UndoNode,
    sec: &Arc<Tree>,
    entry: &Tuple,
    mode: LatchMode,
    env: &UndoEnv,
) -> Result<()> {
    env.log_sys.free_check();
    let mut mtr = sec.sys.mtr();
    let mut pcur = Pcur::new(Arc::clone(sec));

    let found = row_search_index_entry(sec, entry, mode, &mut pcur, &mut mtr);
    if !found {
        // in crash recovery the UPDATE may not have inserted this entry
        // before the crash; in normal processing a deadlock may have
        // rolled the UPDATE back before it got this far
        pcur.close();
        mtr.commit();
        return Ok(());
    }

    // remove the entry if no prior version of the row, which cannot be
    // purged yet, requires its existence; otherwise delete-mark it
    let clust = Arc::clone(node.table.as_ref().expect("table resolved").clust());
    let mut mtr_vers = clust.sys.mtr();
    let node_pcur = node.pcur.as_mut().expect("clustered cursor stored");
    let success = node_pcur.restore_position(LatchMode::SearchLeaf, &mut mtr_vers);
    assert!(success);

    let old_has = {
        let block = node_pcur.block();
        let offsets = Offsets::compute(block.frame(), node_pcur.rec());
        vers::old_has_index_entry(
            false,
            block.frame(),
            &offsets,
            &clust.index,
            &sec.index,
            entry,
            &env.trx_sys,
        )
    };

    let res = if old_has {
        sec.del_mark_set_sec_rec(pcur.cursor(), true, &mut mtr);
        Ok(())
    } else {
        match mode {
            LatchMode::ModifyLeaf => {
                if sec.optimistic_delete(pcur.cursor(), &mut mtr) {
                    Ok(())
                } else {
                    Err(Error::Fail)
                }
            }
            LatchMode::ModifyTree => sec.pessimistic_delete(pcur.cursor(), &mut mtr),
            LatchMode::SearchLeaf => unreachable!("removal needs a modify latch"),
        }
    };

    node_pcur.commit_specify_mtr(&mut mtr_vers);
    pcur.close();
    mtr.commit();
    res
}

fn del_mark_or_remove_sec(
    node: &mut UndoNode,
    sec: &Arc<Tree>,
    entry: &Tuple,
    env: &UndoEnv,
) -> Result<()> {
    match del_mark_or_remove_sec_low(node, sec, entry, LatchMode::ModifyLeaf, env) {
        Ok(()) => Ok(()),
        Err(_) => del_mark_or_remove_sec_low(node, sec, entry, LatchMode::ModifyTree, env),
    }
}

/// Delete-unmarks a secondary index entry which must be found, and
/// restores its stored bytes to `entry` if an update left them
/// different while alphabetically the same, e.g. 'abc' -> 'aBc'.
fn del_unmark_sec_and_undo_update(
    mode: LatchMode,
    sec: &Arc<Tree>,
    entry: &Tuple,
    env: &UndoEnv,
) -> Result<()> {
    // indexes being created are handled by their builder
    if sec.index.is_temp() {
        return Ok(());
    }

    env.log_sys.free_check();
    let mut mtr = sec.sys.mtr();
    let mut pcur = Pcur::new(Arc::clone(sec));

    let res = if !row_search_index_entry(sec, entry, mode, &mut pcur, &mut mtr) {
        tracing::error!(
            index = %sec.index.name,
            entry = ?entry,
            "record not found in the undo of a secondary index delete-mark"
        );
        Ok(())
    } else {
        // it might not be delete-marked at the moment, unmarking again
        // does no harm
        sec.del_mark_set_sec_rec(pcur.cursor(), false, &mut mtr);

        let update = {
            let block = pcur.block();
            let offsets = Offsets::compute(block.frame(), pcur.rec());
            sec_rec_difference(block.frame(), &offsets, entry)
        };
        if update.is_empty() {
            Ok(())
        } else {
            match mode {
                LatchMode::ModifyLeaf => sec
                    .optimistic_update(pcur.cursor_mut(), &update, &mut mtr)
                    .map_err(Error::demote_to_fail),
                LatchMode::ModifyTree => {
                    sec.pessimistic_update(pcur.cursor_mut(), &update, &mut mtr)
                }
                LatchMode::SearchLeaf => unreachable!("update needs a modify latch"),
            }
        }
    };

    pcur.close();
    mtr.commit();
    res
}

/// Does the update touch an ordering field of the secondary index?
fn update_changes_ord_field(clust: &Index, sec: &Index, update: &crate::value::Update) -> bool {
    update.fields.iter().any(|uf| {
        let col_no = clust.fields[uf.field_no as usize].col_no;
        sec.fields.iter().take(sec.n_key).any(|sf| sf.col_no == col_no)
    })
}

/// Secondary index undo for `UpdDel` records.
fn upd_del_sec(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    debug_assert_eq!(node.rec_type, UndoRecType::UpdDel);
    let table = Arc::clone(node.table.as_ref().expect("table resolved"));
    let clust_index = Arc::clone(&table.clust().index);
    let row = node.row.clone().expect("row captured");

    for sec in table.sec() {
        match build_index_entry(&row, &clust_index, &sec.index) {
            None => {
                // only legal when rolling back an incomplete transaction
                // whose externally stored columns were never written
                assert!(node.trx.is_recv());
            }
            Some(entry) => del_mark_or_remove_sec(node, sec, &entry, env)?,
        }
    }
    Ok(())
}

/// Secondary index undo for `DelMark` records.
fn del_mark_sec(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    let table = Arc::clone(node.table.as_ref().expect("table resolved"));
    let clust_index = Arc::clone(&table.clust().index);
    let row = node.row.clone().expect("row captured");

    for sec in table.sec() {
        let entry = build_index_entry(&row, &clust_index, &sec.index)
            .expect("delete-mark leaves all columns stored");
        let res = del_unmark_sec_and_undo_update(LatchMode::ModifyLeaf, sec, &entry, env);
        match res {
            Err(Error::Fail) => {
                del_unmark_sec_and_undo_update(LatchMode::ModifyTree, sec, &entry, env)?
            }
            res => res?,
        }
    }
    Ok(())
}

/// Secondary index undo for `UpdExist` records.
fn upd_exist_sec(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    if node.cmpl_info.contains(CmplInfo::NO_ORD_CHANGE) {
        // no change in any secondary index
        return Ok(());
    }

    let table = Arc::clone(node.table.as_ref().expect("table resolved"));
    let clust_index = Arc::clone(&table.clust().index);
    let row = node.row.clone().expect("row captured");
    let undo_row = node.undo_row.clone().expect("prior version built");

    for sec in table.sec() {
        if !update_changes_ord_field(&clust_index, &sec.index, &node.update) {
            continue;
        }

        // the newest version of the entry is delete-marked or removed
        let entry = build_index_entry(&row, &clust_index, &sec.index)
            .expect("current version is fully stored");
        del_mark_or_remove_sec(node, sec, &entry, env)?;

        // the previous version is delete-unmarked and, if the stored
        // bytes differ while collating equal, restored
        let undo_entry = build_index_entry(&undo_row, &clust_index, &sec.index)
            .expect("prior version is fully stored");
        let res = del_unmark_sec_and_undo_update(LatchMode::ModifyLeaf, sec, &undo_entry, env);
        match res {
            Err(Error::Fail) => {
                del_unmark_sec_and_undo_update(LatchMode::ModifyTree, sec, &undo_entry, env)?
            }
            res => res?,
        }
    }
    Ok(())
}

/// Parses the row reference, previous system columns and update vector
/// of a modify undo record.
fn parse_undo_rec(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    let hdr = parse_hdr(&node.undo_rec)?;
    debug_assert_ne!(hdr.rec_type, UndoRecType::Insert);
    node.rec_type = hdr.rec_type;
    node.cmpl_info = hdr.cmpl_info;

    let Some(table) = env.dict.table_on_id(env.cfg.force_recovery, hdr.table_id) else {
        // table was dropped
        return Ok(());
    };
    if table.ibd_file_missing {
        // undo against a missing data file is skipped
        env.dict.decrement_handle_count(&table);
        return Ok(());
    }

    let clust_index = Arc::clone(&table.clust().index);
    node.table = Some(table);

    let undo_rec = Arc::clone(&node.undo_rec);
    let (info_bits, trx_id, roll_ptr, pos) = parse_sys_cols(&undo_rec, hdr.pos)?;
    let (ref_key, pos) = parse_row_ref(&undo_rec, pos)?;
    node.update = parse_update(&undo_rec, pos, info_bits, trx_id, roll_ptr, &clust_index)?;
    node.new_trx_id = trx_id;
    node.new_roll_ptr = roll_ptr;
    node.ref_key = ref_key;
    Ok(())
}

/// Undoes a modify operation on a row: secondary indexes first, the
/// clustered record last.
pub fn row_undo_mod(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    debug_assert_eq!(node.state, UndoState::Modify);

    parse_undo_rec(node, env)?;

    if node.table.is_none() || !undo_search_clust_to_pcur(node) {
        // already undone, or the table was dropped
        node.trx.undo_rec_release(node.undo_no);
        node.state = UndoState::FetchNext;
        return Ok(());
    }

    match node.rec_type {
        UndoRecType::UpdExist => upd_exist_sec(node, env)?,
        UndoRecType::DelMark => del_mark_sec(node, env)?,
        UndoRecType::UpdDel => upd_del_sec(node, env)?,
        UndoRecType::Insert => unreachable!("insert undo is dispatched separately"),
    }

    undo_mod_clust(node, env)
}
