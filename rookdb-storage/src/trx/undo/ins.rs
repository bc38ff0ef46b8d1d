//! Fresh insert undo.
//!
//! Undoes a fresh insert of a row. A fresh insert means the clustered
//! unique key had no record, even delete-marked, at insert time. The
//! rollback is eager: if a record would be removed in purge anyway, it
//! is removed here.

use crate::btree::{LatchMode, Pcur, Tree, row_search_index_entry};
use crate::dict::DICT_INDEXES_ID;
use crate::error::{Error, Result};
use crate::row::build_index_entry;
use crate::trx::undo::{
    UndoEnv, UndoNode, UndoRecType, UndoState, parse_hdr, parse_row_ref,
    undo_search_clust_to_pcur,
};
use crate::value::{Tuple, Update};
use std::sync::Arc;

/// Removes the clustered index record the node's cursor was positioned
/// on. The cursor is detached afterwards.
fn remove_clust_rec(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    let table = Arc::clone(node.table.as_ref().expect("table resolved"));
    let clust = Arc::clone(table.clust());
    let mut pcur = node.pcur.take().expect("cursor positioned on the record");
    let mut mtr = clust.sys.mtr();

    let success = pcur.restore_position(LatchMode::ModifyLeaf, &mut mtr);
    assert!(success);

    if table.id == DICT_INDEXES_ID {
        debug_assert!(node.trx.holds_dict_operation_x_latch());

        // drop the index tree described by this SYS_INDEXES row before
        // deleting the row itself
        let block = pcur.block();
        env.dict.drop_index_tree(&block, pcur.rec(), &mut mtr);

        pcur.commit_specify_mtr(&mut mtr);
        mtr.restart();
        let success = pcur.restore_position(LatchMode::ModifyLeaf, &mut mtr);
        assert!(success);
    }

    let success = clust.optimistic_delete(pcur.cursor(), &mut mtr);
    pcur.commit_specify_mtr(&mut mtr);

    if success {
        node.trx.undo_rec_release(node.undo_no);
        return Ok(());
    }

    // pessimistic descent, retried under file space pressure
    let mut n_tries = 0usize;
    let result = loop {
        mtr.restart();
        let success = pcur.restore_position(LatchMode::ModifyTree, &mut mtr);
        assert!(success);

        match clust.pessimistic_delete(pcur.cursor(), &mut mtr) {
            Err(Error::OutOfFileSpace) if n_tries < env.cfg.retry_delete_n_times => {
                pcur.commit_specify_mtr(&mut mtr);
                n_tries += 1;
                std::thread::sleep(env.cfg.retry_sleep());
            }
            res => {
                pcur.commit_specify_mtr(&mut mtr);
                break res;
            }
        }
    };

    node.trx.undo_rec_release(node.undo_no);
    result
}

/// Removes a secondary index entry if found, with the given descent.
fn remove_sec_low(tree: &Arc<Tree>, entry: &Tuple, mode: LatchMode, env: &UndoEnv) -> Result<()> {
    env.log_sys.free_check();
    let mut mtr = tree.sys.mtr();
    let mut pcur = Pcur::new(Arc::clone(tree));

    let found = row_search_index_entry(tree, entry, mode, &mut pcur, &mut mtr);
    if !found {
        // already undone or never installed
        pcur.close();
        mtr.commit();
        return Ok(());
    }

    let res = match mode {
        LatchMode::ModifyLeaf => {
            if tree.optimistic_delete(pcur.cursor(), &mut mtr) {
                Ok(())
            } else {
                Err(Error::Fail)
            }
        }
        LatchMode::ModifyTree => tree.pessimistic_delete(pcur.cursor(), &mut mtr),
        LatchMode::SearchLeaf => unreachable!("removal needs a modify latch"),
    };

    pcur.close();
    mtr.commit();
    res
}

/// Removes a secondary index entry: first an optimistic descent, then
/// pessimistic descents with a bounded number of retries under file
/// space pressure.
fn remove_sec(tree: &Arc<Tree>, entry: &Tuple, env: &UndoEnv) -> Result<()> {
    if remove_sec_low(tree, entry, LatchMode::ModifyLeaf, env).is_ok() {
        return Ok(());
    }

    let mut n_tries = 0usize;
    loop {
        match remove_sec_low(tree, entry, LatchMode::ModifyTree, env) {
            Ok(()) => return Ok(()),
            Err(Error::OutOfFileSpace) if n_tries < env.cfg.retry_delete_n_times => {
                n_tries += 1;
                std::thread::sleep(env.cfg.retry_sleep());
            }
            Err(err) => return Err(err),
        }
    }
}

/// Parses the row reference in a fresh insert undo record and resolves
/// the table. A missing table or backing file leaves `node.table` unset
/// and the undo record counts as satisfied.
fn parse_undo_rec(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    let hdr = parse_hdr(&node.undo_rec)?;
    debug_assert_eq!(hdr.rec_type, UndoRecType::Insert);
    node.rec_type = hdr.rec_type;
    node.update = Update::default();

    let Some(table) = env.dict.table_on_id(env.cfg.force_recovery, hdr.table_id) else {
        return Ok(());
    };
    if table.ibd_file_missing {
        env.dict.decrement_handle_count(&table);
        return Ok(());
    }
    if table.indexes.is_empty() {
        tracing::warn!(table = %table.name, "table has no indexes, ignoring the table");
        env.dict.decrement_handle_count(&table);
        return Ok(());
    }

    node.table = Some(table);
    let undo_rec = Arc::clone(&node.undo_rec);
    let (ref_key, _) = parse_row_ref(&undo_rec, hdr.pos)?;
    node.ref_key = ref_key;
    Ok(())
}

/// Undoes a fresh insert: removes the secondary index entries built
/// from the row, then the clustered record itself.
pub fn row_undo_ins(node: &mut UndoNode, env: &UndoEnv) -> Result<()> {
    debug_assert_eq!(node.state, UndoState::Insert);

    parse_undo_rec(node, env)?;

    if node.table.is_none() || !undo_search_clust_to_pcur(node) {
        node.trx.undo_rec_release(node.undo_no);
        node.state = UndoState::FetchNext;
        return Ok(());
    }

    let table = Arc::clone(node.table.as_ref().expect("table resolved"));
    let clust_index = Arc::clone(&table.clust().index);
    let row = node.row.clone().expect("row captured by clustered search");

    for sec in table.sec() {
        match build_index_entry(&row, &clust_index, &sec.index) {
            None => {
                // the crash happened after the clustered record was
                // written but before its externally stored columns;
                // the secondary entry cannot exist yet
                assert!(node.trx.is_recv());
            }
            Some(entry) => remove_sec(sec, &entry, env)?,
        }
    }

    let res = remove_clust_rec(node, env);
    node.state = UndoState::FetchNext;
    res
}
