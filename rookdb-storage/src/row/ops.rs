//! Forward row operations: clustered insert, delete-mark and update
//! with secondary index maintenance, each leaving behind the undo
//! record that reverses it.

use crate::btree::{Cursor, LatchMode, Tree};
use crate::dict::{Index, SYS_FIELD_ROLL_PTR, SYS_FIELD_TRX_ID, Table};
use crate::error::{Error, Result};
use crate::mtr::Mtr;
use crate::rec::{self, Offsets};
use crate::row::{apply_update, build_index_entry, build_row_ref, row_roll_ptr, row_trx_id, sys_field};
use crate::trx::Trx;
use crate::trx::undo::{UndoRecType, encode_insert_rec, encode_modify_rec};
use crate::value::{CmplInfo, Field, Tuple, UpdField, Update};
use std::sync::Arc;

fn clust_tuple_from_vals(clust: &Index, vals: &[Field], trx_id: u64, roll_ptr: u64) -> Tuple {
    Tuple::new(
        clust
            .fields
            .iter()
            .map(|f| match f.col_no {
                SYS_FIELD_TRX_ID => sys_field(trx_id),
                SYS_FIELD_ROLL_PTR => sys_field(roll_ptr),
                col => vals[col as usize].clone(),
            })
            .collect(),
    )
}

fn ref_from_vals(clust: &Index, vals: &[Field]) -> Tuple {
    Tuple::new(
        clust.fields[..clust.n_key]
            .iter()
            .map(|f| vals[f.col_no as usize].clone())
            .collect(),
    )
}

fn apply_update_on_clust(
    clust: &Tree,
    cursor: &mut Cursor,
    update: &Update,
    mtr: &mut Mtr,
) -> Result<()> {
    match clust.optimistic_update(cursor, update, mtr) {
        Ok(()) => Ok(()),
        Err(Error::Overflow) | Err(Error::Underflow) => {
            clust.pessimistic_update(cursor, update, mtr)
        }
        Err(err) => Err(err),
    }
}

/// Install a secondary index entry. A byte-identical delete-marked
/// leftover is revived by clearing its mark instead of inserting a
/// duplicate.
fn sec_insert_entry(sec: &Arc<Tree>, entry: &Tuple, mtr: &mut Mtr) -> Result<()> {
    let (cursor, exact) = sec.search_to_leaf(entry, LatchMode::ModifyLeaf, mtr);
    if exact {
        debug_assert!(rec::is_delete_marked(cursor.block.frame(), cursor.rec));
        sec.del_mark_set_sec_rec(&cursor, false, mtr);
        return Ok(());
    }
    sec.insert(entry, 0, mtr).map(|_| ())
}

/// Insert a row. A delete-marked record with the same clustered key is
/// reused by unmarking and updating it, logged as an `UpdDel` undo
/// record; a fresh insert logs an insert undo record.
pub fn insert_row(table: &Arc<Table>, vals: &[Field], trx: &Arc<Trx>) -> Result<()> {
    debug_assert_eq!(vals.len(), table.col_count());
    let clust = table.clust();
    let clust_index = &clust.index;
    let mut mtr = clust.sys.mtr();

    let ref_tuple = ref_from_vals(clust_index, vals);
    let (cursor, exact) = clust.search_to_leaf(&ref_tuple, LatchMode::ModifyLeaf, &mut mtr);
    if exact {
        if !rec::is_delete_marked(cursor.block.frame(), cursor.rec) {
            mtr.commit();
            return Err(Error::DuplicateKey);
        }
        return insert_by_unmark(table, cursor, vals, trx, mtr);
    }

    let undo_no = trx.next_undo_no();
    let undo_rec = encode_insert_rec(undo_no, table.id, &ref_tuple);
    let (_, roll_ptr) = trx.append_undo_rec(undo_rec, true);

    let row = clust_tuple_from_vals(clust_index, vals, trx.id, roll_ptr);
    clust.insert(&row, 0, &mut mtr)?;

    for sec in table.sec() {
        let entry =
            build_index_entry(&row, clust_index, &sec.index).expect("fresh rows are fully stored");
        sec_insert_entry(sec, &entry, &mut mtr)?;
    }

    mtr.commit();
    Ok(())
}

/// Insert over a delete-marked record: unmark it, update its fields and
/// chain an `UpdDel` undo record.
fn insert_by_unmark(
    table: &Arc<Table>,
    mut cursor: Cursor,
    vals: &[Field],
    trx: &Arc<Trx>,
    mut mtr: Mtr,
) -> Result<()> {
    let clust = table.clust();
    let clust_index = &clust.index;
    let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
    let old_row = offsets.to_tuple(cursor.block.frame());
    let old_info = rec::info_bits(cursor.block.frame(), cursor.rec);
    let old_trx_id = row_trx_id(&old_row, clust_index);
    let old_roll_ptr = row_roll_ptr(&old_row, clust_index);

    let mut undo_fields = vec![];
    let mut new_fields = vec![];
    for (pos, f) in clust_index.fields.iter().enumerate() {
        match f.col_no {
            SYS_FIELD_TRX_ID | SYS_FIELD_ROLL_PTR => {}
            col => {
                let new_val = &vals[col as usize];
                if *new_val != old_row.fields[pos] {
                    debug_assert!(pos >= clust_index.n_key, "the clustered key matched");
                    undo_fields.push(UpdField {
                        field_no: pos as u16,
                        new_val: old_row.fields[pos].clone(),
                    });
                    new_fields.push(UpdField {
                        field_no: pos as u16,
                        new_val: new_val.clone(),
                    });
                }
            }
        }
    }

    let undo_no = trx.next_undo_no();
    let ref_tuple = build_row_ref(&old_row, clust_index);
    let undo_rec = encode_modify_rec(
        UndoRecType::UpdDel,
        CmplInfo::empty(),
        undo_no,
        table.id,
        old_info,
        old_trx_id,
        old_roll_ptr,
        &ref_tuple,
        &undo_fields,
    );
    let (_, roll_ptr) = trx.append_undo_rec(undo_rec, false);

    new_fields.push(UpdField {
        field_no: clust_index.trx_id_pos() as u16,
        new_val: sys_field(trx.id),
    });
    new_fields.push(UpdField {
        field_no: clust_index.roll_ptr_pos() as u16,
        new_val: sys_field(roll_ptr),
    });
    let update = Update {
        fields: new_fields,
        info_bits: 0,
    };
    apply_update_on_clust(clust, &mut cursor, &update, &mut mtr)?;

    let mut new_row = old_row;
    apply_update(&mut new_row, &update);
    for sec in table.sec() {
        let entry = build_index_entry(&new_row, clust_index, &sec.index)
            .expect("fresh rows are fully stored");
        sec_insert_entry(sec, &entry, &mut mtr)?;
    }

    mtr.commit();
    Ok(())
}

/// Delete a row by delete-marking its clustered record and every
/// secondary entry, keeping the data for readers of older versions.
pub fn delete_mark_row(table: &Arc<Table>, key: &Tuple, trx: &Arc<Trx>) -> Result<()> {
    let clust = table.clust();
    let clust_index = &clust.index;
    let mut mtr = clust.sys.mtr();

    let (mut cursor, exact) = clust.search_to_leaf(key, LatchMode::ModifyLeaf, &mut mtr);
    if !exact || rec::is_delete_marked(cursor.block.frame(), cursor.rec) {
        mtr.commit();
        return Err(Error::RowNotFound);
    }

    let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
    let old_row = offsets.to_tuple(cursor.block.frame());
    let old_info = rec::info_bits(cursor.block.frame(), cursor.rec);
    let old_trx_id = row_trx_id(&old_row, clust_index);
    let old_roll_ptr = row_roll_ptr(&old_row, clust_index);

    let undo_no = trx.next_undo_no();
    let undo_rec = encode_modify_rec(
        UndoRecType::DelMark,
        CmplInfo::NO_ORD_CHANGE | CmplInfo::NO_SIZE_CHANGE,
        undo_no,
        table.id,
        old_info,
        old_trx_id,
        old_roll_ptr,
        &build_row_ref(&old_row, clust_index),
        &[],
    );
    let (_, roll_ptr) = trx.append_undo_rec(undo_rec, false);

    clust.del_mark_set_clust_rec(&cursor, true, &mut mtr);
    let update = Update {
        fields: vec![
            UpdField {
                field_no: clust_index.trx_id_pos() as u16,
                new_val: sys_field(trx.id),
            },
            UpdField {
                field_no: clust_index.roll_ptr_pos() as u16,
                new_val: sys_field(roll_ptr),
            },
        ],
        info_bits: rec::REC_INFO_DELETED,
    };
    apply_update_on_clust(clust, &mut cursor, &update, &mut mtr)?;

    for sec in table.sec() {
        let entry = build_index_entry(&old_row, clust_index, &sec.index)
            .expect("stored rows are fully stored");
        let (sec_cursor, sec_exact) = sec.search_to_leaf(&entry, LatchMode::ModifyLeaf, &mut mtr);
        debug_assert!(sec_exact);
        if sec_exact {
            sec.del_mark_set_sec_rec(&sec_cursor, true, &mut mtr);
        }
    }

    mtr.commit();
    Ok(())
}

/// Update non-key columns of a row. Secondary indexes whose columns are
/// touched get the old entry delete-marked and the new one installed.
pub fn update_row(
    table: &Arc<Table>,
    key: &Tuple,
    updates: &[(u16, Field)],
    trx: &Arc<Trx>,
) -> Result<()> {
    let clust = table.clust();
    let clust_index = &clust.index;
    let mut mtr = clust.sys.mtr();

    let (mut cursor, exact) = clust.search_to_leaf(key, LatchMode::ModifyLeaf, &mut mtr);
    if !exact || rec::is_delete_marked(cursor.block.frame(), cursor.rec) {
        mtr.commit();
        return Err(Error::RowNotFound);
    }

    let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
    let old_row = offsets.to_tuple(cursor.block.frame());
    let old_info = rec::info_bits(cursor.block.frame(), cursor.rec);
    let old_trx_id = row_trx_id(&old_row, clust_index);
    let old_roll_ptr = row_roll_ptr(&old_row, clust_index);

    let mut undo_fields = vec![];
    let mut new_fields = vec![];
    let mut changed_cols = vec![];
    for (col_no, new_val) in updates {
        let pos = clust_index
            .field_no_of_col(*col_no)
            .ok_or(Error::InvalidArgument)?;
        if pos < clust_index.n_key {
            return Err(Error::NotSupported("ordering key update"));
        }
        if old_row.fields[pos] == *new_val {
            continue;
        }
        undo_fields.push(UpdField {
            field_no: pos as u16,
            new_val: old_row.fields[pos].clone(),
        });
        new_fields.push(UpdField {
            field_no: pos as u16,
            new_val: new_val.clone(),
        });
        changed_cols.push(*col_no);
    }
    if new_fields.is_empty() {
        mtr.commit();
        return Ok(());
    }

    let mut cmpl_info = CmplInfo::empty();
    let ord_changed = table.sec().any(|sec| {
        sec.index
            .fields
            .iter()
            .any(|f| changed_cols.contains(&f.col_no))
    });
    if !ord_changed {
        cmpl_info |= CmplInfo::NO_ORD_CHANGE;
    }
    if undo_fields
        .iter()
        .zip(&new_fields)
        .all(|(old, new)| old.new_val.local_bytes().len() == new.new_val.local_bytes().len())
    {
        cmpl_info |= CmplInfo::NO_SIZE_CHANGE;
    }

    let undo_no = trx.next_undo_no();
    let undo_rec = encode_modify_rec(
        UndoRecType::UpdExist,
        cmpl_info,
        undo_no,
        table.id,
        old_info,
        old_trx_id,
        old_roll_ptr,
        &build_row_ref(&old_row, clust_index),
        &undo_fields,
    );
    let (_, roll_ptr) = trx.append_undo_rec(undo_rec, false);

    new_fields.push(UpdField {
        field_no: clust_index.trx_id_pos() as u16,
        new_val: sys_field(trx.id),
    });
    new_fields.push(UpdField {
        field_no: clust_index.roll_ptr_pos() as u16,
        new_val: sys_field(roll_ptr),
    });
    let update = Update {
        fields: new_fields,
        info_bits: 0,
    };
    apply_update_on_clust(clust, &mut cursor, &update, &mut mtr)?;

    let mut new_row = old_row.clone();
    apply_update(&mut new_row, &update);
    for sec in table.sec() {
        if !sec
            .index
            .fields
            .iter()
            .any(|f| changed_cols.contains(&f.col_no))
        {
            continue;
        }
        let old_entry = build_index_entry(&old_row, clust_index, &sec.index)
            .expect("stored rows are fully stored");
        let (sec_cursor, sec_exact) =
            sec.search_to_leaf(&old_entry, LatchMode::ModifyLeaf, &mut mtr);
        debug_assert!(sec_exact);
        if sec_exact {
            sec.del_mark_set_sec_rec(&sec_cursor, true, &mut mtr);
        }
        let new_entry = build_index_entry(&new_row, clust_index, &sec.index)
            .expect("stored rows are fully stored");
        sec_insert_entry(sec, &new_entry, &mut mtr)?;
    }

    mtr.commit();
    Ok(())
}
