//! End-to-end rollback scenarios over a two-index table.

use crate::btree::test_util::FailSpace;
use crate::btree::{BtreeSys, FileSpace, HeapFileSpace, LatchMode, Tree};
use crate::buffer::BufPool;
use crate::config::EngineConfig;
use crate::dict::{MemDict, Table, create_table};
use crate::error::Result;
use crate::lock::NoopLockSys;
use crate::mtr::LogSys;
use crate::page;
use crate::rec::{self, Offsets};
use crate::row::ops::{delete_mark_row, insert_row, update_row};
use crate::row::{build_index_entry, row_roll_ptr, row_trx_id};
use crate::trx::undo::{UndoEnv, UndoNode, UndoState, ins, rollback};
use crate::trx::TrxSys;
use crate::value::{Field, Tuple};
use rookdb_catalog::{
    ColType, Collation, ColumnSpec, IndexAttributes, IndexKey, IndexSpec, TableSpec,
};
use std::sync::Arc;

struct Fixture {
    table: Arc<Table>,
    trx_sys: Arc<TrxSys>,
    env: UndoEnv,
}

fn fixture() -> Fixture {
    fixture_with_space(HeapFileSpace::new())
}

fn fixture_with_space(space: Arc<dyn FileSpace>) -> Fixture {
    let log_sys = LogSys::new();
    let sys = BtreeSys::new(
        BufPool::new(),
        space,
        NoopLockSys::new(),
        Arc::clone(&log_sys),
    );
    let spec = TableSpec::new(
        "t",
        vec![
            ColumnSpec::new("k", ColType::Var(16)),
            ColumnSpec::new("c", ColType::Var(16)).with_collation(Collation::AsciiCi),
        ],
        vec![
            IndexSpec::new("pk", vec![IndexKey::new(0)], IndexAttributes::PK),
            IndexSpec::new("idx_c", vec![IndexKey::new(1)], IndexAttributes::empty()),
        ],
    );
    let table = create_table(10, &spec, &sys).unwrap();
    let dict = MemDict::new();
    dict.register(Arc::clone(&table));
    let trx_sys = TrxSys::new();
    let env = UndoEnv {
        dict,
        trx_sys: Arc::clone(&trx_sys),
        cfg: EngineConfig::default()
            .retry_delete_n_times(10)
            .retry_sleep_ms(1),
        log_sys,
    };
    Fixture {
        table,
        trx_sys,
        env,
    }
}

fn key(k: &str) -> Tuple {
    Tuple::new(vec![Field::from_bytes(k.as_bytes())])
}

fn vals(k: &str, c: &str) -> Vec<Field> {
    vec![Field::from_bytes(k.as_bytes()), Field::from_bytes(c.as_bytes())]
}

/// Clustered lookup: the full record tuple and its delete mark.
fn clust_find(table: &Arc<Table>, k: &str) -> Option<(Tuple, bool)> {
    let clust = table.clust();
    let mut mtr = clust.sys.mtr();
    let (cursor, exact) = clust.search_to_leaf(&key(k), LatchMode::SearchLeaf, &mut mtr);
    let res = exact.then(|| {
        let offsets = Offsets::compute(cursor.block.frame(), cursor.rec);
        (
            offsets.to_tuple(cursor.block.frame()),
            rec::is_delete_marked(cursor.block.frame(), cursor.rec),
        )
    });
    mtr.commit();
    res
}

/// Binary-exact secondary lookup: the delete mark of the entry.
fn sec_find(sec: &Arc<Tree>, entry: &Tuple) -> Option<bool> {
    let mut mtr = sec.sys.mtr();
    let (cursor, exact) = sec.search_to_leaf(entry, LatchMode::SearchLeaf, &mut mtr);
    let res = exact.then(|| rec::is_delete_marked(cursor.block.frame(), cursor.rec));
    mtr.commit();
    res
}

fn sec_entry(table: &Arc<Table>, k: &str, c: &str) -> Tuple {
    let clust_index = &table.clust().index;
    let sec = table.sec().next().unwrap();
    let row = Tuple::new(vec![
        Field::from_bytes(k.as_bytes()),
        crate::row::sys_field(0),
        crate::row::sys_field(0),
        Field::from_bytes(c.as_bytes()),
    ]);
    build_index_entry(&row, clust_index, &sec.index).unwrap()
}

fn clust_n_recs(table: &Arc<Table>) -> usize {
    let clust = table.clust();
    let mut mtr = clust.sys.mtr();
    mtr.s_latch(&clust.root);
    let n = page::n_recs(clust.root.frame());
    mtr.commit();
    n
}

fn validate_all(table: &Arc<Table>) {
    for tree in &table.indexes {
        let mut mtr = tree.sys.mtr();
        mtr.s_latch(&tree.root);
        assert!(page::validate(tree.root.frame(), &tree.index));
        mtr.commit();
    }
}

#[test]
fn test_fresh_insert_undo() {
    let fx = fixture();
    let trx = fx.trx_sys.begin();

    insert_row(&fx.table, &vals("K", "sec"), &trx).unwrap();
    assert!(clust_find(&fx.table, "K").is_some());
    let sec = fx.table.sec().next().unwrap();
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "sec")), Some(false));
    assert_eq!(clust_n_recs(&fx.table), 1);

    rollback(&trx, &fx.env).unwrap();

    assert!(clust_find(&fx.table, "K").is_none());
    assert!(sec_find(sec, &sec_entry(&fx.table, "K", "sec")).is_none());
    assert_eq!(clust_n_recs(&fx.table), 0);
    validate_all(&fx.table);
}

#[test]
fn test_fresh_insert_undo_is_idempotent() {
    let fx = fixture();
    let trx = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "v"), &trx).unwrap();
    let roll_ptr = trx.last_roll_ptr();

    rollback(&trx, &fx.env).unwrap();
    assert!(clust_find(&fx.table, "K").is_none());

    // running the same undo record again is a no-op
    let undo_rec = fx.env.trx_sys.undo_rec(roll_ptr).unwrap();
    let mut node = UndoNode::new(Arc::clone(&trx), undo_rec, 0, roll_ptr, UndoState::Insert);
    ins::row_undo_ins(&mut node, &fx.env).unwrap();
    assert_eq!(node.state, UndoState::FetchNext);
    if let Some(table) = node.table.take() {
        fx.env.dict.decrement_handle_count(&table);
    }
    assert!(clust_find(&fx.table, "K").is_none());
    validate_all(&fx.table);
}

#[test]
fn test_update_undo_restores_order_bearing_column() {
    let fx = fixture();
    let sec = fx.table.sec().next().unwrap();

    let trx1 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "abc"), &trx1).unwrap();
    let (row_before, _) = clust_find(&fx.table, "K").unwrap();
    let clust_index = &fx.table.clust().index;
    let trx_id_before = row_trx_id(&row_before, clust_index);
    let roll_ptr_before = row_roll_ptr(&row_before, clust_index);

    let trx2 = fx.trx_sys.begin();
    update_row(
        &fx.table,
        &key("K"),
        &[(1, Field::from_bytes(b"aBc"))],
        &trx2,
    )
    .unwrap();
    // the old entry is delete-marked, the new one live
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "abc")), Some(true));
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "aBc")), Some(false));

    rollback(&trx2, &fx.env).unwrap();

    // the old bytes are live again; the case-flipped version is dead
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "abc")), Some(false));
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "aBc")), Some(true));

    // the clustered record is byte-identical to the pre-update version,
    // system columns included
    let (row_after, marked) = clust_find(&fx.table, "K").unwrap();
    assert!(!marked);
    assert_eq!(row_after, row_before);
    assert_eq!(row_trx_id(&row_after, clust_index), trx_id_before);
    assert_eq!(row_roll_ptr(&row_after, clust_index), roll_ptr_before);
    validate_all(&fx.table);
}

#[test]
fn test_delete_mark_undo() {
    let fx = fixture();
    let sec = fx.table.sec().next().unwrap();

    let trx1 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "v"), &trx1).unwrap();
    let (row_before, _) = clust_find(&fx.table, "K").unwrap();

    let trx2 = fx.trx_sys.begin();
    delete_mark_row(&fx.table, &key("K"), &trx2).unwrap();
    assert_eq!(clust_find(&fx.table, "K").map(|(_, m)| m), Some(true));
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "v")), Some(true));

    rollback(&trx2, &fx.env).unwrap();

    let (row_after, marked) = clust_find(&fx.table, "K").unwrap();
    assert!(!marked);
    assert_eq!(row_after, row_before);
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "v")), Some(false));
    validate_all(&fx.table);
}

#[test]
fn test_upd_del_undo_removes_reinserted_record() {
    let fx = fixture();
    let sec = fx.table.sec().next().unwrap();

    let trx1 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "v1"), &trx1).unwrap();
    let trx2 = fx.trx_sys.begin();
    delete_mark_row(&fx.table, &key("K"), &trx2).unwrap();

    // reuse the delete-marked record
    let trx3 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "v2"), &trx3).unwrap();
    assert_eq!(clust_find(&fx.table, "K").map(|(_, m)| m), Some(false));
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "v2")), Some(false));

    rollback(&trx3, &fx.env).unwrap();

    // no reader needs the delete-marked version, so the rollback also
    // removes the record physically
    assert!(clust_find(&fx.table, "K").is_none());
    assert!(sec_find(sec, &sec_entry(&fx.table, "K", "v2")).is_none());
    // the old marked entry stays for purge
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "v1")), Some(true));
    validate_all(&fx.table);
}

#[test]
fn test_upd_del_undo_preserves_for_old_readers() {
    let fx = fixture();

    let trx1 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "v1"), &trx1).unwrap();
    let trx2 = fx.trx_sys.begin();
    delete_mark_row(&fx.table, &key("K"), &trx2).unwrap();
    let trx3 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "v2"), &trx3).unwrap();

    // a reader view opened before the delete still needs the version
    fx.trx_sys.set_oldest_view_ts(0);
    rollback(&trx3, &fx.env).unwrap();

    let (row, marked) = clust_find(&fx.table, "K").unwrap();
    assert!(marked);
    assert_eq!(row.fields[3], Field::from_bytes(b"v1"));
    validate_all(&fx.table);
}

#[test]
fn test_rollback_chains_prev_version_of_same_row() {
    let fx = fixture();

    let trx1 = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("K", "a"), &trx1).unwrap();
    let (row_orig, _) = clust_find(&fx.table, "K").unwrap();

    let trx2 = fx.trx_sys.begin();
    update_row(&fx.table, &key("K"), &[(1, Field::from_bytes(b"b"))], &trx2).unwrap();
    update_row(&fx.table, &key("K"), &[(1, Field::from_bytes(b"c"))], &trx2).unwrap();

    rollback(&trx2, &fx.env).unwrap();

    let (row_after, marked) = clust_find(&fx.table, "K").unwrap();
    assert!(!marked);
    assert_eq!(row_after, row_orig);
    let sec = fx.table.sec().next().unwrap();
    assert_eq!(sec_find(sec, &sec_entry(&fx.table, "K", "a")), Some(false));
    validate_all(&fx.table);
}

#[test]
fn test_pessimistic_retry_under_space_pressure() -> Result<()> {
    let space = FailSpace::new(2);
    let fx = fixture_with_space(Arc::clone(&space) as Arc<dyn FileSpace>);
    let trx = fx.trx_sys.begin();

    // an externally stored column forces the pessimistic delete path
    insert_row(
        &fx.table,
        &vec![Field::from_bytes(b"K"), Field::Extern(b"prefix".to_vec())],
        &trx,
    )?;

    rollback(&trx, &fx.env)?;

    // two reservations failed and slept, the third succeeded
    assert_eq!(space.attempts(), 3);
    assert!(clust_find(&fx.table, "K").is_none());
    validate_all(&fx.table);
    Ok(())
}

#[test]
fn test_rollback_of_dropped_table_is_satisfied() {
    let fx = fixture();
    let trx = fx.trx_sys.begin();
    // an undo record naming an unknown table id
    let undo_rec = super::encode_insert_rec(0, 9999, &key("K"));
    trx.append_undo_rec(undo_rec, true);
    rollback(&trx, &fx.env).unwrap();
}

#[test]
fn test_sys_indexes_rollback_drops_index_tree() {
    use crate::dict::DICT_INDEXES_ID;

    let log_sys = LogSys::new();
    let sys = BtreeSys::new(
        BufPool::new(),
        HeapFileSpace::new(),
        NoopLockSys::new(),
        Arc::clone(&log_sys),
    );
    // a dictionary table describing indexes: (index_id, root_page_no)
    let spec = TableSpec::new(
        "SYS_INDEXES",
        vec![
            ColumnSpec::new("index_id", ColType::Var(8)),
            ColumnSpec::new("page_no", ColType::Fixed(4)),
        ],
        vec![IndexSpec::new(
            "pk",
            vec![IndexKey::new(0)],
            IndexAttributes::PK,
        )],
    );
    let table = create_table(DICT_INDEXES_ID, &spec, &sys).unwrap();
    // root page number lives in record field 3: key, trx id, roll ptr,
    // then the column
    let dict = MemDict::with_sys_index_root_field(3);
    dict.register(Arc::clone(&table));
    let trx_sys = TrxSys::new();
    let env = UndoEnv {
        dict: Arc::clone(&dict) as Arc<dyn crate::dict::DictSys>,
        trx_sys: Arc::clone(&trx_sys),
        cfg: EngineConfig::default(),
        log_sys,
    };

    let trx = trx_sys.begin();
    trx.set_dict_operation_x_latch(true);
    insert_row(
        &table,
        &[Field::from_bytes(b"idx-7"), Field::Data(vec![0, 0, 0, 9])],
        &trx,
    )
    .unwrap();

    rollback(&trx, &env).unwrap();

    assert_eq!(dict.drop_tree_calls(), 1);
    assert!(clust_find(&table, "idx-7").is_none());
    validate_all(&table);
}

#[test]
fn test_partial_rollback_to_savepoint() {
    let fx = fixture();
    let trx = fx.trx_sys.begin();
    insert_row(&fx.table, &vals("A", "1"), &trx).unwrap();
    let savepoint = trx.next_undo_no();
    insert_row(&fx.table, &vals("B", "2"), &trx).unwrap();
    insert_row(&fx.table, &vals("C", "3"), &trx).unwrap();

    super::rollback_to(&trx, savepoint, &fx.env).unwrap();

    assert!(clust_find(&fx.table, "A").is_some());
    assert!(clust_find(&fx.table, "B").is_none());
    assert!(clust_find(&fx.table, "C").is_none());
    validate_all(&fx.table);
}
