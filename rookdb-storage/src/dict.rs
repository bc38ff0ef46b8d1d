//! Dictionary runtime objects.
//!
//! The full data dictionary (persistence, DDL) is an external
//! collaborator; the core needs table and index metadata, a cache lookup
//! by table id and the SYS_INDEXES drop-tree hook.

use crate::btree::{BtreeSys, Tree};
use crate::buffer::BufBlock;
use crate::config::ForceRecovery;
use crate::error::Result;
use crate::mtr::Mtr;
use crate::page;
use parking_lot::Mutex;
use rookdb_catalog::{ColType, Collation, IndexAttributes, IndexID, TableID, TableSpec};
use semistr::SemiStr;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Table id of the dictionary's own index table. Rolling back a row of
/// it drops the index tree the row described.
pub const DICT_INDEXES_ID: TableID = 3;

/// Indexes whose name starts with this prefix are still being built and
/// are skipped by undo.
pub const TEMP_INDEX_PREFIX: char = '\u{ff}';

// column markers for the system fields of a clustered record
pub const SYS_FIELD_TRX_ID: u16 = u16::MAX;
pub const SYS_FIELD_ROLL_PTR: u16 = u16::MAX - 1;

/// One field of an index record, in record order.
#[derive(Debug, Clone, Copy)]
pub struct IndexField {
    pub col_no: u16,
    pub collation: Collation,
}

pub struct Index {
    pub id: IndexID,
    pub table_id: TableID,
    pub name: SemiStr,
    pub attributes: IndexAttributes,
    // full record layout
    pub fields: Vec<IndexField>,
    // number of fields that decide the ordering
    pub n_key: usize,
}

impl Index {
    #[inline]
    pub fn is_clustered(&self) -> bool {
        self.attributes.contains(IndexAttributes::PK)
    }

    #[inline]
    pub fn is_temp(&self) -> bool {
        self.name.starts_with(TEMP_INDEX_PREFIX)
    }

    #[inline]
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// Per-field collations in record order.
    #[inline]
    pub fn collations(&self) -> Vec<Collation> {
        self.fields.iter().map(|f| f.collation).collect()
    }

    /// Position of the transaction id field of a clustered record.
    #[inline]
    pub fn trx_id_pos(&self) -> usize {
        debug_assert!(self.is_clustered());
        self.n_key
    }

    #[inline]
    pub fn roll_ptr_pos(&self) -> usize {
        debug_assert!(self.is_clustered());
        self.n_key + 1
    }

    /// Record field that stores table column `col_no`, if any.
    #[inline]
    pub fn field_no_of_col(&self, col_no: u16) -> Option<usize> {
        self.fields.iter().position(|f| f.col_no == col_no)
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: SemiStr,
    pub ty: ColType,
    pub collation: Collation,
}

pub struct Table {
    pub id: TableID,
    pub name: SemiStr,
    pub cols: Vec<Column>,
    // the backing file disappeared; undo against it is skipped
    pub ibd_file_missing: bool,
    pub indexes: Vec<Arc<Tree>>,
    handle_count: AtomicU32,
}

impl Table {
    /// The clustered index tree. Always the first index.
    #[inline]
    pub fn clust(&self) -> &Arc<Tree> {
        &self.indexes[0]
    }

    /// Secondary index trees in table order.
    #[inline]
    pub fn sec(&self) -> impl Iterator<Item = &Arc<Tree>> {
        self.indexes.iter().filter(|t| !t.index.is_clustered())
    }

    #[inline]
    pub fn col_count(&self) -> usize {
        self.cols.len()
    }

    #[inline]
    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::Relaxed)
    }
}

fn clustered_layout(spec: &TableSpec) -> (Vec<IndexField>, usize) {
    let pk = &spec.indexes[0];
    let mut fields: Vec<IndexField> = pk
        .index_cols
        .iter()
        .map(|k| IndexField {
            col_no: k.col_no,
            collation: spec.columns[k.col_no as usize].column_collation,
        })
        .collect();
    let n_key = fields.len();
    fields.push(IndexField {
        col_no: SYS_FIELD_TRX_ID,
        collation: Collation::Binary,
    });
    fields.push(IndexField {
        col_no: SYS_FIELD_ROLL_PTR,
        collation: Collation::Binary,
    });
    for (col_no, col) in spec.columns.iter().enumerate() {
        let col_no = col_no as u16;
        if pk.index_cols.iter().any(|k| k.col_no == col_no) {
            continue;
        }
        fields.push(IndexField {
            col_no,
            collation: col.column_collation,
        });
    }
    (fields, n_key)
}

fn secondary_layout(spec: &TableSpec, sec_no: usize) -> (Vec<IndexField>, usize) {
    let sec = &spec.indexes[sec_no];
    let pk = &spec.indexes[0];
    let mut fields: Vec<IndexField> = sec
        .index_cols
        .iter()
        .map(|k| IndexField {
            col_no: k.col_no,
            collation: spec.columns[k.col_no as usize].column_collation,
        })
        .collect();
    for k in &pk.index_cols {
        if sec.index_cols.iter().any(|s| s.col_no == k.col_no) {
            continue;
        }
        fields.push(IndexField {
            col_no: k.col_no,
            collation: spec.columns[k.col_no as usize].column_collation,
        });
    }
    let n_key = fields.len();
    (fields, n_key)
}

/// Materialize a table: build the index layouts and create one tree per
/// index.
pub fn create_table(id: TableID, spec: &TableSpec, sys: &Arc<BtreeSys>) -> Result<Arc<Table>> {
    debug_assert!(spec.indexes[0].is_clustered());
    let mut indexes = Vec::with_capacity(spec.indexes.len());
    for (no, ispec) in spec.indexes.iter().enumerate() {
        let (fields, n_key) = if no == 0 {
            clustered_layout(spec)
        } else {
            secondary_layout(spec, no)
        };
        let index = Arc::new(Index {
            id: id * 100 + no as u64,
            table_id: id,
            name: ispec.index_name.clone(),
            attributes: ispec.index_attributes,
            fields,
            n_key,
        });
        indexes.push(Tree::create(index, sys)?);
    }
    Ok(Arc::new(Table {
        id,
        name: spec.table_name.clone(),
        cols: spec
            .columns
            .iter()
            .map(|c| Column {
                name: c.column_name.clone(),
                ty: c.column_type,
                collation: c.column_collation,
            })
            .collect(),
        ibd_file_missing: false,
        indexes,
        handle_count: AtomicU32::new(0),
    }))
}

/// Dictionary cache as consumed by the undo core.
pub trait DictSys: Send + Sync {
    /// Look a table up by id, incrementing its handle count. Recovery
    /// levels past NoUndoLogScan refuse lookups outright.
    fn table_on_id(&self, recovery: ForceRecovery, table_id: TableID) -> Option<Arc<Table>>;

    fn decrement_handle_count(&self, table: &Table);

    /// Drop the index tree described by a SYS_INDEXES row. Called under
    /// the dictionary X-latch with the row still latched in `mtr`.
    fn drop_index_tree(&self, block: &Arc<BufBlock>, rec_off: u16, mtr: &mut Mtr);
}

/// In-memory dictionary cache.
#[derive(Default)]
pub struct MemDict {
    tables: Mutex<HashMap<TableID, Arc<Table>>>,
    drop_tree_calls: AtomicUsize,
    // field of a SYS_INDEXES record holding the root page number
    pub sys_index_root_field: Option<usize>,
}

impl MemDict {
    #[inline]
    pub fn new() -> Arc<MemDict> {
        Arc::new(MemDict::default())
    }

    /// A cache that knows which field of a SYS_INDEXES record stores
    /// the index root page number.
    #[inline]
    pub fn with_sys_index_root_field(field_no: usize) -> Arc<MemDict> {
        Arc::new(MemDict {
            sys_index_root_field: Some(field_no),
            ..MemDict::default()
        })
    }

    #[inline]
    pub fn register(&self, table: Arc<Table>) {
        self.tables.lock().insert(table.id, table);
    }

    #[inline]
    pub fn drop_tree_calls(&self) -> usize {
        self.drop_tree_calls.load(Ordering::Relaxed)
    }
}

impl DictSys for MemDict {
    fn table_on_id(&self, recovery: ForceRecovery, table_id: TableID) -> Option<Arc<Table>> {
        if recovery >= ForceRecovery::NoUndoLogScan {
            return None;
        }
        let table = self.tables.lock().get(&table_id).cloned()?;
        table.handle_count.fetch_add(1, Ordering::Relaxed);
        Some(table)
    }

    fn decrement_handle_count(&self, table: &Table) {
        let prev = table.handle_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    fn drop_index_tree(&self, block: &Arc<BufBlock>, rec_off: u16, mtr: &mut Mtr) {
        self.drop_tree_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(field_no) = self.sys_index_root_field {
            page::rec_write_index_page_no(block, rec_off, field_no, u32::MAX, mtr);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rookdb_catalog::Collation;

    /// A clustered index layout over (k, v): [k, trx_id, roll_ptr, v].
    pub(crate) fn test_index() -> Arc<Index> {
        Arc::new(Index {
            id: 100,
            table_id: 1,
            name: SemiStr::new("pk"),
            attributes: IndexAttributes::PK,
            fields: vec![
                IndexField {
                    col_no: 0,
                    collation: Collation::Binary,
                },
                IndexField {
                    col_no: SYS_FIELD_TRX_ID,
                    collation: Collation::Binary,
                },
                IndexField {
                    col_no: SYS_FIELD_ROLL_PTR,
                    collation: Collation::Binary,
                },
                IndexField {
                    col_no: 1,
                    collation: Collation::Binary,
                },
            ],
            n_key: 1,
        })
    }

    #[test]
    fn test_index_accessors() {
        let index = test_index();
        assert!(index.is_clustered());
        assert!(!index.is_temp());
        assert_eq!(index.n_fields(), 4);
        assert_eq!(index.trx_id_pos(), 1);
        assert_eq!(index.roll_ptr_pos(), 2);
        assert_eq!(index.field_no_of_col(1), Some(3));
        assert_eq!(index.field_no_of_col(9), None);
    }

    #[test]
    fn test_temp_index_prefix() {
        let mut name = String::new();
        name.push(TEMP_INDEX_PREFIX);
        name.push_str("building");
        let index = Index {
            id: 7,
            table_id: 1,
            name: SemiStr::new(&name),
            attributes: IndexAttributes::empty(),
            fields: vec![],
            n_key: 0,
        };
        assert!(index.is_temp());
    }
}
