//! Row assembly: moving between clustered records, logical rows and
//! secondary index entries.

pub mod ops;
pub mod vers;

use crate::buffer::PageBuf;
use crate::dict::Index;
use crate::rec::Offsets;
use crate::value::{Field, Tuple, UpdField, Update};

/// Encode a system column (trx id or roll pointer) as a record field.
#[inline]
pub fn sys_field(val: u64) -> Field {
    Field::Data(val.to_be_bytes().to_vec())
}

/// Decode a system column field.
#[inline]
pub fn read_sys_field(field: &Field) -> u64 {
    let bytes = field.local_bytes();
    debug_assert_eq!(bytes.len(), 8);
    u64::from_be_bytes(bytes.try_into().unwrap())
}

/// Transaction id stored in a clustered record tuple.
#[inline]
pub fn row_trx_id(row: &Tuple, clust: &Index) -> u64 {
    read_sys_field(&row.fields[clust.trx_id_pos()])
}

/// Roll pointer stored in a clustered record tuple.
#[inline]
pub fn row_roll_ptr(row: &Tuple, clust: &Index) -> u64 {
    read_sys_field(&row.fields[clust.roll_ptr_pos()])
}

/// The row reference: the ordering prefix of a clustered record.
#[inline]
pub fn build_row_ref(row: &Tuple, clust: &Index) -> Tuple {
    Tuple::new(row.fields[..clust.n_key].to_vec())
}

/// Build the entry of a secondary index from a clustered row.
///
/// `None` when a needed column is flagged as externally stored with no
/// locally cached prefix: the overflow part was never written, which is
/// only legal while rolling back an incomplete transaction in crash
/// recovery.
pub fn build_index_entry(row: &Tuple, clust: &Index, sec: &Index) -> Option<Tuple> {
    let mut fields = Vec::with_capacity(sec.n_fields());
    for f in &sec.fields {
        let pos = clust
            .field_no_of_col(f.col_no)
            .expect("secondary column exists in the clustered index");
        match &row.fields[pos] {
            Field::Extern(prefix) if prefix.is_empty() => return None,
            Field::Extern(prefix) => fields.push(Field::Data(prefix.clone())),
            other => fields.push(other.clone()),
        }
    }
    Some(Tuple::new(fields))
}

/// Apply an update vector to a tuple in place.
pub fn apply_update(row: &mut Tuple, update: &Update) {
    for uf in &update.fields {
        row.fields[uf.field_no as usize] = uf.new_val.clone();
    }
}

/// The byte-wise difference between a stored secondary record and the
/// entry it should equal: the update that makes the record match.
/// Collation-equal fields that differ in bytes are included.
pub fn sec_rec_difference(frame: &PageBuf, offsets: &Offsets, entry: &Tuple) -> Update {
    debug_assert_eq!(offsets.n_fields(), entry.n_fields());
    let mut fields = vec![];
    for i in 0..entry.n_fields() {
        let stored = offsets.nth_value(frame, i);
        if stored != entry.fields[i] {
            fields.push(UpdField {
                field_no: i as u16,
                new_val: entry.fields[i].clone(),
            });
        }
    }
    Update {
        fields,
        info_bits: 0,
    }
}
