//! Row version questions answered by walking the roll pointer chain.

use crate::buffer::PageBuf;
use crate::dict::Index;
use crate::rec::{self, Offsets, tuples_collation_equal};
use crate::row::{apply_update, build_index_entry, row_roll_ptr};
use crate::trx::{ROLL_PTR_NULL, TrxID, TrxSys, roll_ptr_is_insert};
use crate::trx::undo as trx_undo;
use crate::value::Tuple;

// chains longer than this indicate a roll pointer cycle
const MAX_VERSIONS: usize = 4096;

/// Whether a delete-marked record made obsolete by transaction
/// `new_trx_id` must still be preserved for an old reader.
#[inline]
pub fn must_preserve_del_marked(trx_sys: &TrxSys, new_trx_id: TrxID) -> bool {
    new_trx_id >= trx_sys.oldest_view_ts()
}

/// Whether any version of the clustered record at `offsets` carries the
/// given secondary index `entry`. With `also_curr` the current version
/// takes part too; otherwise only the prior versions are consulted.
///
/// Delete-marked versions never require a secondary entry. A chain cut
/// short by purge means no surviving version needs it.
pub fn old_has_index_entry(
    also_curr: bool,
    frame: &PageBuf,
    offsets: &Offsets,
    clust: &Index,
    sec: &Index,
    entry: &Tuple,
    trx_sys: &TrxSys,
) -> bool {
    let collations = sec.collations();
    let mut version = offsets.to_tuple(frame);
    let mut info_bits = rec::info_bits(frame, offsets.origin);

    if also_curr && info_bits & rec::REC_INFO_DELETED == 0 {
        if let Some(v_entry) = build_index_entry(&version, clust, sec) {
            if tuples_collation_equal(&v_entry, entry, &collations) {
                return true;
            }
        }
    }

    for _ in 0..MAX_VERSIONS {
        let roll_ptr = row_roll_ptr(&version, clust);
        if roll_ptr == ROLL_PTR_NULL || roll_ptr_is_insert(roll_ptr) {
            return false;
        }
        let Some(undo_rec) = trx_sys.undo_rec(roll_ptr) else {
            // already purged
            return false;
        };
        let Ok(prev) = trx_undo::parse_modify_for_vers(&undo_rec, clust) else {
            return false;
        };
        apply_update(&mut version, &prev);
        info_bits = prev.info_bits;

        if info_bits & rec::REC_INFO_DELETED == 0 {
            if let Some(v_entry) = build_index_entry(&version, clust, sec) {
                if tuples_collation_equal(&v_entry, entry, &collations) {
                    return true;
                }
            }
        }
    }
    tracing::error!(rec = offsets.origin, "version chain did not terminate");
    false
}
