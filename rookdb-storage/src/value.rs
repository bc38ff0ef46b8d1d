use crate::buffer::PAGE_SIZE;
use bitflags::bitflags;
use rookdb_catalog::Collation;
use std::cmp::Ordering;

/// Stored length value meaning SQL NULL. The length of a logical field is
/// assumed to fit a 32-bit integer wherever it is persisted, e.g. in undo
/// records, so this sentinel must stay a 32-bit all-ones value.
pub const SQL_NULL: u32 = u32::MAX;

/// Lengths which are not [`SQL_NULL`] but not below this value indicate
/// that the field value continues in overflow pages. The stored length is
/// then this flag plus the locally stored prefix length.
pub const EXTERN_STORAGE_FIELD: u32 = SQL_NULL - PAGE_SIZE as u32;

/// One logical column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Null,
    Data(Vec<u8>),
    // Locally stored prefix of a field whose tail lives in overflow pages.
    // An empty prefix means the overflow part was never written; index
    // entries over such a field cannot be built.
    Extern(Vec<u8>),
}

impl Field {
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Self {
        Field::Data(data.to_vec())
    }

    /// The length as persisted in undo records and update vectors.
    #[inline]
    pub fn stored_len(&self) -> u32 {
        match self {
            Field::Null => SQL_NULL,
            Field::Data(d) => d.len() as u32,
            Field::Extern(local) => local.len() as u32 + EXTERN_STORAGE_FIELD,
        }
    }

    /// Rebuild a field from a persisted length and its local bytes.
    #[inline]
    pub fn from_stored(len: u32, bytes: &[u8]) -> Self {
        if len == SQL_NULL {
            Field::Null
        } else if len >= EXTERN_STORAGE_FIELD {
            Field::Extern(bytes.to_vec())
        } else {
            Field::Data(bytes.to_vec())
        }
    }

    /// Locally stored bytes, empty for NULL.
    #[inline]
    pub fn local_bytes(&self) -> &[u8] {
        match self {
            Field::Null => &[],
            Field::Data(d) => d,
            Field::Extern(local) => local,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Field::Null)
    }

    #[inline]
    pub fn is_extern(&self) -> bool {
        matches!(self, Field::Extern(_))
    }
}

/// A logical tuple: the in-memory form of an index entry or row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    pub fields: Vec<Field>,
}

impl Tuple {
    #[inline]
    pub fn new(fields: Vec<Field>) -> Self {
        Tuple { fields }
    }

    #[inline]
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// Sum of locally stored byte lengths.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.fields.iter().map(|f| f.local_bytes().len()).sum()
    }
}

/// Compare two fields under a collation. NULL sorts lowest.
#[inline]
pub fn cmp_field(collation: Collation, a: &Field, b: &Field) -> Ordering {
    match (a, b) {
        (Field::Null, Field::Null) => Ordering::Equal,
        (Field::Null, _) => Ordering::Less,
        (_, Field::Null) => Ordering::Greater,
        _ => collation.cmp_bytes(a.local_bytes(), b.local_bytes()),
    }
}

bitflags! {
    /// Hints recorded with an update and carried through its undo record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmplInfo: u8 {
        // the update does not change any ordering column of any index
        const NO_ORD_CHANGE = 0x01;
        // the update does not change the stored size of the record
        const NO_SIZE_CHANGE = 0x02;
    }
}

/// One updated field: the value the record field is set to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdField {
    pub field_no: u16,
    pub new_val: Field,
}

/// An update vector over an index record, in record field order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Update {
    pub fields: Vec<UpdField>,
    // record info bits the update installs (delete-mark among them)
    pub info_bits: u8,
}

impl Update {
    #[inline]
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value for a record field, if this update touches it.
    #[inline]
    pub fn field_for(&self, field_no: u16) -> Option<&Field> {
        self.fields
            .iter()
            .find(|uf| uf.field_no == field_no)
            .map(|uf| &uf.new_val)
    }
}
