//! Per-dimension interning of raw values into small key codes.

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use super::schema::Schema;

/// Code for an empty or absent dimension value.
pub const NA_CODE: u32 = 0;
/// Code for a value that was collapsed or did not fit in the lookup.
pub const AGGR_CODE: u32 = 1;
/// Published value of [`AGGR_CODE`].
pub const AGGR_VALUE: &str = "AGGR";

/// Smallest lookup size; the two reserved codes always take slots 0 and 1.
pub const MIN_LOOKUP_SIZE: usize = 4;
/// Upper bound on distinct values interned per dimension.
pub const MAX_LOOKUP_SIZE: usize = 1 << 20;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("unknown code {code}")]
    UnknownCode { code: u32 },

    #[error("lookup index {index} out of range, set holds {len} lookups")]
    IndexOutOfRange { index: usize, len: usize },
}

struct Entries {
    codes: HashMap<Box<[u8]>, u32>,
    values: Vec<String>,
}

/// Bidirectional byte-string ↔ code table for one dimension.
///
/// Codes are handed out sequentially from 2 on first sight until the table
/// is full; after that every unseen value resolves to [`AGGR_CODE`].
pub struct Lookup {
    entries: RwLock<Entries>,
    size: usize,
}

impl Lookup {
    /// Creates a lookup holding at most `size` codes, reserved ones included.
    pub fn new(size: usize) -> Self {
        let size = size.clamp(MIN_LOOKUP_SIZE, MAX_LOOKUP_SIZE);
        Self {
            entries: RwLock::new(Entries {
                codes: HashMap::new(),
                values: vec![String::new(), AGGR_VALUE.to_string()],
            }),
            size,
        }
    }

    /// Capacity in codes, reserved ones included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the code for `data`, assigning a new one if there is room.
    pub fn lookup_bytes(&self, data: &[u8]) -> u32 {
        if data.is_empty() {
            return NA_CODE;
        }

        if let Some(&code) = self.entries.read().codes.get(data) {
            return code;
        }

        let mut entries = self.entries.write();
        // Another writer may have inserted it between the two locks.
        if let Some(&code) = entries.codes.get(data) {
            return code;
        }
        if entries.values.len() >= self.size {
            return AGGR_CODE;
        }

        let code = entries.values.len() as u32;
        entries.codes.insert(Box::from(data), code);
        entries
            .values
            .push(String::from_utf8_lossy(data).into_owned());
        code
    }

    /// Reverse lookup of a previously assigned code.
    pub fn lookup_code(&self, code: u32) -> Result<String, LookupError> {
        self.entries
            .read()
            .values
            .get(code as usize)
            .cloned()
            .ok_or(LookupError::UnknownCode { code })
    }

    /// Number of codes in use, reserved ones included.
    pub fn len(&self) -> usize {
        self.entries.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= AGGR_CODE as usize + 1
    }
}

/// One [`Lookup`] per schema dimension, indexed by dimension index.
pub struct LookupSet {
    lookups: Vec<Lookup>,
}

impl LookupSet {
    /// Builds an empty lookup for every dimension of `schema`.
    ///
    /// Each lookup is sized to the dimension's declared cardinality, limited
    /// to what its key width can encode.
    pub fn from_schema(schema: &Schema) -> Self {
        let lookups = schema
            .dimensions()
            .map(|field| {
                let encodable = 1usize
                    .checked_shl(field.key_bit_size())
                    .unwrap_or(usize::MAX);
                Lookup::new((field.max_size() as usize).min(encodable))
            })
            .collect();
        Self { lookups }
    }

    pub fn len(&self) -> usize {
        self.lookups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Lookup, LookupError> {
        self.lookups.get(index).ok_or(LookupError::IndexOutOfRange {
            index,
            len: self.lookups.len(),
        })
    }

    pub fn lookup_bytes(&self, index: usize, data: &[u8]) -> Result<u32, LookupError> {
        Ok(self.get(index)?.lookup_bytes(data))
    }

    pub fn lookup_code(&self, index: usize, code: u32) -> Result<String, LookupError> {
        self.get(index)?.lookup_code(code)
    }
}
