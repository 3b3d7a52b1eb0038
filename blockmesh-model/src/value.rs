use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::ids::BlockId;

/// A single value storable in a block field. This is the minimal concrete
/// payload typing the core spec leaves unspecified (see `SPEC_FULL.md` §2):
/// enough variants to carry scalar data and to let higher collections
/// (Chain) cross-reference other blocks by id.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    I64(i64),
    F64(OrderedFloat<f64>),
    Str(String),
    Bytes(Vec<u8>),
    BlockRef(BlockId),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_block_ref(&self) -> Option<&BlockId> {
        match self {
            Value::BlockRef(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<BlockId> for Value {
    fn from(v: BlockId) -> Self {
        Value::BlockRef(v)
    }
}

/// The name of a field within a block's payload. Fields are fixed per
/// BlockType but are addressed by name so that [`crate::BlockOperation`]
/// can target one generically (spec.md §9's "dynamic typing of payload
/// fields" note).
pub type FieldName = String;

/// A block field is either a single scalar or a resizable sequence.
/// `BlockOperation` targets scalar fields with `offset=0, delete_count=0`
/// (whole-value replace) and array fields with arbitrary splices.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Scalar(Value),
    Array(Vec<Value>),
}

impl FieldValue {
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            FieldValue::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
}
