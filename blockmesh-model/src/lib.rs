#![allow(dead_code)]

mod block;
mod ids;
mod registry;
mod transform;
mod value;

pub use block::{Block, BlockHeader, BlockType};
pub use ids::{BlockId, CollectionId, Rev, TrxId, NO_REV};
pub use registry::BlockTypeRegistry;
pub use transform::{
    apply_operation, apply_transform, block_ids_for_transforms, concat_transform,
    concat_transforms, empty_transforms, merge_transforms, transform_for_block_id,
    BlockOperation, Transform, Transforms,
};
pub use value::{FieldName, FieldValue, Value};
