use std::collections::{BTreeMap, BTreeSet};
use serde::{Deserialize, Serialize};

use blockmesh_base::{invariant_err, Result};

use crate::block::Block;
use crate::ids::BlockId;
use crate::value::{FieldName, FieldValue, Value};

/// `(fieldName, offset, deleteCount, inserted)`. On the named field, splice
/// `inserted` into position `offset`, removing `deleteCount` existing
/// entries. For scalar fields `offset=0, deleteCount=0` means "replace".
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct BlockOperation {
    pub field: FieldName,
    pub offset: usize,
    pub delete_count: usize,
    pub inserted: Vec<Value>,
}

impl BlockOperation {
    pub fn replace_scalar(field: impl Into<FieldName>, value: Value) -> Self {
        BlockOperation { field: field.into(), offset: 0, delete_count: 0, inserted: vec![value] }
    }

    pub fn splice_array(
        field: impl Into<FieldName>,
        offset: usize,
        delete_count: usize,
        inserted: Vec<Value>,
    ) -> Self {
        BlockOperation { field: field.into(), offset, delete_count, inserted }
    }
}

/// In-place splice of `op.inserted` into `block[op.field]` at `op.offset`,
/// replacing `op.deleteCount` items. Fails with an Invariant error if
/// `field` is unknown, `offset` is out of range, or `deleteCount` exceeds
/// the remaining length at `offset`.
pub fn apply_operation(block: &mut Block, op: &BlockOperation) -> Result<()> {
    let slot = block
        .fields
        .get_mut(&op.field)
        .ok_or_else(|| invariant_err(format!("unknown field {:?}", op.field)))?;
    match slot {
        FieldValue::Scalar(current) => {
            if op.offset != 0 || op.delete_count != 0 {
                return Err(invariant_err(format!(
                    "scalar field {:?} replace must use offset=0, delete_count=0",
                    op.field
                )));
            }
            if op.inserted.len() != 1 {
                return Err(invariant_err(format!(
                    "scalar field {:?} replace must insert exactly one value",
                    op.field
                )));
            }
            *current = op.inserted[0].clone();
            Ok(())
        }
        FieldValue::Array(items) => {
            if op.offset + op.delete_count > items.len() {
                return Err(invariant_err(format!(
                    "splice on {:?} out of range: offset={} delete_count={} len={}",
                    op.field, op.offset, op.delete_count, items.len()
                )));
            }
            items.splice(op.offset..op.offset + op.delete_count, op.inserted.iter().cloned());
            Ok(())
        }
    }
}

/// The per-block delta of one transaction: optional insert, ordered
/// updates, optional delete. At most one of `insert`/`delete`; `updates`
/// may be non-empty with `insert` present only within the same logical
/// transaction as the insert (updates apply post-insert, in order).
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Transform {
    pub insert: Option<Block>,
    pub updates: Vec<BlockOperation>,
    pub delete: bool,
}

impl Transform {
    pub fn is_empty(&self) -> bool {
        self.insert.is_none() && self.updates.is_empty() && !self.delete
    }

    fn validate(&self) -> Result<()> {
        if self.insert.is_some() && self.delete {
            return Err(invariant_err("transform has both insert and delete"));
        }
        Ok(())
    }
}

/// If `transform.delete`, returns absent. Else if `transform.insert` is
/// present and `block` is absent, materializes from the insert; then
/// applies `updates` in listed order. Operations within one transform are
/// applied in listed order; order is semantically significant.
pub fn apply_transform(block: Option<Block>, transform: &Transform) -> Result<Option<Block>> {
    transform.validate()?;
    if transform.delete {
        return Ok(None);
    }
    let mut block = match (block, &transform.insert) {
        (Some(_), Some(_)) => return Err(invariant_err("insert over an existing block")),
        (Some(b), None) => b,
        (None, Some(ins)) => ins.clone(),
        (None, None) => return Err(invariant_err("update with neither an existing block nor an insert")),
    };
    for op in &transform.updates {
        apply_operation(&mut block, op)?;
    }
    Ok(Some(block))
}

/// Merge-left semantics: on insert collision the later insert wins; updates
/// concatenate in order (later after earlier); a later delete subsumes
/// earlier inserts/updates.
pub fn concat_transform(existing: Transform, incoming: Transform) -> Result<Transform> {
    incoming.validate()?;
    if incoming.delete {
        return Ok(Transform { insert: None, updates: Vec::new(), delete: true });
    }
    let insert = incoming.insert.or(existing.insert);
    let mut updates = existing.updates;
    updates.extend(incoming.updates);
    Ok(Transform { insert, updates, delete: false })
}

/// A multi-block bundle of transforms committed together. A BlockId
/// appears in at most one of {inserts, deletes}; it may appear in updates
/// in addition to inserts (same-transaction update on a newly inserted
/// block) but never in both updates and deletes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transforms {
    pub inserts: BTreeMap<BlockId, Block>,
    pub updates: BTreeMap<BlockId, Vec<BlockOperation>>,
    pub deletes: BTreeSet<BlockId>,
}

pub fn empty_transforms() -> Transforms {
    Transforms::default()
}

impl Transforms {
    pub fn insert_block(&mut self, block: Block) -> Result<()> {
        let id = block.id().clone();
        if self.deletes.contains(&id) {
            return Err(invariant_err(format!("{id} already deleted in this Transforms")));
        }
        if self.inserts.insert(id, block).is_some() {
            return Err(invariant_err("duplicate insert for the same BlockId"));
        }
        Ok(())
    }

    pub fn update_block(&mut self, id: BlockId, op: BlockOperation) -> Result<()> {
        if self.deletes.contains(&id) {
            return Err(invariant_err(format!("{id} already deleted in this Transforms")));
        }
        self.updates.entry(id).or_default().push(op);
        Ok(())
    }

    pub fn delete_block(&mut self, id: BlockId) -> Result<()> {
        if self.updates.contains_key(&id) && !self.inserts.contains_key(&id) {
            return Err(invariant_err(format!(
                "{id} has updates queued against a prior committed value; cannot also delete it in this Transforms"
            )));
        }
        self.inserts.remove(&id);
        self.updates.remove(&id);
        self.deletes.insert(id);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// Extract the per-block Transform for `id` from a Transforms bundle.
pub fn transform_for_block_id(transforms: &Transforms, id: &BlockId) -> Transform {
    Transform {
        insert: transforms.inserts.get(id).cloned(),
        updates: transforms.updates.get(id).cloned().unwrap_or_default(),
        delete: transforms.deletes.contains(id),
    }
}

/// Union of keys across inserts, updates, deletes.
pub fn block_ids_for_transforms(transforms: &Transforms) -> BTreeSet<BlockId> {
    let mut ids: BTreeSet<BlockId> = transforms.inserts.keys().cloned().collect();
    ids.extend(transforms.updates.keys().cloned());
    ids.extend(transforms.deletes.iter().cloned());
    ids
}

/// Sequential concat of `b` into `a`, one block id at a time.
pub fn merge_transforms(a: &mut Transforms, b: Transforms) -> Result<()> {
    for id in block_ids_for_transforms(&b) {
        let existing = transform_for_block_id(a, &id);
        let incoming = transform_for_block_id(&b, &id);
        let merged = concat_transform(existing, incoming)?;
        write_transform(a, id, merged);
    }
    Ok(())
}

/// Pure version of [`merge_transforms`]: returns a new bundle, `a` and `b`
/// untouched.
pub fn concat_transforms(a: &Transforms, b: &Transforms) -> Result<Transforms> {
    let mut out = a.clone();
    merge_transforms(&mut out, b.clone())?;
    Ok(out)
}

fn write_transform(transforms: &mut Transforms, id: BlockId, t: Transform) {
    transforms.inserts.remove(&id);
    transforms.updates.remove(&id);
    transforms.deletes.remove(&id);
    if t.delete {
        transforms.deletes.insert(id);
        return;
    }
    if let Some(ins) = t.insert {
        transforms.inserts.insert(id.clone(), ins);
    }
    if !t.updates.is_empty() {
        transforms.updates.insert(id, t.updates);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block::{BlockHeader, BlockType};
    use crate::ids::CollectionId;

    fn header(id: &str) -> BlockHeader {
        BlockHeader {
            id: BlockId::from(id),
            block_type: BlockType::new(*b"TST", "test"),
            collection_id: CollectionId::from("c1"),
        }
    }

    fn counter_block(id: &str, n: i64) -> Block {
        Block::new(header(id)).with_field("n", FieldValue::Scalar(Value::I64(n)))
    }

    #[test]
    fn apply_operation_replaces_scalar() {
        let mut b = counter_block("b1", 1);
        apply_operation(&mut b, &BlockOperation::replace_scalar("n", Value::I64(2))).unwrap();
        assert_eq!(b.field("n").unwrap().as_scalar().unwrap().as_i64(), Some(2));
    }

    #[test]
    fn apply_operation_splices_array() {
        let mut b = Block::new(header("b1"))
            .with_field("xs", FieldValue::Array(vec![Value::I64(1), Value::I64(2), Value::I64(3)]));
        apply_operation(
            &mut b,
            &BlockOperation::splice_array("xs", 1, 1, vec![Value::I64(9), Value::I64(8)]),
        )
        .unwrap();
        let xs = b.field("xs").unwrap().as_array().unwrap();
        assert_eq!(xs, &[Value::I64(1), Value::I64(9), Value::I64(8), Value::I64(3)]);
    }

    #[test]
    fn apply_operation_rejects_out_of_range_splice() {
        let mut b = Block::new(header("b1")).with_field("xs", FieldValue::Array(vec![Value::I64(1)]));
        let err = apply_operation(&mut b, &BlockOperation::splice_array("xs", 0, 5, vec![]));
        assert!(err.is_err());
    }

    #[test]
    fn apply_transform_insert_then_update() {
        let t = Transform {
            insert: Some(counter_block("b1", 1)),
            updates: vec![BlockOperation::replace_scalar("n", Value::I64(5))],
            delete: false,
        };
        let result = apply_transform(None, &t).unwrap().unwrap();
        assert_eq!(result.field("n").unwrap().as_scalar().unwrap().as_i64(), Some(5));
    }

    #[test]
    fn apply_transform_delete_returns_absent() {
        let existing = counter_block("b1", 1);
        let t = Transform { insert: None, updates: vec![], delete: true };
        assert!(apply_transform(Some(existing), &t).unwrap().is_none());
    }

    #[test]
    fn composition_associativity_for_disjoint_updates() {
        // apply(apply(b, t1), t2) == apply(b, concat(t1, t2)) for non-conflicting ops.
        let base = counter_block("b1", 0);
        let t1 = Transform {
            insert: None,
            updates: vec![BlockOperation::replace_scalar("n", Value::I64(1))],
            delete: false,
        };
        let t2 = Transform {
            insert: None,
            updates: vec![BlockOperation::replace_scalar("n", Value::I64(2))],
            delete: false,
        };

        let sequential = apply_transform(
            apply_transform(Some(base.clone()), &t1).unwrap(),
            &t2,
        )
        .unwrap();

        let concatenated = concat_transform(t1, t2).unwrap();
        let combined = apply_transform(Some(base), &concatenated).unwrap();

        assert_eq!(sequential, combined);
    }

    #[test]
    fn merge_transforms_later_delete_subsumes_earlier_insert() {
        let mut a = empty_transforms();
        a.insert_block(counter_block("b1", 1)).unwrap();

        let mut b = empty_transforms();
        b.delete_block(BlockId::from("b1")).unwrap();

        merge_transforms(&mut a, b).unwrap();
        assert!(a.inserts.is_empty());
        assert!(a.deletes.contains(&BlockId::from("b1")));
    }

    #[test]
    fn block_ids_for_transforms_is_union_of_all_three_maps() {
        let mut t = empty_transforms();
        t.insert_block(counter_block("b1", 1)).unwrap();
        t.update_block(BlockId::from("b2"), BlockOperation::replace_scalar("n", Value::I64(0))).unwrap();
        t.delete_block(BlockId::from("b3")).unwrap();
        let ids = block_ids_for_transforms(&t);
        assert_eq!(ids.len(), 3);
    }
}
