//! Measurement schema compatibility tracking.
//!
//! Measurements in one bucket must agree on the canonical type of every
//! field path, because the persisted columnar form stores one column per
//! field. The tracker remembers the type tree it has seen; offering it a
//! document either extends the tree (`Updated`), matches it exactly
//! (`Unchanged`), or conflicts with it (`Failed`), in which case the bucket
//! rolls over.

use std::collections::BTreeMap;

use errors::ErrorMetadata;
use value::{
    CanonicalType,
    Document,
    FieldName,
    StringComparator,
    Value,
};

use crate::options::{
    BUCKET_CONTROL_FIELD_NAME,
    BUCKET_CONTROL_MIN_FIELD_NAME,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStatus {
    Updated,
    Unchanged,
    Failed,
}

#[derive(Clone, Debug)]
enum SchemaNode {
    Scalar(CanonicalType),
    Object(SchemaObject),
    /// Arrays are tracked positionally: element index acts as a field name.
    /// Shorter and longer arrays of the same prefix shapes are compatible.
    Array(Vec<SchemaNode>),
}

impl SchemaNode {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(d) => SchemaNode::Object(SchemaObject::from_document(d)),
            Value::Array(elements) => {
                SchemaNode::Array(elements.iter().map(SchemaNode::from_value).collect())
            },
            scalar => SchemaNode::Scalar(CanonicalType::of(scalar)),
        }
    }

    fn merge(&mut self, value: &Value) -> UpdateStatus {
        match (self, value) {
            (SchemaNode::Object(object), Value::Object(d)) => object.merge(d),
            (SchemaNode::Array(positions), Value::Array(elements)) => {
                let mut status = UpdateStatus::Unchanged;
                for (i, element) in elements.iter().enumerate() {
                    if i >= positions.len() {
                        positions.push(SchemaNode::from_value(element));
                        status = UpdateStatus::Updated;
                        continue;
                    }
                    match positions[i].merge(element) {
                        UpdateStatus::Failed => return UpdateStatus::Failed,
                        UpdateStatus::Updated => status = UpdateStatus::Updated,
                        UpdateStatus::Unchanged => (),
                    }
                }
                status
            },
            (SchemaNode::Scalar(current), value) if *current == CanonicalType::of(value) => {
                UpdateStatus::Unchanged
            },
            _ => UpdateStatus::Failed,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SchemaObject {
    fields: BTreeMap<FieldName, SchemaNode>,
}

impl SchemaObject {
    fn from_document(d: &Document) -> Self {
        let fields = d
            .iter()
            .map(|(name, value)| (name.clone(), SchemaNode::from_value(value)))
            .collect();
        Self { fields }
    }

    fn merge(&mut self, d: &Document) -> UpdateStatus {
        let mut status = UpdateStatus::Unchanged;
        for (name, value) in d.iter() {
            match self.merge_field(name, value) {
                UpdateStatus::Failed => return UpdateStatus::Failed,
                UpdateStatus::Updated => status = UpdateStatus::Updated,
                UpdateStatus::Unchanged => (),
            }
        }
        status
    }

    fn merge_field(&mut self, name: &FieldName, value: &Value) -> UpdateStatus {
        if !self.fields.contains_key(name) {
            self.fields.insert(name.clone(), SchemaNode::from_value(value));
            return UpdateStatus::Updated;
        }
        self.fields.get_mut(name).expect("just checked").merge(value)
    }
}

/// The reference schema for measurements in a bucket. May reflect the schema
/// of measurements that have not committed yet.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    root: SchemaObject,
}

impl Schema {
    /// Offer a measurement. The collator is accepted for interface symmetry
    /// with the min/max tracker; type compatibility does not depend on it.
    pub fn update(
        &mut self,
        doc: &Document,
        meta_field: Option<&FieldName>,
        _collator: Option<&dyn StringComparator>,
    ) -> UpdateStatus {
        let mut status = UpdateStatus::Unchanged;
        for (name, value) in doc.iter() {
            if Some(name) == meta_field {
                continue;
            }
            match self.root.merge_field(name, value) {
                UpdateStatus::Failed => return UpdateStatus::Failed,
                UpdateStatus::Updated => status = UpdateStatus::Updated,
                UpdateStatus::Unchanged => (),
            }
        }
        status
    }
}

/// Reconstruct the schema of a persisted bucket from its `control.min`
/// summary, whose type tree matches the bucket's data columns.
pub fn generate_schema_from_bucket_doc(
    bucket_doc: &Document,
    collator: Option<&dyn StringComparator>,
) -> anyhow::Result<Schema> {
    let min = bucket_doc
        .get_object(BUCKET_CONTROL_FIELD_NAME)
        .and_then(|control| control.get_object(BUCKET_CONTROL_MIN_FIELD_NAME))
        .ok_or_else(|| {
            ErrorMetadata::bad_value(
                "InvalidBucketDocument",
                "bucket document is missing the control.min summary",
            )
        })?;
    let mut schema = Schema::default();
    if schema.update(min, None, collator) == UpdateStatus::Failed {
        anyhow::bail!(ErrorMetadata::bad_value(
            "InvalidBucketDocument",
            "bucket control.min summary is not a valid schema",
        ));
    }
    Ok(schema)
}
