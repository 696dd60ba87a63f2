//! Running per-field minimum and maximum summaries for a bucket.
//!
//! Each bucket keeps the smallest and largest value seen for every field,
//! recursing into sub-documents field-by-field and treating scalars and
//! arrays wholesale under the canonical ordering. The tracker also records
//! which entries changed since they were last read out, so an update commit
//! can write just the delta to `control.min`/`control.max` instead of the
//! full summaries.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
};

use errors::ErrorMetadata;
use value::{
    cmp_values,
    Document,
    FieldName,
    StringComparator,
    Value,
};

use crate::options::{
    BUCKET_CONTROL_FIELD_NAME,
    BUCKET_CONTROL_MAX_FIELD_NAME,
    BUCKET_CONTROL_MIN_FIELD_NAME,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Extreme {
    Min,
    Max,
}

impl Extreme {
    /// Whether `candidate` should replace the current extreme.
    fn prefers(&self, candidate_vs_current: Ordering) -> bool {
        match self {
            Extreme::Min => candidate_vs_current == Ordering::Less,
            Extreme::Max => candidate_vs_current == Ordering::Greater,
        }
    }
}

#[derive(Clone, Debug)]
enum Node {
    /// Scalars and arrays, tracked as whole values.
    Value(Value),
    /// Sub-documents, tracked field-by-field.
    Object(Fields),
}

impl Node {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(d) => Node::Object(Fields::from_document(d, true)),
            other => Node::Value(other.clone()),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Node::Value(v) => v.clone(),
            Node::Object(fields) => Value::Object(fields.to_document()),
        }
    }
}

#[derive(Clone, Debug)]
struct Entry {
    node: Node,
    /// Set when this entry's value changed (or appeared) since the summary
    /// was last read out; cleared by the read.
    updated: bool,
}

impl Entry {
    fn merge(&mut self, value: &Value, extreme: Extreme, collator: Option<&dyn StringComparator>) {
        if let (Node::Object(fields), Value::Object(d)) = (&mut self.node, value) {
            for (sub_name, sub_value) in d.iter() {
                fields.merge_field(sub_name, sub_value, extreme, collator);
            }
            return;
        }
        // Type changes and scalar-vs-scalar both settle under the canonical
        // cross-type order, replacing the tracked value wholesale.
        let current = self.node.to_value();
        if extreme.prefers(cmp_values(value, &current, collator)) {
            self.node = Node::from_value(value);
            self.updated = true;
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Fields {
    entries: BTreeMap<FieldName, Entry>,
}

impl Fields {
    fn from_document(d: &Document, updated: bool) -> Self {
        let entries = d
            .iter()
            .map(|(name, value)| {
                let node = match value {
                    Value::Object(sub) => Node::Object(Fields::from_document(sub, updated)),
                    other => Node::Value(other.clone()),
                };
                (
                    name.clone(),
                    Entry {
                        node,
                        updated,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    fn merge_field(
        &mut self,
        name: &FieldName,
        value: &Value,
        extreme: Extreme,
        collator: Option<&dyn StringComparator>,
    ) {
        if !self.entries.contains_key(name) {
            self.entries.insert(
                name.clone(),
                Entry {
                    node: Node::from_value(value),
                    updated: true,
                },
            );
            return;
        }
        self.entries
            .get_mut(name)
            .expect("just checked")
            .merge(value, extreme, collator);
    }

    fn to_document(&self) -> Document {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.node.to_value()))
            .collect()
    }

    fn clear_updated(&mut self) {
        for entry in self.entries.values_mut() {
            entry.updated = false;
            if let Node::Object(fields) = &mut entry.node {
                fields.clear_updated();
            }
        }
    }

    /// Entries changed since the last read, as a document; clears the flags.
    /// A partially-updated sub-document contributes only its changed fields.
    fn updates_document(&mut self) -> Document {
        let mut out = Document::new();
        for (name, entry) in self.entries.iter_mut() {
            if entry.updated {
                out.append(name.clone(), entry.node.to_value());
                entry.updated = false;
                if let Node::Object(fields) = &mut entry.node {
                    fields.clear_updated();
                }
            } else if let Node::Object(fields) = &mut entry.node {
                let sub = fields.updates_document();
                if !sub.is_empty() {
                    out.append(name.clone(), Value::Object(sub));
                }
            }
        }
        out
    }
}

/// Per-bucket running min/max tracker.
#[derive(Clone, Debug, Default)]
pub struct MinMax {
    min: Fields,
    max: Fields,
}

impl MinMax {
    /// Fold a measurement into both summaries, skipping the meta field.
    pub fn update(
        &mut self,
        doc: &Document,
        meta_field: Option<&FieldName>,
        collator: Option<&dyn StringComparator>,
    ) {
        for (name, value) in doc.iter() {
            if Some(name) == meta_field {
                continue;
            }
            self.min.merge_field(name, value, Extreme::Min, collator);
            self.max.merge_field(name, value, Extreme::Max, collator);
        }
    }

    /// The full minimum summary; resets the delta tracking.
    pub fn min(&mut self) -> Document {
        self.min.clear_updated();
        self.min.to_document()
    }

    /// The full maximum summary; resets the delta tracking.
    pub fn max(&mut self) -> Document {
        self.max.clear_updated();
        self.max.to_document()
    }

    /// Minimum entries changed since the last read of either form.
    pub fn min_updates(&mut self) -> Document {
        self.min.updates_document()
    }

    /// Maximum entries changed since the last read of either form.
    pub fn max_updates(&mut self) -> Document {
        self.max.updates_document()
    }
}

/// Reconstruct a tracker from a persisted bucket document's control block.
/// The summaries come back clean: nothing is considered updated until the
/// next measurement lands.
pub fn generate_min_max_from_bucket_doc(
    bucket_doc: &Document,
    _collator: Option<&dyn StringComparator>,
) -> anyhow::Result<MinMax> {
    let control = bucket_doc
        .get_object(BUCKET_CONTROL_FIELD_NAME)
        .ok_or_else(|| {
            ErrorMetadata::bad_value(
                "InvalidBucketDocument",
                "bucket document is missing the control block",
            )
        })?;
    let min = control
        .get_object(BUCKET_CONTROL_MIN_FIELD_NAME)
        .ok_or_else(|| {
            ErrorMetadata::bad_value(
                "InvalidBucketDocument",
                "bucket control block is missing the min summary",
            )
        })?;
    let max = control
        .get_object(BUCKET_CONTROL_MAX_FIELD_NAME)
        .ok_or_else(|| {
            ErrorMetadata::bad_value(
                "InvalidBucketDocument",
                "bucket control block is missing the max summary",
            )
        })?;
    Ok(MinMax {
        min: Fields::from_document(min, false),
        max: Fields::from_document(max, false),
    })
}
