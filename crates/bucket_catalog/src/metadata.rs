//! Canonicalized bucket metadata and the key indexing open buckets.
//!
//! Two measurements belong to the same bucket series iff their metadata
//! values are equal after normalization: nested objects are recursively
//! re-ordered by binary comparison of their field names, arrays keep their
//! index order but their object elements are normalized in place, and
//! scalars pass through unchanged. Equality is then byte equality of the
//! canonical encoding, so writers can send the same metadata with fields in
//! any order and land in the same bucket.

use std::{
    fmt,
    hash::{
        Hash,
        Hasher,
    },
    sync::{
        Arc,
        LazyLock,
    },
};

use value::{
    heap_size::HeapSize,
    Document,
    FieldName,
    Namespace,
    StringComparator,
    Value,
};

/// Recursively normalize a value. Objects sort their fields by raw name
/// bytes (not a collation); arrays keep index order.
fn normalize_value(value: Value) -> Value {
    match value {
        Value::Array(elements) => {
            Value::Array(elements.into_iter().map(normalize_value).collect())
        },
        Value::Object(d) => Value::Object(normalize_document(d)),
        scalar => scalar,
    }
}

fn normalize_document(d: Document) -> Document {
    let mut fields: Vec<(FieldName, Value)> = d
        .into_iter()
        .map(|(name, value)| (name, normalize_value(value)))
        .collect();
    fields.sort_by(|(a, _), (b, _)| a.as_str().as_bytes().cmp(b.as_str().as_bytes()));
    fields.into_iter().collect()
}

/// The captured metadata of a bucket: the collection's meta field name, the
/// normalized metadata value, and the collection's collator. The collator
/// never alters the normalized bytes; it is carried forward to the min/max
/// and schema trackers, which compare strings with it.
#[derive(Clone, Default)]
pub struct BucketMetadata {
    element: Option<(FieldName, Value)>,
    comparator: Option<Arc<dyn StringComparator>>,
}

impl BucketMetadata {
    pub fn new(
        element: Option<(FieldName, Value)>,
        comparator: Option<Arc<dyn StringComparator>>,
    ) -> Self {
        Self {
            element: element.map(|(name, value)| (name, normalize_value(value))),
            comparator,
        }
    }

    /// The collection's meta field name, if the bucket carries metadata.
    pub fn meta_field(&self) -> Option<&FieldName> {
        self.element.as_ref().map(|(name, _)| name)
    }

    pub fn comparator(&self) -> Option<&dyn StringComparator> {
        self.comparator.as_deref()
    }

    /// The metadata as a single-element document, empty when absent.
    pub fn to_doc(&self) -> Document {
        let mut d = Document::new();
        if let Some((name, value)) = &self.element {
            d.append(name.clone(), value.clone());
        }
        d
    }
}

impl PartialEq for BucketMetadata {
    fn eq(&self, other: &Self) -> bool {
        // Already normalized, so binary equality is structural equality.
        self.element == other.element
    }
}

impl Eq for BucketMetadata {}

impl fmt::Debug for BucketMetadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("BucketMetadata").field(&self.element).finish()
    }
}

impl HeapSize for BucketMetadata {
    fn heap_size(&self) -> usize {
        self.element.heap_size()
    }
}

static KEY_HASHER: LazyLock<ahash::RandomState> = LazyLock::new(ahash::RandomState::new);

/// The (namespace, metadata) pair indexing the open bucket for a series,
/// with its hash precomputed once at construction.
#[derive(Clone, Debug)]
pub struct BucketKey {
    pub ns: Namespace,
    pub metadata: BucketMetadata,
    pub hash: u64,
}

impl BucketKey {
    pub fn new(ns: Namespace, metadata: BucketMetadata) -> Self {
        let hash = KEY_HASHER.hash_one((ns.db(), ns.coll(), metadata.to_doc().to_binary()));
        Self { ns, metadata, hash }
    }

    /// Rebuild a key from a live bucket's fields without re-hashing.
    pub(crate) fn from_parts(ns: Namespace, metadata: BucketMetadata, hash: u64) -> Self {
        Self { ns, metadata, hash }
    }
}

impl PartialEq for BucketKey {
    fn eq(&self, other: &Self) -> bool {
        self.ns == other.ns && self.metadata == other.metadata
    }
}

impl Eq for BucketKey {}

impl Hash for BucketKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}
