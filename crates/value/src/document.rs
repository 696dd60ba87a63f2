//! Insertion-ordered document type used for measurements and bucket docs.

use std::fmt;

use chrono::{
    DateTime,
    Utc,
};

use crate::{
    heap_size::HeapSize,
    FieldName,
    Value,
};

/// An ordered mapping of field name to [`Value`].
///
/// Unlike a search-tree map, field order is preserved from the writer; two
/// documents with the same fields in different orders are *not* equal. The
/// bucket catalog normalizes metadata documents into a canonical field order
/// before comparing them (see the catalog's metadata module).
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Document {
    fields: Vec<(FieldName, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Append a field. Callers are responsible for not appending the same
    /// name twice; lookups return the first occurrence.
    pub fn append(&mut self, name: FieldName, value: impl Into<Value>) {
        self.fields.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .map(|(_, v)| v)
    }

    pub fn contains_field(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Get a sub-document at a given field name.
    pub fn get_object(&self, name: &str) -> Option<&Document> {
        match self.get(name) {
            Some(Value::Object(d)) => Some(d),
            _ => None,
        }
    }

    /// Get a UTC datetime at a given field name.
    pub fn get_date(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            Some(Value::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.fields.iter().map(|(n, v)| (n, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &FieldName> {
        self.fields.iter().map(|(n, _)| n)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The size of this document's serialized form: a length prefix, each
    /// element's frame and value, and a trailing terminator byte.
    pub fn serialized_size(&self) -> usize {
        4 + self
            .fields
            .iter()
            .map(|(n, v)| v.element_size(n))
            .sum::<usize>()
            + 1
    }

    /// Canonical binary encoding. Two documents are binary-equal iff their
    /// encodings are byte-for-byte identical.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        self.write_to(&mut out);
        out
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.serialized_size() as i32).to_le_bytes());
        for (name, value) in &self.fields {
            value.write_element(name, out);
        }
        out.push(0);
    }
}

impl FromIterator<(FieldName, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (FieldName, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type IntoIter = std::vec::IntoIter<(FieldName, Value)>;
    type Item = (FieldName, Value);

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.iter().map(|(n, v)| (n.as_str(), v)))
            .finish()
    }
}

impl HeapSize for Document {
    fn heap_size(&self) -> usize {
        self.fields.heap_size()
    }
}

#[cfg(test)]
mod tests {
    use crate::doc;

    #[test]
    fn test_field_order_is_significant() {
        let ab = doc! { "a" => 1i64, "b" => 2i64 };
        let ba = doc! { "b" => 2i64, "a" => 1i64 };
        assert_ne!(ab, ba);
        assert_ne!(ab.to_binary(), ba.to_binary());
    }

    #[test]
    fn test_lookup_and_shape_helpers() {
        let d = doc! { "meta" => doc! { "sensor" => "a1" }, "x" => 3i64 };
        assert!(d.contains_field("x"));
        assert_eq!(d.get_object("meta").unwrap().len(), 1);
        assert!(d.get_object("x").is_none());
        assert!(d.get("missing").is_none());
    }
}
