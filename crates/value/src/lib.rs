//! Document values handled by the time-series storage layer.
//!
//! Measurements, bucket metadata, and persisted bucket documents are all
//! represented as [`Document`]s: insertion-ordered field maps over a small
//! BSON-shaped [`Value`] enum. The serialized-size model mirrors BSON's
//! framing byte-for-byte so that bucket size accounting agrees with what the
//! persisted form will actually occupy, and the canonical binary encoding
//! gives an order-independent equality for bucket metadata.
mod document;
mod field_name;
pub mod heap_size;
mod macros;
mod namespace;
mod object_id;
pub mod sorting;

use chrono::{
    DateTime,
    Utc,
};
pub use document::Document;
pub use field_name::FieldName;
pub use namespace::Namespace;
pub use object_id::ObjectId;
pub use sorting::{
    cmp_values,
    CanonicalType,
    StringComparator,
};

use crate::heap_size::HeapSize;

/// Maximum serialized size of a user document, and with it the hard upper
/// bound on a persisted bucket.
pub const MAX_USER_DOCUMENT_SIZE: usize = 16 * 1024 * 1024;

/// A single BSON-shaped value.
///
/// Field order inside [`Value::Object`] is significant (it is preserved from
/// the writer), and equality is binary: two values are equal iff their
/// canonical encodings are byte-for-byte equal. In particular `0.0` and
/// `-0.0` are distinct, and floats compare by bit pattern.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    /// Opaque binary payload, e.g. a compressed column in a persisted bucket.
    Binary(Vec<u8>),
    ObjectId(ObjectId),
    /// A UTC datetime with millisecond precision.
    Date(DateTime<Utc>),
    Array(Vec<Value>),
    Object(Document),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(l), Value::Boolean(r)) => l == r,
            (Value::Int64(l), Value::Int64(r)) => l == r,
            (Value::Float64(l), Value::Float64(r)) => l.to_bits() == r.to_bits(),
            (Value::String(l), Value::String(r)) => l == r,
            (Value::Binary(l), Value::Binary(r)) => l == r,
            (Value::ObjectId(l), Value::ObjectId(r)) => l == r,
            (Value::Date(l), Value::Date(r)) => l == r,
            (Value::Array(l), Value::Array(r)) => l == r,
            (Value::Object(l), Value::Object(r)) => l == r,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    /// The serialized size of the value itself, excluding the element frame
    /// (type byte, field name, terminator) that carries it inside a document.
    pub fn value_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int64(_) => 8,
            Value::Float64(_) => 8,
            Value::String(s) => 4 + s.len() + 1,
            Value::Binary(b) => 4 + 1 + b.len(),
            Value::ObjectId(_) => 12,
            Value::Date(_) => 8,
            Value::Array(elements) => array_serialized_size(elements),
            Value::Object(d) => d.serialized_size(),
        }
    }

    /// The serialized size of an element carrying this value under `name`:
    /// one type byte, the name with its nul terminator, then the value.
    pub fn element_size(&self, name: &str) -> usize {
        1 + name.len() + 1 + self.value_size()
    }

    fn type_byte(&self) -> u8 {
        match self {
            Value::Float64(_) => 0x01,
            Value::String(_) => 0x02,
            Value::Object(_) => 0x03,
            Value::Array(_) => 0x04,
            Value::Binary(_) => 0x05,
            Value::ObjectId(_) => 0x07,
            Value::Boolean(_) => 0x08,
            Value::Date(_) => 0x09,
            Value::Null => 0x0A,
            Value::Int64(_) => 0x12,
        }
    }

    pub(crate) fn write_element(&self, name: &str, out: &mut Vec<u8>) {
        out.push(self.type_byte());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        self.write_value(out);
    }

    fn write_value(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => (),
            Value::Boolean(b) => out.push(*b as u8),
            Value::Int64(i) => out.extend_from_slice(&i.to_le_bytes()),
            Value::Float64(f) => out.extend_from_slice(&f.to_le_bytes()),
            Value::String(s) => {
                out.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            },
            Value::Binary(b) => {
                out.extend_from_slice(&(b.len() as i32).to_le_bytes());
                out.push(0); // generic subtype
                out.extend_from_slice(b);
            },
            Value::ObjectId(id) => out.extend_from_slice(id.bytes()),
            Value::Date(d) => out.extend_from_slice(&d.timestamp_millis().to_le_bytes()),
            Value::Array(elements) => {
                out.extend_from_slice(&(array_serialized_size(elements) as i32).to_le_bytes());
                for (i, element) in elements.iter().enumerate() {
                    element.write_element(&i.to_string(), out);
                }
                out.push(0);
            },
            Value::Object(d) => d.write_to(out),
        }
    }
}

fn array_serialized_size(elements: &[Value]) -> usize {
    4 + elements
        .iter()
        .enumerate()
        .map(|(i, v)| 1 + index_digits(i) + 1 + v.value_size())
        .sum::<usize>()
        + 1
}

/// Number of decimal digits in an array index used as an element name.
fn index_digits(i: usize) -> usize {
    if i == 0 {
        return 1;
    }
    (i.ilog10() + 1) as usize
}

impl HeapSize for Value {
    fn heap_size(&self) -> usize {
        match self {
            Value::Null
            | Value::Boolean(_)
            | Value::Int64(_)
            | Value::Float64(_)
            | Value::ObjectId(_)
            | Value::Date(_) => 0,
            Value::String(s) => s.heap_size(),
            Value::Binary(b) => b.heap_size(),
            Value::Array(elements) => elements.heap_size(),
            Value::Object(d) => d.heap_size(),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int64(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::ObjectId(id)
    }
}

impl From<Document> for Value {
    fn from(d: Document) -> Self {
        Value::Object(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(elements: Vec<Value>) -> Self {
        Value::Array(elements)
    }
}

/// Millisecond-precision UTC datetime helper; measurement timestamps are
/// milliseconds since the epoch throughout.
pub fn date_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .expect("millisecond timestamp out of chrono's representable range")
}

#[cfg(any(test, feature = "testing"))]
mod proptest {
    use proptest::prelude::*;

    use crate::{
        date_from_millis,
        Document,
        FieldName,
        ObjectId,
        Value,
    };

    impl Arbitrary for Value {
        type Parameters = ();
        type Strategy = BoxedStrategy<Value>;

        fn arbitrary_with(_params: ()) -> Self::Strategy {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::Boolean),
                any::<i64>().prop_map(Value::Int64),
                any::<f64>().prop_map(Value::Float64),
                "[a-zA-Z0-9 _-]{0,12}".prop_map(Value::String),
                prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Binary),
                any::<[u8; 12]>().prop_map(|b| Value::ObjectId(ObjectId::from_bytes(b))),
                (-32_000_000_000_000i64..32_000_000_000_000)
                    .prop_map(|ms| Value::Date(date_from_millis(ms))),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                    prop::collection::btree_map(any::<FieldName>(), inner, 0..4).prop_map(
                        |fields| {
                            let mut d = Document::new();
                            for (name, value) in fields {
                                d.append(name, value);
                            }
                            Value::Object(d)
                        }
                    ),
                ]
            })
            .boxed()
        }
    }

    impl Arbitrary for Document {
        type Parameters = ();
        type Strategy = BoxedStrategy<Document>;

        fn arbitrary_with(_params: ()) -> Self::Strategy {
            prop::collection::btree_map(any::<FieldName>(), any::<Value>(), 0..6)
                .prop_map(|fields| {
                    let mut d = Document::new();
                    for (name, value) in fields {
                        d.append(name, value);
                    }
                    d
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        doc,
        Document,
        Value,
    };

    #[test]
    fn test_empty_object_frame_size() {
        // An element holding an empty object under an empty field name costs
        // exactly 12 bytes, the offset the bucket size model builds on.
        let mut d = Document::new();
        d.append("".parse().unwrap(), Value::Object(Document::new()));
        assert_eq!(d.serialized_size(), 12);
        assert_eq!(d.to_binary().len(), 12);
    }

    #[test]
    fn test_serialized_size_matches_encoding() {
        let d = doc! {
            "t" => 42i64,
            "s" => "hello",
            "nested" => doc! { "a" => 1.5, "b" => false },
            "xs" => vec![Value::from(1i64), Value::from("two")],
        };
        assert_eq!(d.serialized_size(), d.to_binary().len());
    }

    #[test]
    fn test_binary_equality_distinguishes_float_bits() {
        assert_eq!(Value::Float64(1.0), Value::Float64(1.0));
        assert_ne!(Value::Float64(0.0), Value::Float64(-0.0));
    }
}
