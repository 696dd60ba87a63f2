//! Canonical cross-type ordering for values.
//!
//! Buckets summarize each field with a running min and max, which requires a
//! total order across every value type that can appear in a measurement.
//! The order first ranks by canonical type, then compares within the type.
//! Numeric types share one rank and compare by magnitude.

use std::cmp::Ordering;

use crate::{
    Document,
    Value,
};

/// String comparison hook for collection collations. The default (absent)
/// comparator is byte order. A collator changes how strings rank against
/// each other but never changes the binary encoding of any value.
pub trait StringComparator: Send + Sync {
    fn compare(&self, a: &str, b: &str) -> Ordering;
}

/// Canonical type ranks. Variant order is the cross-type sort order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CanonicalType {
    Null,
    Number,
    String,
    Object,
    Array,
    Binary,
    ObjectId,
    Boolean,
    Date,
}

impl CanonicalType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => CanonicalType::Null,
            Value::Int64(_) | Value::Float64(_) => CanonicalType::Number,
            Value::String(_) => CanonicalType::String,
            Value::Object(_) => CanonicalType::Object,
            Value::Array(_) => CanonicalType::Array,
            Value::Binary(_) => CanonicalType::Binary,
            Value::ObjectId(_) => CanonicalType::ObjectId,
            Value::Boolean(_) => CanonicalType::Boolean,
            Value::Date(_) => CanonicalType::Date,
        }
    }
}

/// Total order over values under an optional collation.
pub fn cmp_values(a: &Value, b: &Value, collator: Option<&dyn StringComparator>) -> Ordering {
    let (ta, tb) = (CanonicalType::of(a), CanonicalType::of(b));
    if ta != tb {
        return ta.cmp(&tb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Boolean(l), Value::Boolean(r)) => l.cmp(r),
        (Value::Int64(l), Value::Int64(r)) => l.cmp(r),
        (Value::Int64(l), Value::Float64(r)) => cmp_f64(*l as f64, *r),
        (Value::Float64(l), Value::Int64(r)) => cmp_f64(*l, *r as f64),
        (Value::Float64(l), Value::Float64(r)) => cmp_f64(*l, *r),
        (Value::String(l), Value::String(r)) => match collator {
            Some(c) => c.compare(l, r),
            None => l.cmp(r),
        },
        (Value::Binary(l), Value::Binary(r)) => l.len().cmp(&r.len()).then_with(|| l.cmp(r)),
        (Value::ObjectId(l), Value::ObjectId(r)) => l.cmp(r),
        (Value::Date(l), Value::Date(r)) => l.cmp(r),
        (Value::Array(l), Value::Array(r)) => cmp_arrays(l, r, collator),
        (Value::Object(l), Value::Object(r)) => cmp_documents(l, r, collator),
        _ => unreachable!("canonical types matched but value types did not"),
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    // NaN sorts below every other number and equal to itself.
    match a.partial_cmp(&b) {
        Some(ordering) => ordering,
        None => b.is_nan().cmp(&a.is_nan()),
    }
}

fn cmp_arrays(a: &[Value], b: &[Value], collator: Option<&dyn StringComparator>) -> Ordering {
    for (l, r) in a.iter().zip(b.iter()) {
        let ordering = cmp_values(l, r, collator);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

fn cmp_documents(a: &Document, b: &Document, collator: Option<&dyn StringComparator>) -> Ordering {
    for ((name_a, value_a), (name_b, value_b)) in a.iter().zip(b.iter()) {
        let ordering = name_a
            .as_str()
            .cmp(name_b.as_str())
            .then_with(|| cmp_values(value_a, value_b, collator));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{
        cmp_values,
        StringComparator,
    };
    use crate::{
        doc,
        Value,
    };

    #[test]
    fn test_cross_type_rank() {
        let ordered = [
            Value::Null,
            Value::Int64(i64::MAX),
            Value::from("a"),
            Value::Object(doc! {}),
            Value::Array(vec![]),
            Value::Binary(vec![]),
            Value::Boolean(false),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(cmp_values(&pair[0], &pair[1], None), Ordering::Less);
        }
    }

    #[test]
    fn test_mixed_numerics() {
        assert_eq!(
            cmp_values(&Value::Int64(2), &Value::Float64(2.5), None),
            Ordering::Less
        );
        assert_eq!(
            cmp_values(&Value::Float64(2.0), &Value::Int64(2), None),
            Ordering::Equal
        );
        assert_eq!(
            cmp_values(&Value::Float64(f64::NAN), &Value::Int64(i64::MIN), None),
            Ordering::Less
        );
    }

    struct CaseInsensitive;

    impl StringComparator for CaseInsensitive {
        fn compare(&self, a: &str, b: &str) -> Ordering {
            a.to_lowercase().cmp(&b.to_lowercase())
        }
    }

    #[test]
    fn test_collator_applies_to_strings_only() {
        let (a, b) = (Value::from("ABC"), Value::from("abc"));
        assert_eq!(cmp_values(&a, &b, None), Ordering::Less);
        assert_eq!(cmp_values(&a, &b, Some(&CaseInsensitive)), Ordering::Equal);
        // Non-string values ignore the collator.
        assert_eq!(
            cmp_values(&Value::Int64(1), &Value::Int64(2), Some(&CaseInsensitive)),
            Ordering::Less
        );
    }

    #[test]
    fn test_document_order_compares_names_first() {
        let a = doc! { "a" => 1i64 };
        let b = doc! { "b" => 0i64 };
        assert_eq!(
            cmp_values(&Value::Object(a), &Value::Object(b), None),
            Ordering::Less
        );
    }
}
