use std::{
    fmt,
    ops::Deref,
    str::FromStr,
};

use compact_str::CompactString;
use errors::ErrorMetadata;

use crate::heap_size::HeapSize;

/// A document field name.
///
/// Any UTF-8 string without an interior nul is a valid field name, including
/// the empty string. Ordering is byte order of the name, which is what the
/// metadata normalization sorts by.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldName(CompactString);

impl FieldName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FieldName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if s.contains('\0') {
            anyhow::bail!(ErrorMetadata::bad_value(
                "InvalidFieldName",
                format!("Field name {s:?} contains an interior nul byte"),
            ));
        }
        Ok(Self(CompactString::new(s)))
    }
}

impl Deref for FieldName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for FieldName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl HeapSize for FieldName {
    fn heap_size(&self) -> usize {
        if self.0.is_heap_allocated() {
            self.0.capacity()
        } else {
            0
        }
    }
}

#[cfg(any(test, feature = "testing"))]
mod proptest {
    use proptest::prelude::*;

    use super::FieldName;

    impl Arbitrary for FieldName {
        type Parameters = ();
        type Strategy = BoxedStrategy<FieldName>;

        fn arbitrary_with(_params: ()) -> Self::Strategy {
            // Mixed case on purpose: byte order and lexicographic order
            // disagree for these, which is exactly what the normalization
            // tests want to exercise.
            "[a-zA-Z0-9_]{1,8}"
                .prop_map(|s| s.parse().expect("strategy produced nul byte"))
                .boxed()
        }
    }
}
