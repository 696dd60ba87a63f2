use std::{
    fmt,
    str::FromStr,
};

use compact_str::CompactString;
use errors::ErrorMetadata;

use crate::heap_size::HeapSize;

/// A fully qualified collection name, `<db>.<collection>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    db: CompactString,
    coll: CompactString,
}

impl Namespace {
    pub fn new(db: impl AsRef<str>, coll: impl AsRef<str>) -> Self {
        Self {
            db: CompactString::new(db),
            coll: CompactString::new(coll),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// Total length of the qualified name, used for memory approximations.
    pub fn len(&self) -> usize {
        self.db.len() + 1 + self.coll.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty() && self.coll.is_empty()
    }
}

impl FromStr for Namespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let Some((db, coll)) = s.split_once('.') else {
            anyhow::bail!(ErrorMetadata::bad_value(
                "InvalidNamespace",
                format!("Namespace {s:?} is missing a '.' separator"),
            ));
        };
        Ok(Self::new(db, coll))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Namespace({self})")
    }
}

impl HeapSize for Namespace {
    fn heap_size(&self) -> usize {
        let for_str = |s: &CompactString| if s.is_heap_allocated() { s.capacity() } else { 0 };
        for_str(&self.db) + for_str(&self.coll)
    }
}
