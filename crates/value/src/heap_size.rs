//! Approximate heap memory accounting.
//!
//! The catalog keeps a process-wide byte counter to decide when to expire
//! idle buckets, so structures that contribute to a bucket's footprint
//! report the heap they own beyond their inline size. The numbers are
//! approximations: allocator overhead and padding are ignored.

use std::mem::size_of;

use compact_str::CompactString;

pub trait HeapSize {
    fn heap_size(&self) -> usize;
}

macro_rules! impl_heap_size_inline {
    ( $( $t:ty ),* $(,)? ) => {
        $(
            impl HeapSize for $t {
                fn heap_size(&self) -> usize {
                    0
                }
            }
        )*
    };
}

impl_heap_size_inline!((), bool, u8, u32, u64, usize, i32, i64, f64);

impl HeapSize for String {
    fn heap_size(&self) -> usize {
        self.capacity()
    }
}

impl HeapSize for CompactString {
    fn heap_size(&self) -> usize {
        if self.is_heap_allocated() {
            self.capacity()
        } else {
            0
        }
    }
}

impl<T: HeapSize> HeapSize for Option<T> {
    fn heap_size(&self) -> usize {
        self.as_ref().map_or(0, |v| v.heap_size())
    }
}

impl<A: HeapSize, B: HeapSize> HeapSize for (A, B) {
    fn heap_size(&self) -> usize {
        self.0.heap_size() + self.1.heap_size()
    }
}

impl<T: HeapSize> HeapSize for Vec<T> {
    fn heap_size(&self) -> usize {
        self.capacity() * size_of::<T>() + self.iter().map(|v| v.heap_size()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::HeapSize;

    #[test]
    fn test_string_reports_capacity() {
        let s = String::with_capacity(64);
        assert_eq!(s.heap_size(), 64);
    }

    #[test]
    fn test_nested_containers() {
        let v: Vec<Option<String>> = vec![Some(String::with_capacity(8)), None];
        assert!(v.heap_size() >= 8);
    }

    #[test]
    fn test_inline_strings_are_free() {
        let s = compact_str::CompactString::new("short");
        assert_eq!(s.heap_size(), 0);
    }
}
