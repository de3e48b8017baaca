//! Provides the immutable byte container which is stored in caches.
//!
//! Cached values are shared between the owning cache, local callers and the peer server. To make
//! this safe, a value is wrapped into a [ByteView] which is created from a defensive copy of the
//! source buffer and never mutated afterwards. Handing out the raw bytes again also always yields
//! a copy, therefore no caller can ever alias or modify cached storage.
//!
//! The [ByteSize] trait is the single capability a cache needs from its values: reporting their
//! byte weight. This is what makes the eviction store generic without resorting to any runtime
//! type inspection.
use bytes::Bytes;

/// Reports the number of bytes a value occupies.
///
/// The reported weight is used for the capacity accounting of the eviction store. Note that this
/// should represent the "largest" part of an instance (e.g. for a string the bytes allocated on
/// the heap) - internal bookkeeping fields can be ignored.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Wraps an immutable sequence of bytes to be stored in a cache.
///
/// A **ByteView** is constructed by copying the given source buffer and is never modified after
/// construction. Cloning a view is cheap as the underlying buffer is shared, which permits the
/// cache to hand out values without duplicating their contents.
///
/// # Examples
/// ```
/// # use ganymede::value::{ByteSize, ByteView};
/// let view = ByteView::new(b"169.5");
///
/// assert_eq!(view.len(), 5);
/// assert_eq!(view.allocated_size(), 5);
/// assert_eq!(view.byte_slice(), b"169.5".to_vec());
/// assert_eq!(view.to_string(), "169.5");
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ByteView {
    data: Bytes,
}

impl ByteView {
    /// Creates a new view by copying the given bytes.
    ///
    /// The source buffer remains untouched and can be modified or dropped by the caller without
    /// affecting the cached value.
    pub fn new(source: &[u8]) -> Self {
        ByteView {
            data: Bytes::copy_from_slice(source),
        }
    }

    /// Returns the number of bytes being stored.
    ///
    /// This is also the weight used for the capacity accounting of the owning cache.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Determines if the view contains no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns a copy of the stored bytes.
    ///
    /// A fresh copy is created on every call so that no caller can mutate cached state through
    /// the returned buffer.
    pub fn byte_slice(&self) -> Vec<u8> {
        self.data.to_vec()
    }
}

impl ByteSize for ByteView {
    fn allocated_size(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Display for ByteView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use crate::value::ByteView;

    #[test]
    fn views_copy_their_source() {
        let mut source = b"initial".to_vec();
        let view = ByteView::new(&source);

        // Mutating the source after construction must not shine through...
        source[0] = b'X';
        assert_eq!(view.byte_slice(), b"initial".to_vec());
    }

    #[test]
    fn byte_slices_are_independent_copies() {
        let view = ByteView::new(b"cached");

        let mut first = view.byte_slice();
        first[0] = b'X';

        // ...the cached bytes remain as they were.
        assert_eq!(view.byte_slice(), b"cached".to_vec());
        assert_eq!(view.to_string(), "cached");
    }

    #[test]
    fn clones_share_contents() {
        let view = ByteView::new(b"shared");
        let clone = view.clone();

        assert_eq!(view, clone);
        assert_eq!(clone.len(), 6);
    }
}
