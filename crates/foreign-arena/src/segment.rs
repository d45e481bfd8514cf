//! Address-bearing references to foreign-owned memory.

use std::fmt;
use std::ptr::NonNull;

/// A reference to a fixed region of foreign-owned memory.
///
/// A segment is only an address and an optional byte size. It owns nothing:
/// whether the memory behind it is still valid is decided by the arena
/// scope that produced it, never by the segment itself.
///
/// Segments are always `Copy`, so they can be captured by cleanup actions
/// without keeping the owning instance alive.
///
/// # Example
///
/// ```
/// use foreign_arena::MemorySegment;
///
/// let segment = MemorySegment::from_address(0x1000).unwrap();
/// assert_eq!(segment.address(), 0x1000);
/// assert_eq!(segment.byte_size(), None);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemorySegment {
    ptr: NonNull<u8>,
    byte_size: Option<usize>,
}

// The segment is a plain address; access to the memory is governed by the
// arena's confinement rules, not by the type system.
unsafe impl Send for MemorySegment {}
unsafe impl Sync for MemorySegment {}

impl MemorySegment {
    /// Create a sized segment.
    #[inline]
    pub const fn new(ptr: NonNull<u8>, byte_size: usize) -> Self {
        Self {
            ptr,
            byte_size: Some(byte_size),
        }
    }

    /// Create a segment whose extent is not known (aggregate or opaque layouts).
    #[inline]
    pub const fn unsized_at(ptr: NonNull<u8>) -> Self {
        Self {
            ptr,
            byte_size: None,
        }
    }

    /// Create an unsized segment from a raw address returned by a native call.
    ///
    /// Returns `None` for the null address.
    pub fn from_address(address: usize) -> Option<Self> {
        NonNull::new(address as *mut u8).map(Self::unsized_at)
    }

    /// The numeric address of the first byte.
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// The raw pointer to the first byte.
    #[inline]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub const fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The byte size, or `None` for unsized segments.
    #[inline]
    pub const fn byte_size(&self) -> Option<usize> {
        self.byte_size
    }

    /// Returns a copy of this segment with a known byte size.
    #[inline]
    pub const fn with_byte_size(self, byte_size: usize) -> Self {
        Self::new(self.ptr, byte_size)
    }
}

impl fmt::Debug for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.byte_size {
            Some(size) => write!(f, "MemorySegment({:#x}, {} bytes)", self.address(), size),
            None => write!(f, "MemorySegment({:#x}, unsized)", self.address()),
        }
    }
}
