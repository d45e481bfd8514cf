//! Chunked bump allocation for arena-owned foreign memory.
//!
//! Value-type storage handed to native initialisers is carved out of
//! zero-filled chunks and released all at once when the owning arena closes.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::error::{ArenaError, Result};

/// Alignment of every chunk.
const CHUNK_ALIGN: usize = 16;

struct Chunk {
    ptr: NonNull<u8>,
    layout: Layout,
}

/// Bump allocator over a list of chunks.
///
/// Nothing is freed until [`Region::release_all`] (or drop). The region does
/// not run destructors; that is the cleanup protocol's job.
pub(crate) struct Region {
    chunks: Vec<Chunk>,
    current_offset: usize,
    chunk_size: usize,
}

// Chunks are plain bytes owned by the region; callers serialize access.
unsafe impl Send for Region {}

impl Region {
    /// Create an empty region. The first chunk is allocated lazily.
    pub(crate) fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            current_offset: 0,
            chunk_size,
        }
    }

    /// Allocate zero-filled memory for `layout`.
    pub(crate) fn alloc_raw(&mut self, layout: Layout) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.bump(layout) {
            return Ok(ptr);
        }

        // Need a new chunk
        let failed = || ArenaError::InvalidLayout {
            size: layout.size(),
            alignment: layout.align(),
        };
        let needed = layout.size().checked_add(layout.align()).ok_or_else(failed)?;
        let chunk_layout = Layout::from_size_align(needed.max(self.chunk_size), CHUNK_ALIGN)
            .map_err(|_| failed())?;

        let ptr = unsafe { alloc_zeroed(chunk_layout) };
        let ptr = NonNull::new(ptr).ok_or(ArenaError::AllocationFailed {
            size: chunk_layout.size(),
            alignment: chunk_layout.align(),
        })?;

        self.chunks.push(Chunk {
            ptr,
            layout: chunk_layout,
        });
        self.current_offset = 0;

        self.bump(layout).ok_or_else(failed)
    }

    /// Try to fit `layout` in the current chunk.
    fn bump(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let chunk = self.chunks.last()?;
        let chunk_ptr = chunk.ptr.as_ptr() as usize;

        let current = chunk_ptr.checked_add(self.current_offset)?;
        let aligned = current.checked_add(layout.align() - 1)? & !(layout.align() - 1);
        let next = aligned.checked_add(layout.size())?;
        if next > chunk_ptr + chunk.layout.size() {
            return None;
        }

        self.current_offset = next - chunk_ptr;
        // Stay in the chunk's provenance rather than casting the address back.
        let ptr = unsafe { chunk.ptr.as_ptr().add(aligned - chunk_ptr) };
        NonNull::new(ptr)
    }

    /// Returns the total number of bytes held across all chunks.
    pub(crate) fn total_capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.layout.size()).sum()
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Free every chunk. Segments handed out earlier become dangling.
    pub(crate) fn release_all(&mut self) {
        for chunk in self.chunks.drain(..) {
            unsafe {
                dealloc(chunk.ptr.as_ptr(), chunk.layout);
            }
        }
        self.current_offset = 0;
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(size: usize, align: usize) -> Layout {
        Layout::from_size_align(size, align).unwrap()
    }

    #[test]
    fn test_first_chunk_is_lazy() {
        let mut region = Region::with_chunk_size(1024);
        assert_eq!(region.total_capacity(), 0);

        region.alloc_raw(layout(8, 8)).unwrap();
        assert_eq!(region.total_capacity(), 1024);
        assert_eq!(region.chunk_count(), 1);
    }

    #[test]
    fn test_alignment_requirements() {
        let mut region = Region::with_chunk_size(1024);
        for align in [1, 2, 4, 8, 16, 32, 64] {
            region.alloc_raw(layout(1, 1)).unwrap();
            let ptr = region.alloc_raw(layout(align, align)).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
        }
    }

    #[test]
    fn test_memory_is_zeroed() {
        let mut region = Region::with_chunk_size(256);
        let ptr = region.alloc_raw(layout(32, 8)).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 32) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_multiple_chunks() {
        let mut region = Region::with_chunk_size(64);
        for _ in 0..100 {
            region.alloc_raw(layout(8, 8)).unwrap();
        }
        assert!(region.chunk_count() > 1);
    }

    #[test]
    fn test_large_allocation_gets_dedicated_chunk() {
        let mut region = Region::with_chunk_size(64);
        let ptr = region.alloc_raw(layout(4096, 16)).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 16, 0);
        assert!(region.total_capacity() >= 4096);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let mut region = Region::with_chunk_size(128);
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for i in 1..50 {
            let size = (i % 7) + 1;
            let ptr = region.alloc_raw(layout(size, 1)).unwrap().as_ptr() as usize;
            for (start, end) in &spans {
                assert!(ptr >= *end || ptr + size <= *start);
            }
            spans.push((ptr, ptr + size));
        }
    }

    #[test]
    fn test_release_all_frees_chunks() {
        let mut region = Region::with_chunk_size(64);
        region.alloc_raw(layout(8, 8)).unwrap();
        region.release_all();
        assert_eq!(region.total_capacity(), 0);
        assert_eq!(region.chunk_count(), 0);
    }
}
