//! An in-process native runtime.
//!
//! `NativeHeap` implements the destroy and reference-counting entry points
//! over memory it allocates itself. Hosts can use it to expose Rust-owned
//! storage through the same lifecycle contract as real foreign objects, and
//! it records enough about teardown to make arena behaviour observable.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::descriptor::{HeapWitness, NativeError, TypeLayout, ValueWitness};
use crate::error::{ArenaError, Result};
use crate::segment::MemorySegment;

struct HeapObject {
    ptr: NonNull<u8>,
    layout: Layout,
    retain_count: u32,
}

// Owned allocation; only touched under the heap lock.
unsafe impl Send for HeapObject {}

impl HeapObject {
    fn free(self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[derive(Default)]
struct HeapState {
    objects: HashMap<usize, HeapObject>,
    teardown_log: Vec<usize>,
    failing: HashSet<usize>,
}

/// Reference-counted heap objects plus in-place value destruction.
///
/// # Example
///
/// ```
/// use foreign_arena::{NativeHeap, TypeLayout, HeapWitness};
///
/// let heap = NativeHeap::new();
/// let obj = heap.allocate_object(TypeLayout::of::<u64>()).unwrap();
/// heap.retain(obj).unwrap();
/// assert_eq!(heap.retain_count(obj).unwrap(), 2);
///
/// heap.release(obj).unwrap();
/// heap.release(obj).unwrap(); // deinit
/// assert_eq!(heap.live_objects(), 0);
/// ```
#[derive(Default)]
pub struct NativeHeap {
    state: Mutex<HeapState>,
}

impl NativeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zero-filled object with a retain count of one.
    pub fn allocate_object(&self, layout: TypeLayout) -> Result<MemorySegment> {
        let invalid = || ArenaError::InvalidLayout {
            size: layout.size,
            alignment: layout.alignment,
        };
        // Zero-sized objects still need a unique address.
        let alloc_layout =
            Layout::from_size_align(layout.size.max(1), layout.alignment).map_err(|_| invalid())?;

        let ptr = unsafe { alloc_zeroed(alloc_layout) };
        let ptr = NonNull::new(ptr).ok_or(ArenaError::AllocationFailed {
            size: alloc_layout.size(),
            alignment: alloc_layout.align(),
        })?;

        let segment = MemorySegment::new(ptr, layout.size);
        self.state.lock().objects.insert(
            segment.address(),
            HeapObject {
                ptr,
                layout: alloc_layout,
                retain_count: 1,
            },
        );
        trace!(address = segment.address(), "heap object allocated");
        Ok(segment)
    }

    /// Number of objects not yet deinitialised.
    pub fn live_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Addresses of every value destroyed and object deinitialised, in order.
    pub fn teardown_log(&self) -> Vec<usize> {
        self.state.lock().teardown_log.clone()
    }

    /// Make the next teardown of `address` fail.
    ///
    /// For objects this is the release that would deinitialise it; the object
    /// then stays allocated.
    pub fn fail_teardown_of(&self, address: usize) {
        self.state.lock().failing.insert(address);
    }
}

fn unknown(address: usize) -> NativeError {
    NativeError::new(format!("no live heap object at {address:#x}"))
}

fn injected(address: usize) -> NativeError {
    NativeError::new(format!("teardown of {address:#x} failed"))
}

impl ValueWitness for NativeHeap {
    fn destroy(&self, segment: MemorySegment) -> Result<(), NativeError> {
        let address = segment.address();
        let mut state = self.state.lock();
        if state.failing.remove(&address) {
            return Err(injected(address));
        }

        // Destroying an object deinitialises it regardless of its count.
        if let Some(object) = state.objects.remove(&address) {
            object.free();
        }
        state.teardown_log.push(address);
        trace!(address, "destroyed");
        Ok(())
    }
}

impl HeapWitness for NativeHeap {
    fn retain(&self, segment: MemorySegment) -> Result<(), NativeError> {
        let address = segment.address();
        let mut state = self.state.lock();
        let object = state.objects.get_mut(&address).ok_or_else(|| unknown(address))?;
        object.retain_count = object
            .retain_count
            .checked_add(1)
            .ok_or_else(|| NativeError::new("retain count overflow"))?;
        Ok(())
    }

    fn release(&self, segment: MemorySegment) -> Result<(), NativeError> {
        let address = segment.address();
        let mut state = self.state.lock();
        let object = state.objects.get_mut(&address).ok_or_else(|| unknown(address))?;

        if object.retain_count > 1 {
            object.retain_count -= 1;
            return Ok(());
        }

        if state.failing.remove(&address) {
            return Err(injected(address));
        }
        if let Some(object) = state.objects.remove(&address) {
            object.free();
        }
        state.teardown_log.push(address);
        trace!(address, "heap object deinitialised");
        Ok(())
    }

    fn retain_count(&self, segment: MemorySegment) -> Result<u32, NativeError> {
        let address = segment.address();
        self.state
            .lock()
            .objects
            .get(&address)
            .map(|object| object.retain_count)
            .ok_or_else(|| unknown(address))
    }
}

impl Drop for NativeHeap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.objects.is_empty() {
            warn!(leaked = state.objects.len(), "native heap dropped with live objects");
        }
        for (_, object) in state.objects.drain() {
            object.free();
        }
    }
}

impl fmt::Debug for NativeHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NativeHeap")
            .field("live_objects", &state.objects.len())
            .field("teardowns", &state.teardown_log.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_release() {
        let heap = NativeHeap::new();
        let obj = heap.allocate_object(TypeLayout::of::<[u8; 24]>()).unwrap();
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.retain_count(obj).unwrap(), 1);

        heap.release(obj).unwrap();
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.teardown_log(), vec![obj.address()]);
    }

    #[test]
    fn test_over_release_fails() {
        let heap = NativeHeap::new();
        let obj = heap.allocate_object(TypeLayout::of::<u32>()).unwrap();
        heap.release(obj).unwrap();

        assert!(heap.release(obj).is_err());
        assert!(heap.retain(obj).is_err());
        assert!(heap.retain_count(obj).is_err());
    }

    #[test]
    fn test_zero_sized_objects_are_distinct() {
        let heap = NativeHeap::new();
        let a = heap.allocate_object(TypeLayout::of::<()>()).unwrap();
        let b = heap.allocate_object(TypeLayout::of::<()>()).unwrap();
        assert_ne!(a.address(), b.address());
        assert_eq!(a.byte_size(), Some(0));
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let heap = NativeHeap::new();
        let obj = heap.allocate_object(TypeLayout::of::<u64>()).unwrap();
        heap.fail_teardown_of(obj.address());

        assert!(heap.release(obj).is_err());
        assert_eq!(heap.live_objects(), 1);

        heap.release(obj).unwrap();
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_intermediate_release_ignores_injected_failure() {
        let heap = NativeHeap::new();
        let obj = heap.allocate_object(TypeLayout::of::<u64>()).unwrap();
        heap.retain(obj).unwrap();
        heap.fail_teardown_of(obj.address());

        heap.release(obj).unwrap();
        assert_eq!(heap.retain_count(obj).unwrap(), 1);
        assert!(heap.release(obj).is_err());
    }

    #[test]
    fn test_destroy_value_records_teardown() {
        let heap = NativeHeap::new();
        let value = MemorySegment::from_address(0x4000).unwrap();
        heap.destroy(value).unwrap();
        assert_eq!(heap.teardown_log(), vec![0x4000]);
        assert_eq!(heap.live_objects(), 0);
    }
}
