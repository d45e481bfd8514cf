//! Manual reference counting for foreign reference types.
//!
//! Retain and release here are intermediate ownership adjustments. They are
//! independent of the arena: however many pairs are issued, the arena still
//! runs exactly one cleanup action per instance, and that action performs
//! the final release implied by scope exit.

use crate::config::Config;
use crate::descriptor::{HeapWitness, NativeError};
use crate::error::{ArenaError, Result};
use crate::instance::{ForeignInstance, ForeignProxy};
use crate::segment::MemorySegment;

/// Increment the native retain count of a reference-type instance.
pub fn retain<P: ForeignProxy + ?Sized>(proxy: &P) -> Result<()> {
    downcall(proxy.foreign_instance(), "retain", |heap, segment| {
        heap.retain(segment)
    })
}

/// Decrement the native retain count of a reference-type instance.
pub fn release<P: ForeignProxy + ?Sized>(proxy: &P) -> Result<()> {
    downcall(proxy.foreign_instance(), "release", |heap, segment| {
        heap.release(segment)
    })
}

/// Read the native retain count. Diagnostic only; has no side effects.
pub fn retain_count<P: ForeignProxy + ?Sized>(proxy: &P) -> Result<u32> {
    downcall(proxy.foreign_instance(), "retain_count", |heap, segment| {
        heap.retain_count(segment)
    })
}

fn downcall<T>(
    instance: &ForeignInstance,
    entry_point: &'static str,
    call: impl FnOnce(&dyn HeapWitness, MemorySegment) -> Result<T, NativeError>,
) -> Result<T> {
    let segment = instance.segment()?;
    let descriptor = instance.type_descriptor();
    let heap = descriptor
        .heap_witness()
        .ok_or_else(|| ArenaError::NotAReferenceType {
            type_name: descriptor.shared_name(),
        })?;

    if Config::global().trace_downcalls {
        tracing::info!(
            target: "foreign_arena::downcall",
            entry_point,
            type_name = descriptor.name(),
            address = segment.address(),
            instance = %instance.id(),
        );
    }

    call(heap, segment).map_err(|source| ArenaError::Native {
        entry_point,
        type_name: descriptor.shared_name(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::descriptor::{TypeDescriptor, TypeLayout};
    use crate::heap::NativeHeap;
    use std::sync::Arc;

    #[test]
    fn test_retain_release_round_trip() {
        let heap = Arc::new(NativeHeap::new());
        let layout = TypeLayout::of::<[u64; 2]>();
        let desc = TypeDescriptor::reference("Obj", layout, heap.clone());
        let arena = Arena::confined();
        let obj =
            ForeignInstance::new(heap.allocate_object(layout).unwrap(), desc, &arena).unwrap();

        assert_eq!(retain_count(&obj).unwrap(), 1);
        retain(&obj).unwrap();
        assert_eq!(retain_count(&obj).unwrap(), 2);
        release(&obj).unwrap();
        assert_eq!(retain_count(&obj).unwrap(), 1);
    }

    #[test]
    fn test_value_type_is_rejected() {
        let heap = Arc::new(NativeHeap::new());
        let desc = TypeDescriptor::value("Val", TypeLayout::of::<u32>(), heap);
        let arena = Arena::confined();
        let val = ForeignInstance::new(arena.allocate(4, 4).unwrap(), desc, &arena).unwrap();

        assert!(matches!(retain(&val), Err(ArenaError::NotAReferenceType { .. })));
        assert!(matches!(release(&val), Err(ArenaError::NotAReferenceType { .. })));
        assert!(matches!(
            retain_count(&val),
            Err(ArenaError::NotAReferenceType { .. })
        ));
    }

    #[test]
    fn test_native_failure_is_surfaced() {
        let heap = Arc::new(NativeHeap::new());
        let layout = TypeLayout::of::<u64>();
        let desc = TypeDescriptor::reference("Obj", layout, heap.clone());
        let arena = Arena::confined();
        let obj =
            ForeignInstance::new(heap.allocate_object(layout).unwrap(), desc, &arena).unwrap();

        // Dropping the only reference behind the arena's back
        release(&obj).unwrap();
        let err = retain(&obj).unwrap_err();
        assert!(matches!(
            err,
            ArenaError::Native {
                entry_point: "retain",
                ..
            }
        ));

        // The arena's final release now fails too, and is reported.
        let close = arena.close().unwrap_err();
        assert_eq!(close.cleanup_failures().len(), 1);
    }
}
