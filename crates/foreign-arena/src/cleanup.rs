//! One-shot destruction units driven by an arena at close.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::trace;

use crate::config::Config;
use crate::descriptor::{NativeError, TypeDescriptor};
use crate::error::CleanupError;
use crate::instance::{InstanceId, InstanceState};
use crate::segment::MemorySegment;

/// Handle on an instance's destroyed flag.
///
/// This is the only piece of instance state a cleanup action keeps, so an
/// instance and its arena can be dropped independently.
#[derive(Clone)]
pub struct DestroyFlag {
    state: Arc<InstanceState>,
}

impl DestroyFlag {
    pub(crate) fn new(state: Arc<InstanceState>) -> Self {
        Self { state }
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.state.id()
    }

    fn claim(&self) -> bool {
        self.state.claim()
    }

    fn mark_destroyed(&self) {
        self.state.mark_destroyed();
    }
}

/// What running a [`CleanupAction`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The native teardown ran.
    Destroyed,
    /// Another action already destroyed the instance; nothing was done.
    AlreadyDestroyed,
}

/// Everything needed to destroy one instance, detached from the instance.
///
/// Only the owning arena runs actions, on its own close path, so native
/// teardown always happens under the arena's confinement. Running consumes
/// the action, so a single action cannot fire twice. If more than one action
/// was created for the same instance, only the first to run destroys it; the
/// others end in [`CleanupOutcome::AlreadyDestroyed`] without calling into
/// the native runtime.
///
/// ```compile_fail
/// use std::sync::Arc;
/// use foreign_arena::{Arena, ForeignInstance, NativeHeap, TypeDescriptor, TypeLayout};
///
/// let heap = Arc::new(NativeHeap::new());
/// let layout = TypeLayout::of::<u64>();
/// let class = TypeDescriptor::reference("Node", layout, heap.clone());
/// let arena = Arena::confined();
/// let node = ForeignInstance::new(heap.allocate_object(layout).unwrap(), class, &arena).unwrap();
///
/// node.create_cleanup_action().run();
/// ```
#[must_use = "a cleanup action does nothing unless it is run"]
pub struct CleanupAction {
    segment: MemorySegment,
    descriptor: Arc<TypeDescriptor>,
    flag: DestroyFlag,
}

impl CleanupAction {
    pub(crate) fn new(
        segment: MemorySegment,
        descriptor: Arc<TypeDescriptor>,
        flag: DestroyFlag,
    ) -> Self {
        Self {
            segment,
            descriptor,
            flag,
        }
    }

    #[inline]
    pub fn instance(&self) -> InstanceId {
        self.flag.instance()
    }

    /// Destroy the instance.
    ///
    /// Reference types get their final `release`; value types are destroyed
    /// in place. The flag ends up destroyed even if the native call fails:
    /// the memory is in an unknown state and must not be retried.
    pub(crate) fn run(self) -> Result<CleanupOutcome, CleanupError> {
        if !self.flag.claim() {
            trace!(instance = %self.instance(), "instance already destroyed, skipping");
            return Ok(CleanupOutcome::AlreadyDestroyed);
        }

        let result = self.teardown();
        self.flag.mark_destroyed();

        result
            .map(|()| CleanupOutcome::Destroyed)
            .map_err(|source| CleanupError {
                instance: self.instance(),
                type_name: self.descriptor.shared_name(),
                address: self.segment.address(),
                source,
            })
    }

    fn teardown(&self) -> Result<(), NativeError> {
        let entry_point = match self.descriptor.heap_witness() {
            Some(_) => "release",
            None => "destroy",
        };
        if Config::global().trace_downcalls {
            tracing::info!(
                target: "foreign_arena::downcall",
                entry_point,
                type_name = self.descriptor.name(),
                address = self.segment.address(),
                "cleanup"
            );
        }

        // A panicking destructor must not abandon the remaining cleanups.
        panic::catch_unwind(AssertUnwindSafe(|| match self.descriptor.heap_witness() {
            Some(heap) => heap.release(self.segment),
            None => self.descriptor.destroy(self.segment),
        }))
        .unwrap_or_else(|_| Err(NativeError::new(format!("native `{entry_point}` panicked"))))
    }
}

impl fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupAction")
            .field("instance", &self.instance())
            .field("type", &self.descriptor.name())
            .field("segment", &self.segment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::descriptor::TypeLayout;
    use crate::heap::NativeHeap;
    use crate::instance::{ForeignInstance, Status};

    #[test]
    fn test_second_action_is_a_noop() {
        let heap = Arc::new(NativeHeap::new());
        let desc = TypeDescriptor::value("Pair", TypeLayout::of::<[u32; 2]>(), heap.clone());
        let arena = Arena::confined();
        let segment = arena.allocate(8, 4).unwrap();
        let instance = ForeignInstance::new(segment, desc, &arena).unwrap();

        let first = instance.create_cleanup_action();
        let second = instance.create_cleanup_action();

        assert_eq!(first.run().unwrap(), CleanupOutcome::Destroyed);
        assert_eq!(instance.status(), Status::Destroyed);
        assert_eq!(second.run().unwrap(), CleanupOutcome::AlreadyDestroyed);
        assert_eq!(heap.teardown_log(), vec![segment.address()]);
    }

    #[test]
    fn test_reference_type_gets_final_release() {
        let heap = Arc::new(NativeHeap::new());
        let layout = TypeLayout::of::<[u64; 2]>();
        let desc = TypeDescriptor::reference("Node", layout, heap.clone());
        let arena = Arena::confined();
        let segment = heap.allocate_object(layout).unwrap();
        let instance = ForeignInstance::new(segment, desc, &arena).unwrap();

        assert_eq!(heap.live_objects(), 1);
        assert_eq!(
            instance.create_cleanup_action().run().unwrap(),
            CleanupOutcome::Destroyed
        );
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn test_failed_teardown_still_marks_destroyed() {
        let heap = Arc::new(NativeHeap::new());
        let desc = TypeDescriptor::value("Broken", TypeLayout::of::<u64>(), heap.clone());
        let arena = Arena::confined();
        let segment = arena.allocate(8, 8).unwrap();
        let instance = ForeignInstance::new(segment, desc, &arena).unwrap();
        heap.fail_teardown_of(segment.address());

        let err = instance.create_cleanup_action().run().unwrap_err();
        assert_eq!(err.instance, instance.id());
        assert_eq!(err.address, segment.address());
        assert!(instance.is_destroyed());
    }
}
