//! Managed-side proxies of foreign values and objects.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

use crate::arena::{Arena, ArenaId};
use crate::cleanup::{CleanupAction, DestroyFlag};
use crate::descriptor::TypeDescriptor;
use crate::error::{ArenaError, Result};
use crate::segment::MemorySegment;

/// Process-unique identity of a [`ForeignInstance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of an instance. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Live = 0,
    /// A cleanup action has claimed the instance and is running.
    Destroying = 1,
    Destroyed = 2,
}

impl Status {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Status::Live,
            1 => Status::Destroying,
            _ => Status::Destroyed,
        }
    }
}

/// The arena an instance is registered with, fixed at registration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Owner {
    pub(crate) arena: ArenaId,
    /// Owner thread for confined arenas.
    pub(crate) thread: Option<ThreadId>,
}

/// State shared between an instance and its cleanup action.
pub(crate) struct InstanceState {
    id: InstanceId,
    status: AtomicU8,
    owner: OnceLock<Owner>,
}

impl InstanceState {
    fn new() -> Self {
        Self {
            id: InstanceId::next(),
            status: AtomicU8::new(Status::Live as u8),
            owner: OnceLock::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> InstanceId {
        self.id
    }

    #[inline]
    pub(crate) fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::Acquire))
    }

    /// `Live -> Destroying`. Returns false if someone else already claimed it.
    pub(crate) fn claim(&self) -> bool {
        self.status
            .compare_exchange(
                Status::Live as u8,
                Status::Destroying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_destroyed(&self) {
        self.status.store(Status::Destroyed as u8, Ordering::Release);
    }

    pub(crate) fn owner(&self) -> Option<Owner> {
        self.owner.get().copied()
    }

    /// Bind to an arena. Fails with the existing owner if already bound.
    pub(crate) fn bind(&self, owner: Owner) -> std::result::Result<(), Owner> {
        let mut fresh = false;
        let bound = self.owner.get_or_init(|| {
            fresh = true;
            owner
        });
        if fresh { Ok(()) } else { Err(*bound) }
    }
}

/// The base of every managed-side proxy of a foreign value or object.
///
/// An instance owns exactly one [`MemorySegment`] and one [`TypeDescriptor`],
/// and is registered with exactly one [`Arena`] as the last step of its
/// construction. Once the arena destroys it, every accessor that would touch
/// foreign memory fails with [`ArenaError::UseAfterDestroy`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use foreign_arena::{Arena, ArenaError, ForeignInstance, NativeHeap, TypeDescriptor, TypeLayout};
///
/// let heap = Arc::new(NativeHeap::new());
/// let point = TypeDescriptor::value("Point", TypeLayout::of::<[f64; 2]>(), heap);
///
/// let arena = Arena::confined();
/// let storage = arena.allocate(16, 8)?;
/// let p = ForeignInstance::new(storage, point, &arena)?;
/// assert_eq!(p.memory_address()?, storage.address());
///
/// arena.close()?;
/// assert!(matches!(p.memory_address(), Err(ArenaError::UseAfterDestroy { .. })));
/// # Ok::<(), ArenaError>(())
/// ```
pub struct ForeignInstance {
    segment: MemorySegment,
    descriptor: Arc<TypeDescriptor>,
    state: Arc<InstanceState>,
}

impl ForeignInstance {
    /// Construct an instance and register it with `arena`.
    ///
    /// Registration is the final step, so the arena never observes a partially
    /// initialised instance. If the arena rejects it, the segment stays with
    /// the caller.
    pub fn new(
        segment: MemorySegment,
        descriptor: Arc<TypeDescriptor>,
        arena: &Arena,
    ) -> Result<Self> {
        let instance = Self {
            segment,
            descriptor,
            state: Arc::new(InstanceState::new()),
        };

        arena.register(&instance)?;
        Ok(instance)
    }

    #[inline]
    pub fn id(&self) -> InstanceId {
        self.state.id()
    }

    /// The arena this instance is registered with.
    pub fn arena(&self) -> Option<ArenaId> {
        self.state.owner().map(|owner| owner.arena)
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.state.status()
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.status() != Status::Live
    }

    /// Fail unless the instance is live and used from an allowed thread.
    pub fn ensure_alive(&self) -> Result<()> {
        if let Some(Owner {
            arena,
            thread: Some(owner),
        }) = self.state.owner()
        {
            let current = thread::current().id();
            if current != owner {
                return Err(ArenaError::ConfinementViolation {
                    arena,
                    owner,
                    current,
                });
            }
        }

        if self.is_destroyed() {
            return Err(ArenaError::UseAfterDestroy {
                instance: self.id(),
                type_name: self.descriptor.shared_name(),
            });
        }
        Ok(())
    }

    /// The segment backing this instance, i.e. `self` of the foreign value.
    pub fn segment(&self) -> Result<MemorySegment> {
        self.ensure_alive()?;
        Ok(self.segment)
    }

    /// The numeric address of the underlying memory.
    pub fn memory_address(&self) -> Result<usize> {
        self.segment().map(|segment| segment.address())
    }

    /// Always available, even after destruction.
    #[inline]
    pub fn type_descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    /// True for classes and actors, false for trivially-copyable value types.
    #[inline]
    pub fn is_reference_type(&self) -> bool {
        self.descriptor.is_reference_type()
    }

    /// Build the one-shot cleanup action for this instance.
    ///
    /// The action holds the segment, the descriptor and the destroyed flag,
    /// never the instance itself. It can be inspected, but only the arena
    /// the instance is registered with can run it.
    pub fn create_cleanup_action(&self) -> CleanupAction {
        CleanupAction::new(
            self.segment,
            self.descriptor.clone(),
            DestroyFlag::new(self.state.clone()),
        )
    }

    pub(crate) fn state(&self) -> &Arc<InstanceState> {
        &self.state
    }
}

impl fmt::Debug for ForeignInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignInstance")
            .field("id", &self.id())
            .field("type", &self.descriptor.name())
            .field("address", &format_args!("{:#x}", self.segment.address()))
            .field("status", &self.status())
            .finish()
    }
}

/// Implemented by generated wrapper types that embed a [`ForeignInstance`].
///
/// The provided methods forward the instance query contract, so a wrapper
/// only has to say where its instance lives.
pub trait ForeignProxy {
    fn foreign_instance(&self) -> &ForeignInstance;

    fn memory_address(&self) -> Result<usize> {
        self.foreign_instance().memory_address()
    }

    fn type_descriptor(&self) -> &Arc<TypeDescriptor> {
        self.foreign_instance().type_descriptor()
    }

    fn is_reference_type(&self) -> bool {
        self.foreign_instance().is_reference_type()
    }
}

impl ForeignProxy for ForeignInstance {
    #[inline]
    fn foreign_instance(&self) -> &ForeignInstance {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_once() {
        let state = InstanceState::new();
        assert_eq!(state.status(), Status::Live);

        assert!(state.claim());
        assert_eq!(state.status(), Status::Destroying);
        assert!(!state.claim());

        state.mark_destroyed();
        assert_eq!(state.status(), Status::Destroyed);
        assert!(!state.claim());
    }

    #[test]
    fn test_bind_only_once() {
        let state = InstanceState::new();
        let first = ArenaId::next();
        let second = ArenaId::next();

        assert!(
            state
                .bind(Owner {
                    arena: first,
                    thread: None,
                })
                .is_ok()
        );

        let existing = state
            .bind(Owner {
                arena: second,
                thread: None,
            })
            .unwrap_err();
        assert_eq!(existing.arena, first);
        assert_eq!(state.owner().map(|o| o.arena), Some(first));
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = InstanceId::next();
        let b = InstanceId::next();
        assert_ne!(a, b);
        assert_eq!(format!("{}", a), format!("#{}", a.raw()));
    }
}
