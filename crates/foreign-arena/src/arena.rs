//! Scopes that own foreign instances and destroy them deterministically.

use std::alloc::Layout;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::cleanup::CleanupAction;
use crate::config::Config;
use crate::error::{ArenaError, Result};
use crate::instance::{ForeignProxy, Owner};
use crate::region::Region;
use crate::segment::MemorySegment;

/// Process-unique identity of an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaId(u64);

impl ArenaId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which threads may use an arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confinement {
    /// Only the thread that created the arena.
    Confined,
    /// Any thread; close is serialized against registration.
    Shared,
}

struct ArenaState {
    open: bool,
    /// Cleanup actions in registration order.
    registry: Vec<CleanupAction>,
    region: Region,
}

/// A scope owning a set of foreign instances.
///
/// Every instance registered with an arena is destroyed exactly once when the
/// arena closes, last-registered first. Closing happens explicitly through
/// [`Arena::close`] or implicitly when the arena is dropped, so foreign memory
/// is released on every exit path of the scope.
///
/// Arenas also hand out zero-filled scratch memory ([`Arena::allocate`]) for
/// value storage; it is freed after all cleanups have run.
///
/// An arena is `Sync` but not `Send`: other threads may borrow a shared
/// arena, but every arena is closed and dropped on the thread that created
/// it, so a confined arena's scoped exit always runs on its owner thread.
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<foreign_arena::Arena>();
/// ```
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use foreign_arena::{
///     Arena, ArenaError, ForeignInstance, NativeHeap, TypeDescriptor, TypeLayout, release, retain,
/// };
///
/// let heap = Arc::new(NativeHeap::new());
/// let layout = TypeLayout::of::<[u64; 3]>();
/// let class = TypeDescriptor::reference("MySwiftClass", layout, heap.clone());
///
/// {
///     let arena = Arena::confined();
///     let obj = ForeignInstance::new(heap.allocate_object(layout)?, class, &arena)?;
///     retain(&obj)?;
///     release(&obj)?;
/// } // obj's final release happens here
///
/// assert_eq!(heap.live_objects(), 0);
/// # Ok::<(), ArenaError>(())
/// ```
pub struct Arena {
    id: ArenaId,
    confinement: Confinement,
    owner: Option<ThreadId>,
    state: Mutex<ArenaState>,
    _not_send: PhantomData<*const ()>,
}

// All mutable state is behind the mutex; only moving the arena is ruled out.
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an open arena using the process-wide [`Config`].
    pub fn new(confinement: Confinement) -> Self {
        Self::with_config(confinement, Config::global())
    }

    pub fn with_config(confinement: Confinement, config: &Config) -> Self {
        let owner = match confinement {
            Confinement::Confined => Some(thread::current().id()),
            Confinement::Shared => None,
        };
        let arena = Self {
            id: ArenaId::next(),
            confinement,
            owner,
            state: Mutex::new(ArenaState {
                open: true,
                registry: Vec::new(),
                region: Region::with_chunk_size(config.chunk_size),
            }),
            _not_send: PhantomData,
        };
        debug!(arena = %arena.id, ?confinement, "arena opened");
        arena
    }

    /// An arena confined to the current thread.
    pub fn confined() -> Self {
        Self::new(Confinement::Confined)
    }

    /// An arena usable from any thread.
    pub fn shared() -> Self {
        Self::new(Confinement::Shared)
    }

    /// Run `f` inside a fresh arena and close it afterwards, even if `f` fails.
    ///
    /// An error from `f` takes precedence over a close failure, which is then
    /// only logged.
    pub fn scoped<R, E>(
        confinement: Confinement,
        f: impl FnOnce(&Arena) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<ArenaError>,
    {
        let arena = Arena::new(confinement);
        let result = f(&arena);
        let closed = if arena.is_open() { arena.close() } else { Ok(()) };

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                warn!(arena = %arena.id, error = %close_err, "close failed after scope error");
                Err(err)
            }
        }
    }

    #[inline]
    pub fn id(&self) -> ArenaId {
        self.id
    }

    #[inline]
    pub fn confinement(&self) -> Confinement {
        self.confinement
    }

    /// The owning thread of a confined arena.
    #[inline]
    pub fn owner_thread(&self) -> Option<ThreadId> {
        self.owner
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Number of registered instances (zero once closed).
    pub fn len(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of scratch memory currently held by this arena.
    pub fn allocated_bytes(&self) -> usize {
        self.state.lock().region.total_capacity()
    }

    /// Fail with [`ArenaError::ConfinementViolation`] when called off the
    /// owner thread of a confined arena. Always succeeds for shared arenas.
    pub fn check_confinement(&self) -> Result<()> {
        match self.owner {
            Some(owner) => {
                let current = thread::current().id();
                if current == owner {
                    Ok(())
                } else {
                    Err(ArenaError::ConfinementViolation {
                        arena: self.id,
                        owner,
                        current,
                    })
                }
            }
            None => Ok(()),
        }
    }

    fn closed(&self) -> ArenaError {
        ArenaError::ArenaClosed { arena: self.id }
    }

    /// Register an instance so it is destroyed when this arena closes.
    ///
    /// An instance belongs to exactly one arena: registering it a second
    /// time, here or with any other arena, fails with
    /// [`ArenaError::DoubleRegistration`].
    pub fn register<P: ForeignProxy + ?Sized>(&self, proxy: &P) -> Result<()> {
        let instance = proxy.foreign_instance();
        self.check_confinement()?;
        if instance.is_destroyed() {
            return Err(ArenaError::UseAfterDestroy {
                instance: instance.id(),
                type_name: instance.type_descriptor().shared_name(),
            });
        }

        let mut state = self.state.lock();
        if !state.open {
            return Err(self.closed());
        }

        let owner = Owner {
            arena: self.id,
            thread: self.owner,
        };
        instance
            .state()
            .bind(owner)
            .map_err(|existing| ArenaError::DoubleRegistration {
                instance: instance.id(),
                owner: existing.arena,
            })?;

        state.registry.push(instance.create_cleanup_action());
        trace!(
            arena = %self.id,
            instance = %instance.id(),
            type_name = instance.type_descriptor().name(),
            "registered instance"
        );
        Ok(())
    }

    /// Allocate zero-filled memory owned by this arena.
    pub fn allocate(&self, byte_size: usize, alignment: usize) -> Result<MemorySegment> {
        let layout =
            Layout::from_size_align(byte_size, alignment).map_err(|_| ArenaError::InvalidLayout {
                size: byte_size,
                alignment,
            })?;
        self.allocate_layout(layout)
    }

    pub fn allocate_layout(&self, layout: Layout) -> Result<MemorySegment> {
        self.check_confinement()?;

        let mut state = self.state.lock();
        if !state.open {
            return Err(self.closed());
        }
        let ptr = state.region.alloc_raw(layout)?;
        Ok(MemorySegment::new(ptr, layout.size()))
    }

    /// Close the arena, destroying every registered instance.
    ///
    /// Cleanup actions run last-registered first. A failing action does not
    /// stop the others; all failures are returned together as
    /// [`ArenaError::CleanupFailure`]. Either way the arena is closed for
    /// good: calling `close` again fails with [`ArenaError::ArenaClosed`] and
    /// destroys nothing.
    pub fn close(&self) -> Result<()> {
        self.check_confinement()?;

        let actions = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(self.closed());
            }
            state.open = false;
            std::mem::take(&mut state.registry)
        };

        // Native code runs without the lock held.
        let registered = actions.len();
        let mut failures = Vec::new();
        for action in actions.into_iter().rev() {
            let instance = action.instance();
            match action.run() {
                Ok(outcome) => {
                    trace!(arena = %self.id, instance = %instance, ?outcome, "cleanup ran")
                }
                Err(err) => {
                    warn!(arena = %self.id, instance = %instance, error = %err, "cleanup failed");
                    failures.push(err);
                }
            }
        }

        let chunks = {
            let mut state = self.state.lock();
            let chunks = state.region.chunk_count();
            state.region.release_all();
            chunks
        };
        debug!(
            arena = %self.id,
            instances = registered,
            chunks,
            failures = failures.len(),
            "arena closed"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ArenaError::CleanupFailure {
                arena: self.id,
                failures,
            })
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.state.get_mut().open {
            return;
        }
        if let Err(err) = self.close() {
            error!(arena = %self.id, error = %err, "failed to close arena on drop");
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("confinement", &self.confinement)
            .field("open", &state.open)
            .field("registered", &state.registry.len())
            .finish()
    }
}
