//! Error taxonomy for arena and instance operations.

use std::sync::Arc;
use std::thread::ThreadId;

use thiserror::Error;

use crate::arena::ArenaId;
use crate::descriptor::NativeError;
use crate::instance::InstanceId;

/// Result alias used throughout the crate.
pub type Result<T, E = ArenaError> = std::result::Result<T, E>;

/// Errors surfaced by arenas, instances and the retain/release bridge.
///
/// Every variant is fatal to the operation that produced it, not to the
/// arena or to other instances. `ArenaClosed` is the one terminal state:
/// a closed arena never accepts work again.
#[derive(Debug, Error)]
pub enum ArenaError {
    /// The arena was already closed.
    #[error("arena {arena} is closed")]
    ArenaClosed { arena: ArenaId },

    /// A confined arena (or one of its instances) was used off its owner thread.
    #[error("arena {arena} is confined to thread {owner:?} but was used from {current:?}")]
    ConfinementViolation {
        arena: ArenaId,
        owner: ThreadId,
        current: ThreadId,
    },

    /// The instance already belongs to an arena.
    #[error("instance {instance} is already registered with arena {owner}")]
    DoubleRegistration { instance: InstanceId, owner: ArenaId },

    /// The instance was destroyed; its memory must not be touched.
    #[error("instance {instance} of `{type_name}` has been destroyed")]
    UseAfterDestroy {
        instance: InstanceId,
        type_name: Arc<str>,
    },

    /// Retain/release was requested on a value type.
    #[error("`{type_name}` is a value type and is not reference counted")]
    NotAReferenceType { type_name: Arc<str> },

    /// One or more cleanup actions failed while closing an arena.
    ///
    /// Every registered cleanup action was still attempted.
    #[error("{} cleanup action(s) failed while closing arena {arena}", .failures.len())]
    CleanupFailure {
        arena: ArenaId,
        failures: Vec<CleanupError>,
    },

    /// A native entry point reported a failure.
    #[error("native `{entry_point}` failed for `{type_name}`")]
    Native {
        entry_point: &'static str,
        type_name: Arc<str>,
        #[source]
        source: NativeError,
    },

    #[error("invalid allocation layout: size {size}, alignment {alignment}")]
    InvalidLayout { size: usize, alignment: usize },

    #[error("out of memory allocating {size} bytes (alignment {alignment})")]
    AllocationFailed { size: usize, alignment: usize },
}

impl ArenaError {
    /// Returns the individual failures if this is a `CleanupFailure`.
    pub fn cleanup_failures(&self) -> &[CleanupError] {
        match self {
            ArenaError::CleanupFailure { failures, .. } => failures,
            _ => &[],
        }
    }
}

/// A single failed cleanup action, collected into [`ArenaError::CleanupFailure`].
#[derive(Debug, Error)]
#[error("cleanup of instance {instance} (`{type_name}` at {address:#x}) failed")]
pub struct CleanupError {
    pub instance: InstanceId,
    pub type_name: Arc<str>,
    pub address: usize,
    #[source]
    pub source: NativeError,
}
