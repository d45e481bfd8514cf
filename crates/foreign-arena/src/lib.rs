//! # Foreign-Arena
//!
//! Deterministic lifetime management for values and objects owned by a
//! native runtime.
//!
//! Foreign memory is invisible to any collector on the managed side, so it is
//! released through explicit scopes instead: every foreign value is proxied
//! by a [`ForeignInstance`] registered with exactly one [`Arena`], and the
//! arena destroys all of its instances, exactly once and last-registered
//! first, when it closes.
//!
//! ## Features
//!
//! - **Confined and shared arenas**: single-thread arenas check the owner
//!   thread on every entry point; shared arenas serialize close against
//!   registration
//! - **Exactly-once destruction**: detached one-shot [`CleanupAction`]s,
//!   failures aggregated instead of aborting teardown
//! - **Retain/release bridge**: manual reference counting for foreign
//!   classes, independent of the arena's final release
//! - **Arena allocation**: zero-filled scratch memory for value storage,
//!   freed after the values are destroyed
//! - **In-process runtime**: [`NativeHeap`] implements the native entry
//!   points over Rust-allocated memory
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use foreign_arena::{Arena, ArenaError, ForeignInstance, NativeHeap, TypeDescriptor, TypeLayout};
//! use foreign_arena::{retain, retain_count, release};
//!
//! let heap = Arc::new(NativeHeap::new());
//! let layout = TypeLayout::of::<[u64; 2]>();
//! let class = TypeDescriptor::reference("MyClass", layout, heap.clone());
//!
//! let arena = Arena::confined();
//! let obj = ForeignInstance::new(heap.allocate_object(layout)?, class, &arena)?;
//!
//! retain(&obj)?;
//! assert_eq!(retain_count(&obj)?, 2);
//! release(&obj)?;
//!
//! arena.close()?; // final release
//! assert!(obj.memory_address().is_err());
//! # Ok::<(), ArenaError>(())
//! ```

mod arena;
mod bridge;
mod cleanup;
mod config;
mod descriptor;
mod error;
mod heap;
mod instance;
mod region;
mod segment;

pub use arena::{Arena, ArenaId, Confinement};
pub use bridge::{release, retain, retain_count};
pub use cleanup::{CleanupAction, CleanupOutcome, DestroyFlag};
pub use config::{
    CHUNK_SIZE_VAR, Config, ConfigError, DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE, TRACE_DOWNCALLS_VAR,
};
pub use descriptor::{HeapWitness, NativeError, TypeDescriptor, TypeLayout, TypeToken, ValueWitness};
pub use error::{ArenaError, CleanupError, Result};
pub use heap::NativeHeap;
pub use instance::{ForeignInstance, ForeignProxy, InstanceId, Status};
pub use segment::MemorySegment;
