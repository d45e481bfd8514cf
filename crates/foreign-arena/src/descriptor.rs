//! Foreign type metadata and the native entry points attached to it.
//!
//! A [`TypeDescriptor`] is resolved once per foreign type and then shared by
//! every instance of that type. It tells the cleanup protocol and the
//! retain/release bridge which native functions to call, so nothing is
//! re-resolved per call.

use std::alloc::Layout;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::segment::MemorySegment;

/// Failure reported by a native entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NativeError {
    message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Native destruction entry point, present for every foreign type.
pub trait ValueWitness: Send + Sync {
    /// Run the type's destructor on the value stored at `segment`.
    ///
    /// The memory itself stays with whoever allocated it.
    fn destroy(&self, segment: MemorySegment) -> Result<(), NativeError>;
}

/// Native reference-counting entry points, present only for reference types.
pub trait HeapWitness: ValueWitness {
    /// Increment the native retain count.
    fn retain(&self, segment: MemorySegment) -> Result<(), NativeError>;

    /// Decrement the native retain count, deinitialising the object at zero.
    fn release(&self, segment: MemorySegment) -> Result<(), NativeError>;

    /// Read the native retain count. Must not have side effects.
    fn retain_count(&self, segment: MemorySegment) -> Result<u32, NativeError>;
}

/// Stable identity of a foreign type.
///
/// Native layers typically use the address of the runtime's type metadata;
/// descriptors built without one get a process-unique token.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeToken(u64);

impl TypeToken {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    fn fresh() -> Self {
        // High bit keeps minted tokens apart from metadata addresses.
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed) | (1 << 63))
    }
}

impl fmt::Debug for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeToken({:#x})", self.0)
    }
}

/// Size and layout tag of a foreign type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeLayout {
    pub size: usize,
    pub alignment: usize,
    pub stride: usize,
}

impl TypeLayout {
    /// Layout with the stride derived from size and alignment.
    ///
    /// Returns `None` if `alignment` is not a power of two.
    pub fn new(size: usize, alignment: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size, alignment).ok()?;
        Some(Self {
            size,
            alignment,
            stride: layout.pad_to_align().size().max(1),
        })
    }

    pub fn of<T>() -> Self {
        Self {
            size: size_of::<T>(),
            alignment: align_of::<T>(),
            stride: size_of::<T>().max(1),
        }
    }

    /// The allocation layout for one value.
    pub fn to_layout(self) -> Option<Layout> {
        Layout::from_size_align(self.size, self.alignment).ok()
    }
}

#[derive(Clone)]
enum Witness {
    Value(Arc<dyn ValueWitness>),
    Heap(Arc<dyn HeapWitness>),
}

/// Foreign type metadata shared by all instances of one type.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use foreign_arena::{NativeHeap, TypeDescriptor, TypeLayout};
///
/// let heap = Arc::new(NativeHeap::new());
/// let point = TypeDescriptor::value("Point", TypeLayout::of::<[f64; 2]>(), heap.clone());
/// let class = TypeDescriptor::reference("MyClass", TypeLayout::of::<[u64; 4]>(), heap);
///
/// assert!(!point.is_reference_type());
/// assert!(class.is_reference_type());
/// ```
pub struct TypeDescriptor {
    token: TypeToken,
    name: Arc<str>,
    layout: TypeLayout,
    witness: Witness,
}

impl TypeDescriptor {
    /// Descriptor for a value type: destroyed once, never reference counted.
    pub fn value(
        name: impl Into<Arc<str>>,
        layout: TypeLayout,
        witness: Arc<dyn ValueWitness>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: TypeToken::fresh(),
            name: name.into(),
            layout,
            witness: Witness::Value(witness),
        })
    }

    /// Descriptor for a reference type (class or actor).
    pub fn reference(
        name: impl Into<Arc<str>>,
        layout: TypeLayout,
        witness: Arc<dyn HeapWitness>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: TypeToken::fresh(),
            name: name.into(),
            layout,
            witness: Witness::Heap(witness),
        })
    }

    /// Same descriptor, identified by a token supplied by the native layer.
    pub fn with_token(self: Arc<Self>, token: TypeToken) -> Arc<Self> {
        Arc::new(Self {
            token,
            name: self.name.clone(),
            layout: self.layout,
            witness: self.witness.clone(),
        })
    }

    #[inline]
    pub fn token(&self) -> TypeToken {
        self.token
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    #[inline]
    pub fn layout(&self) -> TypeLayout {
        self.layout
    }

    /// True for classes and actors, false for value types.
    #[inline]
    pub fn is_reference_type(&self) -> bool {
        matches!(self.witness, Witness::Heap(_))
    }

    /// Reference-counting entry points, `None` for value types.
    pub fn heap_witness(&self) -> Option<&dyn HeapWitness> {
        match &self.witness {
            Witness::Heap(heap) => Some(heap.as_ref()),
            Witness::Value(_) => None,
        }
    }

    /// Run the type's destructor.
    pub(crate) fn destroy(&self, segment: MemorySegment) -> Result<(), NativeError> {
        match &self.witness {
            Witness::Value(value) => value.destroy(segment),
            Witness::Heap(heap) => heap.destroy(segment),
        }
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("layout", &self.layout)
            .field("reference_type", &self.is_reference_type())
            .finish()
    }
}
