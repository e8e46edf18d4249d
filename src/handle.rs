//! Opaque integer handles naming native objects from the managed side.
//!
//! Native objects live in a [`HandleRegistry`], an arena addressed by index and generation.
//! The managed side stores only the packed `u64` in a [`HandleSlot`]; a stale or cleared
//! value fails lookup with [`BridgeError::InvalidHandle`] instead of dereferencing freed memory.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};

const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 24;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

/// Packed handle value: `tag:8 | generation:24 | index:32`. Zero is the null sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// The null handle stored after disposal.
    pub const NULL: Handle = Handle(0);

    fn pack(tag: u8, generation: u32, index: u32) -> Self {
        let raw = ((tag as u64) << (INDEX_BITS + GENERATION_BITS))
            | (((generation as u64) & GENERATION_MASK) << INDEX_BITS)
            | index as u64;
        Handle(raw)
    }

    /// Reinterpret a raw value received from the managed side.
    pub const fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Raw value handed to the managed side.
    pub const fn into_raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    fn tag(self) -> u8 {
        (self.0 >> (INDEX_BITS + GENERATION_BITS)) as u8
    }

    fn generation(self) -> u32 {
        ((self.0 >> INDEX_BITS) & GENERATION_MASK) as u32
    }

    fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Handle(null)");
        }
        write!(
            f,
            "Handle(tag={}, gen={}, idx={})",
            self.tag(),
            self.generation(),
            self.index()
        )
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Generation-checked table of native objects of one kind.
///
/// Lookups hand out an `Arc`, so a dispose racing an in-flight call only drops the table's
/// reference; the object itself is freed when the last caller returns.
pub struct HandleRegistry<T> {
    tag: u8,
    name: &'static str,
    arena: RwLock<Arena<T>>,
}

impl<T> HandleRegistry<T> {
    /// Create an empty registry. `tag` must differ between registries so handles
    /// cannot be confused across object kinds.
    pub fn new(tag: u8, name: &'static str) -> Self {
        Self {
            tag,
            name,
            arena: RwLock::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Take ownership of `value` and return its handle.
    pub fn insert(&self, value: T) -> Handle {
        self.insert_arc(Arc::new(value))
    }

    /// Register an already shared object.
    pub fn insert_arc(&self, value: Arc<T>) -> Handle {
        let mut arena = self.arena.write();
        arena.live += 1;
        let handle = if let Some(index) = arena.free.pop() {
            let slot = &mut arena.slots[index as usize];
            slot.value = Some(value);
            Handle::pack(self.tag, slot.generation, index)
        } else {
            let index = arena.slots.len() as u32;
            arena.slots.push(Slot {
                generation: 1,
                value: Some(value),
            });
            Handle::pack(self.tag, 1, index)
        };
        trace!(registry = self.name, ?handle, "handle created");
        handle
    }

    /// Resolve a handle to its live object.
    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        if handle.is_null() || handle.tag() != self.tag {
            return Err(BridgeError::InvalidHandle(handle.into_raw()));
        }
        let arena = self.arena.read();
        arena
            .slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.clone())
            .ok_or(BridgeError::InvalidHandle(handle.into_raw()))
    }

    /// Whether `handle` still names a live object.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_ok()
    }

    /// Remove the object named by `handle`, returning the table's reference.
    pub fn remove(&self, handle: Handle) -> Result<Arc<T>> {
        if handle.is_null() || handle.tag() != self.tag {
            return Err(BridgeError::InvalidHandle(handle.into_raw()));
        }
        let mut arena = self.arena.write();
        let index = handle.index();
        let value = match arena.slots.get_mut(index) {
            Some(slot) if slot.generation == handle.generation() && slot.value.is_some() => {
                let value = slot.value.take();
                slot.generation = next_generation(slot.generation);
                value
            }
            _ => None,
        };
        let value = value.ok_or(BridgeError::InvalidHandle(handle.into_raw()))?;
        arena.free.push(index as u32);
        arena.live -= 1;
        debug!(registry = self.name, ?handle, "handle disposed");
        Ok(value)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.arena.read().live
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn next_generation(generation: u32) -> u32 {
    let next = (generation + 1) & GENERATION_MASK as u32;
    if next == 0 { 1 } else { next }
}

/// Handle field embedded in a managed-side object.
#[derive(Debug, Default)]
pub struct HandleSlot(AtomicU64);

impl HandleSlot {
    /// An empty slot.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Store `handle`, replacing any previous value.
    pub fn store(&self, handle: Handle) {
        self.0.store(handle.into_raw(), Ordering::Release);
    }

    /// Current value, `None` once cleared.
    pub fn load(&self) -> Option<Handle> {
        let handle = Handle::from_raw(self.0.load(Ordering::Acquire));
        (!handle.is_null()).then_some(handle)
    }

    /// Reset to null and return the previous value. Only the first caller observes `Some`.
    pub fn take(&self) -> Option<Handle> {
        let handle = Handle::from_raw(self.0.swap(0, Ordering::AcqRel));
        (!handle.is_null()).then_some(handle)
    }
}

/// A managed-side object carrying a native handle.
pub trait NativeOwner {
    /// The slot holding the handle.
    fn handle_slot(&self) -> &HandleSlot;
}

/// Record `handle` on `owner`.
pub fn store_handle<O: NativeOwner + ?Sized>(owner: &O, handle: Handle) {
    owner.handle_slot().store(handle);
}

/// Read the handle stored on `owner`.
pub fn load_handle<O: NativeOwner + ?Sized>(owner: &O) -> Option<Handle> {
    owner.handle_slot().load()
}

/// Reset the handle stored on `owner` to null.
pub fn clear_handle<O: NativeOwner + ?Sized>(owner: &O) -> Option<Handle> {
    owner.handle_slot().take()
}

/// Resolve the object behind `owner`, failing with `InvalidHandle` after disposal.
pub fn resolve<O, T>(owner: &O, registry: &HandleRegistry<T>) -> Result<Arc<T>>
where
    O: NativeOwner + ?Sized,
{
    let handle = load_handle(owner).ok_or(BridgeError::InvalidHandle(0))?;
    registry.get(handle)
}

/// Clear `owner`'s handle and remove its object. A second dispose is a no-op.
pub fn dispose<O, T>(owner: &O, registry: &HandleRegistry<T>) -> Option<Arc<T>>
where
    O: NativeOwner + ?Sized,
{
    let handle = clear_handle(owner)?;
    registry.remove(handle).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Owner(HandleSlot);

    impl NativeOwner for Owner {
        fn handle_slot(&self) -> &HandleSlot {
            &self.0
        }
    }

    #[test]
    fn cleared_handle_loads_as_null_and_fails_lookup() {
        let registry = HandleRegistry::new(1, "test");
        let owner = Owner(HandleSlot::new());
        store_handle(&owner, registry.insert(41u32));

        assert_eq!(*resolve(&owner, &registry).expect("live"), 41);
        assert!(dispose(&owner, &registry).is_some());
        assert_eq!(load_handle(&owner), None);
        assert!(matches!(
            resolve(&owner, &registry),
            Err(BridgeError::InvalidHandle(0))
        ));
        assert!(dispose(&owner, &registry).is_none(), "double dispose is a no-op");
        assert!(registry.is_empty());
    }

    #[test]
    fn reused_slot_rejects_stale_generation() {
        let registry = HandleRegistry::new(2, "test");
        let first = registry.insert("a");
        registry.remove(first).expect("remove");
        let second = registry.insert("b");

        assert_eq!(first.index(), second.index(), "slot should be recycled");
        assert_ne!(first, second);
        assert!(matches!(registry.get(first), Err(BridgeError::InvalidHandle(_))));
        assert_eq!(*registry.get(second).expect("live"), "b");
    }

    #[test]
    fn handles_from_other_registries_are_rejected() {
        let clocks = HandleRegistry::new(3, "clocks");
        let sources = HandleRegistry::<u8>::new(4, "sources");
        let handle = clocks.insert(7u8);
        assert!(sources.get(handle).is_err());
        assert!(sources.remove(handle).is_err());
        assert!(clocks.contains(handle));
    }

    #[test]
    fn dispose_during_call_keeps_object_alive() {
        let registry = HandleRegistry::new(5, "test");
        let handle = registry.insert(vec![1u8, 2, 3]);
        let in_flight = registry.get(handle).expect("live");
        registry.remove(handle).expect("remove");
        assert_eq!(in_flight.len(), 3);
        assert!(registry.get(handle).is_err());
    }
}
